//! Partition migration engine: scheduler, emigration/immigration state
//! machines, reaper, and the registries that tie acknowledgments back to
//! the job that sent them.
//!
//! This crate owns no network, partition-ownership, or storage state of
//! its own -- it is driven entirely through the [`Fabric`], the
//! [`PartitionManager`], and the [`Storage`] traits, so it can be tested
//! against in-memory fakes and wired to the real subsystems in
//! production the same way.

pub mod config;
pub mod counters;
pub mod emigration;
pub mod engine;
pub mod error;
pub mod immigration;
pub mod inflight;
pub mod reaper;
pub mod registry;
pub mod scheduler;
pub mod traits;

pub use config::MigrationConfig;
pub use counters::{Counters, CountersSnapshot};
pub use engine::{MigrationEngine, RxPhaseFilter};
pub use error::MigrationError;
pub use scheduler::{EmigrationJob, EnqueuePriority, TxFlags};
pub use traits::{
    Fabric, PartitionManager, PartitionState, ReadThrottle, Reservation, RxAdmit, RxEvent,
    SendResult, Storage, TxOutcome,
};
