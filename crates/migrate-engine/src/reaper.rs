//! The immigration reaper: a once-per-second sweep that garbage-collects
//! stale immigrations (spec.md §4.3).

use std::sync::Arc;

use tracing::debug;

use crate::immigration::{Immigration, ImmigrationCtx};

/// Runs forever, sweeping the immigration registry at `ctx.config.reaper_interval`.
///
/// For each immigration: leave it alone if the cluster key still
/// matches and it hasn't finished; remove it if the cluster key has
/// moved on, or if it finished (`done_received > 0`) and the grace
/// period since its `DONE` has elapsed.
pub async fn run(ctx: Arc<ImmigrationCtx>) {
    let mut interval = tokio::time::interval(ctx.config.reaper_interval);
    loop {
        interval.tick().await;
        sweep(&ctx);
    }
}

fn sweep(ctx: &ImmigrationCtx) {
    let current_key = ctx.partition_manager.cluster_key();
    for immigration in ctx.immigrations.snapshot() {
        if should_reap(&immigration, current_key, ctx) {
            reap(&immigration, ctx);
        }
    }
}

fn should_reap(
    immigration: &Immigration,
    current_key: migrate_types::ClusterKey,
    ctx: &ImmigrationCtx,
) -> bool {
    if immigration.cluster_key != current_key {
        return true;
    }
    if immigration.done_received() > 0 {
        if let Some(done_at) = immigration.done_timestamp() {
            return done_at.elapsed() >= ctx.config.rx_lifetime();
        }
    }
    false
}

fn reap(immigration: &Immigration, ctx: &ImmigrationCtx) {
    ctx.immigrations.remove(&immigration.source, immigration.emig_id);
    if let Some(version) = immigration.incoming_version {
        ctx.version_index.remove(version, immigration.partition);
    }
    if let Some(reservation) = immigration.take_reservation() {
        ctx.partition_manager.release(reservation);
    }

    // An immigration that never reached DONE was still counted as
    // active; one that did already had the gauge decremented at the
    // moment of its first DONE (see `immigration::handle_done`).
    if immigration.done_received() == 0 {
        ctx.counters.immigration_finished();
    }

    debug!(
        emig_id = immigration.emig_id.0,
        source = %immigration.source,
        done_received = immigration.done_received(),
        "reaped immigration"
    );
}

// `should_reap`/`reap` are exercised end-to-end in `engine`'s integration
// tests (`immigration_is_reaped_after_grace_period_post_done`,
// `cluster_key_stale_immigration_is_reaped`), which build a real
// `ImmigrationCtx` from fake `Fabric`/`PartitionManager`/`Storage`
// implementations.
