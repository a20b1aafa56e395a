//! Heartbeat and idle-session sweep.
//!
//! One engine-wide task walks the registry on two fixed intervals. It never
//! touches session state: evictions are posted to each session's mailbox.

use crate::config::EngineConfig;
use crate::error::CloseReason;
use crate::registry::ConnectionRegistry;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub fn spawn(
    registry: Arc<ConnectionRegistry>,
    config: Arc<EngineConfig>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut heartbeat = time::interval(config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep = time::interval(config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Both intervals tick immediately; skip that first tick.
        heartbeat.tick().await;
        sweep.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = heartbeat.tick() => beat(&registry, &config),
                _ = sweep.tick() => sweep_idle(&registry, &config),
            }
        }
        info!("Reaper stopped");
    })
}

fn beat(registry: &ConnectionRegistry, config: &EngineConfig) {
    for handle in registry.handles() {
        if handle.liveness.outstanding_pings() > config.max_missed_pongs {
            info!(session_id = %handle.id, "Heartbeat missed, evicting session");
            if !handle.evict(CloseReason::HeartbeatTimeout) {
                registry.deregister(handle.id);
            }
            continue;
        }
        handle.ping();
    }
}

fn sweep_idle(registry: &ConnectionRegistry, config: &EngineConfig) {
    let mut evicted = 0;
    for handle in registry.handles() {
        if handle.is_closed() && !handle.evict(CloseReason::Normal) {
            registry.deregister(handle.id);
            continue;
        }
        if handle.liveness.idle_for() >= config.idle_timeout {
            info!(session_id = %handle.id, idle = ?handle.liveness.idle_for(), "Evicting idle session");
            if !handle.evict(CloseReason::IdleTimeout) {
                registry.deregister(handle.id);
            }
            evicted += 1;
        }
    }
    debug!(active = registry.len(), evicted, "Idle sweep finished");
}
