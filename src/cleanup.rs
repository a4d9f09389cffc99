//! Background eviction of idle quota state and stale history.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::engine::KeyStateStore;
use crate::request::now_ms;
use crate::rules::RuleRegistry;
use crate::stats::StatsCollector;

/// What one sweep removed.
#[derive(Debug, Clone, Copy, Default)]
pub struct SweepReport {
    pub states_evicted: usize,
    pub history_trimmed: usize,
}

/// Periodic task that evicts expired per-key state and trims stats history.
///
/// Runs on a fixed interval (5 minutes by default) and stops gracefully
/// through a shutdown channel rather than an uncancellable timer. `sweep` is
/// public so tests can drive it with an explicit clock.
pub struct CleanupScheduler {
    interval: Duration,
    retention_ms: u64,
    registry: Arc<RuleRegistry>,
    store: Arc<KeyStateStore>,
    stats: Arc<StatsCollector>,
}

impl CleanupScheduler {
    pub fn new(
        config: &EngineConfig,
        registry: Arc<RuleRegistry>,
        store: Arc<KeyStateStore>,
        stats: Arc<StatsCollector>,
    ) -> Self {
        Self {
            interval: Duration::from_millis(config.cleanup_interval_ms),
            retention_ms: config.retention_ms,
            registry,
            store,
            stats,
        }
    }

    /// Run one sweep at the given clock reading.
    ///
    /// State idle beyond retention, state with no live data, and state
    /// orphaned by rule removal are evicted; history entries older than the
    /// retention window are dropped. Eviction takes the same per-key locks
    /// as in-flight decisions, so it never races a check.
    pub fn sweep(&self, now_ms: u64) -> SweepReport {
        let registry = &self.registry;
        let states_evicted = self.store.evict_idle(now_ms, self.retention_ms, |rule_id| {
            registry.get_rule(rule_id).map(|rule| rule.window_ms)
        });
        let history_trimmed = self
            .stats
            .trim_history(now_ms.saturating_sub(self.retention_ms));

        SweepReport {
            states_evicted,
            history_trimmed,
        }
    }

    /// Start the background task. The returned handle stops it gracefully.
    pub fn spawn(self) -> CleanupHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        info!(
            interval_ms = self.interval.as_millis() as u64,
            retention_ms = self.retention_ms,
            "Starting cleanup scheduler"
        );

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick of a tokio interval completes immediately;
            // consume it so the first sweep waits one full interval.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = self.sweep(now_ms());
                        if report.states_evicted > 0 || report.history_trimmed > 0 {
                            debug!(
                                states_evicted = report.states_evicted,
                                history_trimmed = report.history_trimmed,
                                "Cleanup sweep finished"
                            );
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        info!("Cleanup scheduler stopping");
                        break;
                    }
                }
            }
        });

        CleanupHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}

/// Handle to a running cleanup task.
pub struct CleanupHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl CleanupHandle {
    /// Signal the task to stop and wait for it to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}
