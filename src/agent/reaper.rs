//! Idle session reaper
//!
//! Periodically removes exited session records and kills sessions that have
//! been idle past the configured threshold.

use crate::agent::registry::{now_ms, SessionRegistry};
use crate::agent::types::SessionState;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Outcome of one reaper pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Exited records dropped
    pub removed: Vec<String>,
    /// Idle sessions killed
    pub killed: Vec<String>,
}

pub struct IdleReaper {
    registry: Arc<SessionRegistry>,
    interval: Duration,
    idle_timeout: Duration,
}

impl IdleReaper {
    pub fn new(registry: Arc<SessionRegistry>, interval: Duration, idle_timeout: Duration) -> Self {
        Self {
            registry,
            interval,
            idle_timeout,
        }
    }

    /// Run passes forever on a fixed interval
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            // Skip the first immediate tick
            ticker.tick().await;

            loop {
                ticker.tick().await;
                self.sweep().await;
            }
        })
    }

    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(now_ms()).await
    }

    /// One pass, judging idleness against `now` (ms since epoch)
    pub async fn sweep_at(&self, now: i64) -> SweepReport {
        let idle_ms = i64::try_from(self.idle_timeout.as_millis()).unwrap_or(i64::MAX);
        let mut report = SweepReport::default();

        for info in self.registry.list().await {
            if info.state == SessionState::Exited {
                if self.registry.remove(&info.session_id).await.is_some() {
                    report.removed.push(info.session_id);
                }
            } else if now - info.last_activity > idle_ms {
                tracing::info!(
                    session_id = %info.session_id,
                    idle_secs = (now - info.last_activity) / 1000,
                    "Reaping idle session"
                );
                report.killed.push(info.session_id);
            }
        }

        // kill is idempotent, so a session already terminating is safe here
        futures::future::join_all(report.killed.iter().map(|id| self.registry.kill(id))).await;

        if !report.removed.is_empty() || !report.killed.is_empty() {
            tracing::info!(
                removed = report.removed.len(),
                killed = report.killed.len(),
                "Reaper pass complete"
            );
        }
        report
    }
}
