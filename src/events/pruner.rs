// src/events/pruner.rs

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::events::EventLog;

/// Background task applying event retention on a fixed cadence
pub struct EventPruner {
    /// Log being pruned
    log: Arc<EventLog>,

    /// Days of events to keep
    retention_days: u32,

    /// Time between passes
    interval: Duration,
}

impl EventPruner {
    pub fn new(log: Arc<EventLog>, retention_days: u32, interval: Duration) -> Self {
        Self {
            log,
            retention_days,
            interval,
        }
    }

    /// Runs one pass immediately, then one per interval until `token` fires
    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(token).await })
    }

    async fn run(self, token: CancellationToken) {
        info!(
            "Event pruner started (retention {} days, every {:?})",
            self.retention_days, self.interval
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Event pruner stopping");
                    return;
                }
                _ = ticker.tick() => {
                    let log = self.log.clone();
                    let keep = self.retention_days;
                    match tokio::task::spawn_blocking(move || log.prune(keep)).await {
                        Ok(Ok(removed)) => debug!("Prune pass removed {} day directories", removed),
                        Ok(Err(e)) => error!("Event prune failed: {}", e),
                        Err(e) => error!("Event prune task panicked: {}", e),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{format_rfc3339, Event};
    use chrono::Utc;
    use tempfile::tempdir;

    #[tokio::test]
    async fn prunes_on_start_and_stops_on_cancel() {
        let dir = tempdir().unwrap();
        let log = Arc::new(EventLog::new(
            dir.path().join("events"),
            dir.path().join("alerts"),
            "node-1",
        ));
        let mut old = Event::new("account.create", "admin");
        old.timestamp = format_rfc3339(Utc::now() - chrono::Duration::days(200));
        let old = log.write(old).unwrap();

        let token = CancellationToken::new();
        let handle = EventPruner::new(log.clone(), 90, Duration::from_secs(3600)).spawn(token.clone());

        let path = log.event_path(&old).unwrap();
        for _ in 0..100 {
            if !path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!path.exists());

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
