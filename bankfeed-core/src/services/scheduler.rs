//! Periodic runner for scheduled syncs and reauth reminders

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;

use crate::domain::result::{Error, Result};
use crate::services::sync::{ReminderSummary, SyncRunSummary, SyncService};

/// Drives [`SyncService`] on a fixed interval.
///
/// Each tick runs one scheduled sync followed by the reminder pass. Sync
/// work is blocking and runs on the blocking pool.
pub struct Scheduler {
    sync: Arc<SyncService>,
    every: Duration,
}

impl Scheduler {
    pub fn new(sync: Arc<SyncService>, every: Duration) -> Self {
        Self {
            sync,
            every: every.max(Duration::from_secs(1)),
        }
    }

    pub async fn tick(&self) -> Result<(SyncRunSummary, ReminderSummary)> {
        let sync = Arc::clone(&self.sync);
        tokio::task::spawn_blocking(move || {
            let summary = sync.run_scheduled()?;
            let reminders = sync.run_reminders()?;
            Ok((summary, reminders))
        })
        .await
        .map_err(|e| Error::database(format!("Scheduled run aborted: {}", e)))?
    }

    /// Tick until `shutdown` resolves. Returns the number of completed ticks.
    ///
    /// A failing tick is logged and does not stop the loop.
    pub async fn run_until<F>(&self, shutdown: F) -> usize
    where
        F: Future<Output = ()>,
    {
        let mut interval = tokio::time::interval(self.every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        let mut ticks = 0;
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!(ticks, "scheduler stopping");
                    return ticks;
                }
                _ = interval.tick() => {
                    match self.tick().await {
                        Ok((summary, reminders)) => tracing::info!(
                            synced = summary.synced,
                            failed = summary.failed,
                            reminded = reminders.reminded.len(),
                            "scheduled tick complete"
                        ),
                        Err(e) => tracing::warn!("scheduled tick failed: {}", e),
                    }
                    ticks += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::duckdb::DuckDbRepository;
    use crate::config::SyncSettings;
    use crate::services::registry::ProviderRegistry;

    fn scheduler(every: Duration) -> Scheduler {
        let repository = Arc::new(DuckDbRepository::in_memory().unwrap());
        let sync = SyncService::new(repository, ProviderRegistry::default(), SyncSettings::default());
        Scheduler::new(Arc::new(sync), every)
    }

    #[tokio::test]
    async fn test_tick_on_empty_store() {
        let (summary, reminders) = scheduler(Duration::from_secs(60)).tick().await.unwrap();
        assert!(summary.results.is_empty());
        assert_eq!(reminders.checked, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_until_shutdown() {
        let scheduler = scheduler(Duration::from_secs(60));
        // Ticks at 0s, 60s and 120s
        let ticks = scheduler
            .run_until(tokio::time::sleep(Duration::from_secs(150)))
            .await;
        assert_eq!(ticks, 3);
    }
}
