use std::time::{Duration, Instant};

use async_trait::async_trait;
use health::HealthHandle;
use tracing::{debug, error, info};

use callmatch_common::ringqueue::{now_epoch_seconds, DatabaseError, RingQueue};

/// Periodic maintenance run by the reader between read cycles. Implementations decide
/// themselves whether a call is due and must return quickly when it is not.
#[async_trait]
pub trait Cleaner {
    async fn cleanup(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepResult {
    pub deleted: u64,
    pub unmatched: i64,
}

/// Deletes matched ring events once they are older than the retention horizon.
pub struct RetentionSweeper {
    queue: RingQueue,
    /// Seconds a matched ring event is kept for.
    retention_horizon: i64,
    interval: Duration,
    last_run: Option<Instant>,
    liveness: HealthHandle,
}

impl RetentionSweeper {
    pub fn new(
        queue: RingQueue,
        retention_horizon: i64,
        interval: Duration,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            queue,
            retention_horizon,
            interval,
            last_run: None,
            liveness,
        }
    }

    /// The first sweep is due immediately, later ones once `interval` has passed.
    pub fn is_due(&self, now: Instant) -> bool {
        match self.last_run {
            Some(last_run) => now.saturating_duration_since(last_run) >= self.interval,
            None => true,
        }
    }

    pub async fn run_once(&self, now: i64) -> Result<SweepResult, DatabaseError> {
        let deleted = self.queue.sweep(now, self.retention_horizon).await?;
        let unmatched = self.queue.unmatched_depth().await?;

        metrics::counter!("callmatch_swept_total").increment(deleted);
        metrics::gauge!("callmatch_unmatched_depth").set(unmatched as f64);

        Ok(SweepResult { deleted, unmatched })
    }
}

#[async_trait]
impl Cleaner for RetentionSweeper {
    async fn cleanup(&mut self) {
        let now = Instant::now();
        if !self.is_due(now) {
            return;
        }
        // A failed sweep waits for the next interval like a successful one.
        self.last_run = Some(now);

        match self.run_once(now_epoch_seconds()).await {
            Ok(result) => {
                if result.deleted > 0 {
                    info!("deleted {} matched ring events", result.deleted);
                } else {
                    debug!("no matched ring events to delete");
                }
                self.liveness.report_healthy();
            }
            Err(error) => error!("retention sweep failed: {}", error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use health::HealthRegistry;
    use sqlx::PgPool;

    const HORIZON: i64 = 86_400;

    fn sweeper(db: PgPool, interval: Duration) -> (RetentionSweeper, HealthRegistry) {
        let registry = HealthRegistry::new("liveness");
        let liveness = registry.register("sweeper".to_string(), Duration::from_secs(30));
        let queue = RingQueue::new_from_pool(db, 10);

        (
            RetentionSweeper::new(queue, HORIZON, interval, liveness),
            registry,
        )
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_run_once_deletes_only_old_matched_rows(db: PgPool) {
        let now = now_epoch_seconds();
        let queue = RingQueue::new_from_pool(db.clone(), 10);
        let (sweeper, _registry) = sweeper(db, Duration::from_secs(600));

        queue
            .submit_raw_event_at("030111", "200893", now - 2 * HORIZON)
            .await;
        queue
            .submit_raw_event_at("040222", "200893", now - 2 * HORIZON + 1)
            .await;
        queue.submit_raw_event_at("050333", "200893", now).await;
        assert_eq!(
            queue.find_match(now - 2 * HORIZON, 300).await.unwrap(),
            Some("030111".to_owned())
        );

        let result = sweeper.run_once(now).await.unwrap();
        assert_eq!(
            result,
            SweepResult {
                deleted: 1,
                unmatched: 2
            }
        );
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_cleanup_respects_interval(db: PgPool) {
        let queue = RingQueue::new_from_pool(db.clone(), 10);
        let (mut sweeper, registry) = sweeper(db, Duration::from_secs(600));

        assert!(sweeper.is_due(Instant::now()));
        sweeper.cleanup().await;
        assert!(registry.get_status().healthy);
        assert!(!sweeper.is_due(Instant::now()));

        // Not due: an old matched row survives a second call.
        let old = now_epoch_seconds() - 2 * HORIZON;
        queue.submit_raw_event_at("030111", "200893", old).await;
        queue.find_match(old, 300).await.unwrap();
        sweeper.cleanup().await;

        assert!(sweeper.is_due(Instant::now() + Duration::from_secs(600)));
        assert_eq!(sweeper.run_once(now_epoch_seconds()).await.unwrap().deleted, 1);
    }
}
