//! # RingQueue
//!
//! A FIFO queue of ring events implemented on top of a PostgreSQL table.
//!
//! Ring events are written by the call monitor reader and consumed by the correlator, which
//! attaches the true origin number of a call to a webhook that arrives later. Consumption is
//! strictly in `sequence_id` order: timestamps only bound which rows are still eligible.
use chrono::Utc;
use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;
use tracing::{debug, error, info};

/// Lock key shared by every writer of `ring_events`, see `RingQueue::submit_raw_event_at`.
const WRITER_LOCK_KEY: &str = "ring_events_writer";

/// Enumeration of database-related errors in RingQueue.
/// Errors that can originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("pool creation failed with: {error}")]
    PoolCreationError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("transaction {command} failed with: {error}")]
    TransactionError { command: String, error: sqlx::Error },
    #[error("migrations failed with: {error}")]
    MigrationError { error: sqlx::migrate::MigrateError },
}

impl DatabaseError {
    fn query(command: &str, error: sqlx::Error) -> Self {
        DatabaseError::QueryError {
            command: command.to_owned(),
            error,
        }
    }

    fn transaction(command: &str, error: sqlx::Error) -> Self {
        DatabaseError::TransactionError {
            command: command.to_owned(),
            error,
        }
    }
}

/// A row of the `ring_events` table.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct RawEvent {
    /// Assigned by PostgreSQL on insert. Defines the FIFO order.
    pub sequence_id: i64,
    /// Seconds since epoch at which the event was accepted.
    pub observed_at: i64,
    /// The true calling party.
    pub origin_number: String,
    /// The dialed number.
    pub target_number: String,
    /// Flipped to true exactly once, by `RingQueue::find_match`.
    pub matched: bool,
}

/// Result of submitting a ring event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// A new row was committed.
    Inserted { sequence_id: i64 },
    /// A row for the same origin number exists within the duplicate window.
    DuplicateIgnored,
    /// The storage layer failed and the transaction was rolled back.
    Failed,
}

impl SubmitOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmitOutcome::Inserted { .. } => "inserted",
            SubmitOutcome::DuplicateIgnored => "duplicate_ignored",
            SubmitOutcome::Failed => "failed",
        }
    }
}

/// Current time as seconds since epoch, the clock every `_at` variant defaults to.
pub fn now_epoch_seconds() -> i64 {
    Utc::now().timestamp()
}

/// A queue of ring events backed by the `ring_events` table in PostgreSQL.
#[derive(Clone)]
pub struct RingQueue {
    pool: PgPool,
    /// Seconds during which repeated events for one origin number collapse into one row.
    duplicate_window: i64,
}

pub type RingQueueResult<T> = std::result::Result<T, DatabaseError>;

impl RingQueue {
    /// Initialize a new RingQueue connected to the database at `url`.
    pub async fn new(
        url: &str,
        max_connections: u32,
        duplicate_window: i64,
    ) -> RingQueueResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|error| DatabaseError::PoolCreationError { error })?;

        Ok(Self::new_from_pool(pool, duplicate_window))
    }

    /// Initialize a new RingQueue from an existing pool.
    pub fn new_from_pool(pool: PgPool, duplicate_window: i64) -> Self {
        Self {
            pool,
            duplicate_window,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create or upgrade the `ring_events` table.
    pub async fn run_migrations(&self) -> RingQueueResult<()> {
        sqlx::migrate!("../migrations")
            .run(&self.pool)
            .await
            .map_err(|error| DatabaseError::MigrationError { error })
    }

    /// Submit a ring event observed now.
    pub async fn submit_raw_event(&self, origin_number: &str, target_number: &str) -> SubmitOutcome {
        self.submit_raw_event_at(origin_number, target_number, now_epoch_seconds())
            .await
    }

    /// Submit a ring event observed at `now`, unless a row for the same origin number was
    /// observed within the duplicate window. Storage failures are logged and reported as
    /// `SubmitOutcome::Failed`.
    pub async fn submit_raw_event_at(
        &self,
        origin_number: &str,
        target_number: &str,
        now: i64,
    ) -> SubmitOutcome {
        let outcome = match self
            .insert_unless_duplicate(origin_number, target_number, now)
            .await
        {
            Ok(outcome) => outcome,
            Err(error) => {
                error!("failed to store ring event from {}: {}", origin_number, error);
                SubmitOutcome::Failed
            }
        };

        match outcome {
            SubmitOutcome::Inserted { sequence_id } => {
                info!(
                    sequence_id,
                    "stored ring event: {} -> {}", origin_number, target_number
                );
                metrics::counter!("callmatch_events_inserted_total").increment(1);
            }
            SubmitOutcome::DuplicateIgnored => {
                debug!("ignored duplicate ring event from {}", origin_number);
                metrics::counter!("callmatch_events_duplicate_total").increment(1);
            }
            SubmitOutcome::Failed => {
                metrics::counter!("callmatch_events_failed_total").increment(1);
            }
        }

        outcome
    }

    /// Probe for a duplicate and insert in one transaction.
    ///
    /// Every writer takes the same transaction-scoped advisory lock before probing, so no two
    /// writers can both pass the probe, and `sequence_id`s are handed out in commit order.
    async fn insert_unless_duplicate(
        &self,
        origin_number: &str,
        target_number: &str,
        now: i64,
    ) -> RingQueueResult<SubmitOutcome> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| DatabaseError::transaction("BEGIN", error))?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(WRITER_LOCK_KEY)
            .execute(&mut *tx)
            .await
            .map_err(|error| DatabaseError::query("LOCK", error))?;

        let duplicate: Option<i64> = sqlx::query_scalar(
            r#"
SELECT
    sequence_id
FROM
    ring_events
WHERE
    origin_number = $1
    AND observed_at >= $2
LIMIT 1
            "#,
        )
        .bind(origin_number)
        .bind(now.saturating_sub(self.duplicate_window))
        .fetch_optional(&mut *tx)
        .await
        .map_err(|error| DatabaseError::query("SELECT", error))?;

        if duplicate.is_some() {
            tx.rollback()
                .await
                .map_err(|error| DatabaseError::transaction("ROLLBACK", error))?;

            return Ok(SubmitOutcome::DuplicateIgnored);
        }

        let sequence_id: i64 = sqlx::query_scalar(
            r#"
INSERT INTO ring_events
    (observed_at, origin_number, target_number, matched)
VALUES
    ($1, $2, $3, FALSE)
RETURNING
    sequence_id
            "#,
        )
        .bind(now)
        .bind(origin_number)
        .bind(target_number)
        .fetch_one(&mut *tx)
        .await
        .map_err(|error| DatabaseError::query("INSERT", error))?;

        tx.commit()
            .await
            .map_err(|error| DatabaseError::transaction("COMMIT", error))?;

        Ok(SubmitOutcome::Inserted { sequence_id })
    }

    /// Claim the oldest unmatched ring event observed at or after `arrival_time - window_seconds`
    /// and return its origin number.
    ///
    /// Proximity of `observed_at` to `arrival_time` plays no part in the selection: the smallest
    /// eligible `sequence_id` always wins. Rows locked by a concurrent claim are skipped, so a
    /// row is never handed out twice.
    pub async fn find_match(
        &self,
        arrival_time: i64,
        window_seconds: i64,
    ) -> RingQueueResult<Option<String>> {
        let min_time = arrival_time.saturating_sub(window_seconds);

        let claimed: Option<(i64, String)> = sqlx::query_as(
            r#"
WITH oldest_unmatched AS (
    SELECT
        sequence_id
    FROM
        ring_events
    WHERE
        matched = FALSE
        AND observed_at >= $1
    ORDER BY
        sequence_id
    LIMIT 1
    FOR UPDATE SKIP LOCKED
)
UPDATE
    ring_events
SET
    matched = TRUE
FROM
    oldest_unmatched
WHERE
    ring_events.sequence_id = oldest_unmatched.sequence_id
RETURNING
    ring_events.sequence_id,
    ring_events.origin_number
            "#,
        )
        .bind(min_time)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| DatabaseError::query("UPDATE", error))?;

        match claimed {
            Some((sequence_id, origin_number)) => {
                info!(sequence_id, "matched origin number {}", origin_number);
                metrics::counter!("callmatch_matches_total", "result" => "matched").increment(1);

                Ok(Some(origin_number))
            }
            None => {
                debug!(arrival_time, window_seconds, "no unmatched ring event in window");
                metrics::counter!("callmatch_matches_total", "result" => "unmatched").increment(1);

                Ok(None)
            }
        }
    }

    /// Delete matched ring events observed before `now - retention_horizon`.
    /// Unmatched rows are kept regardless of age.
    pub async fn sweep(&self, now: i64, retention_horizon: i64) -> RingQueueResult<u64> {
        let result = sqlx::query(
            r#"
DELETE FROM
    ring_events
WHERE
    matched = TRUE
    AND observed_at < $1
            "#,
        )
        .bind(now.saturating_sub(retention_horizon))
        .execute(&self.pool)
        .await
        .map_err(|error| DatabaseError::query("DELETE", error))?;

        Ok(result.rows_affected())
    }

    /// Count ring events still waiting for a match.
    pub async fn unmatched_depth(&self) -> RingQueueResult<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM ring_events WHERE matched = FALSE")
            .fetch_one(&self.pool)
            .await
            .map_err(|error| DatabaseError::query("COUNT", error))
    }
}
