//! The outbox service: at-most-one-commit side effects with replay
//! protection.
//!
//! Every external side effect flows through [`OutboxService::execute`],
//! keyed by an idempotency key. A committed entry short-circuits with its
//! cached result; anything less than committed is (re)claimed with
//! optimistic state transitions and executed at most once per attempt.

use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use windlass_db::models::{OutboxEntry, OutboxState};
use windlass_db::queries::outbox as db;
pub use windlass_db::queries::outbox::NewOutboxEntry;

/// Default age past which a `processing` entry is considered stuck.
pub const DEFAULT_STUCK_THRESHOLD: Duration = Duration::from_secs(5 * 60);

/// Errors surfaced by the outbox service.
#[derive(Debug, Error)]
pub enum OutboxError {
    /// The keyed side effect already exhausted its attempts.
    #[error("outbox entry {key} is dead-lettered")]
    DeadLettered { key: String },

    /// Another executor currently holds the entry and it is not yet stale.
    #[error("outbox entry {key} is already processing")]
    InFlight { key: String },

    /// The side-effect closure failed; the entry was marked failed (or
    /// dead-lettered when attempts ran out).
    #[error("side effect failed: {source}")]
    Execution {
        source: anyhow::Error,
        dead_letter: bool,
    },

    #[error("outbox entry {0} not found")]
    NotFound(Uuid),

    #[error("outbox storage error: {0}")]
    Storage(anyhow::Error),
}

impl OutboxError {
    fn storage(err: anyhow::Error) -> Self {
        Self::Storage(err)
    }
}

/// Derive the default idempotency key for a task invocation:
/// `hex(sha256(workflow_id \0 task_id \0 canonical_json(inputs)))`.
///
/// `inputs` must serialize deterministically; the spec's `BTreeMap` inputs
/// do.
pub fn derive_idempotency_key(
    workflow_id: &str,
    task_id: &str,
    inputs: &serde_json::Value,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(workflow_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(task_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(inputs.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Options for a reconciliation pass.
#[derive(Debug, Clone, Default)]
pub struct ReconcileOptions {
    /// Only consider entries created within this age. `None` scans all.
    pub max_age: Option<Duration>,
    /// Revive `failed` entries with remaining attempts back to `pending`.
    pub auto_retry: bool,
}

/// What reconciliation did to one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// A stale `processing` entry was reset to `pending`.
    ResetStuck,
    /// A `failed` entry with attempts left was reset to `pending`.
    RetryScheduled,
    /// The entry was inspected and left alone.
    LeftAlone,
}

/// Per-entry reconciliation report.
#[derive(Debug, Clone)]
pub struct ReconcileAction {
    pub entry_id: Uuid,
    pub idempotency_key: String,
    pub outcome: ReconcileOutcome,
}

/// The outbox service over the `outbox` table.
#[derive(Clone)]
pub struct OutboxService {
    pool: SqlitePool,
    stuck_threshold: Duration,
}

impl OutboxService {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            stuck_threshold: DEFAULT_STUCK_THRESHOLD,
        }
    }

    pub fn with_stuck_threshold(mut self, threshold: Duration) -> Self {
        self.stuck_threshold = threshold;
        self
    }

    /// Record an intent. Idempotent on `(workflow_id, idempotency_key)`:
    /// storing the same intent twice returns the original entry unchanged.
    pub async fn store(&self, new: &NewOutboxEntry<'_>) -> Result<OutboxEntry, OutboxError> {
        db::store_entry(&self.pool, new)
            .await
            .map_err(OutboxError::storage)
    }

    /// Look up an entry by `(workflow_id, idempotency_key)`.
    pub async fn get_by_key(
        &self,
        workflow_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<OutboxEntry>, OutboxError> {
        db::get_by_key(&self.pool, workflow_id, idempotency_key)
            .await
            .map_err(OutboxError::storage)
    }

    /// Execute a side effect exactly-once per key.
    ///
    /// - A committed entry returns its cached result; `op` is not invoked.
    /// - A processing entry newer than the stuck threshold is refused; an
    ///   older one is treated as abandoned and reclaimed.
    /// - A failed entry with attempts left is revived; dead letters are
    ///   terminal.
    ///
    /// On success the entry commits with the result; on failure it moves to
    /// `failed`, or `dead_letter` once attempts are exhausted.
    pub async fn execute<F, Fut>(
        &self,
        new: &NewOutboxEntry<'_>,
        op: F,
    ) -> Result<serde_json::Value, OutboxError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<serde_json::Value>>,
    {
        let entry = self.store(new).await?;
        let key = entry.idempotency_key.clone();

        let claim_from = match entry.state {
            OutboxState::Committed => {
                debug!(
                    workflow_id = %entry.workflow_id,
                    task_id = %entry.task_id,
                    key = %key,
                    "outbox replay: returning cached result"
                );
                return Ok(entry.result.unwrap_or(serde_json::Value::Null));
            }
            OutboxState::DeadLetter => return Err(OutboxError::DeadLettered { key }),
            OutboxState::Processing => {
                let age = Utc::now().signed_duration_since(entry.updated_at);
                if age.to_std().unwrap_or_default() < self.stuck_threshold {
                    return Err(OutboxError::InFlight { key });
                }
                warn!(key = %key, "outbox entry stuck in processing, reclaiming");
                let rows = db::reset_to_pending(&self.pool, entry.id, OutboxState::Processing)
                    .await
                    .map_err(OutboxError::storage)?;
                if rows == 0 {
                    return Err(OutboxError::InFlight { key });
                }
                OutboxState::Pending
            }
            OutboxState::Failed => {
                if entry.attempts >= entry.max_attempts {
                    // Failed with exhausted attempts is dead-lettered at
                    // failure time; seeing it here means a legacy row.
                    return Err(OutboxError::DeadLettered { key });
                }
                let rows = db::reset_to_pending(&self.pool, entry.id, OutboxState::Failed)
                    .await
                    .map_err(OutboxError::storage)?;
                if rows == 0 {
                    return Err(OutboxError::InFlight { key });
                }
                OutboxState::Pending
            }
            OutboxState::Pending => OutboxState::Pending,
        };

        // Claim the entry. A lost race means someone else holds it now.
        let rows = db::mark_processing(&self.pool, entry.id, claim_from)
            .await
            .map_err(OutboxError::storage)?;
        if rows == 0 {
            let current = db::get_by_id(&self.pool, entry.id)
                .await
                .map_err(OutboxError::storage)?
                .ok_or(OutboxError::NotFound(entry.id))?;
            if current.state == OutboxState::Committed {
                return Ok(current.result.unwrap_or(serde_json::Value::Null));
            }
            return Err(OutboxError::InFlight { key });
        }

        let claimed = db::get_by_id(&self.pool, entry.id)
            .await
            .map_err(OutboxError::storage)?
            .ok_or(OutboxError::NotFound(entry.id))?;

        match op().await {
            Ok(result) => {
                self.commit(entry.id, &result).await?;
                Ok(result)
            }
            Err(source) => {
                let dead_letter = claimed.attempts >= claimed.max_attempts;
                self.mark_failed(entry.id, &source.to_string(), dead_letter)
                    .await?;
                Err(OutboxError::Execution {
                    source,
                    dead_letter,
                })
            }
        }
    }

    /// Commit a processing entry with its result.
    pub async fn commit(&self, id: Uuid, result: &serde_json::Value) -> Result<(), OutboxError> {
        let rows = db::mark_committed(&self.pool, id, result)
            .await
            .map_err(OutboxError::storage)?;
        if rows == 0 {
            return Err(OutboxError::Storage(anyhow::anyhow!(
                "outbox entry {id} was not in processing state at commit"
            )));
        }
        Ok(())
    }

    /// Fail a processing entry; `dead_letter` marks it terminal.
    pub async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        dead_letter: bool,
    ) -> Result<(), OutboxError> {
        let to = if dead_letter {
            OutboxState::DeadLetter
        } else {
            OutboxState::Failed
        };
        let rows = db::mark_failed(&self.pool, id, error, to)
            .await
            .map_err(OutboxError::storage)?;
        if rows == 0 {
            return Err(OutboxError::Storage(anyhow::anyhow!(
                "outbox entry {id} was not in processing state at failure"
            )));
        }
        Ok(())
    }

    /// Sweep non-terminal entries and revive the ones that deserve another
    /// chance. Returns a per-entry action report.
    pub async fn reconcile(
        &self,
        opts: &ReconcileOptions,
    ) -> Result<Vec<ReconcileAction>, OutboxError> {
        let entries = db::list_non_terminal(&self.pool)
            .await
            .map_err(OutboxError::storage)?;
        let now = Utc::now();
        let mut report = Vec::with_capacity(entries.len());

        for entry in entries {
            if let Some(max_age) = opts.max_age {
                let age = now
                    .signed_duration_since(entry.created_at)
                    .to_std()
                    .unwrap_or_default();
                if age > max_age {
                    continue;
                }
            }

            let outcome = match entry.state {
                OutboxState::Processing => {
                    let age = now
                        .signed_duration_since(entry.updated_at)
                        .to_std()
                        .unwrap_or_default();
                    if age >= self.stuck_threshold {
                        db::reset_to_pending(&self.pool, entry.id, OutboxState::Processing)
                            .await
                            .map_err(OutboxError::storage)?;
                        ReconcileOutcome::ResetStuck
                    } else {
                        ReconcileOutcome::LeftAlone
                    }
                }
                OutboxState::Failed
                    if opts.auto_retry && entry.attempts < entry.max_attempts =>
                {
                    db::reset_to_pending(&self.pool, entry.id, OutboxState::Failed)
                        .await
                        .map_err(OutboxError::storage)?;
                    ReconcileOutcome::RetryScheduled
                }
                _ => ReconcileOutcome::LeftAlone,
            };

            report.push(ReconcileAction {
                entry_id: entry.id,
                idempotency_key: entry.idempotency_key,
                outcome,
            });
        }

        Ok(report)
    }

    /// Remove committed entries older than `age`. Failed and dead-letter
    /// entries are never auto-cleaned. Returns the number removed.
    pub async fn cleanup(&self, age: Duration) -> Result<u64, OutboxError> {
        let now = Utc::now();
        let committed = db::list_committed(&self.pool)
            .await
            .map_err(OutboxError::storage)?;

        let stale: Vec<Uuid> = committed
            .into_iter()
            .filter(|entry| {
                entry
                    .committed_at
                    .map(|at| {
                        now.signed_duration_since(at).to_std().unwrap_or_default() > age
                    })
                    .unwrap_or(false)
            })
            .map(|entry| entry.id)
            .collect();

        db::delete_entries(&self.pool, &stale)
            .await
            .context("failed to delete stale committed entries")
            .map_err(OutboxError::storage)
    }
}
