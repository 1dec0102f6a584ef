//! Transaction Store
//!
//! The persistence seam of the coordinator. Every mutating method is one
//! all-or-nothing atomic unit in the underlying substrate; cross-worker
//! coordination happens only through the conditional writes and row locks
//! these methods perform.
//!
//! Two substrates are provided:
//! - [`PgStore`] - PostgreSQL via `sqlx`
//! - [`MemStore`] - in-process, serializable through a single mutex

pub mod memory;
pub mod schema;
pub mod sql;

pub use memory::MemStore;
pub use schema::{SCHEMA_SQL, init_schema};
pub use sql::PgStore;

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

use super::error::TransError;
use super::state::GlobalStatus;
use super::types::{BranchColumn, BranchOp, GlobalColumn, LockOutcome, TransBranch, TransGlobal};

/// Maximum page size for `list_recent`
pub const MAX_LIST_LIMIT: usize = 100;

/// Smallest lease push; a zero push would let the next lease return the
/// same record immediately
pub const MIN_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Produces lease owner tokens
pub trait TokenGenerator: Send + Sync {
    fn next_token(&self) -> String;
}

/// UUIDv4 tokens
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidTokens;

impl TokenGenerator for UuidTokens {
    fn next_token(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

/// Global transaction store + branch store
#[async_trait]
pub trait TransStore: Send + Sync {
    /// Point lookup by gid
    async fn get_by_gid(&self, gid: &str) -> Result<TransGlobal, TransError>;

    /// Records with `id < before_id` (all when `None`), newest first.
    /// `limit` is capped at [`MAX_LIST_LIMIT`].
    async fn list_recent(
        &self,
        before_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<TransGlobal>, TransError>;

    /// Insert the global row and its initial branches as one unit.
    ///
    /// An existing gid makes the whole call a no-op reported as
    /// `DuplicateSubmission`.
    async fn create_if_absent(
        &self,
        global: &TransGlobal,
        branches: &[TransBranch],
    ) -> Result<(), TransError>;

    /// CAS `expected → new`, guarded by `status = expected AND gid = ?`.
    ///
    /// Writes `status`, `update_time` and the selected `fields` taken from
    /// `global`. On success `global` carries the new status; on `NotFound`
    /// neither the stored row nor `global` changes.
    async fn transition_status(
        &self,
        global: &mut TransGlobal,
        expected: GlobalStatus,
        new: GlobalStatus,
        fields: &[GlobalColumn],
    ) -> Result<(), TransError>;

    /// Unconditionally push `next_cron_time` to `now + interval`
    async fn schedule_next_attempt(
        &self,
        global: &mut TransGlobal,
        interval: Duration,
    ) -> Result<(), TransError>;

    /// Claim one non-terminal record with `next_cron_time < now + expire_window`.
    ///
    /// In one conditional write limited to one row: assign a fresh owner
    /// token and push `next_cron_time` by the retry interval. The row is
    /// re-read by owner. `NotFound` means nothing is due.
    ///
    /// This is a lease, not a lock: once `next_cron_time` lapses again
    /// another worker may claim the same record.
    async fn lease_due_transaction(&self, expire_window: Duration)
    -> Result<TransGlobal, TransError>;

    /// Lock the global row, re-check its status, then upsert `branches`
    /// overwriting their progress columns.
    async fn lock_and_save_branches(
        &self,
        gid: &str,
        expected: GlobalStatus,
        branches: &[TransBranch],
    ) -> Result<LockOutcome, TransError>;

    /// Insert branches; on `(gid, branch_id, op)` conflict overwrite only
    /// `columns` (nothing when empty).
    async fn upsert_branches(
        &self,
        branches: &[TransBranch],
        columns: &[BranchColumn],
    ) -> Result<(), TransError>;

    /// Branches of one transaction in insertion order
    async fn list_by_gid(&self, gid: &str) -> Result<Vec<TransBranch>, TransError>;
}

/// Clamp a requested page size to `1..=MAX_LIST_LIMIT`
pub(crate) fn clamp_limit(limit: usize) -> usize {
    limit.clamp(1, MAX_LIST_LIMIT)
}

/// Duration → whole seconds as stored in `next_cron_interval`
pub(crate) fn interval_secs(interval: Duration) -> i64 {
    i64::try_from(interval.as_secs()).unwrap_or(i64::MAX)
}

/// `at + d`, rejecting durations the timestamp cannot represent
pub(crate) fn checked_after(
    at: chrono::DateTime<chrono::Utc>,
    d: Duration,
) -> Result<chrono::DateTime<chrono::Utc>, TransError> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .ok_or_else(|| TransError::InvalidRequest(format!("duration {:?} is out of range", d)))
}

/// Collapse a batch to one row per `(gid, branch_id, op)`, last one wins.
///
/// PostgreSQL refuses to touch the same row twice in one
/// `ON CONFLICT DO UPDATE` statement.
pub(crate) fn dedup_last(branches: &[TransBranch]) -> Vec<TransBranch> {
    let mut out: Vec<TransBranch> = Vec::with_capacity(branches.len());
    let mut seen: HashMap<(&str, &str, BranchOp), usize> = HashMap::new();
    for b in branches {
        match seen.get(&b.key()) {
            Some(&idx) => out[idx] = b.clone(),
            None => {
                seen.insert(b.key(), out.len());
                out.push(b.clone());
            }
        }
    }
    out
}
