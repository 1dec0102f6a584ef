//! In-memory Transaction Store
//!
//! One mutex guards the whole state, which makes every method a
//! serializable atomic unit. The lock is never held across an `.await`.
//! Each method validates before it mutates, so a failed call leaves the
//! state untouched.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

use super::{
    MIN_RETRY_INTERVAL, TokenGenerator, TransStore, UuidTokens, checked_after, clamp_limit,
    dedup_last, interval_secs,
};
use crate::trans::error::TransError;
use crate::trans::state::GlobalStatus;
use crate::trans::types::{
    BranchColumn, BranchOp, GlobalColumn, LockOutcome, TransBranch, TransGlobal, now, next_time,
};

type BranchKey = (String, String, BranchOp);

#[derive(Default)]
struct MemState {
    last_global_id: i64,
    last_branch_id: i64,
    globals: HashMap<String, TransGlobal>,
    branches: Vec<TransBranch>,
    branch_index: HashMap<BranchKey, usize>,
    branches_by_gid: HashMap<String, Vec<usize>>,
}

impl MemState {
    fn upsert_branch(&mut self, branch: &TransBranch, columns: &[BranchColumn]) {
        let key = (branch.gid.clone(), branch.branch_id.clone(), branch.op);
        if let Some(&idx) = self.branch_index.get(&key) {
            let existing = &mut self.branches[idx];
            for col in columns {
                match col {
                    BranchColumn::Status => existing.status = branch.status,
                    BranchColumn::FinishTime => existing.finish_time = branch.finish_time,
                    BranchColumn::RollbackTime => existing.rollback_time = branch.rollback_time,
                    BranchColumn::UpdateTime => existing.update_time = branch.update_time,
                    BranchColumn::Url => existing.url = branch.url.clone(),
                    BranchColumn::BinData => existing.bin_data = branch.bin_data.clone(),
                }
            }
            return;
        }

        self.last_branch_id += 1;
        let mut row = branch.clone();
        row.id = self.last_branch_id;
        let idx = self.branches.len();
        self.branches.push(row);
        self.branch_index.insert(key, idx);
        self.branches_by_gid
            .entry(branch.gid.clone())
            .or_default()
            .push(idx);
    }
}

/// Transaction store held in process memory
pub struct MemStore {
    state: Mutex<MemState>,
    retry_interval: Duration,
    tokens: Arc<dyn TokenGenerator>,
    unavailable: AtomicBool,
}

impl MemStore {
    /// `retry_interval` is how far a lease pushes `next_cron_time`, at
    /// least [`MIN_RETRY_INTERVAL`]
    pub fn new(retry_interval: Duration) -> Self {
        Self {
            state: Mutex::new(MemState::default()),
            retry_interval: retry_interval.max(MIN_RETRY_INTERVAL),
            tokens: Arc::new(UuidTokens),
            unavailable: AtomicBool::new(false),
        }
    }

    pub fn with_tokens(mut self, tokens: Arc<dyn TokenGenerator>) -> Self {
        self.tokens = tokens;
        self
    }

    /// Make every call fail with `StoreUnavailable` (outage simulation)
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemState>, TransError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(TransError::StoreUnavailable(
                "memory store marked unavailable".to_string(),
            ));
        }
        self.state
            .lock()
            .map_err(|e| TransError::StoreUnavailable(format!("memory store poisoned: {}", e)))
    }
}

#[async_trait]
impl TransStore for MemStore {
    async fn get_by_gid(&self, gid: &str) -> Result<TransGlobal, TransError> {
        let state = self.lock()?;
        state.globals.get(gid).cloned().ok_or(TransError::NotFound)
    }

    async fn list_recent(
        &self,
        before_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<TransGlobal>, TransError> {
        let state = self.lock()?;
        let before_id = before_id.unwrap_or(i64::MAX);

        let mut rows: Vec<TransGlobal> = state
            .globals
            .values()
            .filter(|g| g.id < before_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.id.cmp(&a.id));
        rows.truncate(clamp_limit(limit));
        Ok(rows)
    }

    async fn create_if_absent(
        &self,
        global: &TransGlobal,
        branches: &[TransBranch],
    ) -> Result<(), TransError> {
        let mut state = self.lock()?;
        if state.globals.contains_key(&global.gid) {
            debug!(gid = %global.gid, "Duplicate submission suppressed");
            return Err(TransError::DuplicateSubmission);
        }

        state.last_global_id += 1;
        let mut row = global.clone();
        row.id = state.last_global_id;
        state.globals.insert(row.gid.clone(), row);

        for branch in branches {
            state.upsert_branch(branch, &[]);
        }
        Ok(())
    }

    async fn transition_status(
        &self,
        global: &mut TransGlobal,
        expected: GlobalStatus,
        new: GlobalStatus,
        fields: &[GlobalColumn],
    ) -> Result<(), TransError> {
        if !expected.can_transition_to(new) {
            return Err(TransError::InvalidTransition {
                from: expected,
                to: new,
            });
        }

        let mut state = self.lock()?;
        let stored = match state.globals.get_mut(&global.gid) {
            Some(g) if g.status == expected => g,
            _ => return Err(TransError::NotFound),
        };

        let update_time = now();
        stored.status = new;
        stored.update_time = update_time;
        for field in fields {
            match field {
                GlobalColumn::FinishTime => stored.finish_time = global.finish_time,
                GlobalColumn::RollbackTime => stored.rollback_time = global.rollback_time,
                GlobalColumn::RollbackReason => {
                    stored.rollback_reason = global.rollback_reason.clone()
                }
                GlobalColumn::NextCronTime => stored.next_cron_time = global.next_cron_time,
                GlobalColumn::NextCronInterval => {
                    stored.next_cron_interval = global.next_cron_interval
                }
            }
        }

        global.status = new;
        global.update_time = update_time;
        Ok(())
    }

    async fn schedule_next_attempt(
        &self,
        global: &mut TransGlobal,
        interval: Duration,
    ) -> Result<(), TransError> {
        let secs = interval_secs(interval);
        let next_cron_time = next_time(secs)?;

        let mut state = self.lock()?;
        let stored = state
            .globals
            .get_mut(&global.gid)
            .ok_or(TransError::NotFound)?;

        stored.next_cron_time = next_cron_time;
        stored.next_cron_interval = secs;
        stored.update_time = now();

        global.next_cron_time = stored.next_cron_time;
        global.next_cron_interval = secs;
        global.update_time = stored.update_time;
        Ok(())
    }

    async fn lease_due_transaction(
        &self,
        expire_window: Duration,
    ) -> Result<TransGlobal, TransError> {
        let owner = self.tokens.next_token();

        let mut state = self.lock()?;
        let claimed_at = now();
        let due_before = checked_after(claimed_at, expire_window)?;
        let next_cron_time = checked_after(claimed_at, self.retry_interval)?;

        let stored = state
            .globals
            .values_mut()
            .filter(|g| !g.status.is_terminal() && g.next_cron_time < due_before)
            .min_by_key(|g| g.next_cron_time)
            .ok_or(TransError::NotFound)?;

        stored.owner = owner;
        stored.next_cron_time = next_cron_time;
        stored.update_time = claimed_at;

        debug!(gid = %stored.gid, owner = %stored.owner, status = %stored.status, "Leased transaction");
        Ok(stored.clone())
    }

    async fn lock_and_save_branches(
        &self,
        gid: &str,
        expected: GlobalStatus,
        branches: &[TransBranch],
    ) -> Result<LockOutcome, TransError> {
        let mut state = self.lock()?;
        let status = state
            .globals
            .get(gid)
            .map(|g| g.status)
            .ok_or(TransError::NotFound)?;

        if status != expected {
            debug!(
                gid = %gid,
                expected = %expected,
                actual = %status,
                "Status changed concurrently, branches not saved"
            );
            return Ok(LockOutcome::Aborted);
        }

        for branch in dedup_last(branches) {
            state.upsert_branch(&branch, &BranchColumn::PROGRESS);
        }
        Ok(LockOutcome::Saved)
    }

    async fn upsert_branches(
        &self,
        branches: &[TransBranch],
        columns: &[BranchColumn],
    ) -> Result<(), TransError> {
        let mut state = self.lock()?;
        if columns.is_empty() {
            for branch in branches {
                state.upsert_branch(branch, columns);
            }
        } else {
            for branch in dedup_last(branches) {
                state.upsert_branch(&branch, columns);
            }
        }
        Ok(())
    }

    async fn list_by_gid(&self, gid: &str) -> Result<Vec<TransBranch>, TransError> {
        let state = self.lock()?;
        Ok(state
            .branches_by_gid
            .get(gid)
            .map(|idxs| idxs.iter().map(|&i| state.branches[i].clone()).collect())
            .unwrap_or_default())
    }
}
