//! Transaction Processor
//!
//! Drives one leased global transaction as far as it can go in a single
//! pass. Every action here may be repeated by another worker once the lease
//! lapses, so each step is written to be safely re-runnable:
//!
//! ```text
//! PREPARED   --timeout_to_fail-->  ABORTING
//! SUBMITTED  --forward branches (insertion order)--> SUCCEED
//!            --explicit failure--> ABORTING (saga) | FAILED (tcc/msg/xa)
//! ABORTING   --rollback branches (reverse order)--> ABORTED
//! ```
//!
//! # Safety Rules
//!
//! 1. **Persist-Per-Branch**: each branch outcome is saved under the global
//!    row lock before the next branch is invoked
//! 2. **Explicit Fail Rule**: only `OpResult::Failed` changes direction;
//!    `Pending` always means "retry later"
//! 3. **Compensation Never Gives Up**: rollback failures are retried, never
//!    turned into a terminal state

use std::sync::Arc;
use tracing::{debug, info, warn};

use super::error::TransError;
use super::invoker::BranchInvoker;
use super::state::{BranchStatus, GlobalStatus};
use super::store::TransStore;
use super::types::{GlobalColumn, LockOutcome, OpResult, TransBranch, TransGlobal, now};

/// Reason recorded when a PREPARED transaction is never submitted
pub const PREPARE_TIMEOUT_REASON: &str = "timeout waiting for submit";

/// Outcome of one processing pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Reached a terminal status
    Finished,
    /// Moved forward (branch or status), still non-terminal
    Advanced,
    /// Nothing could be done this pass
    Stalled,
}

impl Progress {
    #[inline]
    pub fn made_progress(&self) -> bool {
        !matches!(self, Progress::Stalled)
    }
}

pub struct Processor {
    store: Arc<dyn TransStore>,
    invoker: Arc<dyn BranchInvoker>,
}

impl Processor {
    pub fn new(store: Arc<dyn TransStore>, invoker: Arc<dyn BranchInvoker>) -> Self {
        Self { store, invoker }
    }

    /// Drive `global` until it is terminal or blocked.
    ///
    /// On return `global` mirrors the stored status. Losing a race to
    /// another actor is not an error: the record is reloaded and the pass
    /// continues from the status that actor left.
    pub async fn process(&self, global: &mut TransGlobal) -> Result<Progress, TransError> {
        let mut progress = Progress::Stalled;

        loop {
            let before = global.status;
            let step = match global.status {
                GlobalStatus::Prepared => self.step_prepared(global).await?,
                GlobalStatus::Submitted => self.step_submitted(global).await?,
                GlobalStatus::Aborting => self.step_aborting(global).await?,
                GlobalStatus::Succeed | GlobalStatus::Failed | GlobalStatus::Aborted => {
                    return Ok(Progress::Finished);
                }
            };

            if step.made_progress() {
                progress = Progress::Advanced;
            }
            if global.status.is_terminal() {
                return Ok(Progress::Finished);
            }
            // The status graph is acyclic, so this loop is bounded
            if global.status == before {
                return Ok(progress);
            }
        }
    }

    /// PREPARED: abort once the submit window has passed
    async fn step_prepared(&self, global: &mut TransGlobal) -> Result<Progress, TransError> {
        if !global.is_prepare_expired(now()) {
            debug!(gid = %global.gid, "Prepared transaction still within submit window");
            return Ok(Progress::Stalled);
        }

        global.rollback_reason = Some(PREPARE_TIMEOUT_REASON.to_string());
        self.cas(
            global,
            GlobalStatus::Prepared,
            GlobalStatus::Aborting,
            &[GlobalColumn::RollbackReason],
        )
        .await
    }

    /// SUBMITTED: run forward branches in insertion order
    async fn step_submitted(&self, global: &mut TransGlobal) -> Result<Progress, TransError> {
        let mut branches = self.store.list_by_gid(&global.gid).await?;
        let mut progress = Progress::Stalled;

        for branch in branches.iter_mut().filter(|b| b.op.is_forward()) {
            match branch.status {
                BranchStatus::Succeed => continue,
                // Outcome saved by an earlier pass that died before the CAS
                BranchStatus::Failed => {
                    let reason = format!("branch {} {} failed", branch.branch_id, branch.op);
                    return self.fail_forward(global, reason).await;
                }
                BranchStatus::Prepared => {}
            }

            match self.invoker.invoke(global, branch).await {
                OpResult::Success => {
                    branch.mark(BranchStatus::Succeed);
                    if !self.save(global, branch).await? {
                        return Ok(progress);
                    }
                    progress = Progress::Advanced;
                }
                OpResult::Failed(e) => {
                    warn!(
                        gid = %global.gid,
                        branch_id = %branch.branch_id,
                        op = %branch.op,
                        error = %e,
                        "Forward branch failed"
                    );
                    branch.mark(BranchStatus::Failed);
                    if !self.save(global, branch).await? {
                        return Ok(progress);
                    }
                    return self.fail_forward(global, e).await;
                }
                OpResult::Pending => {
                    debug!(
                        gid = %global.gid,
                        branch_id = %branch.branch_id,
                        op = %branch.op,
                        "Forward branch pending, will retry"
                    );
                    return Ok(progress);
                }
            }
        }

        global.finish_time = Some(now());
        self.cas(
            global,
            GlobalStatus::Submitted,
            GlobalStatus::Succeed,
            &[GlobalColumn::FinishTime],
        )
        .await
    }

    /// ABORTING: run rollback branches in reverse insertion order
    async fn step_aborting(&self, global: &mut TransGlobal) -> Result<Progress, TransError> {
        let mut branches = self.store.list_by_gid(&global.gid).await?;
        let mut progress = Progress::Stalled;

        for branch in branches.iter_mut().rev().filter(|b| b.op.is_rollback()) {
            if branch.status == BranchStatus::Succeed {
                continue;
            }

            match self.invoker.invoke(global, branch).await {
                OpResult::Success => {
                    branch.mark(BranchStatus::Succeed);
                    if !self.save(global, branch).await? {
                        return Ok(progress);
                    }
                    progress = Progress::Advanced;
                }
                OpResult::Failed(e) => {
                    warn!(
                        gid = %global.gid,
                        branch_id = %branch.branch_id,
                        op = %branch.op,
                        error = %e,
                        "Rollback branch failed (will retry)"
                    );
                    return Ok(progress);
                }
                OpResult::Pending => return Ok(progress),
            }
        }

        global.rollback_time = Some(now());
        self.cas(
            global,
            GlobalStatus::Aborting,
            GlobalStatus::Aborted,
            &[GlobalColumn::RollbackTime],
        )
        .await
    }

    /// A forward branch failed explicitly
    async fn fail_forward(
        &self,
        global: &mut TransGlobal,
        reason: String,
    ) -> Result<Progress, TransError> {
        global.rollback_reason = Some(reason);
        if global.trans_type.compensates_on_failure() {
            self.cas(
                global,
                GlobalStatus::Submitted,
                GlobalStatus::Aborting,
                &[GlobalColumn::RollbackReason],
            )
            .await
        } else {
            global.finish_time = Some(now());
            self.cas(
                global,
                GlobalStatus::Submitted,
                GlobalStatus::Failed,
                &[GlobalColumn::FinishTime, GlobalColumn::RollbackReason],
            )
            .await
        }
    }

    /// Status CAS; a lost race reloads `global` and reports no progress
    async fn cas(
        &self,
        global: &mut TransGlobal,
        expected: GlobalStatus,
        new: GlobalStatus,
        fields: &[GlobalColumn],
    ) -> Result<Progress, TransError> {
        match self
            .store
            .transition_status(global, expected, new, fields)
            .await
        {
            Ok(()) => {
                info!(
                    gid = %global.gid,
                    from = %expected,
                    to = %new,
                    "Transaction status advanced"
                );
                Ok(if new.is_terminal() {
                    Progress::Finished
                } else {
                    Progress::Advanced
                })
            }
            Err(TransError::NotFound) => {
                self.reload(global).await?;
                Ok(Progress::Stalled)
            }
            Err(e) => Err(e),
        }
    }

    /// Save one branch outcome under the global row lock.
    ///
    /// Returns false (after reloading `global`) when the status moved.
    async fn save(
        &self,
        global: &mut TransGlobal,
        branch: &TransBranch,
    ) -> Result<bool, TransError> {
        let outcome = self
            .store
            .lock_and_save_branches(&global.gid, global.status, std::slice::from_ref(branch))
            .await?;

        match outcome {
            LockOutcome::Saved => Ok(true),
            LockOutcome::Aborted => {
                self.reload(global).await?;
                Ok(false)
            }
        }
    }

    async fn reload(&self, global: &mut TransGlobal) -> Result<(), TransError> {
        let stale = global.status;
        *global = self.store.get_by_gid(&global.gid).await?;
        debug!(
            gid = %global.gid,
            stale = %stale,
            current = %global.status,
            "Lost race, reloaded transaction"
        );
        Ok(())
    }
}
