//! Transaction Coordinator
//!
//! Upward interface of the engine: submission, branch registration,
//! explicit commit/abort, and read access. It never invokes branches;
//! driving transactions is left to the recovery scheduler.

use std::sync::Arc;
use tracing::{debug, info};

use super::error::TransError;
use super::state::GlobalStatus;
use super::store::TransStore;
use super::types::{GlobalColumn, LockOutcome, TransBranch, TransGlobal, checked_add_secs, now};

/// Result of a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Created,
    /// A transaction with the same gid already existed; nothing was written
    Duplicate,
}

/// Decision of the application driving a prepared transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Commit,
    Abort,
}

impl Outcome {
    fn target(&self) -> GlobalStatus {
        match self {
            Outcome::Commit => GlobalStatus::Submitted,
            Outcome::Abort => GlobalStatus::Aborting,
        }
    }

    /// Statuses a transaction reaches only after this decision took effect
    fn is_downstream(&self, status: GlobalStatus) -> bool {
        match self {
            Outcome::Commit => matches!(status, GlobalStatus::Succeed | GlobalStatus::Failed),
            Outcome::Abort => status == GlobalStatus::Aborted,
        }
    }
}

pub struct Coordinator {
    store: Arc<dyn TransStore>,
}

impl Coordinator {
    pub fn new(store: Arc<dyn TransStore>) -> Self {
        Self { store }
    }

    /// Generate a fresh gid
    pub fn new_gid(&self) -> String {
        super::types::new_gid()
    }

    /// Create a global transaction and its branches in one atomic unit.
    ///
    /// A prepared transaction becomes due when its submit window closes, a
    /// submitted one is due immediately.
    pub async fn submit(
        &self,
        mut global: TransGlobal,
        branches: Vec<TransBranch>,
    ) -> Result<Submission, TransError> {
        validate_gid(&global.gid)?;
        validate_branches(&global.gid, &branches)?;
        if global.timeout_to_fail < 0 {
            return Err(TransError::InvalidRequest(format!(
                "timeout_to_fail must not be negative, got {}",
                global.timeout_to_fail
            )));
        }

        let created = now();
        global.create_time = created;
        global.update_time = created;
        global.next_cron_time = match global.status {
            GlobalStatus::Prepared => checked_add_secs(created, global.timeout_to_fail)
                .ok_or_else(|| {
                    TransError::InvalidRequest(format!(
                        "timeout_to_fail of {}s is out of range",
                        global.timeout_to_fail
                    ))
                })?,
            GlobalStatus::Submitted => created,
            other => {
                return Err(TransError::InvalidRequest(format!(
                    "cannot submit a transaction in status {}",
                    other
                )));
            }
        };

        match self.store.create_if_absent(&global, &branches).await {
            Ok(()) => {
                info!(
                    gid = %global.gid,
                    trans_type = %global.trans_type,
                    status = %global.status,
                    branches = branches.len(),
                    "Transaction submitted"
                );
                Ok(Submission::Created)
            }
            Err(TransError::DuplicateSubmission) => {
                debug!(gid = %global.gid, "Duplicate submission ignored");
                Ok(Submission::Duplicate)
            }
            Err(e) => Err(e),
        }
    }

    /// Register branches on a prepared transaction (TCC try phase, XA).
    ///
    /// Registration is rejected once the transaction left PREPARED.
    pub async fn register_branches(
        &self,
        gid: &str,
        branches: Vec<TransBranch>,
    ) -> Result<(), TransError> {
        validate_gid(gid)?;
        validate_branches(gid, &branches)?;

        match self
            .store
            .lock_and_save_branches(gid, GlobalStatus::Prepared, &branches)
            .await?
        {
            LockOutcome::Saved => {
                debug!(gid = %gid, branches = branches.len(), "Branches registered");
                Ok(())
            }
            LockOutcome::Aborted => Err(TransError::InvalidRequest(format!(
                "transaction {} is no longer prepared",
                gid
            ))),
        }
    }

    /// Commit or abort a transaction.
    ///
    /// Repeating a decision that already took effect is a no-op returning
    /// the current status, also once the scheduler finished the
    /// transaction. A conflicting decision is `InvalidTransition`. The
    /// record is made due now so the scheduler acts on it promptly.
    pub async fn transition(&self, gid: &str, outcome: Outcome) -> Result<GlobalStatus, TransError> {
        let target = outcome.target();

        // Each lost CAS means the status moved along an acyclic graph
        loop {
            let mut global = self.store.get_by_gid(gid).await?;
            if global.status == target || outcome.is_downstream(global.status) {
                return Ok(global.status);
            }
            if !global.status.can_transition_to(target) {
                return Err(TransError::InvalidTransition {
                    from: global.status,
                    to: target,
                });
            }

            let mut fields = vec![GlobalColumn::NextCronTime];
            global.next_cron_time = now();
            if outcome == Outcome::Abort {
                global.rollback_reason = Some(format!("aborted from {}", global.status));
                fields.push(GlobalColumn::RollbackReason);
            }

            let from = global.status;
            match self
                .store
                .transition_status(&mut global, from, target, &fields)
                .await
            {
                Ok(()) => {
                    info!(gid = %gid, from = %from, to = %target, "Transaction transitioned");
                    return Ok(target);
                }
                Err(TransError::NotFound) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Global record with all its branches
    pub async fn query(&self, gid: &str) -> Result<(TransGlobal, Vec<TransBranch>), TransError> {
        let global = self.store.get_by_gid(gid).await?;
        let branches = self.store.list_by_gid(gid).await?;
        Ok((global, branches))
    }

    /// Newest first; pass the last `id` of a page as `cursor` for the next
    pub async fn list(
        &self,
        cursor: Option<i64>,
        limit: usize,
    ) -> Result<Vec<TransGlobal>, TransError> {
        self.store.list_recent(cursor, limit).await
    }
}

fn validate_gid(gid: &str) -> Result<(), TransError> {
    if gid.trim().is_empty() {
        return Err(TransError::InvalidRequest("gid must not be empty".to_string()));
    }
    Ok(())
}

fn validate_branches(gid: &str, branches: &[TransBranch]) -> Result<(), TransError> {
    if let Some(b) = branches.iter().find(|b| b.gid != gid) {
        return Err(TransError::InvalidRequest(format!(
            "branch {} belongs to {}, not {}",
            b.branch_id, b.gid, gid
        )));
    }
    if let Some(b) = branches.iter().find(|b| b.branch_id.is_empty()) {
        return Err(TransError::InvalidRequest(format!(
            "branch with op {} has an empty branch_id",
            b.op
        )));
    }
    Ok(())
}
