//! Transaction Core Types
//!
//! Records persisted in `trans_global` / `trans_branch_op`, plus the column
//! selectors used by conditional updates and upserts.

use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::error::TransError;
use super::state::{BranchStatus, GlobalStatus};

/// Default `next_cron_interval` for a freshly created transaction (seconds)
pub const DEFAULT_CRON_INTERVAL_SECS: i64 = 10;

/// Default window a `prepared` transaction may wait for submission (seconds)
pub const DEFAULT_TIMEOUT_TO_FAIL_SECS: i64 = 35;

/// Current time at the precision PostgreSQL keeps (microseconds)
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// `at + secs`, `None` outside the representable range
pub fn checked_add_secs(at: DateTime<Utc>, secs: i64) -> Option<DateTime<Utc>> {
    Duration::try_seconds(secs).and_then(|d| at.checked_add_signed(d))
}

/// `now + interval_secs`
pub fn next_time(interval_secs: i64) -> Result<DateTime<Utc>, TransError> {
    checked_add_secs(now(), interval_secs).ok_or_else(|| {
        TransError::InvalidRequest(format!("interval of {}s is out of range", interval_secs))
    })
}

/// Generate a new globally unique gid
///
/// ULIDs sort by creation time, so `list_recent` and gid order agree
/// for coordinator-issued ids.
pub fn new_gid() -> String {
    ulid::Ulid::new().to_string()
}

/// Transaction pattern, decides how branch failures are handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransType {
    Saga,
    Tcc,
    Msg,
    Xa,
}

impl TransType {
    /// Whether a failed forward branch moves the transaction to ABORTING
    /// (compensation) rather than straight to FAILED.
    #[inline]
    pub fn compensates_on_failure(&self) -> bool {
        matches!(self, TransType::Saga)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransType::Saga => "saga",
            TransType::Tcc => "tcc",
            TransType::Msg => "msg",
            TransType::Xa => "xa",
        }
    }
}

impl fmt::Display for TransType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TransType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "saga" => Ok(TransType::Saga),
            "tcc" => Ok(TransType::Tcc),
            "msg" => Ok(TransType::Msg),
            "xa" => Ok(TransType::Xa),
            other => Err(format!("unknown trans type: {}", other)),
        }
    }
}

/// Branch operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BranchOp {
    /// TCC try - executed by the client, only registered here
    Try,
    Confirm,
    Cancel,
    /// Saga / msg forward step
    Action,
    Compensate,
}

impl BranchOp {
    /// Driven while the global is SUBMITTED
    #[inline]
    pub fn is_forward(&self) -> bool {
        matches!(self, BranchOp::Action | BranchOp::Confirm)
    }

    /// Driven while the global is ABORTING
    #[inline]
    pub fn is_rollback(&self) -> bool {
        matches!(self, BranchOp::Compensate | BranchOp::Cancel)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BranchOp::Try => "try",
            BranchOp::Confirm => "confirm",
            BranchOp::Cancel => "cancel",
            BranchOp::Action => "action",
            BranchOp::Compensate => "compensate",
        }
    }
}

impl fmt::Display for BranchOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for BranchOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "try" => Ok(BranchOp::Try),
            "confirm" => Ok(BranchOp::Confirm),
            "cancel" => Ok(BranchOp::Cancel),
            "action" => Ok(BranchOp::Action),
            "compensate" => Ok(BranchOp::Compensate),
            other => Err(format!("unknown branch op: {}", other)),
        }
    }
}

/// Global transaction record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransGlobal {
    /// Surrogate id, assigned by the store in creation order (0 until stored)
    pub id: i64,
    pub gid: String,
    pub trans_type: TransType,
    pub status: GlobalStatus,
    /// Lease token of the last scheduler that claimed this record
    pub owner: String,
    pub next_cron_time: DateTime<Utc>,
    /// Seconds
    pub next_cron_interval: i64,
    /// Seconds a PREPARED transaction may wait before being aborted
    pub timeout_to_fail: i64,
    pub custom_data: serde_json::Value,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
    pub finish_time: Option<DateTime<Utc>>,
    pub rollback_time: Option<DateTime<Utc>>,
    pub rollback_reason: Option<String>,
}

impl TransGlobal {
    /// Create a new record, due for the scheduler immediately
    pub fn new(gid: impl Into<String>, trans_type: TransType, status: GlobalStatus) -> Self {
        let now = now();
        Self {
            id: 0,
            gid: gid.into(),
            trans_type,
            status,
            owner: String::new(),
            next_cron_time: now,
            next_cron_interval: DEFAULT_CRON_INTERVAL_SECS,
            timeout_to_fail: DEFAULT_TIMEOUT_TO_FAIL_SECS,
            custom_data: serde_json::Value::Null,
            create_time: now,
            update_time: now,
            finish_time: None,
            rollback_time: None,
            rollback_reason: None,
        }
    }

    pub fn with_timeout_to_fail(mut self, secs: i64) -> Self {
        self.timeout_to_fail = secs;
        self
    }

    pub fn with_custom_data(mut self, data: serde_json::Value) -> Self {
        self.custom_data = data;
        self
    }

    pub fn with_next_cron_time(mut self, at: DateTime<Utc>) -> Self {
        self.next_cron_time = at;
        self
    }

    /// `create_time + timeout_to_fail`; `None` if that overflows
    pub fn prepare_deadline(&self) -> Option<DateTime<Utc>> {
        checked_add_secs(self.create_time, self.timeout_to_fail)
    }

    /// A PREPARED transaction that outlived `timeout_to_fail`.
    ///
    /// An unrepresentable deadline never expires.
    pub fn is_prepare_expired(&self, at: DateTime<Utc>) -> bool {
        self.status == GlobalStatus::Prepared
            && self.prepare_deadline().is_some_and(|deadline| at >= deadline)
    }
}

impl fmt::Display for TransGlobal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Trans[{}] type={} status={} next_cron={} interval={}s",
            self.gid, self.trans_type, self.status, self.next_cron_time, self.next_cron_interval
        )
    }
}

/// Branch record, unique by `(gid, branch_id, op)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransBranch {
    /// Surrogate id, insertion order (0 until stored)
    pub id: i64,
    pub gid: String,
    pub branch_id: String,
    pub op: BranchOp,
    /// Target handed to the branch invoker
    pub url: String,
    pub bin_data: Vec<u8>,
    pub status: BranchStatus,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
    pub finish_time: Option<DateTime<Utc>>,
    pub rollback_time: Option<DateTime<Utc>>,
}

impl TransBranch {
    pub fn new(
        gid: impl Into<String>,
        branch_id: impl Into<String>,
        op: BranchOp,
        url: impl Into<String>,
    ) -> Self {
        let now = now();
        Self {
            id: 0,
            gid: gid.into(),
            branch_id: branch_id.into(),
            op,
            url: url.into(),
            bin_data: Vec::new(),
            status: BranchStatus::Prepared,
            create_time: now,
            update_time: now,
            finish_time: None,
            rollback_time: None,
        }
    }

    pub fn with_bin_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.bin_data = data.into();
        self
    }

    /// Unique key
    pub fn key(&self) -> (&str, &str, BranchOp) {
        (&self.gid, &self.branch_id, self.op)
    }

    /// Record the outcome of one invocation
    pub fn mark(&mut self, status: BranchStatus) {
        let now = now();
        self.status = status;
        self.update_time = now;
        if self.op.is_rollback() {
            self.rollback_time = Some(now);
        } else {
            self.finish_time = Some(now);
        }
    }
}

/// Global columns that may be persisted alongside a status CAS.
///
/// `status` and `update_time` are always written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GlobalColumn {
    FinishTime,
    RollbackTime,
    RollbackReason,
    NextCronTime,
    NextCronInterval,
}

impl GlobalColumn {
    pub fn as_str(&self) -> &'static str {
        match self {
            GlobalColumn::FinishTime => "finish_time",
            GlobalColumn::RollbackTime => "rollback_time",
            GlobalColumn::RollbackReason => "rollback_reason",
            GlobalColumn::NextCronTime => "next_cron_time",
            GlobalColumn::NextCronInterval => "next_cron_interval",
        }
    }
}

/// Branch columns overwritten on upsert conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BranchColumn {
    Status,
    FinishTime,
    RollbackTime,
    UpdateTime,
    Url,
    BinData,
}

impl BranchColumn {
    /// Columns describing branch progress
    pub const PROGRESS: [BranchColumn; 4] = [
        BranchColumn::Status,
        BranchColumn::FinishTime,
        BranchColumn::RollbackTime,
        BranchColumn::UpdateTime,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BranchColumn::Status => "status",
            BranchColumn::FinishTime => "finish_time",
            BranchColumn::RollbackTime => "rollback_time",
            BranchColumn::UpdateTime => "update_time",
            BranchColumn::Url => "url",
            BranchColumn::BinData => "bin_data",
        }
    }
}

/// Result of `lock_and_save_branches`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// Status matched, branches written
    Saved,
    /// Status changed concurrently, nothing written
    Aborted,
}

/// Operation result reported by the branch invoker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpResult {
    /// Branch completed successfully
    Success,
    /// Branch failed explicitly (safe to compensate / fail)
    Failed(String),
    /// Outcome unknown (timeout, network error) - must retry
    Pending,
}

impl OpResult {
    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self, OpResult::Success)
    }

    #[inline]
    pub fn is_explicit_fail(&self) -> bool {
        matches!(self, OpResult::Failed(_))
    }

    #[inline]
    pub fn is_pending(&self) -> bool {
        matches!(self, OpResult::Pending)
    }
}
