//! Global / Branch Status Definitions
//!
//! Status strings match the `status` columns of `trans_global` and
//! `trans_branch_op`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Global transaction status
///
/// Terminal: SUCCEED, FAILED, ABORTED
///
/// ```text
/// PREPARED → SUBMITTED → SUCCEED | FAILED
///     ↓          ↓
///     └──→ ABORTING → ABORTED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GlobalStatus {
    /// Registered, waiting for the client to submit (TCC try / msg prepare)
    Prepared,
    /// Committed by the client - forward branches must be driven
    Submitted,
    /// Terminal: all forward branches succeeded
    Succeed,
    /// Terminal: a forward branch failed and no compensation applies
    Failed,
    /// Compensation in progress
    Aborting,
    /// Terminal: compensation completed
    Aborted,
}

impl GlobalStatus {
    /// Statuses the recovery scheduler may lease
    pub const NON_TERMINAL: [GlobalStatus; 3] = [
        GlobalStatus::Prepared,
        GlobalStatus::Submitted,
        GlobalStatus::Aborting,
    ];

    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GlobalStatus::Succeed | GlobalStatus::Failed | GlobalStatus::Aborted
        )
    }

    /// Check whether `self → next` is an edge of the status graph
    pub fn can_transition_to(&self, next: GlobalStatus) -> bool {
        use GlobalStatus::*;
        matches!(
            (self, next),
            (Prepared, Submitted)
                | (Submitted, Succeed)
                | (Submitted, Failed)
                | (Prepared, Aborting)
                | (Submitted, Aborting)
                | (Aborting, Aborted)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GlobalStatus::Prepared => "prepared",
            GlobalStatus::Submitted => "submitted",
            GlobalStatus::Succeed => "succeed",
            GlobalStatus::Failed => "failed",
            GlobalStatus::Aborting => "aborting",
            GlobalStatus::Aborted => "aborted",
        }
    }
}

impl fmt::Display for GlobalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for GlobalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prepared" => Ok(GlobalStatus::Prepared),
            "submitted" => Ok(GlobalStatus::Submitted),
            "succeed" => Ok(GlobalStatus::Succeed),
            "failed" => Ok(GlobalStatus::Failed),
            "aborting" => Ok(GlobalStatus::Aborting),
            "aborted" => Ok(GlobalStatus::Aborted),
            other => Err(format!("unknown global status: {}", other)),
        }
    }
}

/// Branch status, independent of the parent's lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BranchStatus {
    Prepared,
    Succeed,
    Failed,
}

impl BranchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BranchStatus::Prepared => "prepared",
            BranchStatus::Succeed => "succeed",
            BranchStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for BranchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for BranchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prepared" => Ok(BranchStatus::Prepared),
            "succeed" => Ok(BranchStatus::Succeed),
            "failed" => Ok(BranchStatus::Failed),
            other => Err(format!("unknown branch status: {}", other)),
        }
    }
}
