//! Distributed Transaction Engine
//!
//! Persistent state machine and recovery engine for SAGA, TCC, 2-phase
//! message and XA transactions. A global transaction and its branches are
//! stored in a [`TransStore`]; any number of [`RecoveryScheduler`] workers
//! lease due transactions and drive them to a terminal status.
//!
//! # State Machine
//!
//! ```text
//! PREPARED → SUBMITTED → SUCCEED
//!     ↓          ↓   ↘
//!     └──→ ABORTING   FAILED
//!              ↓
//!           ABORTED
//! ```
//!
//! # Safety Invariants
//!
//! 1. **Conditional Writes Only**: every status change is a CAS on the
//!    expected status; terminal statuses are never left
//! 2. **Explicit Fail Rule**: only an explicit branch refusal changes
//!    direction, unknown outcomes are retried
//! 3. **Idempotent Branches**: branches may be invoked more than once and
//!    must tolerate it
//! 4. **Advisory Leases**: a lease only keeps workers apart for liveness;
//!    correctness rests on the CAS and row locks

pub mod backoff;
pub mod coordinator;
pub mod error;
pub mod invoker;
pub mod processor;
pub mod state;
pub mod store;
pub mod types;
pub mod worker;


// Re-exports for convenience
pub use backoff::{BackoffPolicy, ExponentialBackoff, FixedBackoff};
pub use coordinator::{Coordinator, Outcome, Submission};
pub use error::TransError;
pub use invoker::BranchInvoker;
pub use processor::{Processor, Progress};
pub use state::{BranchStatus, GlobalStatus};
pub use store::{MemStore, PgStore, TransStore};
pub use types::{BranchOp, OpResult, TransBranch, TransGlobal, TransType};
pub use worker::{Attempt, RecoveryScheduler, ShutdownSignal, WorkerConfig};
