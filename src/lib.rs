//! trans_core - Distributed Transaction Coordinator Engine
//!
//! Persistent state machine and recovery engine for SAGA, TCC, 2-phase
//! message and XA global transactions.
//!
//! # Modules
//!
//! - [`trans`] - Transaction model, stores, processor and recovery scheduler
//! - [`db`] - PostgreSQL connection pool
//! - [`config`] - YAML application configuration
//! - [`logging`] - `tracing` subscriber setup
//! - [`bootstrap`] - Engine startup and shutdown

pub mod bootstrap;
pub mod config;
pub mod db;
pub mod logging;
pub mod trans;

// Convenient re-exports at crate root
pub use bootstrap::Engine;
pub use config::AppConfig;
pub use trans::{
    BranchInvoker, BranchOp, BranchStatus, Coordinator, GlobalStatus, MemStore, OpResult,
    Outcome, PgStore, RecoveryScheduler, Submission, TransBranch, TransError, TransGlobal,
    TransStore, TransType,
};
