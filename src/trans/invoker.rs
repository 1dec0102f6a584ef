//! Branch Invoker
//!
//! Seam to the transport that performs a branch's remote action. The
//! coordinator attempts each branch at least once per pass until the global
//! transaction is terminal, so implementations must tolerate repeats of the
//! same `(gid, branch_id, op)`.

use async_trait::async_trait;

use super::types::{OpResult, TransBranch, TransGlobal};

/// Performs one branch action and classifies the outcome
#[async_trait]
pub trait BranchInvoker: Send + Sync {
    /// Get invoker name for logging
    fn name(&self) -> &'static str;

    /// Invoke `branch` of `global`.
    ///
    /// `Pending` must be returned whenever the outcome is unknown (timeout,
    /// connection loss); `Failed` only for an explicit business refusal.
    async fn invoke(&self, global: &TransGlobal, branch: &TransBranch) -> OpResult;
}

/// Mock invoker for testing
#[cfg(test)]
pub mod mock {
    use super::*;
    use crate::trans::types::BranchOp;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub struct MockInvoker {
        /// Scripted results keyed by `(branch_id, op)`; unscripted calls succeed
        results: Mutex<HashMap<(String, BranchOp), OpResult>>,
        /// Call log in invocation order
        calls: Mutex<Vec<(String, String, BranchOp)>>,
        call_count: AtomicUsize,
    }

    impl MockInvoker {
        pub fn new() -> Self {
            Self {
                results: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
                call_count: AtomicUsize::new(0),
            }
        }

        pub fn set_result(&self, branch_id: &str, op: BranchOp, result: OpResult) {
            self.results
                .lock()
                .unwrap()
                .insert((branch_id.to_string(), op), result);
        }

        pub fn call_count(&self) -> usize {
            self.call_count.load(Ordering::SeqCst)
        }

        /// `(branch_id, op)` of every call, in order
        pub fn calls(&self) -> Vec<(String, BranchOp)> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|(_, b, op)| (b.clone(), *op))
                .collect()
        }

        pub fn calls_for(&self, gid: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(g, _, _)| g == gid)
                .count()
        }
    }

    #[async_trait]
    impl BranchInvoker for MockInvoker {
        fn name(&self) -> &'static str {
            "mock"
        }

        async fn invoke(&self, global: &TransGlobal, branch: &TransBranch) -> OpResult {
            self.call_count.fetch_add(1, Ordering::SeqCst);
            self.calls.lock().unwrap().push((
                global.gid.clone(),
                branch.branch_id.clone(),
                branch.op,
            ));

            self.results
                .lock()
                .unwrap()
                .get(&(branch.branch_id.clone(), branch.op))
                .cloned()
                .unwrap_or(OpResult::Success)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::trans::state::GlobalStatus;
        use crate::trans::types::TransType;

        #[tokio::test]
        async fn test_mock_invoker_scripted() {
            let invoker = MockInvoker::new();
            invoker.set_result("02", BranchOp::Action, OpResult::Pending);

            let g = TransGlobal::new("g", TransType::Saga, GlobalStatus::Submitted);
            let b1 = TransBranch::new("g", "01", BranchOp::Action, "u1");
            let b2 = TransBranch::new("g", "02", BranchOp::Action, "u2");

            assert!(invoker.invoke(&g, &b1).await.is_success());
            assert!(invoker.invoke(&g, &b2).await.is_pending());
            assert_eq!(invoker.call_count(), 2);
            assert_eq!(invoker.calls_for("g"), 2);
            assert_eq!(invoker.calls()[1], ("02".to_string(), BranchOp::Action));
        }
    }
}

#[cfg(test)]
pub use mock::MockInvoker;
