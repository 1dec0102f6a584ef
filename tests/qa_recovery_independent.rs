use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use trans_core::config::{AppConfig, BackoffConfig};
use trans_core::trans::backoff::FixedBackoff;
use trans_core::trans::worker::{RecoveryScheduler, WorkerConfig};
use trans_core::{
    BranchInvoker, BranchOp, BranchStatus, Coordinator, GlobalStatus, MemStore, OpResult,
    TransBranch, TransError, TransGlobal, TransStore, TransType,
};

/// Answers Pending for the first `flaky` calls of every branch, then
/// refuses branches named "refuse" and accepts everything else
struct FlakyInvoker {
    flaky: usize,
    seen: Mutex<HashMap<(String, String, BranchOp), usize>>,
}

impl FlakyInvoker {
    fn new(flaky: usize) -> Self {
        Self {
            flaky,
            seen: Mutex::new(HashMap::new()),
        }
    }

    fn calls(&self, op: BranchOp) -> usize {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|((_, _, o), _)| *o == op)
            .map(|(_, n)| *n)
            .sum()
    }
}

#[async_trait]
impl BranchInvoker for FlakyInvoker {
    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn invoke(&self, global: &TransGlobal, branch: &TransBranch) -> OpResult {
        let attempt = {
            let mut seen = self.seen.lock().unwrap();
            let n = seen
                .entry((global.gid.clone(), branch.branch_id.clone(), branch.op))
                .or_insert(0);
            *n += 1;
            *n
        };
        tokio::task::yield_now().await;

        if attempt <= self.flaky {
            OpResult::Pending
        } else if branch.branch_id == "refuse" && branch.op.is_forward() {
            OpResult::Failed("refused".to_string())
        } else {
            OpResult::Success
        }
    }
}

fn saga(gid: &str, steps: &[&str]) -> (TransGlobal, Vec<TransBranch>) {
    let mut branches = Vec::new();
    for step in steps {
        branches.push(TransBranch::new(gid, *step, BranchOp::Compensate, "c"));
        branches.push(TransBranch::new(gid, *step, BranchOp::Action, "a"));
    }
    (
        TransGlobal::new(gid, TransType::Saga, GlobalStatus::Submitted),
        branches,
    )
}

fn scheduler(
    store: Arc<MemStore>,
    invoker: Arc<FlakyInvoker>,
    expire_window: Duration,
) -> Arc<RecoveryScheduler> {
    Arc::new(RecoveryScheduler::new(
        store,
        invoker,
        Arc::new(FixedBackoff {
            interval: Duration::from_secs(10),
        }),
        WorkerConfig {
            poll_interval: Duration::from_millis(5),
            expire_window,
        },
    ))
}

#[tokio::test]
async fn qa_tc_concurrent_workers_reach_consistent_terminal_states() {
    let store = Arc::new(MemStore::new(Duration::from_secs(10)));
    let invoker = Arc::new(FlakyInvoker::new(2));
    let coordinator = Coordinator::new(store.clone());

    for i in 0..30 {
        let gid = format!("qa-{:02}", i);
        let steps: &[&str] = if i % 3 == 0 {
            &["01", "refuse", "03"]
        } else {
            &["01", "02", "03"]
        };
        let (global, branches) = saga(&gid, steps);
        coordinator.submit(global, branches).await.unwrap();
    }

    // A wide window makes every non-terminal record leasable on every poll,
    // so workers regularly overlap on the same gid
    let s = scheduler(store.clone(), invoker.clone(), Duration::from_secs(3600));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let s = s.clone();
            tokio::spawn(async move {
                for _ in 0..10_000 {
                    match s.run_once().await {
                        Ok(Some(_)) => continue,
                        Ok(None) => return,
                        Err(e) => panic!("run_once failed: {}", e),
                    }
                }
                panic!("worker did not settle");
            })
        })
        .collect();
    for handle in futures::future::join_all(handles).await {
        handle.unwrap();
    }

    let all = coordinator.list(None, 100).await.unwrap();
    assert_eq!(all.len(), 30);
    for global in &all {
        let (_, branches) = coordinator.query(&global.gid).await.unwrap();
        let refused = branches.iter().any(|b| b.branch_id == "refuse");
        if refused {
            assert_eq!(global.status, GlobalStatus::Aborted, "{}", global.gid);
            assert!(global.rollback_reason.is_some());
            assert!(
                branches
                    .iter()
                    .filter(|b| b.op == BranchOp::Compensate)
                    .all(|b| b.status == BranchStatus::Succeed)
            );
        } else {
            assert_eq!(global.status, GlobalStatus::Succeed, "{}", global.gid);
            assert!(
                branches
                    .iter()
                    .filter(|b| b.op == BranchOp::Action)
                    .all(|b| b.status == BranchStatus::Succeed)
            );
            assert!(
                branches
                    .iter()
                    .filter(|b| b.op == BranchOp::Compensate)
                    .all(|b| b.status == BranchStatus::Prepared)
            );
        }
    }
}

#[tokio::test]
async fn qa_tc_terminal_states_are_final() {
    let store = Arc::new(MemStore::new(Duration::from_secs(10)));
    let invoker = Arc::new(FlakyInvoker::new(0));
    let coordinator = Coordinator::new(store.clone());

    let (ok, ok_branches) = saga("final-ok", &["01"]);
    let (bad, bad_branches) = saga("final-bad", &["refuse"]);
    coordinator.submit(ok, ok_branches).await.unwrap();
    coordinator.submit(bad, bad_branches).await.unwrap();

    let s = scheduler(store.clone(), invoker, Duration::from_secs(1));
    while s.run_once().await.unwrap().is_some() {}

    for gid in ["final-ok", "final-bad"] {
        let mut global = store.get_by_gid(gid).await.unwrap();
        let terminal = global.status;
        assert!(terminal.is_terminal());

        for target in [
            GlobalStatus::Submitted,
            GlobalStatus::Aborting,
            GlobalStatus::Succeed,
            GlobalStatus::Aborted,
        ] {
            let result = store
                .transition_status(&mut global, terminal, target, &[])
                .await;
            assert!(matches!(result, Err(TransError::InvalidTransition { .. })));
        }
        assert_eq!(store.get_by_gid(gid).await.unwrap().status, terminal);
    }

    // Terminal records are never leased, whatever the window
    assert_eq!(
        store.lease_due_transaction(Duration::from_secs(86_400)).await,
        Err(TransError::NotFound)
    );
}

#[tokio::test]
async fn qa_tc_unknown_outcomes_never_compensate() {
    let store = Arc::new(MemStore::new(Duration::from_secs(10)));
    let invoker = Arc::new(FlakyInvoker::new(usize::MAX));
    let coordinator = Coordinator::new(store.clone());
    let (global, branches) = saga("stuck", &["01", "02"]);
    coordinator.submit(global, branches).await.unwrap();

    let s = scheduler(store.clone(), invoker.clone(), Duration::from_secs(3600));
    for _ in 0..20 {
        s.run_once().await.unwrap();
    }

    assert_eq!(
        store.get_by_gid("stuck").await.unwrap().status,
        GlobalStatus::Submitted
    );
    assert_eq!(invoker.calls(BranchOp::Action), 20);
    assert_eq!(invoker.calls(BranchOp::Compensate), 0);
}

#[test]
fn qa_tc_config_loaded_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.yaml");
    std::fs::write(
        &path,
        r#"
log_level: info
log_dir: ./logs
log_file: trans.log
use_json: true
rotation: hourly
scheduler:
  workers: 3
  backoff:
    kind: exponential
    initial_secs: 2
    max_secs: 30
"#,
    )
    .unwrap();

    let config = AppConfig::load_from(&path).unwrap();
    assert!(config.use_json);
    assert_eq!(config.scheduler.workers, 3);
    assert_eq!(
        config.scheduler.backoff,
        BackoffConfig::Exponential {
            initial_secs: 2,
            max_secs: 30
        }
    );

    std::fs::write(&path, "log_level: [unclosed").unwrap();
    assert!(AppConfig::load_from(&path).is_err());
}
