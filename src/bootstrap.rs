//! Engine startup
//!
//! Wires configuration, the PostgreSQL store, the coordinator and the
//! recovery scheduler workers together.

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::db::Database;
use crate::trans::backoff;
use crate::trans::store::{PgStore, TransStore, init_schema};
use crate::trans::{BranchInvoker, Coordinator, RecoveryScheduler, ShutdownSignal, WorkerConfig};

/// A running engine: coordinator plus background scheduler workers
pub struct Engine {
    pub coordinator: Arc<Coordinator>,
    pub store: Arc<dyn TransStore>,
    shutdown: Arc<ShutdownSignal>,
    workers: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Connect to PostgreSQL and start the configured number of workers
    pub async fn start(config: &AppConfig, invoker: Arc<dyn BranchInvoker>) -> anyhow::Result<Self> {
        config
            .scheduler
            .validate()
            .context("Invalid scheduler configuration")?;

        let db = Database::connect(&config.store)
            .await
            .context("Failed to connect to PostgreSQL")?;
        db.health_check()
            .await
            .context("PostgreSQL health check failed")?;

        if config.store.init_schema {
            init_schema(db.pool())
                .await
                .context("Failed to apply transaction schema")?;
            info!("Transaction schema applied");
        }

        let store = Arc::new(PgStore::new(
            db.pool().clone(),
            Duration::from_secs(config.scheduler.retry_interval_secs),
        ));
        Self::with_store(config, store, invoker)
    }

    /// Start workers on an already constructed store
    pub fn with_store(
        config: &AppConfig,
        store: Arc<dyn TransStore>,
        invoker: Arc<dyn BranchInvoker>,
    ) -> anyhow::Result<Self> {
        config
            .scheduler
            .validate()
            .context("Invalid scheduler configuration")?;

        let scheduler = Arc::new(RecoveryScheduler::new(
            store.clone(),
            invoker.clone(),
            Arc::from(backoff::from_config(&config.scheduler.backoff)),
            WorkerConfig::from(&config.scheduler),
        ));
        let shutdown = Arc::new(ShutdownSignal::new());
        let workers = scheduler.spawn(config.scheduler.workers, shutdown.clone());

        info!(
            workers = workers.len(),
            invoker = invoker.name(),
            "Transaction engine started"
        );

        Ok(Self {
            coordinator: Arc::new(Coordinator::new(store.clone())),
            store,
            shutdown,
            workers,
        })
    }

    /// Stop the workers and wait for their current attempt to finish
    pub async fn shutdown(self) {
        self.shutdown.request_shutdown();
        for handle in futures::future::join_all(self.workers).await {
            if let Err(e) = handle {
                warn!(error = %e, "Scheduler worker ended abnormally");
            }
        }
        info!("Transaction engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trans::invoker::MockInvoker;
    use crate::trans::store::MemStore;
    use crate::trans::{BranchOp, GlobalStatus, TransBranch, TransGlobal, TransType};

    fn test_config() -> AppConfig {
        let mut config = AppConfig::from_yaml_str(
            "log_level: info\nlog_dir: ./logs\nlog_file: t.log\nuse_json: false\nrotation: never\n",
        )
        .unwrap();
        config.scheduler.poll_interval_ms = 10;
        config.scheduler.expire_window_secs = 1;
        config
    }

    #[tokio::test]
    async fn test_engine_drives_submission() {
        let config = test_config();
        let store = Arc::new(MemStore::new(Duration::from_secs(10)));
        let engine = Engine::with_store(&config, store, Arc::new(MockInvoker::new())).unwrap();

        let gid = engine.coordinator.new_gid();
        engine
            .coordinator
            .submit(
                TransGlobal::new(&gid, TransType::Msg, GlobalStatus::Submitted),
                vec![TransBranch::new(&gid, "01", BranchOp::Action, "a")],
            )
            .await
            .unwrap();

        let mut status = GlobalStatus::Submitted;
        for _ in 0..200 {
            status = engine.store.get_by_gid(&gid).await.unwrap().status;
            if status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, GlobalStatus::Succeed);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_engine_rejects_bad_scheduler_config() {
        let mut config = test_config();
        config.scheduler.retry_interval_secs = 0;
        let store = Arc::new(MemStore::new(Duration::from_secs(10)));
        let err = Engine::with_store(&config, store, Arc::new(MockInvoker::new()))
            .err()
            .unwrap();
        assert!(format!("{:#}", err).contains("retry_interval_secs"));
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL database"]
    async fn test_engine_start_postgres() {
        let mut config = test_config();
        config.store.init_schema = true;
        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.store.postgres_url = url;
        }
        let engine = Engine::start(&config, Arc::new(MockInvoker::new()))
            .await
            .unwrap();
        assert!(engine.coordinator.list(None, 1).await.is_ok());
        engine.shutdown().await;
    }
}
