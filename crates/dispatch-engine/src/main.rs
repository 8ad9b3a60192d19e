//! 通知调度引擎服务入口
//!
//! 启动顺序:配置加载 -> 可观测性 -> 数据库与迁移 ->
//! 队列/存储 -> 调度器与 worker 池,收到 SIGTERM 或 Ctrl+C
//! 后广播关闭信号并等待全部循环退出。

use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};

use courier_shared::config::AppConfig;
use courier_shared::database::Database;
use courier_shared::observability;
use courier_shared::retry::RetryPolicy;

use dispatch_engine::queue::{JobQueue, PgJobQueue};
use dispatch_engine::scheduler::Scheduler;
use dispatch_engine::sender::SenderRegistry;
use dispatch_engine::store::{DispatchStore, PgStore};
use dispatch_engine::worker::WorkerPool;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 统一加载配置：config/default.toml -> 环境覆盖 -> COURIER_ 环境变量
    let config = AppConfig::load("dispatch-engine").unwrap_or_default();

    let obs_config = config
        .observability
        .clone()
        .with_service_name(&config.service_name);
    let _guard = observability::init(&obs_config)?;

    info!("Starting dispatch-engine ({})", config.environment);

    // 初始化基础设施
    let db = Database::connect(&config.database).await?;
    db.run_migrations().await?;

    let retry_policy = RetryPolicy::from(&config.retry);
    let queue: Arc<dyn JobQueue> = Arc::new(PgJobQueue::new(
        db.pool().clone(),
        retry_policy,
        Duration::from_secs(config.queue.lease_timeout_seconds),
    ));
    let store: Arc<dyn DispatchStore> = Arc::new(PgStore::new(db.pool().clone()));

    let senders = SenderRegistry::with_default_senders();
    info!(channels = ?senders.channels(), "Channel senders registered");

    // 关闭信号通过 watch 广播给全部后台循环
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        queue.clone(),
        config.scheduler.clone(),
    ));
    let mut handles = scheduler.run(shutdown_rx.clone());

    let worker_pool = WorkerPool::new(
        queue.clone(),
        store.clone(),
        senders,
        config.worker.concurrency,
        Duration::from_millis(config.worker.poll_interval_ms),
    );
    handles.extend(worker_pool.run(shutdown_rx));

    info!("dispatch-engine started");

    shutdown_signal().await;

    // 广播关闭并等待所有循环退出
    let _ = shutdown_tx.send(true);
    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "后台任务退出异常");
        }
    }

    db.close().await;
    info!("Service shutdown complete");
    Ok(())
}

/// 优雅关闭信号处理
///
/// K8s 通过 SIGTERM 通知 Pod 停止；本地开发通过 Ctrl+C。
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("注册 Ctrl+C 处理器失败");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("注册 SIGTERM 处理器失败")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown...");
        }
    }
}
