//! 数据库连接管理
//!
//! 持有 PostgreSQL 连接池并负责启动期的迁移与健康检查。
//! 引擎的队列租约依赖行锁语义,连接必须指向真正的 Postgres
//! 而不是兼容层。

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use crate::config::DatabaseConfig;
use crate::error::{CourierError, Result};

/// 数据库连接池
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// 按配置建立连接池,启动时连接失败直接报错退出
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
            .connect(&config.url)
            .await?;

        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Database connection pool created"
        );

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// 健康检查,供就绪探针使用
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }

    /// 执行 migrations/ 目录下的全部迁移
    ///
    /// 幂等:已应用过的迁移会被跳过,多实例并发启动时由
    /// sqlx 的迁移锁保证只有一个实例真正执行。
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| CourierError::Internal(format!("数据库迁移失败: {e}")))?;
        info!("Database migrations applied");
        Ok(())
    }

    /// 关闭连接池,等待在途查询完成
    pub async fn close(&self) {
        self.pool.close().await;
        info!("Database connection pool closed");
    }
}
