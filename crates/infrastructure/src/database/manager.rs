use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use edge_scheduler_core::{config::DatabaseConfig, traits::TaskRepository, SchedulerResult};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use super::sqlite::SqliteTaskRepository;

/// 数据库管理器
///
/// 负责建立SQLite连接池并初始化表结构。内存数据库只使用单个永不过期的连接，
/// 否则连接回收会丢失数据。
pub struct DatabaseManager {
    pool: SqlitePool,
}

impl DatabaseManager {
    pub async fn new(config: &DatabaseConfig) -> SchedulerResult<Self> {
        let memory = config.is_memory();
        let mut connect_options =
            SqliteConnectOptions::from_str(&config.url)?.create_if_missing(true);
        if !memory {
            connect_options = connect_options.journal_mode(SqliteJournalMode::Wal);
        }

        let mut pool_options = SqlitePoolOptions::new()
            .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds));
        pool_options = if memory {
            pool_options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            pool_options
                .max_connections(config.max_connections)
                .min_connections(config.min_connections)
                .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
        };

        let pool = pool_options.connect_with(connect_options).await?;
        SqliteTaskRepository::run_migrations(&pool).await?;
        info!("数据库连接池已建立: {}", config.url);
        Ok(Self { pool })
    }

    /// 用于测试的内存数据库
    pub async fn in_memory() -> SchedulerResult<Self> {
        let config = DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            ..DatabaseConfig::default()
        };
        Self::new(&config).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn health_check(&self) -> SchedulerResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await
    }

    pub fn task_repository(&self) -> Arc<dyn TaskRepository> {
        Arc::new(SqliteTaskRepository::new(self.pool.clone()))
    }
}
