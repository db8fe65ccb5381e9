use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use edge_scheduler_core::config::AppConfig;
use edge_scheduler_dispatcher::{init_default_scheduler, Scheduler};
use edge_scheduler_infrastructure::DatabaseManager;
use edge_scheduler_logmanager::{
    register_log_executors, ChannelEdgeMessenger, EdgeDumpMessage, LogCollector, StatvfsProbe,
    UploadReceiver,
};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{info, warn};

const EDGE_MESSAGE_CAPACITY: usize = 256;

/// 主应用程序
///
/// 持有数据库、调度器和日志收集组件，负责启动与关闭顺序。
pub struct Application {
    config: AppConfig,
    database: DatabaseManager,
    scheduler: Scheduler,
    collector: Arc<LogCollector>,
    receiver: Arc<UploadReceiver>,
    edge_messages: Mutex<Option<mpsc::Receiver<EdgeDumpMessage>>>,
}

impl Application {
    pub async fn new(config: AppConfig) -> Result<Self> {
        config.validate().context("配置校验失败")?;

        let database = DatabaseManager::new(&config.database)
            .await
            .with_context(|| format!("连接数据库失败: {}", config.database.url))?;
        let scheduler = Scheduler::new(database.task_repository(), config.scheduler.to_spec());

        for pool in &config.pools {
            let registered = scheduler
                .register_worker_pool(pool.clone())
                .await
                .with_context(|| format!("注册工作池失败: {}", pool.id))?;
            if !registered {
                warn!("工作池 {} 重复配置，已忽略", pool.id);
            }
        }

        let collector = Arc::new(
            LogCollector::new(config.log_collect.clone(), Arc::new(StatvfsProbe))
                .context("初始化日志收集组件失败")?,
        );
        let (messenger, edge_messages) = ChannelEdgeMessenger::new(EDGE_MESSAGE_CAPACITY);
        if !register_log_executors(&scheduler, collector.clone(), Arc::new(messenger)).await {
            return Err(anyhow::anyhow!("日志收集执行器重复注册"));
        }
        let receiver = Arc::new(UploadReceiver::new(collector.clone(), scheduler.clone()));

        if !init_default_scheduler(scheduler.clone()) {
            warn!("默认调度器已存在，本实例不会成为默认调度器");
        }

        Ok(Self {
            config,
            database,
            scheduler,
            collector,
            receiver,
            edge_messages: Mutex::new(Some(edge_messages)),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn upload_receiver(&self) -> Arc<UploadReceiver> {
        self.receiver.clone()
    }

    /// 取走发往边缘节点的消息流，由消息总线适配层消费
    pub async fn take_edge_messages(&self) -> Option<mpsc::Receiver<EdgeDumpMessage>> {
        self.edge_messages.lock().await.take()
    }

    /// 运行直到收到关闭信号
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>, grace_period: Duration) -> Result<()> {
        self.database.health_check().await.context("数据库健康检查失败")?;
        self.scheduler.start().await.context("启动调度器失败")?;

        if let Some(mut edge_messages) = self.take_edge_messages().await {
            // 未接入消息总线时只记录请求
            tokio::spawn(async move {
                while let Some(message) = edge_messages.recv().await {
                    warn!(
                        task_id = %message.request.task_id,
                        "消息总线未接入，丢弃发往节点 {}({}) 的日志导出请求",
                        message.peer.sn,
                        message.peer.ip
                    );
                }
            });
        }

        info!("应用已启动");
        let _ = shutdown_rx.recv().await;

        info!("开始关闭应用，等待存活任务最多 {:?}", grace_period);
        self.scheduler.shutdown(grace_period).await;
        self.collector.stop_expiry_timer();
        self.database.close().await;
        info!("应用已关闭");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edge_scheduler_core::config::{DUMP_MULTI_NODES_LOG, DUMP_SINGLE_NODE_LOG};
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> AppConfig {
        let mut config = AppConfig::default();
        config.database.url = format!("sqlite://{}?mode=rwc", dir.path().join("app.db").display());
        config.log_collect.temp_dir = dir.path().join("temp");
        config.log_collect.public_dir = dir.path().join("public");
        config
    }

    #[tokio::test]
    async fn test_application_lifecycle() {
        let dir = TempDir::new().unwrap();
        let app = Arc::new(Application::new(test_config(&dir)).await.unwrap());

        for pool in [DUMP_MULTI_NODES_LOG, DUMP_SINGLE_NODE_LOG] {
            assert!(app.scheduler().pool_stats(pool).await.is_some());
        }

        let (tx, rx) = broadcast::channel(1);
        let running = {
            let app = app.clone();
            tokio::spawn(async move { app.run(rx, Duration::from_secs(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(app.take_edge_messages().await.is_none());

        tx.send(()).unwrap();
        running.await.unwrap().unwrap();
        assert_eq!(app.scheduler().active_tasks(), 0);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.log_collect.public_dir = config.log_collect.temp_dir.clone();
        assert!(Application::new(config).await.is_err());
    }
}
