use std::path::{Path, PathBuf};
use std::sync::Arc;

use edge_scheduler_core::{config::LogCollectConfig, SchedulerError, SchedulerResult};
use regex::Regex;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::constants::{EDGE_NODES_TAR_GZ, SINGLE_NODE_TASK_ID_PATTERN, TAR_GZ_SUFFIX};
use crate::disk::{DiskThresholds, DiskUsageProbe};
use crate::janitor::TempFileJanitor;

/// 日志收集的共享状态
///
/// 打包锁保证同一时刻只有一个主任务在整理临时目录，排队的主任务按到达顺序获得锁。
pub struct LogCollector {
    config: LogCollectConfig,
    probe: Arc<dyn DiskUsageProbe>,
    janitor: TempFileJanitor,
    task_id_pattern: Regex,
    pack_lock: Mutex<()>,
    expiry_timer: std::sync::Mutex<Option<CancellationToken>>,
}

impl LogCollector {
    pub fn new(config: LogCollectConfig, probe: Arc<dyn DiskUsageProbe>) -> SchedulerResult<Self> {
        let task_id_pattern = Regex::new(SINGLE_NODE_TASK_ID_PATTERN)
            .map_err(|e| SchedulerError::Configuration(format!("任务ID正则无效: {e}")))?;
        Ok(Self {
            janitor: TempFileJanitor::new(&config),
            config,
            probe,
            task_id_pattern,
            pack_lock: Mutex::new(()),
            expiry_timer: std::sync::Mutex::new(None),
        })
    }

    pub fn config(&self) -> &LogCollectConfig {
        &self.config
    }

    pub fn probe(&self) -> Arc<dyn DiskUsageProbe> {
        self.probe.clone()
    }

    pub fn thresholds(&self) -> DiskThresholds {
        DiskThresholds::from(&self.config)
    }

    pub fn temp_dir(&self) -> &Path {
        &self.config.temp_dir
    }

    /// 子任务上传文件的临时路径
    pub fn upload_path(&self, task_id: &str) -> PathBuf {
        self.config.temp_dir.join(format!("{task_id}{TAR_GZ_SUFFIX}"))
    }

    pub fn package_temp_path(&self) -> PathBuf {
        self.config.temp_dir.join(EDGE_NODES_TAR_GZ)
    }

    pub fn package_public_path(&self) -> PathBuf {
        self.config.public_dir.join(EDGE_NODES_TAR_GZ)
    }

    pub fn is_single_node_task_id(&self, task_id: &str) -> bool {
        self.task_id_pattern.is_match(task_id)
    }

    pub(crate) async fn lock_packaging(&self) -> MutexGuard<'_, ()> {
        self.pack_lock.lock().await
    }

    /// 调用方需持有打包锁
    pub(crate) async fn run_janitor(&self) -> SchedulerResult<bool> {
        let janitor = self.janitor.clone();
        tokio::task::spawn_blocking(move || janitor.clean_temp_files())
            .await
            .map_err(|e| SchedulerError::Internal(format!("清理任务异常退出: {e}")))?
    }

    /// 在打包锁内清理临时文件，失败只记录日志
    pub async fn clean_temp_files(&self) {
        let _guard = self.lock_packaging().await;
        if let Err(e) = self.run_janitor().await {
            error!("清理日志收集临时目录失败: {}", e);
        }
    }

    pub fn stop_expiry_timer(&self) {
        if let Some(token) = self.take_expiry_timer() {
            token.cancel();
            debug!("已停止打包文件过期定时器");
        }
    }

    /// 是否有尚未触发的过期定时器
    pub fn expiry_timer_armed(&self) -> bool {
        let guard = match self.expiry_timer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.as_ref().is_some_and(|token| !token.is_cancelled())
    }

    /// 重新设置打包文件的过期清理定时器
    ///
    /// 定时器取得打包锁后再次确认未被停止，清理开始后不会被中断。
    pub fn arm_expiry_timer(self: &Arc<Self>) {
        let collector = Arc::clone(self);
        let expire = self.config.package_expire();
        let token = CancellationToken::new();
        let timer = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = timer.cancelled() => return,
                _ = tokio::time::sleep(expire) => {}
            }
            let _guard = collector.lock_packaging().await;
            if timer.is_cancelled() {
                return;
            }
            info!("日志打包文件已过期，开始清理");
            if let Err(e) = collector.run_janitor().await {
                error!("清理过期日志打包文件失败: {}", e);
            }
            timer.cancel();
        });
        if let Some(previous) = self.replace_expiry_timer(token) {
            previous.cancel();
        }
    }

    fn take_expiry_timer(&self) -> Option<CancellationToken> {
        match self.expiry_timer.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    fn replace_expiry_timer(&self, token: CancellationToken) -> Option<CancellationToken> {
        match self.expiry_timer.lock() {
            Ok(mut guard) => guard.replace(token),
            Err(poisoned) => poisoned.into_inner().replace(token),
        }
    }
}

impl Drop for LogCollector {
    fn drop(&mut self) {
        self.stop_expiry_timer();
    }
}
