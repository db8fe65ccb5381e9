use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// 进程关闭协调
///
/// 收到关闭信号后通知所有订阅者，只触发一次。触发后再订阅会立即收到信号。
#[derive(Clone)]
pub struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    triggered: Arc<AtomicBool>,
    /// 等待存活任务结束的最长时间
    grace_period: Duration,
}

impl ShutdownManager {
    pub fn new(grace_period: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            shutdown_tx,
            triggered: Arc::new(AtomicBool::new(false)),
            grace_period,
        }
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        if self.is_triggered() {
            let (tx, rx) = broadcast::channel(1);
            let _ = tx.send(());
            return rx;
        }
        self.shutdown_tx.subscribe()
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::Acquire)
    }

    /// 触发关闭，重复调用无效
    pub fn trigger(&self) {
        if self.triggered.swap(true, Ordering::AcqRel) {
            debug!("关闭信号已触发过");
            return;
        }
        let receivers = self.shutdown_tx.receiver_count();
        let _ = self.shutdown_tx.send(());
        info!("关闭信号已发送给 {} 个订阅者", receivers);
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

/// 等待 SIGINT 或 SIGTERM，返回信号名
pub async fn wait_for_signal() -> std::io::Result<&'static str> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = signal::ctrl_c() => result.map(|_| "SIGINT"),
            _ = terminate.recv() => Ok("SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await.map(|_| "SIGINT")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_trigger_notifies_subscribers() {
        let manager = ShutdownManager::default();
        assert!(!manager.is_triggered());

        let mut rx1 = manager.subscribe();
        let mut rx2 = manager.clone().subscribe();
        manager.trigger();

        assert!(timeout(Duration::from_millis(100), rx1.recv()).await.is_ok());
        assert!(timeout(Duration::from_millis(100), rx2.recv()).await.is_ok());
        assert!(manager.is_triggered());
    }

    #[tokio::test]
    async fn test_subscribe_after_trigger() {
        let manager = ShutdownManager::new(Duration::from_secs(1));
        manager.trigger();

        let mut rx = manager.subscribe();
        assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_ok());
        assert_eq!(manager.grace_period(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_double_trigger() {
        let manager = ShutdownManager::default();
        let mut rx = manager.subscribe();
        manager.trigger();
        manager.trigger();

        assert!(rx.recv().await.is_ok());
        assert!(timeout(Duration::from_millis(50), rx.recv()).await.is_err());
    }
}
