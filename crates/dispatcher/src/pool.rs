use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use edge_scheduler_core::{models::TaskPhase, models::WorkerPoolSpec, SchedulerError, SchedulerResult};
use metrics::gauge;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::{start_processing, TaskContext};
use crate::executor::TaskExecutor;

pub(crate) struct PoolJob {
    pub ctx: Arc<TaskContext>,
    pub executor: Box<dyn TaskExecutor>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub running: usize,
    pub queued: usize,
}

/// 有界工作池
///
/// 固定数量的工作协程共享一个FIFO队列。已接纳的任务总数（运行中加排队中）
/// 不超过 `max_concurrency + max_capacity`，超出时拒绝提交。
pub struct WorkerPool {
    spec: WorkerPoolSpec,
    queue_tx: mpsc::Sender<PoolJob>,
    admitted: Arc<AtomicUsize>,
    running: Arc<AtomicUsize>,
    shutdown: CancellationToken,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// 创建工作池并启动工作协程，需在tokio运行时内调用
    pub fn new(spec: WorkerPoolSpec) -> SchedulerResult<Self> {
        spec.validate()?;
        let (queue_tx, queue_rx) = mpsc::channel(spec.total_slots());
        let queue_rx = Arc::new(Mutex::new(queue_rx));
        let admitted = Arc::new(AtomicUsize::new(0));
        let running = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();

        let workers = (0..spec.max_concurrency)
            .map(|index| {
                let worker = PoolWorker {
                    pool_id: spec.id.clone(),
                    index,
                    queue: queue_rx.clone(),
                    admitted: admitted.clone(),
                    running: running.clone(),
                    shutdown: shutdown.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        info!(
            "工作池已启动: {} (并发 {}, 容量 {})",
            spec.id, spec.max_concurrency, spec.max_capacity
        );
        Ok(Self {
            spec,
            queue_tx,
            admitted,
            running,
            shutdown,
            workers: std::sync::Mutex::new(workers),
        })
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn spec(&self) -> &WorkerPoolSpec {
        &self.spec
    }

    pub(crate) fn submit(&self, job: PoolJob) -> SchedulerResult<()> {
        let limit = self.spec.total_slots();
        self.admitted
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .map_err(|_| SchedulerError::FullQueue {
                pool: self.spec.id.clone(),
            })?;

        if self.queue_tx.try_send(job).is_err() {
            self.admitted.fetch_sub(1, Ordering::AcqRel);
            return Err(SchedulerError::FullQueue {
                pool: self.spec.id.clone(),
            });
        }
        self.report();
        Ok(())
    }

    pub fn stats(&self) -> PoolStats {
        let admitted = self.admitted.load(Ordering::Acquire);
        let running = self.running.load(Ordering::Acquire);
        PoolStats {
            running,
            queued: admitted.saturating_sub(running),
        }
    }

    fn report(&self) {
        let stats = self.stats();
        gauge!("edge_scheduler_pool_running", "pool" => self.spec.id.clone())
            .set(stats.running as f64);
        gauge!("edge_scheduler_pool_queued", "pool" => self.spec.id.clone())
            .set(stats.queued as f64);
    }

    /// 停止工作协程，正在执行的任务不受影响
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let workers = match self.workers.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        debug!("工作池 {} 停止, 工作协程 {} 个", self.spec.id, workers.len());
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct PoolWorker {
    pool_id: String,
    index: usize,
    queue: Arc<Mutex<mpsc::Receiver<PoolJob>>>,
    admitted: Arc<AtomicUsize>,
    running: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl PoolWorker {
    async fn run(self) {
        loop {
            let job = {
                let mut queue = self.queue.lock().await;
                tokio::select! {
                    job = queue.recv() => job,
                    _ = self.shutdown.cancelled() => None,
                }
            };
            let Some(job) = job else { break };

            self.running.fetch_add(1, Ordering::AcqRel);
            self.report();
            self.execute(job).await;
            self.running.fetch_sub(1, Ordering::AcqRel);
            self.admitted.fetch_sub(1, Ordering::AcqRel);
            self.report();
        }
        debug!("工作池 {} 的工作协程 {} 退出", self.pool_id, self.index);
    }

    fn report(&self) {
        let running = self.running.load(Ordering::Acquire);
        let queued = self.admitted.load(Ordering::Acquire).saturating_sub(running);
        gauge!("edge_scheduler_pool_running", "pool" => self.pool_id.clone()).set(running as f64);
        gauge!("edge_scheduler_pool_queued", "pool" => self.pool_id.clone()).set(queued as f64);
    }

    async fn execute(&self, job: PoolJob) {
        let PoolJob { ctx, executor } = job;
        let task_id = ctx.id().to_string();

        match ctx.system_update(start_processing()).await {
            Ok((status, _)) if status.phase == TaskPhase::Processing => {}
            Ok((status, _)) => {
                debug!(task_id = %task_id, "任务处于 {} 阶段，跳过执行", status.phase);
                return;
            }
            Err(e) => {
                debug!(task_id = %task_id, "任务无法进入执行阶段，跳过执行: {}", e);
                return;
            }
        }

        debug!(task_id = %task_id, "工作池 {} 开始执行任务", self.pool_id);
        let exec_ctx = ctx.clone();
        let handle = tokio::spawn(async move { executor.execute(exec_ctx).await });
        let outcome = match handle.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                warn!(task_id = %task_id, "任务执行失败: {}", e);
                Err(e.to_string())
            }
            Err(join_err) => {
                let message = panic_message(join_err);
                error!(task_id = %task_id, "{}", message);
                Err(message)
            }
        };

        match ctx.executor_exited(outcome).await {
            Ok((status, _)) => debug!(task_id = %task_id, "执行器退出后任务阶段: {}", status.phase),
            Err(SchedulerError::AlreadyFinished) => {}
            Err(e) => warn!(task_id = %task_id, "执行器退出后更新任务状态失败: {}", e),
        }
    }
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return "executor cancelled".to_string();
    }
    let payload = err.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("executor panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("executor panicked: {message}")
    } else {
        "executor panicked".to_string()
    }
}
