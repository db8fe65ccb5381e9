//! 任务调度器
//!
//! 维护执行器工厂、工作池和存活任务上下文的注册表，是提交任务的唯一入口。

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::Utc;
use edge_scheduler_core::{
    models::{SchedulerSpec, Task, TaskSpec, WorkerPoolSpec},
    traits::TaskRepository,
    SchedulerError, SchedulerResult,
};
use metrics::counter;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::context::{LiveContextParams, TaskContext};
use crate::executor::ExecutorFactory;
use crate::house_keeper::HouseKeeper;
use crate::pool::{PoolJob, PoolStats, WorkerPool};
use crate::selector::SubTaskSelector;

static DEFAULT_SCHEDULER: OnceLock<Scheduler> = OnceLock::new();

/// 安装进程级默认调度器，只能成功一次
pub fn init_default_scheduler(scheduler: Scheduler) -> bool {
    DEFAULT_SCHEDULER.set(scheduler).is_ok()
}

pub fn default_scheduler() -> Option<&'static Scheduler> {
    DEFAULT_SCHEDULER.get()
}

pub(crate) struct SchedulerInner {
    spec: SchedulerSpec,
    repo: Arc<dyn TaskRepository>,
    factories: RwLock<HashMap<String, ExecutorFactory>>,
    pools: RwLock<HashMap<String, Arc<WorkerPool>>>,
    contexts: RwLock<HashMap<String, Arc<TaskContext>>>,
    active_tasks: AtomicUsize,
    root_token: CancellationToken,
    task_done_tx: mpsc::Sender<()>,
    task_done_rx: Mutex<Option<mpsc::Receiver<()>>>,
    house_keeper: Mutex<Option<JoinHandle<()>>>,
}

impl SchedulerInner {
    /// 生命周期结束时调用：移出存活注册表、释放活跃计数，主任务结束时通知清理服务
    pub(crate) async fn task_finished(&self, spec: &TaskSpec) {
        if self.contexts.write().await.remove(&spec.id).is_some() {
            self.release_active_slot();
        }
        if spec.is_master() {
            let _ = self.task_done_tx.try_send(());
        }
    }

    fn reserve_active_slot(&self) -> SchedulerResult<()> {
        let limit = self.spec.max_active_tasks;
        self.active_tasks
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .map(|_| ())
            .map_err(|_| SchedulerError::TooManyTask)
    }

    fn release_active_slot(&self) {
        let _ = self
            .active_tasks
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(repo: Arc<dyn TaskRepository>, spec: SchedulerSpec) -> Self {
        let (task_done_tx, task_done_rx) = mpsc::channel(1);
        Self {
            inner: Arc::new(SchedulerInner {
                spec,
                repo,
                factories: RwLock::new(HashMap::new()),
                pools: RwLock::new(HashMap::new()),
                contexts: RwLock::new(HashMap::new()),
                active_tasks: AtomicUsize::new(0),
                root_token: CancellationToken::new(),
                task_done_tx,
                task_done_rx: Mutex::new(Some(task_done_rx)),
                house_keeper: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<SchedulerInner>) -> Self {
        Self { inner }
    }

    pub fn spec(&self) -> &SchedulerSpec {
        &self.inner.spec
    }

    pub fn repository(&self) -> Arc<dyn TaskRepository> {
        self.inner.repo.clone()
    }

    /// 将上次进程遗留的未结束任务标记为失败并启动历史清理服务
    pub async fn start(&self) -> SchedulerResult<()> {
        let failed = self.inner.repo.mark_unfinished_as_failed().await?;
        if failed > 0 {
            warn!("{} 个遗留任务已标记为失败", failed);
        }

        if let Some(task_done_rx) = self.inner.task_done_rx.lock().await.take() {
            let house_keeper = HouseKeeper::new(
                self.inner.repo.clone(),
                self.inner.spec.max_history_master_tasks,
            );
            let handle = tokio::spawn(
                house_keeper.run(task_done_rx, self.inner.root_token.child_token()),
            );
            *self.inner.house_keeper.lock().await = Some(handle);
        }
        info!("调度器已启动");
        Ok(())
    }

    /// 注册执行器工厂，ID已存在时返回false
    pub async fn register_executor_factory(&self, factory: ExecutorFactory) -> bool {
        let mut factories = self.inner.factories.write().await;
        if factories.contains_key(factory.id()) {
            return false;
        }
        debug!("注册执行器工厂: {}", factory.id());
        factories.insert(factory.id().to_string(), factory);
        true
    }

    /// 注册工作池，ID已存在时返回false
    pub async fn register_worker_pool(&self, spec: WorkerPoolSpec) -> SchedulerResult<bool> {
        let mut pools = self.inner.pools.write().await;
        if pools.contains_key(&spec.id) {
            return Ok(false);
        }
        let pool = WorkerPool::new(spec)?;
        pools.insert(pool.id().to_string(), Arc::new(pool));
        Ok(true)
    }

    pub async fn pool_stats(&self, pool_id: &str) -> Option<PoolStats> {
        self.inner.pools.read().await.get(pool_id).map(|p| p.stats())
    }

    pub fn active_tasks(&self) -> usize {
        self.inner.active_tasks.load(Ordering::Acquire)
    }

    /// 提交任务
    ///
    /// 依次校验执行器与工作池、活跃任务与存储上限、ID唯一性和父任务存活，
    /// 然后持久化任务并交给工作池。返回任务的存活上下文。
    #[instrument(skip(self, spec), fields(command = %spec.command, pool = %spec.worker_pool))]
    pub async fn submit_task(&self, mut spec: TaskSpec) -> SchedulerResult<Arc<TaskContext>> {
        let result = self.try_submit(&mut spec).await;
        match &result {
            Ok(_) => {
                counter!("edge_scheduler_tasks_submitted_total", "command" => spec.command.clone())
                    .increment(1);
            }
            Err(e) => {
                counter!("edge_scheduler_tasks_rejected_total", "reason" => rejection_reason(e))
                    .increment(1);
                debug!("提交任务被拒绝: {}", e);
            }
        }
        result
    }

    async fn try_submit(&self, spec: &mut TaskSpec) -> SchedulerResult<Arc<TaskContext>> {
        let factory = self
            .inner
            .factories
            .read()
            .await
            .get(&spec.command)
            .cloned()
            .ok_or_else(|| SchedulerError::FactoryNotFound {
                command: spec.command.clone(),
            })?;
        let pool = self
            .inner
            .pools
            .read()
            .await
            .get(&spec.worker_pool)
            .cloned()
            .ok_or_else(|| SchedulerError::WorkerPoolNotFound {
                pool: spec.worker_pool.clone(),
            })?;

        self.inner.reserve_active_slot()?;
        match self.admit(spec, factory, pool).await {
            Ok(ctx) => Ok(ctx),
            Err(e) => {
                self.inner.release_active_slot();
                Err(e)
            }
        }
    }

    async fn admit(
        &self,
        spec: &mut TaskSpec,
        factory: ExecutorFactory,
        pool: Arc<WorkerPool>,
    ) -> SchedulerResult<Arc<TaskContext>> {
        if self.inner.repo.count_tasks().await? >= self.inner.spec.allowed_max_tasks_in_db {
            warn!("数据库中的任务数已达上限 {}", self.inner.spec.allowed_max_tasks_in_db);
            return Err(SchedulerError::TooManyTask);
        }

        if spec.id.is_empty() {
            spec.id = synthesize_task_id(&spec.name);
        } else {
            let live = self.inner.contexts.read().await.contains_key(&spec.id);
            if live || self.inner.repo.get(&spec.id).await.is_ok() {
                return Err(SchedulerError::Conflict {
                    id: spec.id.clone(),
                });
            }
        }

        let (parent_token, parent_events) = if spec.is_master() {
            (self.inner.root_token.clone(), None)
        } else {
            let parent = self
                .inner
                .contexts
                .read()
                .await
                .get(&spec.parent_id)
                .cloned()
                .filter(|parent| {
                    parent.spec().is_master() && parent.is_live() && !parent.phase().is_finished()
                })
                .ok_or_else(|| SchedulerError::task_not_found(spec.parent_id.clone()))?;
            (
                parent.main_token().clone(),
                parent.sub_task_events().cloned(),
            )
        };

        let (ctx, lifecycle) = TaskContext::new_live(LiveContextParams {
            spec: spec.clone(),
            repo: self.inner.repo.clone(),
            parent_token,
            parent_events,
            scheduler: Arc::downgrade(&self.inner),
            update_timeout: self.inner.spec.update_timeout,
        });

        self.inner
            .repo
            .create(&Task::new(spec.clone(), Utc::now()))
            .await?;

        let job = PoolJob {
            ctx: ctx.clone(),
            executor: factory.create(),
        };
        if let Err(e) = pool.submit(job) {
            if let Err(delete_err) = self.inner.repo.delete(&spec.id).await {
                warn!(task_id = %spec.id, "回滚任务记录失败: {}", delete_err);
            }
            return Err(e);
        }

        self.inner
            .contexts
            .write()
            .await
            .insert(spec.id.clone(), ctx.clone());
        tokio::spawn(lifecycle.run());

        info!(task_id = %spec.id, parent_id = %spec.parent_id, "任务已提交");
        Ok(ctx)
    }

    /// 返回存活上下文，任务已结束时返回由存储构造的历史上下文
    pub async fn get_task_context(&self, id: &str) -> SchedulerResult<Arc<TaskContext>> {
        if let Some(ctx) = self.inner.contexts.read().await.get(id) {
            return Ok(ctx.clone());
        }
        let task = self.inner.repo.get(id).await?;
        Ok(TaskContext::historical(task, self.inner.repo.clone()))
    }

    pub async fn new_sub_task_selector(&self, master_id: &str) -> SchedulerResult<SubTaskSelector> {
        let events = self
            .inner
            .contexts
            .read()
            .await
            .get(master_id)
            .and_then(|ctx| ctx.sub_task_events().map(|tx| tx.subscribe()));
        if events.is_none() {
            // 主任务不存活时仅依赖存储
            self.inner.repo.get(master_id).await?;
        }
        Ok(SubTaskSelector::new(self.clone(), master_id.to_string(), events))
    }

    /// 取消所有存活任务并等待其结束，超时后停止等待
    pub async fn shutdown(&self, timeout: Duration) {
        info!("调度器开始关闭");
        self.inner.root_token.cancel();

        let deadline = tokio::time::Instant::now() + timeout;
        while !self.inner.contexts.read().await.is_empty() {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    "等待任务结束超时，仍有 {} 个存活任务",
                    self.inner.contexts.read().await.len()
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        for pool in self.inner.pools.read().await.values() {
            pool.shutdown();
        }
        if let Some(handle) = self.inner.house_keeper.lock().await.take() {
            let _ = handle.await;
        }
        info!("调度器已关闭");
    }
}

fn synthesize_task_id(name: &str) -> String {
    let uuid = uuid::Uuid::new_v4();
    if name.is_empty() {
        uuid.to_string()
    } else {
        format!("{name}.{uuid}")
    }
}

fn rejection_reason(err: &SchedulerError) -> &'static str {
    match err {
        SchedulerError::FactoryNotFound { .. } => "factory_not_found",
        SchedulerError::WorkerPoolNotFound { .. } => "pool_not_found",
        SchedulerError::FullQueue { .. } => "full_queue",
        SchedulerError::TooManyTask => "too_many_task",
        SchedulerError::Conflict { .. } => "conflict",
        SchedulerError::TaskNotFound { .. } => "parent_not_found",
        _ => "internal",
    }
}
