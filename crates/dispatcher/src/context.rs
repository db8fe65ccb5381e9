//! 任务上下文
//!
//! 每个存活任务拥有一个上下文和一个生命周期协程。上下文是对外的句柄，
//! 所有状态变更都经由容量为1的更新通道交给生命周期协程串行处理。
//! 生命周期结束后通道关闭，此后的更新请求返回 `AlreadyFinished`。

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use edge_scheduler_core::{
    models::{Task, TaskPhase, TaskSpec, TaskStatus, TaskStatusUpdate, TaskTreeNode},
    traits::TaskRepository,
    SchedulerError, SchedulerResult,
};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::lifecycle::TaskLifecycle;
use crate::scheduler::{Scheduler, SchedulerInner};

const SUB_TASK_EVENT_CAPACITY: usize = 1024;

pub(crate) type UpdateReply = SchedulerResult<(TaskStatus, u64)>;

pub(crate) enum UpdateKind {
    Status {
        update: TaskStatusUpdate,
        by_user: bool,
    },
    /// 执行器返回，`Err` 携带错误或panic信息
    ExecutorExited(Result<(), String>),
}

pub(crate) struct UpdateRequest {
    pub kind: UpdateKind,
    pub reply: oneshot::Sender<UpdateReply>,
}

pub struct TaskContext {
    spec: TaskSpec,
    repo: Arc<dyn TaskRepository>,
    main_token: CancellationToken,
    graceful_token: CancellationToken,
    shutdown_token: CancellationToken,
    updates: Option<mpsc::Sender<UpdateRequest>>,
    heartbeats: Option<mpsc::Sender<()>>,
    phase: watch::Receiver<TaskPhase>,
    sub_task_events: Option<broadcast::Sender<String>>,
    scheduler: Weak<SchedulerInner>,
    update_timeout: Duration,
}

pub(crate) struct LiveContextParams {
    pub spec: TaskSpec,
    pub repo: Arc<dyn TaskRepository>,
    /// 父任务的主取消域，主任务则为调度器根取消域
    pub parent_token: CancellationToken,
    /// 父任务的子任务完成事件通道
    pub parent_events: Option<broadcast::Sender<String>>,
    pub scheduler: Weak<SchedulerInner>,
    pub update_timeout: Duration,
}

impl TaskContext {
    /// 创建存活上下文及其生命周期协程，协程需由调用方启动
    pub(crate) fn new_live(params: LiveContextParams) -> (Arc<Self>, TaskLifecycle) {
        let (update_tx, update_rx) = mpsc::channel(1);
        let (heartbeat_tx, heartbeat_rx) = mpsc::channel(1);
        let (phase_tx, phase_rx) = watch::channel(TaskPhase::Waiting);

        let main_token = params.parent_token.child_token();
        let graceful_token = CancellationToken::new();
        let shutdown_token = CancellationToken::new();
        let sub_task_events = params
            .spec
            .is_master()
            .then(|| broadcast::channel(SUB_TASK_EVENT_CAPACITY).0);

        let ctx = Arc::new(Self {
            spec: params.spec.clone(),
            repo: params.repo.clone(),
            main_token: main_token.clone(),
            graceful_token: graceful_token.clone(),
            shutdown_token: shutdown_token.clone(),
            updates: Some(update_tx),
            heartbeats: Some(heartbeat_tx),
            phase: phase_rx,
            sub_task_events,
            scheduler: params.scheduler.clone(),
            update_timeout: params.update_timeout,
        });

        let lifecycle = TaskLifecycle {
            spec: params.spec,
            repo: params.repo,
            phase: TaskPhase::Waiting,
            phase_tx,
            updates: update_rx,
            heartbeats: heartbeat_rx,
            main_token,
            graceful_token,
            shutdown_token,
            parent_events: params.parent_events,
            scheduler: params.scheduler,
        };
        (ctx, lifecycle)
    }

    /// 由存储记录构造的历史上下文，只支持读操作
    pub fn historical(task: Task, repo: Arc<dyn TaskRepository>) -> Arc<Self> {
        let main_token = CancellationToken::new();
        let graceful_token = CancellationToken::new();
        let shutdown_token = CancellationToken::new();
        main_token.cancel();
        graceful_token.cancel();
        shutdown_token.cancel();
        let (_, phase_rx) = watch::channel(task.status.phase);

        Arc::new(Self {
            spec: task.spec,
            repo,
            main_token,
            graceful_token,
            shutdown_token,
            updates: None,
            heartbeats: None,
            phase: phase_rx,
            sub_task_events: None,
            scheduler: Weak::new(),
            update_timeout: Duration::ZERO,
        })
    }

    pub fn spec(&self) -> &TaskSpec {
        &self.spec
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    /// 优雅停止信号，进入 `Aborting` 或任务结束时触发
    pub fn graceful_shutdown(&self) -> &CancellationToken {
        &self.graceful_token
    }

    /// 生命周期结束信号
    pub fn done(&self) -> &CancellationToken {
        &self.shutdown_token
    }

    /// 生命周期协程观察到的当前阶段
    pub fn phase(&self) -> TaskPhase {
        *self.phase.borrow()
    }

    pub fn is_live(&self) -> bool {
        !self.shutdown_token.is_cancelled()
    }

    /// 所属调度器，历史上下文或调度器已释放时为空
    pub fn scheduler(&self) -> Option<Scheduler> {
        self.scheduler.upgrade().map(Scheduler::from_inner)
    }

    /// 上报存活心跳，通道已满或已关闭时直接丢弃
    pub fn update_liveness(&self) {
        if let Some(heartbeats) = &self.heartbeats {
            let _ = heartbeats.try_send(());
        }
    }

    /// 执行器发起的状态更新
    ///
    /// 用户更新不能推进阶段，只能写入终止阶段或保持当前阶段。
    /// 受影响行数为0时返回 `NoRowsAffected`。
    pub async fn update_status(&self, update: TaskStatusUpdate) -> SchedulerResult<TaskStatus> {
        if !self.spec.heartbeat_timeout.is_zero() && !self.phase().is_finished() {
            self.update_liveness();
        }
        let (status, rows) = self
            .request(UpdateKind::Status {
                update,
                by_user: true,
            })
            .await?;
        if rows == 0 {
            return Err(SchedulerError::NoRowsAffected);
        }
        Ok(status)
    }

    pub async fn get_status(&self) -> SchedulerResult<TaskStatus> {
        Ok(self.repo.get(&self.spec.id).await?.status)
    }

    pub async fn get_sub_task_tree(&self) -> SchedulerResult<TaskTreeNode> {
        self.repo.get_task_tree(&self.spec.id).await
    }

    /// 取消任务：等待中的任务直接失败，执行中的任务进入优雅停止
    pub fn cancel(&self) {
        debug!(task_id = %self.spec.id, "取消任务");
        self.main_token.cancel();
    }

    pub(crate) fn main_token(&self) -> &CancellationToken {
        &self.main_token
    }

    pub(crate) fn sub_task_events(&self) -> Option<&broadcast::Sender<String>> {
        self.sub_task_events.as_ref()
    }

    /// 系统内部的状态迁移，允许按权重向前推进阶段
    pub(crate) async fn system_update(&self, update: TaskStatusUpdate) -> UpdateReply {
        self.request(UpdateKind::Status {
            update,
            by_user: false,
        })
        .await
    }

    pub(crate) async fn executor_exited(&self, outcome: Result<(), String>) -> UpdateReply {
        self.request(UpdateKind::ExecutorExited(outcome)).await
    }

    async fn request(&self, kind: UpdateKind) -> UpdateReply {
        let updates = self.updates.as_ref().ok_or(SchedulerError::AlreadyFinished)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = UpdateRequest {
            kind,
            reply: reply_tx,
        };

        match tokio::time::timeout(self.update_timeout, updates.send(request)).await {
            Err(_) => {
                return Err(SchedulerError::timeout_error(format!(
                    "发送任务 {} 的状态更新请求",
                    self.spec.id
                )))
            }
            Ok(Err(_)) => return Err(SchedulerError::AlreadyFinished),
            Ok(Ok(())) => {}
        }

        match tokio::time::timeout(self.update_timeout, reply_rx).await {
            Err(_) => Err(SchedulerError::timeout_error(format!(
                "等待任务 {} 的状态更新应答",
                self.spec.id
            ))),
            Ok(Err(_)) => Err(SchedulerError::AlreadyFinished),
            Ok(Ok(reply)) => reply,
        }
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("id", &self.spec.id)
            .field("phase", &self.phase())
            .field("live", &self.is_live())
            .finish()
    }
}

/// 进入执行阶段的请求
pub(crate) fn start_processing() -> TaskStatusUpdate {
    TaskStatusUpdate::phase(TaskPhase::Processing).with_started_at(Utc::now())
}
