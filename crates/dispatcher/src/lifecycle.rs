//! 任务生命周期协程
//!
//! 依次运行等待、执行、中止三个阶段循环，是任务状态的唯一写入者。

use std::future::pending;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use edge_scheduler_core::{
    models::{TaskPhase, TaskSpec, TaskStatusUpdate, PROGRESS_MAX},
    traits::TaskRepository,
    SchedulerError,
};
use metrics::counter;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{Instant, Sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::{UpdateKind, UpdateReply, UpdateRequest};
use crate::scheduler::SchedulerInner;

pub(crate) const MSG_WAIT_TIMEOUT: &str = "task wait timeout";
pub(crate) const MSG_CANCELLED_BEFORE_START: &str = "task cancelled before start";
pub(crate) const MSG_EXECUTE_TIMEOUT: &str = "task execute timeout";
pub(crate) const MSG_HEARTBEAT_TIMEOUT: &str = "task heartbeat timeout";
pub(crate) const MSG_CANCELLED: &str = "task cancelled";
pub(crate) const MSG_GRACEFUL_TIMEOUT: &str = "graceful shutdown timeout";
pub(crate) const MSG_EXITED_DURING_ABORT: &str = "executor exited during graceful shutdown";

/// 零时长表示禁用，禁用的定时器永不触发
fn timer(duration: Duration) -> Option<Pin<Box<Sleep>>> {
    (!duration.is_zero()).then(|| Box::pin(tokio::time::sleep(duration)))
}

async fn expired(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => pending::<()>().await,
    }
}

pub(crate) struct TaskLifecycle {
    pub spec: TaskSpec,
    pub repo: Arc<dyn TaskRepository>,
    pub phase: TaskPhase,
    pub phase_tx: watch::Sender<TaskPhase>,
    pub updates: mpsc::Receiver<UpdateRequest>,
    pub heartbeats: mpsc::Receiver<()>,
    pub main_token: CancellationToken,
    pub graceful_token: CancellationToken,
    pub shutdown_token: CancellationToken,
    pub parent_events: Option<broadcast::Sender<String>>,
    pub scheduler: Weak<SchedulerInner>,
}

impl TaskLifecycle {
    pub async fn run(mut self) {
        debug!(task_id = %self.spec.id, "任务生命周期开始");
        self.on_waiting().await;
        self.on_processing().await;
        self.on_aborting().await;
        self.finish().await;
    }

    async fn on_waiting(&mut self) {
        let mut wait_timer = timer(self.spec.wait_timeout);
        while self.phase == TaskPhase::Waiting {
            tokio::select! {
                Some(request) = self.updates.recv() => self.handle_request(request).await,
                _ = self.main_token.cancelled() => {
                    self.forced_shutdown(MSG_CANCELLED_BEFORE_START).await;
                }
                _ = expired(&mut wait_timer) => {
                    self.forced_shutdown(MSG_WAIT_TIMEOUT).await;
                }
            }
        }
    }

    async fn on_processing(&mut self) {
        if self.phase == TaskPhase::Processing {
            let heartbeat_timeout = self.spec.heartbeat_timeout;
            let mut heartbeat_timer = timer(heartbeat_timeout);
            let mut execute_timer = timer(self.spec.execute_timeout);

            while self.phase == TaskPhase::Processing {
                tokio::select! {
                    Some(request) = self.updates.recv() => self.handle_request(request).await,
                    Some(()) = self.heartbeats.recv() => {
                        if let Some(sleep) = heartbeat_timer.as_mut() {
                            sleep.as_mut().reset(Instant::now() + heartbeat_timeout);
                        }
                    }
                    _ = expired(&mut heartbeat_timer) => {
                        self.graceful_shutdown(MSG_HEARTBEAT_TIMEOUT).await;
                    }
                    _ = expired(&mut execute_timer) => {
                        self.graceful_shutdown(MSG_EXECUTE_TIMEOUT).await;
                    }
                    _ = self.main_token.cancelled() => {
                        self.graceful_shutdown(MSG_CANCELLED).await;
                    }
                }
            }
        }
        // 离开执行阶段时取消主作用域，尚在运行的子任务随之中止
        self.main_token.cancel();
    }

    async fn on_aborting(&mut self) {
        if self.phase != TaskPhase::Aborting {
            return;
        }
        self.graceful_token.cancel();

        if self.spec.graceful_shutdown_timeout.is_zero() {
            self.forced_shutdown(MSG_GRACEFUL_TIMEOUT).await;
        }
        let mut graceful_timer = timer(self.spec.graceful_shutdown_timeout);
        while self.phase == TaskPhase::Aborting {
            tokio::select! {
                Some(request) = self.updates.recv() => self.handle_request(request).await,
                _ = expired(&mut graceful_timer) => {
                    self.forced_shutdown(MSG_GRACEFUL_TIMEOUT).await;
                }
            }
        }
    }

    async fn finish(mut self) {
        self.graceful_token.cancel();
        self.updates.close();
        while let Ok(request) = self.updates.try_recv() {
            let _ = request.reply.send(Err(SchedulerError::AlreadyFinished));
        }
        self.heartbeats.close();
        self.shutdown_token.cancel();

        counter!("edge_scheduler_tasks_finished_total", "phase" => self.phase.as_str())
            .increment(1);
        info!(task_id = %self.spec.id, phase = %self.phase, "任务生命周期结束");

        if let Some(inner) = self.scheduler.upgrade() {
            inner.task_finished(&self.spec).await;
        }
        if let Some(parent_events) = &self.parent_events {
            let _ = parent_events.send(self.spec.id.clone());
        }
    }

    async fn handle_request(&mut self, request: UpdateRequest) {
        let reply = match request.kind {
            UpdateKind::Status { update, by_user } => self.apply(update, by_user).await,
            UpdateKind::ExecutorExited(outcome) => self.on_executor_exited(outcome).await,
        };
        let _ = request.reply.send(reply);
    }

    async fn on_executor_exited(&mut self, outcome: Result<(), String>) -> UpdateReply {
        let update = match (self.phase, outcome) {
            (TaskPhase::Processing, Ok(())) => TaskStatusUpdate::phase(TaskPhase::Succeed)
                .with_progress(PROGRESS_MAX),
            (TaskPhase::Aborting, Ok(())) => {
                TaskStatusUpdate::phase(TaskPhase::Failed).with_message(MSG_EXITED_DURING_ABORT)
            }
            (phase, Err(message)) if !phase.is_finished() => {
                TaskStatusUpdate::phase(TaskPhase::Failed).with_message(message)
            }
            (TaskPhase::Waiting, Ok(())) => {
                TaskStatusUpdate::phase(TaskPhase::Failed).with_message(MSG_EXITED_DURING_ABORT)
            }
            _ => return Err(SchedulerError::AlreadyFinished),
        };
        self.apply(update, false).await
    }

    async fn graceful_shutdown(&mut self, message: &str) {
        warn!(task_id = %self.spec.id, "任务进入优雅停止: {}", message);
        let update = TaskStatusUpdate::phase(TaskPhase::Aborting).with_message(message);
        if let Err(e) = self.apply(update, false).await {
            warn!(task_id = %self.spec.id, "更新任务为中止状态失败: {}", e);
        }
    }

    async fn forced_shutdown(&mut self, message: &str) {
        warn!(task_id = %self.spec.id, "任务被强制结束: {}", message);
        let update = TaskStatusUpdate::phase(TaskPhase::Failed).with_message(message);
        if let Err(e) = self.apply(update, false).await {
            warn!(task_id = %self.spec.id, "更新任务为失败状态失败: {}", e);
        }
    }

    /// 校验阶段迁移并写入存储
    ///
    /// 存储成功时以返回的记录为准；存储失败时系统更新仍推进到目标阶段，避免任务卡住。
    async fn apply(&mut self, mut update: TaskStatusUpdate, by_user: bool) -> UpdateReply {
        if !TaskPhase::allow_phase_trans(self.phase, update.phase, by_user) {
            debug!(
                task_id = %self.spec.id,
                "拒绝阶段迁移: {} -> {:?}, 用户发起: {}",
                self.phase, update.phase, by_user
            );
            return Err(SchedulerError::AlreadyFinished);
        }
        // 时间戳只由调度器填写
        if by_user {
            update.started_at = None;
            update.finished_at = None;
        }
        if update.targets_finished() {
            update.finished_at.get_or_insert_with(Utc::now);
        } else {
            update.finished_at = None;
        }

        match self.repo.update_status(&self.spec.id, &update).await {
            Ok((task, rows)) => {
                self.set_phase(task.status.phase);
                Ok((task.status, rows))
            }
            Err(e) => {
                warn!(task_id = %self.spec.id, "写入任务状态失败: {}", e);
                if !by_user {
                    if let Some(phase) = update.phase {
                        self.set_phase(phase);
                    }
                }
                Err(e)
            }
        }
    }

    fn set_phase(&mut self, phase: TaskPhase) {
        if self.phase != phase {
            debug!(task_id = %self.spec.id, "阶段迁移: {} -> {}", self.phase, phase);
            self.phase = phase;
            self.phase_tx.send_replace(phase);
        }
    }
}
