use std::collections::HashSet;
use std::sync::Arc;

use edge_scheduler_core::{SchedulerError, SchedulerResult};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::context::TaskContext;
use crate::scheduler::Scheduler;

/// 子任务选择器
///
/// 按完成顺序逐个返回主任务下已结束的子任务，每个子任务只返回一次。
/// 构造前已经结束的子任务按提交顺序优先返回。非线程安全，一个主任务的执行器只使用一个实例。
pub struct SubTaskSelector {
    scheduler: Scheduler,
    master_id: String,
    events: Option<broadcast::Receiver<String>>,
    yielded: HashSet<String>,
}

impl SubTaskSelector {
    pub(crate) fn new(
        scheduler: Scheduler,
        master_id: String,
        events: Option<broadcast::Receiver<String>>,
    ) -> Self {
        Self {
            scheduler,
            master_id,
            events,
            yielded: HashSet::new(),
        }
    }

    pub fn master_id(&self) -> &str {
        &self.master_id
    }

    /// 返回下一个已结束的子任务
    ///
    /// 没有运行中的子任务时返回 `NoRunningSubTask`，`cancel` 触发时返回 `Cancelled`。
    pub async fn select(&mut self, cancel: &CancellationToken) -> SchedulerResult<Arc<TaskContext>> {
        loop {
            if let Some(id) = self.drain_pending_events() {
                return self.scheduler.get_task_context(&id).await;
            }

            let children = self.scheduler.repository().get_sub_tasks(&self.master_id).await?;
            let mut running = false;
            for child in children {
                if self.yielded.contains(&child.spec.id) {
                    continue;
                }
                if child.status.is_finished() {
                    self.yielded.insert(child.spec.id.clone());
                    return self.scheduler.get_task_context(&child.spec.id).await;
                }
                running = true;
            }
            if !running {
                return Err(SchedulerError::NoRunningSubTask);
            }

            let Some(events) = self.events.as_mut() else {
                // 主任务及其子任务的上下文都已释放，不会再有完成事件
                debug!(master_id = %self.master_id, "子任务完成事件通道已关闭");
                return Err(SchedulerError::NoRunningSubTask);
            };

            tokio::select! {
                event = events.recv() => match event {
                    Ok(id) => {
                        if self.yielded.insert(id.clone()) {
                            return self.scheduler.get_task_context(&id).await;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(master_id = %self.master_id, "丢失 {} 个子任务完成事件，重新扫描", skipped);
                    }
                    Err(RecvError::Closed) => self.events = None,
                },
                _ = cancel.cancelled() => return Err(SchedulerError::Cancelled),
            }
        }
    }

    fn drain_pending_events(&mut self) -> Option<String> {
        let events = self.events.as_mut()?;
        loop {
            match events.try_recv() {
                Ok(id) => {
                    if self.yielded.insert(id.clone()) {
                        return Some(id);
                    }
                }
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Closed) => {
                    self.events = None;
                    return None;
                }
            }
        }
    }
}
