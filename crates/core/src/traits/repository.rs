//! 任务仓储接口
//!
//! 仓储是任务状态的唯一持久化来源。调度器之外的读取都经由仓储完成，
//! 状态写入则只通过任务上下文串行地调用 [`TaskRepository::update_status`]。

use async_trait::async_trait;

use crate::models::{Task, TaskStatusUpdate, TaskTreeNode};
use crate::SchedulerResult;

#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// 插入新任务，ID重复时返回 `Conflict`
    async fn create(&self, task: &Task) -> SchedulerResult<()>;

    /// 删除任务，ID不存在不视为错误
    async fn delete(&self, id: &str) -> SchedulerResult<()>;

    /// 原子地更新任务状态
    ///
    /// 返回更新后的任务及受影响行数。任务已处于终止阶段时不做修改，
    /// 返回当前记录且受影响行数为0；任务不存在时返回 `TaskNotFound`。
    async fn update_status(
        &self,
        id: &str,
        update: &TaskStatusUpdate,
    ) -> SchedulerResult<(Task, u64)>;

    async fn get(&self, id: &str) -> SchedulerResult<Task>;

    /// 按提交顺序返回子任务
    async fn get_sub_tasks(&self, parent_id: &str) -> SchedulerResult<Vec<Task>>;

    /// 已结束的主任务，按结束时间升序
    async fn get_finished_master_tasks(&self) -> SchedulerResult<Vec<Task>>;

    async fn get_task_tree(&self, id: &str) -> SchedulerResult<TaskTreeNode>;

    /// 将上次进程遗留的未结束任务标记为失败，返回受影响行数
    async fn mark_unfinished_as_failed(&self) -> SchedulerResult<u64>;

    async fn count_tasks(&self) -> SchedulerResult<u64>;
}
