use std::fmt::Display;

use edge_scheduler_core::models::{TaskPhase, TaskStatusUpdate};
use edge_scheduler_dispatcher::TaskContext;
use tracing::error;

/// 将错误写回任务状态，任务随之失败
pub async fn feedback_task_error(ctx: &TaskContext, err: impl Display) {
    let message = err.to_string();
    let update = TaskStatusUpdate::phase(TaskPhase::Failed).with_message(message.clone());
    if let Err(e) = ctx.update_status(update).await {
        error!(task_id = %ctx.id(), "反馈任务错误失败: {}, 原始错误: {}", e, message);
    }
}
