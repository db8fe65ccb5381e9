use std::sync::Arc;

use async_trait::async_trait;
use edge_scheduler_core::{models::TaskStatusUpdate, SchedulerError, SchedulerResult};
use edge_scheduler_dispatcher::{TaskContext, TaskExecutor};
use tracing::{debug, info};

use crate::constants::{ARG_NODE_ID, ARG_PEER_INFO, ARG_SERIAL_NUMBER};
use crate::messenger::{DumpLogRequest, EdgeDumpMessage, EdgeMessenger, PeerInfo};

const PROGRESS_SENDING_REQUEST: u8 = 10;

/// 单节点日志收集执行器
///
/// 向边缘节点下发日志导出请求后等待上传。任务由上传接收方置为结束状态，
/// 超时或取消时返回 `Cancelled`。
pub struct DumpSingleNodeLogExecutor {
    messenger: Arc<dyn EdgeMessenger>,
}

impl DumpSingleNodeLogExecutor {
    pub fn new(messenger: Arc<dyn EdgeMessenger>) -> Self {
        Self { messenger }
    }
}

#[async_trait]
impl TaskExecutor for DumpSingleNodeLogExecutor {
    async fn execute(&self, ctx: Arc<TaskContext>) -> SchedulerResult<()> {
        let args = &ctx.spec().args;
        let serial_number: String = args.get(ARG_SERIAL_NUMBER)?;
        let node_id: u64 = args.get(ARG_NODE_ID)?;
        let peer: PeerInfo = args.get(ARG_PEER_INFO)?;

        ctx.update_status(TaskStatusUpdate::progress(
            PROGRESS_SENDING_REQUEST,
            "sending dump request to edge",
        ))
        .await?;
        // 请求发出后状态由上传接收方推进
        self.messenger
            .send_dump_request(EdgeDumpMessage {
                node_id,
                peer,
                request: DumpLogRequest::for_task(ctx.id()),
            })
            .await?;
        info!(task_id = %ctx.id(), "已向边缘节点 {} 下发日志导出请求", serial_number);

        ctx.graceful_shutdown().cancelled().await;
        if ctx.phase().is_finished() {
            debug!(task_id = %ctx.id(), "节点 {} 的日志接收结束: {}", serial_number, ctx.phase());
            return Ok(());
        }
        Err(SchedulerError::Cancelled)
    }
}
