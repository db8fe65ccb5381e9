//! 边缘节点日志收集
//!
//! 主任务 `dumpMultiNodesLog` 为每个节点创建 `dumpSingleNodeLog` 子任务，
//! 节点通过上传接口回传日志包，主任务汇总打包后发布到公共目录。

pub mod archive;
pub mod collector;
pub mod constants;
pub mod disk;
pub mod feedback;
pub mod janitor;
pub mod messenger;
pub mod multi_nodes;
pub mod single_node;
pub mod upload;

use std::sync::Arc;

use edge_scheduler_dispatcher::{ExecutorFactory, Scheduler};

pub use collector::LogCollector;
pub use constants::{DUMP_MULTI_NODES_LOG, DUMP_SINGLE_NODE_LOG, EDGE_NODES_TAR_GZ};
pub use disk::{check_disk_space, DiskPressureWriter, DiskThresholds, DiskUsage, DiskUsageProbe, StatvfsProbe};
pub use feedback::feedback_task_error;
pub use janitor::TempFileJanitor;
pub use messenger::{ChannelEdgeMessenger, DumpLogRequest, EdgeDumpMessage, EdgeMessenger, PeerInfo};
pub use multi_nodes::MultiNodesLogExecutor;
pub use single_node::DumpSingleNodeLogExecutor;
pub use upload::{UploadReceiver, UploadRequest};

/// 注册两个日志收集执行器工厂，均注册成功时返回true
pub async fn register_log_executors(
    scheduler: &Scheduler,
    collector: Arc<LogCollector>,
    messenger: Arc<dyn EdgeMessenger>,
) -> bool {
    let multi = scheduler
        .register_executor_factory(ExecutorFactory::new(DUMP_MULTI_NODES_LOG, move || {
            Box::new(MultiNodesLogExecutor::new(collector.clone()))
        }))
        .await;
    let single = scheduler
        .register_executor_factory(ExecutorFactory::new(DUMP_SINGLE_NODE_LOG, move || {
            Box::new(DumpSingleNodeLogExecutor::new(messenger.clone()))
        }))
        .await;
    multi && single
}
