//! 多节点日志收集主任务
//!
//! 为每个节点创建子任务，等待各节点上传日志包，再把成功的日志包打成一个总包发布。

use std::sync::Arc;

use async_trait::async_trait;
use edge_scheduler_core::{
    models::{Task, TaskArgs, TaskPhase, TaskSpec, TaskStatusUpdate},
    SchedulerError, SchedulerResult, PROGRESS_MAX,
};
use edge_scheduler_dispatcher::{Scheduler, TaskContext, TaskExecutor};
use serde_json::json;
use tracing::{error, info, warn};

use crate::archive::{write_archive, ArchiveEntry};
use crate::collector::LogCollector;
use crate::constants::*;
use crate::disk::check_disk_space;
use crate::feedback::feedback_task_error;
use crate::messenger::PeerInfo;

/// 待收集日志的边缘节点
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeNode {
    pub serial_number: String,
    pub ip: String,
    pub node_id: u64,
}

/// 解析主任务参数中三个等长的节点列表
pub fn parse_edge_nodes(args: &TaskArgs) -> SchedulerResult<Vec<EdgeNode>> {
    let serial_numbers: Vec<String> = args.get(ARG_NODE_SERIAL_NUMBERS)?;
    let ips: Vec<String> = args.get(ARG_NODE_IPS)?;
    let ids: Vec<u64> = args.get(ARG_NODE_IDS)?;

    if serial_numbers.is_empty() {
        return Err(SchedulerError::invalid_params("节点列表为空"));
    }
    if serial_numbers.len() != ips.len() || serial_numbers.len() != ids.len() {
        return Err(SchedulerError::invalid_params(format!(
            "节点参数长度不一致: serialNumbers={}, ips={}, ids={}",
            serial_numbers.len(),
            ips.len(),
            ids.len()
        )));
    }

    Ok(serial_numbers
        .into_iter()
        .zip(ips)
        .zip(ids)
        .map(|((serial_number, ip), node_id)| EdgeNode {
            serial_number,
            ip,
            node_id,
        })
        .collect())
}

/// 单节点子任务的规格
pub fn single_node_task_spec(master_id: &str, node: &EdgeNode) -> SchedulerResult<TaskSpec> {
    let mut args = TaskArgs::new();
    args.insert(ARG_SERIAL_NUMBER, &node.serial_number)?;
    args.insert(ARG_NODE_ID, node.node_id)?;
    args.insert(
        ARG_PEER_INFO,
        PeerInfo {
            ip: node.ip.clone(),
            sn: node.serial_number.clone(),
        },
    )?;

    Ok(TaskSpec::new(DUMP_SINGLE_NODE_LOG, DUMP_SINGLE_NODE_LOG)
        .with_name(format!("{DUMP_SINGLE_NODE_LOG}.{}", node.serial_number))
        .with_parent(master_id)
        .with_args(args)
        .with_heartbeat_timeout(SINGLE_NODE_HEARTBEAT_TIMEOUT)
        .with_execute_timeout(SINGLE_NODE_EXECUTE_TIMEOUT))
}

/// 多节点日志收集执行器
pub struct MultiNodesLogExecutor {
    collector: Arc<LogCollector>,
}

impl MultiNodesLogExecutor {
    pub fn new(collector: Arc<LogCollector>) -> Self {
        Self { collector }
    }

    async fn dump_multi_nodes_log(&self, ctx: &TaskContext) -> SchedulerResult<()> {
        let _guard = self.collector.lock_packaging().await;

        let nodes = parse_edge_nodes(&ctx.spec().args)?;
        info!(task_id = %ctx.id(), "开始收集 {} 个边缘节点的日志", nodes.len());

        self.prepare_dirs().await?;

        let required = (nodes.len() as u64).saturating_mul(self.collector.config().upload_max_size);
        check_disk_space(
            self.collector.probe().as_ref(),
            self.collector.temp_dir(),
            required,
            self.collector.thresholds(),
        )?;

        let succeeded = self.dump_edge_logs(ctx, &nodes).await?;
        self.create_package(ctx, &succeeded).await?;

        tokio::fs::rename(
            self.collector.package_temp_path(),
            self.collector.package_public_path(),
        )
        .await?;
        info!(task_id = %ctx.id(), "日志总包已发布");

        self.finalize(ctx, succeeded.len() == nodes.len()).await
    }

    async fn prepare_dirs(&self) -> SchedulerResult<()> {
        if self.collector.run_janitor().await? {
            return Ok(());
        }
        let config = self.collector.config();
        for dir in [&config.temp_dir, &config.public_dir] {
            tokio::fs::DirBuilder::new()
                .recursive(true)
                .mode(DIR_MODE)
                .create(dir)
                .await?;
        }
        Ok(())
    }

    async fn dump_edge_logs(
        &self,
        ctx: &TaskContext,
        nodes: &[EdgeNode],
    ) -> SchedulerResult<Vec<Task>> {
        let scheduler = ctx
            .scheduler()
            .ok_or_else(|| SchedulerError::Internal("任务所属调度器已释放".to_string()))?;
        self.create_sub_tasks(&scheduler, ctx.id(), nodes).await;

        let total = nodes.len();
        let mut done = 0usize;
        let mut succeeded = Vec::new();
        let mut selector = scheduler.new_sub_task_selector(ctx.id()).await?;
        loop {
            let child = match selector.select(ctx.graceful_shutdown()).await {
                Ok(child) => child,
                Err(SchedulerError::NoRunningSubTask) => break,
                Err(e) => return Err(e),
            };

            done += 1;
            let progress = (usize::from(PROGRESS_MAX - PROGRESS_PACKAGING) * done / total) as u8;
            ctx.update_status(TaskStatusUpdate::progress(
                progress,
                format!("receiving ({done}/{total}) files"),
            ))
            .await?;

            let status = child.get_status().await?;
            if status.phase == TaskPhase::Succeed {
                succeeded.push(Task {
                    spec: child.spec().clone(),
                    status,
                });
            } else {
                warn!(task_id = %child.id(), "子任务未成功: {} {}", status.phase, status.message);
            }
        }

        if succeeded.is_empty() {
            return Err(SchedulerError::Internal(
                "none of the sub tasks succeeded".to_string(),
            ));
        }
        info!(task_id = %ctx.id(), "{}/{} 个节点日志接收成功", succeeded.len(), total);
        Ok(succeeded)
    }

    async fn create_sub_tasks(&self, scheduler: &Scheduler, master_id: &str, nodes: &[EdgeNode]) {
        for node in nodes {
            let submitted = match single_node_task_spec(master_id, node) {
                Ok(spec) => scheduler.submit_task(spec).await.map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = submitted {
                error!(
                    task_id = %master_id,
                    "为节点 {} 创建子任务失败: {}", node.serial_number, e
                );
            }
        }
    }

    async fn create_package(&self, ctx: &TaskContext, tasks: &[Task]) -> SchedulerResult<()> {
        ctx.update_status(
            TaskStatusUpdate::phase(TaskPhase::Processing)
                .with_progress(PROGRESS_PACKAGING)
                .with_message("start to create tar gz"),
        )
        .await?;

        let entries = tasks
            .iter()
            .map(|task| {
                let serial_number: String = task.spec.args.get(ARG_SERIAL_NUMBER)?;
                Ok(ArchiveEntry {
                    source: self.collector.upload_path(&task.spec.id),
                    name: format!("{serial_number}{TAR_GZ_SUFFIX}"),
                })
            })
            .collect::<SchedulerResult<Vec<_>>>()?;

        let output = self.collector.package_temp_path();
        let probe = self.collector.probe();
        let thresholds = self.collector.thresholds();
        tokio::task::spawn_blocking(move || write_archive(&output, &entries, probe, thresholds))
            .await
            .map_err(|e| SchedulerError::Internal(format!("打包任务异常退出: {e}")))??;
        info!(task_id = %ctx.id(), "日志总包创建完成");
        Ok(())
    }

    async fn finalize(&self, ctx: &TaskContext, all_succeeded: bool) -> SchedulerResult<()> {
        let data = json!({ "fileName": EDGE_NODES_TAR_GZ });
        let update = if all_succeeded {
            TaskStatusUpdate::phase(TaskPhase::Succeed)
                .with_progress(PROGRESS_MAX)
                .with_message("task succeeded")
        } else {
            TaskStatusUpdate::phase(TaskPhase::PartiallyFailed).with_message("task partially failed")
        };
        ctx.update_status(update.with_data(data)).await?;
        info!(task_id = %ctx.id(), "多节点日志收集完成");
        Ok(())
    }
}

#[async_trait]
impl TaskExecutor for MultiNodesLogExecutor {
    async fn execute(&self, ctx: Arc<TaskContext>) -> SchedulerResult<()> {
        self.collector.stop_expiry_timer();
        match self.dump_multi_nodes_log(&ctx).await {
            Ok(()) => {
                self.collector.arm_expiry_timer();
                Ok(())
            }
            Err(e) => {
                error!(task_id = %ctx.id(), "多节点日志收集失败: {}", e);
                feedback_task_error(&ctx, &e).await;
                self.collector.clean_temp_files().await;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edge_scheduler_core::models::ArgValue;

    fn master_args(sns: &[&str], ips: &[&str], ids: &[u64]) -> TaskArgs {
        let mut args = TaskArgs::new();
        args.insert(ARG_NODE_SERIAL_NUMBERS, sns).unwrap();
        args.insert(ARG_NODE_IPS, ips).unwrap();
        args.insert(ARG_NODE_IDS, ids).unwrap();
        args
    }

    #[test]
    fn test_parse_edge_nodes() {
        let nodes =
            parse_edge_nodes(&master_args(&["sn1", "sn2"], &["1.1.1.1", "2.2.2.2"], &[1, 2]))
                .unwrap();
        assert_eq!(
            nodes[1],
            EdgeNode {
                serial_number: "sn2".to_string(),
                ip: "2.2.2.2".to_string(),
                node_id: 2
            }
        );

        assert!(parse_edge_nodes(&master_args(&[], &[], &[])).is_err());
        assert!(parse_edge_nodes(&master_args(&["sn1"], &[], &[1])).is_err());
        assert!(parse_edge_nodes(&TaskArgs::new()).is_err());
    }

    #[test]
    fn test_single_node_task_spec() {
        let node = EdgeNode {
            serial_number: "sn-9".to_string(),
            ip: "9.9.9.9".to_string(),
            node_id: 9,
        };
        let spec = single_node_task_spec("master", &node).unwrap();
        assert_eq!(spec.name, "dumpSingleNodeLog.sn-9");
        assert_eq!(spec.parent_id, "master");
        assert_eq!(spec.command, DUMP_SINGLE_NODE_LOG);
        assert_eq!(spec.worker_pool, DUMP_SINGLE_NODE_LOG);
        assert_eq!(spec.heartbeat_timeout, SINGLE_NODE_HEARTBEAT_TIMEOUT);
        assert_eq!(spec.execute_timeout, SINGLE_NODE_EXECUTE_TIMEOUT);
        assert_eq!(spec.args.get::<u64>(ARG_NODE_ID).unwrap(), 9);
        assert_eq!(
            spec.args.get::<PeerInfo>(ARG_PEER_INFO).unwrap(),
            PeerInfo {
                ip: "9.9.9.9".to_string(),
                sn: "sn-9".to_string()
            }
        );
        assert_eq!(
            spec.args.raw(ARG_SERIAL_NUMBER),
            Some(&ArgValue::String("sn-9".to_string()))
        );
    }
}
