use std::sync::Arc;

use edge_scheduler_core::{traits::TaskRepository, SchedulerResult};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 历史任务清理
///
/// 每当有主任务结束，删除超出保留数量的最早结束的主任务及其整棵子树。
pub struct HouseKeeper {
    repo: Arc<dyn TaskRepository>,
    max_history_master_tasks: usize,
}

impl HouseKeeper {
    pub fn new(repo: Arc<dyn TaskRepository>, max_history_master_tasks: usize) -> Self {
        Self {
            repo,
            max_history_master_tasks,
        }
    }

    pub(crate) async fn run(self, mut task_done: mpsc::Receiver<()>, shutdown: CancellationToken) {
        info!("历史任务清理服务启动");
        self.prune_logged().await;
        loop {
            tokio::select! {
                event = task_done.recv() => {
                    if event.is_none() {
                        break;
                    }
                    self.prune_logged().await;
                }
                _ = shutdown.cancelled() => break,
            }
        }
        info!("历史任务清理服务已停止");
    }

    async fn prune_logged(&self) {
        match self.prune_history().await {
            Ok(0) => {}
            Ok(pruned) => info!("清理历史主任务 {} 个", pruned),
            Err(e) => warn!("清理历史主任务失败: {}", e),
        }
    }

    /// 返回被删除的主任务数量
    ///
    /// 子树中仍有未结束的任务时跳过该主任务。
    pub async fn prune_history(&self) -> SchedulerResult<usize> {
        let finished = self.repo.get_finished_master_tasks().await?;
        if finished.len() <= self.max_history_master_tasks {
            return Ok(0);
        }

        let excess = finished.len() - self.max_history_master_tasks;
        let mut pruned = 0;
        for master in finished.iter().take(excess) {
            let tree = self.repo.get_task_tree(&master.spec.id).await?;
            if tree_has_unfinished(&tree) {
                debug!(task_id = %master.spec.id, "子任务尚未结束，暂不清理");
                continue;
            }
            for id in tree.post_order_ids() {
                self.repo.delete(&id).await?;
            }
            pruned += 1;
        }
        Ok(pruned)
    }
}

fn tree_has_unfinished(node: &edge_scheduler_core::TaskTreeNode) -> bool {
    !node.current.status.is_finished() || node.children.iter().any(tree_has_unfinished)
}
