use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{DUMP_MULTI_NODES_LOG, DUMP_SINGLE_NODE_LOG};
use crate::models::{SchedulerSpec, WorkerPoolSpec};

/// 调度器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_history_master_tasks: usize,
    pub max_active_tasks: usize,
    pub allowed_max_tasks_in_db: u64,
    pub update_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let spec = SchedulerSpec::default();
        Self {
            max_history_master_tasks: spec.max_history_master_tasks,
            max_active_tasks: spec.max_active_tasks,
            allowed_max_tasks_in_db: spec.allowed_max_tasks_in_db,
            update_timeout_ms: spec.update_timeout.as_millis() as u64,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_active_tasks == 0 {
            return Err(anyhow::anyhow!("最大活跃任务数必须大于0"));
        }
        if self.allowed_max_tasks_in_db == 0 {
            return Err(anyhow::anyhow!("数据库任务上限必须大于0"));
        }
        if self.update_timeout_ms == 0 {
            return Err(anyhow::anyhow!("状态更新超时时间必须大于0"));
        }
        Ok(())
    }

    pub fn to_spec(&self) -> SchedulerSpec {
        SchedulerSpec {
            max_history_master_tasks: self.max_history_master_tasks,
            max_active_tasks: self.max_active_tasks,
            allowed_max_tasks_in_db: self.allowed_max_tasks_in_db,
            update_timeout: Duration::from_millis(self.update_timeout_ms),
        }
    }
}

/// 日志收集默认注册的工作池
pub fn default_worker_pools() -> Vec<WorkerPoolSpec> {
    vec![
        WorkerPoolSpec::new(DUMP_MULTI_NODES_LOG, 1, 10),
        WorkerPoolSpec::new(DUMP_SINGLE_NODE_LOG, 16, 512),
    ]
}
