use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{SchedulerError, SchedulerResult};

/// 工作池规格
///
/// `max_concurrency` 为同时运行的任务上限，`max_capacity` 为排队等待的任务上限。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerPoolSpec {
    pub id: String,
    pub max_concurrency: usize,
    pub max_capacity: usize,
}

impl WorkerPoolSpec {
    pub fn new(id: impl Into<String>, max_concurrency: usize, max_capacity: usize) -> Self {
        Self {
            id: id.into(),
            max_concurrency,
            max_capacity,
        }
    }

    pub fn validate(&self) -> SchedulerResult<()> {
        if self.id.is_empty() {
            return Err(SchedulerError::Configuration("工作池ID不能为空".to_string()));
        }
        if self.max_concurrency == 0 {
            return Err(SchedulerError::Configuration(format!(
                "工作池 {} 的并发数必须大于0",
                self.id
            )));
        }
        Ok(())
    }

    /// 运行与排队的总上限
    pub fn total_slots(&self) -> usize {
        self.max_concurrency.saturating_add(self.max_capacity)
    }
}

/// 调度器规格
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerSpec {
    /// 保留的已结束主任务数量
    pub max_history_master_tasks: usize,
    pub max_active_tasks: usize,
    /// 数据库中允许存在的任务总数
    pub allowed_max_tasks_in_db: u64,
    /// 状态更新请求的发送与应答超时
    pub update_timeout: Duration,
}

impl Default for SchedulerSpec {
    fn default() -> Self {
        Self {
            max_history_master_tasks: 2000,
            max_active_tasks: 200,
            allowed_max_tasks_in_db: 300_000,
            update_timeout: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_spec_validation() {
        assert!(WorkerPoolSpec::new("dumpSingleNodeLog", 16, 512).validate().is_ok());
        assert!(WorkerPoolSpec::new("", 1, 0).validate().is_err());
        assert!(WorkerPoolSpec::new("p", 0, 10).validate().is_err());
        assert_eq!(WorkerPoolSpec::new("p", 1, 1).total_slots(), 2);
    }
}
