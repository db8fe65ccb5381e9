use thiserror::Error;

/// 调度器错误类型定义
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("没有正在运行的子任务")]
    NoRunningSubTask,

    #[error("状态更新未影响任何记录")]
    NoRowsAffected,

    #[error("任务已结束")]
    AlreadyFinished,

    #[error("操作超时: {0}")]
    Timeout(String),

    #[error("任务未找到: {id}")]
    TaskNotFound { id: String },

    #[error("执行器工厂未找到: {command}")]
    FactoryNotFound { command: String },

    #[error("工作池未找到: {pool}")]
    WorkerPoolNotFound { pool: String },

    #[error("工作池队列已满: {pool}")]
    FullQueue { pool: String },

    #[error("活跃任务数已达上限")]
    TooManyTask,

    #[error("任务ID冲突: {id}")]
    Conflict { id: String },

    #[error("任务已取消")]
    Cancelled,

    #[error("磁盘空间不足: {0}")]
    DiskPressure(String),

    #[error("无效的任务参数: {0}")]
    InvalidTaskParams(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 统一的Result类型
pub type Result<T> = std::result::Result<T, SchedulerError>;

impl SchedulerError {
    pub fn task_not_found<S: Into<String>>(id: S) -> Self {
        Self::TaskNotFound { id: id.into() }
    }
    pub fn invalid_params<S: Into<String>>(msg: S) -> Self {
        Self::InvalidTaskParams(msg.into())
    }
    pub fn timeout_error<S: Into<String>>(msg: S) -> Self {
        Self::Timeout(msg.into())
    }
    pub fn disk_pressure<S: Into<String>>(msg: S) -> Self {
        Self::DiskPressure(msg.into())
    }
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SchedulerError::Database(_)
                | SchedulerError::Timeout(_)
                | SchedulerError::FullQueue { .. }
                | SchedulerError::TooManyTask
        )
    }
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SchedulerError::Internal(_) | SchedulerError::Configuration(_)
        )
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(SchedulerError::TooManyTask.is_retryable());
        assert!(SchedulerError::timeout_error("update").is_retryable());
        assert!(!SchedulerError::AlreadyFinished.is_retryable());
        assert!(SchedulerError::Internal("boom".into()).is_fatal());
        assert!(!SchedulerError::Cancelled.is_fatal());
    }

    #[test]
    fn test_error_display_keeps_identifier() {
        let err = SchedulerError::task_not_found("dumpMultiNodesLog.abc");
        assert!(err.to_string().contains("dumpMultiNodesLog.abc"));
    }
}
