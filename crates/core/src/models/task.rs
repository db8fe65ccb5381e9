use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::args::TaskArgs;

/// 进度上限
pub const PROGRESS_MAX: u8 = 100;

/// 任务阶段
///
/// `Succeed`、`Failed`、`PartiallyFailed` 为终止阶段，进入后不可再迁移。
///
/// ```rust
/// use edge_scheduler_core::models::TaskPhase;
///
/// assert!(TaskPhase::allow_phase_trans(TaskPhase::Waiting, Some(TaskPhase::Processing), false));
/// assert!(!TaskPhase::allow_phase_trans(TaskPhase::Waiting, Some(TaskPhase::Processing), true));
/// assert!(!TaskPhase::allow_phase_trans(TaskPhase::Succeed, None, false));
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskPhase {
    Waiting,
    Processing,
    Aborting,
    Succeed,
    Failed,
    PartiallyFailed,
}

impl TaskPhase {
    pub const ALL: [TaskPhase; 6] = [
        TaskPhase::Waiting,
        TaskPhase::Processing,
        TaskPhase::Aborting,
        TaskPhase::Succeed,
        TaskPhase::Failed,
        TaskPhase::PartiallyFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPhase::Waiting => "Waiting",
            TaskPhase::Processing => "Processing",
            TaskPhase::Aborting => "Aborting",
            TaskPhase::Succeed => "Succeed",
            TaskPhase::Failed => "Failed",
            TaskPhase::PartiallyFailed => "PartiallyFailed",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            TaskPhase::Succeed | TaskPhase::Failed | TaskPhase::PartiallyFailed
        )
    }

    /// 阶段权重，终止阶段统一为3
    pub fn weight(&self) -> u8 {
        match self {
            TaskPhase::Waiting => 0,
            TaskPhase::Processing => 1,
            TaskPhase::Aborting => 2,
            TaskPhase::Succeed | TaskPhase::Failed | TaskPhase::PartiallyFailed => 3,
        }
    }

    /// 判断阶段迁移是否合法
    ///
    /// `to` 为空表示不改变阶段。终止阶段不可迁出；任意非终止阶段可以迁入终止阶段；
    /// 其余情况只允许系统内部按权重严格向前迁移，用户发起的更新不能推进阶段。
    pub fn allow_phase_trans(from: TaskPhase, to: Option<TaskPhase>, by_user: bool) -> bool {
        let to = to.unwrap_or(from);
        if from.is_finished() {
            return false;
        }
        if to.is_finished() || to == from {
            return true;
        }
        !by_user && from.weight() < to.weight()
    }
}

impl fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskPhase::ALL
            .iter()
            .copied()
            .find(|phase| phase.as_str() == s)
            .ok_or_else(|| format!("Invalid task phase: {s}"))
    }
}

impl sqlx::Type<sqlx::Sqlite> for TaskPhase {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <str as sqlx::Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for TaskPhase {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        Ok(s.parse::<TaskPhase>()?)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for TaskPhase {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Sqlite>>::encode(self.as_str(), buf)
    }
}

/// 任务定义，提交后不可变
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    pub id: String,
    pub name: String,
    pub parent_id: String,
    pub worker_pool: String,
    pub command: String,
    pub args: TaskArgs,
    /// 以下超时为零时表示禁用
    #[serde(with = "duration_nanos")]
    pub wait_timeout: Duration,
    #[serde(with = "duration_nanos")]
    pub execute_timeout: Duration,
    #[serde(with = "duration_nanos")]
    pub heartbeat_timeout: Duration,
    #[serde(with = "duration_nanos")]
    pub graceful_shutdown_timeout: Duration,
}

impl TaskSpec {
    pub fn new(command: impl Into<String>, worker_pool: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            worker_pool: worker_pool.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = parent_id.into();
        self
    }

    pub fn with_args(mut self, args: TaskArgs) -> Self {
        self.args = args;
        self
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub fn with_execute_timeout(mut self, timeout: Duration) -> Self {
        self.execute_timeout = timeout;
        self
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn with_graceful_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.graceful_shutdown_timeout = timeout;
        self
    }

    pub fn is_master(&self) -> bool {
        self.parent_id.is_empty()
    }
}

/// 任务状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    pub phase: TaskPhase,
    pub progress: u8,
    pub message: String,
    pub reason: String,
    pub data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskStatus {
    /// 新建任务的初始状态
    pub fn waiting(created_at: DateTime<Utc>) -> Self {
        Self {
            phase: TaskPhase::Waiting,
            progress: 0,
            message: String::new(),
            reason: String::new(),
            data: None,
            created_at,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.phase.is_finished()
    }
}

/// 状态更新请求
///
/// 字段为 `None` 时保持原值，`phase` 为空即只更新进度或消息。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskStatusUpdate {
    pub phase: Option<TaskPhase>,
    pub progress: Option<u8>,
    pub message: Option<String>,
    pub reason: Option<String>,
    pub data: Option<serde_json::Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskStatusUpdate {
    pub fn phase(phase: TaskPhase) -> Self {
        Self {
            phase: Some(phase),
            ..Default::default()
        }
    }

    pub fn progress(progress: u8, message: impl Into<String>) -> Self {
        Self {
            progress: Some(progress.min(PROGRESS_MAX)),
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress.min(PROGRESS_MAX));
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_started_at(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = Some(started_at);
        self
    }

    pub fn with_finished_at(mut self, finished_at: DateTime<Utc>) -> Self {
        self.finished_at = Some(finished_at);
        self
    }

    pub fn targets_finished(&self) -> bool {
        self.phase.is_some_and(|phase| phase.is_finished())
    }
}

/// 任务 = 定义 + 状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub spec: TaskSpec,
    pub status: TaskStatus,
}

impl Task {
    pub fn new(spec: TaskSpec, created_at: DateTime<Utc>) -> Self {
        Self {
            spec,
            status: TaskStatus::waiting(created_at),
        }
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }
}

/// 任务树节点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTreeNode {
    pub current: Task,
    pub children: Vec<TaskTreeNode>,
}

impl TaskTreeNode {
    pub fn leaf(task: Task) -> Self {
        Self {
            current: task,
            children: Vec::new(),
        }
    }

    /// 后序遍历收集任务ID，子节点在前
    pub fn post_order_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        self.collect_post_order(&mut ids);
        ids
    }

    fn collect_post_order(&self, ids: &mut Vec<String>) {
        for child in &self.children {
            child.collect_post_order(ids);
        }
        ids.push(self.current.spec.id.clone());
    }
}

pub(crate) mod duration_nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_nanos()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_nanos)
    }
}
