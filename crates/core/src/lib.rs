pub mod config;
pub mod errors;
pub mod models;
pub mod traits;

pub use errors::*;
pub use models::{
    ArgValue, SchedulerSpec, Task, TaskArgs, TaskPhase, TaskSpec, TaskStatus, TaskStatusUpdate,
    TaskTreeNode, WorkerPoolSpec, PROGRESS_MAX,
};
pub use traits::TaskRepository;

/// 统一的Result类型
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;
