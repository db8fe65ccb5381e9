pub mod context;
pub mod executor;
pub mod house_keeper;
mod lifecycle;
pub mod pool;
pub mod scheduler;
pub mod selector;

pub use context::TaskContext;
pub use executor::{ExecutorFactory, FnExecutor, TaskExecutor};
pub use house_keeper::HouseKeeper;
pub use pool::{PoolStats, WorkerPool};
pub use scheduler::{default_scheduler, init_default_scheduler, Scheduler};
pub use selector::SubTaskSelector;
