//! # 数据模型
//!
//! 任务定义、状态、阶段机以及工作池和调度器的规格。
//!
//! ## 阶段流转
//! ```text
//! Waiting → Processing → Aborting → Succeed / Failed / PartiallyFailed
//!    │           │           │
//!    └───────────┴───────────┘ (超时、取消或执行结束直接进入终止阶段)
//! ```

pub mod args;
pub mod pool;
pub mod task;

pub use args::*;
pub use pool::*;
pub use task::*;
