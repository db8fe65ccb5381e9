//! 配置管理
//!
//! 加载顺序：结构体默认值 → TOML配置文件 → 环境变量（前缀 `EDGE_SCHEDULER`，分隔符 `__`）。

pub mod app_config;
pub mod database;
pub mod log_collect;
pub mod observability;
pub mod scheduler;

pub use app_config::AppConfig;
pub use database::DatabaseConfig;
pub use log_collect::LogCollectConfig;
pub use observability::ObservabilityConfig;
pub use scheduler::{default_worker_pools, SchedulerConfig};

/// 单节点日志导出命令与工作池名称
pub const DUMP_SINGLE_NODE_LOG: &str = "dumpSingleNodeLog";
/// 多节点日志导出命令与工作池名称
pub const DUMP_MULTI_NODES_LOG: &str = "dumpMultiNodesLog";
