use std::time::Duration;

pub use edge_scheduler_core::config::{DUMP_MULTI_NODES_LOG, DUMP_SINGLE_NODE_LOG};

pub const MIB: u64 = 1024 * 1024;

/// 主任务打包产物的文件名
pub const EDGE_NODES_TAR_GZ: &str = "edgeNodes.tar.gz";
pub const TAR_GZ_SUFFIX: &str = ".tar.gz";

/// 单节点任务ID，即边缘侧上传时携带的Task-Id
pub const SINGLE_NODE_TASK_ID_PATTERN: &str = r"^dumpSingleNodeLog[-_a-zA-Z0-9.]{1,128}$";

pub const ARG_NODE_SERIAL_NUMBERS: &str = "nodeSerialNumbers";
pub const ARG_NODE_IPS: &str = "nodeIps";
pub const ARG_NODE_IDS: &str = "nodeIDs";
pub const ARG_SERIAL_NUMBER: &str = "serialNumber";
pub const ARG_NODE_ID: &str = "nodeId";
pub const ARG_PEER_INFO: &str = "peerInfo";

pub const SINGLE_NODE_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);
pub const SINGLE_NODE_EXECUTE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// 主任务进入打包阶段时的进度，子任务开始接收文件时的进度
pub const PROGRESS_PACKAGING: u8 = 50;
pub const PROGRESS_BEGIN_RECEIVE: u8 = 50;

pub const DISK_CHECK_INTERVAL: u64 = MIB;
pub const IO_BUFFER_SIZE: usize = MIB as usize;
pub const REPORT_SIZE_THRESHOLD: u64 = MIB;
pub const REPORT_DURATION_THRESHOLD: Duration = Duration::from_secs(20);

pub const GZIP_MAGIC: [u8; 3] = [0x1F, 0x8B, 0x08];

pub const DIR_MODE: u32 = 0o700;
pub const PACKAGE_FILE_MODE: u32 = 0o400;
pub const UPLOAD_FILE_MODE: u32 = 0o600;
