use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

const MIB: u64 = 1024 * 1024;

/// 日志收集配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogCollectConfig {
    pub temp_dir: PathBuf,
    pub public_dir: PathBuf,
    /// 单个节点上传包的大小上限（字节）
    pub upload_max_size: u64,
    pub reserved_bytes: u64,
    pub reserved_rate: f64,
    pub package_expire_seconds: u64,
    pub max_dir_entries: usize,
    pub owner_uid: u32,
    pub owner_gid: u32,
}

impl Default for LogCollectConfig {
    fn default() -> Self {
        Self {
            temp_dir: PathBuf::from("/var/lib/edge-scheduler/logcollect/temp"),
            public_dir: PathBuf::from("/var/lib/edge-scheduler/logcollect/public"),
            upload_max_size: 1024 * MIB,
            reserved_bytes: 200 * MIB,
            reserved_rate: 0.20,
            package_expire_seconds: 24 * 60 * 60,
            max_dir_entries: 4096,
            owner_uid: 0,
            owner_gid: 0,
        }
    }
}

impl LogCollectConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.temp_dir.is_absolute() || !self.public_dir.is_absolute() {
            return Err(anyhow::anyhow!("临时目录和发布目录必须是绝对路径"));
        }
        if self.temp_dir == self.public_dir {
            return Err(anyhow::anyhow!("临时目录和发布目录不能相同"));
        }
        if self.upload_max_size == 0 {
            return Err(anyhow::anyhow!("上传大小上限必须大于0"));
        }
        if !(0.0..1.0).contains(&self.reserved_rate) {
            return Err(anyhow::anyhow!("磁盘保留比例必须在[0, 1)之间"));
        }
        if self.max_dir_entries == 0 {
            return Err(anyhow::anyhow!("目录项上限必须大于0"));
        }
        Ok(())
    }

    pub fn package_expire(&self) -> Duration {
        Duration::from_secs(self.package_expire_seconds)
    }
}
