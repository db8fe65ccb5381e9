use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use edge_scheduler_core::{config::LogCollectConfig, SchedulerError, SchedulerResult};
use tracing::{debug, info};

/// 日志收集临时文件清理
///
/// 清空临时目录和发布目录的直接子项。目录本身必须归属指定用户且不允许组和其他用户写入，
/// 目录项不能是符号链接。
#[derive(Debug, Clone)]
pub struct TempFileJanitor {
    temp_dir: PathBuf,
    public_dir: PathBuf,
    max_entries: usize,
    owner_uid: u32,
    owner_gid: u32,
}

impl TempFileJanitor {
    pub fn new(config: &LogCollectConfig) -> Self {
        Self {
            temp_dir: config.temp_dir.clone(),
            public_dir: config.public_dir.clone(),
            max_entries: config.max_dir_entries,
            owner_uid: config.owner_uid,
            owner_gid: config.owner_gid,
        }
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn public_dir(&self) -> &Path {
        &self.public_dir
    }

    /// 清理两个目录的内容
    ///
    /// 任一目录不存在时返回 `Ok(false)`，全部清理完成返回 `Ok(true)`。
    pub fn clean_temp_files(&self) -> SchedulerResult<bool> {
        for dir in [&self.temp_dir, &self.public_dir] {
            if !dir.exists() {
                debug!(dir = %dir.display(), "目录不存在，跳过清理");
                return Ok(false);
            }
            self.clean_dir(dir)?;
        }
        info!("日志收集临时文件已清理");
        Ok(true)
    }

    fn clean_dir(&self, dir: &Path) -> SchedulerResult<()> {
        self.check_dir(dir)?;

        let mut entries = Vec::new();
        for entry in fs::read_dir(dir)? {
            if entries.len() >= self.max_entries {
                return Err(SchedulerError::Internal(format!(
                    "目录 {} 的子项超过 {} 个",
                    dir.display(),
                    self.max_entries
                )));
            }
            let entry = entry?;
            if entry.file_type()?.is_symlink() {
                return Err(SchedulerError::Internal(format!(
                    "目录 {} 中存在符号链接 {}",
                    dir.display(),
                    entry.file_name().to_string_lossy()
                )));
            }
            entries.push(entry);
        }

        for entry in entries {
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                fs::remove_dir_all(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
            debug!(path = %path.display(), "删除临时文件");
        }
        Ok(())
    }

    fn check_dir(&self, dir: &Path) -> SchedulerResult<()> {
        let meta = fs::symlink_metadata(dir)?;
        if meta.file_type().is_symlink() || !meta.is_dir() {
            return Err(SchedulerError::Internal(format!(
                "{} 不是普通目录",
                dir.display()
            )));
        }
        if meta.mode() & 0o022 != 0 {
            return Err(SchedulerError::Internal(format!(
                "目录 {} 的权限 {:o} 允许组或其他用户写入",
                dir.display(),
                meta.mode() & 0o777
            )));
        }
        if meta.uid() != self.owner_uid || meta.gid() != self.owner_gid {
            return Err(SchedulerError::Internal(format!(
                "目录 {} 的属主 {}:{} 不符合要求",
                dir.display(),
                meta.uid(),
                meta.gid()
            )));
        }
        Ok(())
    }
}
