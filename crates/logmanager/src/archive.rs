//! 多节点日志打包
//!
//! 输出为 gzip 压缩的 tar 包，每个成功的节点一个条目，条目内容即节点上传的原始文件。

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use edge_scheduler_core::{SchedulerError, SchedulerResult};
use flate2::{write::GzEncoder, Compression};
use tar::{Builder, EntryType, Header};
use tracing::{debug, error};

use crate::constants::PACKAGE_FILE_MODE;
use crate::disk::{into_scheduler_error, DiskPressureWriter, DiskThresholds, DiskUsageProbe};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// 节点上传的文件，写入后删除
    pub source: PathBuf,
    /// 包内条目名
    pub name: String,
}

/// 独占创建 `output` 并写入全部条目
///
/// 每个源文件加入包后即被删除，无论加入是否成功。
pub fn write_archive(
    output: &Path,
    entries: &[ArchiveEntry],
    probe: Arc<dyn DiskUsageProbe>,
    thresholds: DiskThresholds,
) -> SchedulerResult<()> {
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(PACKAGE_FILE_MODE)
        .open(output)?;
    let writer = DiskPressureWriter::new(file, output, probe, thresholds);
    let mut builder = Builder::new(GzEncoder::new(writer, Compression::fast()));

    for entry in entries {
        let appended = append_entry(&mut builder, entry);
        if let Err(e) = fs::remove_file(&entry.source) {
            error!(path = %entry.source.display(), "删除临时文件失败: {}", e);
        }
        appended?;
    }

    let encoder = builder.into_inner().map_err(into_scheduler_error)?;
    let mut writer = encoder.finish().map_err(into_scheduler_error)?;
    writer.flush()?;
    writer.into_inner().sync_all()?;
    Ok(())
}

fn append_entry<W: Write>(builder: &mut Builder<W>, entry: &ArchiveEntry) -> SchedulerResult<()> {
    let meta = fs::symlink_metadata(&entry.source)?;
    if !meta.file_type().is_file() {
        return Err(SchedulerError::Internal(format!(
            "{} 不是普通文件",
            entry.source.display()
        )));
    }

    let mut source = File::open(&entry.source)?;
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_size(meta.len());
    header.set_mode(0o600);
    header.set_mtime(
        meta.modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or_default(),
    );
    builder
        .append_data(&mut header, &entry.name, &mut source)
        .map_err(into_scheduler_error)?;
    debug!(name = %entry.name, size = meta.len(), "加入打包条目");
    Ok(())
}
