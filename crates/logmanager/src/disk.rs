//! 磁盘水位保护
//!
//! 写入日志包前检查目标文件系统的剩余空间，低于保留值时拒绝写入。

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use edge_scheduler_core::{config::LogCollectConfig, SchedulerError, SchedulerResult};
use metrics::counter;
use tokio::io::AsyncWrite;
use tracing::warn;

use crate::constants::{DISK_CHECK_INTERVAL, MIB};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskUsage {
    /// 非特权用户可用字节数
    pub free: u64,
    pub total: u64,
    pub blocks: u64,
}

/// 文件系统统计探针
pub trait DiskUsageProbe: Send + Sync {
    fn usage(&self, path: &Path) -> io::Result<DiskUsage>;
}

/// 基于 statvfs 的探针
#[derive(Debug, Default, Clone, Copy)]
pub struct StatvfsProbe;

impl DiskUsageProbe for StatvfsProbe {
    fn usage(&self, path: &Path) -> io::Result<DiskUsage> {
        let stat = nix::sys::statvfs::statvfs(path).map_err(io::Error::from)?;
        let fragment = stat.fragment_size() as u64;
        Ok(DiskUsage {
            free: (stat.blocks_available() as u64).saturating_mul(fragment),
            total: (stat.blocks() as u64).saturating_mul(fragment),
            blocks: stat.blocks() as u64,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiskThresholds {
    pub reserved_bytes: u64,
    pub reserved_rate: f64,
}

impl Default for DiskThresholds {
    fn default() -> Self {
        Self {
            reserved_bytes: 200 * MIB,
            reserved_rate: 0.20,
        }
    }
}

impl From<&LogCollectConfig> for DiskThresholds {
    fn from(config: &LogCollectConfig) -> Self {
        Self {
            reserved_bytes: config.reserved_bytes,
            reserved_rate: config.reserved_rate,
        }
    }
}

impl DiskThresholds {
    /// 写入 `required` 字节后剩余空间仍高于保留值时通过
    pub fn verify(&self, usage: DiskUsage, required: u64) -> Result<(), String> {
        if usage.free < required {
            return Err(format!("可用空间 {} 字节小于所需 {} 字节", usage.free, required));
        }
        let remain = usage.free - required;
        if remain <= self.reserved_bytes {
            return Err(format!(
                "剩余空间 {} 字节不高于保留值 {} 字节",
                remain, self.reserved_bytes
            ));
        }
        if usage.blocks == 0 || usage.total == 0 {
            return Err("文件系统总块数为0".to_string());
        }
        let rate = remain as f64 / usage.total as f64;
        if rate <= self.reserved_rate {
            return Err(format!(
                "剩余空间比例 {:.3} 不高于保留比例 {:.3}",
                rate, self.reserved_rate
            ));
        }
        Ok(())
    }
}

/// 检查 `path` 所在文件系统能否再写入 `required` 字节
pub fn check_disk_space(
    probe: &dyn DiskUsageProbe,
    path: &Path,
    required: u64,
    thresholds: DiskThresholds,
) -> SchedulerResult<()> {
    let usage = probe.usage(path)?;
    thresholds.verify(usage, required).map_err(|reason| {
        counter!("edge_scheduler_disk_pressure_rejections_total").increment(1);
        warn!(path = %path.display(), "磁盘空间不足: {}", reason);
        SchedulerError::disk_pressure(format!("{}: {}", path.display(), reason))
    })
}

/// 将写入器返回的IO错误还原为调度器错误
pub fn into_scheduler_error(err: io::Error) -> SchedulerError {
    let wrapped = err
        .get_ref()
        .is_some_and(|inner| inner.is::<SchedulerError>());
    if !wrapped {
        return SchedulerError::Io(err);
    }
    match err.into_inner().map(|inner| inner.downcast::<SchedulerError>()) {
        Some(Ok(e)) => *e,
        _ => SchedulerError::Internal("无法还原磁盘检查错误".to_string()),
    }
}

/// 带磁盘水位保护的写入器
///
/// 距上次检查累计写入达到1MiB时重新检查剩余空间，不满足时写入失败，
/// 错误可用 [`into_scheduler_error`] 还原为 `DiskPressure`。
pub struct DiskPressureWriter<W> {
    inner: W,
    path: PathBuf,
    probe: Arc<dyn DiskUsageProbe>,
    thresholds: DiskThresholds,
    current_pos: u64,
    last_check_pos: u64,
}

impl<W> DiskPressureWriter<W> {
    pub fn new(
        inner: W,
        path: impl Into<PathBuf>,
        probe: Arc<dyn DiskUsageProbe>,
        thresholds: DiskThresholds,
    ) -> Self {
        Self {
            inner,
            path: path.into(),
            probe,
            thresholds,
            current_pos: 0,
            last_check_pos: 0,
        }
    }

    pub fn written(&self) -> u64 {
        self.current_pos
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    fn guard(&self, size: usize) -> io::Result<bool> {
        let size = size as u64;
        if self.current_pos.saturating_add(size) < self.last_check_pos.saturating_add(DISK_CHECK_INTERVAL) {
            return Ok(false);
        }
        check_disk_space(self.probe.as_ref(), &self.path, size, self.thresholds)
            .map_err(io::Error::other)?;
        Ok(true)
    }

    fn advance(&mut self, written: usize, checked: bool) {
        self.current_pos += written as u64;
        if checked {
            self.last_check_pos = self.current_pos;
        }
    }
}

impl<W: Write> Write for DiskPressureWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let checked = self.guard(buf.len())?;
        let written = match self.inner.write(buf) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => 0,
            Err(e) => return Err(e),
        };
        self.advance(written, checked);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for DiskPressureWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let checked = this.guard(buf.len())?;
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.advance(n, checked);
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                this.advance(0, checked);
                Poll::Ready(Ok(0))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
