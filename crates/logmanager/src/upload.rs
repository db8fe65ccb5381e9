//! 边缘节点日志上传接收
//!
//! 与传输层无关：调用方解析出请求头交给 [`UploadReceiver::admit`]，
//! 再把请求体作为 `AsyncRead` 交给 [`UploadReceiver::process`]。

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use edge_scheduler_core::{
    models::{TaskPhase, TaskStatusUpdate},
    SchedulerError, SchedulerResult, PROGRESS_MAX,
};
use edge_scheduler_dispatcher::{Scheduler, TaskContext};
use metrics::counter;
use sha2::{Digest, Sha256};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{error, info};

use crate::collector::LogCollector;
use crate::constants::*;
use crate::disk::{into_scheduler_error, DiskPressureWriter};
use crate::feedback::feedback_task_error;

/// 已通过校验的上传请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub task_id: String,
    pub package_size: u64,
    pub sha256_checksum: String,
    pub serial_number: String,
    pub client_ip: String,
}

pub struct UploadReceiver {
    collector: Arc<LogCollector>,
    scheduler: Scheduler,
}

impl UploadReceiver {
    pub fn new(collector: Arc<LogCollector>, scheduler: Scheduler) -> Self {
        Self {
            collector,
            scheduler,
        }
    }

    /// 校验上传请求头
    pub fn admit(
        &self,
        task_id: &str,
        package_size: &str,
        sha256_checksum: &str,
        client_ip: Option<&str>,
    ) -> SchedulerResult<UploadRequest> {
        if !self.collector.is_single_node_task_id(task_id) {
            return Err(SchedulerError::invalid_params("invalid task id"));
        }
        let size: i64 = package_size
            .trim()
            .parse()
            .map_err(|_| SchedulerError::invalid_params("invalid package size"))?;
        if size <= 0 || size as u64 > self.collector.config().upload_max_size {
            return Err(SchedulerError::invalid_params("invalid package size"));
        }
        let tokens: Vec<&str> = task_id.split('.').collect();
        if tokens.len() != 3 {
            return Err(SchedulerError::invalid_params("node serial number not found"));
        }
        let client_ip = client_ip
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| SchedulerError::invalid_params("client ip not found"))?;

        Ok(UploadRequest {
            task_id: task_id.to_string(),
            package_size: size as u64,
            sha256_checksum: sha256_checksum.to_string(),
            serial_number: tokens[1].to_string(),
            client_ip: client_ip.to_string(),
        })
    }

    /// 接收上传内容并推进子任务状态
    ///
    /// 成功后子任务为 `Succeed`；接收或校验失败时删除文件并使子任务失败。
    pub async fn process<R>(&self, request: &UploadRequest, body: R) -> SchedulerResult<()>
    where
        R: AsyncRead + Unpin,
    {
        info!(
            task_id = %request.task_id,
            "开始接收边缘节点 {}@{} 的日志", request.serial_number, request.client_ip
        );
        let ctx = self.scheduler.get_task_context(&request.task_id).await?;
        ctx.update_status(
            TaskStatusUpdate::phase(TaskPhase::Processing)
                .with_progress(PROGRESS_BEGIN_RECEIVE)
                .with_message("start to receive file from edge"),
        )
        .await?;

        let path = self.collector.upload_path(&request.task_id);
        if let Err(e) = self.receive_file(&ctx, request, body, &path).await {
            remove_file(&path).await;
            feedback_task_error(&ctx, "failed to receive file from edge").await;
            return Err(e);
        }
        if let Err(e) = verify_file(&path, &request.sha256_checksum).await {
            remove_file(&path).await;
            feedback_task_error(&ctx, "failed to verify file from edge").await;
            return Err(e);
        }

        let finished = ctx
            .update_status(
                TaskStatusUpdate::phase(TaskPhase::Succeed)
                    .with_progress(PROGRESS_MAX)
                    .with_message("receive file from edge successful"),
            )
            .await;
        if let Err(e) = finished {
            remove_file(&path).await;
            return Err(e);
        }
        counter!("edge_scheduler_upload_bytes_total").increment(request.package_size);
        info!(task_id = %request.task_id, "边缘节点 {} 的日志接收完成", request.serial_number);
        Ok(())
    }

    async fn receive_file<R>(
        &self,
        ctx: &TaskContext,
        request: &UploadRequest,
        body: R,
        path: &Path,
    ) -> SchedulerResult<()>
    where
        R: AsyncRead + Unpin,
    {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(UPLOAD_FILE_MODE)
            .open(path)
            .await?;
        let mut writer = DiskPressureWriter::new(
            file,
            path,
            self.collector.probe(),
            self.collector.thresholds(),
        );
        let mut reader = body.take(request.package_size);
        let mut buffer = vec![0u8; IO_BUFFER_SIZE];

        let total = request.package_size;
        let mut current = 0u64;
        let mut last_report_count = 0u64;
        let mut last_report: Option<Instant> = None;
        while current < total {
            let read = tokio::select! {
                read = reader.read(&mut buffer) => read?,
                _ = ctx.graceful_shutdown().cancelled() => return Err(SchedulerError::Cancelled),
            };
            if read == 0 {
                return Err(SchedulerError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("上传数据不完整: {current}/{total}"),
                )));
            }
            current += read as u64;
            writer
                .write_all(&buffer[..read])
                .await
                .map_err(into_scheduler_error)?;
            ctx.update_liveness();

            let recent = last_report.is_some_and(|at| at.elapsed() < REPORT_DURATION_THRESHOLD);
            if current - last_report_count < REPORT_SIZE_THRESHOLD && recent {
                continue;
            }
            last_report = Some(Instant::now());
            last_report_count = current;
            let received = u64::from(PROGRESS_MAX - PROGRESS_BEGIN_RECEIVE) * current / total;
            ctx.update_status(
                TaskStatusUpdate::phase(TaskPhase::Processing)
                    .with_progress(PROGRESS_BEGIN_RECEIVE + received as u8)
                    .with_message("receiving the file from edge"),
            )
            .await?;
        }

        writer.flush().await?;
        writer.into_inner().sync_all().await?;
        Ok(())
    }
}

/// 校验sha256和gzip文件头
pub async fn verify_file(path: &Path, sha256_checksum: &str) -> SchedulerResult<()> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut header = Vec::with_capacity(GZIP_MAGIC.len());
    let mut buffer = vec![0u8; IO_BUFFER_SIZE];
    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        if header.len() < GZIP_MAGIC.len() {
            let take = (GZIP_MAGIC.len() - header.len()).min(read);
            header.extend_from_slice(&buffer[..take]);
        }
        hasher.update(&buffer[..read]);
    }

    if hex::encode(hasher.finalize()) != sha256_checksum {
        return Err(SchedulerError::invalid_params("sha256 checksum error"));
    }
    if header != GZIP_MAGIC {
        return Err(SchedulerError::invalid_params("format error"));
    }
    Ok(())
}

async fn remove_file(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            error!(path = %path.display(), "删除上传文件失败: {}", e);
        }
    }
}
