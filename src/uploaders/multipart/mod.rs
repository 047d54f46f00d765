pub mod parts;

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use bytes::Bytes;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use crate::core::{
    FileSource,
    MultipartConfig,
    PartPayload,
    PartRange,
    PartReport,
    PartResult,
    Result,
    SessionId,
    UploadBackend,
    UploadError,
    UploadEvent,
    UploadMetadata,
    UploadOutcome,
    UploadSession,
    UploadState,
};
use crate::progress::ProgressTracker;
use crate::utils::{retry_with_config, RetryConfig};
use self::parts::{ordered_parts, part_count};

/// 分片传输时只读的会话信息，可以在多个并发分片之间共享
struct PartContext {
    session_id: SessionId,
    video_id: String,
    upload_id: String,
    path: PathBuf,
    content_type: String,
    tracker: Arc<ProgressTracker>,
    cancellation_token: CancellationToken,
}

/// 分片上传器
///
/// 负责一次上传的完整流程：注册上传、逐个分片获取预签名地址并直传对象存储、回报进度、
/// 最后合并分片并写入元数据，或者取消上传。
pub struct MultipartUploader {
    backend: Arc<dyn UploadBackend>,
    config: MultipartConfig,
    retry: RetryConfig,
    event_tx: broadcast::Sender<UploadEvent>,
}

impl MultipartUploader {
    pub fn new(backend: Arc<dyn UploadBackend>, config: MultipartConfig) -> Self {
        let retry = RetryConfig::with_retries(config.max_retries, config.retry_delay);
        // 最大缓存 256 个事件
        let (event_tx, _) = broadcast::channel(256);

        Self {
            backend,
            config,
            retry,
            event_tx,
        }
    }

    pub fn config(&self) -> &MultipartConfig {
        &self.config
    }

    /// 订阅事件
    ///
    /// 接收速度跟不上时会丢失事件（lagged），进度事件可以只取最新的一条。
    pub fn subscribe_events(&self) -> broadcast::Receiver<UploadEvent> {
        self.event_tx.subscribe()
    }

    /// Registers the upload with the backend and returns a fresh session.
    pub async fn initiate(&self, file: FileSource, metadata: UploadMetadata) -> Result<UploadSession> {
        self.initiate_with_token(file, metadata, CancellationToken::new()).await
    }

    async fn initiate_with_token(
        &self,
        file: FileSource,
        metadata: UploadMetadata,
        cancellation_token: CancellationToken,
    ) -> Result<UploadSession> {
        if file.size == 0 {
            return Err(UploadError::EmptyFile);
        }
        let total_parts = part_count(file.size, self.config.chunk_size)?;

        let session_id = SessionId::new();
        self.emit_state_change(session_id, UploadState::Idle, UploadState::Initiating);
        tracing::info!(
            %session_id,
            file = %file.name,
            size = file.size,
            total_parts,
            "Initiating multipart upload"
        );

        let initiated = tokio::select! {
            biased;
            _ = cancellation_token.cancelled() => Err(UploadError::Cancelled),
            result = self.backend.initiate(&file, &metadata) => {
                result.map_err(|err| UploadError::InitiationFailed(Box::new(err)))
            }
        };

        let initiated = match initiated {
            Ok(initiated) => initiated,
            Err(err) => {
                self.emit_failed(session_id, &err);
                return Err(err);
            }
        };

        tracing::debug!(
            %session_id,
            video_id = %initiated.video_id,
            upload_id = %initiated.upload_id,
            "Upload registered"
        );

        let tracker = Arc::new(self.build_tracker(session_id, file.size, total_parts));
        let mut session = UploadSession::new(
            session_id,
            initiated,
            file,
            metadata,
            self.config.chunk_size,
            tracker,
            cancellation_token,
        )?;

        let uploading = session.uploading_state();
        self.transition(&mut session, uploading)?;

        Ok(session)
    }

    /// Uploads one part: presigned URL, direct transfer, progress report.
    ///
    /// A part that is already completed is not sent again; its recorded result
    /// is returned.
    ///
    /// A part that keeps failing leaves the session in `PartUploading`; call
    /// [`abort_upload`](Self::abort_upload) to release it or retry the part.
    pub async fn upload_part(&self, session: &mut UploadSession, part: PartRange) -> Result<PartResult> {
        self.ensure_uploading(session)?;

        let expected = session.parts()?.get(part.part_number.wrapping_sub(1) as usize).copied();
        if expected != Some(part) {
            return Err(UploadError::invalid_argument(format!(
                "Part {} [{}, {}) does not belong to this session",
                part.part_number, part.start, part.end
            )));
        }

        if let Some(recorded) = session.completed_parts.get(&part.part_number) {
            tracing::debug!(session_id = %session.id, part_number = part.part_number, "Part already uploaded");
            return Ok(recorded.clone());
        }

        let ctx = Self::part_context(session);
        match self.transfer_part(&ctx, part).await {
            Ok(result) => {
                self.record_part(session, result.clone())?;
                Ok(result)
            }
            Err(err) => {
                self.emit_failed(session.id, &err);
                Err(err)
            }
        }
    }

    /// 上传所有未完成的分片
    ///
    /// 最多同时传输 `concurrency` 个分片；已完成的分片会跳过，所以失败后再次调用只会补传缺失的分片。
    /// 返回按分片号排序的结果。
    pub async fn upload_parts(&self, session: &mut UploadSession) -> Result<Vec<PartResult>> {
        self.ensure_uploading(session)?;

        let pending = session.pending_parts()?;
        let concurrency = self.config.concurrency.max(1);
        let ctx = Self::part_context(session);

        tracing::info!(
            session_id = %session.id,
            pending = pending.len(),
            total = session.total_parts,
            concurrency,
            "Uploading parts"
        );

        let mut transfers = stream::iter(pending)
            .map(|part| {
                let ctx = &ctx;
                async move { self.transfer_part(ctx, part).await }
            })
            .buffer_unordered(concurrency);

        while let Some(result) = transfers.next().await {
            match result {
                Ok(result) => self.record_part(session, result)?,
                Err(err) => {
                    // 丢弃其余正在传输的分片
                    drop(transfers);
                    ctx.tracker.abandon_in_flight();

                    self.emit_failed(session.id, &err);
                    return Err(err);
                }
            }
        }

        Ok(session.part_results())
    }

    /// Finalizes the multipart object, then writes title and description.
    ///
    /// Once storage finalization succeeds it is not repeated: if the metadata
    /// update fails the session stays in `Completing` and calling this again
    /// only retries the metadata step.
    pub async fn complete_upload(&self, session: &mut UploadSession, parts: Vec<PartResult>) -> Result<()> {
        match session.state {
            UploadState::PartUploading { .. } | UploadState::Completing => {}
            other => {
                return Err(UploadError::InvalidState {
                    from: other,
                    to: UploadState::Completing,
                });
            }
        }

        if session.cancellation_token.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        if !session.is_complete() {
            return Err(UploadError::IncompleteParts {
                expected: session.total_parts,
                actual: session.completed_count(),
            });
        }
        let parts = ordered_parts(parts, session.total_parts)?;
        for part in &parts {
            match session.completed_parts.get(&part.part_number) {
                Some(recorded) if recorded.etag == part.etag => {}
                _ => {
                    return Err(UploadError::invalid_argument(format!(
                        "ETag {} does not match the uploaded part {}",
                        part.etag, part.part_number
                    )));
                }
            }
        }

        self.transition(session, UploadState::Completing)?;
        let token = session.cancellation_token.clone();

        if !session.storage_finalized {
            tracing::info!(
                session_id = %session.id,
                video_id = %session.video_id,
                parts = parts.len(),
                "Completing multipart upload"
            );

            let backend = &self.backend;
            let (video_id, upload_id) = (&session.video_id, &session.upload_id);
            let finalized = tokio::select! {
                biased;
                _ = token.cancelled() => Err(UploadError::Cancelled),
                result = retry_with_config(&self.retry, |_| backend.complete(video_id, upload_id, &parts)) => {
                    result.map_err(|err| UploadError::CompletionFailed(Box::new(err)))
                }
            };

            if let Err(err) = finalized {
                self.emit_failed(session.id, &err);
                return Err(err);
            }
            session.storage_finalized = true;
        }

        let updated = tokio::select! {
            biased;
            _ = token.cancelled() => Err(UploadError::Cancelled),
            result = self.update_metadata(&session.video_id, &session.metadata) => result,
        };

        if let Err(err) = updated {
            if !matches!(err, UploadError::Cancelled) {
                tracing::error!(session_id = %session.id, "Stored video has no metadata: {}", err);
            }
            self.emit_failed(session.id, &err);
            return Err(err);
        }

        session.completed_at = Some(Utc::now());
        self.transition(session, UploadState::Done)?;
        self.emit(UploadEvent::Completed {
            session_id: session.id,
            video_id: session.video_id.clone(),
        });
        tracing::info!(session_id = %session.id, video_id = %session.video_id, "Upload completed");

        Ok(())
    }

    /// 只重做写入标题和描述这一步
    ///
    /// 对象已经合并完成但元数据写入失败时使用，`video_id` 取自
    /// [`UploadError::MetadataUpdateFailed`]。
    pub async fn update_metadata(&self, video_id: &str, metadata: &UploadMetadata) -> Result<()> {
        let backend = &self.backend;
        retry_with_config(&self.retry, |_| backend.update_metadata(video_id, metadata))
            .await
            .map_err(|err| UploadError::MetadataUpdateFailed {
                video_id: video_id.to_string(),
                source: Box::new(err),
            })
    }

    /// 取消上传
    ///
    /// 中断正在传输的分片，通知后端释放已上传的分片，并清空本地进度。
    /// 对已完成或已取消的会话调用不做任何事。
    pub async fn abort_upload(&self, session: &mut UploadSession) -> Result<()> {
        if session.state.is_terminal() {
            tracing::debug!(session_id = %session.id, state = ?session.state, "Session already finished");
            return Ok(());
        }

        session.cancellation_token.cancel();

        if session.storage_finalized {
            tracing::warn!(
                session_id = %session.id,
                video_id = %session.video_id,
                "Storage already finalized, nothing to release"
            );
        } else if let Err(err) = self.backend.abort(&session.video_id, &session.upload_id).await {
            tracing::warn!(
                session_id = %session.id,
                video_id = %session.video_id,
                "Failed to abort multipart upload: {}",
                err
            );
        }

        session.clear();
        self.transition(session, UploadState::Aborted)?;
        tracing::info!(session_id = %session.id, "Upload aborted");

        Ok(())
    }

    /// 完整上传流程
    ///
    /// 分片失败或被取消时会自动取消上传；元数据写入失败时对象已存储，不会取消，
    /// 调用方可以用 [`update_metadata`](Self::update_metadata) 补写。
    pub async fn upload_file(
        &self,
        file: FileSource,
        metadata: UploadMetadata,
        cancel: CancellationToken,
    ) -> Result<UploadOutcome> {
        let mut session = self.initiate_with_token(file, metadata, cancel.child_token()).await?;

        let result = match self.upload_parts(&mut session).await {
            Ok(parts) => self.complete_upload(&mut session, parts).await,
            Err(err) => Err(err),
        };

        if let Err(err) = result {
            if !session.storage_finalized {
                self.abort_upload(&mut session).await?;
            }
            return Err(err);
        }

        Ok(UploadOutcome {
            session_id: session.id,
            video_id: session.video_id.clone(),
            upload_id: session.upload_id.clone(),
            parts: session.part_results(),
            total_bytes: session.file.size,
        })
    }

    async fn transfer_part(&self, ctx: &PartContext, part: PartRange) -> Result<PartResult> {
        let result = tokio::select! {
            biased;
            _ = ctx.cancellation_token.cancelled() => Err(UploadError::Cancelled),
            result = self.transfer_part_inner(ctx, part) => result,
        };

        result.map_err(|err| {
            ctx.tracker.abandon_part(part.part_number);
            match err {
                UploadError::Cancelled => err,
                other => UploadError::PartFailed {
                    part_number: part.part_number,
                    source: Box::new(other),
                },
            }
        })
    }

    async fn transfer_part_inner(&self, ctx: &PartContext, part: PartRange) -> Result<PartResult> {
        let data = read_part(&ctx.path, part).await?;

        let etag = retry_with_config(&self.retry, |attempt| {
            let data = data.clone();
            async move {
                tracing::debug!(
                    session_id = %ctx.session_id,
                    part_number = part.part_number,
                    attempt,
                    "Uploading part"
                );

                let upload_url = self
                    .backend
                    .part_url(&ctx.video_id, &ctx.upload_id, part.part_number)
                    .await?;

                let payload = PartPayload {
                    part_number: part.part_number,
                    content_type: ctx.content_type.clone(),
                    data,
                    progress: ctx.tracker.begin_part(part.part_number),
                };

                let result = self.backend.put_part(&upload_url, payload).await;
                if result.is_err() {
                    ctx.tracker.abandon_part(part.part_number);
                }
                result
            }
        })
        .await?;

        let report = PartReport {
            part_number: part.part_number,
            bytes_uploaded: ctx.tracker.bytes_after(part.len()),
            etag: etag.clone(),
        };
        retry_with_config(&self.retry, |_| self.backend.report_progress(&ctx.video_id, &report)).await?;
        ctx.tracker.part_reported(part.part_number, part.len());

        Ok(PartResult {
            part_number: part.part_number,
            etag,
        })
    }

    fn part_context(session: &UploadSession) -> PartContext {
        PartContext {
            session_id: session.id,
            video_id: session.video_id.clone(),
            upload_id: session.upload_id.clone(),
            path: session.file.path.clone(),
            content_type: session.file.content_type.clone(),
            tracker: session.tracker.clone(),
            cancellation_token: session.cancellation_token.clone(),
        }
    }

    fn build_tracker(&self, session_id: SessionId, total_bytes: u64, total_parts: u32) -> ProgressTracker {
        let event_tx = self.event_tx.clone();

        ProgressTracker::new(total_bytes, total_parts)
            .with_update_interval(self.config.progress_interval)
            .with_callback(Arc::new(move |progress| {
                let _ = event_tx.send(UploadEvent::Progress { session_id, progress });
            }))
    }

    fn ensure_uploading(&self, session: &UploadSession) -> Result<()> {
        if session.cancellation_token.is_cancelled() && !session.state.is_terminal() {
            return Err(UploadError::Cancelled);
        }

        match session.state {
            UploadState::PartUploading { .. } => Ok(()),
            from => Err(UploadError::InvalidState {
                from,
                to: session.uploading_state(),
            }),
        }
    }

    fn record_part(&self, session: &mut UploadSession, result: PartResult) -> Result<()> {
        let (part_number, etag) = (result.part_number, result.etag.clone());
        session.record_part(result)?;

        let next = session.uploading_state();
        self.transition(session, next)?;

        tracing::debug!(
            session_id = %session.id,
            part_number,
            completed = session.completed_count(),
            total = session.total_parts,
            "Part completed"
        );
        self.emit(UploadEvent::PartCompleted {
            session_id: session.id,
            part_number,
            etag,
        });

        Ok(())
    }

    fn transition(&self, session: &mut UploadSession, to: UploadState) -> Result<()> {
        let old_state = session.transition(to)?;
        if old_state != to {
            self.emit_state_change(session.id, old_state, to);
        }
        Ok(())
    }

    fn emit_state_change(&self, session_id: SessionId, old_state: UploadState, new_state: UploadState) {
        self.emit(UploadEvent::StateChanged {
            session_id,
            old_state,
            new_state,
        });
    }

    fn emit_failed(&self, session_id: SessionId, error: &UploadError) {
        tracing::warn!(%session_id, "Upload failed: {}", error);
        self.emit(UploadEvent::Failed {
            session_id,
            error: error.to_string(),
        });
    }

    fn emit(&self, event: UploadEvent) {
        let _ = self.event_tx.send(event);
    }
}

/// 读取分片数据
async fn read_part(path: &Path, part: PartRange) -> Result<Bytes> {
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(part.start)).await?;

    let mut buffer = vec![0u8; part.len() as usize];
    file.read_exact(&mut buffer).await?;

    Ok(Bytes::from(buffer))
}
