use std::collections::BTreeMap;
use std::sync::Arc;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use crate::progress::ProgressTracker;
use crate::uploaders::multipart::parts::{compute_parts, part_count};
use super::errors::{Result, UploadError};
use super::traits::InitiatedUpload;
use super::types::{
    FileSource,
    PartRange,
    PartResult,
    SessionId,
    UploadMetadata,
    UploadProgress,
    UploadState,
};

/// 一次分片上传的会话
///
/// 只在一次上传尝试内有效：完成或取消后不能复用，重新上传需要重新 `initiate`。
pub struct UploadSession {
    pub(crate) id: SessionId,
    pub(crate) video_id: String,
    pub(crate) upload_id: String,
    pub(crate) file: FileSource,
    pub(crate) metadata: UploadMetadata,
    pub(crate) chunk_size: u64,
    pub(crate) total_parts: u32,
    pub(crate) completed_parts: BTreeMap<u32, PartResult>,
    pub(crate) state: UploadState,
    /// 对象存储已经合并完成，只剩元数据没有写入
    pub(crate) storage_finalized: bool,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) completed_at: Option<DateTime<Utc>>,
    pub(crate) tracker: Arc<ProgressTracker>,
    pub(crate) cancellation_token: CancellationToken,
}

impl UploadSession {
    pub(crate) fn new(
        id: SessionId,
        initiated: InitiatedUpload,
        file: FileSource,
        metadata: UploadMetadata,
        chunk_size: u64,
        tracker: Arc<ProgressTracker>,
        cancellation_token: CancellationToken,
    ) -> Result<Self> {
        let total_parts = part_count(file.size, chunk_size)?;

        Ok(Self {
            id,
            video_id: initiated.video_id,
            upload_id: initiated.upload_id,
            file,
            metadata,
            chunk_size,
            total_parts,
            completed_parts: BTreeMap::new(),
            state: UploadState::Initiating,
            storage_finalized: false,
            created_at: Utc::now(),
            completed_at: None,
            tracker,
            cancellation_token,
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn video_id(&self) -> &str {
        &self.video_id
    }

    /// 对象存储的 multipart upload id
    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    pub fn file(&self) -> &FileSource {
        &self.file
    }

    pub fn metadata(&self) -> &UploadMetadata {
        &self.metadata
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn total_parts(&self) -> u32 {
        self.total_parts
    }

    pub fn state(&self) -> UploadState {
        self.state
    }

    pub fn storage_finalized(&self) -> bool {
        self.storage_finalized
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn completed_part_numbers(&self) -> Vec<u32> {
        self.completed_parts.keys().copied().collect()
    }

    pub fn completed_count(&self) -> u32 {
        self.completed_parts.len() as u32
    }

    /// 已完成分片的结果，按分片号升序
    pub fn part_results(&self) -> Vec<PartResult> {
        self.completed_parts.values().cloned().collect()
    }

    pub fn is_complete(&self) -> bool {
        self.completed_count() == self.total_parts
    }

    pub fn progress(&self) -> UploadProgress {
        self.tracker.snapshot()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// 整个文件的分片划分
    pub fn parts(&self) -> Result<Vec<PartRange>> {
        compute_parts(self.file.size, self.chunk_size)
    }

    /// 还没有完成的分片
    pub fn pending_parts(&self) -> Result<Vec<PartRange>> {
        Ok(self
            .parts()?
            .into_iter()
            .filter(|part| !self.completed_parts.contains_key(&part.part_number))
            .collect())
    }

    /// 最小的未完成分片号
    pub fn next_pending_part(&self) -> Option<u32> {
        (1..=self.total_parts).find(|number| !self.completed_parts.contains_key(number))
    }

    pub fn is_valid_transition(from: UploadState, to: UploadState) -> bool {
        use UploadState::*;

        match (from, to) {
            (Idle, Initiating) => true,
            (Initiating, PartUploading { .. }) => true,
            (PartUploading { .. }, PartUploading { .. }) => true,
            (PartUploading { .. }, Completing) => true,
            (Completing, Completing) => true,
            (Completing, Done) => true,
            (from, Aborted) => !from.is_terminal(),
            _ => false,
        }
    }

    /// 切换状态，返回旧状态
    pub(crate) fn transition(&mut self, to: UploadState) -> Result<UploadState> {
        let from = self.state;
        if !Self::is_valid_transition(from, to) {
            return Err(UploadError::InvalidState { from, to });
        }

        self.state = to;
        Ok(from)
    }

    /// 当前分片位置对应的上传状态
    pub(crate) fn uploading_state(&self) -> UploadState {
        UploadState::PartUploading {
            current: self.next_pending_part().unwrap_or(self.total_parts),
            total: self.total_parts,
        }
    }

    pub(crate) fn record_part(&mut self, result: PartResult) -> Result<()> {
        if result.part_number == 0 || result.part_number > self.total_parts {
            return Err(UploadError::invalid_argument(format!(
                "Part number {} out of range 1..={}",
                result.part_number, self.total_parts
            )));
        }

        self.completed_parts.insert(result.part_number, result);
        Ok(())
    }

    /// 清空本地状态（取消时使用）
    pub(crate) fn clear(&mut self) {
        self.completed_parts.clear();
        self.tracker.reset();
    }
}

impl std::fmt::Debug for UploadSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadSession")
            .field("id", &self.id)
            .field("video_id", &self.video_id)
            .field("upload_id", &self.upload_id)
            .field("file", &self.file)
            .field("total_parts", &self.total_parts)
            .field("completed_parts", &self.completed_parts.len())
            .field("state", &self.state)
            .field("storage_finalized", &self.storage_finalized)
            .finish()
    }
}
