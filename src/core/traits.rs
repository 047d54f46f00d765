use async_trait::async_trait;
use bytes::Bytes;
use crate::progress::PartProgress;
use super::types::{FileSource, PartResult, UploadMetadata};
use super::errors::Result;

/// 后端注册上传后返回的标识
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitiatedUpload {
    pub video_id: String,
    pub upload_id: String,
}

/// 单个分片完成后回报给后端的进度
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartReport {
    pub part_number: u32,
    /// 包含本分片在内的已上传字节数
    pub bytes_uploaded: u64,
    pub etag: String,
}

/// 发往对象存储的分片数据
pub struct PartPayload {
    pub part_number: u32,
    pub content_type: String,
    pub data: Bytes,
    /// 传输过程中按字节推进进度
    pub progress: PartProgress,
}

/// 上传后端 - 分片上传流程用到的所有远程调用
#[async_trait]
pub trait UploadBackend: Send + Sync {
    /// 注册上传，返回 videoId 和 uploadId
    async fn initiate(&self, file: &FileSource, metadata: &UploadMetadata) -> Result<InitiatedUpload>;

    /// 获取某个分片的预签名地址
    async fn part_url(&self, video_id: &str, upload_id: &str, part_number: u32) -> Result<String>;

    /// 直接上传到对象存储，返回 ETag
    async fn put_part(&self, upload_url: &str, payload: PartPayload) -> Result<String>;

    /// 持久化分片进度
    async fn report_progress(&self, video_id: &str, report: &PartReport) -> Result<()>;

    /// 合并所有分片，`parts` 按分片号升序
    async fn complete(&self, video_id: &str, upload_id: &str, parts: &[PartResult]) -> Result<()>;

    /// 更新标题和描述
    async fn update_metadata(&self, video_id: &str, metadata: &UploadMetadata) -> Result<()>;

    /// 取消分片上传，释放已上传但未合并的分片
    async fn abort(&self, video_id: &str, upload_id: &str) -> Result<()>;
}

/// 凭证提供者，每次请求时读取
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// 返回 bearer token，没有凭证时返回 `None`
    async fn bearer_token(&self) -> Result<Option<String>>;
}
