use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use super::errors::{Result, UploadError};

/// 默认分片大小，同时也是对象存储允许的最小分片（最后一片除外）
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

/// 本地上传会话标识，只用于事件和日志
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 上传状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
pub enum UploadState {
    /// 尚未开始
    #[default]
    Idle,
    /// 向后端注册上传
    Initiating,
    /// 正在上传分片，`current` 是最小的未完成分片号
    PartUploading {
        current: u32,
        total: u32,
    },
    /// 合并分片并写入元数据
    Completing,
    /// 已完成
    Done,
    /// 已取消
    Aborted,
}

impl UploadState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadState::Done | UploadState::Aborted)
    }
}

/// 待上传的本地文件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSource {
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
    pub content_type: String,
}

impl FileSource {
    /// Reads size and name from the file system and guesses the content type.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file_metadata = tokio::fs::metadata(path).await?;
        if !file_metadata.is_file() {
            return Err(UploadError::invalid_argument(format!("Not a file: {}", path.display())));
        }

        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| UploadError::invalid_argument("The file name is not valid UTF-8"))?
            .to_string();

        Ok(Self {
            content_type: guess_content_type(path).to_string(),
            path: path.to_path_buf(),
            name,
            size: file_metadata.len(),
        })
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }
}

pub fn guess_content_type(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase());

    match extension.as_deref() {
        Some("mp4") | Some("m4v") => "video/mp4",
        Some("mov") => "video/quicktime",
        Some("webm") => "video/webm",
        Some("mkv") => "video/x-matroska",
        Some("avi") => "video/x-msvideo",
        Some("mpeg") | Some("mpg") => "video/mpeg",
        _ => FALLBACK_CONTENT_TYPE,
    }
}

/// 调用方提供的视频信息
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadMetadata {
    pub title: String,
    pub description: Option<String>,
    /// 内容分类
    pub category: Option<String>,
}

impl UploadMetadata {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }
}

/// 分片字节区间 `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartRange {
    pub part_number: u32,
    pub start: u64,
    pub end: u64,
}

impl PartRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// 分片上传结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartResult {
    pub part_number: u32,
    pub etag: String,
}

/// 上传进度
#[derive(Debug, Clone, PartialEq)]
pub struct UploadProgress {
    /// 已上传字节数（包含正在传输的分片）
    pub uploaded_bytes: u64,
    /// 总字节数
    pub total_bytes: u64,
    /// 已确认的分片数
    pub completed_parts: u32,
    pub total_parts: u32,
    /// 完成百分比，单调不减
    pub percentage: f64,
    /// 当前速度（字节/秒）
    pub speed: f64,
    /// 平均速度（字节/秒）
    pub average_speed: f64,
    /// 预计剩余时间
    pub eta: Option<Duration>,
}

/// 上传事件
#[derive(Debug, Clone)]
pub enum UploadEvent {
    /// 状态变更
    StateChanged {
        session_id: SessionId,
        old_state: UploadState,
        new_state: UploadState,
    },
    /// 进度更新
    Progress {
        session_id: SessionId,
        progress: UploadProgress,
    },
    /// 单个分片完成
    PartCompleted {
        session_id: SessionId,
        part_number: u32,
        etag: String,
    },
    /// 上传完成
    Completed {
        session_id: SessionId,
        video_id: String,
    },
    /// 上传失败
    Failed {
        session_id: SessionId,
        error: String,
    },
}

/// 分片上传配置
#[derive(Debug, Clone)]
pub struct MultipartConfig {
    pub chunk_size: u64,
    /// 同时上传的分片数，1 表示顺序上传
    pub concurrency: usize,
    /// 单个请求失败后的重试次数
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// 进度回调的最小间隔
    pub progress_interval: Duration,
}

impl Default for MultipartConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            concurrency: 1,
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            progress_interval: Duration::from_millis(500),
        }
    }
}

/// 整个上传流程的结果
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub session_id: SessionId,
    pub video_id: String,
    pub upload_id: String,
    pub parts: Vec<PartResult>,
    pub total_bytes: u64,
}

const _: () = {
    fn assert_send<T: Send>() {}
    fn assert_types() {
        assert_send::<UploadEvent>();
        assert_send::<UploadProgress>();
        assert_send::<FileSource>();
    }
};
