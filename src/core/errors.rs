use thiserror::Error;
use super::types::UploadState;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid url: {0}")]
    Url(#[from] url::ParseError),

    #[error("Invalid header value: {0}")]
    InvalidHeaderValue(#[from] reqwest::header::InvalidHeaderValue),

    #[error("Server error: status code {status_code}, message: {message}")]
    ServerError {
        status_code: u16,
        message: String,
    },

    #[error("File is empty, nothing to upload")]
    EmptyFile,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid state transition {from:?} -> {to:?}")]
    InvalidState {
        from: UploadState,
        to: UploadState,
    },

    #[error("Initiation failed: {0}")]
    InitiationFailed(#[source] Box<UploadError>),

    #[error("Part {part_number} failed: {source}")]
    PartFailed {
        part_number: u32,
        #[source]
        source: Box<UploadError>,
    },

    #[error("No ETag in storage response for part {part_number}")]
    MissingEtag {
        part_number: u32,
    },

    #[error("Incomplete parts, expected: {expected}, actual: {actual}")]
    IncompleteParts {
        expected: u32,
        actual: u32,
    },

    #[error("Completion failed: {0}")]
    CompletionFailed(#[source] Box<UploadError>),

    #[error("Metadata update for video {video_id} failed: {source}")]
    MetadataUpdateFailed {
        video_id: String,
        #[source]
        source: Box<UploadError>,
    },

    #[error("Upload was cancelled")]
    Cancelled,

    #[error("Request timed out")]
    Timeout,

    #[error("Credentials error: {0}")]
    Credentials(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

impl UploadError {
    pub fn server_error(status_code: u16, message: impl Into<String>) -> Self {
        Self::ServerError {
            status_code,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// 是否属于可以重试的临时错误
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(err) => err.is_timeout() || err.is_connect() || err.is_request() || err.is_body(),
            Self::Timeout => true,
            Self::ServerError { status_code, .. } => {
                matches!(*status_code, 408 | 429) || (500..600).contains(status_code)
            }
            Self::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

/// Error alias
pub type Result<T, E = UploadError> = std::result::Result<T, E>;
