pub mod api;
pub mod config;
pub mod core;
pub mod progress;
pub mod uploaders;
pub mod utils;

// 重新导出核心类型
pub use core::{
    FileSource,
    MultipartConfig,
    PartRange,
    PartResult,
    Result,
    UploadBackend,
    UploadError,
    UploadEvent,
    UploadMetadata,
    UploadOutcome,
    UploadProgress,
    UploadSession,
    UploadState,
};

pub use api::HttpBackend;
pub use config::Config;
pub use uploaders::multipart::parts::compute_parts;
pub use uploaders::MultipartUploader;
