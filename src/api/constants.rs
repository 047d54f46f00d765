use std::time::Duration;

pub const INITIATE_PATH: &str = "videos/upload/initiate";
pub const PART_URL_PATH: &str = "videos/upload/part-url";
pub const PROGRESS_PATH: &str = "videos/upload/progress";
pub const COMPLETE_PATH: &str = "videos/upload/complete";
pub const ABORT_PATH: &str = "videos/upload/abort";
/// 后面拼接 videoId
pub const VIDEOS_PATH: &str = "videos/";

/// 后端接口的超时时间
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// 单个分片直传对象存储的超时时间
pub const DEFAULT_PART_TIMEOUT: Duration = Duration::from_secs(300);
