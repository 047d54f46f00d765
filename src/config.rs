//! `config.toml` loading
//!
//! ```toml
//! endpoint = "https://api.example.com/v1"
//! token_env = "VIDEO_API_TOKEN"
//!
//! [upload]
//! chunk_size = 8388608
//! concurrency = 3
//! ```

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use serde::Deserialize;
use crate::api::{EnvToken, NoCredentials, StaticToken, DEFAULT_PART_TIMEOUT, DEFAULT_REQUEST_TIMEOUT};
use crate::core::{CredentialProvider, MultipartConfig, Result, UploadError, DEFAULT_CHUNK_SIZE};

/// 对象存储允许的最小分片（最后一片除外）
pub const MIN_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    pub endpoint: String,
    /// 直接写在配置里的 token，优先于 `token_env`
    #[serde(default)]
    pub token: Option<String>,
    /// 保存 token 的环境变量名
    #[serde(default)]
    pub token_env: Option<String>,
    #[serde(default)]
    pub upload: UploadSettings,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct UploadSettings {
    pub chunk_size: u64,
    pub concurrency: usize,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub request_timeout_secs: u64,
    pub part_timeout_secs: u64,
    pub progress_interval_ms: u64,
}

impl Default for UploadSettings {
    fn default() -> Self {
        let defaults = MultipartConfig::default();

        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            concurrency: defaults.concurrency,
            max_retries: defaults.max_retries,
            retry_delay_ms: defaults.retry_delay.as_millis() as u64,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT.as_secs(),
            part_timeout_secs: DEFAULT_PART_TIMEOUT.as_secs(),
            progress_interval_ms: defaults.progress_interval.as_millis() as u64,
        }
    }
}

impl UploadSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn part_timeout(&self) -> Duration {
        Duration::from_secs(self.part_timeout_secs)
    }
}

impl Config {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            token: None,
            token_env: None,
            upload: UploadSettings::default(),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|err| UploadError::Config(format!("Can't read {}: {}", path.display(), err)))?;

        Self::from_str(&content)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let endpoint = url::Url::parse(&self.endpoint)
            .map_err(|err| UploadError::Config(format!("Invalid endpoint {:?}: {}", self.endpoint, err)))?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(UploadError::Config(format!("Endpoint must be http(s): {}", self.endpoint)));
        }

        let upload = &self.upload;
        if upload.chunk_size < MIN_CHUNK_SIZE {
            return Err(UploadError::Config(format!(
                "chunk_size must be at least {} bytes, got {}",
                MIN_CHUNK_SIZE, upload.chunk_size
            )));
        }
        if upload.concurrency == 0 {
            return Err(UploadError::Config("concurrency must be at least 1".to_string()));
        }
        if upload.request_timeout_secs == 0 || upload.part_timeout_secs == 0 {
            return Err(UploadError::Config("Timeouts must be greater than 0".to_string()));
        }

        Ok(())
    }

    /// 凭证来源：`token` > `token_env` > 无
    pub fn credentials(&self) -> Arc<dyn CredentialProvider> {
        match (&self.token, &self.token_env) {
            (Some(token), _) => Arc::new(StaticToken::new(token.clone())),
            (None, Some(var)) => Arc::new(EnvToken::new(var.clone())),
            (None, None) => Arc::new(NoCredentials),
        }
    }

    pub fn multipart_config(&self) -> MultipartConfig {
        MultipartConfig {
            chunk_size: self.upload.chunk_size,
            concurrency: self.upload.concurrency,
            max_retries: self.upload.max_retries,
            retry_delay: Duration::from_millis(self.upload.retry_delay_ms),
            progress_interval: Duration::from_millis(self.upload.progress_interval_ms),
        }
    }
}
