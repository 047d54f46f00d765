use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, ETAG};
use reqwest::{Body, Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use url::Url;
use crate::config::Config;
use crate::core::{
    CredentialProvider,
    FileSource,
    InitiatedUpload,
    PartPayload,
    PartReport,
    PartResult,
    Result,
    UploadBackend,
    UploadError,
    UploadMetadata,
};
use crate::progress::{chunk_stream, ProgressStream, BODY_CHUNK_SIZE};
use super::constants::{
    ABORT_PATH,
    COMPLETE_PATH,
    DEFAULT_PART_TIMEOUT,
    DEFAULT_REQUEST_TIMEOUT,
    INITIATE_PATH,
    PART_URL_PATH,
    PROGRESS_PATH,
    VIDEOS_PATH,
};
use super::types::{
    AbortRequest,
    CompleteRequest,
    Envelope,
    InitiateRequest,
    InitiateResponse,
    MetadataRequest,
    PartUrlRequest,
    PartUrlResponse,
    ProgressRequest,
};

/// 基于 HTTP 的上传后端
///
/// 后端接口带 `Authorization: Bearer`；预签名地址本身已经授权，直传对象存储时不带认证头。
#[derive(Clone)]
pub struct HttpBackend {
    client: Client,
    storage_client: Client,
    endpoint: Url,
    credentials: Arc<dyn CredentialProvider>,
    part_timeout: Duration,
}

impl HttpBackend {
    pub fn new(endpoint: &str, credentials: Arc<dyn CredentialProvider>) -> Result<Self> {
        Self::with_timeouts(endpoint, credentials, DEFAULT_REQUEST_TIMEOUT, DEFAULT_PART_TIMEOUT)
    }

    pub fn with_timeouts(
        endpoint: &str,
        credentials: Arc<dyn CredentialProvider>,
        request_timeout: Duration,
        part_timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .tcp_nodelay(true)
            .build()?;
        let storage_client = Client::builder().tcp_nodelay(true).build()?;

        Ok(Self {
            client,
            storage_client,
            endpoint: normalize_endpoint(endpoint)?,
            credentials,
            part_timeout,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::with_timeouts(
            &config.endpoint,
            config.credentials(),
            config.upload.request_timeout(),
            config.upload.part_timeout(),
        )
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn url(&self, path: &str) -> Result<Url> {
        Ok(self.endpoint.join(path)?)
    }

    fn video_url(&self, video_id: &str) -> Result<Url> {
        let mut url = self.url(VIDEOS_PATH)?;
        url.path_segments_mut()
            .map_err(|_| UploadError::invalid_argument(format!("Endpoint cannot be a base: {}", self.endpoint)))?
            .pop_if_empty()
            .push(video_id);

        Ok(url)
    }

    async fn authorized(&self, request: RequestBuilder) -> Result<RequestBuilder> {
        match self.credentials.bearer_token().await? {
            Some(token) => {
                let value = HeaderValue::from_str(&format!("Bearer {}", token))?;
                Ok(request.header(AUTHORIZATION, value))
            }
            None => Ok(request),
        }
    }

    async fn send<B: Serialize + ?Sized>(&self, method: Method, url: Url, body: &B) -> Result<Response> {
        tracing::debug!(%method, %url, "Backend request");

        let request = self.authorized(self.client.request(method, url).json(body)).await?;
        let response = request.send().await.map_err(transport_error)?;

        check_status(response).await
    }

    async fn send_json<B, R>(&self, method: Method, url: Url, body: &B) -> Result<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let response = self.send(method, url, body).await?;
        let envelope: Envelope<R> = response.json().await?;

        Ok(envelope.into_inner())
    }
}

#[async_trait]
impl UploadBackend for HttpBackend {
    async fn initiate(&self, file: &FileSource, metadata: &UploadMetadata) -> Result<InitiatedUpload> {
        let request = InitiateRequest {
            file_name: &file.name,
            file_size: file.size,
            content_type: &file.content_type,
            title: Some(metadata.title.as_str()).filter(|title| !title.is_empty()),
            category: metadata.category.as_deref(),
        };

        let response: InitiateResponse = self.send_json(Method::POST, self.url(INITIATE_PATH)?, &request).await?;

        Ok(InitiatedUpload {
            video_id: response.video_id,
            upload_id: response.upload_id,
        })
    }

    async fn part_url(&self, video_id: &str, upload_id: &str, part_number: u32) -> Result<String> {
        let request = PartUrlRequest {
            video_id,
            upload_id,
            part_number,
        };

        let response: PartUrlResponse = self.send_json(Method::POST, self.url(PART_URL_PATH)?, &request).await?;
        Ok(response.upload_url)
    }

    async fn put_part(&self, upload_url: &str, payload: PartPayload) -> Result<String> {
        let PartPayload {
            part_number,
            content_type,
            data,
            progress,
        } = payload;
        let length = data.len();

        let body = Body::wrap_stream(ProgressStream::new(chunk_stream(data, BODY_CHUNK_SIZE), progress));
        let response = self
            .storage_client
            .put(upload_url)
            .timeout(self.part_timeout)
            .header(CONTENT_TYPE, HeaderValue::from_str(&content_type)?)
            .header(CONTENT_LENGTH, length)
            .body(body)
            .send()
            .await
            .map_err(transport_error)?;

        let response = check_status(response).await?;

        match response.headers().get(ETAG) {
            Some(etag) => {
                let etag = etag
                    .to_str()
                    .map_err(|err| UploadError::server_error(response.status().as_u16(), err.to_string()))?;
                if etag.is_empty() {
                    return Err(UploadError::MissingEtag { part_number });
                }
                Ok(etag.to_string())
            }
            None => Err(UploadError::MissingEtag { part_number }),
        }
    }

    async fn report_progress(&self, video_id: &str, report: &PartReport) -> Result<()> {
        let request = ProgressRequest {
            video_id,
            bytes_uploaded: report.bytes_uploaded,
            part_number: report.part_number,
            etag: &report.etag,
        };

        self.send(Method::POST, self.url(PROGRESS_PATH)?, &request).await?;
        Ok(())
    }

    async fn complete(&self, video_id: &str, upload_id: &str, parts: &[PartResult]) -> Result<()> {
        let request = CompleteRequest {
            video_id,
            upload_id,
            parts,
        };

        self.send(Method::POST, self.url(COMPLETE_PATH)?, &request).await?;
        Ok(())
    }

    async fn update_metadata(&self, video_id: &str, metadata: &UploadMetadata) -> Result<()> {
        let request = MetadataRequest {
            title: &metadata.title,
            description: metadata.description.as_deref(),
        };

        self.send(Method::PUT, self.video_url(video_id)?, &request).await?;
        Ok(())
    }

    async fn abort(&self, video_id: &str, upload_id: &str) -> Result<()> {
        let request = AbortRequest { video_id, upload_id };

        self.send(Method::POST, self.url(ABORT_PATH)?, &request).await?;
        Ok(())
    }
}

/// 保证以 `/` 结尾，`join` 时不会丢掉最后一段路径
fn normalize_endpoint(endpoint: &str) -> Result<Url> {
    let mut url = Url::parse(endpoint.trim())?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(UploadError::invalid_argument(format!("Unsupported endpoint scheme: {}", endpoint)));
    }

    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }

    Ok(url)
}

fn transport_error(err: reqwest::Error) -> UploadError {
    if err.is_timeout() {
        UploadError::Timeout
    } else {
        UploadError::Http(err)
    }
}

async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = response.text().await.unwrap_or_default();
    Err(UploadError::server_error(status.as_u16(), message))
}
