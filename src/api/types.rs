use serde::{Deserialize, Serialize};
use crate::core::PartResult;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateRequest<'a> {
    pub file_name: &'a str,
    pub file_size: u64,
    pub content_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<&'a str>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateResponse {
    pub video_id: String,
    pub upload_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartUrlRequest<'a> {
    pub video_id: &'a str,
    pub upload_id: &'a str,
    pub part_number: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartUrlResponse {
    pub upload_url: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRequest<'a> {
    pub video_id: &'a str,
    pub bytes_uploaded: u64,
    pub part_number: u32,
    pub etag: &'a str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteRequest<'a> {
    pub video_id: &'a str,
    pub upload_id: &'a str,
    pub parts: &'a [PartResult],
}

#[derive(Debug, Clone, Serialize)]
pub struct MetadataRequest<'a> {
    pub title: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<&'a str>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AbortRequest<'a> {
    pub video_id: &'a str,
    pub upload_id: &'a str,
}

/// 响应体，兼容 `{ "data": ... }` 包装和直接返回两种格式
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum Envelope<T> {
    Wrapped { data: T },
    Bare(T),
}

impl<T> Envelope<T> {
    pub fn into_inner(self) -> T {
        match self {
            Envelope::Wrapped { data } => data,
            Envelope::Bare(inner) => inner,
        }
    }
}
