use std::pin::Pin;
use std::task::{Context, Poll};
use bytes::Bytes;
use futures::Stream;
use pin_project_lite::pin_project;
use super::tracker::PartProgress;

/// 上传请求体每次发送的块大小
pub const BODY_CHUNK_SIZE: usize = 64 * 1024;

pin_project! {
    /// 统计已发送字节的请求体
    pub struct ProgressStream<S> {
        #[pin]
        inner: S,
        progress: PartProgress,
    }
}

impl<S> ProgressStream<S> {
    pub fn new(inner: S, progress: PartProgress) -> Self {
        Self { inner, progress }
    }
}

impl<S> Stream for ProgressStream<S>
where
    S: Stream<Item = std::io::Result<Bytes>>,
{
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();

        match this.inner.poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.progress.advance(chunk.len() as u64);
                Poll::Ready(Some(Ok(chunk)))
            }
            other => other,
        }
    }
}

/// 把内存中的分片切成小块，便于逐块统计进度
pub fn chunk_stream(data: Bytes, chunk_size: usize) -> impl Stream<Item = std::io::Result<Bytes>> {
    let chunk_size = chunk_size.max(1);
    let chunks: Vec<Bytes> = (0..data.len())
        .step_by(chunk_size)
        .map(|start| data.slice(start..(start + chunk_size).min(data.len())))
        .collect();

    futures::stream::iter(chunks.into_iter().map(Ok))
}
