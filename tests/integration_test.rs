use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use video_uploader::core::{InitiatedUpload, PartPayload, PartReport};
use video_uploader::{
    FileSource,
    MultipartConfig,
    MultipartUploader,
    PartResult,
    Result,
    UploadBackend,
    UploadError,
    UploadEvent,
    UploadMetadata,
    UploadState,
};

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Initiate,
    PartUrl(u32),
    PutPart(u32),
    Progress(u32, u64),
    Complete(Vec<u32>),
    UpdateMetadata,
    Abort,
}

/// 模拟后端 - 记录调用顺序，可以注入失败
#[derive(Default)]
struct MockBackend {
    calls: Mutex<Vec<Call>>,
    /// 分片号 -> (剩余失败次数, 状态码)
    put_failures: Mutex<HashMap<u32, (u32, u16)>>,
    /// (剩余失败次数, 状态码)
    metadata_failures: Mutex<(u32, u16)>,
    put_delays: HashMap<u32, Duration>,
}

impl MockBackend {
    fn new() -> Self {
        Self::default()
    }

    fn fail_part(self, part_number: u32, times: u32, status_code: u16) -> Self {
        self.put_failures.lock().insert(part_number, (times, status_code));
        self
    }

    fn fail_metadata(self, times: u32, status_code: u16) -> Self {
        *self.metadata_failures.lock() = (times, status_code);
        self
    }

    fn delay_part(mut self, part_number: u32, delay: Duration) -> Self {
        self.put_delays.insert(part_number, delay);
        self
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    fn count(&self, call: &Call) -> usize {
        self.calls.lock().iter().filter(|c| *c == call).count()
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }
}

#[async_trait::async_trait]
impl UploadBackend for MockBackend {
    async fn initiate(&self, _file: &FileSource, _metadata: &UploadMetadata) -> Result<InitiatedUpload> {
        self.record(Call::Initiate);
        Ok(InitiatedUpload {
            video_id: "video-1".to_string(),
            upload_id: "upload-1".to_string(),
        })
    }

    async fn part_url(&self, video_id: &str, upload_id: &str, part_number: u32) -> Result<String> {
        self.record(Call::PartUrl(part_number));
        Ok(format!("https://storage.test/{}/{}/{}", video_id, upload_id, part_number))
    }

    async fn put_part(&self, _upload_url: &str, payload: PartPayload) -> Result<String> {
        let part_number = payload.part_number;
        self.record(Call::PutPart(part_number));

        if let Some(delay) = self.put_delays.get(&part_number) {
            tokio::time::sleep(*delay).await;
        }

        {
            let mut failures = self.put_failures.lock();
            if let Some((remaining, status_code)) = failures.get_mut(&part_number) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(UploadError::server_error(*status_code, "simulated failure"));
                }
            }
        }

        // 模拟分块发送
        for chunk in payload.data.chunks(4) {
            payload.progress.advance(chunk.len() as u64);
        }

        Ok(format!("\"etag-{}\"", part_number))
    }

    async fn report_progress(&self, _video_id: &str, report: &PartReport) -> Result<()> {
        self.record(Call::Progress(report.part_number, report.bytes_uploaded));
        Ok(())
    }

    async fn complete(&self, _video_id: &str, _upload_id: &str, parts: &[PartResult]) -> Result<()> {
        self.record(Call::Complete(parts.iter().map(|p| p.part_number).collect()));
        Ok(())
    }

    async fn update_metadata(&self, _video_id: &str, _metadata: &UploadMetadata) -> Result<()> {
        self.record(Call::UpdateMetadata);

        let mut failures = self.metadata_failures.lock();
        if failures.0 > 0 {
            failures.0 -= 1;
            return Err(UploadError::server_error(failures.1, "simulated failure"));
        }
        Ok(())
    }

    async fn abort(&self, _video_id: &str, _upload_id: &str) -> Result<()> {
        self.record(Call::Abort);
        Ok(())
    }
}

/// 测试用临时文件，离开作用域时删除
struct TempVideo {
    path: PathBuf,
}

impl TempVideo {
    fn new(size: usize) -> Self {
        let path = std::env::temp_dir().join(format!("video-uploader-{}.mp4", uuid::Uuid::new_v4()));
        let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, data).unwrap();
        Self { path }
    }

    async fn source(&self) -> FileSource {
        FileSource::from_path(&self.path).await.unwrap()
    }
}

impl Drop for TempVideo {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn config(chunk_size: u64, concurrency: usize, max_retries: u32) -> MultipartConfig {
    MultipartConfig {
        chunk_size,
        concurrency,
        max_retries,
        retry_delay: Duration::from_millis(1),
        progress_interval: Duration::ZERO,
    }
}

fn metadata() -> UploadMetadata {
    UploadMetadata::new("Holiday").with_description("Beach day")
}

#[tokio::test]
async fn test_sequential_upload_call_order() {
    let video = TempVideo::new(25);
    let backend = Arc::new(MockBackend::new());
    let uploader = MultipartUploader::new(backend.clone(), config(10, 1, 0));

    let mut session = uploader.initiate(video.source().await, metadata()).await.unwrap();
    assert_eq!(session.total_parts(), 3);
    assert_eq!(session.state(), UploadState::PartUploading { current: 1, total: 3 });

    let parts = uploader.upload_parts(&mut session).await.unwrap();
    uploader.complete_upload(&mut session, parts).await.unwrap();

    assert_eq!(
        backend.calls(),
        vec![
            Call::Initiate,
            Call::PartUrl(1),
            Call::PutPart(1),
            Call::Progress(1, 10),
            Call::PartUrl(2),
            Call::PutPart(2),
            Call::Progress(2, 20),
            Call::PartUrl(3),
            Call::PutPart(3),
            Call::Progress(3, 25),
            Call::Complete(vec![1, 2, 3]),
            Call::UpdateMetadata,
        ]
    );
    assert_eq!(session.state(), UploadState::Done);
    assert!(session.completed_at().is_some());
    assert_eq!(session.progress().percentage, 100.0);
}

#[tokio::test]
async fn test_state_and_progress_events() {
    let video = TempVideo::new(25);
    let backend = Arc::new(MockBackend::new());
    let uploader = MultipartUploader::new(backend.clone(), config(10, 1, 0));
    let mut events = uploader.subscribe_events();

    let outcome = uploader
        .upload_file(video.source().await, metadata(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.video_id, "video-1");
    assert_eq!(outcome.total_bytes, 25);
    assert_eq!(outcome.parts.len(), 3);

    let mut states = Vec::new();
    let mut percentages = Vec::new();
    let mut completed = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            UploadEvent::StateChanged { new_state, .. } => states.push(new_state),
            UploadEvent::Progress { progress, .. } => percentages.push(progress.percentage),
            UploadEvent::Completed { video_id, .. } => {
                assert_eq!(video_id, "video-1");
                completed += 1;
            }
            _ => {}
        }
    }

    assert_eq!(
        states,
        vec![
            UploadState::Initiating,
            UploadState::PartUploading { current: 1, total: 3 },
            UploadState::PartUploading { current: 2, total: 3 },
            UploadState::PartUploading { current: 3, total: 3 },
            UploadState::Completing,
            UploadState::Done,
        ]
    );
    assert_eq!(completed, 1);

    assert!(!percentages.is_empty());
    assert!(percentages.windows(2).all(|pair| pair[0] <= pair[1]));
    assert_eq!(percentages.last().copied(), Some(100.0));
    assert_eq!(percentages.iter().filter(|p| **p == 100.0).count(), 1);
}

#[tokio::test]
async fn test_empty_file_rejected_before_any_call() {
    let video = TempVideo::new(0);
    let backend = Arc::new(MockBackend::new());
    let uploader = MultipartUploader::new(backend.clone(), config(10, 1, 0));

    let result = uploader.initiate(video.source().await, metadata()).await;

    assert!(matches!(result, Err(UploadError::EmptyFile)));
    assert!(backend.calls().is_empty());
}

#[tokio::test]
async fn test_failed_part_keeps_session_uploading() {
    let video = TempVideo::new(25);
    let backend = Arc::new(MockBackend::new().fail_part(2, u32::MAX, 500));
    let uploader = MultipartUploader::new(backend.clone(), config(10, 1, 0));

    let mut session = uploader.initiate(video.source().await, metadata()).await.unwrap();
    let err = uploader.upload_parts(&mut session).await.unwrap_err();

    assert!(matches!(err, UploadError::PartFailed { part_number: 2, .. }));
    assert_eq!(session.state(), UploadState::PartUploading { current: 2, total: 3 });
    assert_eq!(session.completed_part_numbers(), vec![1]);
    assert_eq!(backend.count(&Call::PutPart(2)), 1);
    assert_eq!(backend.count(&Call::PutPart(3)), 0);
    assert!(!backend.calls().iter().any(|call| matches!(call, Call::Complete(_))));

    let progress = session.progress();
    assert_eq!(progress.uploaded_bytes, 10);
    assert!(progress.percentage < 100.0);
}

#[tokio::test]
async fn test_abort_twice_is_harmless() {
    let video = TempVideo::new(25);
    let backend = Arc::new(MockBackend::new().fail_part(2, u32::MAX, 400));
    let uploader = MultipartUploader::new(backend.clone(), config(10, 1, 3));

    let mut session = uploader.initiate(video.source().await, metadata()).await.unwrap();
    assert!(uploader.upload_parts(&mut session).await.is_err());
    // 400 不重试
    assert_eq!(backend.count(&Call::PutPart(2)), 1);

    uploader.abort_upload(&mut session).await.unwrap();
    uploader.abort_upload(&mut session).await.unwrap();

    assert_eq!(session.state(), UploadState::Aborted);
    assert!(session.completed_part_numbers().is_empty());
    assert_eq!(session.progress().uploaded_bytes, 0);
    assert_eq!(session.progress().percentage, 0.0);
    assert_eq!(backend.count(&Call::Abort), 1);

    let result = uploader.upload_parts(&mut session).await;
    assert!(matches!(result, Err(UploadError::InvalidState { from: UploadState::Aborted, .. })));
}

#[tokio::test]
async fn test_upload_file_aborts_on_part_failure() {
    let video = TempVideo::new(25);
    let backend = Arc::new(MockBackend::new().fail_part(3, u32::MAX, 403));
    let uploader = MultipartUploader::new(backend.clone(), config(10, 1, 0));

    let err = uploader
        .upload_file(video.source().await, metadata(), CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, UploadError::PartFailed { part_number: 3, .. }));
    assert_eq!(backend.calls().last(), Some(&Call::Abort));
}

#[tokio::test]
async fn test_parallel_upload_completes_in_order() {
    let video = TempVideo::new(45);
    let mut backend = MockBackend::new();
    // 编号越小越慢，完成顺序与分片号相反
    for part_number in 1..=5u32 {
        backend = backend.delay_part(part_number, Duration::from_millis(10 * (6 - part_number) as u64));
    }
    let backend = Arc::new(backend);
    let uploader = MultipartUploader::new(backend.clone(), config(10, 3, 0));

    let mut session = uploader.initiate(video.source().await, metadata()).await.unwrap();
    let parts = uploader.upload_parts(&mut session).await.unwrap();

    let numbers: Vec<u32> = parts.iter().map(|p| p.part_number).collect();
    assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
    assert_eq!(parts[4].etag, "\"etag-5\"");

    // 调用方乱序传入也会排序后提交
    let mut shuffled = parts.clone();
    shuffled.reverse();
    uploader.complete_upload(&mut session, shuffled).await.unwrap();

    assert!(backend.calls().contains(&Call::Complete(vec![1, 2, 3, 4, 5])));
    assert_eq!(session.state(), UploadState::Done);
}

#[tokio::test]
async fn test_transient_failure_is_retried() {
    let video = TempVideo::new(25);
    let backend = Arc::new(MockBackend::new().fail_part(2, 2, 503));
    let uploader = MultipartUploader::new(backend.clone(), config(10, 1, 3));

    let outcome = uploader
        .upload_file(video.source().await, metadata(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.parts.len(), 3);
    // 每次重试都重新获取预签名地址
    assert_eq!(backend.count(&Call::PartUrl(2)), 3);
    assert_eq!(backend.count(&Call::PutPart(2)), 3);
    assert_eq!(backend.count(&Call::Progress(2, 20)), 1);
    assert_eq!(backend.count(&Call::Abort), 0);
}

#[tokio::test]
async fn test_metadata_failure_does_not_finalize_twice() {
    let video = TempVideo::new(25);
    let backend = Arc::new(MockBackend::new().fail_metadata(1, 400));
    let uploader = MultipartUploader::new(backend.clone(), config(10, 1, 0));

    let mut session = uploader.initiate(video.source().await, metadata()).await.unwrap();
    let parts = uploader.upload_parts(&mut session).await.unwrap();

    let err = uploader.complete_upload(&mut session, parts.clone()).await.unwrap_err();
    assert!(matches!(err, UploadError::MetadataUpdateFailed { ref video_id, .. } if video_id == "video-1"));
    assert_eq!(session.state(), UploadState::Completing);
    assert!(session.storage_finalized());

    uploader.complete_upload(&mut session, parts).await.unwrap();

    assert_eq!(session.state(), UploadState::Done);
    assert_eq!(backend.count(&Call::Complete(vec![1, 2, 3])), 1);
    assert_eq!(backend.count(&Call::UpdateMetadata), 2);
    assert_eq!(backend.count(&Call::Abort), 0);
}

#[tokio::test]
async fn test_complete_requires_all_parts() {
    let video = TempVideo::new(25);
    let backend = Arc::new(MockBackend::new());
    let uploader = MultipartUploader::new(backend.clone(), config(10, 1, 0));

    let mut session = uploader.initiate(video.source().await, metadata()).await.unwrap();
    let first = session.parts().unwrap()[0];
    let result = uploader.upload_part(&mut session, first).await.unwrap();
    assert_eq!(result.part_number, 1);
    assert_eq!(session.state(), UploadState::PartUploading { current: 2, total: 3 });

    let err = uploader.complete_upload(&mut session, vec![result]).await.unwrap_err();
    assert!(matches!(err, UploadError::IncompleteParts { expected: 3, actual: 1 }));
    assert!(!backend.calls().iter().any(|call| matches!(call, Call::Complete(_))));
    assert_eq!(session.state(), UploadState::PartUploading { current: 2, total: 3 });
}

#[tokio::test]
async fn test_upload_part_rejects_foreign_range() {
    let video = TempVideo::new(25);
    let backend = Arc::new(MockBackend::new());
    let uploader = MultipartUploader::new(backend.clone(), config(10, 1, 0));

    let mut session = uploader.initiate(video.source().await, metadata()).await.unwrap();
    let mut part = session.parts().unwrap()[1];
    part.end += 1;

    let result = uploader.upload_part(&mut session, part).await;
    assert!(matches!(result, Err(UploadError::InvalidArgument(_))));
    assert_eq!(backend.calls(), vec![Call::Initiate]);
}

#[tokio::test]
async fn test_cancellation_aborts_upload() {
    let video = TempVideo::new(25);
    let backend = Arc::new(MockBackend::new().delay_part(1, Duration::from_secs(5)));
    let uploader = MultipartUploader::new(backend.clone(), config(10, 1, 0));

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });
    }

    let started = std::time::Instant::now();
    let err = uploader
        .upload_file(video.source().await, metadata(), cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, UploadError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(backend.calls().last(), Some(&Call::Abort));
    assert!(!backend.calls().iter().any(|call| matches!(call, Call::Complete(_))));
}

#[tokio::test]
async fn test_resume_uploads_only_missing_parts() {
    let video = TempVideo::new(25);
    let backend = Arc::new(MockBackend::new().fail_part(2, 1, 400));
    let uploader = MultipartUploader::new(backend.clone(), config(10, 1, 0));

    let mut session = uploader.initiate(video.source().await, metadata()).await.unwrap();
    assert!(uploader.upload_parts(&mut session).await.is_err());

    let parts = uploader.upload_parts(&mut session).await.unwrap();
    assert_eq!(parts.len(), 3);
    assert_eq!(backend.count(&Call::PutPart(1)), 1);
    assert_eq!(backend.count(&Call::PutPart(2)), 2);

    uploader.complete_upload(&mut session, parts).await.unwrap();
    assert_eq!(session.state(), UploadState::Done);
    assert_eq!(session.progress().percentage, 100.0);
}

#[tokio::test]
async fn test_completed_part_is_not_sent_again() {
    let video = TempVideo::new(20);
    let backend = Arc::new(MockBackend::new());
    let uploader = MultipartUploader::new(backend.clone(), config(10, 1, 0));

    let mut session = uploader.initiate(video.source().await, metadata()).await.unwrap();
    let parts = session.parts().unwrap();

    let first = uploader.upload_part(&mut session, parts[0]).await.unwrap();
    let again = uploader.upload_part(&mut session, parts[0]).await.unwrap();

    assert_eq!(first, again);
    assert_eq!(backend.count(&Call::PutPart(1)), 1);
    assert_eq!(
        backend.calls(),
        vec![Call::Initiate, Call::PartUrl(1), Call::PutPart(1), Call::Progress(1, 10)]
    );

    let progress = session.progress();
    assert_eq!(progress.completed_parts, 1);
    assert_eq!(progress.uploaded_bytes, 10);
    assert!(progress.percentage < 100.0);

    uploader.upload_part(&mut session, parts[1]).await.unwrap();
    assert!(backend.calls().contains(&Call::Progress(2, 20)));
    assert_eq!(session.progress().percentage, 100.0);
}

#[tokio::test]
async fn test_complete_rejects_mismatched_etag() {
    let video = TempVideo::new(25);
    let backend = Arc::new(MockBackend::new());
    let uploader = MultipartUploader::new(backend.clone(), config(10, 1, 0));

    let mut session = uploader.initiate(video.source().await, metadata()).await.unwrap();
    let mut parts = uploader.upload_parts(&mut session).await.unwrap();
    parts[1].etag = "\"stale\"".to_string();

    let err = uploader.complete_upload(&mut session, parts).await.unwrap_err();

    assert!(matches!(err, UploadError::InvalidArgument(_)));
    assert!(!backend.calls().iter().any(|call| matches!(call, Call::Complete(_))));
    assert!(!session.storage_finalized());

    let recorded = session.part_results();
    uploader.complete_upload(&mut session, recorded).await.unwrap();
    assert_eq!(session.state(), UploadState::Done);
}

#[tokio::test]
async fn test_metadata_retry_after_upload_file() {
    let video = TempVideo::new(25);
    let backend = Arc::new(MockBackend::new().fail_metadata(1, 400));
    let uploader = MultipartUploader::new(backend.clone(), config(10, 1, 0));

    let err = uploader
        .upload_file(video.source().await, metadata(), CancellationToken::new())
        .await
        .unwrap_err();

    let video_id = match err {
        UploadError::MetadataUpdateFailed { video_id, .. } => video_id,
        other => panic!("unexpected error: {:?}", other),
    };
    assert_eq!(backend.count(&Call::Abort), 0);

    uploader.update_metadata(&video_id, &metadata()).await.unwrap();

    assert_eq!(backend.count(&Call::Complete(vec![1, 2, 3])), 1);
    assert_eq!(backend.count(&Call::UpdateMetadata), 2);
}

#[tokio::test]
async fn test_cancellation_interrupts_metadata_backoff() {
    let video = TempVideo::new(25);
    let backend = Arc::new(MockBackend::new().fail_metadata(u32::MAX, 503));
    let config = MultipartConfig {
        retry_delay: Duration::from_secs(10),
        ..config(10, 1, 3)
    };
    let uploader = MultipartUploader::new(backend.clone(), config);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });
    }

    let started = std::time::Instant::now();
    let err = uploader
        .upload_file(video.source().await, metadata(), cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, UploadError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(backend.count(&Call::Complete(vec![1, 2, 3])), 1);
    assert_eq!(backend.count(&Call::UpdateMetadata), 1);
    // 对象已合并，不再取消
    assert_eq!(backend.count(&Call::Abort), 0);
}
