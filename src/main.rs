use std::io::{IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use anyhow::{Context, Result};
use clap::Parser;
use crossterm::cursor::MoveToColumn;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind};
use crossterm::style::Print;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, Clear, ClearType};
use crossterm::{execute, queue};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use video_uploader::utils::{format_bytes, format_duration, format_speed};
use video_uploader::{
    Config,
    FileSource,
    HttpBackend,
    MultipartUploader,
    UploadError,
    UploadEvent,
    UploadMetadata,
};

/// Upload a video to the platform in parts.
#[derive(Parser, Debug)]
#[command(author, version, about = "Chunked multipart video uploader")]
struct Args {
    /// Video file to upload
    file: PathBuf,

    /// Config file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Backend API base URL (overrides `endpoint`)
    #[arg(long)]
    endpoint: Option<String>,

    /// Bearer token (overrides `token`)
    #[arg(long)]
    token: Option<String>,

    /// Environment variable holding the bearer token (overrides `token_env`)
    #[arg(long)]
    token_env: Option<String>,

    /// Video title, defaults to the file name without extension
    #[arg(short, long)]
    title: Option<String>,

    #[arg(short, long)]
    description: Option<String>,

    #[arg(long)]
    category: Option<String>,

    /// Part size in bytes
    #[arg(long)]
    chunk_size: Option<u64>,

    /// Parts uploaded at the same time
    #[arg(long)]
    concurrency: Option<usize>,

    #[arg(long)]
    max_retries: Option<u32>,
}

impl Args {
    fn load_config(&self) -> Result<Config> {
        let mut config = if self.config.exists() {
            Config::load(&self.config).with_context(|| format!("loading {}", self.config.display()))?
        } else {
            let endpoint = self
                .endpoint
                .clone()
                .with_context(|| format!("{} not found and no --endpoint given", self.config.display()))?;
            Config::new(endpoint)
        };

        if let Some(endpoint) = &self.endpoint {
            config.endpoint = endpoint.clone();
        }
        if let Some(token) = &self.token {
            config.token = Some(token.clone());
        }
        if let Some(var) = &self.token_env {
            config.token_env = Some(var.clone());
        }
        if let Some(chunk_size) = self.chunk_size {
            config.upload.chunk_size = chunk_size;
        }
        if let Some(concurrency) = self.concurrency {
            config.upload.concurrency = concurrency;
        }
        if let Some(max_retries) = self.max_retries {
            config.upload.max_retries = max_retries;
        }

        config.validate().context("invalid configuration")?;
        Ok(config)
    }

    fn metadata(&self, file: &FileSource) -> UploadMetadata {
        let title = self.title.clone().unwrap_or_else(|| {
            file.path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| file.name.clone())
        });

        let mut metadata = UploadMetadata::new(title);
        if let Some(description) = &self.description {
            metadata = metadata.with_description(description.clone());
        }
        if let Some(category) = &self.category {
            metadata = metadata.with_category(category.clone());
        }
        metadata
    }
}

/// 退出时恢复终端
struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> Option<Self> {
        enable_raw_mode().ok().map(|_| RawModeGuard)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = args.load_config()?;

    let file = FileSource::from_path(&args.file)
        .await
        .with_context(|| format!("reading {}", args.file.display()))?;
    let metadata = args.metadata(&file);

    tracing::info!(endpoint = %config.endpoint, file = %file.name, size = file.size, "Starting upload");

    let backend = HttpBackend::from_config(&config).context("creating HTTP client")?;
    let uploader = MultipartUploader::new(Arc::new(backend), config.multipart_config());

    let cancel = CancellationToken::new();
    let printer = tokio::spawn(print_events(uploader.subscribe_events()));

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let interactive = std::io::stdin().is_terminal();
    let keys_done = CancellationToken::new();
    let raw_mode = if interactive { RawModeGuard::enable() } else { None };
    let keyboard = raw_mode.as_ref().map(|_| {
        let cancel = cancel.clone();
        let done = keys_done.clone();
        tokio::task::spawn_blocking(move || watch_keys(cancel, done))
    });

    println!(
        "Uploading {} ({}), press c/q/Esc to cancel\r",
        file.name,
        format_bytes(file.size)
    );

    let total_bytes = file.size;
    let result = match uploader.upload_file(file, metadata.clone(), cancel.clone()).await {
        Ok(outcome) => Ok(outcome.video_id),
        // 对象已存储，只补写一次元数据
        Err(UploadError::MetadataUpdateFailed { video_id, source }) if !cancel.is_cancelled() => {
            tracing::warn!(%video_id, "Retrying metadata update: {}", source);
            uploader.update_metadata(&video_id, &metadata).await.map(|()| video_id)
        }
        Err(err) => Err(err),
    };

    keys_done.cancel();
    if let Some(keyboard) = keyboard {
        let _ = keyboard.await;
    }
    drop(raw_mode);
    drop(uploader);
    let _ = printer.await;
    println!();

    match result {
        Ok(video_id) => {
            println!("Uploaded {}, video id: {}", format_bytes(total_bytes), video_id);
            Ok(())
        }
        Err(UploadError::Cancelled) => {
            println!("Upload cancelled");
            Ok(())
        }
        Err(err) => Err(err).context("upload failed"),
    }
}

/// 监听按键，`c`/`q`/`Esc` 取消上传
fn watch_keys(cancel: CancellationToken, done: CancellationToken) -> std::io::Result<()> {
    while !cancel.is_cancelled() && !done.is_cancelled() {
        if !event::poll(Duration::from_millis(100))? {
            continue;
        }

        if let Event::Key(KeyEvent { code, kind, .. }) = event::read()? {
            if kind != KeyEventKind::Press {
                continue;
            }

            if matches!(code, KeyCode::Char('c') | KeyCode::Char('q') | KeyCode::Esc) {
                cancel.cancel();
            }
        }
    }

    Ok(())
}

async fn print_events(mut event_rx: broadcast::Receiver<UploadEvent>) {
    loop {
        let event = match event_rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        };

        match event {
            UploadEvent::Progress { progress, .. } => {
                let eta = progress
                    .eta
                    .map(format_duration)
                    .unwrap_or_else(|| "--".to_string());
                let line = format!(
                    "{:>5.1}%  {}/{}  part {}/{}  {}  eta {}",
                    progress.percentage,
                    format_bytes(progress.uploaded_bytes),
                    format_bytes(progress.total_bytes),
                    progress.completed_parts,
                    progress.total_parts,
                    format_speed(progress.speed),
                    eta
                );
                let mut stdout = std::io::stdout();
                let _ = queue!(stdout, MoveToColumn(0), Clear(ClearType::CurrentLine), Print(line));
                let _ = stdout.flush();
            }
            UploadEvent::StateChanged { old_state, new_state, .. } => {
                tracing::debug!("{:?} -> {:?}", old_state, new_state);
            }
            UploadEvent::PartCompleted { part_number, .. } => {
                tracing::debug!(part_number, "Part uploaded");
            }
            UploadEvent::Completed { video_id, .. } => {
                tracing::info!(%video_id, "Completed");
            }
            UploadEvent::Failed { error, .. } => {
                let _ = execute!(std::io::stdout(), MoveToColumn(0), Clear(ClearType::CurrentLine));
                tracing::error!("{}", error);
            }
        }
    }
}
