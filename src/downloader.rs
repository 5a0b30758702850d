//! Tee-stream downloader.
//!
//! One acquisition process per request; its stdout is read in bounded chunks
//! and every chunk goes, in order, to the live sink (the HTTP response) and
//! to the file sink (a session-private `.part` file). The two sinks fail
//! independently:
//!
//! * the live sink is best-effort. Chunks are queued for a per-session
//!   forwarder task, so the file sink never waits on the client. A departed
//!   client, or one that falls more than the backlog limit behind, closes it
//!   and the session keeps writing to disk;
//! * the file sink ends either *complete* (renamed to `<title>.mp4` after a
//!   clean exit) or *removed* (deleted after any failure).

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::stream::{self, Stream, StreamExt};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;

use crate::catalog::Catalog;
use crate::downloads::{InflightRegistry, SessionControl};
use crate::error::{GatewayError, GatewayResult};
use crate::paths::PathConfig;
use crate::record::Record;
use crate::utils::preview;
use crate::{log_debug, log_error, log_info, log_warn};

/// Read unit for process output.
pub const CHUNK_SIZE: usize = 16 * 1024;
/// Chunks handed to the response body ahead of the client's reads.
const LIVE_BUFFER_CHUNKS: usize = 64;
const FILE_BUFFER_BYTES: usize = 64 * 1024;

/// A running acquisition: its ordered output and its eventual exit.
pub struct Acquisition {
    pub output: Box<dyn AsyncRead + Send + Unpin>,
    /// Resolves once the process is gone; `Err` for a non-zero exit.
    pub exit: BoxFuture<'static, GatewayResult<()>>,
}

/// Starts acquisition processes.
pub trait Acquirer: Send + Sync {
    fn acquire(&self, video_id: &str) -> GatewayResult<Acquisition>;
}

/// What a download request hands to the HTTP layer.
pub enum MediaStream {
    /// Artifact already on disk; length known, seekable.
    Stored(StoredArtifact),
    /// Fresh acquisition, streamed as it arrives.
    Live(LiveStream),
}

pub struct StoredArtifact {
    pub path: PathBuf,
    pub file: File,
    pub len: u64,
}

/// Terminal state of a download session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// `artifact` is `None` when the process exited cleanly without output.
    Complete { bytes: u64, artifact: Option<PathBuf> },
    Failed { reason: String },
}

type LiveItem = Result<Bytes, GatewayError>;

/// Receiving half of the live sink.
pub struct LiveStream {
    first: Option<Bytes>,
    rx: mpsc::Receiver<LiveItem>,
    session: Option<JoinHandle<SessionOutcome>>,
}

impl LiveStream {
    /// Join handle of the session behind this stream. Dropping it detaches
    /// the session; it still runs to completion.
    pub fn take_session(&mut self) -> Option<JoinHandle<SessionOutcome>> {
        self.session.take()
    }

    pub fn into_stream(self) -> impl Stream<Item = LiveItem> + Send + 'static {
        stream::unfold((self.first, self.rx), |(first, mut rx)| async move {
            if let Some(chunk) = first {
                return Some((Ok(chunk), (None, rx)));
            }
            rx.recv().await.map(|item| (item, (None, rx)))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkState {
    Pending,
    Writing,
    Complete,
    Failed,
}

/// Writer side of the live sink. Queuing never waits; delivery to the client
/// happens on the forwarder task.
struct LiveSink {
    backlog: Option<mpsc::UnboundedSender<LiveItem>>,
    /// Bytes queued but not yet taken by the response body channel.
    queued: Arc<AtomicUsize>,
    limit: usize,
}

impl LiveSink {
    /// Starts the forwarder and returns the receiver the client reads from.
    fn spawn(session: u64, limit: usize) -> (Self, mpsc::Receiver<LiveItem>) {
        let (backlog, pending) = mpsc::unbounded_channel();
        let (client, rx) = mpsc::channel(LIVE_BUFFER_CHUNKS);
        let queued = Arc::new(AtomicUsize::new(0));
        tokio::spawn(forward_to_client(session, pending, client, Arc::clone(&queued)));

        let sink = Self {
            backlog: Some(backlog),
            queued,
            limit,
        };
        (sink, rx)
    }

    fn is_open(&self) -> bool {
        self.backlog.is_some()
    }

    fn forward(&mut self, chunk: Bytes) -> GatewayResult<()> {
        let Some(backlog) = &self.backlog else {
            return Ok(());
        };

        let len = chunk.len();
        let behind = self.queued.fetch_add(len, Ordering::SeqCst) + len;
        if behind > self.limit {
            // the client sees an error instead of a short body that looks complete
            let _ = backlog.send(Err(GatewayError::SinkWrite(
                "live client fell too far behind".into(),
            )));
            self.backlog = None;
            return Err(GatewayError::SinkWrite(format!(
                "client fell {} bytes behind",
                behind
            )));
        }

        if backlog.send(Ok(chunk)).is_err() {
            self.backlog = None;
            return Err(GatewayError::SinkWrite("client disconnected".into()));
        }
        Ok(())
    }

    /// The forwarder still delivers whatever is queued, then ends the body.
    fn close(&mut self) {
        self.backlog = None;
    }

    fn fail(&mut self, err: GatewayError) {
        if let Some(backlog) = self.backlog.take() {
            let _ = backlog.send(Err(err));
        }
    }
}

/// Moves queued chunks into the response body channel at the client's pace.
async fn forward_to_client(
    session: u64,
    mut pending: mpsc::UnboundedReceiver<LiveItem>,
    client: mpsc::Sender<LiveItem>,
    queued: Arc<AtomicUsize>,
) {
    loop {
        let item = tokio::select! {
            item = pending.recv() => item,
            () = client.closed() => break,
        };
        let Some(item) = item else {
            return;
        };

        let len = item.as_ref().map_or(0, |chunk| chunk.len());
        if client.send(item).await.is_err() {
            break;
        }
        queued.fetch_sub(len, Ordering::SeqCst);
    }
    log_debug!("[session {}] live client gone", session);
}

struct FileSink {
    part_path: PathBuf,
    final_path: PathBuf,
    writer: Option<BufWriter<File>>,
    state: SinkState,
    written: u64,
}

impl FileSink {
    fn new(part_path: PathBuf, final_path: PathBuf) -> Self {
        Self {
            part_path,
            final_path,
            writer: None,
            state: SinkState::Pending,
            written: 0,
        }
    }

    async fn open(&mut self) -> GatewayResult<()> {
        if self.writer.is_some() {
            return Ok(());
        }
        if let Some(dir) = self.part_path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| GatewayError::filesystem(dir, e))?;
        }
        let file = File::create(&self.part_path)
            .await
            .map_err(|e| GatewayError::filesystem(&self.part_path, e))?;
        self.writer = Some(BufWriter::with_capacity(FILE_BUFFER_BYTES, file));
        self.state = SinkState::Writing;
        Ok(())
    }

    async fn write(&mut self, chunk: &[u8]) -> GatewayResult<()> {
        self.open().await?;
        if let Some(writer) = self.writer.as_mut() {
            writer
                .write_all(chunk)
                .await
                .map_err(|e| GatewayError::filesystem(&self.part_path, e))?;
            self.written += chunk.len() as u64;
        }
        Ok(())
    }

    /// Flushes, closes and publishes the part file under its final name.
    async fn finish(&mut self) -> GatewayResult<Option<PathBuf>> {
        let Some(mut writer) = self.writer.take() else {
            return Ok(None);
        };

        let published = async {
            writer.flush().await?;
            writer.get_ref().sync_all().await?;
            drop(writer);
            tokio::fs::rename(&self.part_path, &self.final_path).await
        }
        .await;

        match published {
            Ok(()) => {
                self.state = SinkState::Complete;
                Ok(Some(self.final_path.clone()))
            }
            Err(e) => {
                remove_quietly(&self.part_path).await;
                self.state = SinkState::Failed;
                Err(GatewayError::filesystem(&self.final_path, e))
            }
        }
    }

    /// Closes and deletes whatever was written.
    async fn abandon(&mut self) {
        if let Some(writer) = self.writer.take() {
            drop(writer);
            remove_quietly(&self.part_path).await;
        }
        if self.state != SinkState::Pending {
            self.state = SinkState::Failed;
        }
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != ErrorKind::NotFound {
            log_error!("Error removing incomplete file {}: {}", path.display(), e);
        }
    }
}

struct DownloadSession {
    session: u64,
    video_id: String,
    live: LiveSink,
    file: FileSink,
    control: Arc<SessionControl>,
    registry: Arc<InflightRegistry>,
}

impl DownloadSession {
    async fn run(mut self, acquisition: Acquisition) -> SessionOutcome {
        let Acquisition { output, exit } = acquisition;
        let mut chunks = ReaderStream::with_capacity(output, CHUNK_SIZE);
        let mut failure = None;

        while let Some(item) = chunks.next().await {
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(e) => {
                    failure = Some(GatewayError::Acquisition(format!("output stream error: {}", e)));
                    break;
                }
            };

            // the sink opens before the first byte reaches the client, so an
            // unwritable artifact directory is still reported as an error response
            if let Err(e) = self.file.open().await {
                failure = Some(e);
                break;
            }

            if self.live.is_open() {
                if let Err(e) = self.live.forward(chunk.clone()) {
                    self.control.detach_live();
                    log_warn!(
                        "[session {}] {}; continuing download of {} to disk",
                        self.session,
                        e,
                        self.video_id
                    );
                }
            }

            if let Err(e) = self.file.write(&chunk).await {
                failure = Some(e);
                break;
            }
            self.control.add_bytes(chunk.len() as u64);
        }

        // closes our end of the pipe so an abandoned process cannot block on it
        drop(chunks);
        let exited = exit.await;

        let outcome = match failure.map_or(exited, Err) {
            Ok(()) => self.complete().await,
            Err(e) => self.fail(e).await,
        };
        self.registry.clear(self.session);
        outcome
    }

    async fn complete(&mut self) -> SessionOutcome {
        self.live.close();
        match self.file.finish().await {
            Ok(artifact) => {
                log_info!(
                    "Download completed successfully: {} ({} bytes)",
                    self.video_id,
                    self.file.written
                );
                SessionOutcome::Complete {
                    bytes: self.file.written,
                    artifact,
                }
            }
            Err(e) => {
                log_error!("Could not publish download of {}: {}", self.video_id, e);
                SessionOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }

    async fn fail(&mut self, err: GatewayError) -> SessionOutcome {
        let reason = err.to_string();
        log_error!("Download error for {}: {}", self.video_id, reason);
        self.live.fail(err);
        self.file.abandon().await;
        SessionOutcome::Failed { reason }
    }
}

/// Serves media for a video id, acquiring it when it is not on disk yet.
pub struct Downloader {
    catalog: Arc<dyn Catalog>,
    acquirer: Arc<dyn Acquirer>,
    paths: PathConfig,
    registry: Arc<InflightRegistry>,
    http: reqwest::Client,
    live_backlog: usize,
    thumbnail_fetches: AtomicU64,
}

impl Downloader {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        acquirer: Arc<dyn Acquirer>,
        paths: PathConfig,
        registry: Arc<InflightRegistry>,
        live_backlog: usize,
    ) -> GatewayResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            catalog,
            acquirer,
            paths,
            registry,
            http,
            live_backlog,
            thumbnail_fetches: AtomicU64::new(0),
        })
    }

    pub fn registry(&self) -> &Arc<InflightRegistry> {
        &self.registry
    }

    pub async fn download(&self, video_id: &str) -> GatewayResult<MediaStream> {
        let raw = self.catalog.get_by_id(video_id).await?;
        let record = Record::from_raw(&raw)
            .ok_or_else(|| GatewayError::MetadataNotFound("Video not found".into()))?;
        let title = record.file_stem();

        self.spawn_thumbnail_fetch(&record, &title);

        let artifact = self.paths.artifact_path(&title);
        if let Some(stored) = open_artifact(&artifact).await? {
            log_info!("Serving {} from disk: {}", video_id, artifact.display());
            return Ok(MediaStream::Stored(stored));
        }

        let acquisition = self.acquirer.acquire(video_id)?;
        let (session, control) = self.registry.register(video_id, &title);
        log_info!("[session {}] Acquiring {} as \"{}\"", session, video_id, title);

        let (live, mut rx) = LiveSink::spawn(session, self.live_backlog);
        let runner = DownloadSession {
            session,
            video_id: video_id.to_string(),
            live,
            file: FileSink::new(self.paths.part_path(&title, session), artifact),
            control,
            registry: Arc::clone(&self.registry),
        };
        let handle = tokio::spawn(runner.run(acquisition));

        // response headers go out with the first chunk; anything earlier is still reportable
        match rx.recv().await {
            Some(Err(e)) => Err(e),
            first => Ok(MediaStream::Live(LiveStream {
                first: first.and_then(Result::ok),
                rx,
                session: Some(handle),
            })),
        }
    }

    /// Best-effort; never observed by the caller.
    fn spawn_thumbnail_fetch(&self, record: &Record, title: &str) {
        let url = record.thumbnail_url.clone();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return;
        }
        let dest = self.paths.thumbnail_path(title);
        let fetch = self.thumbnail_fetches.fetch_add(1, Ordering::Relaxed);
        let tmp = self.paths.thumbnail_part_path(title, fetch);
        let http = self.http.clone();
        tokio::spawn(async move {
            match fetch_thumbnail(&http, &url, &dest, &tmp).await {
                Ok(true) => log_debug!("Thumbnail stored at {}", dest.display()),
                Ok(false) => {}
                Err(e) => log_warn!("Error downloading thumbnail {}: {}", preview(&url, 80), e),
            }
        });
    }
}

async fn open_artifact(path: &Path) -> GatewayResult<Option<StoredArtifact>> {
    let file = match File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(GatewayError::filesystem(path, e)),
    };
    let metadata = file
        .metadata()
        .await
        .map_err(|e| GatewayError::filesystem(path, e))?;
    if !metadata.is_file() {
        return Ok(None);
    }

    Ok(Some(StoredArtifact {
        path: path.to_path_buf(),
        file,
        len: metadata.len(),
    }))
}

/// Returns `false` when the thumbnail was already on disk. `tmp` must be
/// private to this fetch.
async fn fetch_thumbnail(
    http: &reqwest::Client,
    url: &str,
    dest: &Path,
    tmp: &Path,
) -> GatewayResult<bool> {
    if tokio::fs::try_exists(dest).await.unwrap_or(false) {
        return Ok(false);
    }

    let response = http.get(url).send().await?;
    if !response.status().is_success() {
        return Err(GatewayError::Provider(format!(
            "Failed to download thumbnail: {}",
            response.status()
        )));
    }

    let written = async {
        let file = File::create(tmp)
            .await
            .map_err(|e| GatewayError::filesystem(tmp, e))?;
        let mut file = BufWriter::new(file);
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            file.write_all(&chunk?)
                .await
                .map_err(|e| GatewayError::filesystem(tmp, e))?;
        }
        file.flush()
            .await
            .map_err(|e| GatewayError::filesystem(tmp, e))?;
        tokio::fs::rename(tmp, dest)
            .await
            .map_err(|e| GatewayError::filesystem(dest, e))
    }
    .await;

    if written.is_err() {
        remove_quietly(tmp).await;
    }
    written.map(|()| true)
}
