//! Local fetch-and-remux: the extractor downloads the best video and audio
//! into a per-job directory and merges them with the remux tool.

use std::{
    collections::BTreeMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::Stream;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    catalog::Container,
    error::DeliveryError,
    extractor::{Extractor, ExtractorErrorKind, ExtractorOptions},
    filename::attachment_filename,
    selector::QualityLabel,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Created,
    InProgress,
    Completed,
    Failed,
}

/// Owns one uniquely named directory; the directory is removed exactly once,
/// either by [`DownloadJob::cleanup`] or when the job is dropped. Inside a
/// runtime the drop hands the removal to the blocking pool.
#[derive(Debug)]
pub struct DownloadJob {
    id: Uuid,
    source_url: String,
    quality: QualityLabel,
    dir: PathBuf,
    created_at: DateTime<Utc>,
    state: JobState,
    removed: bool,
}

impl DownloadJob {
    pub async fn create(
        transfer_dir: &Path,
        source_url: &str,
        quality: QualityLabel,
    ) -> Result<Self, DeliveryError> {
        tokio::fs::create_dir_all(transfer_dir)
            .await
            .map_err(|error| {
                DeliveryError::Internal(format!(
                    "Could not prepare the transfer directory: {error}"
                ))
            })?;

        let id = Uuid::new_v4();
        let dir = transfer_dir.join(id.to_string());
        tokio::fs::create_dir(&dir).await.map_err(|error| {
            DeliveryError::Internal(format!("Could not create the job directory: {error}"))
        })?;

        debug!("Created job {id} at {:?}", dir);
        Ok(Self {
            id,
            source_url: source_url.to_string(),
            quality,
            dir,
            created_at: Utc::now(),
            state: JobState::Created,
            removed: false,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    pub fn quality(&self) -> QualityLabel {
        self.quality
    }

    fn mark(&mut self, state: JobState) {
        debug!("Job {} {:?} -> {:?}", self.id, self.state, state);
        self.state = state;
    }

    pub async fn cleanup(mut self) {
        self.removed = true;
        let result = tokio::fs::remove_dir_all(&self.dir).await;
        remove_job_dir(&self.dir, self.id, self.created_at, result);
    }
}

impl Drop for DownloadJob {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        self.removed = true;

        let (dir, id, created_at) = (self.dir.clone(), self.id, self.created_at);
        let remove = move || {
            let result = std::fs::remove_dir_all(&dir);
            remove_job_dir(&dir, id, created_at, result);
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(remove);
            }
            Err(_) => remove(),
        }
    }
}

fn remove_job_dir(dir: &Path, id: Uuid, created_at: DateTime<Utc>, result: std::io::Result<()>) {
    let age_ms = (Utc::now() - created_at).num_milliseconds();
    match result {
        Ok(()) => debug!("Removed job {id} after {age_ms} ms"),
        Err(error) if error.kind() == ErrorKind::NotFound => {}
        Err(error) => warn!("Could not remove job directory {:?}: {error}", dir),
    }
}

/// A merged file ready to be served. The job directory goes away when this
/// value, or the stream made from it, is dropped.
#[derive(Debug)]
pub struct LocalMedia {
    pub path: PathBuf,
    pub filename: String,
    pub container: Container,
    pub size: u64,
    file: tokio::fs::File,
    job: DownloadJob,
}

impl LocalMedia {
    pub fn job_dir(&self) -> &Path {
        self.job.dir()
    }

    pub fn into_stream(self) -> MediaStream {
        MediaStream {
            reader: ReaderStream::new(self.file),
            _job: self.job,
        }
    }
}

/// Reads a merged file while holding its job, so the directory is removed
/// only after the body is finished or abandoned.
pub struct MediaStream {
    reader: ReaderStream<tokio::fs::File>,
    _job: DownloadJob,
}

impl Stream for MediaStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.reader).poll_next(cx)
    }
}

#[derive(Clone)]
pub struct RemuxFallback {
    extractor: Arc<dyn Extractor>,
    remux_tool: Option<PathBuf>,
    transfer_dir: PathBuf,
    container: Container,
}

impl RemuxFallback {
    pub fn new(
        extractor: Arc<dyn Extractor>,
        remux_tool: Option<PathBuf>,
        transfer_dir: PathBuf,
        container: Container,
    ) -> Self {
        Self {
            extractor,
            remux_tool,
            transfer_dir,
            container,
        }
    }

    pub fn remux_available(&self) -> bool {
        self.remux_tool.is_some()
    }

    pub fn transfer_dir(&self) -> &Path {
        &self.transfer_dir
    }

    /// Container requested from the merge step.
    pub fn container(&self) -> &Container {
        &self.container
    }

    /// The extractor may settle on another container than the one asked for
    /// when the streams cannot be merged into it; the file's extension wins.
    fn output_container(&self, path: &Path) -> Container {
        let produced = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(Container::from_extension);
        match produced {
            Some(container) if container != self.container => {
                warn!(
                    "Merged output {:?} is .{} instead of .{}",
                    path,
                    container.extension(),
                    self.container.extension()
                );
                container
            }
            Some(container) => container,
            None => self.container.clone(),
        }
    }

    pub async fn fetch_and_remux(
        &self,
        source_url: &str,
        quality: QualityLabel,
        title: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<LocalMedia, DeliveryError> {
        let remux_tool = self
            .remux_tool
            .clone()
            .ok_or(DeliveryError::RemuxUnavailable)?;

        let mut job = DownloadJob::create(&self.transfer_dir, source_url, quality).await?;
        job.mark(JobState::InProgress);
        info!("Job {} fetching {source_url} at {quality} for local remux", job.id());

        let outcome = self.run_job(&job, remux_tool, headers).await;
        match outcome {
            Ok(path) => match open_media(&path).await {
                Ok((file, size)) => {
                    job.mark(JobState::Completed);
                    let container = self.output_container(&path);
                    Ok(LocalMedia {
                        filename: attachment_filename(title, &container),
                        container,
                        path,
                        size,
                        file,
                        job,
                    })
                }
                Err(error) => {
                    job.mark(JobState::Failed);
                    job.cleanup().await;
                    Err(error)
                }
            },
            Err(error) => {
                job.mark(JobState::Failed);
                job.cleanup().await;
                Err(error)
            }
        }
    }

    async fn run_job(
        &self,
        job: &DownloadJob,
        remux_tool: PathBuf,
        headers: &BTreeMap<String, String>,
    ) -> Result<PathBuf, DeliveryError> {
        let options = ExtractorOptions {
            format_expression: format_expression(job.quality(), &self.container),
            merge_container: self.container.clone(),
            headers: headers.clone(),
            output_template: format!(
                "{}/%(title).140B-%(id)s.%(ext)s",
                job.dir().to_string_lossy()
            ),
            remux_tool,
        };

        let printed = self
            .extractor
            .download(job.source_url(), &options)
            .await
            .map_err(|error| match error.kind {
                ExtractorErrorKind::NotInstalled => DeliveryError::ExtractionFailure(error),
                _ => DeliveryError::RemuxFailure {
                    reason: error.message,
                    upstream_status: error.http_status,
                },
            })?;

        resolve_output(job.dir(), printed.as_deref(), &self.container).await
    }
}

/// `-f` expression preferring streams that merge into `container` without re-encoding.
pub fn format_expression(quality: QualityLabel, container: &Container) -> String {
    let height = quality
        .height_limit()
        .map(|limit| format!("[height<={limit}]"))
        .unwrap_or_default();

    let mut choices = Vec::with_capacity(5);
    if container.is_mp4_family() {
        choices.push(format!("bestvideo{height}[ext=mp4]+bestaudio[ext=m4a]"));
    }
    choices.push(format!("bestvideo{height}+bestaudio"));
    if container.is_mp4_family() {
        choices.push(format!("best{height}[ext=mp4]"));
    }
    choices.push(format!("best{height}"));
    if !height.is_empty() {
        choices.push("best".to_string());
    }
    choices.join("/")
}

async fn open_media(path: &Path) -> Result<(tokio::fs::File, u64), DeliveryError> {
    let metadata = tokio::fs::metadata(path).await.map_err(|error| {
        DeliveryError::Internal(format!("Could not read the merged file: {error}"))
    })?;
    let file = tokio::fs::File::open(path).await.map_err(|error| {
        DeliveryError::Internal(format!("Could not open the merged file: {error}"))
    })?;
    Ok((file, metadata.len()))
}

/// Trusts the path the extractor printed if it is inside the job directory;
/// otherwise looks for any file with the target extension there.
async fn resolve_output(
    job_dir: &Path,
    printed_path: Option<&Path>,
    container: &Container,
) -> Result<PathBuf, DeliveryError> {
    let canonical_job_dir = tokio::fs::canonicalize(job_dir).await.map_err(|error| {
        DeliveryError::Internal(format!("Could not resolve the job directory: {error}"))
    })?;

    if let Some(path) = printed_path {
        let candidates = [path.to_path_buf(), job_dir.join(path)];
        for candidate in candidates {
            if let Some(valid) = resolve_candidate(&canonical_job_dir, &candidate).await? {
                return Ok(valid);
            }
        }
        debug!("Printed output {:?} not found; searching {:?}", path, job_dir);
    }

    let mut entries = tokio::fs::read_dir(job_dir).await.map_err(|error| {
        DeliveryError::Internal(format!("Could not open the job directory: {error}"))
    })?;

    let mut found = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(|error| {
        DeliveryError::Internal(format!("Could not list the job directory: {error}"))
    })? {
        let path = entry.path();
        let matches_container = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case(container.extension()));
        if matches_container
            && let Some(valid) = resolve_candidate(&canonical_job_dir, &path).await?
        {
            found.push(valid);
        }
    }

    found.sort();
    found.into_iter().next().ok_or_else(|| {
        DeliveryError::remux_failure(format!(
            "the remux step produced no .{} file",
            container.extension()
        ))
    })
}

async fn resolve_candidate(
    canonical_job_dir: &Path,
    candidate: &Path,
) -> Result<Option<PathBuf>, DeliveryError> {
    let metadata = match tokio::fs::metadata(candidate).await {
        Ok(metadata) => metadata,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
        Err(error) => {
            return Err(DeliveryError::Internal(format!(
                "Could not inspect downloaded file: {error}"
            )));
        }
    };
    if !metadata.is_file() {
        return Ok(None);
    }

    let canonical = tokio::fs::canonicalize(candidate).await.map_err(|error| {
        DeliveryError::Internal(format!("Could not resolve downloaded file: {error}"))
    })?;
    if !canonical.starts_with(canonical_job_dir) {
        warn!("Ignoring output outside the job directory: {:?}", canonical);
        return Ok(None);
    }

    Ok(Some(canonical))
}

/// Removes job directories left behind by a previous process.
pub async fn cleanup_stale_jobs(transfer_dir: &Path, older_than: std::time::Duration) {
    if older_than.is_zero() {
        return;
    }

    let mut entries = match tokio::fs::read_dir(transfer_dir).await {
        Ok(entries) => entries,
        Err(error) => {
            if error.kind() != ErrorKind::NotFound {
                warn!("Could not open transfer directory for cleanup: {error}");
            }
            return;
        }
    };

    let now = std::time::SystemTime::now();
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(error) => {
                warn!("Could not iterate transfer directory: {error}");
                break;
            }
        };

        let path = entry.path();
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age < older_than {
            continue;
        }

        let result = if metadata.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        match result {
            Ok(()) => info!("Removed stale job entry {:?}", path),
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => warn!("Could not remove stale job entry {:?}: {error}", path),
        }
    }
}
