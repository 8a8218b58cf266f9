//! Per-request pipeline: resolve the catalog, pick a format, stream it
//! directly, and fall back to a local fetch-and-remux when the direct link
//! turns out to be unusable.

use std::{collections::BTreeMap, sync::Arc};

use reqwest::StatusCode;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    catalog::{Container, FormatEntry, VideoMetadata},
    error::DeliveryError,
    extractor::Extractor,
    fallback::{LocalMedia, RemuxFallback},
    proxy::{ProxyOutcome, ProxyStream, SniffRejection, StreamProxy},
    retry::{RetryPolicy, Sleeper},
    selector::{QualityLabel, SelectionPolicy, SelectionResult, select},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Resolving,
    Selecting,
    DirectStreaming,
    LocalFallback,
    Responding,
    Failed,
}

impl Stage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Responding | Self::Failed)
    }
}

/// Stages one request went through. Once a terminal stage is reached
/// further transitions are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageTrail {
    stages: Vec<Stage>,
}

impl StageTrail {
    pub fn enter(&mut self, stage: Stage) {
        if let Some(current) = self.current()
            && current.is_terminal()
        {
            warn!("Ignoring transition {current:?} -> {stage:?}");
            return;
        }
        debug!("Entering {stage:?}");
        self.stages.push(stage);
    }

    pub fn current(&self) -> Option<Stage> {
        self.stages.last().copied()
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn into_stages(self) -> Vec<Stage> {
        self.stages
    }
}

#[derive(Debug)]
pub enum DeliveryBody {
    Direct(ProxyStream),
    Local(LocalMedia),
}

#[derive(Debug)]
pub struct Delivery {
    pub body: DeliveryBody,
    pub stages: Vec<Stage>,
}

#[derive(Debug)]
pub struct FailedDelivery {
    pub error: DeliveryError,
    pub stages: Vec<Stage>,
}

impl From<FailedDelivery> for crate::error::ApiError {
    fn from(failure: FailedDelivery) -> Self {
        failure.error.into()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeInfo {
    #[serde(flatten)]
    pub metadata: VideoMetadata,
    pub qualities: Vec<String>,
    pub ext: String,
    /// URL that would be streamed as-is; `None` when a remux is needed.
    pub direct_url: Option<String>,
    pub format_id: Option<String>,
}

#[derive(Clone)]
pub struct Orchestrator {
    extractor: Arc<dyn Extractor>,
    proxy: StreamProxy,
    fallback: Arc<RemuxFallback>,
    retry: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    policy: SelectionPolicy,
    download_slots: Arc<Semaphore>,
}

impl Orchestrator {
    pub fn new(
        extractor: Arc<dyn Extractor>,
        proxy: StreamProxy,
        fallback: RemuxFallback,
        retry: RetryPolicy,
        sleeper: Arc<dyn Sleeper>,
        policy: SelectionPolicy,
        max_concurrent_downloads: usize,
    ) -> Self {
        Self {
            extractor,
            proxy,
            fallback: Arc::new(fallback),
            retry,
            sleeper,
            policy,
            download_slots: Arc::new(Semaphore::new(max_concurrent_downloads.max(1))),
        }
    }

    pub fn extractor_name(&self) -> &'static str {
        self.extractor.name()
    }

    pub fn remux_available(&self) -> bool {
        self.fallback.remux_available()
    }

    pub async fn probe_info(&self, source_url: &str) -> Result<ProbeInfo, DeliveryError> {
        let source_url = validate_source_url(source_url)?;
        let catalog = self
            .extractor
            .extract_metadata(&source_url)
            .await
            .map_err(DeliveryError::ExtractionFailure)?;

        let qualities = catalog.available_qualities();
        let (ext, direct_url, format_id) =
            match select(&catalog.formats, &QualityLabel::Best, &self.policy) {
                SelectionResult::Direct { format, container } => (
                    container.extension().to_string(),
                    Some(format.url),
                    Some(format.format_id),
                ),
                SelectionResult::RequireRemux => {
                    (self.fallback.container().extension().to_string(), None, None)
                }
            };

        Ok(ProbeInfo {
            metadata: catalog.metadata,
            qualities,
            ext,
            direct_url,
            format_id,
        })
    }

    pub async fn resolve_and_deliver(
        &self,
        source_url: &str,
        quality: &str,
    ) -> Result<Delivery, FailedDelivery> {
        let mut trail = StageTrail::default();
        match self.deliver(source_url, quality, &mut trail).await {
            Ok(body) => {
                trail.enter(Stage::Responding);
                info!("Delivering {source_url} via {:?}", trail.stages());
                Ok(Delivery {
                    body,
                    stages: trail.into_stages(),
                })
            }
            Err(error) => {
                trail.enter(Stage::Failed);
                warn!("Delivery of {source_url:?} failed after {:?}: {error}", trail.stages());
                Err(FailedDelivery {
                    error,
                    stages: trail.into_stages(),
                })
            }
        }
    }

    async fn deliver(
        &self,
        source_url: &str,
        quality: &str,
        trail: &mut StageTrail,
    ) -> Result<DeliveryBody, DeliveryError> {
        trail.enter(Stage::Resolving);
        let source_url = validate_source_url(source_url)?;
        let quality = QualityLabel::parse(quality);
        let catalog = self
            .extractor
            .extract_metadata(&source_url)
            .await
            .map_err(DeliveryError::ExtractionFailure)?;
        let title = catalog.metadata.title.clone();

        trail.enter(Stage::Selecting);
        let direct_status = match select(&catalog.formats, &quality, &self.policy) {
            SelectionResult::RequireRemux => {
                info!("No directly playable format at {quality}; merging locally");
                None
            }
            SelectionResult::Direct { format, container } => {
                trail.enter(Stage::DirectStreaming);
                let attempt = self
                    .proxy
                    .proxy(&format, &container, &catalog.default_headers, &title)
                    .await;
                match attempt.outcome {
                    ProxyOutcome::Streaming(stream) => return Ok(DeliveryBody::Direct(stream)),
                    ProxyOutcome::HttpError(status) if is_authorization_status(status) => {
                        info!("Format {} answered {status}; falling back", attempt.format_id);
                        Some(status.as_u16())
                    }
                    ProxyOutcome::SniffRejected(SniffRejection::HlsManifest) => {
                        info!("Format {} is a playlist; falling back", attempt.format_id);
                        None
                    }
                    ProxyOutcome::NetworkError(error) => {
                        info!("Format {} unreachable ({error}); falling back", attempt.format_id);
                        None
                    }
                    ProxyOutcome::SniffRejected(SniffRejection::HtmlError) => {
                        return Err(DeliveryError::InvalidUpstreamContent(format!(
                            "format {} returned an HTML page instead of media",
                            attempt.format_id
                        )));
                    }
                    ProxyOutcome::HttpError(status) => {
                        return Err(DeliveryError::UpstreamUnavailable(format!(
                            "format {} answered {status}",
                            attempt.format_id
                        )));
                    }
                }
            }
        };

        trail.enter(Stage::LocalFallback);
        self.run_fallback(&source_url, quality, &title, &catalog.default_headers)
            .await
            .map(DeliveryBody::Local)
            .map_err(|error| error.with_upstream_status(direct_status))
    }

    /// Runs on its own task so a cancelled request still lets the job finish
    /// and remove its directory.
    async fn run_fallback(
        &self,
        source_url: &str,
        quality: QualityLabel,
        title: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<LocalMedia, DeliveryError> {
        if !self.fallback.remux_available() {
            return Err(DeliveryError::RemuxUnavailable);
        }

        let fallback = Arc::clone(&self.fallback);
        let sleeper = Arc::clone(&self.sleeper);
        let slots = Arc::clone(&self.download_slots);
        let retry = self.retry;
        let source_url = source_url.to_string();
        let title = title.to_string();
        let headers = headers.clone();

        let task = tokio::spawn(async move {
            let _permit = slots
                .acquire_owned()
                .await
                .map_err(|_| DeliveryError::Internal("download slots closed".to_string()))?;

            let (fallback, source_url, title, headers) =
                (fallback.as_ref(), source_url.as_str(), title.as_str(), &headers);
            retry
                .run(
                    sleeper.as_ref(),
                    "local fallback",
                    DeliveryError::is_retryable,
                    move |attempt| async move {
                        debug!("Local fallback attempt {attempt} for {source_url}");
                        fallback
                            .fetch_and_remux(source_url, quality, title, headers)
                            .await
                    },
                )
                .await
        });

        task.await
            .map_err(|error| DeliveryError::Internal(format!("fallback task failed: {error}")))?
    }

    /// Streams a caller-supplied media URL without consulting the extractor.
    pub async fn relay_direct(
        &self,
        media_url: &str,
        title: Option<&str>,
        ext: Option<&str>,
    ) -> Result<ProxyStream, DeliveryError> {
        let media_url = validate_source_url(media_url)?;
        let container = ext
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| Container::from_extension(value.trim_start_matches('.')))
            .or_else(|| extension_from_url(&media_url))
            .unwrap_or(Container::Mp4);
        let title = title
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or("video");

        let entry = FormatEntry::direct(media_url, container.clone());
        let attempt = self
            .proxy
            .proxy(&entry, &container, &BTreeMap::new(), title)
            .await;

        match attempt.outcome {
            ProxyOutcome::Streaming(stream) => Ok(stream),
            ProxyOutcome::HttpError(status) if is_authorization_status(status) => Err(
                DeliveryError::UpstreamRejected(format!("the media URL answered {status}")),
            ),
            ProxyOutcome::HttpError(status) => Err(DeliveryError::UpstreamUnavailable(format!(
                "the media URL answered {status}"
            ))),
            ProxyOutcome::SniffRejected(SniffRejection::HlsManifest) => {
                Err(DeliveryError::UpstreamRejected(
                    "the media URL is a streaming playlist".to_string(),
                ))
            }
            ProxyOutcome::SniffRejected(SniffRejection::HtmlError) => {
                Err(DeliveryError::InvalidUpstreamContent(
                    "the media URL returned an HTML page".to_string(),
                ))
            }
            ProxyOutcome::NetworkError(error) => Err(DeliveryError::UpstreamUnavailable(error)),
        }
    }
}

/// Trimmed, non-empty, absolute http(s) URL.
pub fn validate_source_url(input: &str) -> Result<String, DeliveryError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(DeliveryError::InvalidRequest("Enter a video URL.".to_string()));
    }

    let parsed = Url::parse(trimmed)
        .map_err(|_| DeliveryError::InvalidRequest(format!("Not a valid URL: {trimmed}")))?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(DeliveryError::InvalidRequest(
            "Only http and https URLs are supported.".to_string(),
        ));
    }

    Ok(trimmed.to_string())
}

fn is_authorization_status(status: StatusCode) -> bool {
    matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN)
}

fn extension_from_url(raw: &str) -> Option<Container> {
    let parsed = Url::parse(raw).ok()?;
    let last = parsed.path_segments()?.next_back()?;
    let (_, ext) = last.rsplit_once('.')?;
    (!ext.is_empty()).then(|| Container::from_extension(ext))
}
