//! Relays a direct upstream URL to the client.
//!
//! The response is read until the sniff window is full, classified, and only
//! then handed over. After that a forwarding task moves chunks through a
//! bounded channel, so a slow client stalls the upstream read instead of
//! growing a buffer. Dropping the receiving side stops the task and
//! releases the upstream connection. Every upstream read is bounded by an
//! idle timeout, so a stalled source surfaces as a network error.

use std::{collections::BTreeMap, io, time::Duration};

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt, stream};
use reqwest::{
    StatusCode,
    header::{
        ACCEPT, ACCEPT_ENCODING, ACCEPT_LANGUAGE, CONTENT_TYPE, HeaderMap, HeaderName,
        HeaderValue, USER_AGENT,
    },
};
use tokio::{sync::mpsc, time::timeout};
use tracing::{debug, info, warn};

use crate::{
    catalog::{Container, FormatEntry},
    filename::attachment_filename,
    sniffer::{SNIFF_WINDOW, Sniffed, classify},
};

pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

pub type ChunkReceiver = mpsc::Receiver<Result<Bytes, io::Error>>;

/// What the client is about to receive.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseMeta {
    /// Container after sniffing, which may differ from the advertised one.
    pub container: Container,
    pub content_type: String,
    pub filename: String,
    pub content_length: Option<u64>,
    pub format_id: String,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
}

#[derive(Debug)]
pub struct ProxyStream {
    pub meta: ResponseMeta,
    body: ChunkReceiver,
}

impl ProxyStream {
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, io::Error>> + Send + 'static {
        stream::unfold(self.body, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SniffRejection {
    HtmlError,
    HlsManifest,
}

#[derive(Debug)]
pub enum ProxyOutcome {
    Streaming(ProxyStream),
    HttpError(StatusCode),
    SniffRejected(SniffRejection),
    NetworkError(String),
}

/// One direct streaming try.
#[derive(Debug)]
pub struct ProxyAttempt {
    pub format_id: String,
    pub request_headers: HeaderMap,
    pub outcome: ProxyOutcome,
}

impl ProxyAttempt {
    pub fn is_authorization_failure(&self) -> bool {
        matches!(
            self.outcome,
            ProxyOutcome::HttpError(StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN)
        )
    }
}

#[derive(Debug, Clone)]
pub struct StreamProxy {
    client: reqwest::Client,
    buffer_chunks: usize,
    idle_timeout: Duration,
}

impl StreamProxy {
    pub fn new(client: reqwest::Client, buffer_chunks: usize) -> Self {
        Self {
            client,
            buffer_chunks: buffer_chunks.max(1),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    /// Longest wait for the next upstream chunk before the transfer is
    /// treated as broken.
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn build_client(
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> reqwest::Result<reqwest::Client> {
        reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .read_timeout(read_timeout)
            .build()
    }

    /// `fallback_headers` apply when the entry carries no headers of its own.
    pub async fn proxy(
        &self,
        entry: &FormatEntry,
        expected: &Container,
        fallback_headers: &BTreeMap<String, String>,
        title: &str,
    ) -> ProxyAttempt {
        let request_headers = build_request_headers(entry, fallback_headers);
        let outcome = self
            .open(entry, expected, request_headers.clone(), title)
            .await;

        match &outcome {
            ProxyOutcome::Streaming(stream) => info!(
                "Streaming format {} as {} ({})",
                entry.format_id, stream.meta.container, stream.meta.content_type
            ),
            ProxyOutcome::HttpError(status) => {
                warn!("Upstream answered {status} for format {}", entry.format_id)
            }
            ProxyOutcome::SniffRejected(reason) => {
                warn!("Upstream body for format {} rejected: {reason:?}", entry.format_id)
            }
            ProxyOutcome::NetworkError(error) => {
                warn!("Direct fetch of format {} failed: {error}", entry.format_id)
            }
        }

        ProxyAttempt {
            format_id: entry.format_id.clone(),
            request_headers,
            outcome,
        }
    }

    async fn open(
        &self,
        entry: &FormatEntry,
        expected: &Container,
        headers: HeaderMap,
        title: &str,
    ) -> ProxyOutcome {
        let response = match self.client.get(&entry.url).headers(headers).send().await {
            Ok(response) => response,
            Err(error) => return ProxyOutcome::NetworkError(error.to_string()),
        };

        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            return ProxyOutcome::HttpError(status);
        }

        let upstream_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(ToString::to_string);
        let content_length = response.content_length();
        let mut upstream = response.bytes_stream();

        let mut prefix = BytesMut::with_capacity(SNIFF_WINDOW);
        while prefix.len() < SNIFF_WINDOW {
            match timeout(self.idle_timeout, upstream.next()).await {
                Ok(Some(Ok(chunk))) => prefix.extend_from_slice(&chunk),
                Ok(Some(Err(error))) => return ProxyOutcome::NetworkError(error.to_string()),
                Ok(None) => break,
                Err(_) => {
                    return ProxyOutcome::NetworkError(format!(
                        "upstream sent nothing for {} s",
                        self.idle_timeout.as_secs_f32()
                    ));
                }
            }
        }
        if prefix.is_empty() {
            return ProxyOutcome::NetworkError("upstream returned an empty body".to_string());
        }

        let container = match classify(&prefix, expected) {
            Sniffed::HtmlError => return ProxyOutcome::SniffRejected(SniffRejection::HtmlError),
            Sniffed::HlsManifest => {
                return ProxyOutcome::SniffRejected(SniffRejection::HlsManifest);
            }
            Sniffed::Ok(container) => container,
            Sniffed::UnknownBinary => {
                debug!(
                    "No container signature for format {}; relaying as {expected}",
                    entry.format_id
                );
                expected.clone()
            }
        };

        let content_type = match upstream_type {
            Some(value)
                if &container == expected
                    && (value.starts_with("video/") || value.starts_with("audio/")) =>
            {
                value
            }
            _ => container.content_type().to_string(),
        };

        let receiver = spawn_forwarder(
            entry.format_id.clone(),
            prefix.freeze(),
            upstream,
            self.buffer_chunks,
            self.idle_timeout,
        );

        ProxyOutcome::Streaming(ProxyStream {
            meta: ResponseMeta {
                filename: attachment_filename(title, &container),
                container,
                content_type,
                content_length,
                format_id: entry.format_id.clone(),
                video_codec: entry.video_codec.clone(),
                audio_codec: entry.audio_codec.clone(),
            },
            body: receiver,
        })
    }
}

/// Moves `prefix` and then the rest of `upstream` into a channel holding at
/// most `buffer_chunks` items. The task ends when the upstream finishes,
/// fails, stalls past `idle_timeout`, or the receiver is dropped; the
/// upstream is dropped with it.
pub fn spawn_forwarder<S, E>(
    format_id: String,
    prefix: Bytes,
    mut upstream: S,
    buffer_chunks: usize,
    idle_timeout: Duration,
) -> ChunkReceiver
where
    S: Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    let (sender, receiver) = mpsc::channel(buffer_chunks.max(1));
    tokio::spawn(async move {
        if sender.send(Ok(prefix)).await.is_err() {
            return;
        }
        loop {
            let item = match timeout(idle_timeout, upstream.next()).await {
                Ok(Some(item)) => item.map_err(io::Error::other),
                Ok(None) => return,
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "upstream stalled mid-transfer",
                )),
            };
            let failed = item.is_err();
            if sender.send(item).await.is_err() {
                debug!("Client went away; dropping upstream for format {format_id}");
                return;
            }
            if failed {
                warn!("Upstream stream for format {format_id} broke mid-transfer");
                return;
            }
        }
    });
    receiver
}

/// Browser identity plus the entry's own headers, or the generic ones.
pub fn build_request_headers(
    entry: &FormatEntry,
    fallback_headers: &BTreeMap<String, String>,
) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));
    headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
    headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));

    let specific = if entry.http_headers.is_empty() {
        fallback_headers
    } else {
        &entry.http_headers
    };

    for (name, value) in specific {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            // Compressed bodies would defeat sniffing and the byte-for-byte relay.
            (Ok(name), _) if name == ACCEPT_ENCODING => {}
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => debug!("Skipping unusable upstream header {name:?}"),
        }
    }

    headers
}
