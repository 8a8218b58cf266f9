#![allow(dead_code)]

use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    Router,
    http::{StatusCode, header::CONTENT_TYPE},
    routing::get,
};
use tempfile::TempDir;
use tokio::net::TcpListener;
use vidrelay::{
    catalog::{Catalog, Container},
    extractor::{Extractor, ExtractorError, ExtractorOptions},
    fallback::RemuxFallback,
    orchestrator::Orchestrator,
    proxy::StreamProxy,
    retry::{RetryPolicy, Sleeper},
    routes::{AppState, build_cors_layer, build_router},
    selector::SelectionPolicy,
};

pub const MERGED_PAYLOAD: &[u8] = b"\x00\x00\x00\x18ftypisom merged by the fake extractor";

pub fn mp4_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0x00, 0x00, 0x00, 0x18];
    bytes.extend_from_slice(b"ftypisom\x00\x00\x02\x00isomiso2");
    bytes.resize(len, 0x5A);
    bytes
}

async fn serve(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Stands in for a CDN.
pub async fn start_upstream() -> SocketAddr {
    serve(
        Router::new()
            .route(
                "/clip.mp4",
                get(|| async { ([(CONTENT_TYPE, "video/mp4")], mp4_bytes(96 * 1024)) }),
            )
            .route("/signed.mp4", get(|| async { StatusCode::FORBIDDEN })),
    )
    .await
}

/// yt-dlp style JSON for a single progressive format at `url`.
pub fn single_format_catalog(url: &str) -> Catalog {
    let json = serde_json::json!({
        "title": "Sunset: over/the bay",
        "duration": 95.0,
        "formats": [{
            "format_id": "18",
            "url": url,
            "ext": "mp4",
            "vcodec": "avc1.42001E",
            "acodec": "mp4a.40.2",
            "protocol": "https",
            "height": 360,
        }],
    });
    Catalog::from_json(json.to_string().as_bytes()).unwrap()
}

pub fn manifest_catalog() -> Catalog {
    let json = serde_json::json!({
        "title": "Live replay",
        "formats": [{
            "format_id": "hls-720",
            "url": "https://cdn.example/hls/master.m3u8",
            "ext": "mp4",
            "vcodec": "avc1.64001F",
            "acodec": "mp4a.40.2",
            "protocol": "m3u8_native",
            "height": 720,
        }],
    });
    Catalog::from_json(json.to_string().as_bytes()).unwrap()
}

pub struct FakeExtractor {
    catalog: Catalog,
    merge_succeeds: bool,
    pub downloads: Mutex<u32>,
}

impl FakeExtractor {
    pub fn new(catalog: Catalog, merge_succeeds: bool) -> Self {
        Self {
            catalog,
            merge_succeeds,
            downloads: Mutex::new(0),
        }
    }
}

#[async_trait]
impl Extractor for FakeExtractor {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn extract_metadata(&self, _url: &str) -> Result<Catalog, ExtractorError> {
        Ok(self.catalog.clone())
    }

    async fn download(
        &self,
        _url: &str,
        options: &ExtractorOptions,
    ) -> Result<Option<PathBuf>, ExtractorError> {
        *self.downloads.lock().unwrap() += 1;
        let dir = Path::new(&options.output_template).parent().unwrap();
        std::fs::write(dir.join("partial.f137.mp4.part"), b"partial").unwrap();
        if !self.merge_succeeds {
            return Err(ExtractorError::failed("ERROR: Postprocessing: Conversion failed!"));
        }
        let output = dir.join("Sunset-abc123.mp4");
        std::fs::write(&output, MERGED_PAYLOAD).unwrap();
        Ok(Some(output))
    }
}

struct InstantSleeper;

#[async_trait]
impl Sleeper for InstantSleeper {
    async fn sleep(&self, _duration: Duration) {}
}

pub struct TestApp {
    pub base: String,
    pub transfer: TempDir,
    pub extractor: Arc<FakeExtractor>,
}

impl TestApp {
    pub async fn start(extractor: FakeExtractor, remux_available: bool) -> Self {
        let transfer = tempfile::tempdir().unwrap();
        let extractor = Arc::new(extractor);
        let fallback = RemuxFallback::new(
            extractor.clone(),
            remux_available.then(|| PathBuf::from("/usr/bin/ffmpeg")),
            transfer.path().to_path_buf(),
            Container::Mp4,
        );
        let orchestrator = Orchestrator::new(
            extractor.clone(),
            StreamProxy::new(reqwest::Client::new(), 4),
            fallback,
            RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
            },
            Arc::new(InstantSleeper),
            SelectionPolicy::default(),
            2,
        );
        let router = build_router(
            AppState {
                orchestrator: Arc::new(orchestrator),
            },
            build_cors_layer(&[]).unwrap(),
        );
        let addr = serve(router).await;

        Self {
            base: format!("http://{addr}"),
            transfer,
            extractor,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    pub fn download_calls(&self) -> u32 {
        *self.extractor.downloads.lock().unwrap()
    }

    /// Job directories are removed once the response body is dropped,
    /// which can land just after the client has read the last byte.
    pub async fn wait_for_empty_transfer_dir(&self) -> bool {
        for _ in 0..50 {
            let remaining = std::fs::read_dir(self.transfer.path())
                .map(|entries| entries.count())
                .unwrap_or(0);
            if remaining == 0 {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }
}
