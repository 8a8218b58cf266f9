//! Process-wide settings, read once from the environment at startup.

use std::{
    env,
    path::{Path, PathBuf},
    time::Duration,
};

use tracing::{info, warn};

use crate::{catalog::Container, retry::RetryPolicy};

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8787";
const DEFAULT_EXTRACTOR: &str = "yt-dlp";
const DEFAULT_EXTRACTOR_TIMEOUT_SECONDS: u64 = 180;
const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 3;
const DEFAULT_FALLBACK_ATTEMPTS: u32 = 3;
const DEFAULT_FALLBACK_BACKOFF_MS: u64 = 1_000;
const MAX_FALLBACK_BACKOFF_SECONDS: u64 = 30;
const DEFAULT_CONNECT_TIMEOUT_SECONDS: u64 = 15;
const DEFAULT_READ_TIMEOUT_SECONDS: u64 = 30;
const DEFAULT_STREAM_BUFFER_CHUNKS: usize = 8;
const DEFAULT_STALE_JOB_SECONDS: u64 = 2 * 60 * 60;
const REMUX_BINARY: &str = "ffmpeg";
const KNOWN_REMUX_DIRS: [&str; 3] = ["/usr/bin", "/usr/local/bin", "/opt/homebrew/bin"];

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub allowed_origins: Vec<String>,
    pub extractor_path: PathBuf,
    pub extractor_timeout: Duration,
    /// `None` when no ffmpeg could be found; remux requests then fail fast.
    pub remux_tool: Option<PathBuf>,
    pub transfer_dir: PathBuf,
    pub accepted_containers: Vec<Container>,
    pub max_concurrent_downloads: usize,
    pub fallback_retry: RetryPolicy,
    pub upstream_connect_timeout: Duration,
    /// Longest wait for the next upstream chunk before the read fails.
    pub upstream_read_timeout: Duration,
    pub stream_buffer_chunks: usize,
    pub stale_job_after: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            allowed_origins: Vec::new(),
            extractor_path: PathBuf::from(DEFAULT_EXTRACTOR),
            extractor_timeout: Duration::from_secs(DEFAULT_EXTRACTOR_TIMEOUT_SECONDS),
            remux_tool: None,
            transfer_dir: env::temp_dir().join("vidrelay-jobs"),
            accepted_containers: vec![Container::Mp4, Container::M4v, Container::Mov],
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            fallback_retry: RetryPolicy {
                max_attempts: DEFAULT_FALLBACK_ATTEMPTS,
                base_delay: Duration::from_millis(DEFAULT_FALLBACK_BACKOFF_MS),
                max_delay: Duration::from_secs(MAX_FALLBACK_BACKOFF_SECONDS),
            },
            upstream_connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECONDS),
            upstream_read_timeout: Duration::from_secs(DEFAULT_READ_TIMEOUT_SECONDS),
            stream_buffer_chunks: DEFAULT_STREAM_BUFFER_CHUNKS,
            stale_job_after: Duration::from_secs(DEFAULT_STALE_JOB_SECONDS),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let remux_tool = resolve_remux_tool(
            read_string_env("FFMPEG_LOCATION").as_deref(),
            &KNOWN_REMUX_DIRS.map(PathBuf::from),
            || which::which(REMUX_BINARY).ok(),
        );
        match &remux_tool {
            Some(path) => info!("Remux tool found at {:?}", path),
            None => warn!(
                "ffmpeg not found (FFMPEG_LOCATION, known paths, PATH). \
                 Videos that need merging will answer 503."
            ),
        }

        let accepted_containers = read_string_env("ACCEPTED_CONTAINERS")
            .map(|value| parse_containers(&value))
            .filter(|containers| !containers.is_empty())
            .unwrap_or(defaults.accepted_containers);

        Self {
            bind_addr: resolve_bind_addr(),
            allowed_origins: read_string_env("ALLOWED_ORIGINS")
                .map(|value| {
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|origin| !origin.is_empty())
                        .map(ToString::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            extractor_path: read_string_env("YT_DLP_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.extractor_path),
            extractor_timeout: read_u64_env("YT_DLP_TIMEOUT_SECONDS")
                .filter(|value| *value > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.extractor_timeout),
            remux_tool,
            transfer_dir: read_string_env("TRANSFER_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.transfer_dir),
            accepted_containers,
            max_concurrent_downloads: read_usize_env("MAX_CONCURRENT_DOWNLOADS")
                .filter(|value| *value > 0)
                .unwrap_or(defaults.max_concurrent_downloads),
            fallback_retry: RetryPolicy {
                max_attempts: read_u64_env("FALLBACK_MAX_ATTEMPTS")
                    .filter(|value| *value > 0)
                    .map(|value| value.min(10) as u32)
                    .unwrap_or(defaults.fallback_retry.max_attempts),
                base_delay: read_u64_env("FALLBACK_BACKOFF_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.fallback_retry.base_delay),
                max_delay: defaults.fallback_retry.max_delay,
            },
            upstream_connect_timeout: read_u64_env("UPSTREAM_CONNECT_TIMEOUT_SECONDS")
                .filter(|value| *value > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.upstream_connect_timeout),
            upstream_read_timeout: read_u64_env("UPSTREAM_READ_TIMEOUT_SECONDS")
                .filter(|value| *value > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.upstream_read_timeout),
            stream_buffer_chunks: read_usize_env("STREAM_BUFFER_CHUNKS")
                .filter(|value| *value > 0)
                .unwrap_or(defaults.stream_buffer_chunks),
            stale_job_after: read_u64_env("STALE_JOB_SECONDS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.stale_job_after),
        }
    }
}

/// Explicit setting first, then well-known install directories, then `search`.
///
/// The explicit value may name the binary itself or a directory holding it,
/// the way `--ffmpeg-location` accepts both.
pub fn resolve_remux_tool(
    explicit: Option<&str>,
    known_dirs: &[PathBuf],
    search: impl FnOnce() -> Option<PathBuf>,
) -> Option<PathBuf> {
    if let Some(configured) = explicit.map(str::trim).filter(|value| !value.is_empty()) {
        let configured = Path::new(configured);
        if configured.is_file() {
            return Some(configured.to_path_buf());
        }
        if let Some(inside) = binary_in(configured) {
            return Some(inside);
        }
        warn!(
            "FFMPEG_LOCATION={:?} does not contain {REMUX_BINARY}; trying other locations",
            configured
        );
    }

    known_dirs
        .iter()
        .find_map(|dir| binary_in(dir))
        .or_else(search)
}

fn binary_in(dir: &Path) -> Option<PathBuf> {
    [REMUX_BINARY, "ffmpeg.exe"]
        .iter()
        .map(|name| dir.join(name))
        .find(|candidate| candidate.is_file())
}

pub fn parse_containers(value: &str) -> Vec<Container> {
    let mut containers: Vec<Container> = Vec::new();
    for container in value
        .split(',')
        .map(str::trim)
        .filter(|ext| !ext.is_empty())
        .map(Container::from_extension)
    {
        if !containers.contains(&container) {
            containers.push(container);
        }
    }
    containers
}

fn read_string_env(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_usize_env(name: &str) -> Option<usize> {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
}

fn read_u64_env(name: &str) -> Option<u64> {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
}

fn resolve_bind_addr() -> String {
    if let Some(configured) = read_string_env("APP_ADDR") {
        return configured;
    }

    if let Some(port) = env::var("PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
    {
        return format!("0.0.0.0:{port}");
    }

    DEFAULT_BIND_ADDR.to_string()
}
