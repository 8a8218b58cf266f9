//! The metadata extractor seam, and its `yt-dlp` implementation.

use std::{
    collections::BTreeMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{process::Command, time::timeout};
use tracing::debug;

use crate::catalog::{Catalog, Container};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractorErrorKind {
    NotInstalled,
    TimedOut,
    InvalidOutput,
    Failed,
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ExtractorError {
    pub kind: ExtractorErrorKind,
    pub message: String,
    /// Status the source answered with, when the extractor reported one.
    pub http_status: Option<u16>,
}

impl ExtractorError {
    pub fn new(kind: ExtractorErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            http_status: None,
        }
    }

    /// A failed run; the HTTP status is recovered from the message if present.
    pub fn failed(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: ExtractorErrorKind::Failed,
            http_status: parse_http_status(&message),
            message,
        }
    }

    pub fn is_forbidden(&self) -> bool {
        matches!(self.http_status, Some(401 | 403))
    }
}

/// What a download+merge run should do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractorOptions {
    /// Format selection expression (`-f`), e.g. `bestvideo+bestaudio/best`.
    pub format_expression: String,
    /// Container the streams get merged into (`--merge-output-format`).
    pub merge_container: Container,
    /// Extra request headers (`--add-header`).
    pub headers: BTreeMap<String, String>,
    /// Output path template (`-o`); its directory is where files land.
    pub output_template: String,
    /// Remux tool handed to the extractor (`--ffmpeg-location`).
    pub remux_tool: PathBuf,
}

#[async_trait]
pub trait Extractor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Metadata and format catalog, no download.
    async fn extract_metadata(&self, url: &str) -> Result<Catalog, ExtractorError>;

    /// Downloads and merges according to `options`. Returns the final path
    /// if the extractor reported one.
    async fn download(
        &self,
        url: &str,
        options: &ExtractorOptions,
    ) -> Result<Option<PathBuf>, ExtractorError>;
}

/// Runs the `yt-dlp` executable.
#[derive(Debug, Clone)]
pub struct YtDlp {
    executable: PathBuf,
    timeout: Duration,
}

impl YtDlp {
    pub fn new(executable: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            executable: executable.into(),
            timeout,
        }
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    pub async fn version(&self) -> Option<String> {
        let output = self.run(vec!["--version".to_string()]).await.ok()?;
        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (!version.is_empty()).then_some(version)
    }

    async fn run(&self, args: Vec<String>) -> Result<std::process::Output, ExtractorError> {
        debug!("Running {:?} {:?}", self.executable, args);

        let command_future = Command::new(&self.executable)
            .args(args)
            .kill_on_drop(true)
            .output();
        let output = timeout(self.timeout, command_future)
            .await
            .map_err(|_| {
                ExtractorError::new(
                    ExtractorErrorKind::TimedOut,
                    format!("yt-dlp did not finish within {} seconds", self.timeout.as_secs()),
                )
            })?
            .map_err(|error| {
                if error.kind() == ErrorKind::NotFound {
                    ExtractorError::new(
                        ExtractorErrorKind::NotInstalled,
                        "yt-dlp is not installed on this server.",
                    )
                } else {
                    ExtractorError::new(
                        ExtractorErrorKind::Failed,
                        format!("Could not run yt-dlp: {error}"),
                    )
                }
            })?;

        if !output.status.success() {
            return Err(ExtractorError::failed(run_error_message(&output.stderr)));
        }

        Ok(output)
    }
}

#[async_trait]
impl Extractor for YtDlp {
    fn name(&self) -> &'static str {
        "yt-dlp"
    }

    async fn extract_metadata(&self, url: &str) -> Result<Catalog, ExtractorError> {
        let output = self
            .run(vec![
                "-J".to_string(),
                "--no-playlist".to_string(),
                "--no-warnings".to_string(),
                url.to_string(),
            ])
            .await?;

        Catalog::from_json(&output.stdout).map_err(|error| {
            ExtractorError::new(
                ExtractorErrorKind::InvalidOutput,
                format!("yt-dlp printed metadata that could not be parsed: {error}"),
            )
        })
    }

    async fn download(
        &self,
        url: &str,
        options: &ExtractorOptions,
    ) -> Result<Option<PathBuf>, ExtractorError> {
        let output = self.run(build_download_args(url, options)).await?;
        Ok(extract_printed_path(&output.stdout).map(PathBuf::from))
    }
}

pub fn build_download_args(url: &str, options: &ExtractorOptions) -> Vec<String> {
    let mut args = vec![
        "--no-playlist".to_string(),
        "--no-warnings".to_string(),
        "--newline".to_string(),
        "--print".to_string(),
        "after_move:filepath".to_string(),
        "-o".to_string(),
        options.output_template.clone(),
        "-f".to_string(),
        options.format_expression.clone(),
        "--merge-output-format".to_string(),
        options.merge_container.extension().to_string(),
        "--ffmpeg-location".to_string(),
        options.remux_tool.to_string_lossy().into_owned(),
    ];

    for (name, value) in &options.headers {
        args.push("--add-header".to_string());
        args.push(format!("{name}:{value}"));
    }

    args.push(url.to_string());
    args
}

fn run_error_message(stderr: &[u8]) -> String {
    let message = String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or("yt-dlp could not complete the operation")
        .to_string();
    let lower = message.to_ascii_lowercase();

    if lower.contains("unsupported url") {
        "Unsupported or invalid URL.".to_string()
    } else if lower.contains("nonetype") {
        format!("Could not read metadata for this URL. Try again later. ({message})")
    } else {
        message
    }
}

fn extract_printed_path(stdout: &[u8]) -> Option<String> {
    String::from_utf8_lossy(stdout)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .map(ToString::to_string)
}

/// Finds `HTTP Error 403` style codes in extractor output.
fn parse_http_status(message: &str) -> Option<u16> {
    let lower = message.to_ascii_lowercase();
    let start = lower.find("http error ")? + "http error ".len();
    let digits: String = lower[start..]
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok().filter(|code| (100..600).contains(code))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovers_http_status_from_stderr() {
        let error = ExtractorError::failed(
            "ERROR: [youtube] abc: Unable to download webpage: HTTP Error 403: Forbidden",
        );
        assert_eq!(error.http_status, Some(403));
        assert!(error.is_forbidden());

        assert_eq!(ExtractorError::failed("ERROR: Private video").http_status, None);
        assert_eq!(parse_http_status("HTTP Error 429: Too Many Requests"), Some(429));
        assert_eq!(parse_http_status("HTTP Error : odd"), None);
    }

    #[test]
    fn error_message_uses_last_stderr_line() {
        let stderr = b"WARNING: something\n\nERROR: Unsupported URL: https://x\n";
        assert_eq!(run_error_message(stderr), "Unsupported or invalid URL.");
        assert_eq!(run_error_message(b""), "yt-dlp could not complete the operation");
    }

    #[test]
    fn printed_path_is_last_non_empty_line() {
        let stdout = b"[download] 100%\n/tmp/job/clip-abc.mp4\n\n";
        assert_eq!(
            extract_printed_path(stdout).as_deref(),
            Some("/tmp/job/clip-abc.mp4")
        );
        assert_eq!(extract_printed_path(b"\n \n"), None);
    }

    #[test]
    fn download_args_carry_every_option() {
        let options = ExtractorOptions {
            format_expression: "bestvideo+bestaudio/best".into(),
            merge_container: Container::Mp4,
            headers: BTreeMap::from([("Referer".to_string(), "https://site.example/".to_string())]),
            output_template: "/tmp/job/%(title).140B-%(id)s.%(ext)s".into(),
            remux_tool: PathBuf::from("/usr/bin/ffmpeg"),
        };
        let args = build_download_args("https://site.example/watch", &options);

        let pair = |flag: &str| {
            args.iter()
                .position(|arg| arg == flag)
                .map(|index| args[index + 1].as_str())
        };
        assert_eq!(pair("-f"), Some("bestvideo+bestaudio/best"));
        assert_eq!(pair("--merge-output-format"), Some("mp4"));
        assert_eq!(pair("--ffmpeg-location"), Some("/usr/bin/ffmpeg"));
        assert_eq!(pair("--add-header"), Some("Referer:https://site.example/"));
        assert_eq!(args.last().map(String::as_str), Some("https://site.example/watch"));
    }

    #[tokio::test]
    async fn missing_executable_is_reported_as_not_installed() {
        let extractor = YtDlp::new("/nonexistent/yt-dlp-binary", Duration::from_secs(5));
        let error = extractor
            .extract_metadata("https://site.example/watch")
            .await
            .unwrap_err();
        assert_eq!(error.kind, ExtractorErrorKind::NotInstalled);
        assert_eq!(extractor.version().await, None);
    }
}
