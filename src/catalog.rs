//! Typed view over the format list `yt-dlp -J` prints for a URL.
//!
//! Normalization is lossy on purpose: entries without a URL are dropped and
//! `"none"` codecs become `None`. Nothing here touches the network.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
};

use serde::{Deserialize, Serialize};
use url::Url;

/// Container of a media file, keyed by its usual extension.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Container {
    Mp4,
    M4v,
    Mov,
    M4a,
    Webm,
    Matroska,
    Other(String),
}

impl Container {
    pub fn from_extension(ext: &str) -> Self {
        let ext = ext.trim().trim_start_matches('.').to_ascii_lowercase();
        match ext.as_str() {
            "mp4" => Self::Mp4,
            "m4v" => Self::M4v,
            "mov" => Self::Mov,
            "m4a" => Self::M4a,
            "webm" => Self::Webm,
            "mkv" | "matroska" => Self::Matroska,
            _ => Self::Other(ext),
        }
    }

    pub fn extension(&self) -> &str {
        match self {
            Self::Mp4 => "mp4",
            Self::M4v => "m4v",
            Self::Mov => "mov",
            Self::M4a => "m4a",
            Self::Webm => "webm",
            Self::Matroska => "mkv",
            Self::Other(ext) if ext.is_empty() => "bin",
            Self::Other(ext) => ext,
        }
    }

    /// ISO base media file format (the `ftyp`/`moov` box family).
    pub fn is_mp4_family(&self) -> bool {
        matches!(self, Self::Mp4 | Self::M4v | Self::Mov | Self::M4a)
    }

    /// EBML based containers.
    pub fn is_matroska_family(&self) -> bool {
        matches!(self, Self::Webm | Self::Matroska)
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Mp4 | Self::M4v => "video/mp4",
            Self::Mov => "video/quicktime",
            Self::M4a => "audio/mp4",
            Self::Webm => "video/webm",
            Self::Matroska => "video/x-matroska",
            Self::Other(ext) => match ext.as_str() {
                "mp3" => "audio/mpeg",
                "aac" => "audio/aac",
                "wav" => "audio/wav",
                "ogg" | "opus" => "audio/ogg",
                "flac" => "audio/flac",
                _ => "application/octet-stream",
            },
        }
    }
}

impl fmt::Display for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Delivery protocol advertised for a format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Protocol {
    /// A single file behind a plain `http`/`https` URL.
    Http,
    /// Segmented delivery (HLS, DASH, HDS, Smooth Streaming).
    Manifest(String),
    Other(String),
}

const MANIFEST_PROTOCOLS: [&str; 6] = ["m3u8", "dash", "f4m", "ism", "mss", "hls"];

impl Protocol {
    /// Parses the `protocol` field. When it is absent the URL decides.
    pub fn parse(raw: Option<&str>, url: &str) -> Self {
        let Some(raw) = raw.map(str::trim).filter(|value| !value.is_empty()) else {
            return if is_manifest_url(url) {
                Self::Manifest("inferred".to_string())
            } else if url.starts_with("http://") || url.starts_with("https://") {
                Self::Http
            } else {
                Self::Other(String::new())
            };
        };

        let lower = raw.to_ascii_lowercase();
        match lower.as_str() {
            "http" | "https" => Self::Http,
            _ if MANIFEST_PROTOCOLS.iter().any(|marker| lower.contains(marker)) => {
                Self::Manifest(lower)
            }
            _ => Self::Other(lower),
        }
    }

    pub fn is_plain_http(&self) -> bool {
        matches!(self, Self::Http)
    }
}

/// Whether the URL points at a playlist or manifest rather than a media file.
pub fn is_manifest_url(raw: &str) -> bool {
    let path = Url::parse(raw)
        .map(|parsed| parsed.path().to_ascii_lowercase())
        .unwrap_or_else(|_| {
            raw.split(['?', '#'])
                .next()
                .unwrap_or_default()
                .to_ascii_lowercase()
        });

    path.ends_with(".m3u8")
        || path.ends_with(".m3u")
        || path.ends_with(".mpd")
        || path.ends_with(".f4m")
        || path.ends_with(".ism/manifest")
        || path.contains("/manifest/")
        || path.contains("/hls_playlist/")
}

/// Metadata shown to the user, one snapshot per extractor call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoMetadata {
    pub title: String,
    pub thumbnail: Option<String>,
    pub duration_seconds: Option<f64>,
    pub duration_text: Option<String>,
    pub uploader: Option<String>,
    pub view_count: Option<u64>,
    pub webpage_url: Option<String>,
}

/// One deliverable encoding of the video.
#[derive(Debug, Clone, PartialEq)]
pub struct FormatEntry {
    pub format_id: String,
    pub url: String,
    pub container: Container,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub protocol: Protocol,
    pub height: Option<u32>,
    /// Total bitrate in kbit/s.
    pub bitrate: Option<f64>,
    pub approx_size_bytes: Option<u64>,
    /// Headers the extractor says this specific URL must be fetched with.
    pub http_headers: BTreeMap<String, String>,
}

impl FormatEntry {
    /// Entry for a URL handed to us directly, without extractor metadata.
    pub fn direct(url: impl Into<String>, container: Container) -> Self {
        let url = url.into();
        Self {
            format_id: "direct".to_string(),
            protocol: Protocol::parse(None, &url),
            url,
            container,
            video_codec: None,
            audio_codec: None,
            height: None,
            bitrate: None,
            approx_size_bytes: None,
            http_headers: BTreeMap::new(),
        }
    }

    pub fn has_video(&self) -> bool {
        self.video_codec.is_some()
    }

    pub fn has_audio(&self) -> bool {
        self.audio_codec.is_some()
    }

    /// Both codecs present, plain HTTP, and not a manifest URL.
    pub fn is_directly_playable(&self) -> bool {
        self.has_video()
            && self.has_audio()
            && self.protocol.is_plain_http()
            && !is_manifest_url(&self.url)
    }
}

/// Everything one extractor call told us about a URL.
#[derive(Debug, Clone, PartialEq)]
pub struct Catalog {
    pub metadata: VideoMetadata,
    pub formats: Vec<FormatEntry>,
    /// Top-level headers, used for entries that carry none of their own.
    pub default_headers: BTreeMap<String, String>,
}

impl Catalog {
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let raw: RawVideoInfo = serde_json::from_slice(bytes)?;
        Ok(Self::from_raw(raw))
    }

    pub fn from_raw(raw: RawVideoInfo) -> Self {
        let mut formats: Vec<FormatEntry> = raw
            .formats
            .into_iter()
            .enumerate()
            .filter_map(|(index, format)| normalize_format(format, index))
            .collect();

        // Single-file sites answer without a `formats` array.
        if formats.is_empty()
            && let Some(entry) = normalize_format(raw.top_level.clone(), 0)
        {
            formats.push(entry);
        }

        let duration_text = raw
            .duration_string
            .and_then(non_empty_string)
            .or_else(|| raw.duration.map(format_duration));

        Self {
            metadata: VideoMetadata {
                title: raw
                    .title
                    .and_then(non_empty_string)
                    .unwrap_or_else(|| "video".to_string()),
                thumbnail: raw.thumbnail.and_then(non_empty_string),
                duration_seconds: raw.duration,
                duration_text,
                uploader: raw.uploader.and_then(non_empty_string),
                view_count: raw.view_count,
                webpage_url: raw.webpage_url.and_then(non_empty_string),
            },
            formats,
            default_headers: raw
                .top_level
                .http_headers
                .map(|headers| headers.into_iter().collect())
                .unwrap_or_default(),
        }
    }

    /// Distinct heights among video-bearing entries, highest first, as `720p` labels.
    pub fn available_qualities(&self) -> Vec<String> {
        let heights: BTreeSet<u32> = self
            .formats
            .iter()
            .filter(|format| format.has_video())
            .filter_map(|format| format.height)
            .filter(|height| *height > 0)
            .collect();

        heights
            .into_iter()
            .rev()
            .map(|height| format!("{height}p"))
            .collect()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawFormat {
    pub format_id: Option<String>,
    pub url: Option<String>,
    pub ext: Option<String>,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    pub protocol: Option<String>,
    pub height: Option<u32>,
    pub tbr: Option<f64>,
    pub filesize: Option<f64>,
    pub filesize_approx: Option<f64>,
    pub http_headers: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawVideoInfo {
    pub title: Option<String>,
    pub thumbnail: Option<String>,
    pub duration: Option<f64>,
    pub duration_string: Option<String>,
    pub uploader: Option<String>,
    pub view_count: Option<u64>,
    pub webpage_url: Option<String>,
    #[serde(default)]
    pub formats: Vec<RawFormat>,
    #[serde(flatten)]
    pub top_level: RawFormat,
}

fn normalize_format(raw: RawFormat, index: usize) -> Option<FormatEntry> {
    let url = raw.url.and_then(non_empty_string)?;
    let container = raw
        .ext
        .as_deref()
        .map(Container::from_extension)
        .unwrap_or_else(|| Container::Other(String::new()));

    Some(FormatEntry {
        format_id: raw
            .format_id
            .and_then(non_empty_string)
            .unwrap_or_else(|| index.to_string()),
        protocol: Protocol::parse(raw.protocol.as_deref(), &url),
        url,
        container,
        video_codec: normalize_codec(raw.vcodec),
        audio_codec: normalize_codec(raw.acodec),
        height: raw.height,
        bitrate: raw.tbr.filter(|value| value.is_finite() && *value > 0.0),
        approx_size_bytes: raw
            .filesize
            .or(raw.filesize_approx)
            .filter(|value| value.is_finite() && *value > 0.0)
            .map(|value| value as u64),
        http_headers: raw
            .http_headers
            .map(|headers| headers.into_iter().collect())
            .unwrap_or_default(),
    })
}

fn normalize_codec(value: Option<String>) -> Option<String> {
    value
        .map(|codec| codec.trim().to_string())
        .filter(|codec| !codec.is_empty() && !codec.eq_ignore_ascii_case("none"))
}

fn non_empty_string(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn format_duration(seconds: f64) -> String {
    let total = seconds.max(0.0).round() as u64;
    let (hours, minutes, secs) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{hours}:{minutes:02}:{secs:02}")
    } else {
        format!("{minutes}:{secs:02}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "title": "  Launch day  ",
        "thumbnail": "https://img.example/t.jpg",
        "duration": 3725.4,
        "uploader": "Example",
        "view_count": 42,
        "http_headers": {"User-Agent": "site-agent"},
        "formats": [
            {"format_id": "hls-720", "url": "https://cdn.example/v/master.m3u8", "ext": "mp4",
             "vcodec": "avc1.64001f", "acodec": "mp4a.40.2", "protocol": "m3u8_native",
             "height": 720},
            {"format_id": "18", "url": "https://cdn.example/v/18.mp4", "ext": "mp4",
             "vcodec": "avc1.42001E", "acodec": "mp4a.40.2", "protocol": "https", "height": 360,
             "tbr": 500.5, "filesize_approx": 1048576.0,
             "http_headers": {"Referer": "https://site.example/"}},
            {"format_id": "140", "url": "https://cdn.example/a/140.m4a", "ext": "m4a",
             "vcodec": "none", "acodec": "mp4a.40.2", "protocol": "https"},
            {"format_id": "sb0", "ext": "mhtml", "vcodec": "none", "acodec": "none"}
        ]
    }"#;

    #[test]
    fn normalizes_catalog_and_drops_entries_without_url() {
        let catalog = Catalog::from_json(SAMPLE.as_bytes()).unwrap();

        assert_eq!(catalog.metadata.title, "Launch day");
        assert_eq!(catalog.metadata.duration_text.as_deref(), Some("1:02:05"));
        assert_eq!(catalog.formats.len(), 3);
        assert_eq!(
            catalog.default_headers.get("User-Agent").map(String::as_str),
            Some("site-agent")
        );

        let audio = &catalog.formats[2];
        assert_eq!(audio.video_codec, None);
        assert_eq!(audio.container, Container::M4a);

        let progressive = &catalog.formats[1];
        assert!(progressive.is_directly_playable());
        assert_eq!(progressive.approx_size_bytes, Some(1_048_576));
        assert_eq!(
            progressive.http_headers.get("Referer").map(String::as_str),
            Some("https://site.example/")
        );

        assert!(!catalog.formats[0].is_directly_playable());
        assert!(matches!(catalog.formats[0].protocol, Protocol::Manifest(_)));
    }

    #[test]
    fn single_file_answer_becomes_one_entry() {
        let json = r#"{"title": "clip", "url": "https://cdn.example/clip.mp4", "ext": "mp4",
                       "vcodec": "h264", "acodec": "aac", "height": 1080}"#;
        let catalog = Catalog::from_json(json.as_bytes()).unwrap();

        assert_eq!(catalog.formats.len(), 1);
        assert_eq!(catalog.formats[0].protocol, Protocol::Http);
        assert_eq!(catalog.formats[0].format_id, "0");
        assert_eq!(catalog.available_qualities(), vec!["1080p".to_string()]);
    }

    #[test]
    fn manifest_urls_are_detected_even_on_http_protocol() {
        assert!(is_manifest_url("https://cdn.example/path/index.m3u8?token=1"));
        assert!(is_manifest_url("https://cdn.example/stream.mpd"));
        assert!(!is_manifest_url("https://cdn.example/video.mp4?sig=m3u8"));

        let mut entry = FormatEntry::direct("https://cdn.example/live.m3u8", Container::Mp4);
        entry.protocol = Protocol::Http;
        entry.video_codec = Some("avc1".into());
        entry.audio_codec = Some("mp4a".into());
        assert!(!entry.is_directly_playable());
    }

    #[test]
    fn qualities_are_distinct_and_descending() {
        let catalog = Catalog::from_json(SAMPLE.as_bytes()).unwrap();
        assert_eq!(catalog.available_qualities(), vec!["720p", "360p"]);
    }
}
