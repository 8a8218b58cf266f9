//! Picks the format to stream straight to the client, or decides that the
//! video and audio have to be merged locally first.

use std::{cmp::Ordering, fmt};

use crate::catalog::{Container, FormatEntry};

/// Quality asked for by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityLabel {
    Best,
    /// Highest height allowed, e.g. `720p` -> 720.
    MaxHeight(u32),
}

impl QualityLabel {
    /// Anything that is not a resolution (`best`, empty, garbage) means [`QualityLabel::Best`].
    pub fn parse(label: &str) -> Self {
        let lower = label.trim().to_ascii_lowercase();
        match lower.as_str() {
            "4k" | "uhd" => return Self::MaxHeight(2160),
            "2k" => return Self::MaxHeight(1440),
            "fhd" => return Self::MaxHeight(1080),
            "hd" => return Self::MaxHeight(720),
            _ => {}
        }

        lower
            .strip_suffix('p')
            .unwrap_or(&lower)
            .parse::<u32>()
            .ok()
            .filter(|height| *height > 0)
            .map(Self::MaxHeight)
            .unwrap_or(Self::Best)
    }

    pub fn height_limit(&self) -> Option<u32> {
        match self {
            Self::Best => None,
            Self::MaxHeight(height) => Some(*height),
        }
    }
}

impl fmt::Display for QualityLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Best => f.write_str("best"),
            Self::MaxHeight(height) => write!(f, "{height}p"),
        }
    }
}

/// Containers that may be streamed without remuxing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionPolicy {
    pub accepted_containers: Vec<Container>,
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        Self {
            accepted_containers: vec![Container::Mp4, Container::M4v, Container::Mov],
        }
    }
}

impl SelectionPolicy {
    pub fn accepts(&self, container: &Container) -> bool {
        self.accepted_containers.contains(container)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectionResult {
    Direct {
        format: FormatEntry,
        container: Container,
    },
    /// No single-file candidate with both streams; merge locally.
    RequireRemux,
}

pub fn select(
    catalog: &[FormatEntry],
    quality: &QualityLabel,
    policy: &SelectionPolicy,
) -> SelectionResult {
    let playable: Vec<&FormatEntry> = catalog
        .iter()
        .filter(|format| format.is_directly_playable())
        .filter(|format| policy.accepts(&format.container))
        .collect();

    let candidates = match quality.height_limit() {
        Some(limit) => {
            let within: Vec<&FormatEntry> = playable
                .iter()
                .copied()
                .filter(|format| format.height.is_some_and(|height| height <= limit))
                .collect();
            if within.is_empty() { playable } else { within }
        }
        None => playable,
    };

    // Keeps the earliest entry among equal ranks so the pick never depends
    // on anything but catalog order.
    let best = candidates.into_iter().reduce(|best, candidate| {
        if compare_rank(candidate, best) == Ordering::Greater {
            candidate
        } else {
            best
        }
    });

    match best {
        Some(format) => SelectionResult::Direct {
            container: format.container.clone(),
            format: format.clone(),
        },
        None => SelectionResult::RequireRemux,
    }
}

fn compare_rank(a: &FormatEntry, b: &FormatEntry) -> Ordering {
    is_baseline_video(a)
        .cmp(&is_baseline_video(b))
        .then_with(|| is_baseline_audio(a).cmp(&is_baseline_audio(b)))
        .then_with(|| a.height.unwrap_or_default().cmp(&b.height.unwrap_or_default()))
        .then_with(|| {
            a.bitrate
                .unwrap_or_default()
                .total_cmp(&b.bitrate.unwrap_or_default())
        })
}

/// H.264 plays on practically every client.
fn is_baseline_video(format: &FormatEntry) -> bool {
    format.video_codec.as_deref().is_some_and(|codec| {
        let codec = codec.to_ascii_lowercase();
        codec.starts_with("avc1") || codec.contains("h264") || codec.contains("h.264")
    })
}

fn is_baseline_audio(format: &FormatEntry) -> bool {
    format.audio_codec.as_deref().is_some_and(|codec| {
        let codec = codec.to_ascii_lowercase();
        codec.starts_with("mp4a") || codec.contains("aac")
    })
}
