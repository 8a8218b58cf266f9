//! First-bytes classification of an upstream body.
//!
//! Only the opening bytes of a response are ever inspected; once a stream
//! is accepted it is forwarded untouched.

use crate::catalog::Container;

/// How many leading bytes are searched for container signatures.
pub const SNIFF_WINDOW: usize = 4096;

const HLS_MARKER: &[u8] = b"#EXTM3U";
const EBML_MAGIC: [u8; 4] = [0x1A, 0x45, 0xDF, 0xA3];
const UTF8_BOM: [u8; 3] = [0xEF, 0xBB, 0xBF];
const MP4_BOXES: [&[u8; 4]; 3] = [b"ftyp", b"moov", b"moof"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sniffed {
    /// Media in the given container, which may differ from the advertised one.
    Ok(Container),
    HtmlError,
    HlsManifest,
    UnknownBinary,
}

pub fn classify(prefix: &[u8], expected: &Container) -> Sniffed {
    let text = trim_leading(prefix);

    if starts_with_ignore_case(text, b"<!doctype html") || starts_with_ignore_case(text, b"<html")
    {
        return Sniffed::HtmlError;
    }
    if text.starts_with(HLS_MARKER) {
        return Sniffed::HlsManifest;
    }

    let window = &prefix[..prefix.len().min(SNIFF_WINDOW)];
    let has_mp4_box = MP4_BOXES
        .iter()
        .any(|marker| window.windows(marker.len()).any(|bytes| bytes == *marker));
    let has_ebml = prefix.starts_with(&EBML_MAGIC);

    if expected.is_matroska_family() {
        if has_ebml {
            return Sniffed::Ok(expected.clone());
        }
        if has_mp4_box {
            return Sniffed::Ok(Container::Mp4);
        }
        return Sniffed::UnknownBinary;
    }

    if has_mp4_box {
        let container = if expected.is_mp4_family() {
            expected.clone()
        } else {
            Container::Mp4
        };
        return Sniffed::Ok(container);
    }
    if has_ebml {
        return Sniffed::Ok(Container::Matroska);
    }

    Sniffed::UnknownBinary
}

fn trim_leading(bytes: &[u8]) -> &[u8] {
    let bytes = bytes.strip_prefix(&UTF8_BOM).unwrap_or(bytes);
    let start = bytes
        .iter()
        .position(|byte| !byte.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    &bytes[start..]
}

fn starts_with_ignore_case(bytes: &[u8], prefix: &[u8]) -> bool {
    bytes.len() >= prefix.len() && bytes[..prefix.len()].eq_ignore_ascii_case(prefix)
}
