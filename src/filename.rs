//! Download filenames and the headers that carry them.

use crate::catalog::Container;

pub const MAX_FILENAME_CHARS: usize = 150;

const FALLBACK_STEM: &str = "video";
const HOSTILE_CHARS: [char; 9] = ['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// Makes a title safe to use as a file name on any filesystem.
///
/// Control and reserved characters become `_`, runs of whitespace collapse
/// to one space, and the result is capped at [`MAX_FILENAME_CHARS`]. Running
/// it again on its own output changes nothing.
pub fn sanitize_title(title: &str) -> String {
    sanitize_with_limit(title, MAX_FILENAME_CHARS)
}

/// `<sanitized title>.<ext>`, kept within [`MAX_FILENAME_CHARS`] as a whole.
pub fn attachment_filename(title: &str, container: &Container) -> String {
    let ext = container.extension();
    let budget = MAX_FILENAME_CHARS.saturating_sub(ext.chars().count() + 1).max(1);
    format!("{}.{ext}", sanitize_with_limit(title, budget))
}

fn sanitize_with_limit(title: &str, limit: usize) -> String {
    let mut collapsed = String::with_capacity(title.len());
    let mut pending_space = false;

    for character in title.chars() {
        if character.is_whitespace() {
            pending_space = true;
            continue;
        }
        if pending_space && !collapsed.is_empty() {
            collapsed.push(' ');
        }
        pending_space = false;

        if character.is_control() || HOSTILE_CHARS.contains(&character) {
            collapsed.push('_');
        } else {
            collapsed.push(character);
        }
    }

    let truncated: String = collapsed.chars().take(limit).collect();
    let trimmed = truncated.trim_end();
    if trimmed.is_empty() {
        FALLBACK_STEM.to_string()
    } else {
        trimmed.to_string()
    }
}

pub fn build_content_disposition(filename: &str) -> String {
    let safe_ascii = sanitize_ascii_filename(filename);
    format!(
        "attachment; filename=\"{safe_ascii}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

/// ASCII-only variant for header values that cannot carry UTF-8.
pub fn sanitize_ascii_filename(value: &str) -> String {
    let mut sanitized = String::with_capacity(value.len());

    for character in value.chars() {
        if character.is_ascii_alphanumeric()
            || matches!(character, '.' | '-' | '_' | ' ' | '(' | ')')
        {
            sanitized.push(character);
        } else {
            sanitized.push('_');
        }
    }

    let compact = sanitized.trim();
    if compact.is_empty() {
        format!("{FALLBACK_STEM}.bin")
    } else {
        compact.to_string()
    }
}
