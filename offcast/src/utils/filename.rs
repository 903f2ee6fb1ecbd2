//! Filename sanitization for cross-platform compatibility.
//!
//! Media titles come straight from the upstream server and may contain
//! characters that are invalid on Windows, Linux, or macOS. Valid Unicode
//! (Chinese, Japanese, Korean, ...) is preserved.

/// Characters Windows refuses in file names. `/` also covers Unix.
const FORBIDDEN_CHARS: &str = "<>:\"/\\|?*";

/// Fallback when nothing usable is left of a title.
const FALLBACK_NAME: &str = "unnamed";

/// Sanitize a title for use as a file name on any platform.
///
/// The title is split on control and forbidden characters and the surviving
/// pieces are joined with single underscores, so runs of bad characters
/// collapse and never produce leading or trailing junk. Leading/trailing
/// spaces and dots are stripped (a Windows restriction), reserved device
/// names get an underscore prefix, and an empty result falls back to
/// "unnamed".
pub fn sanitize_filename(title: &str) -> String {
    let joined = title
        .split(|c: char| c.is_control() || FORBIDDEN_CHARS.contains(c))
        .filter(|piece| !piece.is_empty())
        .collect::<Vec<_>>()
        .join("_");

    let name = joined.trim_matches([' ', '.']);
    if name.is_empty() {
        return FALLBACK_NAME.to_string();
    }

    // Windows reserves device names by stem, whatever the extension.
    let stem = name.split('.').next().unwrap_or(name);
    if is_reserved_device(stem) {
        return format!("_{name}");
    }

    name.to_string()
}

/// `CON`, `PRN`, `AUX`, `NUL`, and `COM1`-`COM9`/`LPT1`-`LPT9`,
/// case-insensitively.
fn is_reserved_device(stem: &str) -> bool {
    const BARE: &[&str] = &["CON", "PRN", "AUX", "NUL"];
    if BARE.iter().any(|name| stem.eq_ignore_ascii_case(name)) {
        return true;
    }
    let bytes = stem.as_bytes();
    bytes.len() == 4
        && (bytes[..3].eq_ignore_ascii_case(b"COM") || bytes[..3].eq_ignore_ascii_case(b"LPT"))
        && bytes[3].is_ascii_digit()
        && bytes[3] != b'0'
}

/// Derive the final `.mp4` file name from a media title.
pub fn output_file_name(title: &str) -> String {
    format!("{}.mp4", sanitize_filename(title))
}
