pub mod atomic_write;

pub use atomic_write::write_file_and_backup;

use crate::{Result, TransferEngineError};
use std::path::Path;
use std::process::Command;
use tracing::debug;

/// Upper bound for a single path component on common filesystems.
pub const MAX_BASENAME_BYTES: usize = 255;

pub fn format_file_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}

pub fn human_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_file_size(bytes_per_second))
}

pub fn sanitize_filename(filename: &str) -> String {
    filename
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '|' | '?' | '*' => '_',
            '/' | '\\' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}

/// Last component of a protocol path. Peers use `\` as separator, some
/// clients send `/`.
pub fn virtual_basename(virtual_path: &str) -> &str {
    virtual_path
        .rsplit(|c| c == '\\' || c == '/')
        .next()
        .unwrap_or(virtual_path)
}

/// Parent folder name of a protocol path, if it has one.
pub fn virtual_parent_name(virtual_path: &str) -> Option<&str> {
    let mut parts = virtual_path.rsplit(|c| c == '\\' || c == '/');
    parts.next()?;
    parts.next().filter(|name| !name.is_empty())
}

/// Split `name.ext` into `("name", ".ext")`. Dotfiles have no extension.
pub fn split_extension(basename: &str) -> (&str, &str) {
    match basename.rfind('.') {
        Some(0) | None => (basename, ""),
        Some(index) => basename.split_at(index),
    }
}

/// Truncate to at most `max_bytes` bytes without splitting a character.
pub fn truncate_utf8_bytes(value: &str, max_bytes: usize) -> &str {
    if value.len() <= max_bytes {
        return value;
    }

    let mut end = max_bytes;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

/// Sanitised basename that fits in `max_bytes` after `prefix`, keeping the
/// extension whenever there is room for it.
pub fn limited_basename(virtual_path: &str, prefix: &str, max_bytes: usize) -> String {
    let basename = sanitize_filename(virtual_basename(virtual_path));
    let (stem, extension) = split_extension(&basename);
    let available = max_bytes.saturating_sub(prefix.len());

    let extension = truncate_utf8_bytes(extension, available);
    let stem = truncate_utf8_bytes(stem, available - extension.len());

    format!("{}{}{}", prefix, stem, extension)
}

/// Run a user supplied command without waiting for it. Every `$` in the
/// template is replaced by `path`; arguments are split on whitespace before
/// substitution so paths containing spaces stay a single argument.
pub fn execute_command(template: &str, path: &Path) -> Result<()> {
    let path = path.to_string_lossy();
    let mut args = template
        .split_whitespace()
        .map(|arg| arg.replace('$', &path));

    let program = args
        .next()
        .ok_or_else(|| TransferEngineError::Unknown("Empty command".to_string()))?;

    debug!("Executing {} for {}", program, path);

    Command::new(&program).args(args).spawn().map_err(|e| {
        TransferEngineError::Unknown(format!("Failed to execute '{}': {}", template, e))
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_virtual_path_parts() {
        assert_eq!(virtual_basename("music\\album\\track.mp3"), "track.mp3");
        assert_eq!(virtual_basename("music/track.mp3"), "track.mp3");
        assert_eq!(virtual_basename("track.mp3"), "track.mp3");
        assert_eq!(virtual_parent_name("music\\album\\track.mp3"), Some("album"));
        assert_eq!(virtual_parent_name("track.mp3"), None);
    }

    #[test]
    fn test_split_extension() {
        assert_eq!(split_extension("track.mp3"), ("track", ".mp3"));
        assert_eq!(split_extension("archive.tar.gz"), ("archive.tar", ".gz"));
        assert_eq!(split_extension(".hidden"), (".hidden", ""));
        assert_eq!(split_extension("README"), ("README", ""));
    }

    #[test]
    fn test_truncate_keeps_char_boundaries() {
        assert_eq!(truncate_utf8_bytes("héllo", 2), "h");
        assert_eq!(truncate_utf8_bytes("héllo", 3), "hé");
        assert_eq!(truncate_utf8_bytes("abc", 10), "abc");
    }

    #[test]
    fn test_limited_basename_keeps_extension() {
        let long = format!("music\\{}.flac", "a".repeat(400));
        let name = limited_basename(&long, "INCOMPLETE", MAX_BASENAME_BYTES);

        assert_eq!(name.len(), MAX_BASENAME_BYTES);
        assert!(name.starts_with("INCOMPLETE"));
        assert!(name.ends_with(".flac"));
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("what?.mp3"), "what_.mp3");
        assert_eq!(sanitize_filename("a:b|c"), "a_b_c");
    }

    #[test]
    fn test_format_sizes() {
        assert_eq!(format_file_size(512), "512 B");
        assert_eq!(format_file_size(2048), "2.0 KB");
        assert_eq!(human_speed(1024 * 1024), "1.0 MB/s");
    }
}
