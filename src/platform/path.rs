//! Platform-aware path semantics
//!
//! Pod paths are validated on the webhook host, which is always Linux, so the
//! rules for the *target* platform are implemented by hand instead of using
//! `std::path`.

use super::Platform;

fn is_windows_separator(b: u8) -> bool {
    b == b'\\' || b == b'/'
}

/// Whether `path` is absolute on the given platform.
///
/// Windows accepts drive-letter paths (`C:\dir`, `C:/dir`) and UNC paths
/// (`\\server\share`, `\\?\C:\dir`). POSIX only accepts a leading `/`.
pub fn is_absolute(path: &str, platform: Platform) -> bool {
    match platform {
        Platform::Linux => path.starts_with('/'),
        Platform::Windows => is_windows_absolute(path),
    }
}

fn is_windows_absolute(path: &str) -> bool {
    let b = path.as_bytes();

    if b.len() >= 2 && is_windows_separator(b[0]) && is_windows_separator(b[1]) {
        let rest = &path[2..];
        // device paths: \\?\ and \\.\
        if rest.starts_with('?') || rest.starts_with('.') {
            return true;
        }
        let mut parts = rest.split(['\\', '/']);
        let server = parts.next().unwrap_or_default();
        let share = parts.next().unwrap_or_default();
        return !server.is_empty() && !share.is_empty();
    }

    b.len() >= 3 && b[0].is_ascii_alphabetic() && b[1] == b':' && is_windows_separator(b[2])
}

/// Parent directory of `path` on the given platform.
///
/// Trailing separators are ignored. A root (`/`, `C:\`) is its own parent and
/// a bare UNC share (`\\server\share`) is returned unchanged.
pub fn parent_dir(path: &str, platform: Platform) -> String {
    let sep = platform.separator();
    let windows = platform == Platform::Windows;

    if path.is_empty() {
        return ".".to_string();
    }

    let trimmed = path.trim_end_matches(sep);
    if trimmed.is_empty() {
        return sep.to_string();
    }

    let b = trimmed.as_bytes();
    let has_drive = windows && b.len() >= 2 && b[1] == b':';

    if has_drive && b.len() == 2 {
        return format!("{trimmed}{sep}");
    }

    if windows && trimmed.starts_with(r"\\") && trimmed[2..].splitn(3, sep).count() <= 2 {
        return trimmed.to_string();
    }

    match trimmed.rfind(sep) {
        None => ".".to_string(),
        Some(0) => sep.to_string(),
        Some(2) if has_drive => trimmed[..3].to_string(),
        Some(i) => trimmed[..i].to_string(),
    }
}

/// Number of named segments below the root of an absolute `path`.
///
/// Empty segments from doubled or trailing separators do not count. On
/// Windows the drive letter, device prefix, and UNC `\\server\share` are
/// all part of the root.
pub fn depth(path: &str, platform: Platform) -> usize {
    let sep = platform.separator();
    let below_root = match platform {
        Platform::Linux => path,
        Platform::Windows => strip_windows_root(path),
    };
    below_root.split(sep).filter(|s| !s.is_empty()).count()
}

fn strip_windows_root(path: &str) -> &str {
    if let Some(rest) = path.strip_prefix(r"\\") {
        if let Some(device) = rest.strip_prefix(r"?\").or_else(|| rest.strip_prefix(r".\")) {
            return strip_windows_root(device);
        }
        let mut parts = rest.splitn(3, '\\');
        let _server = parts.next();
        let _share = parts.next();
        return parts.next().unwrap_or_default();
    }

    let b = path.as_bytes();
    if b.len() >= 2 && b[0].is_ascii_alphabetic() && b[1] == b':' {
        return &path[2..];
    }
    path
}

/// Join a directory and a leaf name with the platform separator
pub fn join(base: &str, leaf: &str, platform: Platform) -> String {
    let sep = platform.separator();
    format!("{}{}{}", base.trim_end_matches(sep), sep, leaf)
}
