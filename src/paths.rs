//! Filename resolution and sanitization for the file sink (§4.7).

use std::path::{Path, PathBuf};

/// Resolve the final filename: caller-supplied, else server-supplied, else
/// the last segment of the URL path. The result is sanitized before
/// returning.
pub(crate) fn resolve_filename(caller: Option<&str>, server: Option<&str>, url: &str) -> String {
    let raw = caller
        .map(str::to_string)
        .or_else(|| server.map(str::to_string))
        .unwrap_or_else(|| last_url_segment(url));
    sanitize(&raw)
}

fn last_url_segment(url: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    without_query
        .rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or("download")
        .to_string()
}

/// Replace path separators with `_` and neutralize `..` traversal
/// sequences, matching the source byte-for-byte rather than rejecting the
/// input outright.
pub(crate) fn sanitize(name: &str) -> String {
    let replaced = name.replace(['/', '\\'], "_");
    replaced.replace("..", "_")
}

/// Split `name` into `(stem, extension)` on the last `.`. No `.` means an
/// empty extension.
fn split_stem_ext(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if idx > 0 => (&name[..idx], &name[idx..]),
        _ => (name, ""),
    }
}

/// Find the smallest `n >= 1` such that `<stem>(n)<ext>` doesn't exist
/// under `dir`, and return that path (§4.7 `rename` conflict strategy).
pub(crate) fn next_available_rename(dir: &Path, file_name: &str) -> PathBuf {
    let (stem, ext) = split_stem_ext(file_name);
    let mut n = 1u64;
    loop {
        let candidate = dir.join(format!("{stem}({n}){ext}"));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}
