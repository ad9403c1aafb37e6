//! Helpers for treating file paths and URLs uniformly

use std::path::{Path, PathBuf};

use url::Url;

/// `true` for strings that parse as an absolute URL with a real scheme.
///
/// Windows drive letters (`C:\labels\a.xml`) are not URLs.
pub fn is_absolute_url(location: &str) -> bool {
    match Url::parse(location) {
        Ok(url) => url.scheme().len() > 1,
        Err(_) => false,
    }
}

pub fn is_remote(location: &str) -> bool {
    matches!(
        Url::parse(location).map(|u| u.scheme().to_string()).as_deref(),
        Ok("http") | Ok("https")
    )
}

/// Turn a path or URL into an absolute URL.
pub fn to_url(location: &str) -> Option<Url> {
    if is_absolute_url(location) {
        return Url::parse(location).ok();
    }
    let absolute = std::path::absolute(Path::new(location)).ok()?;
    Url::from_file_path(absolute).ok()
}

/// Canonical string form used for cache keys and diagnostics.
pub fn canonical(location: &str) -> String {
    to_url(location)
        .map(String::from)
        .unwrap_or_else(|| location.to_string())
}

/// Resolve `reference` against `base`; absolute references are returned as-is.
pub fn resolve(base: Option<&str>, reference: &str) -> Option<String> {
    if is_absolute_url(reference) {
        return Some(reference.to_string());
    }
    let base = match base {
        Some(base) => to_url(base)?,
        None => return to_url(reference).map(String::from),
    };
    base.join(reference).ok().map(String::from)
}

/// Local filesystem path for `file:` URLs and plain paths.
pub fn to_local_path(location: &str) -> Option<PathBuf> {
    match Url::parse(location) {
        Ok(url) if url.scheme() == "file" => url.to_file_path().ok(),
        Ok(url) if url.scheme().len() > 1 => None,
        _ => Some(PathBuf::from(location)),
    }
}
