//! Destination file names.
//!
//! Names come from the caller, the URL's last path segment, or a timestamp,
//! in that order, and always end in a known media extension.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use percent_encoding::percent_decode_str;

use super::types::NamingPolicy;
use crate::constants::download::{DEFAULT_EXTENSION, MEDIA_EXTENSIONS, NAME_MAX};

/// Last non-empty path segment of `url`, percent-decoded, ignoring query and fragment
pub fn filename_from_url_path(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let segment = parsed.path().split('/').filter(|s| !s.is_empty()).last()?;
    let decoded = percent_decode_str(segment).decode_utf8_lossy();
    if decoded == "." || decoded == ".." {
        return None;
    }
    Some(decoded.into_owned())
}

/// Shorten `name` to at most `NAME_MAX` bytes, cutting the stem and keeping the extension
pub fn cap_filename(name: &str) -> String {
    if name.len() <= NAME_MAX {
        return name.to_string();
    }
    let (stem, ext) = split_extension(name);
    compose(stem, "", ext)
}

fn split_extension(name: &str) -> (&str, Option<&str>) {
    let path = Path::new(name);
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or(name);
    let ext = path.extension().and_then(|e| e.to_str());
    (stem, ext)
}

/// `stem` + `suffix` + `.ext`, with the stem cut on a char boundary to fit `NAME_MAX`
fn compose(stem: &str, suffix: &str, ext: Option<&str>) -> String {
    let tail = match ext {
        Some(ext) => format!("{}.{}", suffix, ext),
        None => suffix.to_string(),
    };
    if tail.len() >= NAME_MAX {
        return truncate(&format!("{}{}", stem, tail), NAME_MAX).to_string();
    }
    format!("{}{}", truncate(stem, NAME_MAX - tail.len()), tail)
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut take = max;
    while take > 0 && !s.is_char_boundary(take) {
        take -= 1;
    }
    &s[..take]
}

/// Replace characters that are not allowed in file names
pub fn sanitize_filename(name: &str) -> Option<String> {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim().trim_matches('.').trim();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_string())
    }
}

/// Lowercased extension of `name` if it is a known media type
pub fn media_extension(name: &str) -> Option<String> {
    let ext = Path::new(name).extension()?.to_str()?.to_ascii_lowercase();
    MEDIA_EXTENSIONS.contains(&ext.as_str()).then_some(ext)
}

/// Append `.{fallback}` unless `name` already has a media extension
pub fn ensure_media_extension(name: &str, fallback: &str) -> String {
    if media_extension(name).is_some() {
        name.to_string()
    } else {
        format!("{}.{}", name, fallback)
    }
}

/// MIME type declared by a `data:` URI
pub fn data_uri_mime(uri: &str) -> Option<&str> {
    let meta = uri.strip_prefix("data:")?.split(',').next()?;
    let mime = meta.split(';').next()?.trim();
    (!mime.is_empty()).then_some(mime)
}

pub fn extension_for_mime(mime: &str) -> Option<&'static str> {
    let ext = match mime.to_ascii_lowercase().as_str() {
        "video/mp4" => "mp4",
        "video/webm" => "webm",
        "video/quicktime" => "mov",
        "video/x-matroska" => "mkv",
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "text/plain" => "txt",
        "application/json" => "json",
        _ => return None,
    };
    Some(ext)
}

/// `download_<time>.<ext>`, for artifacts without a usable name
pub fn timestamp_filename(now: DateTime<Utc>, extension: &str) -> String {
    format!("download_{}.{}", now.format("%Y%m%d_%H%M%S_%3f"), extension)
}

/// File name for `url` when the caller suggested none
pub fn default_filename(url: &str, now: DateTime<Utc>) -> String {
    if url.starts_with("data:") {
        let ext = data_uri_mime(url)
            .and_then(extension_for_mime)
            .unwrap_or(DEFAULT_EXTENSION);
        return timestamp_filename(now, ext);
    }

    match filename_from_url_path(url).and_then(|n| sanitize_filename(&n)) {
        Some(name) => cap_filename(&ensure_media_extension(&name, DEFAULT_EXTENSION)),
        None => timestamp_filename(now, DEFAULT_EXTENSION),
    }
}

/// Resolve the name for one item: the suggestion if usable, else derived from `url`
pub fn resolve_filename(url: &str, suggested: Option<&str>, now: DateTime<Utc>) -> String {
    match suggested.and_then(sanitize_filename) {
        Some(name) => {
            let fallback = media_extension(&default_filename(url, now))
                .unwrap_or_else(|| DEFAULT_EXTENSION.to_string());
            cap_filename(&ensure_media_extension(&name, &fallback))
        }
        None => default_filename(url, now),
    }
}

/// Apply a batch naming policy to the item at `index` of `total`
pub fn apply_naming(
    policy: NamingPolicy,
    index: usize,
    total: usize,
    name: &str,
    started: DateTime<Utc>,
) -> String {
    let named = match policy {
        NamingPolicy::Original => name.to_string(),
        NamingPolicy::Sequential => {
            let width = total.to_string().len().max(3);
            format!("{:0width$}_{}", index + 1, name, width = width)
        }
        NamingPolicy::Timestamp => format!("{}_{}", started.format("%Y%m%d_%H%M%S"), name),
    };
    cap_filename(&named)
}

/// First path in `dir` for `filename` that `is_taken` rejects, adding ` (n)` before the extension
pub fn unique_destination<F>(dir: &Path, filename: &str, is_taken: F) -> PathBuf
where
    F: Fn(&Path) -> bool,
{
    let candidate = dir.join(filename);
    if !is_taken(&candidate) {
        return candidate;
    }

    let (stem, ext) = split_extension(filename);
    let mut n = 1;
    loop {
        let candidate = dir.join(compose(stem, &format!(" ({})", n), ext));
        if !is_taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 31, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_url_segment() {
        assert_eq!(
            filename_from_url_path("https://cdn.test/a/b/clip.mp4?sig=abc").as_deref(),
            Some("clip.mp4")
        );
        assert_eq!(filename_from_url_path("https://cdn.test/"), None);
        assert_eq!(filename_from_url_path("not a url"), None);
    }

    #[test]
    fn test_default_filename_enforces_extension() {
        let now = fixed_now();
        assert_eq!(default_filename("https://cdn.test/v/clip.MP4", now), "clip.MP4");
        assert_eq!(default_filename("https://cdn.test/v/render", now), "render.mp4");
        assert_eq!(
            default_filename("https://cdn.test/", now),
            "download_20240131_120000_000.mp4"
        );
    }

    #[test]
    fn test_data_uri_uses_mime_extension() {
        let now = fixed_now();
        assert_eq!(data_uri_mime("data:image/png;base64,AAAA"), Some("image/png"));
        assert_eq!(
            default_filename("data:image/png;base64,AAAA", now),
            "download_20240131_120000_000.png"
        );
    }

    #[test]
    fn test_suggested_name_is_sanitized() {
        let now = fixed_now();
        assert_eq!(
            resolve_filename("https://cdn.test/x.webm", Some("shot: 1/2"), now),
            "shot_ 1_2.webm"
        );
        assert_eq!(
            resolve_filename("https://cdn.test/x.webm", Some("  "), now),
            "x.webm"
        );
    }

    #[test]
    fn test_naming_policies() {
        let now = fixed_now();
        assert_eq!(apply_naming(NamingPolicy::Original, 0, 5, "a.mp4", now), "a.mp4");
        assert_eq!(apply_naming(NamingPolicy::Sequential, 0, 5, "a.mp4", now), "001_a.mp4");
        assert_eq!(
            apply_naming(NamingPolicy::Sequential, 41, 1200, "a.mp4", now),
            "0042_a.mp4"
        );
        assert_eq!(
            apply_naming(NamingPolicy::Timestamp, 3, 5, "a.mp4", now),
            "20240131_120000_a.mp4"
        );
    }

    #[test]
    fn test_unique_destination_adds_counter() {
        let dir = Path::new("/downloads");
        let taken = [dir.join("clip.mp4"), dir.join("clip (1).mp4")];
        let path = unique_destination(dir, "clip.mp4", |p| taken.iter().any(|t| t == p));
        assert_eq!(path, dir.join("clip (2).mp4"));
        assert_eq!(
            unique_destination(dir, "other.mp4", |_| false),
            dir.join("other.mp4")
        );
    }

    #[test]
    fn test_url_segment_is_percent_decoded() {
        assert_eq!(
            filename_from_url_path("https://cdn.test/v/my%20clip.mp4").as_deref(),
            Some("my clip.mp4")
        );
        assert_eq!(
            default_filename("https://cdn.test/v/a%2Fb.mp4", fixed_now()),
            "a_b.mp4"
        );
    }

    #[test]
    fn test_long_names_fit_name_max() {
        let now = fixed_now();
        let url = format!("https://cdn.test/{}.mp4", "a".repeat(300));
        let name = default_filename(&url, now);
        assert_eq!(name.len(), NAME_MAX);
        assert!(name.ends_with(".mp4"));

        let suggested = "é".repeat(200);
        let name = resolve_filename("https://cdn.test/x.webm", Some(&suggested), now);
        assert!(name.len() <= NAME_MAX);
        assert!(name.ends_with(".webm"));

        let name = apply_naming(NamingPolicy::Sequential, 0, 3, &default_filename(&url, now), now);
        assert_eq!(name.len(), NAME_MAX);
        assert!(name.starts_with("001_"));
        assert!(name.ends_with(".mp4"));
    }

    #[test]
    fn test_counter_suffix_stays_within_name_max() {
        let dir = Path::new("/downloads");
        let long = format!("{}.mp4", "b".repeat(NAME_MAX - 4));
        let path = unique_destination(dir, &long, |p| p == dir.join(&long));
        let name = path.file_name().unwrap().to_str().unwrap();
        assert_eq!(name.len(), NAME_MAX);
        assert!(name.ends_with(" (1).mp4"));
    }
}
