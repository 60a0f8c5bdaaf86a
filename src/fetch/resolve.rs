//! Thumbnail-to-original URL rewriting and the one-step format fallback.
//!
//! Listing pages only expose resized thumbnails (`img-master`, `custom-thumb`,
//! `c/<size>/...`). The full-resolution file lives under `img-original` with
//! the same date path and id, but its extension is unknown until probed: the
//! rewrite assumes `.jpg` and falls back to `.png` exactly once.

use once_cell::sync::Lazy;
use regex::Regex;

use super::{FetchError, Fetcher, NotFoundError};

const ORIGINAL_PREFIX: &str = "https://i.pximg.net/img-original/img/";
const SITE_ORIGIN: &str = "https://www.pixiv.net";

/// Rewrite rules tried in order; the first capture group is the date path and id.
static THUMBNAIL_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"https://i\.pximg\.net/.+?/img-master/img/(.+?)_p\d+_square1200\.jpg",
        r"https://i\.pximg\.net/.+?/custom-thumb/img/(.+?)_p\d+_custom1200\.jpg",
        r"https://i\.pximg\.net/.+?/(?:img-master|custom-thumb)/img/(.+?)_p0",
        r"https://i\.pximg\.net/c/.+?/img/(.+?)_p0",
        r"/img/(.+?)_p0",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid thumbnail pattern"))
    .collect()
});

/// Result of resolving one reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedUrl {
    pub url: String,
    /// Lowercase extension without the dot, used for the output filename.
    pub extension: String,
    /// True when the primary candidate was missing and the alternate was used.
    pub used_fallback: bool,
}

/// Make protocol-relative and site-relative references absolute.
pub fn normalize_reference(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Some(rest) = trimmed.strip_prefix("//") {
        format!("https://{rest}")
    } else if trimmed.starts_with('/') {
        format!("{SITE_ORIGIN}{trimmed}")
    } else {
        trimmed.to_string()
    }
}

/// Map a thumbnail URL onto its `img-original` form, first page, `.jpg`.
///
/// URLs already under `img-original` and URLs matching no rule come back unchanged.
pub fn to_original_url(url: &str) -> String {
    if url.contains("/img-original/") {
        return url.to_string();
    }
    THUMBNAIL_PATTERNS
        .iter()
        .find_map(|re| re.captures(url))
        .and_then(|caps| caps.get(1))
        .map(|path| format!("{ORIGINAL_PREFIX}{}_p0.jpg", path.as_str()))
        .unwrap_or_else(|| url.to_string())
}

/// Ledger key for a listing reference: its original-image URL, so every
/// thumbnail size of one illustration maps to the same key.
pub fn ledger_key(reference: &str) -> String {
    to_original_url(&normalize_reference(reference))
}

/// Numeric illustration id from a `.../<id>_p0.<ext>` URL.
pub fn illust_id(url: &str) -> Option<&str> {
    let (body, _, _) = split_extension(url)?;
    let name = &body[body.rfind('/').map_or(0, |i| i + 1)..];
    let id = name.split('_').next()?;
    (!id.is_empty() && id.bytes().all(|b| b.is_ascii_digit())).then_some(id)
}

/// Split `url` into the part before the extension and the extension itself,
/// ignoring any query string or fragment.
fn split_extension(url: &str) -> Option<(&str, &str, &str)> {
    let end = url.find(['?', '#']).unwrap_or(url.len());
    let (body, tail) = url.split_at(end);
    let last_segment_start = body.rfind('/').map(|i| i + 1).unwrap_or(0);
    let dot = body[last_segment_start..].rfind('.')? + last_segment_start;
    Some((&body[..dot], &body[dot + 1..], tail))
}

/// Extension used for the saved file. Unknown or missing extensions save as `jpg`.
pub fn extension_of(url: &str) -> String {
    match split_extension(url).map(|(_, ext, _)| ext.to_ascii_lowercase()) {
        Some(ext) if matches!(ext.as_str(), "jpg" | "jpeg" | "png" | "gif" | "webp") => ext,
        _ => "jpg".to_string(),
    }
}

/// The single fallback candidate: `.jpg` and `.png` swap, anything else has none.
pub fn alternate_url(url: &str) -> Option<String> {
    let (stem, ext, tail) = split_extension(url)?;
    let swapped = match ext.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => "png",
        "png" => "jpg",
        _ => return None,
    };
    Some(format!("{stem}.{swapped}{tail}"))
}

/// Resolve a listing reference to a fetchable original-resolution URL.
///
/// The primary candidate is probed with HEAD. Only a not-found answer moves on
/// to the alternate, and only once. A transient or otherwise unexpected probe
/// failure accepts the candidate so the retrying fetch stage deals with it.
pub async fn resolve(fetcher: &dyn Fetcher, reference: &str) -> Result<ResolvedUrl, NotFoundError> {
    let primary = ledger_key(reference);
    let mut tried = Vec::with_capacity(2);

    match probe_candidate(fetcher, &primary).await {
        ProbeOutcome::Accept => return Ok(resolved(primary, false)),
        ProbeOutcome::Missing => tried.push(primary.clone()),
    }

    if let Some(alternate) = alternate_url(&primary) {
        match probe_candidate(fetcher, &alternate).await {
            ProbeOutcome::Accept => {
                tracing::debug!("Falling back from {} to {}", primary, alternate);
                return Ok(resolved(alternate, true));
            }
            ProbeOutcome::Missing => tried.push(alternate),
        }
    }

    Err(NotFoundError {
        reference: reference.to_string(),
        tried,
    })
}

enum ProbeOutcome {
    Accept,
    Missing,
}

async fn probe_candidate(fetcher: &dyn Fetcher, url: &str) -> ProbeOutcome {
    match fetcher.probe(url).await {
        Ok(()) => ProbeOutcome::Accept,
        Err(e) if e.is_not_found() => {
            tracing::debug!("Candidate not found: {}", url);
            ProbeOutcome::Missing
        }
        Err(e) => {
            log_probe_failure(url, &e);
            ProbeOutcome::Accept
        }
    }
}

fn log_probe_failure(url: &str, e: &FetchError) {
    tracing::debug!("Probe of {} inconclusive, fetching anyway: {}", url, e);
}

fn resolved(url: String, used_fallback: bool) -> ResolvedUrl {
    let extension = extension_of(&url);
    ResolvedUrl {
        url,
        extension,
        used_fallback,
    }
}
