//! Canonical cache keys for (source, transform) pairs
//!
//! A key is the normalized source URL followed by the non-default transform parameters in
//! alphabetical order, e.g. `https://a.test/x.png?h=100&mode=fill&w=100`. Requests that
//! differ only in default-valued parameters therefore share a key.

use sha2::{Digest, Sha256};
use std::fmt;
use url::Url;

use crate::config::defaults::DEFAULT_QUALITY;
use crate::errors::{ProxyError, ProxyResult};
use crate::models::{OutputFormat, ResizeMode, TransformRequest};

/// Query parameters owned by the proxy rather than by the upstream URL
pub const PROXY_PARAMS: [&str; 5] = ["format", "w", "h", "q", "mode"];

/// Path token standing in for `//` in path-encoded sources
const DOUBLE_SLASH_TOKEN: &str = "_DS_";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive the key for a request whose `source` is already normalized
    pub fn for_request(request: &TransformRequest) -> Self {
        let mut params: Vec<(&'static str, String)> = Vec::with_capacity(5);

        if request.format != OutputFormat::Webp {
            params.push(("format", request.format.to_string()));
        }
        if let Some(h) = request.height {
            params.push(("h", h.to_string()));
        }
        // A one-sided size derives the other side from the source, so the mode is moot
        if request.mode != ResizeMode::Fit && request.width.is_some() && request.height.is_some() {
            params.push(("mode", request.mode.to_string()));
        }
        if request.quality != DEFAULT_QUALITY {
            params.push(("q", request.quality.to_string()));
        }
        if let Some(w) = request.width {
            params.push(("w", w.to_string()));
        }
        params.sort_by(|a, b| a.0.cmp(b.0));

        if params.is_empty() {
            return Self(request.source.clone());
        }

        let separator = if request.source.contains('?') { '&' } else { '?' };
        let suffix = params
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("&");
        Self(format!("{}{separator}{suffix}", request.source))
    }

    /// Wrap a key read back from the durable index
    pub fn from_stored(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Storage id used for the transformed bytes: lowercase hex SHA-256 of the key
    pub fn storage_id(&self) -> String {
        hex::encode(Sha256::digest(self.0.as_bytes()))
    }

    pub fn thumbnail_id(&self) -> String {
        thumbnail_id_for(&self.storage_id())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Storage id of the thumbnail belonging to the blob stored as `storage_id`
pub fn thumbnail_id_for(storage_id: &str) -> String {
    format!("{storage_id}_thumb")
}

/// Content id named by a served file such as `ab12...ef.png`: the part before the first
/// dot, accepted only when it is a 64 digit lowercase hex digest
pub fn content_id(file: &str) -> Option<&str> {
    let id = file.split_once('.').map_or(file, |(stem, _)| stem);
    let valid = id.len() == 64 && id.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    valid.then_some(id)
}

/// Source identity taken from a request path such as `/https:_DS_a.test_DS_x.png` or
/// `/https/a.test/x.png`. Repairs the forms that proxies and browsers mangle.
pub fn decode_path_source(path: &str) -> String {
    let mut source = path.trim_start_matches('/').replace(DOUBLE_SLASH_TOKEN, "//");

    for scheme in ["https", "http"] {
        let mangled = format!("{scheme}/");
        if source.starts_with(&mangled) {
            source = source.replacen(&mangled, &format!("{scheme}:/"), 1);
        }
        let single = format!("{scheme}:/");
        let proper = format!("{scheme}://");
        if source.starts_with(&single) && !source.starts_with(&proper) {
            source = source.replacen(&single, &proper, 1);
        }
    }

    source
}

/// Normalize a source URL to absolute form and drop proxy-only query parameters.
///
/// Scheme and host are lowercased and default ports removed by URL parsing. A missing
/// scheme defaults to https. Only http and https sources are accepted.
pub fn normalize_source(raw: &str) -> ProxyResult<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ProxyError::invalid_request("no source URL given"));
    }

    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed.trim_start_matches('/'))
    };

    let mut url = Url::parse(&candidate)
        .map_err(|e| ProxyError::invalid_request(format!("invalid source URL '{trimmed}': {e}")))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ProxyError::invalid_request(format!(
            "source URL must use http or https, got '{}'",
            url.scheme()
        )));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(ProxyError::invalid_request(format!("source URL '{trimmed}' has no host")));
    }

    url.set_fragment(None);

    if let Some(query) = url.query() {
        // Filter raw segments so the upstream sees the remaining bytes exactly as given
        let kept = query
            .split('&')
            .filter(|segment| {
                let name = segment.split_once('=').map_or(*segment, |(name, _)| name);
                !segment.is_empty() && !PROXY_PARAMS.contains(&name)
            })
            .collect::<Vec<_>>()
            .join("&");

        if kept.is_empty() {
            url.set_query(None);
        } else {
            url.set_query(Some(&kept));
        }
    }

    Ok(url.to_string())
}
