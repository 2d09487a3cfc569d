//! Transform request value types
//!
//! A `TransformRequest` is immutable once built; `TransformRequest::parse` is the single
//! place where raw query values are validated.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use strum::{AsRefStr, Display, EnumString};

use crate::config::defaults::{DEFAULT_QUALITY, MAX_DIMENSION, MAX_QUALITY, MIN_DIMENSION, MIN_QUALITY};
use crate::errors::{ProxyError, ProxyResult};
use crate::services::cache_key::normalize_source;

/// Target encoding for a transform
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Re-encode in whatever format the source was detected as
    #[strum(to_string = "original")]
    #[serde(rename = "original")]
    KeepOriginal,
    #[default]
    Webp,
    Png,
    #[strum(to_string = "jpeg", serialize = "jpg")]
    Jpeg,
}

/// How a source is fitted into a requested width/height box
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum ResizeMode {
    #[default]
    Fit,
    Fill,
    Stretch,
    Pad,
}

/// Raw, unvalidated transform parameters as received from the routing layer
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransformParams {
    pub url: Option<String>,
    pub format: Option<String>,
    pub w: Option<String>,
    pub h: Option<String>,
    pub q: Option<String>,
    pub mode: Option<String>,
}

impl TransformParams {
    /// Whether any transform parameter carries a value
    pub fn has_transform(&self) -> bool {
        [&self.format, &self.w, &self.h, &self.q, &self.mode]
            .into_iter()
            .any(|value| non_empty(value).is_some())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransformRequest {
    /// Absolute source URL with proxy-only parameters removed
    pub source: String,
    pub format: OutputFormat,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub mode: ResizeMode,
    pub quality: u8,
}

impl TransformRequest {
    /// Build a request for `source` with every parameter at its default
    pub fn new<S: Into<String>>(source: S) -> Self {
        Self {
            source: source.into(),
            format: OutputFormat::default(),
            width: None,
            height: None,
            mode: ResizeMode::default(),
            quality: DEFAULT_QUALITY,
        }
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_size(mut self, width: Option<u32>, height: Option<u32>) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_mode(mut self, mode: ResizeMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_quality(mut self, quality: u8) -> Self {
        self.quality = quality;
        self
    }

    /// Normalize `source` and validate raw query values. Empty strings are treated as absent.
    pub fn parse(source: &str, params: &TransformParams) -> ProxyResult<Self> {
        Self::from_params(normalize_source(source)?, params)
    }

    /// Validate raw query values against a source that needs no normalization
    pub fn from_params<S: Into<String>>(source: S, params: &TransformParams) -> ProxyResult<Self> {
        let mut request = Self::new(source);

        if let Some(raw) = non_empty(&params.format) {
            let format = OutputFormat::from_str(raw)
                .map_err(|_| ProxyError::invalid_request(format!("unsupported format '{raw}'")))?;
            request = request.with_format(format);
        }

        let width = parse_dimension("w", non_empty(&params.w))?;
        let height = parse_dimension("h", non_empty(&params.h))?;
        request = request.with_size(width, height);

        if let Some(raw) = non_empty(&params.q) {
            let quality: u8 = raw
                .parse()
                .map_err(|_| ProxyError::invalid_request(format!("invalid quality '{raw}'")))?;
            if !(MIN_QUALITY..=MAX_QUALITY).contains(&quality) {
                return Err(ProxyError::invalid_request(format!(
                    "quality must be between {MIN_QUALITY} and {MAX_QUALITY}, got {quality}"
                )));
            }
            request = request.with_quality(quality);
        }

        if let Some(raw) = non_empty(&params.mode) {
            let mode = ResizeMode::from_str(raw)
                .map_err(|_| ProxyError::invalid_request(format!("unsupported mode '{raw}'")))?;
            request = request.with_mode(mode);
        }

        Ok(request)
    }

    /// Whether any pixel-level work is requested
    pub fn needs_resize(&self) -> bool {
        self.width.is_some() || self.height.is_some()
    }

    /// Whether serving the source unchanged would violate the request.
    ///
    /// Without a resize, `original` and the default `webp` are both satisfied by the raw
    /// bytes when the source cannot be decoded; an explicit png/jpeg target is not.
    pub fn requires_decode(&self) -> bool {
        self.needs_resize() || matches!(self.format, OutputFormat::Png | OutputFormat::Jpeg)
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn parse_dimension(name: &str, raw: Option<&str>) -> ProxyResult<Option<u32>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let value: u32 = raw
        .parse()
        .map_err(|_| ProxyError::invalid_request(format!("invalid {name} '{raw}'")))?;
    if !(MIN_DIMENSION..=MAX_DIMENSION).contains(&value) {
        return Err(ProxyError::invalid_request(format!(
            "{name} must be between {MIN_DIMENSION} and {MAX_DIMENSION}, got {value}"
        )));
    }
    Ok(Some(value))
}
