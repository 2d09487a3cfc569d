//! Magic-byte format detection

use image::AnimationDecoder;
use image::ImageFormat;
use image::codecs::gif::GifDecoder;
use image::codecs::png::PngDecoder;
use std::io::Cursor;

use crate::models::OutputFormat;

pub const OCTET_STREAM: &str = "application/octet-stream";

/// Source format as recognised from the leading bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Png,
    Jpeg,
    Gif,
    Webp,
    /// Something `infer` recognises but the codec cannot decode
    Other(&'static str),
    Unknown,
}

impl SourceFormat {
    pub fn detect(data: &[u8]) -> Self {
        match infer::get(data).map(|kind| kind.mime_type()) {
            Some("image/png") | Some("image/apng") => SourceFormat::Png,
            Some("image/jpeg") => SourceFormat::Jpeg,
            Some("image/gif") => SourceFormat::Gif,
            Some("image/webp") => SourceFormat::Webp,
            Some(mime) => SourceFormat::Other(mime),
            None => SourceFormat::Unknown,
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            SourceFormat::Png => "image/png",
            SourceFormat::Jpeg => "image/jpeg",
            SourceFormat::Gif => "image/gif",
            SourceFormat::Webp => "image/webp",
            SourceFormat::Other(mime) => mime,
            SourceFormat::Unknown => OCTET_STREAM,
        }
    }

    /// Short name stored alongside cache entries
    pub fn name(self) -> &'static str {
        match self {
            SourceFormat::Png => "png",
            SourceFormat::Jpeg => "jpeg",
            SourceFormat::Gif => "gif",
            SourceFormat::Webp => "webp",
            SourceFormat::Other(_) | SourceFormat::Unknown => "original",
        }
    }

    pub fn image_format(self) -> Option<ImageFormat> {
        match self {
            SourceFormat::Png => Some(ImageFormat::Png),
            SourceFormat::Jpeg => Some(ImageFormat::Jpeg),
            SourceFormat::Gif => Some(ImageFormat::Gif),
            SourceFormat::Webp => Some(ImageFormat::WebP),
            SourceFormat::Other(_) | SourceFormat::Unknown => None,
        }
    }

    pub fn is_decodable(self) -> bool {
        self.image_format().is_some()
    }

    /// True when re-encoding to `format` would produce the same container
    pub fn matches(self, format: OutputFormat) -> bool {
        matches!(
            (self, format),
            (SourceFormat::Png, OutputFormat::Png)
                | (SourceFormat::Jpeg, OutputFormat::Jpeg)
                | (SourceFormat::Webp, OutputFormat::Webp)
        )
    }
}

/// True for GIF, APNG and WebP containers holding more than one frame
pub fn is_animated(data: &[u8], format: SourceFormat) -> bool {
    match format {
        SourceFormat::Gif => GifDecoder::new(Cursor::new(data))
            .map(|decoder| decoder.into_frames().take(2).filter(Result::is_ok).count() > 1)
            .unwrap_or(false),
        SourceFormat::Webp => webp_has_animation_flag(data),
        SourceFormat::Png => PngDecoder::new(Cursor::new(data))
            .and_then(|decoder| decoder.is_apng())
            .unwrap_or(false),
        _ => false,
    }
}

// RIFF....WEBPVP8X, flags byte follows the chunk header; bit 1 marks animation
fn webp_has_animation_flag(data: &[u8]) -> bool {
    data.len() > 20 && &data[12..16] == b"VP8X" && data[20] & 0x02 != 0
}
