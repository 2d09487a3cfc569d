//! Image transform codec
//!
//! Turns source bytes plus a `TransformRequest` into encoded output. The codec is
//! synchronous and CPU bound; callers run it on the blocking pool.
//!
//! Decision order:
//! 1. Undecodable sources pass through unchanged unless the request needs a decode.
//! 2. Animated sources pass through unchanged without a resize. With a resize every
//!    frame is scaled and the result is written as an animated GIF.
//! 3. Static sources pass through when no resize is requested and the target container
//!    already matches (JPEG is always re-encoded so quality applies).
//! 4. Everything else is decoded, resized and re-encoded.

pub mod format;
pub mod resize;

pub use format::{OCTET_STREAM, SourceFormat, is_animated};

use bytes::Bytes;
use image::codecs::gif::{GifDecoder, GifEncoder, Repeat};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{PngDecoder, PngEncoder};
use image::codecs::webp::{WebPDecoder, WebPEncoder};
use image::{
    AnimationDecoder, DynamicImage, ExtendedColorType, Frame, ImageDecoder, ImageEncoder, ImageReader,
    RgbaImage,
};
use std::io::Cursor;
use tracing::debug;

use crate::config::TransformConfig;
use crate::errors::{ProxyError, ProxyResult};
use crate::models::{OutputFormat, TransformRequest};

/// Encoded result of a transform
#[derive(Debug, Clone)]
pub struct TransformOutput {
    pub bytes: Bytes,
    pub content_type: &'static str,
    /// Short format name: png, jpeg, gif, webp or original
    pub format: &'static str,
    /// WebP thumbnail, only produced when the source was decoded
    pub thumbnail: Option<Bytes>,
    pub passthrough: bool,
}

#[derive(Debug, Clone)]
pub struct TransformCodec {
    max_source_pixels: u64,
    thumbnail_size: Option<u32>,
}

impl TransformCodec {
    pub fn new(config: &TransformConfig) -> Self {
        Self {
            max_source_pixels: config.max_source_pixels,
            thumbnail_size: config.generate_thumbnails.then_some(config.thumbnail_size),
        }
    }

    pub fn transform(&self, source: &[u8], request: &TransformRequest) -> ProxyResult<TransformOutput> {
        let detected = SourceFormat::detect(source);

        if !detected.is_decodable() {
            if request.requires_decode() {
                return Err(ProxyError::decode(format!(
                    "cannot transform source of type {}",
                    detected.content_type()
                )));
            }
            debug!("Passing through undecodable source ({})", detected.content_type());
            return Ok(passthrough(source, detected));
        }

        if is_animated(source, detected) {
            if !request.needs_resize() {
                return Ok(passthrough(source, detected));
            }
            return self.resize_animation(source, detected, request);
        }

        let keep_bytes = match request.format {
            OutputFormat::KeepOriginal => true,
            OutputFormat::Jpeg => false,
            format => detected.matches(format),
        };
        if keep_bytes && !request.needs_resize() {
            return Ok(passthrough(source, detected));
        }

        let raster = match self.decode(source, detected) {
            Ok(raster) => raster,
            Err(e) if !request.requires_decode() => {
                debug!("Source failed to decode, passing through: {}", e);
                return Ok(passthrough(source, detected));
            }
            Err(e) => return Err(e),
        };

        let resized = resize::resize(&raster, request.width, request.height, request.mode);
        let target = output_container(request.format, detected);
        let bytes = encode_still(&resized, target, request.quality)?;
        let thumbnail = match self.thumbnail_size {
            Some(size) => Some(encode_still(&resize::thumbnail(&raster, size, size), SourceFormat::Webp, 0)?),
            None => None,
        };

        Ok(TransformOutput {
            bytes: Bytes::from(bytes),
            content_type: target.content_type(),
            format: target.name(),
            thumbnail: thumbnail.map(Bytes::from),
            passthrough: false,
        })
    }

    fn check_pixels(&self, width: u32, height: u32) -> ProxyResult<()> {
        let pixels = width as u64 * height as u64;
        if pixels > self.max_source_pixels {
            return Err(ProxyError::decode(format!(
                "source is {width}x{height}, above the limit of {} pixels",
                self.max_source_pixels
            )));
        }
        Ok(())
    }

    fn decode(&self, source: &[u8], detected: SourceFormat) -> ProxyResult<RgbaImage> {
        let image_format = detected
            .image_format()
            .ok_or_else(|| ProxyError::decode(format!("unsupported format {}", detected.content_type())))?;

        let (width, height) = ImageReader::with_format(Cursor::new(source), image_format)
            .into_dimensions()
            .map_err(|e| ProxyError::decode(e.to_string()))?;
        self.check_pixels(width, height)?;

        let image = ImageReader::with_format(Cursor::new(source), image_format)
            .decode()
            .map_err(|e| ProxyError::decode(e.to_string()))?;
        Ok(image.to_rgba8())
    }

    fn resize_animation(
        &self,
        source: &[u8],
        detected: SourceFormat,
        request: &TransformRequest,
    ) -> ProxyResult<TransformOutput> {
        let decode_err = |e: image::ImageError| ProxyError::decode(e.to_string());

        let frames = match detected {
            SourceFormat::Gif => {
                let decoder = GifDecoder::new(Cursor::new(source)).map_err(decode_err)?;
                let (w, h) = decoder.dimensions();
                self.check_pixels(w, h)?;
                decoder.into_frames().collect_frames().map_err(decode_err)?
            }
            SourceFormat::Webp => {
                let decoder = WebPDecoder::new(Cursor::new(source)).map_err(decode_err)?;
                let (w, h) = decoder.dimensions();
                self.check_pixels(w, h)?;
                decoder.into_frames().collect_frames().map_err(decode_err)?
            }
            SourceFormat::Png => {
                let decoder = PngDecoder::new(Cursor::new(source)).map_err(decode_err)?;
                let (w, h) = decoder.dimensions();
                self.check_pixels(w, h)?;
                decoder.apng().map_err(decode_err)?.into_frames().collect_frames().map_err(decode_err)?
            }
            other => {
                return Err(ProxyError::decode(format!(
                    "{} cannot hold an animation",
                    other.content_type()
                )));
            }
        };

        let frame_count = frames.len();
        let resized = frames.into_iter().map(|frame| {
            let delay = frame.delay();
            let scaled = resize::resize(frame.buffer(), request.width, request.height, request.mode);
            Frame::from_parts(scaled, 0, 0, delay)
        });

        let mut out = Vec::new();
        {
            let mut encoder = GifEncoder::new(&mut out);
            encoder
                .set_repeat(Repeat::Infinite)
                .map_err(|e| ProxyError::encode(e.to_string()))?;
            encoder
                .encode_frames(resized)
                .map_err(|e| ProxyError::encode(e.to_string()))?;
        }
        debug!("Resized animation with {} frames", frame_count);

        Ok(TransformOutput {
            bytes: Bytes::from(out),
            content_type: SourceFormat::Gif.content_type(),
            format: SourceFormat::Gif.name(),
            thumbnail: None,
            passthrough: false,
        })
    }
}

fn passthrough(source: &[u8], detected: SourceFormat) -> TransformOutput {
    TransformOutput {
        bytes: Bytes::copy_from_slice(source),
        content_type: detected.content_type(),
        format: detected.name(),
        thumbnail: None,
        passthrough: true,
    }
}

fn output_container(format: OutputFormat, detected: SourceFormat) -> SourceFormat {
    match format {
        OutputFormat::KeepOriginal => detected,
        OutputFormat::Webp => SourceFormat::Webp,
        OutputFormat::Png => SourceFormat::Png,
        OutputFormat::Jpeg => SourceFormat::Jpeg,
    }
}

fn encode_still(img: &RgbaImage, target: SourceFormat, quality: u8) -> ProxyResult<Vec<u8>> {
    let encode_err = |e: image::ImageError| ProxyError::encode(e.to_string());
    let (width, height) = img.dimensions();
    let mut out = Vec::new();

    match target {
        SourceFormat::Png => PngEncoder::new(&mut out)
            .write_image(img.as_raw(), width, height, ExtendedColorType::Rgba8)
            .map_err(encode_err)?,
        SourceFormat::Jpeg => {
            let rgb = DynamicImage::ImageRgba8(img.clone()).to_rgb8();
            JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
                .write_image(rgb.as_raw(), width, height, ExtendedColorType::Rgb8)
                .map_err(encode_err)?
        }
        SourceFormat::Webp => WebPEncoder::new_lossless(&mut out)
            .write_image(img.as_raw(), width, height, ExtendedColorType::Rgba8)
            .map_err(encode_err)?,
        SourceFormat::Gif => GifEncoder::new(&mut out)
            .encode_frame(Frame::new(img.clone()))
            .map_err(encode_err)?,
        other => {
            return Err(ProxyError::encode(format!(
                "no encoder for {}",
                other.content_type()
            )));
        }
    }
    Ok(out)
}
