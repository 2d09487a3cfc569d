//! Raster scaling for the four resize modes
//!
//! All geometry truncates toward zero the same way for every mode, so a given source and
//! box always produce the same output dimensions.

use image::{Rgba, RgbaImage, imageops};

use crate::config::defaults::MAX_DIMENSION;
use crate::models::ResizeMode;

const PAD_COLOUR: Rgba<u8> = Rgba([255, 255, 255, 255]);

/// Resolve the requested box against the source size.
///
/// Returns `None` when neither dimension is set. A single dimension derives the other
/// from the source aspect ratio, capped at `MAX_DIMENSION`.
pub fn target_box(src_w: u32, src_h: u32, width: Option<u32>, height: Option<u32>) -> Option<(u32, u32)> {
    match (width, height) {
        (None, None) => None,
        (Some(w), Some(h)) => Some((w.max(1), h.max(1))),
        (Some(w), None) => Some((w.max(1), bounded(scaled(src_h, w as f64 / src_w as f64)))),
        (None, Some(h)) => Some((bounded(scaled(src_w, h as f64 / src_h as f64)), h.max(1))),
    }
}

fn scaled(length: u32, scale: f64) -> u32 {
    ((length as f64 * scale) as u32).max(1)
}

fn bounded(length: u32) -> u32 {
    length.min(MAX_DIMENSION)
}

/// Source-space rectangle sampled by a scale: origin and extent in fractional pixels
#[derive(Debug, Clone, Copy, PartialEq)]
struct Region {
    x: f64,
    y: f64,
    width: f64,
    height: f64,
}

impl Region {
    fn whole(img: &RgbaImage) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: img.width() as f64,
            height: img.height() as f64,
        }
    }
}

pub fn resize(img: &RgbaImage, width: Option<u32>, height: Option<u32>, mode: ResizeMode) -> RgbaImage {
    let (src_w, src_h) = img.dimensions();
    let Some((box_w, box_h)) = target_box(src_w, src_h, width, height) else {
        return img.clone();
    };

    // A one-sided request already matches the source aspect ratio
    if width.is_none() || height.is_none() {
        return scale_bilinear(img, box_w, box_h);
    }

    let scale_x = box_w as f64 / src_w as f64;
    let scale_y = box_h as f64 / src_h as f64;

    match mode {
        ResizeMode::Stretch => scale_bilinear(img, box_w, box_h),
        ResizeMode::Fit => {
            let (new_w, new_h) = contain(src_w, src_h, box_w, box_h, scale_x, scale_y);
            scale_bilinear(img, new_w, new_h)
        }
        ResizeMode::Fill => {
            let region = fill_region(src_w, src_h, scale_x, scale_y, box_w, box_h);
            sample_bilinear(img, region, box_w, box_h)
        }
        ResizeMode::Pad => {
            let (new_w, new_h) = contain(src_w, src_h, box_w, box_h, scale_x, scale_y);
            let scaled_img = scale_bilinear(img, new_w, new_h);
            let mut canvas = RgbaImage::from_pixel(box_w, box_h, PAD_COLOUR);
            let x = (box_w - new_w) / 2;
            let y = (box_h - new_h) / 2;
            imageops::overlay(&mut canvas, &scaled_img, x as i64, y as i64);
            canvas
        }
    }
}

// Largest size inside the box with the source aspect ratio; the limiting axis is exact
fn contain(src_w: u32, src_h: u32, box_w: u32, box_h: u32, scale_x: f64, scale_y: f64) -> (u32, u32) {
    if scale_x <= scale_y {
        (box_w, scaled(src_h, scale_x).min(box_h))
    } else {
        (scaled(src_w, scale_y).min(box_w), box_h)
    }
}

// Centered crop of the source that covers the box at the larger of the two scales.
// Sampling it straight to the box avoids materializing the overflowing intermediate.
fn fill_region(src_w: u32, src_h: u32, scale_x: f64, scale_y: f64, box_w: u32, box_h: u32) -> Region {
    let scale = scale_x.max(scale_y);
    let width = (box_w as f64 / scale).min(src_w as f64);
    let height = (box_h as f64 / scale).min(src_h as f64);
    Region {
        x: (src_w as f64 - width) / 2.0,
        y: (src_h as f64 - height) / 2.0,
        width,
        height,
    }
}

/// Bilinear interpolation over the 2x2 neighbourhood of each source sample point
pub fn scale_bilinear(img: &RgbaImage, new_w: u32, new_h: u32) -> RgbaImage {
    if img.dimensions() == (new_w.max(1), new_h.max(1)) {
        return img.clone();
    }
    sample_bilinear(img, Region::whole(img), new_w, new_h)
}

fn sample_bilinear(img: &RgbaImage, region: Region, new_w: u32, new_h: u32) -> RgbaImage {
    let (src_w, src_h) = img.dimensions();
    let new_w = new_w.max(1);
    let new_h = new_h.max(1);

    let step_x = region.width / new_w as f64;
    let step_y = region.height / new_h as f64;

    RgbaImage::from_fn(new_w, new_h, |x, y| {
        let sx = region.x + x as f64 * step_x;
        let sy = region.y + y as f64 * step_y;
        let x0 = (sx as u32).min(src_w - 1);
        let y0 = (sy as u32).min(src_h - 1);
        let x1 = (x0 + 1).min(src_w - 1);
        let y1 = (y0 + 1).min(src_h - 1);
        let fx = sx - x0 as f64;
        let fy = sy - y0 as f64;

        let p00 = img.get_pixel(x0, y0).0;
        let p10 = img.get_pixel(x1, y0).0;
        let p01 = img.get_pixel(x0, y1).0;
        let p11 = img.get_pixel(x1, y1).0;

        let mut out = [0u8; 4];
        for c in 0..4 {
            let value = (1.0 - fx) * (1.0 - fy) * p00[c] as f64
                + fx * (1.0 - fy) * p10[c] as f64
                + (1.0 - fx) * fy * p01[c] as f64
                + fx * fy * p11[c] as f64;
            out[c] = value.clamp(0.0, 255.0) as u8;
        }
        Rgba(out)
    })
}

/// Nearest-neighbour downscale to fit within `max_w` x `max_h`. Never upscales.
pub fn thumbnail(img: &RgbaImage, max_w: u32, max_h: u32) -> RgbaImage {
    let (src_w, src_h) = img.dimensions();
    let scale = (max_w as f64 / src_w as f64).min(max_h as f64 / src_h as f64);
    if scale >= 1.0 {
        return img.clone();
    }

    let new_w = scaled(src_w, scale);
    let new_h = scaled(src_h, scale);
    RgbaImage::from_fn(new_w, new_h, |x, y| {
        let sx = ((x as f64 / scale) as u32).min(src_w - 1);
        let sy = ((y as f64 / scale) as u32).min(src_h - 1);
        *img.get_pixel(sx, sy)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn gradient(width: u32, height: u32) -> RgbaImage {
        RgbaImage::from_fn(width, height, |x, y| {
            Rgba([(x * 255 / width.max(1)) as u8, (y * 255 / height.max(1)) as u8, 128, 255])
        })
    }

    #[rstest]
    #[case(400, 200, 100, 100)]
    #[case(200, 400, 100, 100)]
    #[case(640, 480, 300, 50)]
    #[case(10, 10, 100, 100)]
    #[case(333, 77, 64, 64)]
    fn test_fit_stays_within_box(#[case] sw: u32, #[case] sh: u32, #[case] bw: u32, #[case] bh: u32) {
        let out = resize(&gradient(sw, sh), Some(bw), Some(bh), ResizeMode::Fit);
        assert!(out.width() <= bw && out.height() <= bh);
        assert!(out.width() == bw || out.height() == bh);
    }

    #[rstest]
    #[case(ResizeMode::Fill)]
    #[case(ResizeMode::Stretch)]
    #[case(ResizeMode::Pad)]
    fn test_exact_box_modes(#[case] mode: ResizeMode) {
        for (sw, sh) in [(400, 200), (200, 400), (333, 77), (7, 7)] {
            let out = resize(&gradient(sw, sh), Some(120), Some(90), mode);
            assert_eq!(out.dimensions(), (120, 90), "{mode} {sw}x{sh}");
        }
    }

    #[test]
    fn test_pad_borders_are_white() {
        let src = RgbaImage::from_pixel(400, 100, Rgba([0, 0, 0, 255]));
        let out = resize(&src, Some(100), Some(100), ResizeMode::Pad);

        // 100x25 content centered vertically
        for x in 0..100 {
            assert_eq!(*out.get_pixel(x, 0), PAD_COLOUR);
            assert_eq!(*out.get_pixel(x, 99), PAD_COLOUR);
        }
        assert_eq!(*out.get_pixel(50, 50), Rgba([0, 0, 0, 255]));
    }

    #[test]
    fn test_fill_crops_center() {
        // Left half red, right half blue; a square fill keeps the middle
        let src = RgbaImage::from_fn(300, 100, |x, _| {
            if x < 150 { Rgba([255, 0, 0, 255]) } else { Rgba([0, 0, 255, 255]) }
        });
        let out = resize(&src, Some(100), Some(100), ResizeMode::Fill);
        assert_eq!(out.get_pixel(0, 50).0[0], 255);
        assert_eq!(out.get_pixel(99, 50).0[2], 255);
    }

    #[test]
    fn test_single_dimension_keeps_aspect() {
        let src = gradient(400, 200);
        assert_eq!(resize(&src, Some(100), None, ResizeMode::Fill).dimensions(), (100, 50));
        assert_eq!(resize(&src, None, Some(50), ResizeMode::Pad).dimensions(), (100, 50));
    }

    #[rstest]
    #[case(1, 10_000, Some(5000), None)]
    #[case(10_000, 1, None, Some(5000))]
    #[case(3, 9_000, Some(4000), None)]
    fn test_one_sided_box_is_capped(
        #[case] sw: u32,
        #[case] sh: u32,
        #[case] width: Option<u32>,
        #[case] height: Option<u32>,
    ) {
        let (w, h) = target_box(sw, sh, width, height).unwrap();
        assert!(w <= MAX_DIMENSION && h <= MAX_DIMENSION, "{w}x{h}");
    }

    #[test]
    fn test_one_sided_extreme_aspect_output_is_capped() {
        // 1 wide at unit scale would derive a height of 10000
        let src = gradient(1, 10_000);
        let out = resize(&src, Some(1), None, ResizeMode::Fit);
        assert_eq!(out.dimensions(), (1, MAX_DIMENSION));
    }

    #[rstest]
    #[case(10_000, 1)]
    #[case(1, 10_000)]
    #[case(4_000, 3)]
    fn test_fill_extreme_aspect_matches_box(#[case] sw: u32, #[case] sh: u32) {
        let src = gradient(sw, sh);
        let out = resize(&src, Some(64), Some(48), ResizeMode::Fill);
        assert_eq!(out.dimensions(), (64, 48));
    }

    #[test]
    fn test_fill_region_stays_inside_source() {
        // 10000x1 into 5000x5000 needs a 1x1 window at the center of the source
        let region = fill_region(10_000, 1, 0.5, 5000.0, 5000, 5000);
        assert!(region.width <= 10_000.0 && region.height <= 1.0);
        assert!((region.x + region.width / 2.0 - 5000.0).abs() < 1e-6);
        assert_eq!(region.y, 0.0);
    }

    #[test]
    fn test_no_dimensions_is_identity() {
        let src = gradient(20, 10);
        assert_eq!(resize(&src, None, None, ResizeMode::Stretch), src);
    }

    #[test]
    fn test_bilinear_is_deterministic() {
        let src = gradient(97, 61);
        assert_eq!(scale_bilinear(&src, 40, 30), scale_bilinear(&src, 40, 30));
    }

    #[test]
    fn test_bilinear_flat_colour_stays_flat() {
        let src = RgbaImage::from_pixel(50, 50, Rgba([200, 100, 50, 255]));
        let out = scale_bilinear(&src, 13, 29);
        assert!(out.pixels().all(|p| *p == Rgba([200, 100, 50, 255])));
    }

    #[test]
    fn test_thumbnail_fits_and_never_upscales() {
        let big = thumbnail(&gradient(800, 400), 200, 200);
        assert_eq!(big.dimensions(), (200, 100));

        let small = thumbnail(&gradient(50, 40), 200, 200);
        assert_eq!(small.dimensions(), (50, 40));
    }
}
