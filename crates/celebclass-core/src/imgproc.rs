//! Bilinear resizing for interleaved 8-bit images.

use crate::types::PixelGrid;
use image::GrayImage;

/// Resize an interleaved 8-bit image with bilinear interpolation.
///
/// Pixel centres sit at half-integer coordinates and source coordinates below
/// zero clamp to the first row/column, which reproduces OpenCV's `INTER_LINEAR`.
/// Returns an empty buffer when either the source or the target has zero area.
pub fn resize_bilinear(
    src: &[u8],
    width: usize,
    height: usize,
    channels: usize,
    new_width: usize,
    new_height: usize,
) -> Vec<u8> {
    if width == 0 || height == 0 || new_width == 0 || new_height == 0 {
        return Vec::new();
    }

    let scale_x = width as f32 / new_width as f32;
    let scale_y = height as f32 / new_height as f32;

    // Horizontal taps are the same for every row.
    let x_taps: Vec<(usize, usize, f32)> = (0..new_width)
        .map(|x| sample_taps(x, scale_x, width))
        .collect();

    let mut out = vec![0u8; new_width * new_height * channels];
    for y in 0..new_height {
        let (y0, y1, fy) = sample_taps(y, scale_y, height);
        let row0 = &src[y0 * width * channels..(y0 + 1) * width * channels];
        let row1 = &src[y1 * width * channels..(y1 + 1) * width * channels];

        for (x, &(x0, x1, fx)) in x_taps.iter().enumerate() {
            for c in 0..channels {
                let tl = row0[x0 * channels + c] as f32;
                let tr = row0[x1 * channels + c] as f32;
                let bl = row1[x0 * channels + c] as f32;
                let br = row1[x1 * channels + c] as f32;

                let val = tl * (1.0 - fx) * (1.0 - fy)
                    + tr * fx * (1.0 - fy)
                    + bl * (1.0 - fx) * fy
                    + br * fx * fy;

                out[(y * new_width + x) * channels + c] = val.round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    out
}

/// Source neighbours and blend weight for output coordinate `dst`.
fn sample_taps(dst: usize, scale: f32, len: usize) -> (usize, usize, f32) {
    let src = ((dst as f32 + 0.5) * scale - 0.5).max(0.0);
    let i0 = (src.floor() as usize).min(len - 1);
    if i0 + 1 >= len {
        return (i0, i0, 0.0);
    }
    (i0, i0 + 1, src - i0 as f32)
}

/// Resize a single-channel image.
pub fn resize_gray(image: &GrayImage, new_width: u32, new_height: u32) -> GrayImage {
    let (w, h) = image.dimensions();
    let data = resize_bilinear(
        image.as_raw(),
        w as usize,
        h as usize,
        1,
        new_width as usize,
        new_height as usize,
    );
    GrayImage::from_raw(new_width, new_height, data).unwrap_or_else(|| GrayImage::new(0, 0))
}

impl PixelGrid {
    /// Resize with bilinear interpolation, preserving the BGR byte order.
    pub fn resize(&self, new_width: u32, new_height: u32) -> PixelGrid {
        let data = resize_bilinear(
            self.data(),
            self.width() as usize,
            self.height() as usize,
            3,
            new_width as usize,
            new_height as usize,
        );
        PixelGrid::from_bgr(data, new_width, new_height)
            .unwrap_or_else(|| PixelGrid::filled(0, 0, [0, 0, 0]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bilinear_resize_uniform() {
        let frame = vec![128u8; 100 * 100];
        let resized = resize_bilinear(&frame, 100, 100, 1, 200, 200);
        assert_eq!(resized.len(), 200 * 200);
        assert!(resized.iter().all(|&p| p == 128), "uniform resize should stay uniform");
    }

    #[test]
    fn test_downscale_by_two_averages_pairs() {
        // 4x1 -> 2x1: sample points fall exactly between source pixels.
        let src = vec![0u8, 100, 200, 250];
        let out = resize_bilinear(&src, 4, 1, 1, 2, 1);
        assert_eq!(out, vec![50, 225]);
    }

    #[test]
    fn test_upscale_clamps_edges() {
        // 2x1 -> 4x1: outermost samples clamp to the edge pixels.
        let src = vec![0u8, 200];
        let out = resize_bilinear(&src, 2, 1, 1, 4, 1);
        assert_eq!(out[0], 0);
        assert_eq!(out[3], 200);
        assert_eq!(out[1], 50);
        assert_eq!(out[2], 150);
    }

    #[test]
    fn test_channels_resized_independently() {
        let grid = PixelGrid::filled(7, 5, [10, 20, 30]);
        let out = grid.resize(32, 32);
        assert_eq!((out.width(), out.height()), (32, 32));
        assert_eq!(out.pixel(0, 0), [10, 20, 30]);
        assert_eq!(out.pixel(31, 31), [10, 20, 30]);
    }

    #[test]
    fn test_zero_area_is_empty() {
        assert!(resize_bilinear(&[], 0, 0, 3, 32, 32).is_empty());
        assert!(resize_bilinear(&[1, 2, 3], 1, 1, 3, 0, 32).is_empty());
    }
}
