use image::GrayImage;
use serde::{Deserialize, Serialize};

/// Axis-aligned rectangle in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn right(&self) -> u32 {
        self.x.saturating_add(self.width)
    }

    pub fn bottom(&self) -> u32 {
        self.y.saturating_add(self.height)
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Intersect with a `width` x `height` canvas anchored at the origin.
    ///
    /// Returns `None` when nothing of the rectangle remains.
    pub fn clip_to(&self, width: u32, height: u32) -> Option<Rect> {
        let right = self.right().min(width);
        let bottom = self.bottom().min(height);
        if self.x >= right || self.y >= bottom {
            return None;
        }
        Some(Rect::new(self.x, self.y, right - self.x, bottom - self.y))
    }
}

/// How the three interleaved bytes of a pixel are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelOrder {
    #[default]
    Bgr,
    Rgb,
}

/// An 8-bit, 3-channel image with interleaved B,G,R bytes.
///
/// Every grid in the pipeline uses this order: decoders reorder into it and
/// the detector and feature stages read from it.
#[derive(Clone, PartialEq, Eq)]
pub struct PixelGrid {
    data: Vec<u8>,
    width: u32,
    height: u32,
}

impl std::fmt::Debug for PixelGrid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PixelGrid")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

impl PixelGrid {
    /// Wrap interleaved BGR bytes. Returns `None` if the buffer length does not
    /// match `width * height * 3`.
    pub fn from_bgr(data: Vec<u8>, width: u32, height: u32) -> Option<Self> {
        if data.len() != width as usize * height as usize * 3 {
            return None;
        }
        Some(Self { data, width, height })
    }

    /// Build a grid from an RGB image, swapping red and blue.
    pub fn from_rgb_image(image: &image::RgbImage) -> Self {
        let (width, height) = image.dimensions();
        let mut data = image.as_raw().clone();
        for px in data.chunks_exact_mut(3) {
            px.swap(0, 2);
        }
        Self { data, width, height }
    }

    /// A grid where every pixel is `bgr`.
    pub fn filled(width: u32, height: u32, bgr: [u8; 3]) -> Self {
        let n = width as usize * height as usize;
        let mut data = Vec::with_capacity(n * 3);
        for _ in 0..n {
            data.extend_from_slice(&bgr);
        }
        Self { data, width, height }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Raw interleaved BGR bytes, row-major.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// BGR triplet at `(x, y)`.
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let i = (y as usize * self.width as usize + x as usize) * 3;
        [self.data[i], self.data[i + 1], self.data[i + 2]]
    }

    /// Copy out the sub-grid under `rect`, clipped to the grid bounds.
    pub fn crop(&self, rect: &Rect) -> PixelGrid {
        let Some(r) = rect.clip_to(self.width, self.height) else {
            return PixelGrid { data: Vec::new(), width: 0, height: 0 };
        };
        let stride = self.width as usize * 3;
        let row_bytes = r.width as usize * 3;
        let mut data = Vec::with_capacity(row_bytes * r.height as usize);
        for y in r.y..r.bottom() {
            let start = y as usize * stride + r.x as usize * 3;
            data.extend_from_slice(&self.data[start..start + row_bytes]);
        }
        PixelGrid { data, width: r.width, height: r.height }
    }

    /// Collapse to one intensity channel with ITU-R BT.601 luma weights.
    ///
    /// `order` says how to read each stored triplet. Uses the same 14-bit
    /// fixed-point weights as OpenCV so results match it bit for bit.
    pub fn to_gray(&self, order: ChannelOrder) -> GrayImage {
        const R_W: u32 = 4899;
        const G_W: u32 = 9617;
        const B_W: u32 = 1868;
        const SHIFT: u32 = 14;

        let gray: Vec<u8> = self
            .data
            .chunks_exact(3)
            .map(|px| {
                let (b, g, r) = match order {
                    ChannelOrder::Bgr => (px[0], px[1], px[2]),
                    ChannelOrder::Rgb => (px[2], px[1], px[0]),
                };
                let y = r as u32 * R_W + g as u32 * G_W + b as u32 * B_W + (1 << (SHIFT - 1));
                (y >> SHIFT).min(255) as u8
            })
            .collect();

        // Length is width * height by construction.
        GrayImage::from_raw(self.width, self.height, gray)
            .unwrap_or_else(|| GrayImage::new(self.width, self.height))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rect_clip_inside() {
        let r = Rect::new(2, 3, 4, 5);
        assert_eq!(r.clip_to(100, 100), Some(r));
    }

    #[test]
    fn test_rect_clip_overhang() {
        let r = Rect::new(8, 8, 10, 10);
        assert_eq!(r.clip_to(12, 10), Some(Rect::new(8, 8, 4, 2)));
    }

    #[test]
    fn test_rect_clip_outside() {
        assert_eq!(Rect::new(20, 0, 5, 5).clip_to(10, 10), None);
        assert_eq!(Rect::new(0, 0, 0, 5).clip_to(10, 10), None);
    }

    #[test]
    fn test_from_bgr_length_check() {
        assert!(PixelGrid::from_bgr(vec![0; 12], 2, 2).is_some());
        assert!(PixelGrid::from_bgr(vec![0; 11], 2, 2).is_none());
    }

    #[test]
    fn test_from_rgb_image_swaps_channels() {
        let img = image::RgbImage::from_pixel(2, 1, image::Rgb([10, 20, 30]));
        let grid = PixelGrid::from_rgb_image(&img);
        assert_eq!(grid.pixel(0, 0), [30, 20, 10]);
        assert_eq!(grid.pixel(1, 0), [30, 20, 10]);
    }

    #[test]
    fn test_crop_copies_rows() {
        let mut data = Vec::new();
        for i in 0..16u8 {
            data.extend_from_slice(&[i, i, i]);
        }
        let grid = PixelGrid::from_bgr(data, 4, 4).unwrap();
        let crop = grid.crop(&Rect::new(1, 2, 2, 2));
        assert_eq!((crop.width(), crop.height()), (2, 2));
        assert_eq!(crop.pixel(0, 0), [9, 9, 9]);
        assert_eq!(crop.pixel(1, 1), [14, 14, 14]);
    }

    #[test]
    fn test_crop_outside_is_empty() {
        let grid = PixelGrid::filled(4, 4, [1, 2, 3]);
        assert!(grid.crop(&Rect::new(10, 10, 2, 2)).is_empty());
    }

    #[test]
    fn test_gray_weights() {
        // Pure red stored as BGR.
        let grid = PixelGrid::filled(1, 1, [0, 0, 255]);
        assert_eq!(grid.to_gray(ChannelOrder::Bgr).get_pixel(0, 0)[0], 76);
        // Same bytes read as RGB: the 255 lands in the blue slot.
        assert_eq!(grid.to_gray(ChannelOrder::Rgb).get_pixel(0, 0)[0], 29);
    }

    #[test]
    fn test_gray_white_stays_white() {
        let grid = PixelGrid::filled(3, 2, [255, 255, 255]);
        let gray = grid.to_gray(ChannelOrder::Bgr);
        assert!(gray.pixels().all(|p| p[0] == 255));
    }
}
