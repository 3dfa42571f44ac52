//! Two-stage face detector: face candidates first, then eyes inside each face.
//!
//! A face is accepted only when enough eyes are found inside it, which rejects
//! false positives and off-angle faces before they reach the classifier.

use crate::cascade::{CascadeError, HaarCascade};
use crate::types::{ChannelOrder, PixelGrid, Rect};
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const FACE_CASCADE_FILE: &str = "haarcascade_frontalface_default.xml";
pub const EYE_CASCADE_FILE: &str = "haarcascade_eye.xml";

/// Multi-scale scan settings for one detector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScanParams {
    /// Pyramid step between scales; must be greater than 1.
    pub scale_factor: f32,
    /// A detection needs more than this many raw hits in its cluster.
    pub min_neighbors: u32,
}

impl ScanParams {
    pub const fn new(scale_factor: f32, min_neighbors: u32) -> Self {
        Self { scale_factor, min_neighbors }
    }
}

/// Anything that finds object rectangles in an intensity image.
pub trait ObjectDetector: Send + Sync {
    fn detect(&self, image: &GrayImage, params: &ScanParams) -> Vec<Rect>;
}

impl<T: ObjectDetector + ?Sized> ObjectDetector for std::sync::Arc<T> {
    fn detect(&self, image: &GrayImage, params: &ScanParams) -> Vec<Rect> {
        self.as_ref().detect(image, params)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    pub face: ScanParams,
    pub eyes: ScanParams,
    /// Eyes required inside a face candidate for it to be accepted.
    pub min_eyes: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            face: ScanParams::new(1.3, 5),
            eyes: ScanParams::new(1.1, 3),
            min_eyes: 2,
        }
    }
}

/// Locations of the face and eye cascade descriptors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CascadePaths {
    pub face: PathBuf,
    pub eyes: PathBuf,
}

impl CascadePaths {
    /// The stock OpenCV file names inside `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            face: dir.join(FACE_CASCADE_FILE),
            eyes: dir.join(EYE_CASCADE_FILE),
        }
    }
}

/// An accepted face.
#[derive(Debug, Clone)]
pub struct DetectionRegion {
    /// Face rectangle in source-grid coordinates.
    pub rect: Rect,
    /// Eye rectangles relative to the face crop.
    pub eyes: Vec<Rect>,
    /// Color pixels under `rect`.
    pub crop: PixelGrid,
}

pub struct FaceEyeDetector {
    face: Box<dyn ObjectDetector>,
    eyes: Box<dyn ObjectDetector>,
    config: DetectorConfig,
}

impl FaceEyeDetector {
    pub fn new(
        face: impl ObjectDetector + 'static,
        eyes: impl ObjectDetector + 'static,
        config: DetectorConfig,
    ) -> Self {
        Self {
            face: Box::new(face),
            eyes: Box::new(eyes),
            config,
        }
    }

    /// Load both Haar cascades from disk.
    pub fn load(paths: &CascadePaths, config: DetectorConfig) -> Result<Self, CascadeError> {
        let face = HaarCascade::load(&paths.face)?;
        let eyes = HaarCascade::load(&paths.eyes)?;
        Ok(Self::new(face, eyes, config))
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Find faces with at least `min_eyes` eyes, in face-detector order.
    pub fn detect(&self, grid: &PixelGrid) -> Vec<DetectionRegion> {
        if grid.is_empty() {
            return Vec::new();
        }

        let gray = grid.to_gray(ChannelOrder::Bgr);
        let candidates = self.face.detect(&gray, &self.config.face);

        let mut regions = Vec::new();
        for candidate in candidates {
            let Some(rect) = candidate.clip_to(grid.width(), grid.height()) else {
                continue;
            };

            let face_gray = image::imageops::crop_imm(&gray, rect.x, rect.y, rect.width, rect.height).to_image();
            let eyes: Vec<Rect> = self
                .eyes
                .detect(&face_gray, &self.config.eyes)
                .into_iter()
                .filter_map(|e| e.clip_to(rect.width, rect.height))
                .collect();

            if eyes.len() < self.config.min_eyes {
                tracing::debug!(?rect, eyes = eyes.len(), "face rejected: not enough eyes");
                continue;
            }

            tracing::debug!(?rect, eyes = eyes.len(), "face accepted");
            regions.push(DetectionRegion {
                rect,
                eyes,
                crop: grid.crop(&rect),
            });
        }

        regions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Returns canned rectangles and records the size of every image it saw.
    struct Fixed {
        rects: Vec<Rect>,
        seen: Mutex<Vec<(u32, u32)>>,
    }

    impl Fixed {
        fn new(rects: Vec<Rect>) -> Self {
            Self { rects, seen: Mutex::new(Vec::new()) }
        }
    }

    impl ObjectDetector for Fixed {
        fn detect(&self, image: &GrayImage, _params: &ScanParams) -> Vec<Rect> {
            self.seen.lock().unwrap().push(image.dimensions());
            self.rects.clone()
        }
    }

    fn two_eyes() -> Vec<Rect> {
        vec![Rect::new(2, 2, 5, 5), Rect::new(10, 2, 5, 5)]
    }

    #[test]
    fn test_face_with_two_eyes_accepted() {
        let detector = FaceEyeDetector::new(
            Fixed::new(vec![Rect::new(10, 10, 20, 20)]),
            Fixed::new(two_eyes()),
            DetectorConfig::default(),
        );
        let grid = PixelGrid::filled(64, 64, [1, 2, 3]);
        let regions = detector.detect(&grid);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].rect, Rect::new(10, 10, 20, 20));
        assert_eq!(regions[0].eyes.len(), 2);
        assert_eq!((regions[0].crop.width(), regions[0].crop.height()), (20, 20));
    }

    #[test]
    fn test_face_with_one_eye_rejected() {
        let detector = FaceEyeDetector::new(
            Fixed::new(vec![Rect::new(10, 10, 20, 20)]),
            Fixed::new(vec![Rect::new(2, 2, 5, 5)]),
            DetectorConfig::default(),
        );
        assert!(detector.detect(&PixelGrid::filled(64, 64, [0, 0, 0])).is_empty());
    }

    #[test]
    fn test_eye_search_limited_to_face() {
        let eyes = std::sync::Arc::new(Fixed::new(two_eyes()));
        let detector = FaceEyeDetector::new(
            Fixed::new(vec![Rect::new(0, 0, 30, 20), Rect::new(30, 30, 16, 12)]),
            eyes.clone(),
            DetectorConfig::default(),
        );
        detector.detect(&PixelGrid::filled(64, 64, [0, 0, 0]));
        assert_eq!(*eyes.seen.lock().unwrap(), vec![(30, 20), (16, 12)]);
    }

    #[test]
    fn test_candidate_clipped_to_grid() {
        let detector = FaceEyeDetector::new(
            Fixed::new(vec![Rect::new(50, 50, 30, 30), Rect::new(100, 100, 5, 5)]),
            Fixed::new(two_eyes()),
            DetectorConfig::default(),
        );
        let regions = detector.detect(&PixelGrid::filled(64, 64, [0, 0, 0]));
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].rect, Rect::new(50, 50, 14, 14));
    }

    #[test]
    fn test_detection_order_preserved() {
        let faces = vec![Rect::new(40, 0, 20, 20), Rect::new(0, 0, 20, 20)];
        let detector = FaceEyeDetector::new(Fixed::new(faces.clone()), Fixed::new(two_eyes()), DetectorConfig::default());
        let rects: Vec<Rect> = detector
            .detect(&PixelGrid::filled(64, 64, [0, 0, 0]))
            .into_iter()
            .map(|r| r.rect)
            .collect();
        assert_eq!(rects, faces);
    }

    #[test]
    fn test_empty_grid() {
        let detector = FaceEyeDetector::new(
            Fixed::new(vec![Rect::new(0, 0, 1, 1)]),
            Fixed::new(two_eyes()),
            DetectorConfig::default(),
        );
        assert!(detector.detect(&PixelGrid::filled(0, 0, [0, 0, 0])).is_empty());
    }

    #[test]
    fn test_cascade_paths_in_dir() {
        let paths = CascadePaths::in_dir(Path::new("opencv/haarcascades"));
        assert!(paths.face.ends_with(FACE_CASCADE_FILE));
        assert!(paths.eyes.ends_with(EYE_CASCADE_FILE));
    }
}
