//! Classifier input: a fixed-size raw-plus-wavelet vector per face region.

use crate::imgproc::resize_gray;
use crate::types::PixelGrid;
use crate::wavelet::{self, WaveletConfig};
use image::GrayImage;
use thiserror::Error;

/// Side of the square both feature images are resized to.
pub const FEATURE_SIDE: u32 = 32;
pub const RAW_DIM: usize = (FEATURE_SIDE * FEATURE_SIDE * 3) as usize;
pub const WAVELET_DIM: usize = (FEATURE_SIDE * FEATURE_SIDE) as usize;
pub const FEATURE_DIM: usize = RAW_DIM + WAVELET_DIM;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FeatureError {
    #[error("region has no pixels ({width}x{height})")]
    EmptyRegion { width: u32, height: u32 },
    #[error("wavelet level must be at least 1, got {0}")]
    InvalidLevel(usize),
    #[error("feature vector must have {expected} elements, got {actual}")]
    Shape { expected: usize, actual: usize },
}

/// `FEATURE_DIM` values: the 32x32 BGR region, row-major and channel-interleaved,
/// followed by the 32x32 wavelet map.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector(Vec<f32>);

impl FeatureVector {
    pub fn new(values: Vec<f32>) -> Result<Self, FeatureError> {
        if values.len() != FEATURE_DIM {
            return Err(FeatureError::Shape {
                expected: FEATURE_DIM,
                actual: values.len(),
            });
        }
        Ok(Self(values))
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn raw(&self) -> &[f32] {
        &self.0[..RAW_DIM]
    }

    pub fn wavelet(&self) -> &[f32] {
        &self.0[RAW_DIM..]
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> Vec<f32> {
        self.0
    }
}

/// Downscale a region and its wavelet map to `FEATURE_SIDE` and concatenate them.
pub fn assemble(region: &PixelGrid, wavelet_map: &GrayImage) -> Result<FeatureVector, FeatureError> {
    if region.is_empty() {
        return Err(FeatureError::EmptyRegion {
            width: region.width(),
            height: region.height(),
        });
    }
    let (mw, mh) = wavelet_map.dimensions();
    if mw == 0 || mh == 0 {
        return Err(FeatureError::EmptyRegion { width: mw, height: mh });
    }

    let raw = region.resize(FEATURE_SIDE, FEATURE_SIDE);
    let edges = resize_gray(wavelet_map, FEATURE_SIDE, FEATURE_SIDE);

    let mut values = Vec::with_capacity(FEATURE_DIM);
    values.extend(raw.data().iter().map(|&b| b as f32));
    values.extend(edges.as_raw().iter().map(|&b| b as f32));
    FeatureVector::new(values)
}

/// Wavelet extraction followed by [`assemble`].
pub fn region_features(region: &PixelGrid, config: &WaveletConfig) -> Result<FeatureVector, FeatureError> {
    let edges = wavelet::extract(region, config)?;
    assemble(region, &edges)
}
