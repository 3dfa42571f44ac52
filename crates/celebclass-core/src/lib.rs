//! celebclass-core: celebrity face classification pipeline.
//!
//! Faces are found with OpenCV-format Haar cascades (a face is kept only when
//! two eyes are found inside it), described by a raw-pixel plus wavelet-edge
//! feature vector, and classified by a pre-trained model loaded from disk.

pub mod artifacts;
pub mod cascade;
pub mod classifier;
pub mod decoder;
pub mod detector;
pub mod features;
pub mod imgproc;
pub mod labels;
pub mod service;
pub mod types;
pub mod wavelet;

/// Where the label dictionary and classifier live unless configured otherwise.
pub const DEFAULT_ARTIFACT_DIR: &str = "artifacts";
/// Where the Haar cascade descriptors live unless configured otherwise.
pub const DEFAULT_CASCADE_DIR: &str = "opencv/haarcascades";

pub use artifacts::{ArtifactPaths, ArtifactStore, SharedArtifacts};
pub use classifier::{Classifier, Prediction};
pub use decoder::ImageSource;
pub use detector::{CascadePaths, DetectorConfig, FaceEyeDetector};
pub use features::FeatureVector;
pub use labels::LabelMap;
pub use service::{ClassificationResult, ClassificationService, ClassifyError};
pub use types::{PixelGrid, Rect};
pub use wavelet::{Quantization, WaveletConfig, WaveletFamily};
