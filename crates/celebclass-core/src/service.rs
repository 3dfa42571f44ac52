//! End-to-end classification: decode, detect, featurize, predict, label.

use crate::artifacts::ArtifactStore;
use crate::classifier::ClassifierError;
use crate::decoder::{self, DecodeError, ImageSource};
use crate::detector::FaceEyeDetector;
use crate::features;
use crate::labels::{LabelMap, UnknownClassError};
use crate::types::PixelGrid;
use crate::wavelet::WaveletConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClassifyError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    UnknownClass(#[from] UnknownClassError),
    #[error(transparent)]
    Classifier(#[from] ClassifierError),
    #[error("classifier returned {actual} probabilities for {expected} classes")]
    ProbabilityCount { expected: usize, actual: usize },
}

/// Prediction for one accepted face.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    /// Predicted class name.
    pub class: String,
    /// Per-class confidence in percent, two decimals, in class-index order.
    pub class_probability: Vec<f64>,
    /// The full name-to-index dictionary, for client-side lookups.
    pub class_dictionary: LabelMap,
}

/// Percent with two decimals.
fn to_percent(p: f64) -> f64 {
    (p * 100.0 * 100.0).round() / 100.0
}

pub struct ClassificationService {
    detector: FaceEyeDetector,
    artifacts: Arc<ArtifactStore>,
    wavelet: WaveletConfig,
}

impl ClassificationService {
    pub fn new(detector: FaceEyeDetector, artifacts: Arc<ArtifactStore>) -> Self {
        Self {
            detector,
            artifacts,
            wavelet: WaveletConfig::default(),
        }
    }

    pub fn with_wavelet(mut self, wavelet: WaveletConfig) -> Self {
        self.wavelet = wavelet;
        self
    }

    pub fn is_ready(&self) -> bool {
        self.artifacts.is_ready()
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    pub fn detector(&self) -> &FaceEyeDetector {
        &self.detector
    }

    /// Classify from an optional payload and an optional file path.
    pub fn classify_parts(
        &self,
        image_data: Option<&str>,
        file_path: Option<&Path>,
    ) -> Result<Vec<ClassificationResult>, ClassifyError> {
        let source = ImageSource::from_parts(image_data, file_path)?;
        self.classify(&source)
    }

    /// One result per accepted face, in detection order.
    pub fn classify(&self, source: &ImageSource) -> Result<Vec<ClassificationResult>, ClassifyError> {
        tracing::debug!(source = %source.preview(), "classify request");
        let grid = decoder::decode(source)?;
        self.classify_grid(&grid)
    }

    pub fn classify_grid(&self, grid: &PixelGrid) -> Result<Vec<ClassificationResult>, ClassifyError> {
        let (Some(labels), Some(classifier)) = (self.artifacts.labels(), self.artifacts.classifier()) else {
            tracing::error!("artifacts are not loaded; returning no results");
            return Ok(Vec::new());
        };

        let regions = self.detector.detect(grid);
        tracing::debug!(faces = regions.len(), width = grid.width(), height = grid.height(), "detection done");

        let mut results = Vec::with_capacity(regions.len());
        for region in &regions {
            let features = match features::region_features(&region.crop, &self.wavelet) {
                Ok(f) => f,
                Err(e) => {
                    tracing::warn!(rect = ?region.rect, error = %e, "skipping region");
                    continue;
                }
            };

            let prediction = classifier.predict(&features)?;
            if prediction.probabilities.len() != labels.len() {
                let err = ClassifyError::ProbabilityCount {
                    expected: labels.len(),
                    actual: prediction.probabilities.len(),
                };
                tracing::error!(error = %err, "classifier and label dictionary disagree");
                return Err(err);
            }

            let class = labels.name_of(prediction.class_index).map_err(|e| {
                tracing::error!(error = %e, "predicted class has no label");
                e
            })?;

            tracing::debug!(rect = ?region.rect, class, "face classified");
            results.push(ClassificationResult {
                class: class.to_string(),
                class_probability: prediction.probabilities.iter().map(|&p| to_percent(p)).collect(),
                class_dictionary: labels.clone(),
            });
        }

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{Classifier, Prediction};
    use crate::detector::{DetectorConfig, ObjectDetector, ScanParams};
    use crate::features::FeatureVector;
    use crate::types::Rect;
    use image::GrayImage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed(Vec<Rect>);

    impl ObjectDetector for Fixed {
        fn detect(&self, _image: &GrayImage, _params: &ScanParams) -> Vec<Rect> {
            self.0.clone()
        }
    }

    struct Canned {
        probabilities: Vec<f64>,
        class_index: usize,
        calls: AtomicUsize,
    }

    impl Canned {
        fn new(class_index: usize, probabilities: Vec<f64>) -> Arc<Self> {
            Arc::new(Self {
                probabilities,
                class_index,
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl Classifier for Canned {
        fn predict(&self, _features: &FeatureVector) -> Result<Prediction, ClassifierError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Prediction {
                class_index: self.class_index,
                probabilities: self.probabilities.clone(),
            })
        }
    }

    fn service(faces: Vec<Rect>, classifier: Option<Arc<Canned>>) -> ClassificationService {
        let detector = FaceEyeDetector::new(
            Fixed(faces),
            Fixed(vec![Rect::new(1, 1, 4, 4), Rect::new(8, 1, 4, 4)]),
            DetectorConfig::default(),
        );
        let labels = LabelMap::from_entries([("messi", 0), ("federer", 1)]).unwrap();
        let classifier = classifier.map(|c| c as Arc<dyn Classifier>);
        ClassificationService::new(detector, Arc::new(ArtifactStore::new(Some(labels), classifier)))
    }

    #[test]
    fn test_percent_rounding() {
        assert_eq!(to_percent(0.9012), 90.12);
        assert_eq!(to_percent(0.0988), 9.88);
        assert_eq!(to_percent(1.0), 100.0);
        assert_eq!(to_percent(0.123456), 12.35);
    }

    #[test]
    fn test_one_result_per_face() {
        let canned = Canned::new(0, vec![0.9012, 0.0988]);
        let svc = service(vec![Rect::new(0, 0, 20, 20), Rect::new(30, 30, 20, 20)], Some(canned.clone()));
        let results = svc.classify_grid(&PixelGrid::filled(64, 64, [50, 60, 70])).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(canned.calls.load(Ordering::SeqCst), 2);
        assert_eq!(results[0].class, "messi");
        assert_eq!(results[0].class_probability, vec![90.12, 9.88]);
        assert_eq!(results[0].class_dictionary.index_of("federer"), Some(1));
    }

    #[test]
    fn test_not_ready_returns_empty() {
        let svc = service(vec![Rect::new(0, 0, 20, 20)], None);
        assert!(!svc.is_ready());
        assert!(svc.classify_grid(&PixelGrid::filled(64, 64, [0, 0, 0])).unwrap().is_empty());
    }

    #[test]
    fn test_no_faces_is_empty() {
        let svc = service(vec![], Some(Canned::new(0, vec![0.5, 0.5])));
        assert!(svc.classify_grid(&PixelGrid::filled(64, 64, [0, 0, 0])).unwrap().is_empty());
    }

    #[test]
    fn test_probability_count_mismatch() {
        let svc = service(vec![Rect::new(0, 0, 20, 20)], Some(Canned::new(0, vec![0.2, 0.3, 0.5])));
        let err = svc.classify_grid(&PixelGrid::filled(64, 64, [0, 0, 0])).unwrap_err();
        assert!(matches!(err, ClassifyError::ProbabilityCount { expected: 2, actual: 3 }));
    }

    #[test]
    fn test_unknown_class_is_fatal() {
        let svc = service(vec![Rect::new(0, 0, 20, 20)], Some(Canned::new(7, vec![0.5, 0.5])));
        let err = svc.classify_grid(&PixelGrid::filled(64, 64, [0, 0, 0])).unwrap_err();
        assert!(matches!(err, ClassifyError::UnknownClass(UnknownClassError { index: 7, .. })));
    }

    #[test]
    fn test_decode_error_propagates() {
        let svc = service(vec![Rect::new(0, 0, 20, 20)], Some(Canned::new(0, vec![0.5, 0.5])));
        let err = svc.classify_parts(Some("data:image/png;base64,%%%"), None).unwrap_err();
        assert!(matches!(err, ClassifyError::Decode(DecodeError::Base64(_))));
        let err = svc.classify_parts(None, None).unwrap_err();
        assert!(matches!(err, ClassifyError::Decode(DecodeError::EmptySource)));
    }

    #[test]
    fn test_result_json_shape() {
        let result = ClassificationResult {
            class: "messi".into(),
            class_probability: vec![90.12, 9.88],
            class_dictionary: LabelMap::from_entries([("messi", 0), ("federer", 1)]).unwrap(),
        };
        assert_eq!(
            serde_json::to_string(&result).unwrap(),
            r#"{"class":"messi","class_probability":[90.12,9.88],"class_dictionary":{"messi":0,"federer":1}}"#
        );
    }
}
