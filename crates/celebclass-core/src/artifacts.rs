//! Loading and sharing the pre-trained artifacts: label dictionary and classifier.
//!
//! Loading never fails outright. A missing or broken artifact is logged and left
//! absent, and the store reports itself not ready.

use crate::classifier::{Classifier, ClassifierError, LinearClassifier, OnnxClassifier};
use crate::labels::{LabelMap, LabelMapError, UnknownClassError};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use thiserror::Error;

pub const LABELS_FILE: &str = "class_dictionary.json";
pub const MODEL_FILE: &str = "saved_model.onnx";

#[derive(Error, Debug)]
pub enum ArtifactLoadError {
    #[error("label dictionary: {0}")]
    Labels(#[from] LabelMapError),
    #[error("classifier: {0}")]
    Classifier(#[from] ClassifierError),
    #[error("unsupported classifier format: {0} (expected .onnx or .json)")]
    UnsupportedFormat(String),
    #[error("classifier knows {classifier} classes but the label dictionary has {labels}")]
    ClassCountMismatch { classifier: usize, labels: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub labels: PathBuf,
    pub classifier: PathBuf,
}

impl ArtifactPaths {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            labels: dir.join(LABELS_FILE),
            classifier: dir.join(MODEL_FILE),
        }
    }
}

/// Load a classifier, choosing the format by file extension.
pub fn load_classifier(path: &Path) -> Result<Arc<dyn Classifier>, ArtifactLoadError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("onnx") => Ok(Arc::new(OnnxClassifier::load(path)?)),
        Some("json") => Ok(Arc::new(LinearClassifier::load(path)?)),
        _ => Err(ArtifactLoadError::UnsupportedFormat(path.display().to_string())),
    }
}

/// Immutable label map and classifier, either of which may be absent.
pub struct ArtifactStore {
    labels: Option<LabelMap>,
    classifier: Option<Arc<dyn Classifier>>,
}

impl ArtifactStore {
    /// Assemble a store from already-loaded artifacts.
    ///
    /// A classifier whose class count disagrees with the labels is dropped.
    pub fn new(labels: Option<LabelMap>, classifier: Option<Arc<dyn Classifier>>) -> Self {
        let classifier = match (&labels, classifier) {
            (Some(labels), Some(classifier)) => match classifier.num_classes() {
                Some(n) if n != labels.len() => {
                    let err = ArtifactLoadError::ClassCountMismatch {
                        classifier: n,
                        labels: labels.len(),
                    };
                    tracing::error!(error = %err, "classifier rejected");
                    None
                }
                _ => Some(classifier),
            },
            (_, classifier) => classifier,
        };
        Self { labels, classifier }
    }

    /// A store with nothing loaded.
    pub fn empty() -> Self {
        Self {
            labels: None,
            classifier: None,
        }
    }

    pub fn load(paths: &ArtifactPaths) -> Self {
        tracing::debug!(labels = %paths.labels.display(), classifier = %paths.classifier.display(), "loading artifacts");

        let labels = match LabelMap::load(&paths.labels) {
            Ok(map) => Some(map),
            Err(e) => {
                let err = ArtifactLoadError::from(e);
                tracing::error!(path = %paths.labels.display(), error = %err, "failed to load label dictionary");
                None
            }
        };

        let classifier = match load_classifier(&paths.classifier) {
            Ok(c) => Some(c),
            Err(err) => {
                tracing::error!(path = %paths.classifier.display(), error = %err, "failed to load classifier");
                None
            }
        };

        let store = Self::new(labels, classifier);
        if store.is_ready() {
            tracing::info!(classes = store.labels.as_ref().map_or(0, LabelMap::len), "artifacts ready");
        }
        store
    }

    pub fn labels(&self) -> Option<&LabelMap> {
        self.labels.as_ref()
    }

    pub fn classifier(&self) -> Option<&dyn Classifier> {
        self.classifier.as_deref()
    }

    /// True when both the label map and the classifier are present.
    pub fn is_ready(&self) -> bool {
        self.labels.is_some() && self.classifier.is_some()
    }

    pub fn class_name_for(&self, index: usize) -> Result<&str, UnknownClassError> {
        match &self.labels {
            Some(labels) => labels.name_of(index),
            None => Err(UnknownClassError { index, classes: 0 }),
        }
    }
}

impl std::fmt::Debug for ArtifactStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactStore")
            .field("labels", &self.labels)
            .field("classifier", &self.classifier.as_ref().map(|_| "loaded"))
            .finish()
    }
}

/// Loads the store at most once, on first use.
#[derive(Debug)]
pub struct SharedArtifacts {
    paths: ArtifactPaths,
    store: OnceLock<Arc<ArtifactStore>>,
}

impl SharedArtifacts {
    pub fn new(paths: ArtifactPaths) -> Self {
        Self {
            paths,
            store: OnceLock::new(),
        }
    }

    /// The store, loading it if no caller has yet. Concurrent first calls
    /// block until the single load finishes.
    pub fn get(&self) -> Arc<ArtifactStore> {
        self.store
            .get_or_init(|| Arc::new(ArtifactStore::load(&self.paths)))
            .clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.store.get().is_some()
    }
}
