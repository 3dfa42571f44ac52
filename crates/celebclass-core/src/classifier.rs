//! Pre-trained identity classifiers.
//!
//! Two artifact kinds are supported: ONNX graphs run through ONNX Runtime, and
//! exported linear models stored as JSON.

use crate::features::{FeatureVector, FEATURE_DIM};
use ndarray::{Array1, Array2, ArrayView2};
use ort::session::Session;
use ort::value::TensorRef;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Output names probability tensors go by in common ONNX exports.
const PROBABILITY_OUTPUTS: &[&str] = &["probabilities", "output_probability"];
const LABEL_OUTPUTS: &[&str] = &["label", "output_label"];

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("invalid model: {0}")]
    InvalidModel(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
    #[error("malformed model file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Outcome of one inference call.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub class_index: usize,
    /// One probability per class, in class-index order.
    pub probabilities: Vec<f64>,
}

impl Prediction {
    /// Pick the most probable class; ties go to the lowest index.
    ///
    /// Every value must be a finite number in `[0, 1]`, so raw decision
    /// scores or logits are refused rather than reported as probabilities.
    pub fn from_probabilities(probabilities: Vec<f64>) -> Result<Self, ClassifierError> {
        check_probabilities(&probabilities)?;
        let class_index = argmax(&probabilities)
            .ok_or_else(|| ClassifierError::InferenceFailed("classifier returned no probabilities".into()))?;
        Ok(Self {
            class_index,
            probabilities,
        })
    }
}

/// Slack for float32 round-off in exported probability tensors.
const PROBABILITY_TOLERANCE: f64 = 1e-6;

fn check_probabilities(values: &[f64]) -> Result<(), ClassifierError> {
    let range = -PROBABILITY_TOLERANCE..=1.0 + PROBABILITY_TOLERANCE;
    match values.iter().position(|p| !range.contains(p)) {
        Some(i) => Err(ClassifierError::InferenceFailed(format!(
            "output {i} is {}, not a probability",
            values[i]
        ))),
        None => Ok(()),
    }
}

fn argmax(values: &[f64]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f64)>, (i, &v)| match best {
            Some((_, b)) if b >= v => best,
            _ => Some((i, v)),
        })
        .map(|(i, _)| i)
}

/// A loaded, immutable classifier shared across requests.
pub trait Classifier: Send + Sync {
    /// Label index and per-class probabilities from a single inference.
    fn predict(&self, features: &FeatureVector) -> Result<Prediction, ClassifierError>;

    /// Number of classes, when the artifact declares it up front.
    fn num_classes(&self) -> Option<usize> {
        None
    }
}

/// ONNX classifier taking a `[1, 4096]` float tensor.
pub struct OnnxClassifier {
    session: Mutex<Session>,
    probability_output: usize,
    label_output: Option<usize>,
}

impl OnnxClassifier {
    pub fn load(model_path: &Path) -> Result<Self, ClassifierError> {
        if !model_path.exists() {
            return Err(ClassifierError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        let probability_output = find_output(&output_names, PROBABILITY_OUTPUTS)
            .or(match output_names.len() {
                0 => None,
                1 => Some(0),
                // Exporters emit (label, probabilities).
                _ => Some(1),
            })
            .ok_or_else(|| ClassifierError::InvalidModel("model has no outputs".into()))?;
        let label_output = find_output(&output_names, LABEL_OUTPUTS).filter(|&i| i != probability_output);

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?output_names,
            probability_output,
            "loaded ONNX classifier"
        );

        Ok(Self {
            session: Mutex::new(session),
            probability_output,
            label_output,
        })
    }
}

fn find_output(names: &[String], candidates: &[&str]) -> Option<usize> {
    names.iter().position(|n| candidates.contains(&n.as_str()))
}

impl Classifier for OnnxClassifier {
    fn predict(&self, features: &FeatureVector) -> Result<Prediction, ClassifierError> {
        let input = ArrayView2::from_shape((1, FEATURE_DIM), features.as_slice())
            .map_err(|e| ClassifierError::InferenceFailed(format!("input tensor: {e}")))?;

        let mut session = self.session.lock();
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input)?])?;

        let (_, raw) = outputs[self.probability_output]
            .try_extract_tensor::<f32>()
            .map_err(|e| ClassifierError::InferenceFailed(format!("probability extraction: {e}")))?;
        let probabilities: Vec<f64> = raw.iter().map(|&p| p as f64).collect();

        // Prefer the graph's own label when it exports one.
        let label = self
            .label_output
            .and_then(|i| outputs[i].try_extract_tensor::<i64>().ok())
            .and_then(|(_, labels)| labels.first().copied());

        match label {
            Some(index) if index >= 0 && (index as usize) < probabilities.len() => {
                check_probabilities(&probabilities)?;
                Ok(Prediction {
                    class_index: index as usize,
                    probabilities,
                })
            }
            _ => Prediction::from_probabilities(probabilities),
        }
    }
}

/// How decision scores become probabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbabilityMode {
    /// Multinomial: softmax over the scores.
    #[default]
    Softmax,
    /// One-vs-rest: per-class sigmoid, normalised to sum to one.
    OneVsRest,
}

#[derive(Debug, Deserialize)]
struct LinearModelFile {
    coefficients: Vec<Vec<f32>>,
    intercepts: Vec<f32>,
    #[serde(default)]
    probability: ProbabilityMode,
}

/// Linear model `scores = W x + b` over the feature vector.
///
/// A single coefficient row is a binary model: its score is the log-odds of
/// class 1.
#[derive(Debug, Clone)]
pub struct LinearClassifier {
    weights: Array2<f32>,
    intercepts: Array1<f32>,
    mode: ProbabilityMode,
}

impl LinearClassifier {
    pub fn new(weights: Array2<f32>, intercepts: Array1<f32>, mode: ProbabilityMode) -> Result<Self, ClassifierError> {
        let (rows, cols) = weights.dim();
        if rows == 0 {
            return Err(ClassifierError::InvalidModel("no coefficient rows".into()));
        }
        if cols != FEATURE_DIM {
            return Err(ClassifierError::InvalidModel(format!(
                "coefficient rows have {cols} columns, expected {FEATURE_DIM}"
            )));
        }
        if intercepts.len() != rows {
            return Err(ClassifierError::InvalidModel(format!(
                "{rows} coefficient rows but {} intercepts",
                intercepts.len()
            )));
        }
        Ok(Self {
            weights,
            intercepts,
            mode,
        })
    }

    pub fn from_json_str(json: &str) -> Result<Self, ClassifierError> {
        let file: LinearModelFile = serde_json::from_str(json)?;
        let rows = file.coefficients.len();
        if let Some(bad) = file.coefficients.iter().find(|r| r.len() != FEATURE_DIM) {
            return Err(ClassifierError::InvalidModel(format!(
                "coefficient row has {} values, expected {FEATURE_DIM}",
                bad.len()
            )));
        }
        let flat: Vec<f32> = file.coefficients.into_iter().flatten().collect();
        let weights = Array2::from_shape_vec((rows, FEATURE_DIM), flat)
            .map_err(|e| ClassifierError::InvalidModel(e.to_string()))?;
        Self::new(weights, Array1::from(file.intercepts), file.probability)
    }

    pub fn load(path: &Path) -> Result<Self, ClassifierError> {
        if !path.exists() {
            return Err(ClassifierError::ModelNotFound(path.display().to_string()));
        }
        let text = std::fs::read_to_string(path).map_err(|source| ClassifierError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let model = Self::from_json_str(&text)?;
        tracing::info!(
            path = %path.display(),
            classes = model.classes(),
            mode = ?model.mode,
            "loaded linear classifier"
        );
        Ok(model)
    }

    fn classes(&self) -> usize {
        match self.weights.nrows() {
            1 => 2,
            n => n,
        }
    }

    fn scores(&self, features: &FeatureVector) -> Vec<f64> {
        let x = ndarray::ArrayView1::from(features.as_slice());
        (self.weights.dot(&x) + &self.intercepts)
            .iter()
            .map(|&s| s as f64)
            .collect()
    }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

fn softmax(scores: &[f64]) -> Vec<f64> {
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exp: Vec<f64> = scores.iter().map(|s| (s - max).exp()).collect();
    let sum: f64 = exp.iter().sum();
    exp.into_iter().map(|e| e / sum).collect()
}

impl Classifier for LinearClassifier {
    fn predict(&self, features: &FeatureVector) -> Result<Prediction, ClassifierError> {
        let scores = self.scores(features);
        let probabilities = if let [score] = scores[..] {
            let p1 = sigmoid(score);
            vec![1.0 - p1, p1]
        } else {
            match self.mode {
                ProbabilityMode::Softmax => softmax(&scores),
                ProbabilityMode::OneVsRest => {
                    let raw: Vec<f64> = scores.iter().map(|&s| sigmoid(s)).collect();
                    let sum: f64 = raw.iter().sum();
                    if sum > 0.0 {
                        raw.into_iter().map(|p| p / sum).collect()
                    } else {
                        vec![1.0 / raw.len() as f64; raw.len()]
                    }
                }
            }
        };
        Prediction::from_probabilities(probabilities)
    }

    fn num_classes(&self) -> Option<usize> {
        Some(self.classes())
    }
}
