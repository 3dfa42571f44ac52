use celebclass_core::artifacts::{ArtifactPaths, LABELS_FILE, MODEL_FILE};
use celebclass_core::detector::{CascadePaths, DetectorConfig, ScanParams};
use celebclass_core::types::ChannelOrder;
use celebclass_core::wavelet::{Quantization, WaveletConfig, WaveletFamily, DEFAULT_LEVEL};
use celebclass_core::{DEFAULT_ARTIFACT_DIR, DEFAULT_CASCADE_DIR};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// Environment variable naming an optional TOML config file.
pub const CONFIG_ENV: &str = "CELEBCLASS_CONFIG";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed config file: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Daemon configuration: defaults, then an optional TOML file, then
/// `CELEBCLASS_*` environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listen address (default: 127.0.0.1:5000).
    pub bind_addr: String,
    /// Directory holding the label dictionary and classifier.
    pub artifact_dir: PathBuf,
    /// Overrides `artifact_dir/class_dictionary.json`.
    pub labels_path: Option<PathBuf>,
    /// Overrides `artifact_dir/saved_model.onnx`.
    pub model_path: Option<PathBuf>,
    /// Directory holding the two Haar cascade descriptors.
    pub cascade_dir: PathBuf,
    pub face_scale_factor: f32,
    pub face_min_neighbors: u32,
    pub eye_scale_factor: f32,
    pub eye_min_neighbors: u32,
    pub min_eyes: usize,
    pub wavelet: WaveletFamily,
    pub wavelet_level: usize,
    pub wavelet_channel_order: ChannelOrder,
    pub wavelet_quantization: Quantization,
}

impl Default for Config {
    fn default() -> Self {
        let detector = DetectorConfig::default();
        let wavelet = WaveletConfig::default();
        Self {
            bind_addr: "127.0.0.1:5000".to_string(),
            artifact_dir: PathBuf::from(DEFAULT_ARTIFACT_DIR),
            labels_path: None,
            model_path: None,
            cascade_dir: PathBuf::from(DEFAULT_CASCADE_DIR),
            face_scale_factor: detector.face.scale_factor,
            face_min_neighbors: detector.face.min_neighbors,
            eye_scale_factor: detector.eyes.scale_factor,
            eye_min_neighbors: detector.eyes.min_neighbors,
            min_eyes: detector.min_eyes,
            wavelet: wavelet.family,
            wavelet_level: DEFAULT_LEVEL,
            wavelet_channel_order: wavelet.channel_order,
            wavelet_quantization: wavelet.quantization,
        }
    }
}

impl Config {
    /// Load from `CELEBCLASS_CONFIG` (if set) and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_ENV) {
            Ok(path) if !path.is_empty() => {
                let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
                    path: path.clone(),
                    source,
                })?;
                tracing::info!(path = %path, "reading config file");
                Self::from_toml_str(&text)?
            }
            _ => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would let the daemon start but never classify.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &'static str, reason: &str| -> Result<(), ConfigError> {
            Err(ConfigError::Invalid {
                key,
                reason: reason.to_string(),
            })
        };
        for (key, factor) in [
            ("face_scale_factor", self.face_scale_factor),
            ("eye_scale_factor", self.eye_scale_factor),
        ] {
            if factor.is_nan() || factor <= 1.0 {
                return invalid(key, &format!("{factor} must be greater than 1"));
            }
        }
        if self.min_eyes == 0 {
            return invalid("min_eyes", "must be at least 1");
        }
        if self.wavelet_level == 0 {
            return invalid("wavelet_level", "must be at least 1");
        }
        Ok(())
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Overlay `CELEBCLASS_*` variables. Unparseable values are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("CELEBCLASS_BIND_ADDR") {
            self.bind_addr = v;
        }
        if let Some(v) = lookup("CELEBCLASS_ARTIFACT_DIR") {
            self.artifact_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("CELEBCLASS_LABELS_PATH") {
            self.labels_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("CELEBCLASS_MODEL_PATH") {
            self.model_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("CELEBCLASS_CASCADE_DIR") {
            self.cascade_dir = PathBuf::from(v);
        }
        env_parsed(&lookup, "CELEBCLASS_FACE_SCALE_FACTOR", &mut self.face_scale_factor);
        env_parsed(&lookup, "CELEBCLASS_FACE_MIN_NEIGHBORS", &mut self.face_min_neighbors);
        env_parsed(&lookup, "CELEBCLASS_EYE_SCALE_FACTOR", &mut self.eye_scale_factor);
        env_parsed(&lookup, "CELEBCLASS_EYE_MIN_NEIGHBORS", &mut self.eye_min_neighbors);
        env_parsed(&lookup, "CELEBCLASS_MIN_EYES", &mut self.min_eyes);
        env_parsed(&lookup, "CELEBCLASS_WAVELET", &mut self.wavelet);
        env_parsed(&lookup, "CELEBCLASS_WAVELET_LEVEL", &mut self.wavelet_level);
    }

    pub fn artifact_paths(&self) -> ArtifactPaths {
        ArtifactPaths {
            labels: self
                .labels_path
                .clone()
                .unwrap_or_else(|| self.artifact_dir.join(LABELS_FILE)),
            classifier: self
                .model_path
                .clone()
                .unwrap_or_else(|| self.artifact_dir.join(MODEL_FILE)),
        }
    }

    pub fn cascade_paths(&self) -> CascadePaths {
        CascadePaths::in_dir(&self.cascade_dir)
    }

    pub fn detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            face: ScanParams::new(self.face_scale_factor, self.face_min_neighbors),
            eyes: ScanParams::new(self.eye_scale_factor, self.eye_min_neighbors),
            min_eyes: self.min_eyes,
        }
    }

    pub fn wavelet_config(&self) -> WaveletConfig {
        WaveletConfig {
            family: self.wavelet,
            level: self.wavelet_level,
            channel_order: self.wavelet_channel_order,
            quantization: self.wavelet_quantization,
        }
    }
}

fn env_parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(v) => *slot = v,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable environment value"),
    }
}
