//! Boosted Haar cascade detector (Viola-Jones) loaded from OpenCV XML descriptors.
//!
//! Evaluation mirrors OpenCV's `CascadeClassifier::detectMultiScale`: the image
//! is scanned over a downscaled pyramid with a fixed-size window, every window is
//! variance-normalised, stages reject early, and the raw hits are clustered by
//! [`group_rectangles`].

use crate::detector::{ObjectDetector, ScanParams};
use crate::imgproc::resize_gray;
use crate::types::Rect;
use image::GrayImage;
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

/// Cluster tolerance used by `detectMultiScale` when grouping hits.
pub const GROUP_EPS: f64 = 0.2;

/// Subtracted from every stage threshold at load time, as OpenCV does.
pub const THRESHOLD_EPS: f32 = 1e-5;

#[derive(Error, Debug)]
pub enum CascadeError {
    #[error("cascade descriptor not found: {0}")]
    NotFound(String),
    #[error("cannot read cascade descriptor {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed cascade XML: {0}")]
    Xml(#[from] quick_xml::DeError),
    #[error("unsupported cascade: {0}")]
    Unsupported(String),
    #[error("invalid cascade: {0}")]
    Invalid(String),
}

// --- OpenCV storage layout ---

#[derive(Deserialize)]
struct StorageXml {
    cascade: CascadeXml,
}

#[derive(Deserialize)]
struct CascadeXml {
    #[serde(rename = "stageType")]
    stage_type: String,
    #[serde(rename = "featureType")]
    feature_type: String,
    height: u32,
    width: u32,
    stages: Items<StageXml>,
    features: Items<FeatureXml>,
}

/// OpenCV serializes sequences as repeated `<_>` children.
#[derive(Deserialize)]
struct Items<T> {
    #[serde(rename = "_", default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Deserialize)]
struct StageXml {
    #[serde(rename = "stageThreshold")]
    threshold: f32,
    #[serde(rename = "weakClassifiers")]
    weak_classifiers: Items<WeakXml>,
}

#[derive(Deserialize)]
struct WeakXml {
    #[serde(rename = "internalNodes")]
    internal_nodes: String,
    #[serde(rename = "leafValues")]
    leaf_values: String,
}

#[derive(Deserialize)]
struct FeatureXml {
    rects: Items<String>,
    #[serde(default)]
    tilted: Option<u8>,
}

// --- Evaluated model ---

/// Outcome of running the cascade on one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Accepted,
    /// Index of the stage that rejected the window.
    Rejected(usize),
}

#[derive(Debug, Clone)]
struct Stage {
    threshold: f32,
    trees: Vec<WeakTree>,
}

/// A boosted weak learner. Stumps are one-node trees.
#[derive(Debug, Clone)]
struct WeakTree {
    nodes: Vec<Node>,
    leaves: Vec<f32>,
}

/// Children `> 0` index another node; `<= 0` index leaf `-child`.
#[derive(Debug, Clone, Copy)]
struct Node {
    left: i32,
    right: i32,
    feature: usize,
    threshold: f32,
}

#[derive(Debug, Clone, Copy)]
struct WeightedRect {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    weight: f32,
}

#[derive(Debug, Clone)]
struct HaarFeature {
    rects: Vec<WeightedRect>,
}

/// A loaded Haar cascade. Immutable and safe to share across threads.
#[derive(Debug, Clone)]
pub struct HaarCascade {
    window: (u32, u32),
    stages: Vec<Stage>,
    features: Vec<HaarFeature>,
}

impl HaarCascade {
    /// Load an OpenCV cascade-classifier XML file.
    pub fn load(path: &Path) -> Result<Self, CascadeError> {
        if !path.exists() {
            return Err(CascadeError::NotFound(path.display().to_string()));
        }
        let xml = std::fs::read_to_string(path).map_err(|source| CascadeError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let cascade = Self::from_xml_str(&xml)?;

        tracing::info!(
            path = %path.display(),
            window = ?cascade.window,
            stages = cascade.stages.len(),
            features = cascade.features.len(),
            "loaded Haar cascade"
        );

        Ok(cascade)
    }

    /// Parse an OpenCV cascade-classifier XML document.
    pub fn from_xml_str(xml: &str) -> Result<Self, CascadeError> {
        let storage: StorageXml = quick_xml::de::from_str(xml)?;
        let raw = storage.cascade;

        if raw.stage_type.trim() != "BOOST" {
            return Err(CascadeError::Unsupported(format!("stage type {}", raw.stage_type.trim())));
        }
        if raw.feature_type.trim() != "HAAR" {
            return Err(CascadeError::Unsupported(format!("feature type {}", raw.feature_type.trim())));
        }
        if raw.width < 3 || raw.height < 3 {
            return Err(CascadeError::Invalid(format!(
                "window {}x{} is too small",
                raw.width, raw.height
            )));
        }

        let features = raw
            .features
            .items
            .iter()
            .enumerate()
            .map(|(i, f)| parse_feature(i, f, raw.width, raw.height))
            .collect::<Result<Vec<_>, _>>()?;

        let stages = raw
            .stages
            .items
            .iter()
            .enumerate()
            .map(|(si, stage)| {
                let trees = stage
                    .weak_classifiers
                    .items
                    .iter()
                    .map(|weak| parse_weak(si, weak, features.len()))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Stage {
                    threshold: stage.threshold - THRESHOLD_EPS,
                    trees,
                })
            })
            .collect::<Result<Vec<_>, CascadeError>>()?;

        if stages.is_empty() {
            return Err(CascadeError::Invalid("cascade has no stages".into()));
        }

        Ok(Self {
            window: (raw.width, raw.height),
            stages,
            features,
        })
    }

    /// Detection window size (width, height) at scale 1.
    pub fn window(&self) -> (u32, u32) {
        self.window
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Scan the image pyramid and return every accepted window, ungrouped.
    pub fn detect_raw(&self, image: &GrayImage, scale_factor: f32) -> Vec<Rect> {
        let mut hits = Vec::new();
        if scale_factor.is_nan() || scale_factor <= 1.0 {
            tracing::warn!(scale_factor, "scale factor must be greater than 1; skipping scan");
            return hits;
        }

        let (img_w, img_h) = image.dimensions();
        let (win_w, win_h) = self.window;
        let mut factor = 1.0f64;

        loop {
            let scaled_win_w = (win_w as f64 * factor).round() as u32;
            let scaled_win_h = (win_h as f64 * factor).round() as u32;
            if scaled_win_w > img_w || scaled_win_h > img_h {
                break;
            }

            let scaled_w = (img_w as f64 / factor).round() as u32;
            let scaled_h = (img_h as f64 / factor).round() as u32;
            if scaled_w < win_w || scaled_h < win_h {
                break;
            }

            let integral = if factor == 1.0 {
                IntegralImages::new(image)
            } else {
                IntegralImages::new(&resize_gray(image, scaled_w, scaled_h))
            };

            let step: u32 = if factor > 2.0 { 1 } else { 2 };
            for y in (0..=scaled_h - win_h).step_by(step as usize) {
                let mut x = 0;
                while x <= scaled_w - win_w {
                    match self.run_at(&integral, x, y) {
                        Verdict::Accepted => hits.push(Rect::new(
                            (x as f64 * factor).round() as u32,
                            (y as f64 * factor).round() as u32,
                            scaled_win_w,
                            scaled_win_h,
                        )),
                        // A window failing the first stage skips its neighbour too.
                        Verdict::Rejected(0) => x += step,
                        Verdict::Rejected(_) => {}
                    }
                    x += step;
                }
            }

            factor *= scale_factor as f64;
        }

        hits
    }

    /// Scan and group, as `detectMultiScale(image, scale_factor, min_neighbors)`.
    pub fn detect_multi_scale(&self, image: &GrayImage, params: &ScanParams) -> Vec<Rect> {
        let raw = self.detect_raw(image, params.scale_factor);
        let raw_count = raw.len();
        let grouped = group_rectangles(raw, params.min_neighbors, GROUP_EPS);
        tracing::trace!(raw = raw_count, grouped = grouped.len(), "cascade scan");
        grouped
    }

    /// Run every stage on the window whose top-left corner is `(x, y)`.
    fn run_at(&self, integral: &IntegralImages, x: u32, y: u32) -> Verdict {
        let (win_w, win_h) = self.window;
        let norm = integral.variance_norm_factor(x + 1, y + 1, win_w - 2, win_h - 2);

        for (index, stage) in self.stages.iter().enumerate() {
            let mut sum = 0.0f32;
            for tree in &stage.trees {
                sum += tree.evaluate(|f| self.features[f].value(integral, x, y) * norm);
            }
            if sum < stage.threshold {
                return Verdict::Rejected(index);
            }
        }
        Verdict::Accepted
    }
}

impl ObjectDetector for HaarCascade {
    fn detect(&self, image: &GrayImage, params: &ScanParams) -> Vec<Rect> {
        self.detect_multi_scale(image, params)
    }
}

impl WeakTree {
    fn evaluate(&self, mut feature_value: impl FnMut(usize) -> f32) -> f32 {
        let mut idx = 0usize;
        loop {
            let node = self.nodes[idx];
            let next = if feature_value(node.feature) < node.threshold {
                node.left
            } else {
                node.right
            };
            if next <= 0 {
                return self.leaves[next.unsigned_abs() as usize];
            }
            idx = next as usize;
        }
    }
}

impl HaarFeature {
    fn value(&self, integral: &IntegralImages, ox: u32, oy: u32) -> f32 {
        self.rects
            .iter()
            .map(|r| integral.sum(ox + r.x, oy + r.y, r.width, r.height) as f32 * r.weight)
            .sum()
    }
}

/// Summed-area tables of the pixel values and their squares, with a zero
/// row and column at index 0.
struct IntegralImages {
    stride: usize,
    sum: Vec<u64>,
    sqsum: Vec<u64>,
}

impl IntegralImages {
    fn new(image: &GrayImage) -> Self {
        let (w, h) = (image.width() as usize, image.height() as usize);
        let stride = w + 1;
        let mut sum = vec![0u64; stride * (h + 1)];
        let mut sqsum = vec![0u64; stride * (h + 1)];
        let raw = image.as_raw();

        for y in 0..h {
            let mut row_sum = 0u64;
            let mut row_sq = 0u64;
            for x in 0..w {
                let p = raw[y * w + x] as u64;
                row_sum += p;
                row_sq += p * p;
                let idx = (y + 1) * stride + (x + 1);
                sum[idx] = sum[idx - stride] + row_sum;
                sqsum[idx] = sqsum[idx - stride] + row_sq;
            }
        }

        Self { stride, sum, sqsum }
    }

    fn area_sum(table: &[u64], stride: usize, x: u32, y: u32, w: u32, h: u32) -> u64 {
        let (x0, y0) = (x as usize, y as usize);
        let (x1, y1) = (x0 + w as usize, y0 + h as usize);
        (table[y1 * stride + x1] + table[y0 * stride + x0])
            - (table[y0 * stride + x1] + table[y1 * stride + x0])
    }

    fn sum(&self, x: u32, y: u32, w: u32, h: u32) -> u64 {
        Self::area_sum(&self.sum, self.stride, x, y, w, h)
    }

    /// `1 / sqrt(area * sum(p^2) - sum(p)^2)` over the given rectangle, or 1
    /// when the rectangle is flat.
    fn variance_norm_factor(&self, x: u32, y: u32, w: u32, h: u32) -> f32 {
        let area = w as f64 * h as f64;
        let s = self.sum(x, y, w, h) as f64;
        let sq = Self::area_sum(&self.sqsum, self.stride, x, y, w, h) as f64;
        let nf = area * sq - s * s;
        let nf = if nf > 0.0 { nf.sqrt() } else { 1.0 };
        (1.0 / nf) as f32
    }
}

fn parse_feature(index: usize, raw: &FeatureXml, win_w: u32, win_h: u32) -> Result<HaarFeature, CascadeError> {
    if raw.tilted.unwrap_or(0) != 0 {
        return Err(CascadeError::Unsupported(format!("feature {index} is tilted")));
    }
    if raw.rects.items.is_empty() || raw.rects.items.len() > 3 {
        return Err(CascadeError::Invalid(format!(
            "feature {index} has {} rectangles",
            raw.rects.items.len()
        )));
    }

    let rects = raw
        .rects
        .items
        .iter()
        .map(|text| {
            let tokens: Vec<&str> = text.split_whitespace().collect();
            let bad = || CascadeError::Invalid(format!("feature {index}: bad rectangle {text:?}"));
            if tokens.len() != 5 {
                return Err(bad());
            }
            let coord = |i: usize| tokens[i].parse::<u32>().map_err(|_| bad());
            let rect = WeightedRect {
                x: coord(0)?,
                y: coord(1)?,
                width: coord(2)?,
                height: coord(3)?,
                weight: tokens[4].parse::<f32>().map_err(|_| bad())?,
            };
            if rect.x + rect.width > win_w || rect.y + rect.height > win_h {
                return Err(CascadeError::Invalid(format!(
                    "feature {index}: rectangle {text:?} leaves the {win_w}x{win_h} window"
                )));
            }
            Ok(rect)
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(HaarFeature { rects })
}

fn parse_weak(stage: usize, raw: &WeakXml, feature_count: usize) -> Result<WeakTree, CascadeError> {
    let bad = |what: &str| CascadeError::Invalid(format!("stage {stage}: {what}"));

    let tokens: Vec<&str> = raw.internal_nodes.split_whitespace().collect();
    if tokens.is_empty() || tokens.len() % 4 != 0 {
        return Err(bad("internal nodes must come in groups of four"));
    }
    let leaves = raw
        .leaf_values
        .split_whitespace()
        .map(|t| t.parse::<f32>().map_err(|_| bad("bad leaf value")))
        .collect::<Result<Vec<_>, _>>()?;

    let node_count = tokens.len() / 4;
    let mut nodes = Vec::with_capacity(node_count);
    for (i, chunk) in tokens.chunks_exact(4).enumerate() {
        let node = Node {
            left: chunk[0].parse().map_err(|_| bad("bad node child"))?,
            right: chunk[1].parse().map_err(|_| bad("bad node child"))?,
            feature: chunk[2].parse().map_err(|_| bad("bad feature index"))?,
            threshold: chunk[3].parse().map_err(|_| bad("bad node threshold"))?,
        };
        if node.feature >= feature_count {
            return Err(bad("feature index out of range"));
        }
        for child in [node.left, node.right] {
            // Internal children must point forward so evaluation terminates.
            let ok = if child > 0 {
                (child as usize) > i && (child as usize) < node_count
            } else {
                (child.unsigned_abs() as usize) < leaves.len()
            };
            if !ok {
                return Err(bad("node child out of range"));
            }
        }
        nodes.push(node);
    }

    Ok(WeakTree { nodes, leaves })
}

/// Cluster overlapping detections the way OpenCV's `groupRectangles` does.
///
/// Rectangles are partitioned by the similarity predicate, each cluster is
/// averaged, clusters with `min_neighbors` or fewer members are dropped, and a
/// cluster lying inside a stronger one is dropped too. `min_neighbors == 0`
/// returns the input unchanged.
pub fn group_rectangles(rects: Vec<Rect>, min_neighbors: u32, eps: f64) -> Vec<Rect> {
    if min_neighbors == 0 || rects.is_empty() {
        return rects;
    }

    let (labels, class_count) = partition(&rects, eps);

    let mut sums = vec![[0u64; 4]; class_count];
    let mut counts = vec![0u32; class_count];
    for (rect, &label) in rects.iter().zip(&labels) {
        let acc = &mut sums[label];
        acc[0] += rect.x as u64;
        acc[1] += rect.y as u64;
        acc[2] += rect.width as u64;
        acc[3] += rect.height as u64;
        counts[label] += 1;
    }

    let averaged: Vec<Rect> = sums
        .iter()
        .zip(&counts)
        .map(|(acc, &n)| {
            let s = 1.0 / n as f64;
            Rect::new(
                (acc[0] as f64 * s).round() as u32,
                (acc[1] as f64 * s).round() as u32,
                (acc[2] as f64 * s).round() as u32,
                (acc[3] as f64 * s).round() as u32,
            )
        })
        .collect();

    let mut grouped = Vec::new();
    for (i, r1) in averaged.iter().enumerate() {
        let n1 = counts[i];
        if n1 <= min_neighbors {
            continue;
        }

        let nested = averaged.iter().enumerate().any(|(j, r2)| {
            let n2 = counts[j];
            if j == i || n2 <= min_neighbors {
                return false;
            }
            let dx = (r2.width as f64 * eps).round() as i64;
            let dy = (r2.height as f64 * eps).round() as i64;
            let (x1, y1) = (r1.x as i64, r1.y as i64);
            let (x2, y2) = (r2.x as i64, r2.y as i64);
            x1 >= x2 - dx
                && y1 >= y2 - dy
                && x1 + r1.width as i64 <= x2 + r2.width as i64 + dx
                && y1 + r1.height as i64 <= y2 + r2.height as i64 + dy
                && (n2 > n1.max(3) || n1 < 3)
        });

        if !nested {
            grouped.push(*r1);
        }
    }

    grouped
}

fn similar(a: &Rect, b: &Rect, eps: f64) -> bool {
    let delta = eps * (a.width.min(b.width) as f64 + a.height.min(b.height) as f64) * 0.5;
    let close = |p: u32, q: u32| (p as f64 - q as f64).abs() <= delta;
    close(a.x, b.x) && close(a.y, b.y) && close(a.right(), b.right()) && close(a.bottom(), b.bottom())
}

/// Equivalence classes under the transitive closure of [`similar`].
/// Class ids are assigned in order of first appearance.
fn partition(rects: &[Rect], eps: f64) -> (Vec<usize>, usize) {
    let mut parent: Vec<usize> = (0..rects.len()).collect();

    fn find(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    for i in 0..rects.len() {
        for j in 0..i {
            if similar(&rects[i], &rects[j], eps) {
                let (ri, rj) = (find(&mut parent, i), find(&mut parent, j));
                if ri != rj {
                    parent[ri] = rj;
                }
            }
        }
    }

    let mut class_of_root = vec![usize::MAX; rects.len()];
    let mut labels = Vec::with_capacity(rects.len());
    let mut classes = 0;
    for i in 0..rects.len() {
        let root = find(&mut parent, i);
        if class_of_root[root] == usize::MAX {
            class_of_root[root] = classes;
            classes += 1;
        }
        labels.push(class_of_root[root]);
    }

    (labels, classes)
}
