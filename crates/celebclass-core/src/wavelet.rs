//! Multi-level 2D discrete wavelet transform and the edge map built from it.
//!
//! Boundaries use half-sample symmetric extension. A signal of length `n`
//! decomposes into `floor((n + F - 1) / 2)` coefficients per band for a filter
//! of length `F`, and `m` coefficients reconstruct `2m - F + 2` samples.

use crate::features::FeatureError;
use crate::types::{ChannelOrder, PixelGrid};
use image::GrayImage;
use ndarray::{Array1, Array2, ArrayView1, Axis, Zip};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

// Decomposition low-pass filters. The other three filters are derived from these.
const DB1_DEC_LO: [f64; 2] = [std::f64::consts::FRAC_1_SQRT_2, std::f64::consts::FRAC_1_SQRT_2];
const DB2_DEC_LO: [f64; 4] = [
    -0.12940952255092145,
    0.22414386804185735,
    0.836516303737469,
    0.48296291314469025,
];
const DB3_DEC_LO: [f64; 6] = [
    0.03522629188570953,
    -0.08544127388202666,
    -0.13501102001025458,
    0.45987750211849154,
    0.8068915093110925,
    0.33267055295008263,
];
const DB4_DEC_LO: [f64; 8] = [
    -0.010597401785069032,
    0.0328830116668852,
    0.030841381835560764,
    -0.18703481171909309,
    -0.027983769416859854,
    0.6308807679298589,
    0.7148465705529157,
    0.2303778133088965,
];

pub const DEFAULT_LEVEL: usize = 5;

/// Orthogonal wavelet families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum WaveletFamily {
    /// Haar, also known as Daubechies-1.
    #[default]
    Haar,
    Db2,
    Db3,
    Db4,
}

impl WaveletFamily {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Haar => "db1",
            Self::Db2 => "db2",
            Self::Db3 => "db3",
            Self::Db4 => "db4",
        }
    }

    fn dec_lo(&self) -> &'static [f64] {
        match self {
            Self::Haar => &DB1_DEC_LO,
            Self::Db2 => &DB2_DEC_LO,
            Self::Db3 => &DB3_DEC_LO,
            Self::Db4 => &DB4_DEC_LO,
        }
    }

    pub fn filter_bank(&self) -> FilterBank {
        FilterBank::from_dec_lo(self.dec_lo())
    }
}

impl FromStr for WaveletFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "haar" | "db1" => Ok(Self::Haar),
            "db2" => Ok(Self::Db2),
            "db3" => Ok(Self::Db3),
            "db4" => Ok(Self::Db4),
            other => Err(format!("unknown wavelet family {other:?} (expected haar, db1..db4)")),
        }
    }
}

impl TryFrom<String> for WaveletFamily {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<WaveletFamily> for String {
    fn from(family: WaveletFamily) -> Self {
        family.name().to_string()
    }
}

impl std::fmt::Display for WaveletFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Analysis and synthesis filters of an orthogonal wavelet.
#[derive(Debug, Clone)]
pub struct FilterBank {
    dec_lo: Vec<f32>,
    dec_hi: Vec<f32>,
    rec_lo: Vec<f32>,
    rec_hi: Vec<f32>,
}

impl FilterBank {
    fn from_dec_lo(dec_lo: &[f64]) -> Self {
        let rec_lo: Vec<f64> = dec_lo.iter().rev().copied().collect();
        let dec_hi: Vec<f64> = rec_lo
            .iter()
            .enumerate()
            .map(|(k, &c)| if k % 2 == 0 { -c } else { c })
            .collect();
        let rec_hi: Vec<f64> = dec_hi.iter().rev().copied().collect();

        let to_f32 = |v: &[f64]| v.iter().map(|&c| c as f32).collect::<Vec<f32>>();
        Self {
            dec_lo: to_f32(dec_lo),
            dec_hi: to_f32(&dec_hi),
            rec_lo: to_f32(&rec_lo),
            rec_hi: to_f32(&rec_hi),
        }
    }

    pub fn len(&self) -> usize {
        self.dec_lo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dec_lo.is_empty()
    }

    /// Deepest level at which the coarsest band still spans a full filter.
    pub fn max_level(&self, data_len: usize) -> usize {
        let f = self.len();
        if data_len < f || f < 2 {
            return 0;
        }
        ((data_len as f64 / (f - 1) as f64).log2().floor()) as usize
    }
}

/// Index into a length-`n` signal under half-sample symmetric extension.
fn symmetric_index(i: isize, n: usize) -> usize {
    let period = 2 * n as isize;
    let m = i.rem_euclid(period) as usize;
    if m < n {
        m
    } else {
        2 * n - 1 - m
    }
}

/// Single-level 1D analysis: (approximation, detail).
pub fn dwt(signal: ArrayView1<'_, f32>, bank: &FilterBank) -> (Vec<f32>, Vec<f32>) {
    let n = signal.len();
    if n == 0 {
        return (Vec::new(), Vec::new());
    }
    let f = bank.len();
    let out_len = (n + f - 1) / 2;
    let mut approx = Vec::with_capacity(out_len);
    let mut detail = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let center = 2 * i as isize + 1;
        let (mut a, mut d) = (0.0f32, 0.0f32);
        for j in 0..f {
            let x = signal[symmetric_index(center - j as isize, n)];
            a += bank.dec_lo[j] * x;
            d += bank.dec_hi[j] * x;
        }
        approx.push(a);
        detail.push(d);
    }

    (approx, detail)
}

/// Single-level 1D synthesis from equally long bands.
pub fn idwt(approx: ArrayView1<'_, f32>, detail: ArrayView1<'_, f32>, bank: &FilterBank) -> Vec<f32> {
    let m = approx.len();
    let f = bank.len();
    let full_len = 2 * (m.max(1) - 1) + f;
    let mut full = vec![0.0f32; full_len];

    for k in 0..m {
        let (a, d) = (approx[k], detail[k]);
        for j in 0..f {
            full[2 * k + j] += bank.rec_lo[j] * a + bank.rec_hi[j] * d;
        }
    }

    // Keep the part every coefficient pair contributes to fully.
    let start = f - 2;
    let valid = (2 * m + 2).saturating_sub(f);
    full[start..start + valid].to_vec()
}

fn dwt_axis(data: &Array2<f32>, axis: Axis, bank: &FilterBank) -> (Array2<f32>, Array2<f32>) {
    let n = data.len_of(axis);
    let out_len = (n + bank.len() - 1) / 2;
    let mut shape = [data.nrows(), data.ncols()];
    shape[axis.index()] = out_len;

    let mut lo = Array2::<f32>::zeros(shape);
    let mut hi = Array2::<f32>::zeros(shape);
    Zip::from(data.lanes(axis))
        .and(lo.lanes_mut(axis))
        .and(hi.lanes_mut(axis))
        .for_each(|src, mut lo_lane, mut hi_lane| {
            let (a, d) = dwt(src, bank);
            lo_lane.assign(&Array1::from(a));
            hi_lane.assign(&Array1::from(d));
        });
    (lo, hi)
}

fn idwt_axis(lo: &Array2<f32>, hi: &Array2<f32>, axis: Axis, bank: &FilterBank) -> Array2<f32> {
    let m = lo.len_of(axis);
    let out_len = (2 * m + 2).saturating_sub(bank.len());
    let mut shape = [lo.nrows(), lo.ncols()];
    shape[axis.index()] = out_len;

    let mut out = Array2::<f32>::zeros(shape);
    Zip::from(out.lanes_mut(axis))
        .and(lo.lanes(axis))
        .and(hi.lanes(axis))
        .for_each(|mut dst, a, d| {
            dst.assign(&Array1::from(idwt(a, d, bank)));
        });
    out
}

/// Detail bands of one decomposition level.
#[derive(Debug, Clone)]
pub struct DetailBands {
    /// Low-pass across columns, high-pass down rows.
    pub horizontal: Array2<f32>,
    /// High-pass across columns, low-pass down rows.
    pub vertical: Array2<f32>,
    pub diagonal: Array2<f32>,
}

impl DetailBands {
    fn dim(&self) -> (usize, usize) {
        self.horizontal.dim()
    }
}

/// A multi-level decomposition: the coarsest approximation plus detail bands,
/// coarsest level first.
#[derive(Debug, Clone)]
pub struct Decomposition {
    pub approx: Array2<f32>,
    pub details: Vec<DetailBands>,
}

/// Single-level 2D analysis.
pub fn dwt2(data: &Array2<f32>, bank: &FilterBank) -> (Array2<f32>, DetailBands) {
    let (lo, hi) = dwt_axis(data, Axis(1), bank);
    let (ll, lh) = dwt_axis(&lo, Axis(0), bank);
    let (hl, hh) = dwt_axis(&hi, Axis(0), bank);
    (
        ll,
        DetailBands {
            horizontal: lh,
            vertical: hl,
            diagonal: hh,
        },
    )
}

/// Single-level 2D synthesis.
pub fn idwt2(approx: &Array2<f32>, details: &DetailBands, bank: &FilterBank) -> Array2<f32> {
    let lo = idwt_axis(approx, &details.horizontal, Axis(0), bank);
    let hi = idwt_axis(&details.vertical, &details.diagonal, Axis(0), bank);
    idwt_axis(&lo, &hi, Axis(1), bank)
}

/// `level`-deep 2D decomposition.
pub fn wavedec2(data: &Array2<f32>, family: WaveletFamily, level: usize) -> Decomposition {
    let bank = family.filter_bank();
    let max_level = bank.max_level(data.nrows().min(data.ncols()));
    if level > max_level {
        tracing::debug!(
            level,
            max_level,
            shape = ?data.dim(),
            "decomposition deeper than the data supports; boundary effects dominate"
        );
    }

    let mut approx = data.clone();
    let mut details = Vec::with_capacity(level);
    for _ in 0..level {
        let (a, d) = dwt2(&approx, &bank);
        details.push(d);
        approx = a;
    }
    details.reverse();

    Decomposition { approx, details }
}

/// Inverse of [`wavedec2`]. A reconstructed approximation one sample larger
/// than the next detail level is cropped to fit.
pub fn waverec2(decomposition: &Decomposition, family: WaveletFamily) -> Array2<f32> {
    let bank = family.filter_bank();
    let mut approx = decomposition.approx.clone();
    for bands in &decomposition.details {
        let (rows, cols) = bands.dim();
        if approx.dim() != (rows, cols) {
            approx = approx
                .slice(ndarray::s![..rows.min(approx.nrows()), ..cols.min(approx.ncols())])
                .to_owned();
        }
        approx = idwt2(&approx, bands, &bank);
    }
    approx
}

/// How reconstructed values (already scaled by 255) become bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quantization {
    /// Truncate toward zero, then wrap modulo 256: -127.5 becomes 129.
    /// This is what the trained classifiers saw.
    #[default]
    Wrap,
    /// Clamp to `0..=255`.
    Saturate,
}

impl Quantization {
    pub fn to_byte(self, v: f32) -> u8 {
        match self {
            Quantization::Wrap => v as i64 as u8,
            Quantization::Saturate => v as u8,
        }
    }
}

/// Wavelet edge-map settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaveletConfig {
    pub family: WaveletFamily,
    pub level: usize,
    /// How region triplets are read when collapsing to intensity. The reference
    /// classifiers were trained on BGR crops read as RGB, hence the default.
    pub channel_order: ChannelOrder,
    pub quantization: Quantization,
}

impl Default for WaveletConfig {
    fn default() -> Self {
        Self {
            family: WaveletFamily::Haar,
            level: DEFAULT_LEVEL,
            channel_order: ChannelOrder::Rgb,
            quantization: Quantization::Wrap,
        }
    }
}

/// Build the edge/texture map of a region.
///
/// The intensity image is scaled to `[0, 1]`, decomposed, stripped of its
/// coarse approximation, reconstructed, cropped to the region size and scaled
/// back to 8 bits with `config.quantization`. Since the map is zero-mean,
/// roughly half of it is negative before quantization.
pub fn extract(region: &PixelGrid, config: &WaveletConfig) -> Result<GrayImage, FeatureError> {
    if region.is_empty() {
        return Err(FeatureError::EmptyRegion {
            width: region.width(),
            height: region.height(),
        });
    }
    if config.level == 0 {
        return Err(FeatureError::InvalidLevel(config.level));
    }

    let gray = region.to_gray(config.channel_order);
    let (w, h) = (gray.width() as usize, gray.height() as usize);
    let data = Array2::from_shape_fn((h, w), |(y, x)| gray.as_raw()[y * w + x] as f32 / 255.0);

    let mut decomposition = wavedec2(&data, config.family, config.level);
    decomposition.approx.fill(0.0);
    let edges = waverec2(&decomposition, config.family);

    let pixels: Vec<u8> = edges
        .slice(ndarray::s![..h, ..w])
        .iter()
        .map(|&v| config.quantization.to_byte(v * 255.0))
        .collect();

    GrayImage::from_raw(w as u32, h as u32, pixels).ok_or(FeatureError::Shape {
        expected: w * h,
        actual: edges.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(rows: usize, cols: usize) -> Array2<f32> {
        Array2::from_shape_fn((rows, cols), |(y, x)| ((y * 7 + x * 3) % 11) as f32 / 10.0)
    }

    fn max_abs_diff(a: &Array2<f32>, b: &Array2<f32>) -> f32 {
        a.iter().zip(b.iter()).map(|(x, y)| (x - y).abs()).fold(0.0, f32::max)
    }

    #[test]
    fn test_filter_bank_haar() {
        let bank = WaveletFamily::Haar.filter_bank();
        let r = std::f32::consts::FRAC_1_SQRT_2;
        assert_eq!(bank.dec_lo, vec![r, r]);
        assert_eq!(bank.dec_hi, vec![-r, r]);
        assert_eq!(bank.rec_lo, vec![r, r]);
        assert_eq!(bank.rec_hi, vec![r, -r]);
    }

    #[test]
    fn test_filter_bank_db2_orthonormal() {
        let bank = WaveletFamily::Db2.filter_bank();
        let energy: f32 = bank.dec_lo.iter().map(|c| c * c).sum();
        let dc: f32 = bank.dec_lo.iter().sum();
        let hi_dc: f32 = bank.dec_hi.iter().sum();
        assert!((energy - 1.0).abs() < 1e-5);
        assert!((dc - std::f32::consts::SQRT_2).abs() < 1e-5);
        assert!(hi_dc.abs() < 1e-5);
    }

    #[test]
    fn test_haar_single_level_values() {
        let x = Array1::from(vec![4.0f32, 2.0, 5.0, 5.0]);
        let (a, d) = dwt(x.view(), &WaveletFamily::Haar.filter_bank());
        let s = std::f32::consts::SQRT_2;
        assert!((a[0] - 6.0 / s).abs() < 1e-5);
        assert!((a[1] - 10.0 / s).abs() < 1e-5);
        assert!((d[0] - 2.0 / s).abs() < 1e-5);
        assert!(d[1].abs() < 1e-5);
    }

    #[test]
    fn test_odd_length_extends_symmetrically() {
        let x = Array1::from(vec![1.0f32, 2.0, 3.0]);
        let bank = WaveletFamily::Haar.filter_bank();
        let (a, d) = dwt(x.view(), &bank);
        assert_eq!(a.len(), 2);
        // Last pair is (3, 3) under symmetric extension.
        assert!(d[1].abs() < 1e-6);
        let rec = idwt(Array1::from(a).view(), Array1::from(d).view(), &bank);
        assert_eq!(rec.len(), 4);
        assert!((rec[0] - 1.0).abs() < 1e-5 && (rec[2] - 3.0).abs() < 1e-5);
    }

    #[test]
    fn test_band_lengths() {
        let bank = WaveletFamily::Db2.filter_bank();
        let x = Array1::from(vec![0.5f32; 8]);
        let (a, d) = dwt(x.view(), &bank);
        assert_eq!((a.len(), d.len()), (5, 5));
        let rec = idwt(Array1::from(a).view(), Array1::from(d).view(), &bank);
        assert_eq!(rec.len(), 8);
    }

    #[test]
    fn test_perfect_reconstruction_every_family() {
        for family in [WaveletFamily::Haar, WaveletFamily::Db2, WaveletFamily::Db3, WaveletFamily::Db4] {
            for (rows, cols) in [(16, 16), (13, 21)] {
                let data = ramp(rows, cols);
                let dec = wavedec2(&data, family, 3);
                let rec = waverec2(&dec, family);
                let rec = rec.slice(ndarray::s![..rows, ..cols]).to_owned();
                let err = max_abs_diff(&rec, &data);
                assert!(err < 1e-4, "{family} {rows}x{cols}: max error {err}");
            }
        }
    }

    #[test]
    fn test_zeroed_approx_removes_mean() {
        // With Haar on a power-of-two square, dropping the full-depth
        // approximation subtracts the global mean.
        let data = ramp(8, 8);
        let mean = data.mean().unwrap();
        let mut dec = wavedec2(&data, WaveletFamily::Haar, 3);
        dec.approx.fill(0.0);
        let rec = waverec2(&dec, WaveletFamily::Haar);
        let expected = data.mapv(|v| v - mean);
        assert!(max_abs_diff(&rec, &expected) < 1e-5);
    }

    #[test]
    fn test_max_level() {
        let bank = WaveletFamily::Haar.filter_bank();
        assert_eq!(bank.max_level(32), 5);
        assert_eq!(bank.max_level(31), 4);
        assert_eq!(WaveletFamily::Db2.filter_bank().max_level(3), 0);
    }

    #[test]
    fn test_extract_same_size() {
        let region = PixelGrid::filled(37, 23, [10, 200, 90]);
        let map = extract(&region, &WaveletConfig::default()).unwrap();
        assert_eq!(map.dimensions(), (37, 23));
    }

    #[test]
    fn test_extract_flat_region_is_black() {
        let region = PixelGrid::filled(32, 32, [120, 120, 120]);
        let map = extract(&region, &WaveletConfig::default()).unwrap();
        assert!(map.pixels().all(|p| p[0] == 0));
    }

    #[test]
    fn test_extract_edges_light_up() {
        let mut data = Vec::new();
        for _y in 0..32 {
            for x in 0..32 {
                let v = if x < 16 { 0 } else { 255 };
                data.extend_from_slice(&[v, v, v]);
            }
        }
        let region = PixelGrid::from_bgr(data, 32, 32).unwrap();
        let map = extract(&region, &WaveletConfig::default()).unwrap();
        // Bright half sits half a unit above the mean, dark half below it,
        // and the negative side wraps around.
        assert_eq!(map.get_pixel(24, 10)[0], 127);
        assert_eq!(map.get_pixel(4, 10)[0], 129);

        let config = WaveletConfig {
            quantization: Quantization::Saturate,
            ..WaveletConfig::default()
        };
        let map = extract(&region, &config).unwrap();
        assert_eq!(map.get_pixel(24, 10)[0], 127);
        assert_eq!(map.get_pixel(4, 10)[0], 0);
    }

    #[test]
    fn test_quantization() {
        assert_eq!(Quantization::Wrap.to_byte(-127.5), 129);
        assert_eq!(Quantization::Wrap.to_byte(-0.4), 0);
        assert_eq!(Quantization::Wrap.to_byte(300.0), 44);
        assert_eq!(Quantization::Saturate.to_byte(-127.5), 0);
        assert_eq!(Quantization::Saturate.to_byte(300.0), 255);
        assert_eq!(Quantization::Saturate.to_byte(12.9), 12);
    }

    #[test]
    fn test_extract_rejects_empty() {
        let region = PixelGrid::filled(0, 10, [0, 0, 0]);
        assert!(matches!(
            extract(&region, &WaveletConfig::default()),
            Err(FeatureError::EmptyRegion { .. })
        ));
    }

    #[test]
    fn test_extract_rejects_level_zero() {
        let region = PixelGrid::filled(8, 8, [0, 0, 0]);
        let config = WaveletConfig { level: 0, ..WaveletConfig::default() };
        assert!(matches!(extract(&region, &config), Err(FeatureError::InvalidLevel(0))));
    }

    #[test]
    fn test_family_parsing() {
        assert_eq!("db1".parse::<WaveletFamily>().unwrap(), WaveletFamily::Haar);
        assert_eq!("HAAR".parse::<WaveletFamily>().unwrap(), WaveletFamily::Haar);
        assert_eq!("db4".parse::<WaveletFamily>().unwrap(), WaveletFamily::Db4);
        assert!("sym5".parse::<WaveletFamily>().is_err());
    }
}
