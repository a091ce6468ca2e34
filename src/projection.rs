//! Geometric correction of cross-track scanner imagery.
//!
//! A scanning radiometer samples at equal scan angles, so ground pixels grow
//! towards the edges of the swath. Correction resamples every line onto a grid
//! of equal ground distance across a swath of `swath` km at `resolution` km per
//! pixel, as seen from `altitude` km over a spherical Earth.
use ndarray::{Array2, ArrayView2, Zip};
use rayon::prelude::*;
use tracing::{debug, info, span, warn, Level};

use crate::product::{ImageProducts, ProjectionConfig};

pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Largest number of corrected columns a geometry may produce.
pub const MAX_OUTPUT_WIDTH: usize = 1 << 16;

/// Validated correction geometry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SwathGeometry {
    pub swath: f64,
    pub resolution: f64,
    pub altitude: f64,
}

impl SwathGeometry {
    /// `None` unless all parameters are present, finite, and positive, and the
    /// corrected width is at most [MAX_OUTPUT_WIDTH].
    #[must_use]
    pub fn from_config(cfg: &ProjectionConfig) -> Option<Self> {
        let valid = |v: Option<f64>| v.filter(|v| v.is_finite() && *v > 0.0);
        let geometry = Self {
            swath: valid(cfg.swath)?,
            resolution: valid(cfg.resolution)?,
            altitude: valid(cfg.altitude)?,
        };
        let columns = (geometry.swath / geometry.resolution).round();
        if columns > MAX_OUTPUT_WIDTH as f64 {
            warn!(?geometry, columns, "corrected width out of range");
            return None;
        }
        Some(geometry)
    }

    /// Number of corrected columns.
    #[must_use]
    pub fn output_width(&self) -> usize {
        (self.swath / self.resolution).round() as usize
    }

    fn half_swath_angle(&self) -> f64 {
        self.swath / 2.0 / EARTH_RADIUS_KM
    }

    /// Scan angle from nadir at which the ground point at central angle `theta`
    /// is seen.
    fn scan_angle(&self, theta: f64) -> f64 {
        let r = EARTH_RADIUS_KM;
        (r * theta.sin()).atan2(r + self.altitude - r * theta.cos())
    }

    /// Central angle of the ground point seen at scan angle `alpha`.
    fn ground_angle(&self, alpha: f64) -> f64 {
        let ratio = (EARTH_RADIUS_KM + self.altitude) / EARTH_RADIUS_KM;
        (ratio * alpha.sin()).clamp(-1.0, 1.0).asin() - alpha
    }
}

/// Column mapping between raw and corrected images.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrectionTable {
    /// Fractional raw column sampled by each corrected column.
    pub forward: Vec<f32>,
    /// Fractional corrected column of each raw column.
    pub reverse: Vec<f32>,
}

impl CorrectionTable {
    /// Mapping for a raw image `raw_width` pixels wide whose columns are shifted
    /// by `offset_x` and grouped into IFOVs `ifov_x` samples wide.
    #[must_use]
    pub fn compute(geometry: &SwathGeometry, raw_width: usize, offset_x: i32, ifov_x: u32) -> Self {
        let out_width = geometry.output_width();
        let raw = raw_width as f64;
        let edge = geometry.scan_angle(geometry.half_swath_angle());
        let half_swath = geometry.swath / 2.0;

        let forward = (0..out_width)
            .into_par_iter()
            .map(|j| {
                let s = (j as f64 + 0.5) * geometry.resolution - half_swath;
                let alpha = geometry.scan_angle(s / EARTH_RADIUS_KM);
                let mut u = (alpha / edge + 1.0) / 2.0 * raw - 0.5;
                u += f64::from(offset_x);
                if ifov_x > 1 {
                    let ifov = f64::from(ifov_x);
                    u = ((u + 0.5) / ifov).floor() * ifov + (ifov - 1.0) / 2.0;
                }
                u as f32
            })
            .collect();

        let reverse = (0..raw_width)
            .into_par_iter()
            .map(|i| {
                let u = i as f64 - f64::from(offset_x);
                let alpha = ((u + 0.5) / raw * 2.0 - 1.0) * edge;
                let s = geometry.ground_angle(alpha) * EARTH_RADIUS_KM;
                ((s + half_swath) / geometry.resolution - 0.5) as f32
            })
            .collect();

        Self { forward, reverse }
    }
}

/// Result of [correct_image]. On failure `image` is the unmodified input.
#[derive(Debug, Clone)]
pub struct GeometricCorrection {
    pub image: Array2<u16>,
    pub success: bool,
    pub table: Option<CorrectionTable>,
}

impl GeometricCorrection {
    fn failed(image: ArrayView2<u16>) -> Self {
        Self {
            image: image.to_owned(),
            success: false,
            table: None,
        }
    }
}

/// Correct `image`, a swath image of `product`, using the scan geometry of
/// `channel` if given, or the product defaults otherwise.
///
/// Never fails: missing or invalid projection parameters and empty images yield
/// `success == false` with the input returned unchanged.
#[must_use]
pub fn correct_image(
    product: &ImageProducts,
    image: ArrayView2<u16>,
    channel: Option<usize>,
    emit_table: bool,
) -> GeometricCorrection {
    let Some(geometry) = product.projection().and_then(SwathGeometry::from_config) else {
        debug!("no usable projection config");
        return GeometricCorrection::failed(image);
    };
    let (height, raw_width) = image.dim();
    let out_width = geometry.output_width();
    if height == 0 || raw_width == 0 || out_width == 0 {
        warn!(?geometry, dim = ?image.dim(), "cannot correct image");
        return GeometricCorrection::failed(image);
    }

    let span = span!(Level::DEBUG, "correction", ?channel, raw_width, out_width);
    let _guard = span.enter();

    let (offset_x, ifov_x) = match channel {
        Some(idx) => (product.channel_offset_x(idx), product.ifov_x_size(idx)),
        None => (0, product.ifov_x),
    };
    let table = CorrectionTable::compute(&geometry, raw_width, offset_x, ifov_x.unwrap_or(1));

    let columns: Vec<Option<usize>> = table
        .forward
        .iter()
        .map(|u| {
            let c = u.round();
            (c >= 0.0 && (c as usize) < raw_width).then_some(c as usize)
        })
        .collect();

    let mut out = Array2::<u16>::zeros((height, out_width));
    Zip::from(out.rows_mut())
        .and(image.rows())
        .par_for_each(|mut dst, src| {
            for (d, col) in dst.iter_mut().zip(&columns) {
                if let Some(c) = col {
                    *d = src[*c];
                }
            }
        });
    info!(height, raw_width, out_width, "corrected");

    GeometricCorrection {
        image: out,
        success: true,
        table: emit_table.then_some(table),
    }
}

/// Correct channel `index` of `product`. Fails like [correct_image], including
/// when `index` is not a channel.
#[must_use]
pub fn correct_channel(product: &ImageProducts, index: usize, emit_table: bool) -> GeometricCorrection {
    match product.image(index) {
        Some(holder) => correct_image(product, holder.image.view(), Some(index), emit_table),
        None => GeometricCorrection::failed(Array2::zeros((0, 0)).view()),
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;
    use crate::product::ImageHolder;

    fn avhrr() -> ImageProducts {
        let mut product = ImageProducts::new("AVHRR");
        product.set_projection(ProjectionConfig::new(2900.0, 1.0, 833.0));
        let image = Array2::from_shape_fn((4, 2048), |(_, x)| x as u16);
        product
            .push_image(ImageHolder::builder().channel_name("1").image(image).build())
            .unwrap();
        product
    }

    #[test]
    fn incomplete_config_fails_gracefully() {
        let img = array![[1u16, 2, 3]];
        let mut product = ImageProducts::new("x");
        let zult = correct_image(&product, img.view(), None, true);
        assert!(!zult.success);
        assert_eq!(zult.image, img);
        assert!(zult.table.is_none());

        let mut cfg = ProjectionConfig::new(100.0, 1.0, 800.0);
        cfg.altitude = None;
        product.set_projection(cfg);
        assert!(!correct_image(&product, img.view(), None, false).success);

        product.set_projection(ProjectionConfig::new(100.0, 0.0, 800.0));
        assert!(!correct_image(&product, img.view(), None, false).success);

        product.set_projection(ProjectionConfig::new(100.0, 1.0, 800.0));
        let empty = Array2::<u16>::zeros((0, 0));
        assert!(!correct_image(&product, empty.view(), None, false).success);
        assert!(!correct_channel(&product, 3, false).success);
    }

    #[test]
    fn oversized_output_fails_gracefully() {
        let img = array![[1u16, 2, 3]];
        let mut product = ImageProducts::new("x");
        for resolution in [1e-12, 1e-9, 2900.0 / (MAX_OUTPUT_WIDTH as f64 + 1.0)] {
            let cfg = ProjectionConfig::new(2900.0, resolution, 833.0);
            assert!(SwathGeometry::from_config(&cfg).is_none(), "{resolution}");
            product.set_projection(cfg);
            let zult = correct_image(&product, img.view(), None, true);
            assert!(!zult.success);
            assert_eq!(zult.image, img);
        }

        let cfg = ProjectionConfig::new(MAX_OUTPUT_WIDTH as f64, 1.0, 833.0);
        let geometry = SwathGeometry::from_config(&cfg).unwrap();
        assert_eq!(geometry.output_width(), MAX_OUTPUT_WIDTH);
    }

    #[test]
    fn output_width_and_monotonic_table() {
        let product = avhrr();
        let zult = correct_channel(&product, 0, true);
        assert!(zult.success);
        assert_eq!(zult.image.dim(), (4, 2900));

        let table = zult.table.unwrap();
        assert_eq!(table.forward.len(), 2900);
        assert_eq!(table.reverse.len(), 2048);
        assert!(table.forward.windows(2).all(|w| w[0] <= w[1]));
        assert!(table.reverse.windows(2).all(|w| w[0] < w[1]));

        // nadir is preserved, edges are compressed in raw space
        let mid = table.forward[1450];
        assert!((mid - 1023.5).abs() < 1.0, "mid {mid}");
        let edge_step = table.forward[1] - table.forward[0];
        let mid_step = table.forward[1451] - table.forward[1450];
        assert!(edge_step < mid_step, "{edge_step} !< {mid_step}");
    }

    #[test]
    fn tables_are_inverse() {
        let geometry = SwathGeometry {
            swath: 2900.0,
            resolution: 1.0,
            altitude: 833.0,
        };
        let table = CorrectionTable::compute(&geometry, 2048, 0, 1);
        for j in [10usize, 500, 1450, 2800] {
            let raw = table.forward[j];
            let i = raw.floor() as usize;
            let frac = raw - i as f32;
            let back = table.reverse[i] + frac * (table.reverse[i + 1] - table.reverse[i]);
            assert!((back - j as f32).abs() < 0.05, "column {j} -> {raw} -> {back}");
        }
    }

    #[test]
    fn samples_follow_table() {
        let product = avhrr();
        let zult = correct_channel(&product, 0, true);
        let table = zult.table.unwrap();
        for j in [0usize, 700, 1450, 2899] {
            let expected = table.forward[j].round() as u16;
            assert_eq!(zult.image[[2, j]], expected);
        }
    }

    #[test]
    fn offset_and_ifov() {
        let geometry = SwathGeometry {
            swath: 300.0,
            resolution: 1.0,
            altitude: 800.0,
        };
        let plain = CorrectionTable::compute(&geometry, 100, 0, 1);
        let shifted = CorrectionTable::compute(&geometry, 100, 4, 1);
        for (a, b) in plain.forward.iter().zip(&shifted.forward) {
            assert!((b - a - 4.0).abs() < 1e-3);
        }

        let snapped = CorrectionTable::compute(&geometry, 100, 0, 3);
        for u in &snapped.forward {
            // centre of a 3 wide IFOV is 1 mod 3
            let rem = (u.round() as i64).rem_euclid(3);
            assert_eq!(rem, 1, "{u}");
        }
    }

    #[test]
    fn out_of_swath_samples_are_zero() {
        let mut product = avhrr();
        let image = Array2::from_elem((1, 100), 9u16);
        product
            .push_image(
                ImageHolder::builder()
                    .channel_name("2")
                    .image(image)
                    .offset_x(50)
                    .build(),
            )
            .unwrap();
        let zult = correct_channel(&product, 1, false);
        assert!(zult.success);
        assert_eq!(zult.image[[0, zult.image.ncols() - 1]], 0);
        assert_eq!(zult.image[[0, 0]], 9);
    }
}
