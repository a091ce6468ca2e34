//! Live visible/thermal false colour fusion.
//!
//! Frames of the two channels arrive independently and in any order. Only the
//! latest frame of each channel is kept, and the false colour image is
//! regenerated whenever a push leaves both channels populated with capture
//! times within the pair tolerance.
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use ndarray::{Array2, Array3, ArrayView3, Zip};
use tracing::{debug, info, trace};

use crate::{
    info::ImageInfo,
    raster::{png_filename, resize_nearest, write_rgb8},
    Error, Result,
};

/// Default maximum capture time difference between fused frames.
pub const PAIR_TOLERANCE_SECS: i64 = 60;

/// Number of 8-bit levels indexed by the curve and each LUT axis.
const LEVELS: usize = 256;

#[derive(Debug, Clone)]
struct Frame {
    image: Array2<u8>,
    time: DateTime<Utc>,
}

/// Fuses a visible and a thermal channel through a visible tone curve and a 2-D
/// colour table indexed by `[thermal][curved visible]`.
#[derive(Debug, Clone)]
pub struct FalseColorComposer {
    curve: [u8; LEVELS],
    lut: Array3<u8>,
    tolerance: Duration,
    visible: Option<Frame>,
    thermal: Option<Frame>,
    falsecolor: Array3<u8>,
    has_data: bool,
    pub info: ImageInfo,
}

impl FalseColorComposer {
    /// # Errors
    /// [Error::Lut] if `lut` is not `(256, 256, 3)`.
    pub fn new(curve: [u8; LEVELS], lut: Array3<u8>) -> Result<Self> {
        if lut.dim() != (LEVELS, LEVELS, 3) {
            return Err(Error::Lut(format!(
                "false colour lut must be 256x256 rgb, got {:?}",
                lut.dim()
            )));
        }
        Ok(Self {
            curve,
            lut,
            tolerance: Duration::seconds(PAIR_TOLERANCE_SECS),
            visible: None,
            thermal: None,
            falsecolor: Array3::zeros((0, 0, 3)),
            has_data: false,
            info: ImageInfo::default(),
        })
    }

    /// Load the curve from the first 256 pixels of a grayscale image and the LUT
    /// from a 256x256 colour image.
    ///
    /// # Errors
    /// On I/O or decode failure, or [Error::Lut] if either image is too small.
    pub fn from_files<P: AsRef<Path>>(curve_path: P, lut_path: P) -> Result<Self> {
        let pixels = image::open(curve_path)?.into_luma8().into_raw();
        let curve: [u8; LEVELS] = pixels
            .get(..LEVELS)
            .and_then(|p| p.try_into().ok())
            .ok_or_else(|| Error::Lut(format!("curve has {} entries", pixels.len())))?;

        let lut = image::open(lut_path)?.into_rgb8();
        let (w, h) = lut.dimensions();
        let lut = Array3::from_shape_vec((h as usize, w as usize, 3), lut.into_raw())
            .map_err(|err| Error::Lut(err.to_string()))?;
        Self::new(curve, lut)
    }

    /// Set the maximum capture time difference of a fused pair.
    #[must_use]
    pub fn with_tolerance(mut self, tolerance: Duration) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Replace the latest visible frame. Returns `true` if fusion ran.
    pub fn push_visible(&mut self, image: Array2<u8>, time: DateTime<Utc>) -> bool {
        trace!(%time, dim = ?image.dim(), "visible frame");
        self.visible = Some(Frame { image, time });
        self.try_fuse()
    }

    /// Replace the latest thermal frame. Returns `true` if fusion ran.
    pub fn push_thermal(&mut self, image: Array2<u8>, time: DateTime<Utc>) -> bool {
        trace!(%time, dim = ?image.dim(), "thermal frame");
        self.thermal = Some(Frame { image, time });
        self.try_fuse()
    }

    fn try_fuse(&mut self) -> bool {
        let (Some(visible), Some(thermal)) = (&self.visible, &self.thermal) else {
            return false;
        };
        let delta = (visible.time - thermal.time).num_milliseconds().abs();
        if delta > self.tolerance.num_milliseconds() {
            debug!(delta_ms = delta, "frames not paired");
            return false;
        }
        if visible.image.is_empty() {
            return false;
        }

        let (height, width) = visible.image.dim();
        let thermal = resize_nearest(thermal.image.view(), height, width);
        let mut out = Array3::<u8>::zeros((height, width, 3));
        Zip::from(out.rows_mut())
            .and(&visible.image)
            .and(&thermal)
            .for_each(|mut rgb, &vis, &ir| {
                let curved = self.curve[vis as usize] as usize;
                for c in 0..3 {
                    rgb[c] = self.lut[[ir as usize, curved, c]];
                }
            });

        self.falsecolor = out;
        self.has_data = true;
        info!(height, width, "false colour updated");
        true
    }

    /// `true` once any pair has been fused.
    #[must_use]
    pub fn has_data(&self) -> bool {
        self.has_data
    }

    /// Latest fused image as `(y, x, rgb)`; empty until [Self::has_data].
    #[must_use]
    pub fn falsecolor(&self) -> ArrayView3<u8> {
        self.falsecolor.view()
    }

    /// Write the latest fused image as a PNG named from [Self::info].
    ///
    /// # Errors
    /// [Error::Composite] if nothing was fused yet, or on I/O failure.
    pub fn save<P: AsRef<Path>>(&self, directory: P) -> Result<PathBuf> {
        if !self.has_data {
            return Err(Error::Composite("no false colour image yet".into()));
        }
        let stem = self.info.file_stem();
        let name = if stem.is_empty() { "false_color" } else { &stem };
        let path = directory.as_ref().join(png_filename(name));
        write_rgb8(&path, self.falsecolor.view())?;
        Ok(path)
    }
}

/// Synthetic tables: a square-root stretch of the visible channel, tinted blue
/// where the thermal channel is brighter than the visible.
impl Default for FalseColorComposer {
    fn default() -> Self {
        let mut curve = [0u8; LEVELS];
        for (i, c) in curve.iter_mut().enumerate() {
            *c = ((i as f64 / 255.0).sqrt() * 255.0).round() as u8;
        }
        let lut = Array3::from_shape_fn((LEVELS, LEVELS, 3), |(ir, vis, c)| match c {
            2 => ir.max(vis) as u8,
            _ => vis as u8,
        });
        Self {
            curve,
            lut,
            tolerance: Duration::seconds(PAIR_TOLERANCE_SECS),
            visible: None,
            thermal: None,
            falsecolor: Array3::zeros((0, 0, 3)),
            has_data: false,
            info: ImageInfo::default(),
        }
    }
}

/// Display state of a live composite. Set by the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ComposerStatus {
    Receiving,
    Saving,
    #[default]
    Idle,
}

/// Presentation state for showing a [FalseColorComposer], kept apart from the
/// composer itself.
#[derive(Debug, Clone, Default)]
pub struct FalseColorView {
    pub status: ComposerStatus,
    width: usize,
    height: usize,
    needs_update: bool,
    texture: Vec<u32>,
}

impl FalseColorView {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy the composer's image into the RGBA texture. Returns `false` when the
    /// composer has nothing to show.
    pub fn refresh(&mut self, composer: &FalseColorComposer) -> bool {
        if !composer.has_data() {
            return false;
        }
        let img = composer.falsecolor();
        let (height, width, _) = img.dim();
        self.texture.clear();
        self.texture.extend(
            img.rows()
                .into_iter()
                .map(|rgb| u32::from_le_bytes([rgb[0], rgb[1], rgb[2], u8::MAX])),
        );
        self.width = width;
        self.height = height;
        self.needs_update = true;
        true
    }

    /// `(width, height)` of the texture.
    #[must_use]
    pub fn dimensions(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    #[must_use]
    pub fn needs_update(&self) -> bool {
        self.needs_update
    }

    /// Row-major RGBA pixels, little-endian packed.
    #[must_use]
    pub fn texture(&self) -> &[u32] {
        &self.texture
    }

    /// Texture if it changed since the last call.
    pub fn take_update(&mut self) -> Option<&[u32]> {
        if !self.needs_update {
            return None;
        }
        self.needs_update = false;
        Some(&self.texture)
    }
}
