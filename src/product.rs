//! Calibrated multi-channel image products.
//!
//! An [ImageProducts] is built while decoding, mutated by calibration setters,
//! then persisted as a directory holding `product.json` plus one lossless 16-bit
//! PNG per channel. Loading it back reproduces the in-memory model, including
//! compiled calibrations, so composites and projections can be generated later
//! without the original telemetry.
use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{BufReader, BufWriter},
    path::{Path, PathBuf},
};

use ndarray::Array2;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use typed_builder::TypedBuilder;

use crate::{
    calibration::{Calibration, Calibrator},
    raster::{png_filename, read_gray16, write_gray16},
    Error, Result,
};

/// How product timestamps relate to image lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampType {
    /// One timestamp per line.
    #[default]
    Line,
    /// One timestamp per scan of several lines.
    MultipleLines,
    /// One timestamp per IFOV.
    Ifov,
}

/// String keyed metadata with no dedicated field.
///
/// Bounded to [ExtraMetadata::MAX_ENTRIES] entries. Unknown keys found when loading
/// a product land here so they survive a load/save cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExtraMetadata(BTreeMap<String, Value>);

impl ExtraMetadata {
    pub const MAX_ENTRIES: usize = 64;

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Deserialize the value at `key`, or `None` if absent or of the wrong type.
    #[must_use]
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.0
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    fn insert(&mut self, key: &str, value: Value, reserved: &[&str]) -> bool {
        if reserved.contains(&key) {
            warn!(key, "metadata key is reserved; ignoring");
            return false;
        }
        if !self.0.contains_key(key) && self.0.len() >= Self::MAX_ENTRIES {
            warn!(key, "extra metadata is full; ignoring");
            return false;
        }
        self.0.insert(key.to_string(), value);
        true
    }

    fn enforce_bound(&mut self) {
        while self.0.len() > Self::MAX_ENTRIES {
            if let Some((key, _)) = self.0.pop_last() {
                warn!(key, "extra metadata is full; dropping");
            }
        }
    }
}

/// Geometric correction parameters. All three are needed to correct a product.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectionConfig {
    /// Swath width in km
    #[serde(
        rename = "corr_swath",
        default,
        with = "crate::nonfinite::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub swath: Option<f64>,
    /// Output resolution in km
    #[serde(
        rename = "corr_resol",
        default,
        with = "crate::nonfinite::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub resolution: Option<f64>,
    /// Spacecraft altitude in km
    #[serde(
        rename = "corr_altit",
        default,
        with = "crate::nonfinite::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub altitude: Option<f64>,
    #[serde(flatten)]
    extra: ExtraMetadata,
}

impl ProjectionConfig {
    const KEYS: &'static [&'static str] = &["corr_swath", "corr_resol", "corr_altit"];

    #[must_use]
    pub fn new(swath: f64, resolution: f64, altitude: f64) -> Self {
        Self {
            swath: Some(swath),
            resolution: Some(resolution),
            altitude: Some(altitude),
            extra: ExtraMetadata::default(),
        }
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.swath.is_some() && self.resolution.is_some() && self.altitude.is_some()
    }

    #[must_use]
    pub fn extra(&self) -> &ExtraMetadata {
        &self.extra
    }

    /// Attach an additional projection parameter, returning `false` if refused.
    pub fn insert_extra(&mut self, key: &str, value: Value) -> bool {
        self.extra.insert(key, value, Self::KEYS)
    }
}

/// A single channel of an [ImageProducts].
///
/// # Example
/// ```
/// use ndarray::Array2;
/// use satproducts::product::ImageHolder;
///
/// let holder = ImageHolder::builder()
///     .channel_name("3a")
///     .image(Array2::zeros((10, 2048)))
///     .ifov_x(3)
///     .build();
/// assert!(holder.filename.is_empty());
/// ```
#[derive(Debug, Clone, TypedBuilder)]
pub struct ImageHolder {
    /// File name within the product directory. Derived from the instrument and
    /// channel name on save when empty.
    #[builder(default, setter(into))]
    pub filename: String,
    #[builder(setter(into))]
    pub channel_name: String,
    pub image: Array2<u16>,
    /// Channel specific timestamps. When empty the product timestamps apply.
    #[builder(default)]
    pub timestamps: Vec<f64>,
    #[builder(default, setter(strip_option))]
    pub ifov_y: Option<u32>,
    #[builder(default, setter(strip_option))]
    pub ifov_x: Option<u32>,
    /// Horizontal shift, in pixels, correcting sensor misalignment with other channels.
    #[builder(default)]
    pub offset_x: i32,
    #[builder(default, setter(skip))]
    extra: ExtraMetadata,
}

impl ImageHolder {
    const KEYS: &'static [&'static str] = &[
        "file",
        "name",
        "timestamps",
        "ifov_x",
        "ifov_y",
        "offset_x",
        "calibration",
        "wavenumber",
    ];

    #[must_use]
    pub fn extra(&self) -> &ExtraMetadata {
        &self.extra
    }

    /// Attach per-channel metadata, returning `false` if the key is reserved or
    /// the metadata is full.
    pub fn insert_extra(&mut self, key: &str, value: Value) -> bool {
        self.extra.insert(key, value, Self::KEYS)
    }
}

fn derived_filename(instrument: &str, channel: &str) -> String {
    png_filename(&format!("{instrument}-{channel}"))
}

/// A plain file name that stays inside the product directory when joined to it.
fn is_plain_filename(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', ':'])
}

#[derive(Debug, Clone, Default)]
struct ChannelCalibration {
    descriptor: Option<Calibration>,
    compiled: Option<Calibrator>,
    wavenumber: Option<f64>,
}

/// Multi-channel calibrated image product.
///
/// # Example
/// ```
/// use ndarray::Array2;
/// use satproducts::product::{ImageHolder, ImageProducts, ProjectionConfig};
///
/// let mut product = ImageProducts::new("AVHRR");
/// product.set_timestamps(vec![0.0, 1.0]);
/// let idx = product
///     .push_image(ImageHolder::builder().channel_name("1").image(Array2::ones((2, 2))).build())
///     .unwrap();
/// product.set_calibration(idx, satproducts::calibration::Calibration::Polynomial {
///     coefs: vec![0.5, 2.0],
/// }).unwrap();
///
/// assert_eq!(product.radiance_value(idx, 0, 0), Some(2.5));
/// assert_eq!(product.timestamps(Some(idx)), &[0.0, 1.0]);
/// assert!(!product.can_geometrically_correct());
///
/// product.set_projection(ProjectionConfig::new(2900.0, 1.1, 833.0));
/// assert!(product.can_geometrically_correct());
/// ```
#[derive(Debug, Clone)]
pub struct ImageProducts {
    pub instrument_name: String,
    pub has_timestamps: bool,
    pub needs_correlation: bool,
    pub timestamp_type: TimestampType,
    pub bit_depth: u8,
    /// Default IFOV height, overridable per channel.
    pub ifov_y: Option<u32>,
    /// Default IFOV width, overridable per channel.
    pub ifov_x: Option<u32>,

    images: Vec<ImageHolder>,
    calibration: Vec<ChannelCalibration>,
    timestamps: Vec<f64>,
    projection: Option<ProjectionConfig>,
    extra: ExtraMetadata,
}

impl ImageProducts {
    /// Name of the metadata document within a product directory.
    pub const METADATA_FILENAME: &'static str = "product.json";
    const KIND: &'static str = "image";
    const KEYS: &'static [&'static str] = &[
        "type",
        "instrument",
        "has_timestamps",
        "needs_correlation",
        "timestamp_type",
        "bit_depth",
        "ifov_x",
        "ifov_y",
        "timestamps",
        "projection_cfg",
        "images",
    ];

    #[must_use]
    pub fn new(instrument_name: &str) -> Self {
        Self {
            instrument_name: instrument_name.to_string(),
            has_timestamps: true,
            needs_correlation: false,
            timestamp_type: TimestampType::default(),
            bit_depth: 16,
            ifov_y: None,
            ifov_x: None,
            images: Vec::default(),
            calibration: Vec::default(),
            timestamps: Vec::default(),
            projection: None,
            extra: ExtraMetadata::default(),
        }
    }

    /// Append a channel, returning its index. Channel order is significant; it
    /// is the order variables are bound in composite equations.
    ///
    /// # Errors
    /// [Error::DuplicateChannel] if a channel with the same name exists.
    pub fn push_image(&mut self, holder: ImageHolder) -> Result<usize> {
        if self.channel_index(&holder.channel_name).is_some() {
            return Err(Error::DuplicateChannel(holder.channel_name));
        }
        debug!(
            channel = %holder.channel_name,
            width = holder.image.ncols(),
            height = holder.image.nrows(),
            "adding channel"
        );
        self.images.push(holder);
        self.calibration.push(ChannelCalibration::default());
        Ok(self.images.len() - 1)
    }

    #[must_use]
    pub fn images(&self) -> &[ImageHolder] {
        &self.images
    }

    #[must_use]
    pub fn image(&self, index: usize) -> Option<&ImageHolder> {
        self.images.get(index)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.images.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    #[must_use]
    pub fn channel_index(&self, name: &str) -> Option<usize> {
        self.images.iter().position(|h| h.channel_name == name)
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.images.len() {
            return Err(Error::NoSuchChannel(format!("index {index}")));
        }
        Ok(())
    }

    // Timestamps

    pub fn set_timestamps(&mut self, timestamps: Vec<f64>) {
        self.timestamps = timestamps;
    }

    /// Set timestamps specific to channel `index`.
    ///
    /// # Errors
    /// [Error::NoSuchChannel] if `index` is out of range.
    pub fn set_channel_timestamps(&mut self, index: usize, timestamps: Vec<f64>) -> Result<()> {
        self.check_index(index)?;
        self.images[index].timestamps = timestamps;
        Ok(())
    }

    /// Timestamps for channel `index`, falling back to the product timestamps when
    /// the channel has none, or the index is `None` or out of range.
    #[must_use]
    pub fn timestamps(&self, index: Option<usize>) -> &[f64] {
        match index.and_then(|i| self.images.get(i)) {
            Some(holder) if !holder.timestamps.is_empty() => &holder.timestamps,
            _ => &self.timestamps,
        }
    }

    // Scan geometry

    #[must_use]
    pub fn ifov_y_size(&self, index: usize) -> Option<u32> {
        self.images
            .get(index)
            .and_then(|h| h.ifov_y)
            .or(self.ifov_y)
    }

    #[must_use]
    pub fn ifov_x_size(&self, index: usize) -> Option<u32> {
        self.images
            .get(index)
            .and_then(|h| h.ifov_x)
            .or(self.ifov_x)
    }

    #[must_use]
    pub fn channel_offset_x(&self, index: usize) -> i32 {
        self.images.get(index).map_or(0, |h| h.offset_x)
    }

    // Projection

    pub fn set_projection(&mut self, cfg: ProjectionConfig) {
        self.projection = Some(cfg);
    }

    #[must_use]
    pub fn projection(&self) -> Option<&ProjectionConfig> {
        self.projection.as_ref()
    }

    #[must_use]
    pub fn has_projection(&self) -> bool {
        self.projection.is_some()
    }

    /// True only when swath, resolution, and altitude are all present.
    #[must_use]
    pub fn can_geometrically_correct(&self) -> bool {
        self.projection
            .as_ref()
            .is_some_and(ProjectionConfig::is_complete)
    }

    // Calibration

    /// Set the calibration for channel `index`, compiling it for later use.
    ///
    /// # Errors
    /// [Error::NoSuchChannel] if `index` is out of range, or [Error::Expression] if
    /// a custom equation does not compile. The previous calibration is kept on error.
    pub fn set_calibration(&mut self, index: usize, calibration: Calibration) -> Result<()> {
        self.check_index(index)?;
        let compiled = Calibrator::compile(&calibration)?;
        let cal = &mut self.calibration[index];
        cal.descriptor = Some(calibration);
        cal.compiled = Some(compiled);
        Ok(())
    }

    /// See [ImageProducts::set_calibration].
    pub fn set_calibration_polynomial(&mut self, index: usize, coefs: Vec<f64>) -> Result<()> {
        self.set_calibration(index, Calibration::Polynomial { coefs })
    }

    /// See [ImageProducts::set_calibration].
    pub fn set_calibration_polynomial_per_line(
        &mut self,
        index: usize,
        coefs: Vec<Vec<f64>>,
    ) -> Result<()> {
        self.set_calibration(index, Calibration::PolynomialPerLine { coefs })
    }

    /// See [ImageProducts::set_calibration].
    pub fn set_calibration_custom(&mut self, index: usize, equation: &str) -> Result<()> {
        self.set_calibration(
            index,
            Calibration::Custom {
                equation: equation.to_string(),
            },
        )
    }

    /// See [ImageProducts::set_calibration].
    pub fn set_calibration_custom_per_line(
        &mut self,
        index: usize,
        equations: Vec<String>,
    ) -> Result<()> {
        self.set_calibration(index, Calibration::CustomPerLine { equations })
    }

    #[must_use]
    pub fn has_calibration(&self) -> bool {
        self.calibration.iter().any(|c| c.descriptor.is_some())
    }

    #[must_use]
    pub fn calibration(&self, index: usize) -> Option<&Calibration> {
        self.calibration
            .get(index)
            .and_then(|c| c.descriptor.as_ref())
    }

    /// # Errors
    /// [Error::NoSuchChannel] if `index` is out of range.
    pub fn set_wavenumber(&mut self, index: usize, wavenumber: f64) -> Result<()> {
        self.check_index(index)?;
        self.calibration[index].wavenumber = Some(wavenumber);
        Ok(())
    }

    /// Channel wavenumber, 0 when not set.
    #[must_use]
    pub fn wavenumber(&self, index: usize) -> f64 {
        self.calibration
            .get(index)
            .and_then(|c| c.wavenumber)
            .unwrap_or_default()
    }

    /// Calibrated radiance of the raw pixel at `(x, y)` of channel `index`.
    ///
    /// `None` if the channel, the pixel, or the channel's calibration does not
    /// exist, or a per-line calibration has no entry for line `y`.
    #[must_use]
    pub fn radiance_value(&self, index: usize, x: usize, y: usize) -> Option<f64> {
        let raw = *self.images.get(index)?.image.get((y, x))?;
        self.calibration
            .get(index)?
            .compiled
            .as_ref()?
            .radiance(raw, y)
    }

    // Extra metadata

    #[must_use]
    pub fn extra(&self) -> &ExtraMetadata {
        &self.extra
    }

    /// Attach metadata that has no dedicated field, returning `false` if the key
    /// is reserved or the metadata is full.
    pub fn insert_extra(&mut self, key: &str, value: Value) -> bool {
        self.extra.insert(key, value, Self::KEYS)
    }

    // Persistence

    fn channel_filename(&self, holder: &ImageHolder) -> String {
        if !is_plain_filename(&holder.filename) {
            derived_filename(&self.instrument_name, &holder.channel_name)
        } else {
            holder.filename.clone()
        }
    }

    /// Save to `directory`, creating it if needed, and return the path of the
    /// metadata document. Channel images are only written with `save_images`.
    ///
    /// Files are written in place; an interrupted save may leave a partial product.
    ///
    /// # Errors
    /// On any I/O or encoding failure.
    pub fn save<P: AsRef<Path>>(&self, directory: P, save_images: bool) -> Result<PathBuf> {
        let directory = directory.as_ref();
        fs::create_dir_all(directory)?;

        let mut channels = Vec::with_capacity(self.images.len());
        for (holder, cal) in self.images.iter().zip(&self.calibration) {
            let file = self.channel_filename(holder);
            if save_images {
                debug!(channel = %holder.channel_name, %file, "writing channel");
                write_gray16(directory.join(&file), holder.image.view())?;
            }
            channels.push(ChannelDocument {
                file,
                name: holder.channel_name.clone(),
                timestamps: holder.timestamps.clone(),
                ifov_x: holder.ifov_x,
                ifov_y: holder.ifov_y,
                offset_x: holder.offset_x,
                calibration: cal.descriptor.clone(),
                wavenumber: cal.wavenumber,
                extra: holder.extra.clone(),
            });
        }

        let doc = ProductDocument {
            kind: Self::KIND.to_string(),
            instrument: self.instrument_name.clone(),
            has_timestamps: self.has_timestamps,
            needs_correlation: self.needs_correlation,
            timestamp_type: self.timestamp_type,
            bit_depth: self.bit_depth,
            ifov_x: self.ifov_x,
            ifov_y: self.ifov_y,
            timestamps: self.timestamps.clone(),
            projection_cfg: self.projection.clone(),
            images: channels,
            extra: self.extra.clone(),
        };

        let path = directory.join(Self::METADATA_FILENAME);
        serde_json::to_writer_pretty(BufWriter::new(File::create(&path)?), &doc)?;
        info!(
            instrument = %self.instrument_name,
            channels = self.images.len(),
            path = ?path,
            "saved product"
        );
        Ok(path)
    }

    /// Load a product from the metadata document at `path`. Channel images are
    /// read from the same directory; a missing image leaves that channel empty.
    ///
    /// # Errors
    /// On I/O failure, an invalid document or image, or duplicate channel names.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let directory = path.parent().unwrap_or_else(|| Path::new("."));
        let doc: ProductDocument = serde_json::from_reader(BufReader::new(File::open(path)?))?;
        if !doc.kind.is_empty() && doc.kind != Self::KIND {
            warn!(kind = %doc.kind, "unexpected product type");
        }

        let mut product = Self::new(&doc.instrument);
        product.has_timestamps = doc.has_timestamps;
        product.needs_correlation = doc.needs_correlation;
        product.timestamp_type = doc.timestamp_type;
        product.bit_depth = doc.bit_depth;
        product.ifov_x = doc.ifov_x;
        product.ifov_y = doc.ifov_y;
        product.timestamps = doc.timestamps;
        product.projection = doc.projection_cfg;
        if let Some(proj) = product.projection.as_mut() {
            proj.extra.enforce_bound();
        }
        product.extra = doc.extra;
        product.extra.enforce_bound();

        for mut ch in doc.images {
            if !ch.file.is_empty() && !is_plain_filename(&ch.file) {
                warn!(channel = %ch.name, file = %ch.file, "channel file is not a plain name; ignoring");
                ch.file.clear();
            }
            let file = if ch.file.is_empty() {
                derived_filename(&product.instrument_name, &ch.name)
            } else {
                ch.file.clone()
            };
            ch.extra.enforce_bound();
            let image_path = directory.join(file);
            let image = if image_path.exists() {
                read_gray16(&image_path)?
            } else {
                warn!(channel = %ch.name, path = ?image_path, "channel image missing; leaving empty");
                Array2::zeros((0, 0))
            };
            let index = product.push_image(ImageHolder {
                filename: ch.file,
                channel_name: ch.name,
                image,
                timestamps: ch.timestamps,
                ifov_y: ch.ifov_y,
                ifov_x: ch.ifov_x,
                offset_x: ch.offset_x,
                extra: ch.extra,
            })?;

            let cal = &mut product.calibration[index];
            cal.wavenumber = ch.wavenumber;
            if let Some(descriptor) = ch.calibration {
                match Calibrator::compile(&descriptor) {
                    Ok(compiled) => cal.compiled = Some(compiled),
                    Err(err) => warn!(channel = index, "calibration does not compile: {err}"),
                }
                cal.descriptor = Some(descriptor);
            }
        }

        info!(
            instrument = %product.instrument_name,
            channels = product.len(),
            path = ?path,
            "loaded product"
        );
        Ok(product)
    }
}

fn is_zero(v: &i32) -> bool {
    *v == 0
}

/// Persisted per-channel metadata.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct ChannelDocument {
    file: String,
    name: String,
    #[serde(skip_serializing_if = "Vec::is_empty", with = "crate::nonfinite::vec")]
    timestamps: Vec<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ifov_x: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ifov_y: Option<u32>,
    #[serde(skip_serializing_if = "is_zero")]
    offset_x: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    calibration: Option<Calibration>,
    #[serde(
        default,
        with = "crate::nonfinite::option",
        skip_serializing_if = "Option::is_none"
    )]
    wavenumber: Option<f64>,
    #[serde(flatten)]
    extra: ExtraMetadata,
}

/// Persisted product metadata; see [ImageProducts::save].
#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
struct ProductDocument {
    #[serde(rename = "type")]
    kind: String,
    instrument: String,
    has_timestamps: bool,
    needs_correlation: bool,
    timestamp_type: TimestampType,
    bit_depth: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    ifov_x: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ifov_y: Option<u32>,
    #[serde(with = "crate::nonfinite::vec")]
    timestamps: Vec<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    projection_cfg: Option<ProjectionConfig>,
    images: Vec<ChannelDocument>,
    #[serde(flatten)]
    extra: ExtraMetadata,
}

impl Default for ProductDocument {
    fn default() -> Self {
        Self {
            kind: String::default(),
            instrument: String::default(),
            has_timestamps: true,
            needs_correlation: false,
            timestamp_type: TimestampType::default(),
            bit_depth: 16,
            ifov_x: None,
            ifov_y: None,
            timestamps: Vec::default(),
            projection_cfg: None,
            images: Vec::default(),
            extra: ExtraMetadata::default(),
        }
    }
}
