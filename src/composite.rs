//! Composites derived from the channels of an [ImageProducts].
//!
//! A composite is described by an [ImageCompositeCfg] recipe: either an
//! equation over channel variables, or a lookup table indexed by a list of
//! channels. Either mode may be followed by post-processing, always applied in
//! the order equalize, invert, normalize, white balance.
//!
//! # Example
//! ```
//! use ndarray::array;
//! use satproducts::composite::{make_composite, CompositeOptions, ImageCompositeCfg};
//! use satproducts::product::{ImageHolder, ImageProducts};
//!
//! let mut product = ImageProducts::new("AVHRR");
//! for (name, v) in [("1", 100u16), ("2", 300)] {
//!     product
//!         .push_image(ImageHolder::builder().channel_name(name).image(array![[v, v]]).build())
//!         .unwrap();
//! }
//! let cfg = ImageCompositeCfg::from_json(r#"{"equation": "ch2 - ch1", "normalize": false}"#).unwrap();
//! let composite = make_composite(&product, &cfg, &CompositeOptions::default()).unwrap();
//! assert_eq!(composite.image[[0, 0, 0]], 200);
//! ```
use std::{
    fs::File,
    io::BufWriter,
    path::{Path, PathBuf},
};

use crossbeam::channel::Sender;
use image::DynamicImage;
use ndarray::{Array3, ArrayView2, ArrayViewMut2, Axis, CowArray, Ix2};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, span, Level};
use typed_builder::TypedBuilder;

use crate::{
    expr::Expression,
    product::ImageProducts,
    raster::{png_filename, resize_nearest, write_png16},
    Error, Result,
};

/// Full scale of composite output samples.
const FULL_SCALE: f64 = 65535.0;
/// Fraction of samples clipped at each end by white balancing.
const WHITE_BALANCE_CLIP: f64 = 0.0005;

/// Composite recipe. Absent fields default to off or empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageCompositeCfg {
    pub equation: String,
    pub equalize: bool,
    pub invert: bool,
    pub normalize: bool,
    pub white_balance: bool,

    /// LUT file, used only when `equation` is empty.
    pub lut: String,
    /// Comma separated channel names indexing the LUT, in LUT axis order.
    pub lut_channels: String,
}

/// The mode a [ImageCompositeCfg] resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipe<'a> {
    Equation(&'a str),
    Lut { lut: &'a str, channels: Vec<&'a str> },
}

impl ImageCompositeCfg {
    /// # Errors
    /// If `json` is not a valid recipe document.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// The equation takes precedence over the LUT when both are set.
    ///
    /// # Errors
    /// [Error::Composite] if neither an equation nor a LUT is set.
    pub fn recipe(&self) -> Result<Recipe<'_>> {
        if !self.equation.trim().is_empty() {
            return Ok(Recipe::Equation(&self.equation));
        }
        if !self.lut.is_empty() {
            let channels = self
                .lut_channels
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .collect();
            return Ok(Recipe::Lut {
                lut: &self.lut,
                channels,
            });
        }
        Err(Error::Composite("recipe has no equation or lut".into()))
    }

    fn post_processing(&self) -> Vec<String> {
        [
            ("equalize", self.equalize),
            ("invert", self.invert),
            ("normalize", self.normalize),
            ("white_balance", self.white_balance),
        ]
        .iter()
        .filter(|(_, on)| *on)
        .map(|(name, _)| (*name).to_string())
        .collect()
    }
}

/// Lookup table mapping one or two normalised channel values to a colour.
///
/// Stored as `(y, x, component)`. The first channel indexes x and the second, if
/// any, indexes y.
#[derive(Debug, Clone, PartialEq)]
pub struct Lut {
    table: Array3<u16>,
}

impl Lut {
    /// # Errors
    /// [Error::Lut] if the table is empty or has more than 4 components.
    pub fn new(table: Array3<u16>) -> Result<Self> {
        let (h, w, c) = table.dim();
        if h == 0 || w == 0 || c == 0 || c > 4 {
            return Err(Error::Lut(format!("unsupported lut shape {h}x{w}x{c}")));
        }
        Ok(Self { table })
    }

    /// Gray images give 1 component, gray+alpha and RGB 3, RGBA 4. 8-bit images are
    /// scaled to 16-bit.
    ///
    /// # Errors
    /// [Error::Lut] if the image is empty.
    pub fn from_image(img: &DynamicImage) -> Result<Self> {
        let (w, h) = (img.width() as usize, img.height() as usize);
        let (data, c) = match img {
            DynamicImage::ImageLuma8(_) | DynamicImage::ImageLuma16(_) => {
                (img.to_luma16().into_raw(), 1)
            }
            DynamicImage::ImageRgba8(_) | DynamicImage::ImageRgba16(_) => {
                (img.to_rgba16().into_raw(), 4)
            }
            _ => (img.to_rgb16().into_raw(), 3),
        };
        let table = Array3::from_shape_vec((h, w, c), data)
            .map_err(|err| Error::Lut(err.to_string()))?;
        Self::new(table)
    }

    /// # Errors
    /// On I/O or decode failure.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_image(&image::open(path)?)
    }

    #[must_use]
    pub fn components(&self) -> usize {
        self.table.dim().2
    }

    fn lookup(&self, coords: &[f64], out: &mut [u16]) {
        let (h, w, _) = self.table.dim();
        let index = |v: f64, len: usize| -> usize {
            let v = if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) };
            (v * (len - 1) as f64).round() as usize
        };
        let x = index(coords[0], w);
        let y = coords.get(1).map_or(0, |v| index(*v, h));
        for (c, o) in out.iter_mut().enumerate() {
            *o = self.table[[y, x, c]];
        }
    }
}

/// Options controlling how a composite is produced.
#[derive(Debug, Default, TypedBuilder)]
pub struct CompositeOptions {
    /// Directory LUT file names are resolved against.
    #[builder(default, setter(strip_option, into))]
    pub resource_dir: Option<PathBuf>,
    /// Pre-loaded LUT used instead of reading the recipe's LUT file.
    #[builder(default, setter(strip_option))]
    pub lut: Option<Lut>,
    /// Receives monotonically increasing progress in [0, 1]. Send failures are
    /// ignored so a caller can stop listening at any time.
    #[builder(default, setter(strip_option))]
    pub progress: Option<Sender<f32>>,
}

fn is_zero(v: &i32) -> bool {
    *v == 0
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompositeMetadata {
    /// Channels used, in product order.
    pub channels: Vec<String>,
    /// Channel whose grid, timestamps, and offset the composite uses.
    pub reference_channel: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub img_offset_x: i32,
    #[serde(default)]
    pub post_processing: Vec<String>,
}

/// A derived raster stored as `(component, y, x)`.
#[derive(Debug, Clone)]
pub struct Composite {
    pub image: Array3<u16>,
    pub timestamps: Vec<f64>,
    pub metadata: CompositeMetadata,
}

#[derive(Serialize)]
struct Sidecar<'a> {
    #[serde(serialize_with = "crate::nonfinite::vec::serialize")]
    timestamps: &'a [f64],
    #[serde(flatten)]
    metadata: &'a CompositeMetadata,
}

impl Composite {
    #[must_use]
    pub fn components(&self) -> usize {
        self.image.dim().0
    }

    #[must_use]
    pub fn height(&self) -> usize {
        self.image.dim().1
    }

    #[must_use]
    pub fn width(&self) -> usize {
        self.image.dim().2
    }

    /// Write the composite as `<name>.png` with a `<name>.json` metadata sidecar
    /// into `directory`, returning the image path.
    ///
    /// # Errors
    /// On I/O or encoding failure.
    pub fn save<P: AsRef<Path>>(&self, directory: P, name: &str) -> Result<PathBuf> {
        let file = png_filename(name);
        let path = directory.as_ref().join(&file);
        write_png16(&path, self.image.view())?;

        let sidecar = path.with_extension("json");
        serde_json::to_writer_pretty(
            BufWriter::new(File::create(sidecar)?),
            &Sidecar {
                timestamps: &self.timestamps,
                metadata: &self.metadata,
            },
        )?;
        info!(?path, "saved composite");
        Ok(path)
    }
}

struct Progress<'a> {
    tx: Option<&'a Sender<f32>>,
    last: f32,
}

impl<'a> Progress<'a> {
    fn new(tx: Option<&'a Sender<f32>>) -> Self {
        Self { tx, last: 0.0 }
    }

    fn report(&mut self, value: f32) {
        let value = value.clamp(self.last, 1.0);
        self.last = value;
        if let Some(tx) = self.tx {
            let _ = tx.send(value);
        }
    }
}

/// Referenced channels resampled onto a common grid.
struct Inputs<'a> {
    planes: Vec<CowArray<'a, u16, Ix2>>,
    /// Product index of the channel defining the grid
    reference: usize,
}

impl Inputs<'_> {
    fn dim(&self) -> (usize, usize) {
        self.planes[0].dim()
    }
}

fn gather<'a>(product: &'a ImageProducts, indices: &[usize]) -> Result<Inputs<'a>> {
    let mut images = Vec::with_capacity(indices.len());
    for &idx in indices {
        let holder = product
            .image(idx)
            .ok_or_else(|| Error::NoSuchChannel(format!("index {idx}")))?;
        if holder.image.is_empty() {
            return Err(Error::Composite(format!(
                "channel {} has no image data",
                holder.channel_name
            )));
        }
        images.push((idx, holder.image.view()));
    }

    // widest channel wins, then tallest, first on ties
    let Some(&(reference, ref_img)) = images.iter().reduce(|best, cur| {
        if (cur.1.ncols(), cur.1.nrows()) > (best.1.ncols(), best.1.nrows()) {
            cur
        } else {
            best
        }
    })
    else {
        return Err(Error::Composite("no input channels".into()));
    };
    let (height, width) = ref_img.dim();

    let planes = images
        .into_iter()
        .map(|(idx, img)| {
            if img.dim() == (height, width) {
                CowArray::from(img)
            } else {
                debug!(channel = idx, from = ?img.dim(), to = ?(height, width), "resampling");
                CowArray::from(resize_nearest(img, height, width))
            }
        })
        .collect();

    Ok(Inputs { planes, reference })
}

fn full_scale(bit_depth: u8) -> f64 {
    f64::from((1u32 << bit_depth.clamp(1, 16)) - 1)
}

fn to_output(v: f64) -> u16 {
    if v.is_nan() {
        return 0;
    }
    (v.clamp(0.0, 1.0) * FULL_SCALE).round() as u16
}

fn equation_composite<'a>(
    product: &'a ImageProducts,
    equation: &str,
    progress: &mut Progress,
) -> Result<(Array3<u16>, Inputs<'a>, Vec<usize>)> {
    let variables: Vec<String> = product
        .images()
        .iter()
        .map(|h| format!("ch{}", h.channel_name))
        .collect();
    let exprs = Expression::parse_list(equation, &variables)?;
    if exprs.len() > 4 {
        return Err(Error::Composite(format!(
            "equation has {} components, at most 4 are supported",
            exprs.len()
        )));
    }

    let mut used: Vec<usize> = exprs
        .iter()
        .flat_map(|e| e.used_variables().iter().copied())
        .collect();
    used.sort_unstable();
    used.dedup();
    if used.is_empty() {
        return Err(Error::Composite("equation references no channels".into()));
    }

    let inputs = gather(product, &used)?;
    let (height, width) = inputs.dim();
    let scale = full_scale(product.bit_depth);
    let mut out = Array3::<u16>::zeros((exprs.len(), height, width));
    let mut values = vec![f64::NAN; variables.len()];

    for y in 0..height {
        for x in 0..width {
            for (plane, &var) in inputs.planes.iter().zip(&used) {
                values[var] = f64::from(plane[[y, x]]) / scale;
            }
            for (c, expr) in exprs.iter().enumerate() {
                out[[c, y, x]] = to_output(expr.eval(&values));
            }
        }
        progress.report((y + 1) as f32 / height as f32);
    }

    Ok((out, inputs, used))
}

fn lut_composite<'a>(
    product: &'a ImageProducts,
    lut_name: &str,
    channels: &[&str],
    opts: &CompositeOptions,
    progress: &mut Progress,
) -> Result<(Array3<u16>, Inputs<'a>, Vec<usize>)> {
    if channels.is_empty() || channels.len() > 2 {
        return Err(Error::Composite(format!(
            "lut requires 1 or 2 channels, got {}",
            channels.len()
        )));
    }
    let indices = channels
        .iter()
        .map(|name| {
            product
                .channel_index(name)
                .ok_or_else(|| Error::NoSuchChannel((*name).to_string()))
        })
        .collect::<Result<Vec<usize>>>()?;

    let loaded;
    let lut = match &opts.lut {
        Some(lut) => lut,
        None => {
            let path = match &opts.resource_dir {
                Some(dir) => dir.join(lut_name),
                None => PathBuf::from(lut_name),
            };
            debug!(?path, "loading lut");
            loaded = Lut::open(path)?;
            &loaded
        }
    };

    let inputs = gather(product, &indices)?;
    let (height, width) = inputs.dim();
    let scale = full_scale(product.bit_depth);
    let mut out = Array3::<u16>::zeros((lut.components(), height, width));
    let mut coords = vec![0.0; indices.len()];
    let mut pixel = vec![0u16; lut.components()];

    for y in 0..height {
        for x in 0..width {
            for (coord, plane) in coords.iter_mut().zip(&inputs.planes) {
                *coord = f64::from(plane[[y, x]]) / scale;
            }
            lut.lookup(&coords, &mut pixel);
            for (c, v) in pixel.iter().enumerate() {
                out[[c, y, x]] = *v;
            }
        }
        progress.report((y + 1) as f32 / height as f32);
    }

    let mut used = indices;
    used.sort_unstable();
    used.dedup();
    Ok((out, inputs, used))
}

/// Build a composite from `product` following `cfg`.
///
/// `product` is never modified; on error nothing is produced.
///
/// # Errors
/// [Error::Expression] for invalid equations, [Error::NoSuchChannel] for unknown
/// LUT channels, [Error::Composite] when channels lack data or the recipe is
/// empty, and I/O errors loading a LUT.
pub fn make_composite(
    product: &ImageProducts,
    cfg: &ImageCompositeCfg,
    opts: &CompositeOptions,
) -> Result<Composite> {
    let span = span!(Level::DEBUG, "composite", instrument = %product.instrument_name);
    let _guard = span.enter();

    let mut progress = Progress::new(opts.progress.as_ref());
    progress.report(0.0);

    let (mut image, inputs, used) = match cfg.recipe()? {
        Recipe::Equation(equation) => {
            debug!(equation, "equation composite");
            equation_composite(product, equation, &mut progress)?
        }
        Recipe::Lut { lut, channels } => {
            debug!(lut, ?channels, "lut composite");
            lut_composite(product, lut, &channels, opts, &mut progress)?
        }
    };

    post_process(&mut image, cfg);
    progress.report(1.0);

    let reference = inputs.reference;
    let metadata = CompositeMetadata {
        channels: used
            .iter()
            .filter_map(|i| product.image(*i))
            .map(|h| h.channel_name.clone())
            .collect(),
        reference_channel: product
            .image(reference)
            .map(|h| h.channel_name.clone())
            .unwrap_or_default(),
        img_offset_x: product.channel_offset_x(reference),
        post_processing: cfg.post_processing(),
    };
    debug!(
        components = image.dim().0,
        height = image.dim().1,
        width = image.dim().2,
        "composite done"
    );

    Ok(Composite {
        image,
        timestamps: product.timestamps(Some(reference)).to_vec(),
        metadata,
    })
}

/// Apply the post-processing steps enabled in `cfg`, in their fixed order.
pub fn post_process(image: &mut Array3<u16>, cfg: &ImageCompositeCfg) {
    for mut plane in image.axis_iter_mut(Axis(0)) {
        if cfg.equalize {
            equalize(plane.view_mut());
        }
        if cfg.invert {
            plane.mapv_inplace(|v| u16::MAX - v);
        }
        if cfg.normalize {
            normalize(plane.view_mut());
        }
    }
    if cfg.white_balance {
        white_balance(image);
    }
}

fn histogram(plane: ArrayView2<u16>) -> Vec<u64> {
    let mut hist = vec![0u64; 1 << 16];
    plane.iter().for_each(|v| hist[*v as usize] += 1);
    hist
}

/// Histogram equalization over the full 16-bit range.
fn equalize(mut plane: ArrayViewMut2<u16>) {
    let hist = histogram(plane.view());
    let total = plane.len() as u64;
    let mut cdf = hist;
    let mut acc = 0;
    for v in &mut cdf {
        acc += *v;
        *v = acc;
    }
    let cdf_min = cdf.iter().copied().find(|c| *c > 0).unwrap_or(0);
    if total <= cdf_min {
        return;
    }
    let range = (total - cdf_min) as f64;
    plane.mapv_inplace(|v| {
        let c = cdf[v as usize] - cdf_min;
        (c as f64 / range * FULL_SCALE).round() as u16
    });
}

fn stretch(mut plane: ArrayViewMut2<u16>, low: u16, high: u16) {
    if high <= low {
        return;
    }
    let range = f64::from(high - low);
    plane.mapv_inplace(|v| {
        let v = f64::from(v.clamp(low, high) - low);
        (v / range * FULL_SCALE).round() as u16
    });
}

/// Min-max stretch to the full range.
fn normalize(plane: ArrayViewMut2<u16>) {
    let (Some(&low), Some(&high)) = (plane.iter().min(), plane.iter().max()) else {
        return;
    };
    stretch(plane, low, high);
}

fn percentile(hist: &[u64], total: u64, fraction: f64) -> u16 {
    let target = (total as f64 * fraction).ceil().max(1.0) as u64;
    let mut acc = 0;
    for (v, count) in hist.iter().enumerate() {
        acc += count;
        if acc >= target {
            return v as u16;
        }
    }
    u16::MAX
}

/// Per-component gain so each component's bright end maps to white and its dark
/// end to black, ignoring a small fraction of outliers on either end.
fn white_balance(image: &mut Array3<u16>) {
    for plane in image.axis_iter_mut(Axis(0)) {
        let hist = histogram(plane.view());
        let total = plane.len() as u64;
        if total == 0 {
            continue;
        }
        let low = percentile(&hist, total, WHITE_BALANCE_CLIP);
        let high = percentile(&hist, total, 1.0 - WHITE_BALANCE_CLIP);
        stretch(plane, low, high);
    }
}
