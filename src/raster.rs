//! Lossless raster files and pixel grid helpers.
use std::path::Path;

use image::{ImageBuffer, ImageFormat, Luma, LumaA, Rgb, Rgba};
use ndarray::{Array2, ArrayView2, ArrayView3, Axis};

use crate::{Error, Result};

/// Deterministic file name for a raster labeled `label`, e.g. `AVHRR-3a.png`.
///
/// Characters other than ASCII alphanumerics, `-`, `_` and `.` become `_`.
#[must_use]
pub fn png_filename(label: &str) -> String {
    let stem: String = label
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{stem}.png")
}

/// Write a planar `(component, y, x)` 16-bit raster as PNG. 1 to 4 components
/// are supported, written as gray, gray+alpha, RGB, and RGBA.
///
/// # Errors
/// On I/O failure, or when the component count is unsupported.
pub fn write_png16<P: AsRef<Path>>(path: P, planes: ArrayView3<u16>) -> Result<()> {
    let (components, height, width) = planes.dim();
    // interleave into (y, x, component)
    let data: Vec<u16> = planes.permuted_axes([1, 2, 0]).iter().copied().collect();
    let (w, h) = dims_u32(width, height)?;
    let path = path.as_ref();

    match components {
        1 => buffer::<Luma<u16>>(w, h, data)?.save_with_format(path, ImageFormat::Png)?,
        2 => buffer::<LumaA<u16>>(w, h, data)?.save_with_format(path, ImageFormat::Png)?,
        3 => buffer::<Rgb<u16>>(w, h, data)?.save_with_format(path, ImageFormat::Png)?,
        4 => buffer::<Rgba<u16>>(w, h, data)?.save_with_format(path, ImageFormat::Png)?,
        n => return Err(Error::Composite(format!("cannot write {n} component raster"))),
    }
    Ok(())
}

/// Write a single 16-bit channel as a grayscale PNG.
///
/// # Errors
/// On I/O failure.
pub fn write_gray16<P: AsRef<Path>>(path: P, image: ArrayView2<u16>) -> Result<()> {
    write_png16(path, image.insert_axis(Axis(0)))
}

/// Write an 8-bit grayscale PNG, e.g., an assembled segment mosaic.
///
/// # Errors
/// On I/O failure.
pub fn write_gray8<P: AsRef<Path>>(path: P, image: ArrayView2<u8>) -> Result<()> {
    let (height, width) = image.dim();
    let (w, h) = dims_u32(width, height)?;
    let data: Vec<u8> = image.iter().copied().collect();
    buffer::<Luma<u8>>(w, h, data)?.save_with_format(path.as_ref(), ImageFormat::Png)?;
    Ok(())
}

/// Write an interleaved `(y, x, rgb)` 8-bit raster as PNG.
///
/// # Errors
/// On I/O failure, or if the last axis is not 3 long.
pub fn write_rgb8<P: AsRef<Path>>(path: P, image: ArrayView3<u8>) -> Result<()> {
    let (height, width, components) = image.dim();
    if components != 3 {
        return Err(Error::Composite(format!(
            "expected 3 components, got {components}"
        )));
    }
    let (w, h) = dims_u32(width, height)?;
    let data: Vec<u8> = image.iter().copied().collect();
    buffer::<Rgb<u8>>(w, h, data)?.save_with_format(path.as_ref(), ImageFormat::Png)?;
    Ok(())
}

/// Read any PNG as a single 16-bit channel.
///
/// # Errors
/// On I/O or decode failure.
pub fn read_gray16<P: AsRef<Path>>(path: P) -> Result<Array2<u16>> {
    let img = image::open(path)?.into_luma16();
    let (w, h) = img.dimensions();
    Array2::from_shape_vec((h as usize, w as usize), img.into_raw())
        .map_err(|err| Error::Composite(err.to_string()))
}

fn dims_u32(width: usize, height: usize) -> Result<(u32, u32)> {
    match (u32::try_from(width), u32::try_from(height)) {
        (Ok(w), Ok(h)) => Ok((w, h)),
        _ => Err(Error::Composite(format!(
            "raster too large: {width}x{height}"
        ))),
    }
}

fn buffer<P: image::Pixel>(
    w: u32,
    h: u32,
    data: Vec<P::Subpixel>,
) -> Result<ImageBuffer<P, Vec<P::Subpixel>>> {
    let len = data.len();
    ImageBuffer::from_raw(w, h, data).ok_or(Error::NotEnoughData {
        actual: len,
        minimum: (w as usize) * (h as usize) * usize::from(P::CHANNEL_COUNT),
    })
}

/// Nearest-neighbour resample of `src` onto a `height` x `width` grid.
#[must_use]
pub fn resize_nearest<T: Copy + Default>(
    src: ArrayView2<T>,
    height: usize,
    width: usize,
) -> Array2<T> {
    let (src_h, src_w) = src.dim();
    if (src_h, src_w) == (height, width) {
        return src.to_owned();
    }
    if src_h == 0 || src_w == 0 {
        return Array2::default((height, width));
    }
    Array2::from_shape_fn((height, width), |(y, x)| {
        let sy = (y * src_h / height).min(src_h - 1);
        let sx = (x * src_w / width).min(src_w - 1);
        src[[sy, sx]]
    })
}
