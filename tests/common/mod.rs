use ndarray::Array2;
use satproducts::product::{ImageHolder, ImageProducts};

/// Deterministic test pattern that varies along both axes.
pub fn gradient(height: usize, width: usize, scale: u16) -> Array2<u16> {
    Array2::from_shape_fn((height, width), |(y, x)| {
        ((y * 31 + x * 7) as u16).wrapping_mul(scale)
    })
}

pub fn product_with_channels(instrument: &str, channels: &[(&str, Array2<u16>)]) -> ImageProducts {
    let mut product = ImageProducts::new(instrument);
    for (name, image) in channels {
        product
            .push_image(
                ImageHolder::builder()
                    .channel_name(*name)
                    .image(image.clone())
                    .build(),
            )
            .unwrap();
    }
    product
}
