mod common;

use crossbeam::channel::unbounded;
use ndarray::{Array2, Axis};

use common::{gradient, product_with_channels};
use satproducts::{
    composite::{make_composite, CompositeOptions, ImageCompositeCfg},
    product::{ImageProducts, ProjectionConfig},
    projection::{correct_channel, correct_image},
    raster::read_gray16,
    Error,
};

#[test]
fn test_composite_from_reloaded_product() {
    let tmpdir = tempfile::tempdir().unwrap();
    let mut product = product_with_channels(
        "AVHRR",
        &[("1", gradient(8, 64, 17)), ("2", gradient(8, 64, 13))],
    );
    product.set_timestamps(vec![10.0; 8]);
    let path = product.save(tmpdir.path().join("product"), true).unwrap();
    let loaded = ImageProducts::load(path).unwrap();

    let cfg = ImageCompositeCfg::from_json(r#"{"equation": "ch2, ch2, ch1", "invert": false}"#)
        .unwrap();
    let (tx, rx) = unbounded();
    let opts = CompositeOptions::builder().progress(tx).build();
    let composite = make_composite(&loaded, &cfg, &opts).unwrap();
    drop(opts);

    assert_eq!(composite.image.dim(), (3, 8, 64));
    assert_eq!(composite.image.index_axis(Axis(0), 2), product.image(0).unwrap().image);
    assert_eq!(composite.image.index_axis(Axis(0), 0), product.image(1).unwrap().image);
    assert_eq!(composite.timestamps, vec![10.0; 8]);
    assert_eq!(rx.iter().last(), Some(1.0));

    let out = composite.save(tmpdir.path(), "rgb221").unwrap();
    assert!(out.exists());
    assert!(out.with_extension("json").exists());
}

#[test]
fn test_composite_failure_keeps_source() {
    let product = product_with_channels("VIIRS", &[("I1", gradient(4, 4, 1))]);
    let before = product.image(0).unwrap().image.clone();

    let cfg = ImageCompositeCfg::from_json(r#"{"lut": "missing.png", "lut_channels": "I1"}"#)
        .unwrap();
    let zult = make_composite(&product, &cfg, &CompositeOptions::default());
    assert!(matches!(zult, Err(Error::Image(_)) | Err(Error::Io(_))), "got {zult:?}");
    assert_eq!(product.image(0).unwrap().image, before);
}

#[test]
fn test_correct_every_channel_and_composite() {
    let tmpdir = tempfile::tempdir().unwrap();
    let mut product = product_with_channels(
        "MHS",
        &[("1", gradient(6, 90, 100)), ("2", gradient(6, 90, 50))],
    );
    assert!(!correct_channel(&product, 0, false).success);

    product.set_projection(ProjectionConfig::new(2180.0, 16.0, 850.0));
    assert!(product.can_geometrically_correct());

    for idx in 0..product.len() {
        let zult = correct_channel(&product, idx, true);
        assert!(zult.success);
        assert_eq!(zult.image.dim(), (6, 136));
        let table = zult.table.unwrap();
        assert_eq!(table.forward.len(), 136);
        assert_eq!(table.reverse.len(), 90);
    }

    let cfg = ImageCompositeCfg::from_json(r#"{"equation": "(ch1 + ch2) / 2"}"#).unwrap();
    let composite = make_composite(&product, &cfg, &CompositeOptions::default()).unwrap();
    let plane = composite.image.index_axis(Axis(0), 0);
    let corrected = correct_image(&product, plane, None, false);
    assert!(corrected.success);
    assert_eq!(corrected.image.ncols(), 136);

    let path = tmpdir.path().join("corrected.png");
    satproducts::raster::write_gray16(&path, corrected.image.view()).unwrap();
    let back: Array2<u16> = read_gray16(&path).unwrap();
    assert_eq!(back, corrected.image);
}
