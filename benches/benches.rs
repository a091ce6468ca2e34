use ndarray::Array2;
use rand::Rng;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use satproducts::{
    composite::{make_composite, CompositeOptions, ImageCompositeCfg},
    expr::Expression,
    product::{ImageHolder, ImageProducts, ProjectionConfig},
    projection::correct_channel,
};

const HEIGHT: usize = 256;
const WIDTH: usize = 2048;

fn random_product() -> ImageProducts {
    let mut rng = rand::thread_rng();
    let mut product = ImageProducts::new("AVHRR");
    for name in ["1", "2", "4"] {
        let image = Array2::from_shape_simple_fn((HEIGHT, WIDTH), || rng.gen::<u16>());
        product
            .push_image(ImageHolder::builder().channel_name(name).image(image).build())
            .unwrap();
    }
    product.set_projection(ProjectionConfig::new(2900.0, 1.0, 833.0));
    product
}

fn bench_expression(c: &mut Criterion) {
    let expr = Expression::parse("clamp((ch2 - ch1) / (ch2 + ch1), 0, 1) ^ 0.8", &["ch1", "ch2"])
        .unwrap();
    let values = [0.25, 0.75];

    let mut group = c.benchmark_group("expression");
    group.bench_function("eval", |b| {
        b.iter(|| expr.eval(&values));
    });
    group.finish();
}

fn bench_composite_equation(c: &mut Criterion) {
    let product = random_product();
    let cfg = ImageCompositeCfg::from_json(r#"{"equation": "ch2, ch2, ch1 * 0.8 + ch4 * 0.2"}"#)
        .unwrap();

    let mut group = c.benchmark_group("composite");
    group.throughput(Throughput::Elements((HEIGHT * WIDTH) as u64));
    group.sample_size(20);
    group.bench_function("equation_rgb", |b| {
        b.iter(|| make_composite(&product, &cfg, &CompositeOptions::default()).unwrap());
    });

    let cfg = ImageCompositeCfg {
        white_balance: true,
        equalize: true,
        ..cfg
    };
    group.bench_function("equation_rgb_postprocess", |b| {
        b.iter(|| make_composite(&product, &cfg, &CompositeOptions::default()).unwrap());
    });
    group.finish();
}

fn bench_correction(c: &mut Criterion) {
    let product = random_product();

    let mut group = c.benchmark_group("projection");
    group.throughput(Throughput::Elements((HEIGHT * WIDTH) as u64));
    group.bench_function("correct_channel", |b| {
        b.iter(|| {
            let zult = correct_channel(&product, 0, false);
            assert!(zult.success);
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_expression,
    bench_composite_equation,
    bench_correction,
);
criterion_main!(benches);
