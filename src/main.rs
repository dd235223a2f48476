use half::f16;
use ndarray::Array2;
use rand::prelude::*;
use tilemm::{DType, KernelConfig, MatmulKernel, PlatformConfig, Result};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // Two partitions, 8 N tiles each, one M tile, double-buffered K loop.
    let config = KernelConfig::new(16, 64, 1024, DType::F16)
        .with_tiles(16, 64, 32)
        .with_pipeline(1, 1, 2);
    let kernel = MatmulKernel::<f16>::build(config, PlatformConfig::default())?;

    let a = Array2::from_shape_fn((16, 64), |(i, j)| f16::from_f32(((i + j) % 7) as f32));
    let b = Array2::from_shape_fn((64, 1024), |(i, j)| f16::from_f32(((i * j) % 5) as f32));
    let (c, stats) = kernel.run_with_stats(a.view(), b.view())?;

    let expected = a.mapv(f32::from).dot(&b.mapv(f32::from));
    let max_err = c
        .iter()
        .zip(expected.iter())
        .map(|(x, y)| (x - y).abs())
        .fold(0.0f32, f32::max);
    println!("C[0, 0..4] = {:?}", c.row(0).iter().take(4).collect::<Vec<_>>());
    println!("max abs error vs reference: {max_err}");
    println!("{stats:#?}");

    // Same shapes, int8, narrow transfer span to exercise per-burst staging.
    let mut rng = StdRng::seed_from_u64(42);
    let a8 = Array2::from_shape_fn((32, 128), |_| rng.random_range(-8i8..8));
    let b8 = Array2::from_shape_fn((128, 512), |_| rng.random_range(-8i8..8));
    let platform = PlatformConfig::default().with_max_transfer_span(64);
    let kernel8 = MatmulKernel::<i8>::build(
        KernelConfig::new(32, 128, 512, DType::I8)
            .with_tiles(16, 64, 64)
            .with_pipeline(2, 2, 2),
        platform,
    )?;
    let (c8, stats8) = kernel8.run_with_stats(a8.view(), b8.view())?;
    let matches = c8 == a8.mapv(i32::from).dot(&b8.mapv(i32::from));
    println!(
        "int8: exact match = {matches}, split stages = {}, transfers = {}",
        stats8.transfers.split_stages, stats8.transfers.transfers
    );

    Ok(())
}
