//! End-to-end benchmark run: build, verify, sweep

use ndarray_rand::rand::rngs::StdRng;
use ndarray_rand::rand::SeedableRng;
use tracing::{debug, info};

use crate::backends::{EmbeddingBackend, EmbeddingCollection};
use crate::config::BenchConfig;
use crate::error::Result;
use crate::layout::{random_batch, JaggedLayout};
use crate::oracle::{verify_forward, Tolerance};
use crate::sweep::{
    forward_grid, run_adagrad_sweep, run_forward_sweep, run_sgd_sweep, Measurement, SweepContext,
};

/// Result of one benchmark run
#[derive(Debug, Clone, PartialEq)]
pub struct BenchReport {
    /// Run parameters
    pub config: BenchConfig,
    /// Backend name
    pub backend: String,
    /// Forward points, in grid order
    pub forward: Vec<Measurement>,
    /// SGD points, in grid order
    pub sgd: Vec<Measurement>,
    /// Adagrad points, in grid order
    pub adagrad: Vec<Measurement>,
}

impl BenchReport {
    /// Every measurement in the order it was taken
    pub fn measurements(&self) -> impl Iterator<Item = &Measurement> {
        self.forward.iter().chain(&self.sgd).chain(&self.adagrad)
    }
}

/// Run the full benchmark against `backend`
///
/// The forward kernel is verified across the forward grid before anything is
/// timed; a correctness violation aborts the run.
pub fn run_benchmark<B: EmbeddingBackend>(backend: &B, config: &BenchConfig) -> Result<BenchReport> {
    config.validate()?;

    let mut collection = backend.create_collection(&config.collection())?;
    info!(
        "Embedding parameters: {:.2} GParam, {} backend, {}",
        collection.num_parameters() as f64 / 1.0e9,
        backend.name(),
        config.precision
    );

    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let dense = random_batch(
        config.batch_size,
        config.num_tables,
        config.bag_size,
        config.num_embeddings,
        &mut rng,
    )?;
    let layout = JaggedLayout::from_dense(&dense)?;
    layout.validate(config.bag_size)?;
    let summary = layout.summary();
    debug!(
        "indices: len {}, min {}, max {}; offsets: {}",
        summary.len,
        summary.min,
        summary.max,
        layout.offsets().len()
    );
    let mut batch = backend.upload(&layout)?;

    let y0 = verify_forward(
        backend,
        &collection,
        &batch,
        config.bag_size,
        forward_grid(),
        Tolerance::for_precision(config.precision),
    )?;
    info!("Forward verified across {} configurations", forward_grid().count());

    let ctx = SweepContext {
        shape: config.shape(),
        num_embeddings: config.num_embeddings,
        precision: config.precision,
        iters: config.iters,
    };
    let forward = run_forward_sweep(backend, &ctx, &collection, &mut batch)?;

    let grad_output = backend.random_like(&y0)?;
    let sgd = run_sgd_sweep(backend, &ctx, &grad_output, &mut collection, &mut batch)?;
    let adagrad = run_adagrad_sweep(backend, &ctx, &grad_output, &mut collection, &mut batch)?;

    Ok(BenchReport {
        config: config.clone(),
        backend: backend.name().to_string(),
        forward,
        sgd,
        adagrad,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::HostBackend;
    use crate::error::BenchError;
    use crate::sweep::Operation;

    fn small_config() -> BenchConfig {
        BenchConfig {
            batch_size: 4,
            num_tables: 2,
            num_embeddings: 100,
            bag_size: 3,
            embedding_dim: 8,
            iters: 2,
            seed: Some(7),
            ..BenchConfig::default()
        }
    }

    #[test]
    fn test_run_benchmark_small() {
        let backend = HostBackend::with_seed(7);
        let report = run_benchmark(&backend, &small_config()).unwrap();
        assert_eq!(report.backend, "host");
        assert_eq!(report.forward.len(), 16);
        assert_eq!(report.sgd.len(), 12);
        assert_eq!(report.adagrad.len(), 12);
        assert_eq!(report.measurements().count(), 40);
        assert!(report
            .measurements()
            .all(|m| m.time_per_iter_s > 0.0 && m.bandwidth_gbps > 0.0));
        assert!(report.forward.iter().all(|m| m.operation == Operation::Forward));
    }

    #[test]
    fn test_run_benchmark_rejects_invalid_config() {
        let backend = HostBackend::with_seed(7);
        let config = BenchConfig {
            iters: 0,
            ..small_config()
        };
        assert!(matches!(
            run_benchmark(&backend, &config),
            Err(BenchError::InvalidArgument(_))
        ));
    }
}
