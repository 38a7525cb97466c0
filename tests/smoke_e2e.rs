//! End-to-end smoke tests on the host backend
//!
//! # Running
//! ```bash
//! cargo test --test smoke_e2e -- --nocapture
//! cargo test --test smoke_e2e --features gpu -- --nocapture
//! ```

use tbe_bench::sweep::forward_grid;
use tbe_bench::{
    random_batch, run_benchmark, verify_forward, BenchConfig, CollectionConfig, EmbeddingBackend,
    HostBackend, JaggedLayout, Operation, Precision, Stream, Tolerance,
};

use ndarray_rand::rand::rngs::StdRng;
use ndarray_rand::rand::SeedableRng;

fn small_config(precision: Precision, embedding_dim: usize) -> BenchConfig {
    BenchConfig {
        batch_size: 4,
        num_tables: 2,
        num_embeddings: 100,
        bag_size: 3,
        embedding_dim,
        iters: 3,
        precision,
        managed: false,
        seed: Some(11),
    }
}

// ============================================================================
// LAYOUT
// ============================================================================

#[test]
fn smoke_layout_b4_t2_l3() {
    let mut rng = StdRng::seed_from_u64(0);
    let batch = random_batch(4, 2, 3, 100, &mut rng).unwrap();
    let layout = JaggedLayout::from_dense(&batch).unwrap();
    assert_eq!(layout.indices().len(), 24);
    assert_eq!(layout.offsets(), &[0, 3, 6, 9, 12, 15, 18, 21, 24]);
    assert!(layout.indices().iter().all(|&i| i < 99));
    layout.validate(3).unwrap();
}

// ============================================================================
// ORACLE
// ============================================================================

#[test]
fn smoke_oracle_passes_every_forward_configuration() {
    for precision in [Precision::Fp32, Precision::Fp16] {
        for embedding_dim in [8, 32] {
            let config = small_config(precision, embedding_dim);
            let backend = HostBackend::with_seed(5);
            let collection = backend.create_collection(&config.collection()).unwrap();

            let mut rng = StdRng::seed_from_u64(5);
            let dense = random_batch(4, 2, 3, 100, &mut rng).unwrap();
            let batch = backend
                .upload(&JaggedLayout::from_dense(&dense).unwrap())
                .unwrap();

            let y0 = verify_forward(
                &backend,
                &collection,
                &batch,
                3,
                forward_grid(),
                Tolerance::for_precision(precision),
            )
            .unwrap_or_else(|e| panic!("{precision} D={embedding_dim}: {e}"));
            assert_eq!(y0.shape(), [4, 2, embedding_dim]);
        }
    }
}

// ============================================================================
// FULL RUN
// ============================================================================

#[test]
fn smoke_full_run_fp32_and_fp16() {
    for precision in [Precision::Fp32, Precision::Fp16] {
        let config = small_config(precision, 8);
        let report = run_benchmark(&HostBackend::with_seed(1), &config).unwrap();

        assert_eq!(report.forward.len(), 16);
        assert_eq!(report.sgd.len(), 12);
        assert_eq!(report.adagrad.len(), 12);

        let bytes = precision.bytes() * 4 * 2 * 3 * 8;
        for m in &report.forward {
            assert_eq!(m.bytes_moved, bytes);
            assert!(m.time_per_iter_s > 0.0);
        }
        for m in report.sgd.iter().chain(&report.adagrad) {
            assert_eq!(m.bytes_moved, 2 * bytes);
            assert!(m.time_per_iter_s > 0.0);
        }
    }
}

#[test]
fn smoke_timed_calls_refresh_indices_once_each() {
    let config = small_config(Precision::Fp32, 8);
    let backend = HostBackend::with_seed(2);
    run_benchmark(&backend, &config).unwrap();

    // Oracle: 17 forward launches (baseline + grid). Each sweep point: warm-up
    // plus `iters` calls, two launches per call (refresh + kernel).
    let per_point = 2 * (config.iters as u64 + 1);
    let expected = 17 + (16 + 12 + 12) * per_point;
    assert_eq!(backend.stream().launches(), expected);
}

#[test]
fn smoke_reports_follow_grid_order() {
    let report = run_benchmark(
        &HostBackend::with_seed(3),
        &small_config(Precision::Fp32, 8),
    )
    .unwrap();

    let forward: Vec<_> = report.forward.iter().map(|m| m.config).collect();
    assert_eq!(forward, forward_grid().collect::<Vec<_>>());

    let adagrad: Vec<_> = report.adagrad.iter().map(|m| m.operation).collect();
    for pair in adagrad.chunks(2) {
        assert_eq!(
            pair,
            [
                Operation::BackwardAdagradNonStochastic,
                Operation::BackwardAdagradStochastic
            ]
        );
    }
}

#[test]
fn smoke_out_of_range_index_aborts_at_synchronize() {
    let backend = HostBackend::with_seed(4);
    let config = CollectionConfig {
        num_embeddings: 10,
        ..small_config(Precision::Fp32, 8).collection()
    };
    let collection = backend.create_collection(&config).unwrap();
    let layout = JaggedLayout::from_parts(vec![1, 2, 3, 4, 50, 6], vec![0, 3, 6]).unwrap();
    let batch = backend.upload(&layout).unwrap();

    let result = verify_forward(
        &backend,
        &collection,
        &batch,
        3,
        forward_grid(),
        Tolerance::for_precision(Precision::Fp32),
    );
    assert!(matches!(
        result,
        Err(tbe_bench::BenchError::DeviceExecution(_))
    ));
}
