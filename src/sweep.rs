//! Kernel configuration sweeps
//!
//! Each operation is timed over a fixed grid of launch configurations. Grids
//! are the Cartesian product of a block-size list (outer) and a boolean flag
//! list (inner), enumerated in declaration order.
//!
//! | Operation | Block sizes        | Flag                        | Points |
//! |-----------|--------------------|-----------------------------|--------|
//! | Forward   | 1, 2, ..., 128     | shared memory `true, false` | 16     |
//! | SGD       | 1, 2, ..., 32      | shared memory `true, false` | 12     |
//! | Adagrad   | 1, 2, ..., 32      | stochastic `false, true`    | 12     |

use std::fmt;

use tracing::info;

use crate::backends::EmbeddingBackend;
use crate::config::{Precision, ProblemShape};
use crate::error::Result;
use crate::timing::benchmark_fn;

/// Forward block sizes
pub const FORWARD_BLOCK_SIZES: [u32; 8] = [1, 2, 4, 8, 16, 32, 64, 128];

/// SGD and Adagrad block sizes
pub const BACKWARD_BLOCK_SIZES: [u32; 6] = [1, 2, 4, 8, 16, 32];

/// Shared-memory staging options
pub const SHARED_MEMORY_OPTIONS: [bool; 2] = [true, false];

/// Stochastic rounding options
pub const STOCHASTIC_ROUNDING_OPTIONS: [bool; 2] = [false, true];

/// Learning rate of the timed backward calls
pub const SWEEP_LEARNING_RATE: f32 = 0.05;

/// Adagrad epsilon of the timed backward calls
pub const SWEEP_EPS: f32 = 0.01;

/// Benchmarked kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Pooled lookup
    Forward,
    /// SGD update
    BackwardSgd,
    /// Approximate row-wise Adagrad, round-to-nearest
    BackwardAdagradNonStochastic,
    /// Approximate row-wise Adagrad, stochastic rounding
    BackwardAdagradStochastic,
}

impl Operation {
    /// Adagrad variant for a stochastic rounding flag
    #[must_use]
    pub fn adagrad(stochastic_rounding: bool) -> Self {
        if stochastic_rounding {
            Self::BackwardAdagradStochastic
        } else {
            Self::BackwardAdagradNonStochastic
        }
    }

    /// Bytes touched per looked-up element, in units of the weight size
    ///
    /// Forward reads each row once; backward reads and writes it.
    #[must_use]
    pub const fn traffic_multiplier(self) -> u64 {
        match self {
            Self::Forward => 1,
            _ => 2,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Forward => "Forward",
            Self::BackwardSgd => "Backward-SGD",
            Self::BackwardAdagradNonStochastic => "Backward-ADAGRAD-nonstochastic",
            Self::BackwardAdagradStochastic => "Backward-ADAGRAD-stochastic",
        };
        f.write_str(name)
    }
}

/// Launch configuration of one sweep point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelConfig {
    /// Bags handled per block
    pub block_size: u32,
    /// Shared-memory staging; `None` for kernels without the option
    pub use_shared_memory: Option<bool>,
}

impl KernelConfig {
    /// Configuration of a kernel with a shared-memory option
    #[must_use]
    pub const fn new(block_size: u32, use_shared_memory: bool) -> Self {
        Self {
            block_size,
            use_shared_memory: Some(use_shared_memory),
        }
    }

    /// Configuration of a kernel without a shared-memory option
    #[must_use]
    pub const fn without_shared_memory(block_size: u32) -> Self {
        Self {
            block_size,
            use_shared_memory: None,
        }
    }

    /// Reference configuration the oracle compares against
    #[must_use]
    pub const fn baseline() -> Self {
        Self::new(1, false)
    }

    /// Shared-memory flag, `false` when the kernel has none
    #[must_use]
    pub fn shared_memory(&self) -> bool {
        self.use_shared_memory.unwrap_or(false)
    }
}

impl fmt::Display for KernelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.use_shared_memory {
            Some(shmem) => write!(f, "({}, {shmem})", self.block_size),
            None => write!(f, "({})", self.block_size),
        }
    }
}

/// Cartesian product of `block_sizes` (outer) and `flags` (inner)
pub fn grid(
    block_sizes: &'static [u32],
    flags: &'static [bool],
) -> impl Iterator<Item = (u32, bool)> + Clone {
    block_sizes
        .iter()
        .flat_map(move |&block_size| flags.iter().map(move |&flag| (block_size, flag)))
}

/// Forward sweep points
pub fn forward_grid() -> impl Iterator<Item = KernelConfig> + Clone {
    grid(&FORWARD_BLOCK_SIZES, &SHARED_MEMORY_OPTIONS)
        .map(|(block_size, shmem)| KernelConfig::new(block_size, shmem))
}

/// SGD sweep points
pub fn sgd_grid() -> impl Iterator<Item = KernelConfig> + Clone {
    grid(&BACKWARD_BLOCK_SIZES, &SHARED_MEMORY_OPTIONS)
        .map(|(block_size, shmem)| KernelConfig::new(block_size, shmem))
}

/// Adagrad sweep points, each tagged with its rounding variant
pub fn adagrad_grid() -> impl Iterator<Item = (Operation, KernelConfig)> + Clone {
    grid(&BACKWARD_BLOCK_SIZES, &STOCHASTIC_ROUNDING_OPTIONS).map(|(block_size, stochastic)| {
        (
            Operation::adagrad(stochastic),
            KernelConfig::without_shared_memory(block_size),
        )
    })
}

/// Bytes moved by one call of `operation`
#[must_use]
pub fn bytes_moved(operation: Operation, precision: Precision, shape: &ProblemShape) -> u64 {
    operation.traffic_multiplier()
        * precision.bytes()
        * shape.lookups()
        * shape.embedding_dim as u64
}

/// Effective bandwidth in GB/s
#[must_use]
pub fn bandwidth_gbps(bytes: u64, time_per_iter_s: f64) -> f64 {
    bytes as f64 / time_per_iter_s / 1.0e9
}

/// One timed sweep point
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    /// Timed kernel
    pub operation: Operation,
    /// Launch configuration
    pub config: KernelConfig,
    /// Mean seconds per call
    pub time_per_iter_s: f64,
    /// Bytes moved per call
    pub bytes_moved: u64,
    /// `bytes_moved / time_per_iter_s / 1e9`
    pub bandwidth_gbps: f64,
}

impl Measurement {
    fn new(
        operation: Operation,
        config: KernelConfig,
        precision: Precision,
        shape: &ProblemShape,
        time_per_iter_s: f64,
    ) -> Self {
        let bytes = bytes_moved(operation, precision, shape);
        Self {
            operation,
            config,
            time_per_iter_s,
            bytes_moved: bytes,
            bandwidth_gbps: bandwidth_gbps(bytes, time_per_iter_s),
        }
    }

    /// Time per call in microseconds
    #[must_use]
    pub fn time_us(&self) -> f64 {
        self.time_per_iter_s * 1.0e6
    }
}

/// Sizes and iteration count shared by every sweep of a run
#[derive(Debug, Clone, Copy)]
pub struct SweepContext {
    /// (B, T, L, D)
    pub shape: ProblemShape,
    /// Rows per table (E)
    pub num_embeddings: usize,
    /// Weight precision
    pub precision: Precision,
    /// Timed calls per point
    pub iters: usize,
}

impl SweepContext {
    /// Report line of one sweep point
    ///
    /// `Forward, B: 128 (16, true), E: 10000, T: 64, D: 32, L: 32, BW:  33.55GB/s, T: 1000us`
    #[must_use]
    pub fn log_line(&self, m: &Measurement) -> String {
        format!(
            "{}, B: {} {}, E: {}, T: {}, D: {}, L: {}, BW: {}GB/s, T: {:.0}us",
            m.operation,
            self.shape.batch_size,
            m.config,
            self.num_embeddings,
            self.shape.num_tables,
            self.shape.embedding_dim,
            self.shape.bag_size,
            SpaceSigned(m.bandwidth_gbps),
            m.time_us()
        )
    }

    fn record(&self, operation: Operation, config: KernelConfig, time_per_iter_s: f64) -> Measurement {
        let m = Measurement::new(operation, config, self.precision, &self.shape, time_per_iter_s);
        info!("{}", self.log_line(&m));
        m
    }
}

/// Two decimals with a blank in place of the plus sign
struct SpaceSigned(f64);

impl fmt::Display for SpaceSigned {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_sign_negative() {
            write!(f, "{:.2}", self.0)
        } else {
            write!(f, " {:.2}", self.0)
        }
    }
}

/// Time the forward kernel at every forward grid point
///
/// Indices are refreshed once per timed call.
pub fn run_forward_sweep<B: EmbeddingBackend>(
    backend: &B,
    ctx: &SweepContext,
    collection: &B::Collection,
    batch: &mut B::Batch,
) -> Result<Vec<Measurement>> {
    forward_grid()
        .map(|config| {
            let t = benchmark_fn(backend.stream(), ctx.iters, || {
                backend.refresh_indices(batch, ctx.num_embeddings)?;
                backend.forward(
                    collection,
                    batch,
                    ctx.shape.bag_size,
                    config.block_size,
                    config.shared_memory(),
                )?;
                Ok(())
            })?;
            Ok(ctx.record(Operation::Forward, config, t))
        })
        .collect()
}

/// Time the SGD update at every SGD grid point
pub fn run_sgd_sweep<B: EmbeddingBackend>(
    backend: &B,
    ctx: &SweepContext,
    grad_output: &B::Output,
    collection: &mut B::Collection,
    batch: &mut B::Batch,
) -> Result<Vec<Measurement>> {
    let mut measurements = Vec::with_capacity(BACKWARD_BLOCK_SIZES.len() * 2);
    for config in sgd_grid() {
        let t = benchmark_fn(backend.stream(), ctx.iters, || {
            backend.refresh_indices(batch, ctx.num_embeddings)?;
            backend.backward_sgd(
                grad_output,
                collection,
                batch,
                SWEEP_LEARNING_RATE,
                ctx.shape.bag_size,
                config.block_size,
                config.shared_memory(),
            )
        })?;
        measurements.push(ctx.record(Operation::BackwardSgd, config, t));
    }
    Ok(measurements)
}

/// Time the approximate row-wise Adagrad update at every Adagrad grid point
pub fn run_adagrad_sweep<B: EmbeddingBackend>(
    backend: &B,
    ctx: &SweepContext,
    grad_output: &B::Output,
    collection: &mut B::Collection,
    batch: &mut B::Batch,
) -> Result<Vec<Measurement>> {
    let mut measurements = Vec::with_capacity(BACKWARD_BLOCK_SIZES.len() * 2);
    for (operation, config) in adagrad_grid() {
        let stochastic = operation == Operation::BackwardAdagradStochastic;
        let t = benchmark_fn(backend.stream(), ctx.iters, || {
            backend.refresh_indices(batch, ctx.num_embeddings)?;
            backend.backward_approx_adagrad(
                grad_output,
                collection,
                batch,
                SWEEP_LEARNING_RATE,
                SWEEP_EPS,
                ctx.shape.bag_size,
                stochastic,
                config.block_size,
            )
        })?;
        measurements.push(ctx.record(operation, config, t));
    }
    Ok(measurements)
}
