//! tbe-bench: Table-Batched Embedding Kernel Benchmark
//!
//! **tbe-bench** measures the effective memory bandwidth of table-batched
//! embedding-bag kernels (pooled lookup, SGD update, approximate row-wise
//! Adagrad update) across a grid of launch configurations:
//!
//! 1. **Layout** - synthetic `(B, T, L)` index batch flattened to a jagged layout
//! 2. **Oracle** - every forward configuration must match the `(1, false)` baseline
//! 3. **Sweep** - each configuration is timed with device events and reported in GB/s
//!
//! # Design Principles
//!
//! - **Backend agnostic**: kernels sit behind [`EmbeddingBackend`]; a host
//!   reference backend is always available, wgpu behind the `gpu` feature
//! - **Asynchronous faults**: device errors surface at synchronization, never at enqueue
//! - **Fatal errors**: no retries, no skipped configurations
//!
//! # Quick Start
//!
//! ```rust
//! use tbe_bench::{run_benchmark, BenchConfig, HostBackend};
//!
//! let config = BenchConfig {
//!     batch_size: 4,
//!     num_tables: 2,
//!     num_embeddings: 100,
//!     bag_size: 3,
//!     embedding_dim: 8,
//!     iters: 2,
//!     seed: Some(0),
//!     ..BenchConfig::default()
//! };
//! let report = run_benchmark(&HostBackend::with_seed(0), &config).unwrap();
//! assert_eq!(report.forward.len(), 16);
//! ```

pub mod backends;
pub mod bench;
pub mod config;
pub mod error;
pub mod layout;
pub mod oracle;
pub mod remote;
pub mod sweep;
pub mod timing;

pub use backends::{EmbeddingBackend, EmbeddingCollection, HostBackend, OutputTensor, Stream};
pub use bench::{run_benchmark, BenchReport};
pub use config::{BenchConfig, CollectionConfig, Optimizer, Precision, ProblemShape};
pub use error::{BenchError, Result};
pub use layout::{random_batch, JaggedLayout};
pub use oracle::{verify_forward, Tolerance};
pub use sweep::{KernelConfig, Measurement, Operation};
pub use timing::benchmark_fn;
