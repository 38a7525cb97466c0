//! Error types for tbe-bench operations

use thiserror::Error;

use crate::sweep::{KernelConfig, Operation};

/// Result type for tbe-bench operations
pub type Result<T> = std::result::Result<T, BenchError>;

/// Errors that can occur while building, verifying or timing a benchmark run
///
/// Every variant is fatal for the current run: nothing in the harness retries
/// or skips a configuration after an error.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BenchError {
    /// Index batch is not (B, T, L)
    #[error("Invalid batch shape: expected 3 dimensions (B, T, L), got {0:?}")]
    InvalidShape(Vec<usize>),

    /// Invalid argument (zero sizes, zero iterations, overflowing layouts)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A swept configuration disagrees with the baseline forward output
    #[error(
        "Correctness violation: {operation} {config} differs from baseline at element {index} \
         (expected {expected}, got {actual})"
    )]
    CorrectnessViolation {
        /// Operation under test
        operation: Operation,
        /// Offending configuration
        config: KernelConfig,
        /// Flat index of the first mismatching element
        index: usize,
        /// Baseline value
        expected: f32,
        /// Value produced by `config`
        actual: f32,
    },

    /// A swept configuration produced an output of a different shape
    #[error("Output shape mismatch for {config}: expected {expected:?}, got {actual:?}")]
    OutputShapeMismatch {
        /// Offending configuration
        config: KernelConfig,
        /// Baseline shape
        expected: [usize; 3],
        /// Shape produced by `config`
        actual: [usize; 3],
    },

    /// Asynchronous device fault, reported at a synchronization point
    #[error("Device execution error: {0}")]
    DeviceExecution(String),

    /// No usable device for the selected backend
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Device events produced an elapsed time that is not positive
    #[error("Invalid timing: elapsed {elapsed_ns} ns over {iters} iterations")]
    InvalidTiming {
        /// Elapsed time between start and end events
        elapsed_ns: u128,
        /// Iteration count of the timed run
        iters: usize,
    },

    /// Remote job failed, as reported by the job facility
    #[error("Remote job {job_id} failed: {reason}")]
    RemoteJob {
        /// Job identifier
        job_id: String,
        /// Failure description (exit status, launch error, timeout)
        reason: String,
    },

    /// Feature not supported by the selected backend
    #[error("Unsupported: {0}")]
    Unsupported(String),
}
