//! Embedding kernel backends
//!
//! The harness never touches weights, indices or outputs directly. It drives
//! a backend through [`EmbeddingBackend`], which owns the device-resident
//! tensors and an in-order [`Stream`] used for timing.
//!
//! # Backends
//!
//! - `host`: reference kernels with in-order queue semantics (always built)
//! - `gpu`: wgpu compute kernels with timestamp queries (`gpu` feature)

use std::time::Duration;

use crate::config::CollectionConfig;
use crate::error::{BenchError, Result};
use crate::layout::JaggedLayout;

pub mod host;

#[cfg(feature = "gpu")]
pub mod gpu;

pub use host::{HostBackend, HostStream};

/// In-order device command queue
///
/// Work enqueued on a stream executes in submission order. Errors raised by
/// enqueued work are asynchronous: they are reported by the next
/// [`Stream::synchronize`], never by the call that enqueued the work.
pub trait Stream {
    /// Device-side timestamp marker
    type Event;

    /// Enqueue a timestamp marker behind all previously enqueued work
    fn record_event(&self) -> Result<Self::Event>;

    /// Block until all enqueued work has completed
    ///
    /// # Errors
    ///
    /// Returns `Err(BenchError::DeviceExecution)` if enqueued work faulted.
    fn synchronize(&self) -> Result<()>;

    /// Time between two recorded events
    ///
    /// Only valid after a [`Stream::synchronize`] that follows `end`.
    fn elapsed(&self, start: &Self::Event, end: &Self::Event) -> Result<Duration>;
}

/// Table-batched embedding collection (weights, row offsets, optimizer state)
pub trait EmbeddingCollection {
    /// Construction parameters
    fn config(&self) -> &CollectionConfig;

    /// Number of weight elements (T × E × D)
    fn num_parameters(&self) -> usize {
        self.config().num_parameters()
    }
}

/// Kernel primitive and collection factory consumed by the harness
///
/// `collection` bundles the weights and per-table row offsets, `batch`
/// bundles the device copies of `indices` and `offsets`.
pub trait EmbeddingBackend {
    /// Command queue all kernels are enqueued on
    type Stream: Stream;
    /// Device-resident collection
    type Collection: EmbeddingCollection;
    /// Device-resident indices and offsets
    type Batch;
    /// Device-resident `[B, T, D]` tensor
    type Output;

    /// Backend name for logging
    fn name(&self) -> &str;

    /// The stream every kernel of this backend runs on
    fn stream(&self) -> &Self::Stream;

    /// Allocate and initialise a collection
    fn create_collection(&self, config: &CollectionConfig) -> Result<Self::Collection>;

    /// Copy a jagged layout into device memory
    fn upload(&self, layout: &JaggedLayout) -> Result<Self::Batch>;

    /// Pooled lookup: `output[b, t, :] = sum of rows in bag (b, t)`
    fn forward(
        &self,
        collection: &Self::Collection,
        batch: &Self::Batch,
        bag_size: usize,
        block_size: u32,
        use_shared_memory: bool,
    ) -> Result<Self::Output>;

    /// In-place SGD update of every looked-up row
    #[allow(clippy::too_many_arguments)]
    fn backward_sgd(
        &self,
        grad_output: &Self::Output,
        collection: &mut Self::Collection,
        batch: &Self::Batch,
        learning_rate: f32,
        bag_size: usize,
        block_size: u32,
        use_shared_memory: bool,
    ) -> Result<()>;

    /// In-place approximate row-wise Adagrad update of weights and state
    #[allow(clippy::too_many_arguments)]
    fn backward_approx_adagrad(
        &self,
        grad_output: &Self::Output,
        collection: &mut Self::Collection,
        batch: &Self::Batch,
        learning_rate: f32,
        eps: f32,
        bag_size: usize,
        stochastic_rounding: bool,
        block_size: u32,
    ) -> Result<()>;

    /// Re-draw every index uniformly from `[0, num_embeddings - 1)` on the stream
    fn refresh_indices(&self, batch: &mut Self::Batch, num_embeddings: usize) -> Result<()>;

    /// Standard-normal tensor with the shape of `output`
    fn random_like(&self, output: &Self::Output) -> Result<Self::Output>;

    /// Copy an output back to the host (synchronizes the stream)
    fn to_host(&self, output: &Self::Output) -> Result<OutputTensor>;
}

/// Host copy of a `[B, T, D]` kernel output
#[derive(Debug, Clone, PartialEq)]
pub struct OutputTensor {
    shape: [usize; 3],
    data: Vec<f32>,
}

impl OutputTensor {
    /// Wrap `data` as a `[B, T, D]` tensor
    ///
    /// # Errors
    ///
    /// Returns `Err(BenchError::InvalidArgument)` if the element count does
    /// not match the shape.
    pub fn new(shape: [usize; 3], data: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(BenchError::InvalidArgument(format!(
                "tensor of shape {shape:?} needs {expected} elements, got {}",
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    /// Zero tensor
    #[must_use]
    pub fn zeros(shape: [usize; 3]) -> Self {
        Self {
            shape,
            data: vec![0.0; shape.iter().product()],
        }
    }

    /// `[B, T, D]`
    #[must_use]
    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    /// Row-major elements
    #[must_use]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub(crate) fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }
}

/// Reject launch geometries no kernel can run
pub(crate) fn check_block_size(block_size: u32) -> Result<()> {
    if block_size == 0 {
        return Err(BenchError::InvalidArgument(
            "block_size must be >= 1".to_string(),
        ));
    }
    Ok(())
}

/// Output shape `[B, T, D]` of a batch with `num_bags` bags
pub(crate) fn output_shape(
    num_bags: usize,
    num_tables: usize,
    embedding_dim: usize,
) -> Result<[usize; 3]> {
    if num_tables == 0 || num_bags % num_tables != 0 {
        return Err(BenchError::InvalidArgument(format!(
            "{num_bags} bags cannot be split across {num_tables} tables"
        )));
    }
    Ok([num_bags / num_tables, num_tables, embedding_dim])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_tensor_new_checks_len() {
        assert!(OutputTensor::new([2, 2, 2], vec![0.0; 8]).is_ok());
        assert!(OutputTensor::new([2, 2, 2], vec![0.0; 7]).is_err());
    }

    #[test]
    fn test_output_tensor_zeros() {
        let t = OutputTensor::zeros([4, 2, 8]);
        assert_eq!(t.shape(), [4, 2, 8]);
        assert_eq!(t.data().len(), 64);
        assert!(t.data().iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_check_block_size() {
        assert!(check_block_size(0).is_err());
        assert!(check_block_size(1).is_ok());
        assert!(check_block_size(128).is_ok());
    }

    #[test]
    fn test_output_shape() {
        assert_eq!(output_shape(8, 2, 16).unwrap(), [4, 2, 16]);
        assert!(output_shape(7, 2, 16).is_err());
        assert!(output_shape(4, 0, 16).is_err());
    }
}
