//! Host reference backend
//!
//! Runs the table-batched embedding kernels on the CPU while keeping device
//! queue semantics, so the harness behaves the same as against an
//! accelerator:
//!
//! - work is enqueued on a [`HostStream`] and executes in order
//! - a kernel fault (e.g. an out-of-range index) does not fail the enqueueing
//!   call; it poisons the stream and is reported by the next synchronize
//! - events are timestamps taken in queue order
//!
//! `block_size` and `use_shared_memory` change the traversal (bags per block,
//! staging rows into a scratch buffer) but never the summation order, so all
//! configurations produce bit-identical forward outputs.

use std::cell::{Cell, RefCell};
use std::time::{Duration, Instant};

use half::f16;
use ndarray_rand::rand_distr::{StandardNormal, Uniform};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{
    check_block_size, output_shape, EmbeddingBackend, EmbeddingCollection, OutputTensor, Stream,
};
use crate::config::{CollectionConfig, Precision};
use crate::error::{BenchError, Result};
use crate::layout::{index_upper_bound, JaggedLayout};

// ============================================================================
// Stream
// ============================================================================

/// In-order host queue with sticky asynchronous faults
#[derive(Debug, Default)]
pub struct HostStream {
    fault: RefCell<Option<String>>,
    launches: Cell<u64>,
    synchronizations: Cell<u64>,
}

/// Timestamp recorded in queue order
#[derive(Debug, Clone, Copy)]
pub struct HostEvent(Instant);

impl HostStream {
    /// Create an idle stream
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue `work`
    ///
    /// Work enqueued after a fault is skipped, as on a device whose context
    /// has been poisoned.
    pub fn enqueue<F>(&self, work: F)
    where
        F: FnOnce() -> std::result::Result<(), String>,
    {
        self.launches.set(self.launches.get() + 1);
        if self.fault.borrow().is_some() {
            return;
        }
        if let Err(message) = work() {
            *self.fault.borrow_mut() = Some(message);
        }
    }

    /// Whether enqueued work has faulted
    #[must_use]
    pub fn is_faulted(&self) -> bool {
        self.fault.borrow().is_some()
    }

    /// Number of enqueued work items
    #[must_use]
    pub fn launches(&self) -> u64 {
        self.launches.get()
    }

    /// Number of synchronize calls
    #[must_use]
    pub fn synchronizations(&self) -> u64 {
        self.synchronizations.get()
    }
}

impl Stream for HostStream {
    type Event = HostEvent;

    fn record_event(&self) -> Result<HostEvent> {
        Ok(HostEvent(Instant::now()))
    }

    fn synchronize(&self) -> Result<()> {
        self.synchronizations.set(self.synchronizations.get() + 1);
        match self.fault.borrow().as_ref() {
            Some(message) => Err(BenchError::DeviceExecution(message.clone())),
            None => Ok(()),
        }
    }

    fn elapsed(&self, start: &HostEvent, end: &HostEvent) -> Result<Duration> {
        Ok(end.0.saturating_duration_since(start.0))
    }
}

// ============================================================================
// Collection
// ============================================================================

/// Weight storage in the collection's precision
#[derive(Debug, Clone, PartialEq)]
pub enum HostWeights {
    /// 32-bit weights
    F32(Vec<f32>),
    /// 16-bit weights
    F16(Vec<f16>),
}

impl HostWeights {
    /// Number of weight elements
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::F32(w) => w.len(),
            Self::F16(w) => w.len(),
        }
    }

    /// Whether the storage is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element `i` widened to f32
    #[must_use]
    pub fn get(&self, i: usize) -> f32 {
        match self {
            Self::F32(w) => w[i],
            Self::F16(w) => w[i].to_f32(),
        }
    }

    /// Copy of all elements widened to f32
    #[must_use]
    pub fn to_f32_vec(&self) -> Vec<f32> {
        match self {
            Self::F32(w) => w.clone(),
            Self::F16(w) => w.iter().map(|x| x.to_f32()).collect(),
        }
    }

    fn add_row_into(&self, row: usize, out: &mut [f32]) {
        let dim = out.len();
        match self {
            Self::F32(w) => {
                for (o, x) in out.iter_mut().zip(&w[row * dim..(row + 1) * dim]) {
                    *o += x;
                }
            }
            Self::F16(w) => {
                for (o, x) in out.iter_mut().zip(&w[row * dim..(row + 1) * dim]) {
                    *o += x.to_f32();
                }
            }
        }
    }

    fn extend_row(&self, row: usize, dim: usize, staged: &mut Vec<f32>) {
        match self {
            Self::F32(w) => staged.extend_from_slice(&w[row * dim..(row + 1) * dim]),
            Self::F16(w) => staged.extend(w[row * dim..(row + 1) * dim].iter().map(|x| x.to_f32())),
        }
    }

    /// `w[row] += scale * g`, rounding reduced-precision results with `round`
    fn axpy_row<R>(&mut self, row: usize, scale: f32, g: &[f32], mut round: R)
    where
        R: FnMut(f32) -> f16,
    {
        let dim = g.len();
        match self {
            Self::F32(w) => {
                for (x, gd) in w[row * dim..(row + 1) * dim].iter_mut().zip(g) {
                    *x += scale * gd;
                }
            }
            Self::F16(w) => {
                for (x, gd) in w[row * dim..(row + 1) * dim].iter_mut().zip(g) {
                    *x = round(x.to_f32() + scale * gd);
                }
            }
        }
    }
}

/// Host-resident table-batched embedding collection
#[derive(Debug, Clone)]
pub struct HostCollection {
    config: CollectionConfig,
    weights: HostWeights,
    table_offsets: Vec<u32>,
    optimizer_state: Vec<f32>,
}

impl HostCollection {
    /// Weight storage, `T × E × D` row-major
    #[must_use]
    pub fn embedding_weights(&self) -> &HostWeights {
        &self.weights
    }

    /// First row of each table (`t × E`)
    #[must_use]
    pub fn table_offsets(&self) -> &[u32] {
        &self.table_offsets
    }

    /// Row-wise Adagrad accumulators, one per row
    #[must_use]
    pub fn optimizer_state(&self) -> &[f32] {
        &self.optimizer_state
    }
}

impl EmbeddingCollection for HostCollection {
    fn config(&self) -> &CollectionConfig {
        &self.config
    }
}

/// Host copy of a batch's indices and offsets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostBatch {
    indices: Vec<u32>,
    offsets: Vec<u32>,
}

impl HostBatch {
    /// Flat indices
    #[must_use]
    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    /// Bag offsets
    #[must_use]
    pub fn offsets(&self) -> &[u32] {
        &self.offsets
    }

    fn num_bags(&self) -> usize {
        self.offsets.len().saturating_sub(1)
    }
}

// ============================================================================
// Backend
// ============================================================================

/// Reference backend running every kernel on the host
#[derive(Debug)]
pub struct HostBackend {
    stream: HostStream,
    rng: RefCell<StdRng>,
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HostBackend {
    /// Backend seeded from OS entropy
    #[must_use]
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Backend with a reproducible RNG (weights, refresh, gradients, rounding)
    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            stream: HostStream::new(),
            rng: RefCell::new(rng),
        }
    }
}

impl EmbeddingBackend for HostBackend {
    type Stream = HostStream;
    type Collection = HostCollection;
    type Batch = HostBatch;
    type Output = OutputTensor;

    fn name(&self) -> &str {
        "host"
    }

    fn stream(&self) -> &HostStream {
        &self.stream
    }

    fn create_collection(&self, config: &CollectionConfig) -> Result<HostCollection> {
        config.validate()?;
        let bound = (1.0 / config.num_embeddings as f32).sqrt();
        let init = Uniform::new_inclusive(-bound, bound);
        let mut rng = self.rng.borrow_mut();
        let n = config.num_parameters();

        let weights = match config.precision {
            Precision::Fp32 => HostWeights::F32((&mut *rng).sample_iter(init).take(n).collect()),
            Precision::Fp16 => HostWeights::F16(
                (&mut *rng)
                    .sample_iter(init)
                    .take(n)
                    .map(f16::from_f32)
                    .collect(),
            ),
        };
        let table_offsets = (0..config.num_tables)
            .map(|t| (t * config.num_embeddings) as u32)
            .collect();

        Ok(HostCollection {
            config: config.clone(),
            weights,
            table_offsets,
            optimizer_state: vec![0.0; config.num_rows()],
        })
    }

    fn upload(&self, layout: &JaggedLayout) -> Result<HostBatch> {
        Ok(HostBatch {
            indices: layout.indices().to_vec(),
            offsets: layout.offsets().to_vec(),
        })
    }

    fn forward(
        &self,
        collection: &HostCollection,
        batch: &HostBatch,
        bag_size: usize,
        block_size: u32,
        use_shared_memory: bool,
    ) -> Result<OutputTensor> {
        check_block_size(block_size)?;
        let config = &collection.config;
        let shape = output_shape(batch.num_bags(), config.num_tables, config.embedding_dim)?;
        let mut output = OutputTensor::zeros(shape);

        self.stream.enqueue(|| {
            let lookup = Lookup::new(collection, batch);
            let dim = config.embedding_dim;
            let block = block_size as usize;
            let mut staged = Vec::with_capacity(if use_shared_memory { bag_size * dim } else { 0 });

            for (block_idx, block_out) in output.data_mut().chunks_mut(block * dim).enumerate() {
                for (k, bag_out) in block_out.chunks_mut(dim).enumerate() {
                    let bag = block_idx * block + k;
                    if use_shared_memory {
                        staged.clear();
                        for row in lookup.rows(bag)? {
                            collection.weights.extend_row(row, dim, &mut staged);
                        }
                        for staged_row in staged.chunks(dim) {
                            for (o, x) in bag_out.iter_mut().zip(staged_row) {
                                *o += x;
                            }
                        }
                    } else {
                        for row in lookup.rows(bag)? {
                            collection.weights.add_row_into(row, bag_out);
                        }
                    }
                }
            }
            Ok(())
        });

        Ok(output)
    }

    #[allow(clippy::too_many_arguments)]
    fn backward_sgd(
        &self,
        grad_output: &OutputTensor,
        collection: &mut HostCollection,
        batch: &HostBatch,
        learning_rate: f32,
        _bag_size: usize,
        block_size: u32,
        use_shared_memory: bool,
    ) -> Result<()> {
        check_block_size(block_size)?;
        check_grad_shape(grad_output, collection, batch)?;

        self.stream.enqueue(|| {
            let dim = collection.config.embedding_dim;
            let rows = Lookup::new(collection, batch).all_rows()?;
            let block = block_size as usize;
            let mut staged = vec![0.0f32; if use_shared_memory { dim } else { 0 }];

            for (block_idx, block_grad) in grad_output.data().chunks(block * dim).enumerate() {
                for (k, g) in block_grad.chunks(dim).enumerate() {
                    let bag = block_idx * block + k;
                    let (g, scale) = if use_shared_memory {
                        for (s, gd) in staged.iter_mut().zip(g) {
                            *s = -learning_rate * gd;
                        }
                        (staged.as_slice(), 1.0)
                    } else {
                        (g, -learning_rate)
                    };
                    for &row in &rows[bag] {
                        collection.weights.axpy_row(row, scale, g, f16::from_f32);
                    }
                }
            }
            Ok(())
        });
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn backward_approx_adagrad(
        &self,
        grad_output: &OutputTensor,
        collection: &mut HostCollection,
        batch: &HostBatch,
        learning_rate: f32,
        eps: f32,
        _bag_size: usize,
        stochastic_rounding: bool,
        block_size: u32,
    ) -> Result<()> {
        check_block_size(block_size)?;
        check_grad_shape(grad_output, collection, batch)?;
        let mut rng = self.rng.borrow_mut();

        self.stream.enqueue(|| {
            let dim = collection.config.embedding_dim;
            let rows = Lookup::new(collection, batch).all_rows()?;
            let block = block_size as usize;

            for (block_idx, block_grad) in grad_output.data().chunks(block * dim).enumerate() {
                for (k, g) in block_grad.chunks(dim).enumerate() {
                    let bag = block_idx * block + k;
                    let mean_sq = g.iter().map(|x| x * x).sum::<f32>() / dim as f32;
                    for &row in &rows[bag] {
                        let state = &mut collection.optimizer_state[row];
                        *state += mean_sq;
                        let multiplier = learning_rate / (state.sqrt() + eps);
                        if stochastic_rounding {
                            collection.weights.axpy_row(row, -multiplier, g, |x| {
                                stochastic_round_f16(x, rng.gen())
                            });
                        } else {
                            collection.weights.axpy_row(row, -multiplier, g, f16::from_f32);
                        }
                    }
                }
            }
            Ok(())
        });
        Ok(())
    }

    fn refresh_indices(&self, batch: &mut HostBatch, num_embeddings: usize) -> Result<()> {
        let draw = Uniform::new(0, index_upper_bound(num_embeddings)?);
        let mut rng = self.rng.borrow_mut();
        self.stream.enqueue(|| {
            for index in &mut batch.indices {
                *index = rng.sample(draw);
            }
            Ok(())
        });
        Ok(())
    }

    fn random_like(&self, output: &OutputTensor) -> Result<OutputTensor> {
        let mut rng = self.rng.borrow_mut();
        let n = output.data().len();
        OutputTensor::new(
            output.shape(),
            (&mut *rng).sample_iter(StandardNormal).take(n).collect(),
        )
    }

    fn to_host(&self, output: &OutputTensor) -> Result<OutputTensor> {
        self.stream.synchronize()?;
        Ok(output.clone())
    }
}

// ============================================================================
// Kernel helpers
// ============================================================================

/// Bag → weight-row resolution with device-style bounds checks
struct Lookup<'a> {
    table_offsets: &'a [u32],
    num_embeddings: usize,
    num_tables: usize,
    indices: &'a [u32],
    offsets: &'a [u32],
}

impl<'a> Lookup<'a> {
    fn new(collection: &'a HostCollection, batch: &'a HostBatch) -> Self {
        Self {
            table_offsets: &collection.table_offsets,
            num_embeddings: collection.config.num_embeddings,
            num_tables: collection.config.num_tables,
            indices: &batch.indices,
            offsets: &batch.offsets,
        }
    }

    /// Weight rows of `bag`, in bag order
    fn rows(&self, bag: usize) -> std::result::Result<Vec<usize>, String> {
        let table = bag % self.num_tables;
        let base = self.table_offsets[table] as usize;
        let (start, end) = (self.offsets[bag] as usize, self.offsets[bag + 1] as usize);
        let bag_indices = self.indices.get(start..end).ok_or_else(|| {
            format!(
                "bag {bag} spans [{start}, {end}) beyond {} indices",
                self.indices.len()
            )
        })?;
        bag_indices
            .iter()
            .map(|&index| {
                if (index as usize) < self.num_embeddings {
                    Ok(base + index as usize)
                } else {
                    Err(format!(
                        "index {index} out of range for table {table} with {} rows",
                        self.num_embeddings
                    ))
                }
            })
            .collect()
    }

    /// Rows of every bag, resolved before any weight is written
    fn all_rows(&self) -> std::result::Result<Vec<Vec<usize>>, String> {
        (0..self.offsets.len().saturating_sub(1))
            .map(|bag| self.rows(bag))
            .collect()
    }
}

fn check_grad_shape(
    grad_output: &OutputTensor,
    collection: &HostCollection,
    batch: &HostBatch,
) -> Result<()> {
    let config = &collection.config;
    let expected = output_shape(batch.num_bags(), config.num_tables, config.embedding_dim)?;
    if grad_output.shape() != expected {
        return Err(BenchError::InvalidArgument(format!(
            "grad_output shape {:?} does not match batch output {expected:?}",
            grad_output.shape()
        )));
    }
    Ok(())
}

/// Round `value` to f16 with probability proportional to the dropped bits
///
/// In f16's normal range f16 keeps 10 of the 23 f32 mantissa bits. Adding
/// `noise` to the 13 dropped bits before truncating rounds away from zero with
/// probability equal to the dropped fraction, so the result is unbiased in
/// expectation. Below `f16::MIN_POSITIVE` the f16 grid is the fixed subnormal
/// step, so the dropped fraction is taken against that step instead.
#[must_use]
pub fn stochastic_round_f16(value: f32, noise: u32) -> f16 {
    const DROPPED: u32 = 0x1FFF;
    if !value.is_finite() {
        return f16::from_f32(value);
    }
    if value.abs() < f16::MIN_POSITIVE.to_f32() {
        return stochastic_round_f16_subnormal(value, noise);
    }
    let bits = value.to_bits().wrapping_add(noise & DROPPED) & !DROPPED;
    f16::from_f32(f32::from_bits(bits))
}

fn stochastic_round_f16_subnormal(value: f32, noise: u32) -> f16 {
    let step = f16::MIN_POSITIVE_SUBNORMAL.to_f32();
    // Power-of-two scaling; both terms are exact multiples of 2^-24
    let steps = value.abs() / step;
    let below = steps.floor();
    let fraction = steps - below;
    let u = (noise >> 8) as f32 / (1u32 << 24) as f32;
    let k = if u + fraction >= 1.0 { below + 1.0 } else { below };
    f16::from_f32((k * step).copysign(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Optimizer;

    fn small_config(precision: Precision) -> CollectionConfig {
        CollectionConfig {
            num_tables: 2,
            num_embeddings: 10,
            embedding_dim: 4,
            optimizer: Optimizer::ApproxRowwiseAdagrad,
            learning_rate: 0.1,
            eps: 0.1,
            stochastic_rounding: false,
            precision,
            managed: false,
        }
    }

    fn layout(indices: Vec<u32>, bag_size: u32) -> JaggedLayout {
        let bags = indices.len() as u32 / bag_size;
        JaggedLayout::from_parts(indices, (0..=bags).map(|b| b * bag_size).collect()).unwrap()
    }

    #[test]
    fn test_stream_reports_fault_at_synchronize() {
        let stream = HostStream::new();
        stream.enqueue(|| Err("boom".to_string()));
        assert!(stream.is_faulted());
        assert_eq!(
            stream.synchronize(),
            Err(BenchError::DeviceExecution("boom".to_string()))
        );
    }

    #[test]
    fn test_stream_skips_work_after_fault() {
        let stream = HostStream::new();
        let ran = Cell::new(false);
        stream.enqueue(|| Err("first".to_string()));
        stream.enqueue(|| {
            ran.set(true);
            Ok(())
        });
        assert!(!ran.get());
        assert_eq!(stream.launches(), 2);
        // Sticky: the first fault is the one reported
        assert_eq!(
            stream.synchronize(),
            Err(BenchError::DeviceExecution("first".to_string()))
        );
    }

    #[test]
    fn test_stream_events_are_ordered() {
        let stream = HostStream::new();
        let start = stream.record_event().unwrap();
        let end = stream.record_event().unwrap();
        stream.synchronize().unwrap();
        assert!(stream.elapsed(&start, &end).is_ok());
        assert_eq!(stream.elapsed(&end, &start).unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_create_collection_layout() {
        let backend = HostBackend::with_seed(1);
        let collection = backend
            .create_collection(&small_config(Precision::Fp32))
            .unwrap();
        assert_eq!(collection.embedding_weights().len(), 2 * 10 * 4);
        assert_eq!(collection.table_offsets(), &[0, 10]);
        assert_eq!(collection.optimizer_state().len(), 20);
        assert_eq!(collection.num_parameters(), 80);
        let bound = (1.0f32 / 10.0).sqrt();
        assert!(collection
            .embedding_weights()
            .to_f32_vec()
            .iter()
            .all(|w| w.abs() <= bound));
    }

    #[test]
    fn test_forward_sums_rows_of_each_bag() {
        let backend = HostBackend::with_seed(2);
        let collection = backend
            .create_collection(&small_config(Precision::Fp32))
            .unwrap();
        // B=1, T=2, L=2: bag 0 -> table 0 rows {1, 3}, bag 1 -> table 1 rows {0, 0}
        let batch = backend.upload(&layout(vec![1, 3, 0, 0], 2)).unwrap();
        let out = backend.forward(&collection, &batch, 2, 1, false).unwrap();
        let out = backend.to_host(&out).unwrap();
        assert_eq!(out.shape(), [1, 2, 4]);

        let w = collection.embedding_weights();
        for d in 0..4 {
            let bag0 = w.get(4 + d) + w.get(3 * 4 + d);
            let bag1 = w.get(10 * 4 + d) + w.get(10 * 4 + d);
            assert_eq!(out.data()[d], bag0);
            assert_eq!(out.data()[4 + d], bag1);
        }
    }

    #[test]
    fn test_forward_identical_across_configurations() {
        for precision in [Precision::Fp32, Precision::Fp16] {
            let backend = HostBackend::with_seed(3);
            let collection = backend.create_collection(&small_config(precision)).unwrap();
            let batch = backend
                .upload(&layout((0..24).map(|i| (i * 7) % 9).collect(), 3))
                .unwrap();
            let baseline = backend.forward(&collection, &batch, 3, 1, false).unwrap();
            for block_size in [1, 2, 3, 4, 8, 128] {
                for shmem in [true, false] {
                    let y = backend
                        .forward(&collection, &batch, 3, block_size, shmem)
                        .unwrap();
                    assert_eq!(y, baseline, "{precision} ({block_size}, {shmem})");
                }
            }
            backend.stream().synchronize().unwrap();
        }
    }

    #[test]
    fn test_forward_rejects_zero_block_size() {
        let backend = HostBackend::with_seed(4);
        let collection = backend
            .create_collection(&small_config(Precision::Fp32))
            .unwrap();
        let batch = backend.upload(&layout(vec![0, 1, 2, 3], 2)).unwrap();
        assert!(matches!(
            backend.forward(&collection, &batch, 2, 0, false),
            Err(BenchError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_out_of_range_index_faults_asynchronously() {
        let backend = HostBackend::with_seed(5);
        let collection = backend
            .create_collection(&small_config(Precision::Fp32))
            .unwrap();
        let batch = backend.upload(&layout(vec![0, 10, 2, 3], 2)).unwrap();
        // Enqueue succeeds, the fault surfaces at synchronize
        let out = backend.forward(&collection, &batch, 2, 1, false);
        assert!(out.is_ok());
        match backend.stream().synchronize() {
            Err(BenchError::DeviceExecution(msg)) => assert!(msg.contains("index 10")),
            other => panic!("expected device fault, got {other:?}"),
        }
    }

    #[test]
    fn test_backward_sgd_moves_rows_against_gradient() {
        let backend = HostBackend::with_seed(6);
        let mut collection = backend
            .create_collection(&small_config(Precision::Fp32))
            .unwrap();
        let before = collection.embedding_weights().to_f32_vec();
        // Single bag per table, rows 2 (table 0) and 12 (table 1)
        let batch = backend.upload(&layout(vec![2, 2], 1)).unwrap();
        let grad = OutputTensor::new([1, 2, 4], vec![1.0; 8]).unwrap();

        backend
            .backward_sgd(&grad, &mut collection, &batch, 0.5, 1, 1, true)
            .unwrap();
        backend.stream().synchronize().unwrap();

        let after = collection.embedding_weights().to_f32_vec();
        for d in 0..4 {
            assert!((after[2 * 4 + d] - (before[2 * 4 + d] - 0.5)).abs() < 1e-6);
            assert!((after[12 * 4 + d] - (before[12 * 4 + d] - 0.5)).abs() < 1e-6);
        }
        // Untouched row
        assert_eq!(after[0..4], before[0..4]);
    }

    #[test]
    fn test_backward_sgd_same_result_with_and_without_shared_memory() {
        let backend = HostBackend::with_seed(7);
        let original = backend
            .create_collection(&small_config(Precision::Fp32))
            .unwrap();
        let batch = backend.upload(&layout(vec![1, 1, 4, 5, 1, 2, 3, 3], 2)).unwrap();
        let grad = OutputTensor::new([2, 2, 4], (0..16).map(|i| i as f32 * 0.1).collect()).unwrap();

        let mut a = original.clone();
        let mut b = original.clone();
        backend
            .backward_sgd(&grad, &mut a, &batch, 0.05, 2, 1, true)
            .unwrap();
        backend
            .backward_sgd(&grad, &mut b, &batch, 0.05, 2, 32, false)
            .unwrap();
        backend.stream().synchronize().unwrap();
        assert_eq!(a.embedding_weights(), b.embedding_weights());
    }

    #[test]
    fn test_backward_adagrad_updates_state_and_weights() {
        let backend = HostBackend::with_seed(8);
        let mut collection = backend
            .create_collection(&small_config(Precision::Fp32))
            .unwrap();
        let before = collection.embedding_weights().to_f32_vec();
        let batch = backend.upload(&layout(vec![3, 7], 1)).unwrap();
        let grad = OutputTensor::new([1, 2, 4], vec![2.0; 8]).unwrap();

        backend
            .backward_approx_adagrad(&grad, &mut collection, &batch, 0.05, 0.01, 1, false, 1)
            .unwrap();
        backend.stream().synchronize().unwrap();

        // mean(g^2) = 4, multiplier = 0.05 / (2 + 0.01)
        assert_eq!(collection.optimizer_state()[3], 4.0);
        assert_eq!(collection.optimizer_state()[17], 4.0);
        let multiplier = 0.05 / (2.0 + 0.01);
        let after = collection.embedding_weights().to_f32_vec();
        assert!((after[3 * 4] - (before[3 * 4] - multiplier * 2.0)).abs() < 1e-6);
        assert_eq!(collection.optimizer_state()[0], 0.0);
    }

    #[test]
    fn test_backward_adagrad_stochastic_fp16() {
        let backend = HostBackend::with_seed(9);
        let mut collection = backend
            .create_collection(&small_config(Precision::Fp16))
            .unwrap();
        let before = collection.embedding_weights().to_f32_vec();
        let batch = backend.upload(&layout(vec![1, 1, 1, 1], 1)).unwrap();
        let grad = OutputTensor::new([2, 2, 4], vec![1.0; 16]).unwrap();

        backend
            .backward_approx_adagrad(&grad, &mut collection, &batch, 0.05, 0.01, 1, true, 2)
            .unwrap();
        backend.stream().synchronize().unwrap();

        let after = collection.embedding_weights().to_f32_vec();
        assert!(after[4] < before[4]);
        assert!(matches!(collection.embedding_weights(), HostWeights::F16(_)));
    }

    #[test]
    fn test_backward_rejects_mismatched_gradient() {
        let backend = HostBackend::with_seed(10);
        let mut collection = backend
            .create_collection(&small_config(Precision::Fp32))
            .unwrap();
        let batch = backend.upload(&layout(vec![1, 1], 1)).unwrap();
        let grad = OutputTensor::zeros([2, 2, 4]);
        assert!(backend
            .backward_sgd(&grad, &mut collection, &batch, 0.1, 1, 1, false)
            .is_err());
    }

    #[test]
    fn test_refresh_indices_stays_in_range() {
        let backend = HostBackend::with_seed(11);
        let mut batch = backend.upload(&layout(vec![0; 64], 4)).unwrap();
        backend.refresh_indices(&mut batch, 5).unwrap();
        backend.stream().synchronize().unwrap();
        assert!(batch.indices().iter().all(|&i| i < 4));
        assert!(batch.indices().iter().any(|&i| i != 0));
        assert_eq!(batch.offsets().len(), 17);
    }

    #[test]
    fn test_refresh_is_enqueued_on_the_stream() {
        let backend = HostBackend::with_seed(12);
        let mut batch = backend.upload(&layout(vec![0; 8], 2)).unwrap();
        let before = backend.stream().launches();
        backend.refresh_indices(&mut batch, 100).unwrap();
        assert_eq!(backend.stream().launches(), before + 1);
    }

    #[test]
    fn test_random_like_shape() {
        let backend = HostBackend::with_seed(13);
        let y = OutputTensor::zeros([4, 2, 8]);
        let g = backend.random_like(&y).unwrap();
        assert_eq!(g.shape(), [4, 2, 8]);
        assert!(g.data().iter().any(|&x| x != 0.0));
    }

    #[test]
    fn test_seeded_backends_are_reproducible() {
        let a = HostBackend::with_seed(99)
            .create_collection(&small_config(Precision::Fp32))
            .unwrap();
        let b = HostBackend::with_seed(99)
            .create_collection(&small_config(Precision::Fp32))
            .unwrap();
        assert_eq!(a.embedding_weights(), b.embedding_weights());
    }

    #[test]
    fn test_stochastic_round_brackets_value() {
        let value = 0.1f32;
        let down = f16::from_f32(f32::from_bits(value.to_bits() & !0x1FFF));
        let up = f16::from_f32(f32::from_bits((value.to_bits() & !0x1FFF) + 0x2000));
        for noise in [0, 1, 0x0FFF, 0x1FFF, u32::MAX] {
            let r = stochastic_round_f16(value, noise);
            assert!(r == down || r == up);
        }
        assert_eq!(stochastic_round_f16(value, 0), down);
    }

    #[test]
    fn test_stochastic_round_exact_values_unchanged() {
        for noise in [0, 0x1FFF, 12345] {
            assert_eq!(stochastic_round_f16(1.5, noise), f16::from_f32(1.5));
        }
        assert!(stochastic_round_f16(f32::NAN, 7).is_nan());
    }

    #[test]
    fn test_stochastic_round_subnormal_brackets_value() {
        let step = f16::MIN_POSITIVE_SUBNORMAL.to_f32();
        let value = 2.25 * step;
        let down = f16::from_f32(2.0 * step);
        let up = f16::from_f32(3.0 * step);
        for noise in [0, 0x100, 0x7FFF_FFFF, 0xC000_0000, u32::MAX] {
            let r = stochastic_round_f16(value, noise);
            assert!(r == down || r == up, "{noise:#x} -> {r}");
        }
        assert_eq!(stochastic_round_f16(value, 0), down);
        assert_eq!(stochastic_round_f16(value, u32::MAX), up);
        assert_eq!(stochastic_round_f16(-value, u32::MAX), -up);
        assert_eq!(stochastic_round_f16(3.0 * step, u32::MAX), up);
    }

    #[test]
    fn test_stochastic_round_subnormal_unbiased() {
        let mut rng = StdRng::seed_from_u64(22);
        let step = f64::from(f16::MIN_POSITIVE_SUBNORMAL.to_f32());
        for value in [0.3 * step, 7.75 * step, 1000.5 * step] {
            let n = 20_000;
            let mean: f64 = (0..n)
                .map(|_| f64::from(stochastic_round_f16(value as f32, rng.gen()).to_f32()))
                .sum::<f64>()
                / f64::from(n);
            assert!((mean - value).abs() < 0.02 * step, "{value:e}: mean {mean:e}");
        }
    }

    #[test]
    fn test_stochastic_round_unbiased() {
        let mut rng = StdRng::seed_from_u64(21);
        let value = 0.1f32;
        let n = 20_000;
        let mean: f64 = (0..n)
            .map(|_| f64::from(stochastic_round_f16(value, rng.gen()).to_f32()))
            .sum::<f64>()
            / f64::from(n);
        assert!((mean - f64::from(value)).abs() < 1e-5);
    }
}
