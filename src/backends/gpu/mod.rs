//! GPU backend using wgpu (Vulkan/Metal/DX12)
//!
//! Runs the embedding kernels as WGSL compute shaders and times them with
//! timestamp queries written in queue order.
//!
//! # Architecture
//!
//! - Every kernel call is one submission on the device queue
//! - Out-of-range indices are recorded by the kernels in a fault buffer and
//!   reported at the next synchronize, together with wgpu validation errors
//! - Weights are fp32 only; `Precision::Fp16` is rejected at collection
//!   creation, so stochastic rounding has no effect here
//! - Requires `Features::TIMESTAMP_QUERY`

mod device;
mod shaders;
mod stream;

use std::cell::RefCell;
use std::sync::Arc;

use ndarray_rand::rand_distr::{StandardNormal, Uniform};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};

pub use device::GpuDevice;
pub use stream::{GpuEvent, GpuStream};

use self::device::KernelParams;
use self::shaders::WORKGROUP_SIZE;
use super::{
    check_block_size, output_shape, EmbeddingBackend, EmbeddingCollection, OutputTensor, Stream,
};
use crate::config::{CollectionConfig, Precision};
use crate::error::{BenchError, Result};
use crate::layout::{index_upper_bound, JaggedLayout};

const F32_BYTES: u64 = std::mem::size_of::<f32>() as u64;

/// Device-resident collection
pub struct GpuCollection {
    config: CollectionConfig,
    weights: wgpu::Buffer,
    table_offsets: wgpu::Buffer,
    optimizer_state: wgpu::Buffer,
}

impl GpuCollection {
    /// Weight buffer, `T × E × D` fp32 row-major
    pub fn embedding_weights(&self) -> &wgpu::Buffer {
        &self.weights
    }

    /// First row of each table
    pub fn table_offsets(&self) -> &wgpu::Buffer {
        &self.table_offsets
    }

    /// Row-wise Adagrad accumulators
    pub fn optimizer_state(&self) -> &wgpu::Buffer {
        &self.optimizer_state
    }
}

impl EmbeddingCollection for GpuCollection {
    fn config(&self) -> &CollectionConfig {
        &self.config
    }
}

/// Device copies of indices and offsets
pub struct GpuBatch {
    indices: wgpu::Buffer,
    offsets: wgpu::Buffer,
    num_indices: usize,
    num_bags: usize,
}

/// Device-resident `[B, T, D]` tensor
pub struct GpuOutput {
    buffer: wgpu::Buffer,
    shape: [usize; 3],
}

impl GpuOutput {
    /// `[B, T, D]`
    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    fn size(&self) -> u64 {
        self.shape.iter().product::<usize>() as u64 * F32_BYTES
    }
}

/// wgpu compute backend
pub struct GpuBackend {
    gpu: Arc<GpuDevice>,
    stream: GpuStream,
    rng: RefCell<StdRng>,
    managed: bool,
}

impl GpuBackend {
    /// Initialize the backend on the best available adapter
    pub fn new(managed: bool) -> Result<Self> {
        Self::with_rng(managed, StdRng::from_entropy())
    }

    /// Backend with a reproducible RNG
    pub fn with_seed(managed: bool, seed: u64) -> Result<Self> {
        Self::with_rng(managed, StdRng::seed_from_u64(seed))
    }

    fn with_rng(managed: bool, rng: StdRng) -> Result<Self> {
        let gpu = Arc::new(GpuDevice::new(managed)?);
        info!("GPU backend ready (managed memory hint: {managed})");
        Ok(Self {
            stream: GpuStream::new(Arc::clone(&gpu)),
            gpu,
            rng: RefCell::new(rng),
            managed,
        })
    }

    /// Check if a GPU with timestamp queries is available
    pub fn is_available() -> bool {
        GpuDevice::is_available()
    }

    fn params(&self, collection: &GpuCollection, batch: &GpuBatch, block_size: u32) -> KernelParams {
        let config = &collection.config;
        KernelParams {
            num_bags: batch.num_bags as u32,
            num_tables: config.num_tables as u32,
            num_embeddings: config.num_embeddings as u32,
            embedding_dim: config.embedding_dim as u32,
            block_size,
            num_indices: batch.num_indices as u32,
            ..KernelParams::default()
        }
    }

    fn check_grad(
        &self,
        grad_output: &GpuOutput,
        collection: &GpuCollection,
        batch: &GpuBatch,
    ) -> Result<()> {
        let config = &collection.config;
        let expected = output_shape(batch.num_bags, config.num_tables, config.embedding_dim)?;
        if grad_output.shape != expected {
            return Err(BenchError::InvalidArgument(format!(
                "grad_output shape {:?} does not match batch output {expected:?}",
                grad_output.shape
            )));
        }
        Ok(())
    }
}

fn blocks(num_bags: usize, block_size: u32) -> u32 {
    (num_bags as u32).div_ceil(block_size)
}

impl EmbeddingBackend for GpuBackend {
    type Stream = GpuStream;
    type Collection = GpuCollection;
    type Batch = GpuBatch;
    type Output = GpuOutput;

    fn name(&self) -> &str {
        "gpu"
    }

    fn stream(&self) -> &GpuStream {
        &self.stream
    }

    fn create_collection(&self, config: &CollectionConfig) -> Result<GpuCollection> {
        config.validate()?;
        if config.precision != Precision::Fp32 {
            return Err(BenchError::Unsupported(format!(
                "{} weights on the gpu backend",
                config.precision
            )));
        }
        if config.managed != self.managed {
            warn!(
                "managed = {} requested after device creation with managed = {}; ignored",
                config.managed, self.managed
            );
        }

        let bound = (1.0 / config.num_embeddings as f32).sqrt();
        let init = Uniform::new_inclusive(-bound, bound);
        let weights: Vec<f32> = (&mut *self.rng.borrow_mut())
            .sample_iter(init)
            .take(config.num_parameters())
            .collect();
        let table_offsets: Vec<u32> = (0..config.num_tables)
            .map(|t| (t * config.num_embeddings) as u32)
            .collect();

        Ok(GpuCollection {
            config: config.clone(),
            weights: self
                .gpu
                .storage_buffer("Embedding Weights", bytemuck::cast_slice(&weights)),
            table_offsets: self
                .gpu
                .storage_buffer("Table Offsets", bytemuck::cast_slice(&table_offsets)),
            optimizer_state: self
                .gpu
                .zeroed_buffer("Optimizer State", config.num_rows() as u64 * F32_BYTES),
        })
    }

    fn upload(&self, layout: &JaggedLayout) -> Result<GpuBatch> {
        if layout.indices().is_empty() {
            return Err(BenchError::InvalidArgument(
                "gpu backend needs at least one index".to_string(),
            ));
        }
        Ok(GpuBatch {
            indices: self
                .gpu
                .storage_buffer("Indices", bytemuck::cast_slice(layout.indices())),
            offsets: self
                .gpu
                .storage_buffer("Offsets", bytemuck::cast_slice(layout.offsets())),
            num_indices: layout.indices().len(),
            num_bags: layout.num_bags(),
        })
    }

    fn forward(
        &self,
        collection: &GpuCollection,
        batch: &GpuBatch,
        _bag_size: usize,
        block_size: u32,
        use_shared_memory: bool,
    ) -> Result<GpuOutput> {
        check_block_size(block_size)?;
        let config = &collection.config;
        let shape = output_shape(batch.num_bags, config.num_tables, config.embedding_dim)?;
        let buffer = self.gpu.zeroed_buffer(
            "Output",
            shape.iter().product::<usize>() as u64 * F32_BYTES,
        );

        let kernels = self.gpu.kernels();
        let pipeline = if use_shared_memory {
            &kernels.forward_shmem
        } else {
            &kernels.forward
        };
        self.gpu.dispatch(
            "Forward",
            pipeline,
            &[
                (0, &collection.weights),
                (1, &collection.table_offsets),
                (2, &batch.indices),
                (3, &batch.offsets),
                (4, &buffer),
                (5, self.gpu.fault_buffer()),
            ],
            &self.params(collection, batch, block_size),
            blocks(batch.num_bags, block_size),
        );
        Ok(GpuOutput { buffer, shape })
    }

    #[allow(clippy::too_many_arguments)]
    fn backward_sgd(
        &self,
        grad_output: &GpuOutput,
        collection: &mut GpuCollection,
        batch: &GpuBatch,
        learning_rate: f32,
        _bag_size: usize,
        block_size: u32,
        use_shared_memory: bool,
    ) -> Result<()> {
        check_block_size(block_size)?;
        self.check_grad(grad_output, collection, batch)?;

        let kernels = self.gpu.kernels();
        let pipeline = if use_shared_memory {
            &kernels.sgd_shmem
        } else {
            &kernels.sgd
        };
        let params = KernelParams {
            learning_rate,
            ..self.params(collection, batch, block_size)
        };
        self.gpu.dispatch(
            "SGD",
            pipeline,
            &[
                (0, &collection.weights),
                (1, &collection.table_offsets),
                (2, &batch.indices),
                (3, &batch.offsets),
                (4, &grad_output.buffer),
                (5, self.gpu.fault_buffer()),
            ],
            &params,
            blocks(batch.num_bags, block_size),
        );
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn backward_approx_adagrad(
        &self,
        grad_output: &GpuOutput,
        collection: &mut GpuCollection,
        batch: &GpuBatch,
        learning_rate: f32,
        eps: f32,
        _bag_size: usize,
        _stochastic_rounding: bool,
        block_size: u32,
    ) -> Result<()> {
        check_block_size(block_size)?;
        self.check_grad(grad_output, collection, batch)?;

        let params = KernelParams {
            learning_rate,
            eps,
            ..self.params(collection, batch, block_size)
        };
        self.gpu.dispatch(
            "Adagrad",
            &self.gpu.kernels().adagrad,
            &[
                (0, &collection.weights),
                (1, &collection.table_offsets),
                (2, &batch.indices),
                (3, &batch.offsets),
                (4, &grad_output.buffer),
                (5, self.gpu.fault_buffer()),
                (7, &collection.optimizer_state),
            ],
            &params,
            blocks(batch.num_bags, block_size),
        );
        Ok(())
    }

    fn refresh_indices(&self, batch: &mut GpuBatch, num_embeddings: usize) -> Result<()> {
        index_upper_bound(num_embeddings)?;
        let params = KernelParams {
            num_embeddings: num_embeddings as u32,
            num_indices: batch.num_indices as u32,
            seed: self.rng.borrow_mut().gen(),
            ..KernelParams::default()
        };
        self.gpu.dispatch(
            "Refresh",
            &self.gpu.kernels().refresh,
            &[(2, &batch.indices)],
            &params,
            (batch.num_indices as u32).div_ceil(WORKGROUP_SIZE),
        );
        Ok(())
    }

    fn random_like(&self, output: &GpuOutput) -> Result<GpuOutput> {
        let n = output.shape.iter().product::<usize>();
        let values: Vec<f32> = (&mut *self.rng.borrow_mut())
            .sample_iter(StandardNormal)
            .take(n)
            .collect();
        Ok(GpuOutput {
            buffer: self
                .gpu
                .storage_buffer("Gradient", bytemuck::cast_slice(&values)),
            shape: output.shape,
        })
    }

    fn to_host(&self, output: &GpuOutput) -> Result<OutputTensor> {
        self.stream.synchronize()?;
        let data = self.gpu.read_buffer(&output.buffer, output.size())?;
        OutputTensor::new(output.shape, data)
    }
}
