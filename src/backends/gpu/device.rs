//! GPU device initialization, buffers and kernel dispatch

use std::sync::{Arc, Mutex};

use wgpu::util::DeviceExt;

use super::shaders;
use crate::error::{BenchError, Result};

/// Kernel parameters, mirrors `Params` in the shaders
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
pub struct KernelParams {
    pub num_bags: u32,
    pub num_tables: u32,
    pub num_embeddings: u32,
    pub embedding_dim: u32,
    pub block_size: u32,
    pub seed: u32,
    pub num_indices: u32,
    pub _pad0: u32,
    pub learning_rate: f32,
    pub eps: f32,
    pub _pad1: f32,
    pub _pad2: f32,
}

/// Largest workgroup count per dispatch dimension
const MAX_WORKGROUPS_PER_DIM: u32 = 65_535;

/// Compute pipelines of every embedding kernel
pub struct Kernels {
    pub forward: wgpu::ComputePipeline,
    pub forward_shmem: wgpu::ComputePipeline,
    pub sgd: wgpu::ComputePipeline,
    pub sgd_shmem: wgpu::ComputePipeline,
    pub adagrad: wgpu::ComputePipeline,
    pub refresh: wgpu::ComputePipeline,
}

/// GPU device manager
///
/// Validation errors raised by wgpu and out-of-range indices recorded by the
/// kernels are both sticky: once set they are reported by every
/// [`GpuDevice::check_faults`].
pub struct GpuDevice {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    error: Arc<Mutex<Option<String>>>,
    fault: wgpu::Buffer,
    kernels: Kernels,
}

impl GpuDevice {
    /// Initialize GPU device
    ///
    /// `managed` trades speed for a smaller memory footprint.
    pub fn new(managed: bool) -> Result<Self> {
        pollster::block_on(async { Self::new_async(managed).await })
    }

    async fn new_async(managed: bool) -> Result<Self> {
        let instance = wgpu::Instance::default();

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| BenchError::DeviceUnavailable("no GPU adapter found".to_string()))?;

        if !adapter.features().contains(wgpu::Features::TIMESTAMP_QUERY) {
            return Err(BenchError::DeviceUnavailable(format!(
                "{} does not support timestamp queries",
                adapter.get_info().name
            )));
        }

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("tbe-bench GPU Device"),
                    required_features: wgpu::Features::TIMESTAMP_QUERY,
                    required_limits: adapter.limits(),
                    memory_hints: if managed {
                        wgpu::MemoryHints::MemoryUsage
                    } else {
                        wgpu::MemoryHints::Performance
                    },
                },
                None,
            )
            .await
            .map_err(|e| BenchError::DeviceUnavailable(format!("Failed to create device: {e}")))?;

        let error = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&error);
        device.on_uncaptured_error(Box::new(move |e| {
            if let Ok(mut slot) = slot.lock() {
                slot.get_or_insert_with(|| e.to_string());
            }
        }));

        let fault = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Fault"),
            size: 8,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let kernels = Kernels::new(&device);

        Ok(Self {
            device,
            queue,
            error,
            fault,
            kernels,
        })
    }

    /// Check if a GPU with timestamp queries is available
    pub fn is_available() -> bool {
        pollster::block_on(async {
            let instance = wgpu::Instance::default();
            instance
                .request_adapter(&wgpu::RequestAdapterOptions {
                    power_preference: wgpu::PowerPreference::HighPerformance,
                    compatible_surface: None,
                    force_fallback_adapter: false,
                })
                .await
                .is_some_and(|adapter| adapter.features().contains(wgpu::Features::TIMESTAMP_QUERY))
        })
    }

    pub fn kernels(&self) -> &Kernels {
        &self.kernels
    }

    pub fn fault_buffer(&self) -> &wgpu::Buffer {
        &self.fault
    }

    /// Storage buffer initialised with `contents`
    pub fn storage_buffer(&self, label: &str, contents: &[u8]) -> wgpu::Buffer {
        self.device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents,
                usage: wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_SRC
                    | wgpu::BufferUsages::COPY_DST,
            })
    }

    /// Zero-filled storage buffer of `size` bytes
    pub fn zeroed_buffer(&self, label: &str, size: u64) -> wgpu::Buffer {
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })
    }

    /// Enqueue one kernel launch over `num_workgroups` workgroups
    ///
    /// `bindings` pairs binding numbers with buffers; the params uniform is
    /// bound at 6.
    pub fn dispatch(
        &self,
        label: &str,
        pipeline: &wgpu::ComputePipeline,
        bindings: &[(u32, &wgpu::Buffer)],
        params: &KernelParams,
        num_workgroups: u32,
    ) {
        let params_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Params"),
                contents: bytemuck::bytes_of(params),
                usage: wgpu::BufferUsages::UNIFORM,
            });

        let mut entries: Vec<wgpu::BindGroupEntry<'_>> = bindings
            .iter()
            .map(|&(binding, buffer)| wgpu::BindGroupEntry {
                binding,
                resource: buffer.as_entire_binding(),
            })
            .collect();
        entries.push(wgpu::BindGroupEntry {
            binding: 6,
            resource: params_buffer.as_entire_binding(),
        });

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(label),
            layout: &pipeline.get_bind_group_layout(0),
            entries: &entries,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) });
        {
            let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(label),
                timestamp_writes: None,
            });
            compute_pass.set_pipeline(pipeline);
            compute_pass.set_bind_group(0, &bind_group, &[]);
            let (x, y) = workgroup_grid(num_workgroups);
            compute_pass.dispatch_workgroups(x, y, 1);
        }
        self.queue.submit(Some(encoder.finish()));
    }

    /// Copy `size` bytes of `buffer` back to the host
    pub fn read_buffer<T: bytemuck::Pod>(&self, buffer: &wgpu::Buffer, size: u64) -> Result<Vec<T>> {
        pollster::block_on(async { self.read_buffer_async(buffer, size).await })
    }

    async fn read_buffer_async<T: bytemuck::Pod>(
        &self,
        buffer: &wgpu::Buffer,
        size: u64,
    ) -> Result<Vec<T>> {
        let staging_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Staging Buffer"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Readback Encoder"),
            });
        encoder.copy_buffer_to_buffer(buffer, 0, &staging_buffer, 0, size);
        self.queue.submit(Some(encoder.finish()));

        map_read(&self.device, &staging_buffer).await
    }

    /// Report the first validation error or out-of-range index, if any
    pub fn check_faults(&self) -> Result<()> {
        let error = match self.error.lock() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        if let Some(message) = error {
            return Err(BenchError::DeviceExecution(message));
        }

        let fault: Vec<u32> = self.read_buffer(&self.fault, 8)?;
        if fault[0] != 0 {
            return Err(BenchError::DeviceExecution(format!(
                "embedding index {} out of range",
                fault[1]
            )));
        }
        Ok(())
    }
}

/// Map `buffer` for reading and copy its contents out
pub(super) async fn map_read<T: bytemuck::Pod>(
    device: &wgpu::Device,
    buffer: &wgpu::Buffer,
) -> Result<Vec<T>> {
    let buffer_slice = buffer.slice(..);
    let (sender, receiver) = futures_intrusive::channel::shared::oneshot_channel();
    buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
        sender.send(result).ok();
    });

    device.poll(wgpu::Maintain::Wait);

    receiver
        .receive()
        .await
        .ok_or_else(|| BenchError::DeviceExecution("Failed to receive mapping result".to_string()))?
        .map_err(|e| BenchError::DeviceExecution(format!("Buffer mapping failed: {e:?}")))?;

    let data = {
        let view = buffer_slice.get_mapped_range();
        bytemuck::cast_slice(&view).to_vec()
    };
    buffer.unmap();
    Ok(data)
}

/// Split a linear workgroup count into a 2-D grid within dispatch limits
pub(super) fn workgroup_grid(num_workgroups: u32) -> (u32, u32) {
    if num_workgroups <= MAX_WORKGROUPS_PER_DIM {
        (num_workgroups.max(1), 1)
    } else {
        let y = num_workgroups.div_ceil(MAX_WORKGROUPS_PER_DIM);
        (num_workgroups.div_ceil(y), y)
    }
}

impl Kernels {
    fn new(device: &wgpu::Device) -> Self {
        let forward = module(device, "Forward Shader", shaders::forward_source());
        let sgd = module(device, "SGD Shader", shaders::sgd_source());
        let adagrad = module(device, "Adagrad Shader", shaders::adagrad_source());
        let refresh = module(device, "Refresh Shader", shaders::refresh_source());

        Self {
            forward: pipeline(device, &forward, "forward"),
            forward_shmem: pipeline(device, &forward, "forward_shmem"),
            sgd: pipeline(device, &sgd, "sgd"),
            sgd_shmem: pipeline(device, &sgd, "sgd_shmem"),
            adagrad: pipeline(device, &adagrad, "adagrad"),
            refresh: pipeline(device, &refresh, "refresh"),
        }
    }
}

fn module(device: &wgpu::Device, label: &str, source: String) -> wgpu::ShaderModule {
    device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    })
}

fn pipeline(
    device: &wgpu::Device,
    module: &wgpu::ShaderModule,
    entry_point: &str,
) -> wgpu::ComputePipeline {
    device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(entry_point),
        layout: None,
        module,
        entry_point,
        compilation_options: Default::default(),
        cache: None,
    })
}
