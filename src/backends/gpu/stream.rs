//! Queue-ordered timestamps on the wgpu queue

use std::sync::Arc;
use std::time::Duration;

use super::device::{map_read, GpuDevice};
use crate::backends::Stream;
use crate::error::{BenchError, Result};

/// The device queue viewed as an in-order stream
pub struct GpuStream {
    gpu: Arc<GpuDevice>,
}

/// Timestamp written by an empty compute pass, resolved into `readback`
pub struct GpuEvent {
    readback: wgpu::Buffer,
    _queries: wgpu::QuerySet,
}

impl GpuStream {
    pub(super) fn new(gpu: Arc<GpuDevice>) -> Self {
        Self { gpu }
    }

    fn read_ticks(&self, event: &GpuEvent) -> Result<u64> {
        let ticks: Vec<u64> =
            pollster::block_on(async { map_read(&self.gpu.device, &event.readback).await })?;
        ticks
            .first()
            .copied()
            .ok_or_else(|| BenchError::DeviceExecution("empty timestamp readback".to_string()))
    }
}

impl Stream for GpuStream {
    type Event = GpuEvent;

    fn record_event(&self) -> Result<GpuEvent> {
        let device = &self.gpu.device;
        let queries = device.create_query_set(&wgpu::QuerySetDescriptor {
            label: Some("Event"),
            ty: wgpu::QueryType::Timestamp,
            count: 1,
        });
        let resolve = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Event Resolve"),
            size: wgpu::QUERY_SIZE as u64,
            usage: wgpu::BufferUsages::QUERY_RESOLVE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let readback = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Event Readback"),
            size: wgpu::QUERY_SIZE as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Event Encoder"),
        });
        {
            let _marker = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Event"),
                timestamp_writes: Some(wgpu::ComputePassTimestampWrites {
                    query_set: &queries,
                    beginning_of_pass_write_index: Some(0),
                    end_of_pass_write_index: None,
                }),
            });
        }
        encoder.resolve_query_set(&queries, 0..1, &resolve, 0);
        encoder.copy_buffer_to_buffer(&resolve, 0, &readback, 0, wgpu::QUERY_SIZE as u64);
        self.gpu.queue.submit(Some(encoder.finish()));

        Ok(GpuEvent {
            readback,
            _queries: queries,
        })
    }

    fn synchronize(&self) -> Result<()> {
        self.gpu.device.poll(wgpu::Maintain::Wait);
        self.gpu.check_faults()
    }

    fn elapsed(&self, start: &GpuEvent, end: &GpuEvent) -> Result<Duration> {
        let start = self.read_ticks(start)?;
        let end = self.read_ticks(end)?;
        let period_ns = f64::from(self.gpu.queue.get_timestamp_period());
        let ns = end.saturating_sub(start) as f64 * period_ns;
        Ok(Duration::from_nanos(ns as u64))
    }
}
