//! Accelerated execution backend built on WGPU compute shaders.
//!
//! A single process-wide [`GpuContext`] owns the device and queue. Convolution
//! kernels live in [`conv`]; they operate on contiguous `f32` sample blocks in
//! channel-major order, which is exactly the memory order of a column-major
//! local matrix whose columns are samples.

use std::sync::{Arc, OnceLock};

use crate::error::{GroveError, Result};

pub mod conv;

/// Process-wide GPU compute context.
pub struct GpuContext {
    pub device: Arc<wgpu::Device>,
    pub queue: Arc<wgpu::Queue>,
}

impl GpuContext {
    /// Creates a fresh context on the highest-performance available adapter.
    pub fn new() -> Result<Self> {
        pollster::block_on(async {
            let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
                backends: wgpu::Backends::all(),
                ..Default::default()
            });

            let adapter = instance
                .request_adapter(&wgpu::RequestAdapterOptions {
                    power_preference: wgpu::PowerPreference::HighPerformance,
                    compatible_surface: None,
                    force_fallback_adapter: false,
                })
                .await
                .ok_or_else(|| {
                    GroveError::device("GpuContext::new", "no suitable GPU adapter found")
                })?;

            let (device, queue) = adapter
                .request_device(
                    &wgpu::DeviceDescriptor {
                        required_features: wgpu::Features::empty(),
                        required_limits: wgpu::Limits::default(),
                        label: Some("grove device"),
                        memory_hints: Default::default(),
                    },
                    None,
                )
                .await
                .map_err(|e| {
                    GroveError::device("GpuContext::new", format!("device request failed: {e}"))
                })?;

            log::info!("initialized GPU context on adapter {:?}", adapter.get_info().name);

            Ok(Self {
                device: Arc::new(device),
                queue: Arc::new(queue),
            })
        })
    }

    /// Returns the shared context, initializing it on first use.
    pub fn global() -> Result<&'static Self> {
        static GLOBAL_CONTEXT: OnceLock<Result<GpuContext>> = OnceLock::new();

        GLOBAL_CONTEXT
            .get_or_init(GpuContext::new)
            .as_ref()
            .map_err(|e| e.clone())
    }

    /// Copies a mapped-readable buffer back to host memory.
    pub(crate) fn read_buffer(&self, buffer: &wgpu::Buffer, len: usize) -> Result<Vec<f32>> {
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("staging"),
            size: (len * std::mem::size_of::<f32>()) as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("readback encoder"),
            });
        encoder.copy_buffer_to_buffer(buffer, 0, &staging, 0, staging.size());
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);

        match receiver.recv() {
            Ok(Ok(())) => {
                let data = slice.get_mapped_range();
                let out = bytemuck::cast_slice(&data).to_vec();
                drop(data);
                staging.unmap();
                Ok(out)
            }
            _ => Err(GroveError::device(
                "GpuContext::read_buffer",
                "failed to map staging buffer",
            )),
        }
    }
}
