//! Convolution compute kernels dispatched through WGPU.
//!
//! All entry points operate on `f32` data laid out as contiguous samples in
//! channel-major order. Scatter-free formulations are used throughout: each
//! output element is owned by exactly one invocation, so every kernel is
//! bitwise deterministic for a fixed geometry.

use wgpu::util::DeviceExt;

use crate::accel::ForwardAlgorithm;
use crate::error::{GroveError, Result};
use crate::gpu::GpuContext;

const SHADER_SOURCE: &str = include_str!("shaders/conv_ops.wgsl");

/// Problem geometry handed to the shaders as a uniform.
///
/// `alpha` and `beta` scale the freshly computed value and the prior contents
/// of the destination buffer; kernels that overwrite their destination ignore
/// `beta`.
#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ConvGeometry {
    pub batch: u32,
    pub in_channels: u32,
    pub out_channels: u32,
    pub in_height: u32,
    pub in_width: u32,
    pub out_height: u32,
    pub out_width: u32,
    pub kernel_height: u32,
    pub kernel_width: u32,
    pub stride_h: u32,
    pub stride_w: u32,
    pub pad_h: u32,
    pub pad_w: u32,
    pub dilation_h: u32,
    pub dilation_w: u32,
    pub groups: u32,
    pub alpha: f32,
    pub beta: f32,
    pub _pad: [u32; 2],
}

impl ConvGeometry {
    pub fn input_len(&self) -> usize {
        (self.batch * self.in_channels * self.in_height * self.in_width) as usize
    }

    pub fn output_len(&self) -> usize {
        (self.batch * self.out_channels * self.out_height * self.out_width) as usize
    }

    pub fn kernel_len(&self) -> usize {
        (self.out_channels * (self.in_channels / self.groups)
            * self.kernel_height
            * self.kernel_width) as usize
    }

    /// Per-output-channel weight slice length, the unit the tiled forward
    /// kernel stages in workgroup memory.
    pub fn patch_len(&self) -> usize {
        ((self.in_channels / self.groups) * self.kernel_height * self.kernel_width) as usize
    }

    fn check(&self, operation: &str, name: &str, expected: usize, got: usize) -> Result<()> {
        if expected != got {
            return Err(GroveError::shape_mismatch(
                operation,
                format!("{name} of {expected} elements"),
                format!("{got} elements"),
            ));
        }
        Ok(())
    }
}

const WORKGROUP_SIZE: u32 = 256;
const FILTER_WORKGROUP_SIZE: u32 = 64;

fn workgroups_for(elements: u32, size: u32) -> u32 {
    elements.div_ceil(size)
}

/// One storage binding of a kernel dispatch.
struct StorageBinding<'a> {
    index: u32,
    buffer: &'a wgpu::Buffer,
    read_only: bool,
}

/// Builds a pipeline for `entry_point` over the given bindings and dispatches
/// it once. Binding 3 always carries the geometry uniform.
fn run_conv_kernel(
    context: &GpuContext,
    entry_point: &str,
    bindings: &[StorageBinding<'_>],
    geometry: &ConvGeometry,
    workgroups: (u32, u32, u32),
) -> Result<()> {
    let device = &context.device;

    let params_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some("conv_geometry"),
        contents: bytemuck::bytes_of(geometry),
        usage: wgpu::BufferUsages::UNIFORM,
    });

    let shader_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some("conv_ops"),
        source: wgpu::ShaderSource::Wgsl(SHADER_SOURCE.into()),
    });

    let mut layout_entries: Vec<wgpu::BindGroupLayoutEntry> = bindings
        .iter()
        .map(|b| wgpu::BindGroupLayoutEntry {
            binding: b.index,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage {
                    read_only: b.read_only,
                },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        })
        .collect();
    layout_entries.push(wgpu::BindGroupLayoutEntry {
        binding: 3,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    });

    let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("conv_bind_group_layout"),
        entries: &layout_entries,
    });

    let mut group_entries: Vec<wgpu::BindGroupEntry> = bindings
        .iter()
        .map(|b| wgpu::BindGroupEntry {
            binding: b.index,
            resource: b.buffer.as_entire_binding(),
        })
        .collect();
    group_entries.push(wgpu::BindGroupEntry {
        binding: 3,
        resource: params_buffer.as_entire_binding(),
    });

    let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("conv_bind_group"),
        layout: &bind_group_layout,
        entries: &group_entries,
    });

    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some("conv_pipeline_layout"),
        bind_group_layouts: &[&bind_group_layout],
        push_constant_ranges: &[],
    });

    let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(entry_point),
        layout: Some(&pipeline_layout),
        module: &shader_module,
        entry_point: Some(entry_point),
        cache: None,
        compilation_options: Default::default(),
    });

    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("conv_encoder"),
    });
    {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(entry_point),
            timestamp_writes: None,
        });
        pass.set_pipeline(&pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(workgroups.0, workgroups.1, workgroups.2);
    }
    context.queue.submit(std::iter::once(encoder.finish()));

    Ok(())
}

fn storage_input(context: &GpuContext, label: &str, data: &[f32]) -> wgpu::Buffer {
    context
        .device
        .create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents: bytemuck::cast_slice(data),
            usage: wgpu::BufferUsages::STORAGE,
        })
}

fn storage_output(context: &GpuContext, label: &str, len: usize) -> wgpu::Buffer {
    context.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size: (len * std::mem::size_of::<f32>()) as u64,
        usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
        mapped_at_creation: false,
    })
}

fn storage_inout(context: &GpuContext, label: &str, data: &[f32]) -> wgpu::Buffer {
    context
        .device
        .create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents: bytemuck::cast_slice(data),
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
        })
}

/// Cross-correlates `input` with `kernel` and returns the output samples.
pub fn convolution_forward(
    geometry: &ConvGeometry,
    input: &[f32],
    kernel: &[f32],
    algorithm: ForwardAlgorithm,
) -> Result<Vec<f32>> {
    geometry.check("convolution_forward", "input", geometry.input_len(), input.len())?;
    geometry.check("convolution_forward", "kernel", geometry.kernel_len(), kernel.len())?;

    let context = GpuContext::global()?;
    let input_buffer = storage_input(context, "conv_input", input);
    let kernel_buffer = storage_input(context, "conv_kernel", kernel);
    let output_buffer = storage_output(context, "conv_output", geometry.output_len());

    let entry_point = match algorithm {
        ForwardAlgorithm::Direct => "conv_forward_direct",
        ForwardAlgorithm::Tiled => "conv_forward_tiled",
    };
    let positions = geometry.out_height * geometry.out_width;
    run_conv_kernel(
        context,
        entry_point,
        &[
            StorageBinding { index: 0, buffer: &input_buffer, read_only: true },
            StorageBinding { index: 1, buffer: &kernel_buffer, read_only: true },
            StorageBinding { index: 2, buffer: &output_buffer, read_only: false },
        ],
        geometry,
        (
            workgroups_for(positions, WORKGROUP_SIZE),
            geometry.out_channels,
            geometry.batch,
        ),
    )?;

    context.read_buffer(&output_buffer, geometry.output_len())
}

/// Propagates output gradients back to input gradients through the kernel.
///
/// Uses a gather formulation: each invocation owns one input element and
/// scans the output positions whose window covers it.
pub fn convolution_backward_data(
    geometry: &ConvGeometry,
    kernel: &[f32],
    grad_output: &[f32],
) -> Result<Vec<f32>> {
    geometry.check(
        "convolution_backward_data",
        "kernel",
        geometry.kernel_len(),
        kernel.len(),
    )?;
    geometry.check(
        "convolution_backward_data",
        "grad_output",
        geometry.output_len(),
        grad_output.len(),
    )?;

    let context = GpuContext::global()?;
    let kernel_buffer = storage_input(context, "conv_kernel", kernel);
    let grad_buffer = storage_input(context, "conv_grad_output", grad_output);
    let output_buffer = storage_output(context, "conv_grad_input", geometry.input_len());

    let positions = geometry.in_height * geometry.in_width;
    run_conv_kernel(
        context,
        "conv_backward_data_direct",
        &[
            StorageBinding { index: 0, buffer: &kernel_buffer, read_only: true },
            StorageBinding { index: 1, buffer: &grad_buffer, read_only: true },
            StorageBinding { index: 2, buffer: &output_buffer, read_only: false },
        ],
        geometry,
        (
            workgroups_for(positions, WORKGROUP_SIZE),
            geometry.in_channels,
            geometry.batch,
        ),
    )?;

    context.read_buffer(&output_buffer, geometry.input_len())
}

/// Accumulates the kernel gradient in place:
/// `kernel_grad = alpha * d(loss)/d(kernel) + beta * kernel_grad`.
///
/// Each invocation owns one filter element and reduces over the whole local
/// mini-batch sequentially, so the result is independent of dispatch order.
pub fn convolution_backward_filter(
    geometry: &ConvGeometry,
    input: &[f32],
    grad_output: &[f32],
    kernel_grad: &mut [f32],
) -> Result<()> {
    geometry.check(
        "convolution_backward_filter",
        "input",
        geometry.input_len(),
        input.len(),
    )?;
    geometry.check(
        "convolution_backward_filter",
        "grad_output",
        geometry.output_len(),
        grad_output.len(),
    )?;
    geometry.check(
        "convolution_backward_filter",
        "kernel_grad",
        geometry.kernel_len(),
        kernel_grad.len(),
    )?;

    let context = GpuContext::global()?;
    let input_buffer = storage_input(context, "conv_input", input);
    let grad_buffer = storage_input(context, "conv_grad_output", grad_output);
    let filter_buffer = storage_inout(context, "conv_kernel_grad", kernel_grad);

    let per_channel = geometry.patch_len() as u32;
    run_conv_kernel(
        context,
        "conv_backward_filter_direct",
        &[
            StorageBinding { index: 0, buffer: &input_buffer, read_only: true },
            StorageBinding { index: 1, buffer: &grad_buffer, read_only: true },
            StorageBinding { index: 2, buffer: &filter_buffer, read_only: false },
        ],
        geometry,
        (
            workgroups_for(per_channel, FILTER_WORKGROUP_SIZE),
            geometry.out_channels,
            1,
        ),
    )?;

    let result = context.read_buffer(&filter_buffer, geometry.kernel_len())?;
    kernel_grad.copy_from_slice(&result);
    Ok(())
}

/// Adds `alpha * bias[channel]` to every output position in place.
pub fn add_bias(geometry: &ConvGeometry, bias: &[f32], output: &mut [f32]) -> Result<()> {
    geometry.check("add_bias", "bias", geometry.out_channels as usize, bias.len())?;
    geometry.check("add_bias", "output", geometry.output_len(), output.len())?;

    let context = GpuContext::global()?;
    let bias_buffer = storage_input(context, "conv_bias", bias);
    let output_buffer = storage_inout(context, "conv_output", output);

    let positions = geometry.out_height * geometry.out_width;
    run_conv_kernel(
        context,
        "add_bias",
        &[
            StorageBinding { index: 0, buffer: &bias_buffer, read_only: true },
            StorageBinding { index: 2, buffer: &output_buffer, read_only: false },
        ],
        geometry,
        (
            workgroups_for(positions, WORKGROUP_SIZE),
            geometry.out_channels,
            geometry.batch,
        ),
    )?;

    let result = context.read_buffer(&output_buffer, geometry.output_len())?;
    output.copy_from_slice(&result);
    Ok(())
}
