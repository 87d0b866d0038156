//! Compute-shader kernels for [`Gpu`]. Only `f32` ops are registered; other element types are
//! reported as unsupported by the device.

use wgpu::util::DeviceExt;

use crate::{
    hal::ops::{
        AxpyOp, ElementWiseGradOp, ElementWiseOp, EncoderGradOp, EncoderLossOp,
        GaussianReconGradOp, GaussianReconLossOp, GemmOp, NeuronBackwardOp, NeuronForwardOp,
    },
    loom::{
        device::{DeviceError, Gpu, GpuBuilder, gpu::Shader},
        ops::BlobIr,
    },
};

mod elementwise;
mod linalg;
mod loss;
mod neuron;
pub mod shader;

/// Invocations per workgroup, matching `@workgroup_size` of every kernel.
pub const WORKGROUP_SIZE: usize = 64;
/// Maximum workgroups along one grid dimension.
const MAX_GROUPS: usize = 65535;

/// Kernel parameters bound as the uniform at binding 0. The first word is always the element count.
#[derive(Debug, Clone)]
pub struct Uniform(Vec<u32>);

impl Uniform {
    pub fn new(len: usize) -> Result<Self, DeviceError> {
        Self(vec![]).usize(len)
    }

    /// Pushes a count or dimension, failing if it does not fit in a `u32`.
    pub fn usize(self, value: usize) -> Result<Self, DeviceError> {
        let value = u32::try_from(value).map_err(|_| DeviceError::Range(value))?;
        Ok(self.u32(value))
    }

    #[inline]
    pub fn u32(mut self, value: u32) -> Self {
        self.0.push(value);
        self
    }

    #[inline]
    pub fn f32(mut self, value: f32) -> Self {
        self.0.push(value.to_bits());
        self
    }

    /// Contents padded to 16 bytes.
    fn into_bytes(self) -> Vec<u8> {
        let mut words = self.0;
        words.resize(words.len().next_multiple_of(4), 0);
        bytemuck::cast_slice(&words).to_vec()
    }
}

/// Grid covering `count` invocations.
fn dispatch_size(count: usize) -> (u32, u32) {
    let groups = count.div_ceil(WORKGROUP_SIZE).max(1);
    let x = groups.min(MAX_GROUPS);
    let y = groups.div_ceil(x);
    (x as u32, y as u32)
}

impl Gpu {
    /// Runs `shader` over `count` elements with `bindings` attached after the uniform.
    pub fn launch(
        &self,
        shader: &Shader,
        uniform: Uniform,
        bindings: &[&BlobIr],
        count: usize,
    ) -> Result<(), DeviceError> {
        let device = self.device();
        let pipeline = self.pipeline(shader);

        let params = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(shader.name),
            contents: &uniform.into_bytes(),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let buffers = bindings
            .iter()
            .map(|ir| self.fetch(ir.id))
            .collect::<Result<Vec<_>, _>>()?;

        let entries = std::iter::once(params.as_entire_binding())
            .chain(buffers.iter().map(|buffer| buffer.as_entire_binding()))
            .enumerate()
            .map(|(binding, resource)| wgpu::BindGroupEntry {
                binding: binding as u32,
                resource,
            })
            .collect::<Vec<_>>();
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(shader.name),
            layout: &pipeline.get_bind_group_layout(0),
            entries: &entries,
        });

        let (x, y) = dispatch_size(count);
        let mut encoder = device.create_command_encoder(&Default::default());
        {
            let mut pass = encoder.begin_compute_pass(&Default::default());
            pass.set_pipeline(&pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(x, y, 1);
        }
        self.queue().submit(Some(encoder.finish()));
        Ok(())
    }
}

impl GpuBuilder {
    /// Registers every built-in op for `f32`.
    pub fn add_default_ops(self) -> Self {
        self.add_op::<NeuronForwardOp<f32>>()
            .add_op::<NeuronBackwardOp<f32>>()
            .add_op::<GaussianReconLossOp<f32>>()
            .add_op::<GaussianReconGradOp<f32>>()
            .add_op::<EncoderLossOp<f32>>()
            .add_op::<EncoderGradOp<f32>>()
            .add_op::<GemmOp<f32>>()
            .add_op::<AxpyOp<f32>>()
            .add_op::<ElementWiseOp<f32>>()
            .add_op::<ElementWiseGradOp<f32>>()
    }
}
