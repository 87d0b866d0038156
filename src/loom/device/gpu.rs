use std::{
    any::TypeId,
    borrow::Cow,
    sync::{Arc, Mutex},
};

use rustc_hash::FxHashMap as HashMap;
use thiserror::Error;
use wgpu::util::DeviceExt;

use super::{Device, DeviceError, DeviceId, OpVTable, dispatch};
use crate::loom::{
    blob::BlobId,
    ops::{BlobOp, DeviceOp},
};

/// A compute shader with a single `main` entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Shader {
    pub name: &'static str,
    pub source: &'static str,
}

#[derive(Debug)]
struct Context {
    /// Handle to a WebGPU compute device.
    device: wgpu::Device,
    /// The WebGPU command queue.
    queue: wgpu::Queue,
    /// Operators that the device is able to execute.
    ops: OpVTable<Gpu>,
    /// Pool of GPU buffers.
    buffers: Mutex<HashMap<BlobId, wgpu::Buffer>>,
    /// Compiled pipelines keyed by shader name.
    pipelines: Mutex<HashMap<&'static str, wgpu::ComputePipeline>>,
}

#[derive(Debug, Clone)]
pub struct Gpu {
    /// The unique identifier of the device.
    id: DeviceId,
    context: Arc<Context>,
}

const STORAGE_USAGES: wgpu::BufferUsages = wgpu::BufferUsages::STORAGE
    .union(wgpu::BufferUsages::COPY_DST)
    .union(wgpu::BufferUsages::COPY_SRC);

impl Gpu {
    #[inline]
    pub fn device(&self) -> &wgpu::Device {
        &self.context.device
    }

    #[inline]
    pub fn queue(&self) -> &wgpu::Queue {
        &self.context.queue
    }

    #[inline]
    pub fn fetch(&self, id: BlobId) -> Result<wgpu::Buffer, DeviceError> {
        self.context
            .buffers
            .lock()
            .expect("failed to lock")
            .get(&id)
            .cloned()
            .ok_or(DeviceError::Blob(id))
    }

    /// Number of live buffers in the pool.
    #[inline]
    pub fn buffer_count(&self) -> usize {
        self.context.buffers.lock().expect("failed to lock").len()
    }

    /// Returns the compiled pipeline of `shader`, compiling it on first use.
    pub fn pipeline(&self, shader: &Shader) -> wgpu::ComputePipeline {
        let mut pipelines = self.context.pipelines.lock().expect("failed to lock");
        if let Some(pipeline) = pipelines.get(shader.name) {
            return pipeline.clone();
        }

        log::debug!("compiling shader {}", shader.name);
        let device = self.device();
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(shader.name),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(shader.source)),
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(shader.name),
            layout: None,
            module: &module,
            entry_point: Some("main"),
            compilation_options: Default::default(),
            cache: None,
        });
        pipelines.insert(shader.name, pipeline.clone());
        pipeline
    }

    fn insert(&self, id: BlobId, buffer: wgpu::Buffer) {
        let replaced = self
            .context
            .buffers
            .lock()
            .expect("failed to lock")
            .insert(id, buffer);
        if let Some(buffer) = replaced {
            buffer.destroy();
        }
    }
}

/// Buffer sizes must be a multiple of [`wgpu::COPY_BUFFER_ALIGNMENT`].
#[inline]
fn aligned_size(size: usize) -> u64 {
    (size as u64).next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT)
}

impl Device for Gpu {
    const NAME: &'static str = "gpu";

    #[inline]
    fn id(&self) -> DeviceId {
        self.id
    }

    fn alloc(&self, id: BlobId, size: usize) -> Result<(), DeviceError> {
        let buffer = self.device().create_buffer(&wgpu::BufferDescriptor {
            label: None,
            size: aligned_size(size),
            usage: STORAGE_USAGES,
            mapped_at_creation: false,
        });
        self.insert(id, buffer);
        Ok(())
    }

    fn create(&self, id: BlobId, contents: &[u8]) -> Result<(), DeviceError> {
        let buffer = self
            .device()
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: None,
                contents,
                usage: STORAGE_USAGES,
            });
        self.insert(id, buffer);
        Ok(())
    }

    fn write(&self, id: BlobId, contents: &[u8]) -> Result<(), DeviceError> {
        let buffer = self.fetch(id)?;
        if buffer.size() != aligned_size(contents.len()) {
            let size = buffer.size() as usize;
            let len = contents.len();
            return Err(DeviceError::Size { id, size, len });
        }
        self.queue().write_buffer(&buffer, 0, contents);
        Ok(())
    }

    fn read(&self, id: BlobId) -> Result<Box<[u8]>, DeviceError> {
        let buffer = self.fetch(id)?;
        let device = self.device();
        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: None,
            size: buffer.size(),
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = device.create_command_encoder(&Default::default());
        encoder.copy_buffer_to_buffer(&buffer, 0, &staging, 0, buffer.size());
        self.queue().submit(Some(encoder.finish()));

        let (sender, receiver) = flume::bounded(1);
        let slice = staging.slice(..);
        slice.map_async(wgpu::MapMode::Read, move |result| _ = sender.send(result));
        device.poll(wgpu::PollType::Wait)?;
        receiver.recv()??;

        let data: Box<[u8]> = slice.get_mapped_range().to_vec().into_boxed_slice();
        staging.unmap();
        staging.destroy();
        Ok(data)
    }

    fn copy(&self, src: BlobId, dst: BlobId) -> Result<(), DeviceError> {
        if src == dst {
            return Ok(());
        }
        let src = self.fetch(src)?;
        let dst_buffer = self.fetch(dst)?;
        if src.size() != dst_buffer.size() {
            let size = dst_buffer.size() as usize;
            let len = src.size() as usize;
            return Err(DeviceError::Size { id: dst, size, len });
        }
        let mut encoder = self.device().create_command_encoder(&Default::default());
        encoder.copy_buffer_to_buffer(&src, 0, &dst_buffer, 0, src.size());
        self.queue().submit(Some(encoder.finish()));
        Ok(())
    }

    fn release(&self, id: BlobId) -> bool {
        let buffer = self
            .context
            .buffers
            .lock()
            .expect("failed to lock")
            .remove(&id);
        match buffer {
            Some(buffer) => {
                buffer.destroy();
                true
            }
            None => false,
        }
    }

    #[inline]
    fn execute(&self, op: &dyn BlobOp) -> Result<(), DeviceError> {
        dispatch(self, &self.context.ops, op)
    }
}

pub struct GpuBuilder {
    pub adapter: wgpu::Adapter,
    pub features: wgpu::Features,
    pub limits: wgpu::Limits,
    pub ops: OpVTable<Gpu>,
}

#[derive(Debug, Error)]
pub enum GpuBuildError {
    #[error("failed to request adaptor")]
    RequestAdapterError(#[from] wgpu::RequestAdapterError),
    #[error("failed to request device")]
    RequestDeviceError(#[from] wgpu::RequestDeviceError),
}

impl GpuBuilder {
    pub fn new(adapter: wgpu::Adapter) -> Self {
        Self {
            adapter,
            features: wgpu::Features::empty(),
            limits: Default::default(),
            ops: Default::default(),
        }
    }

    /// Requests the default adapter of the default instance.
    pub async fn request() -> Result<Self, GpuBuildError> {
        let instance = wgpu::Instance::default();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions::default())
            .await?;
        Ok(Self::new(adapter))
    }

    pub async fn build(self) -> Result<Gpu, GpuBuildError> {
        let Self {
            adapter,
            features,
            limits,
            ops,
        } = self;

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: None,
                required_features: features,
                required_limits: limits,
                memory_hints: wgpu::MemoryHints::Performance,
                trace: wgpu::Trace::Off,
            })
            .await?;

        let buffers = Mutex::new(HashMap::default());
        let pipelines = Mutex::new(HashMap::default());
        let context = Arc::new(Context {
            device,
            queue,
            ops,
            buffers,
            pipelines,
        });

        let id = DeviceId::new();
        Ok(Gpu { id, context })
    }

    pub fn limits(mut self, limits: wgpu::Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn features(mut self, features: wgpu::Features) -> Self {
        self.features = features;
        self
    }

    pub fn add_op<Op: DeviceOp<Gpu>>(mut self) -> Self {
        let id = TypeId::of::<Op>();
        self.ops.insert(id, |device, op| match op.downcast_ref::<Op>() {
            Some(op) => op.execute(device),
            None => unreachable!(),
        });
        self
    }
}
