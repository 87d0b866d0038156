use std::{
    any::TypeId,
    sync::{Arc, RwLock},
};

use rustc_hash::FxHashMap as HashMap;

use super::{Device, DeviceError, DeviceId, OpVTable, dispatch};
use crate::loom::{
    blob::BlobId,
    num::Scalar,
    ops::{BlobOp, DeviceOp},
};

/// Host memory backing one blob. Stored as words so every supported scalar is aligned.
#[derive(Debug, Clone)]
pub struct Buffer {
    words: Vec<u64>,
    size: usize,
}

impl Buffer {
    #[inline]
    pub fn zeroed(size: usize) -> Self {
        let words = vec![0; size.div_ceil(size_of::<u64>())];
        Self { words, size }
    }

    #[inline]
    pub fn from_bytes(contents: &[u8]) -> Self {
        let mut buffer = Self::zeroed(contents.len());
        buffer.as_bytes_mut().copy_from_slice(contents);
        buffer
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<u64, u8>(&self.words)[..self.size]
    }

    #[inline]
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut::<u64, u8>(&mut self.words)[..self.size]
    }

    #[inline]
    pub fn as_slice<T: Scalar>(&self) -> &[T] {
        bytemuck::cast_slice(self.as_bytes())
    }

    #[inline]
    pub fn as_mut_slice<T: Scalar>(&mut self) -> &mut [T] {
        bytemuck::cast_slice_mut(self.as_bytes_mut())
    }
}

type BufferPool = HashMap<BlobId, Arc<RwLock<Buffer>>>;

#[derive(Debug, Clone)]
pub struct Cpu {
    /// The unique identifier of the device.
    id: DeviceId,
    /// Operators that the device is able to execute.
    ops: Arc<OpVTable<Self>>,
    /// Pool of CPU buffers.
    buffers: Arc<RwLock<BufferPool>>,
}

impl Cpu {
    /// Creates a CPU device with every built-in op registered.
    #[inline]
    pub fn new() -> Self {
        CpuBuilder::new().add_default_ops().build()
    }

    #[inline]
    pub fn fetch(&self, id: BlobId) -> Result<Arc<RwLock<Buffer>>, DeviceError> {
        self.buffers
            .read()
            .expect("failed to lock")
            .get(&id)
            .cloned()
            .ok_or(DeviceError::Blob(id))
    }

    /// Number of live buffers in the pool.
    #[inline]
    pub fn buffer_count(&self) -> usize {
        self.buffers.read().expect("failed to lock").len()
    }

    fn insert(&self, id: BlobId, buffer: Buffer) {
        self.buffers
            .write()
            .expect("failed to lock")
            .insert(id, Arc::new(RwLock::new(buffer)));
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for Cpu {
    const NAME: &'static str = "cpu";

    #[inline]
    fn id(&self) -> DeviceId {
        self.id
    }

    fn alloc(&self, id: BlobId, size: usize) -> Result<(), DeviceError> {
        self.insert(id, Buffer::zeroed(size));
        Ok(())
    }

    fn create(&self, id: BlobId, contents: &[u8]) -> Result<(), DeviceError> {
        self.insert(id, Buffer::from_bytes(contents));
        Ok(())
    }

    fn write(&self, id: BlobId, contents: &[u8]) -> Result<(), DeviceError> {
        let buffer = self.fetch(id)?;
        let mut buffer = buffer.write().expect("failed to lock");
        if buffer.size() != contents.len() {
            let size = buffer.size();
            let len = contents.len();
            return Err(DeviceError::Size { id, size, len });
        }
        buffer.as_bytes_mut().copy_from_slice(contents);
        Ok(())
    }

    fn read(&self, id: BlobId) -> Result<Box<[u8]>, DeviceError> {
        let buffer = self.fetch(id)?;
        let buffer = buffer.read().expect("failed to lock");
        Ok(buffer.as_bytes().into())
    }

    fn copy(&self, src: BlobId, dst: BlobId) -> Result<(), DeviceError> {
        if src == dst {
            return Ok(());
        }
        let src = self.fetch(src)?;
        let dst_buffer = self.fetch(dst)?;
        let src = src.read().expect("failed to lock");
        let mut dst_buffer = dst_buffer.write().expect("failed to lock");
        if src.size() != dst_buffer.size() {
            let size = dst_buffer.size();
            let len = src.size();
            return Err(DeviceError::Size { id: dst, size, len });
        }
        dst_buffer.as_bytes_mut().copy_from_slice(src.as_bytes());
        Ok(())
    }

    fn release(&self, id: BlobId) -> bool {
        self.buffers
            .write()
            .expect("failed to lock")
            .remove(&id)
            .is_some()
    }

    #[inline]
    fn execute(&self, op: &dyn BlobOp) -> Result<(), DeviceError> {
        dispatch(self, &self.ops, op)
    }
}

#[derive(Debug, Default, Clone)]
pub struct CpuBuilder {
    pub ops: OpVTable<Cpu>,
}

impl CpuBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build(self) -> Cpu {
        let id = DeviceId::new();
        let ops = Arc::new(self.ops);
        let buffers = Arc::new(RwLock::new(HashMap::default()));
        Cpu { id, ops, buffers }
    }

    pub fn add_op<Op: DeviceOp<Cpu>>(mut self) -> Self {
        let id = TypeId::of::<Op>();
        self.ops.insert(id, |device, op| match op.downcast_ref::<Op>() {
            Some(op) => op.execute(device),
            None => unreachable!(),
        });
        self
    }
}
