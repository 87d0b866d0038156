use std::{any::TypeId, fmt::Debug};

use derive_more::{Deref, Display};
use rustc_hash::FxHashMap as HashMap;
use thiserror::Error;

use super::{
    blob::BlobId,
    ops::{BlobOp, check_io},
};

pub use cpu::{Cpu, CpuBuilder};
pub use gpu::{Gpu, GpuBuildError, GpuBuilder};

pub mod cpu;
pub mod gpu;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Deref)]
pub struct DeviceId(uid::Id<DeviceId>);

impl DeviceId {
    #[inline]
    pub fn new() -> Self {
        Self(uid::Id::new())
    }
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device error: blob {0} not found")]
    Blob(BlobId),
    #[error("device error: blob {0} belongs to another device")]
    Foreign(BlobId),
    #[error("violation of write uniqueness rule: {0}")]
    Alias(BlobId),
    #[error("device error: blob {id} holds {size} bytes, got {len}")]
    Size { id: BlobId, size: usize, len: usize },
    #[error("device error: {device} is unable to execute op {op}")]
    Unsupported {
        device: &'static str,
        op: &'static str,
    },
    #[error("device error: {0} exceeds the 32-bit range of a kernel parameter")]
    Range(usize),
    #[error(transparent)]
    Recv(#[from] flume::RecvError),
    #[error(transparent)]
    Map(#[from] wgpu::BufferAsyncError),
    #[error(transparent)]
    Poll(#[from] wgpu::PollError),
}

/// An execution context owning the storage of every blob created on it.
///
/// Handles are cheap to clone and share the same storage pool.
pub trait Device: Debug + Clone + Send + Sync + 'static {
    /// Short name of the device kind, used in diagnostics.
    const NAME: &'static str;

    fn id(&self) -> DeviceId;
    /// Allocates zeroed storage of `size` bytes for `id`.
    fn alloc(&self, id: BlobId, size: usize) -> Result<(), DeviceError>;
    /// Allocates storage for `id` initialized with `contents`.
    fn create(&self, id: BlobId, contents: &[u8]) -> Result<(), DeviceError>;
    /// Overwrites the storage of `id` with `contents`; sizes must match.
    fn write(&self, id: BlobId, contents: &[u8]) -> Result<(), DeviceError>;
    /// Copies the storage of `id` back to the host.
    fn read(&self, id: BlobId) -> Result<Box<[u8]>, DeviceError>;
    /// Copies the storage of `src` into `dst`; sizes must match.
    fn copy(&self, src: BlobId, dst: BlobId) -> Result<(), DeviceError>;
    /// Frees the storage of `id`. Returns `false` if it was already released.
    fn release(&self, id: BlobId) -> bool;
    /// Runs an op on this device.
    fn execute(&self, op: &dyn BlobOp) -> Result<(), DeviceError>;
}

type OpFn<D> = fn(&D, &dyn BlobOp) -> Result<(), DeviceError>;
type OpVTable<D> = HashMap<TypeId, OpFn<D>>;

/// Validates the op's io and runs the kernel registered for its concrete type.
fn dispatch<D: Device>(device: &D, ops: &OpVTable<D>, op: &dyn BlobOp) -> Result<(), DeviceError> {
    check_io(device.id(), &op.io())?;
    match ops.get(&op.op_type()) {
        Some(f) => f(device, op),
        None => {
            log::error!("unable to execute op of type {} on {}", op.name(), D::NAME);
            Err(DeviceError::Unsupported {
                device: D::NAME,
                op: op.name(),
            })
        }
    }
}
