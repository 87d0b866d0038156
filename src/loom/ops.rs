use std::{any::Any, fmt::Debug};

use derive_more::Display;
use itertools::Itertools;

use super::{
    blob::BlobId,
    device::{DeviceError, DeviceId},
    num::DataType,
    shape::Shape,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display)]
pub enum Access {
    ReadOnly,
    ReadWrite,
    WriteOnly,
}

impl Access {
    #[inline]
    pub fn writes(self) -> bool {
        !matches!(self, Access::ReadOnly)
    }
}

/// Describes how an op touches one blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobIr {
    pub id: BlobId,
    pub device: DeviceId,
    pub shape: Shape,
    pub r#type: DataType,
    pub access: Access,
}

impl BlobIr {
    #[inline]
    pub fn count(&self) -> usize {
        self.shape.count()
    }

    #[inline]
    pub fn data_size(&self) -> usize {
        self.shape.count() * self.r#type.size()
    }
}

/// A single kernel invocation: the blobs it touches plus its parameters.
pub trait BlobOp: Any + Debug + Send + Sync {
    /// Input and output blobs.
    fn io(&self) -> Vec<BlobIr>;

    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

impl dyn BlobOp {
    #[inline]
    pub fn downcast_ref<Op: BlobOp>(&self) -> Option<&Op> {
        let any: &dyn Any = self;
        any.downcast_ref::<Op>()
    }

    /// Type id of the concrete op behind the trait object.
    #[inline]
    pub fn op_type(&self) -> std::any::TypeId {
        let any: &dyn Any = self;
        Any::type_id(any)
    }
}

/// Implemented for each [`Device`](super::device::Device) for each [`BlobOp`].
/// Defines an op's actual execution on the device.
pub trait DeviceOp<D>: BlobOp {
    fn execute(&self, device: &D) -> Result<(), DeviceError>;
}

/// Checks that every blob belongs to `device` and that no blob written by the op is touched twice.
pub fn check_io(device: DeviceId, io: &[BlobIr]) -> Result<(), DeviceError> {
    if let Some(ir) = io.iter().find(|ir| ir.device != device) {
        return Err(DeviceError::Foreign(ir.id));
    }
    for (x, y) in io.iter().tuple_combinations() {
        if x.id == y.id && (x.access.writes() || y.access.writes()) {
            return Err(DeviceError::Alias(x.id));
        }
    }
    Ok(())
}
