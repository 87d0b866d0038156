use std::marker::PhantomData;

use derive_more::{Deref, Display};
use thiserror::Error;

use super::{
    device::{Device, DeviceError},
    num::{DataType, Scalar},
    ops::{Access, BlobIr},
    shape::{IntoShape, Shape, ShapeError},
};

#[derive(Debug, Error)]
pub enum BlobError {
    #[error(transparent)]
    Shape(#[from] ShapeError),
    #[error("blob creation error: shape {0}'s size not match data len {1}")]
    Create(Shape, usize),
    #[error("blob write error: shape {0}'s size not match data len {1}")]
    Write(Shape, usize),
    #[error("blob copy error: shape {0} not match shape {1}")]
    Copy(Shape, Shape),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Deref)]
pub struct BlobId(uid::Id<BlobId>);

impl BlobId {
    #[inline]
    pub fn new() -> Self {
        Self(uid::Id::new())
    }
}

/// A device-resident buffer of fixed shape.
///
/// The storage lives in the device's pool. It is freed by [`Blob::release`] or when the handle drops,
/// so every exit path gives the memory back.
#[derive(Debug)]
pub struct Blob<D: Device, T: Scalar> {
    device: D,
    shape: Shape,
    id: BlobId,
    phantom: PhantomData<T>,
}

impl<D: Device, T: Scalar> Blob<D, T> {
    /// Create a blob of zeros.
    pub fn zeros(device: &D, shape: impl IntoShape) -> Result<Self, BlobError> {
        let shape = shape.into_shape()?;
        let id = BlobId::new();
        device.alloc(id, shape.count() * size_of::<T>())?;
        let device = device.clone();
        let phantom = PhantomData;
        Ok(Self {
            device,
            shape,
            id,
            phantom,
        })
    }

    /// Create a blob with the given shape and contents.
    pub fn create(device: &D, shape: impl IntoShape, contents: &[T]) -> Result<Self, BlobError> {
        let shape = shape.into_shape()?;
        if shape.count() != contents.len() {
            return Err(BlobError::Create(shape, contents.len()));
        }
        let id = BlobId::new();
        device.create(id, bytemuck::cast_slice(contents))?;
        let device = device.clone();
        let phantom = PhantomData;
        Ok(Self {
            device,
            shape,
            id,
            phantom,
        })
    }

    /// Create a blob of zeros on the same device and of the same shape.
    #[inline]
    pub fn zeros_like(&self) -> Result<Self, BlobError> {
        Self::zeros(&self.device, &self.shape)
    }

    #[inline]
    pub fn device(&self) -> &D {
        &self.device
    }

    #[inline]
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    #[inline]
    pub fn id(&self) -> BlobId {
        self.id
    }

    #[inline]
    pub fn data_type(&self) -> DataType {
        T::DATA_TYPE
    }

    /// Number of elements.
    #[inline]
    pub fn count(&self) -> usize {
        self.shape.count()
    }

    #[inline]
    pub fn data_size(&self) -> usize {
        self.shape.count() * size_of::<T>()
    }

    #[inline]
    pub fn ir(&self, access: Access) -> BlobIr {
        BlobIr {
            id: self.id,
            device: self.device.id(),
            shape: self.shape.clone(),
            r#type: T::DATA_TYPE,
            access,
        }
    }

    /// Copy the contents back to the host.
    pub fn read(&self) -> Result<Vec<T>, BlobError> {
        let data = self.device.read(self.id)?;
        Ok(bytemuck::pod_collect_to_vec(&data[..self.data_size()]))
    }

    /// Overwrite the contents from the host.
    pub fn write(&mut self, contents: &[T]) -> Result<(), BlobError> {
        if self.count() != contents.len() {
            return Err(BlobError::Write(self.shape.clone(), contents.len()));
        }
        self.device.write(self.id, bytemuck::cast_slice(contents))?;
        Ok(())
    }

    #[inline]
    pub fn fill(&mut self, value: T) -> Result<(), BlobError> {
        self.write(&vec![value; self.count()])
    }

    /// Copy the contents of another blob of the same shape.
    pub fn copy_from(&mut self, src: &Blob<D, T>) -> Result<(), BlobError> {
        if self.shape != src.shape {
            return Err(BlobError::Copy(self.shape.clone(), src.shape.clone()));
        }
        self.device.copy(src.id, self.id)?;
        Ok(())
    }

    /// Free the device storage now.
    #[inline]
    pub fn release(self) {
        drop(self)
    }
}

impl<D: Device, T: Scalar> Drop for Blob<D, T> {
    fn drop(&mut self) {
        self.device.release(self.id);
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::{Blob, BlobError};
    use crate::loom::device::Cpu;

    #[test]
    fn test_blob_io() -> Result<(), Box<dyn Error>> {
        let cpu = Cpu::new();
        let data = (0..12).map(|x| x as f32).collect::<Vec<_>>();

        let mut a = Blob::create(&cpu, [3, 4], &data)?;
        assert_eq!(a.read()?, data);
        assert_eq!(a.shape().batch(), 4);

        a.fill(0.5)?;
        assert_eq!(a.read()?, vec![0.5; 12]);

        let mut b = a.zeros_like()?;
        assert_eq!(b.read()?, vec![0.0; 12]);
        b.copy_from(&a)?;
        assert_eq!(b.read()?, vec![0.5; 12]);

        assert!(matches!(
            Blob::<_, f32>::create(&cpu, [3, 3], &data),
            Err(BlobError::Create(..))
        ));
        assert!(matches!(a.write(&data[..5]), Err(BlobError::Write(..))));

        let c = Blob::<_, f32>::zeros(&cpu, [4, 3])?;
        assert!(matches!(b.copy_from(&c), Err(BlobError::Copy(..))));
        Ok(())
    }
}
