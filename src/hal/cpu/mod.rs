//! Reference kernels for [`Cpu`](crate::loom::device::Cpu). Every kernel is registered for both `f32` and `f64`.
//!
//! Elementwise loops run on `rayon` when the feature is enabled; each element is computed
//! independently, so results do not depend on the thread count.

use crate::{
    hal::ops::{
        AxpyOp, ElementWiseGradOp, ElementWiseOp, EncoderGradOp, EncoderLossOp,
        GaussianReconGradOp, GaussianReconLossOp, GemmOp, NeuronBackwardOp, NeuronForwardOp,
    },
    loom::{
        device::CpuBuilder,
        num::Float,
    },
};

/// Binds the slice of a read-only blob: `bind_read!(device, name: ir, T)`.
macro_rules! bind_read {
    ($device:expr, $name:ident: $ir:expr, $t:ty) => {
        let $name = $device.fetch($ir.id)?;
        let $name = $name.read().expect("failed to lock");
        let $name = $name.as_slice::<$t>();
    };
}

/// Binds the mutable slice of a written blob: `bind_write!(device, name: ir, T)`.
macro_rules! bind_write {
    ($device:expr, $name:ident: $ir:expr, $t:ty) => {
        let $name = $device.fetch($ir.id)?;
        let mut $name = $name.write().expect("failed to lock");
        let $name = $name.as_mut_slice::<$t>();
    };
}

mod elementwise;
mod linalg;
mod loss;
mod neuron;

/// Runs `f(index, element)` over every element of `output`.
pub(crate) fn for_each_mut<T, F>(output: &mut [T], f: F)
where
    T: Send,
    F: Fn(usize, &mut T) + Send + Sync,
{
    #[cfg(not(feature = "rayon"))]
    output.iter_mut().enumerate().for_each(|(index, x)| f(index, x));
    #[cfg(feature = "rayon")]
    {
        use rayon::prelude::*;
        output
            .par_iter_mut()
            .enumerate()
            .for_each(|(index, x)| f(index, x));
    }
}

/// Runs `f(index, chunk)` over consecutive chunks of `size` elements.
pub(crate) fn for_each_chunk_mut<T, F>(output: &mut [T], size: usize, f: F)
where
    T: Send,
    F: Fn(usize, &mut [T]) + Send + Sync,
{
    #[cfg(not(feature = "rayon"))]
    output
        .chunks_mut(size)
        .enumerate()
        .for_each(|(index, x)| f(index, x));
    #[cfg(feature = "rayon")]
    {
        use rayon::prelude::*;
        output
            .par_chunks_mut(size)
            .enumerate()
            .for_each(|(index, x)| f(index, x));
    }
}

impl CpuBuilder {
    fn add_float_ops<T: Float>(self) -> Self {
        self.add_op::<NeuronForwardOp<T>>()
            .add_op::<NeuronBackwardOp<T>>()
            .add_op::<GaussianReconLossOp<T>>()
            .add_op::<GaussianReconGradOp<T>>()
            .add_op::<EncoderLossOp<T>>()
            .add_op::<EncoderGradOp<T>>()
            .add_op::<GemmOp<T>>()
            .add_op::<AxpyOp<T>>()
            .add_op::<ElementWiseOp<T>>()
            .add_op::<ElementWiseGradOp<T>>()
    }

    /// Registers every built-in op for `f32` and `f64`.
    pub fn add_default_ops(self) -> Self {
        self.add_float_ops::<f32>().add_float_ops::<f64>()
    }
}
