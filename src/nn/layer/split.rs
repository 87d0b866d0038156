use std::marker::PhantomData;

use super::{Compute, LayerError, Port, check_count};
use crate::{
    hal::ops::AxpyOp,
    loom::{blob::Blob, device::Device, num::Float, shape::Shape},
};

/// Copies one bottom to every top; the bottom diff is the sum of the top diffs.
#[derive(Debug)]
pub struct Split<T> {
    phantom: PhantomData<T>,
}

impl<T: Float> Split<T> {
    pub(super) fn setup(bottoms: &[Shape], tops: usize) -> Result<(Self, Vec<Shape>), LayerError> {
        check_count(Port::Bottom, 1, bottoms.len())?;
        if tops == 0 {
            return Err(LayerError::Count {
                port: Port::Top,
                expected: 1,
                got: 0,
            });
        }
        let state = Self {
            phantom: PhantomData,
        };
        Ok((state, vec![bottoms[0].clone(); tops]))
    }
}

impl<D: Device, T: Float> Compute<D, T> for Split<T> {
    fn forward(
        &mut self,
        bottoms: &[&Blob<D, T>],
        tops: &mut [&mut Blob<D, T>],
    ) -> Result<(), LayerError> {
        for top in tops.iter_mut() {
            top.copy_from(bottoms[0])?;
        }
        Ok(())
    }

    fn backward(
        &mut self,
        _bottoms: &[&Blob<D, T>],
        top_diffs: &[&Blob<D, T>],
        bottom_diffs: &mut [Option<&mut Blob<D, T>>],
    ) -> Result<(), LayerError> {
        let Some(diff) = bottom_diffs[0].as_deref_mut() else {
            return Ok(());
        };
        let (first, rest) = top_diffs.split_first().ok_or(LayerError::Count {
            port: Port::Top,
            expected: 1,
            got: 0,
        })?;
        diff.copy_from(first)?;
        for top_diff in rest {
            AxpyOp::run(1.0, top_diff, diff)?;
        }
        Ok(())
    }

    fn shutdown(&mut self) {}
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use crate::{
        loom::{blob::Blob, device::Cpu},
        nn::{
            layer::{Layer, LayerError, LayerKind, LayerState},
            param::ParamRegistry,
        },
    };

    #[test]
    fn test_split() -> Result<(), Box<dyn Error>> {
        let cpu = Cpu::new();
        let mut registry = ParamRegistry::new();
        let layer = Layer::new("split", LayerKind::Split)
            .bottom("z")
            .top("z0")
            .top("z1")
            .top("z2");

        let z = Blob::create(&cpu, [3, 1], &[1.0f64, 2.0, 3.0])?;
        let mut dz = z.zeros_like()?;
        let mut state = LayerState::setup(&cpu, &layer, &[&z], &[Some(&dz)], &mut registry)?;
        assert_eq!(state.top_shapes().len(), 3);

        let mut z0 = z.zeros_like()?;
        let mut z1 = z.zeros_like()?;
        let mut z2 = z.zeros_like()?;
        state.forward(&[&z], &mut [&mut z0, &mut z1, &mut z2])?;
        assert_eq!(z2.read()?, vec![1.0, 2.0, 3.0]);

        let d0 = Blob::create(&cpu, [3, 1], &[1.0, 0.0, 0.0])?;
        let d1 = Blob::create(&cpu, [3, 1], &[0.0, 1.0, 0.0])?;
        let d2 = Blob::create(&cpu, [3, 1], &[0.5, 0.5, 0.5])?;
        state.backward(&[&z], &[&d0, &d1, &d2], &mut [Some(&mut dz)])?;
        assert_eq!(dz.read()?, vec![1.5, 1.5, 0.5]);

        assert!(matches!(
            state.backward(&[&z], &[&d0, &d1], &mut [Some(&mut dz)]),
            Err(LayerError::Count { .. })
        ));
        Ok(())
    }
}
