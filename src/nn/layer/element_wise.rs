use std::marker::PhantomData;

use derive_more::Display;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::{Compute, LayerError, Port, check_count, check_shape};
use crate::{
    hal::ops::{ElementWiseGradOp, ElementWiseOp},
    loom::{blob::Blob, device::Device, num::Float, ops::Access, shape::Shape},
};

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ElementWiseFunctor {
    Add,
    Subtract,
    Multiply,
    Divide,
}

/// Which bottom of a binary layer a gradient flows to.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Lhs,
    Rhs,
}

impl Operand {
    #[inline]
    pub const fn code(self) -> u32 {
        match self {
            Operand::Lhs => 0,
            Operand::Rhs => 1,
        }
    }
}

impl ElementWiseFunctor {
    #[inline]
    pub const fn code(self) -> u32 {
        match self {
            ElementWiseFunctor::Add => 0,
            ElementWiseFunctor::Subtract => 1,
            ElementWiseFunctor::Multiply => 2,
            ElementWiseFunctor::Divide => 3,
        }
    }

    #[inline]
    pub fn value<T: Float>(self, a: T, b: T) -> T {
        match self {
            ElementWiseFunctor::Add => a + b,
            ElementWiseFunctor::Subtract => a - b,
            ElementWiseFunctor::Multiply => a * b,
            ElementWiseFunctor::Divide => a / b,
        }
    }

    /// Gradient flowing to `operand` given the top gradient `delta`.
    #[inline]
    pub fn gradient<T: Float>(self, operand: Operand, a: T, b: T, delta: T) -> T {
        match (self, operand) {
            (ElementWiseFunctor::Add, _) => delta,
            (ElementWiseFunctor::Subtract, Operand::Lhs) => delta,
            (ElementWiseFunctor::Subtract, Operand::Rhs) => -delta,
            (ElementWiseFunctor::Multiply, Operand::Lhs) => delta * b,
            (ElementWiseFunctor::Multiply, Operand::Rhs) => delta * a,
            (ElementWiseFunctor::Divide, Operand::Lhs) => delta / b,
            (ElementWiseFunctor::Divide, Operand::Rhs) => -delta * a / (b * b),
        }
    }
}

/// Two bottoms of equal shape combined elementwise into one top.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ElementWiseConfig {
    pub functor: ElementWiseFunctor,
}

impl From<ElementWiseFunctor> for ElementWiseConfig {
    fn from(functor: ElementWiseFunctor) -> Self {
        Self { functor }
    }
}

#[derive(Debug)]
pub struct ElementWise<T> {
    functor: ElementWiseFunctor,
    phantom: PhantomData<T>,
}

impl<T: Float> ElementWise<T> {
    pub(super) fn setup(
        config: &ElementWiseConfig,
        bottoms: &[Shape],
        tops: usize,
    ) -> Result<(Self, Shape), LayerError> {
        check_count(Port::Bottom, 2, bottoms.len())?;
        check_count(Port::Top, 1, tops)?;
        check_shape(&bottoms[0], &bottoms[1])?;

        let state = Self {
            functor: config.functor,
            phantom: PhantomData,
        };
        Ok((state, bottoms[0].clone()))
    }
}

impl<D: Device, T: Float> Compute<D, T> for ElementWise<T> {
    fn forward(
        &mut self,
        bottoms: &[&Blob<D, T>],
        tops: &mut [&mut Blob<D, T>],
    ) -> Result<(), LayerError> {
        let op = ElementWiseOp::<T> {
            functor: self.functor,
            a: bottoms[0].ir(Access::ReadOnly),
            b: bottoms[1].ir(Access::ReadOnly),
            output: tops[0].ir(Access::WriteOnly),
            phantom: PhantomData,
        };
        tops[0].device().execute(&op)?;
        Ok(())
    }

    fn backward(
        &mut self,
        bottoms: &[&Blob<D, T>],
        top_diffs: &[&Blob<D, T>],
        bottom_diffs: &mut [Option<&mut Blob<D, T>>],
    ) -> Result<(), LayerError> {
        let operands = [Operand::Lhs, Operand::Rhs];
        for (operand, diff) in operands.into_iter().zip(bottom_diffs.iter_mut()) {
            let Some(diff) = diff else {
                continue;
            };
            let op = ElementWiseGradOp::<T> {
                functor: self.functor,
                operand,
                a: bottoms[0].ir(Access::ReadOnly),
                b: bottoms[1].ir(Access::ReadOnly),
                top_diff: top_diffs[0].ir(Access::ReadOnly),
                diff: diff.ir(Access::WriteOnly),
                phantom: PhantomData,
            };
            diff.device().execute(&op)?;
        }
        Ok(())
    }

    fn shutdown(&mut self) {}
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::{ElementWiseFunctor, Operand};
    use crate::{
        loom::{blob::Blob, device::Cpu},
        nn::{
            layer::{Layer, LayerError, LayerKind, LayerState},
            param::ParamRegistry,
        },
    };

    #[test]
    fn test_functor_gradients() {
        let functors = [
            ElementWiseFunctor::Add,
            ElementWiseFunctor::Subtract,
            ElementWiseFunctor::Multiply,
            ElementWiseFunctor::Divide,
        ];
        let (a, b, h) = (1.5f64, -0.75f64, 1e-6);
        for functor in functors {
            let numeric = (functor.value(a + h, b) - functor.value(a - h, b)) / (2.0 * h);
            let analytic = functor.gradient(Operand::Lhs, a, b, 1.0);
            assert!((numeric - analytic).abs() < 1e-6, "{functor} lhs");

            let numeric = (functor.value(a, b + h) - functor.value(a, b - h)) / (2.0 * h);
            let analytic = functor.gradient(Operand::Rhs, a, b, 1.0);
            assert!((numeric - analytic).abs() < 1e-6, "{functor} rhs");
        }
    }

    #[test]
    fn test_element_wise() -> Result<(), Box<dyn Error>> {
        let cpu = Cpu::new();
        let mut registry = ParamRegistry::new();
        let layer = Layer::new("mul", LayerKind::ElementWise(ElementWiseFunctor::Multiply.into()))
            .bottom("a")
            .bottom("b")
            .top("c");

        let a = Blob::create(&cpu, [2, 2], &[1.0f64, 2.0, 3.0, 4.0])?;
        let b = Blob::create(&cpu, [2, 2], &[0.5f64, -1.0, 2.0, 0.0])?;
        let mut da = a.zeros_like()?;
        let mut state = LayerState::setup(&cpu, &layer, &[&a, &b], &[Some(&da), None], &mut registry)?;

        let mut c = Blob::zeros(&cpu, [2, 2])?;
        state.forward(&[&a, &b], &mut [&mut c])?;
        assert_eq!(c.read()?, vec![0.5, -2.0, 6.0, 0.0]);

        let delta = Blob::create(&cpu, [2, 2], &[1.0, 1.0, 2.0, 2.0])?;
        state.backward(&[&a, &b], &[&delta], &mut [Some(&mut da), None])?;
        assert_eq!(da.read()?, vec![0.5, -1.0, 4.0, 0.0]);

        let odd = Blob::create(&cpu, [4, 1], &[0.0f64; 4])?;
        assert!(matches!(
            LayerState::setup(&cpu, &layer, &[&a, &odd], &[None, None], &mut registry),
            Err(LayerError::Shape { .. })
        ));
        Ok(())
    }
}
