//! Elementwise activation functions ("neurons") applied in place to a layer's output.
//!
//! The backward pass only sees the stored output `y`, never the pre-activation input, so every
//! derivative is written in terms of `y`.

use std::marker::PhantomData;

use derive_more::Display;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{
    hal::ops::{NeuronBackwardOp, NeuronForwardOp},
    loom::{
        blob::Blob,
        device::{Device, DeviceError},
        num::Float,
        ops::Access,
    },
};

/// Default floor of [`Neuron::ReLU`], the plain rectifier.
pub const RELU_EPSILON: f64 = 0.0;

#[derive(Debug, Default, Display, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Neuron {
    #[default]
    Identity,
    #[display("ReLU({epsilon})")]
    ReLU { epsilon: f64 },
    #[display("LReLU")]
    LReLU,
    #[display("ExpReLU({t})")]
    ExpReLU { t: f64 },
    #[display("EpsReLU")]
    EpsReLU,
    Sigmoid,
    PSigmoid,
    Tanh,
    Exponential,
}

impl Neuron {
    /// A [`Neuron::ReLU`] with the default floor.
    #[inline]
    pub const fn relu() -> Self {
        Self::ReLU {
            epsilon: RELU_EPSILON,
        }
    }

    /// Stable code identifying the variant inside kernels.
    #[inline]
    pub const fn code(self) -> u32 {
        match self {
            Neuron::Identity => 0,
            Neuron::ReLU { .. } => 1,
            Neuron::LReLU => 2,
            Neuron::ExpReLU { .. } => 3,
            Neuron::EpsReLU => 4,
            Neuron::Sigmoid => 5,
            Neuron::PSigmoid => 6,
            Neuron::Tanh => 7,
            Neuron::Exponential => 8,
        }
    }

    /// The variant's parameter, or zero if it has none.
    #[inline]
    pub const fn param(self) -> f64 {
        match self {
            Neuron::ReLU { epsilon } => epsilon,
            Neuron::ExpReLU { t } => t,
            _ => 0.0,
        }
    }

    /// `y = f(x)`.
    pub fn forward_value<T: Float>(self, x: T) -> T {
        let zero = T::zero();
        let one = T::one();
        match self {
            Neuron::Identity => x,
            Neuron::ReLU { epsilon } => x.max(T::from_f64(epsilon)),
            Neuron::LReLU => match x > zero {
                true => x,
                false => T::from_f64(0.01) * x,
            },
            Neuron::ExpReLU { t } => {
                let t = T::from_f64(t);
                match x < t {
                    true => x.exp(),
                    false => t.exp() + (x - t),
                }
            }
            Neuron::EpsReLU => match x >= zero {
                true => T::from_f64(1e-3) + x,
                false => T::from_f64(1e-3),
            },
            Neuron::Sigmoid => one / (one + (-x).exp()),
            Neuron::PSigmoid => T::from_f64(1e-4) + one / (one + (-x).exp()),
            Neuron::Tanh => x.tanh(),
            Neuron::Exponential => x.exp(),
        }
    }

    /// Factor the gradient is multiplied by, given the stored output `y`.
    ///
    /// `ExpReLU` and `EpsReLU` apply their formulas to `y` as written: `ExpReLU` yields `exp(y)`
    /// below the threshold, and `EpsReLU` yields `[y < 0]`, which is zero for every output it can
    /// produce. `PSigmoid` shares the sigmoid factor `y (1 - y)` and ignores its `1e-4` offset.
    pub fn backward_factor<T: Float>(self, y: T) -> T {
        let zero = T::zero();
        let one = T::one();
        let select = |condition: bool, a: T, b: T| match condition {
            true => a,
            false => b,
        };
        match self {
            Neuron::Identity => one,
            Neuron::ReLU { epsilon } => select(y > T::from_f64(epsilon), one, zero),
            Neuron::LReLU => select(y > zero, one, T::from_f64(0.01)),
            Neuron::ExpReLU { t } => select(y < T::from_f64(t), y.exp(), one),
            Neuron::EpsReLU => select(y < zero, one, zero),
            Neuron::Sigmoid | Neuron::PSigmoid => y * (one - y),
            Neuron::Tanh => one - y * y,
            Neuron::Exponential => y,
        }
    }

    /// Applies the nonlinearity to `output` in place.
    pub fn forward<D: Device, T: Float>(self, output: &mut Blob<D, T>) -> Result<(), DeviceError> {
        if self == Neuron::Identity {
            return Ok(());
        }
        let op = NeuronForwardOp::<T> {
            neuron: self,
            output: output.ir(Access::ReadWrite),
            phantom: PhantomData,
        };
        output.device().execute(&op)
    }

    /// Multiplies `gradient` in place by the derivative evaluated at the transformed `output`.
    pub fn backward<D: Device, T: Float>(
        self,
        output: &Blob<D, T>,
        gradient: &mut Blob<D, T>,
    ) -> Result<(), DeviceError> {
        if self == Neuron::Identity {
            return Ok(());
        }
        let op = NeuronBackwardOp::<T> {
            neuron: self,
            output: output.ir(Access::ReadOnly),
            gradient: gradient.ir(Access::ReadWrite),
            phantom: PhantomData,
        };
        gradient.device().execute(&op)
    }
}
