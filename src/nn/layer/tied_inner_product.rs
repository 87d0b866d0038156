use std::sync::Arc;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::{Compute, Layer, LayerError, Port, check_count, inner_product::ones};
use crate::{
    hal::ops::Gemm,
    loom::{blob::Blob, device::Device, num::Float, shape::Shape},
    nn::{
        neuron::Neuron,
        param::{Initializer, Param, ParamRegistry, rng},
    },
};

/// Decoder half of a weight-shared pair: `top = W X + b 1ᵀ`, where `W` is the `D × P` weight
/// of the inner product registered under `tied_param_key`. The bias is the layer's own.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TiedInnerProductConfig {
    pub tied_param_key: String,
    pub neuron: Neuron,
    pub bias: bool,
    pub bias_init: Initializer,
    pub bias_lr_mult: f64,
    pub seed: Option<u64>,
}

impl TiedInnerProductConfig {
    pub fn new(tied_param_key: impl Into<String>) -> Self {
        Self {
            tied_param_key: tied_param_key.into(),
            neuron: Neuron::Identity,
            bias: true,
            bias_init: Initializer::Constant(0.0),
            bias_lr_mult: 1.0,
            seed: None,
        }
    }

    pub fn neuron(mut self, neuron: Neuron) -> Self {
        self.neuron = neuron;
        self
    }

    pub fn bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }

    pub fn bias_init(mut self, init: Initializer) -> Self {
        self.bias_init = init;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

#[derive(Debug)]
pub struct TiedInnerProduct<D: Device, T: Float> {
    weight: Arc<Param<D, T>>,
    bias: Option<Arc<Param<D, T>>>,
    ones: Option<Blob<D, T>>,
    /// Rows of `W`, the width of the top.
    output_dim: usize,
    /// Columns of `W`, the width of the bottom.
    input_dim: usize,
    batch: usize,
}

impl<D: Device, T: Float> TiedInnerProduct<D, T> {
    pub(super) fn setup(
        device: &D,
        layer: &Layer,
        config: &TiedInnerProductConfig,
        bottoms: &[Shape],
        registry: &mut ParamRegistry<D, T>,
    ) -> Result<(Self, Shape), LayerError> {
        check_count(Port::Bottom, 1, bottoms.len())?;
        check_count(Port::Top, 1, layer.tops.len())?;

        let weight = registry.get(&config.tied_param_key)?;
        let [output_dim, input_dim] = weight.shape().dims() else {
            return Err(LayerError::Shape {
                expected: Shape::new([1, 1])?,
                got: weight.shape().clone(),
            });
        };
        let (output_dim, input_dim) = (*output_dim, *input_dim);
        let batch = bottoms[0].batch();
        if bottoms[0].sample_len() != input_dim {
            return Err(LayerError::Shape {
                expected: Shape::new([input_dim, batch])?,
                got: bottoms[0].clone(),
            });
        }
        let top = Shape::new([output_dim, batch])?;

        let bias = match config.bias {
            true => {
                let mut rng = rng(config.seed);
                let contents = config.bias_init.sample(&mut rng, output_dim, input_dim)?;
                Some(Param::new(
                    device,
                    format!("{}.bias", layer.name),
                    [output_dim],
                    &contents,
                    config.bias_lr_mult,
                )?)
            }
            false => None,
        };
        let ones = Some(ones(device, batch)?);
        let bias = registry.extend(bias)?.pop();

        let state = Self {
            weight,
            bias,
            ones,
            output_dim,
            input_dim,
            batch,
        };
        Ok((state, top))
    }

    fn ones(&self) -> Result<&Blob<D, T>, LayerError> {
        self.ones.as_ref().ok_or(LayerError::Shutdown)
    }
}

impl<D: Device, T: Float> Compute<D, T> for TiedInnerProduct<D, T> {
    fn forward(
        &mut self,
        bottoms: &[&Blob<D, T>],
        tops: &mut [&mut Blob<D, T>],
    ) -> Result<(), LayerError> {
        let (d, p, n) = (self.output_dim, self.input_dim, self.batch);
        let top = &mut *tops[0];

        Gemm::new(d, n, p).execute(&self.weight.data(), bottoms[0], top)?;
        if let Some(bias) = &self.bias {
            Gemm::new(d, n, 1)
                .beta(1.0)
                .execute(&bias.data(), self.ones()?, top)?;
        }
        Ok(())
    }

    fn backward(
        &mut self,
        bottoms: &[&Blob<D, T>],
        top_diffs: &[&Blob<D, T>],
        bottom_diffs: &mut [Option<&mut Blob<D, T>>],
    ) -> Result<(), LayerError> {
        let (d, p, n) = (self.output_dim, self.input_dim, self.batch);
        let x = bottoms[0];
        let delta = top_diffs[0];

        // the shared gradient is laid out like W, so this layer adds δ Xᵀ
        Gemm::new(d, p, n)
            .trans_b()
            .beta(1.0)
            .execute(delta, x, &mut self.weight.grad_mut())?;
        if let Some(bias) = &self.bias {
            Gemm::new(d, 1, n)
                .beta(1.0)
                .execute(delta, self.ones()?, &mut bias.grad_mut())?;
        }
        // ∂X = Wᵀ δ
        if let Some(diff) = bottom_diffs[0].as_deref_mut() {
            Gemm::new(p, n, d)
                .trans_a()
                .execute(&self.weight.data(), delta, diff)?;
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        self.ones = None;
    }

    fn params(&self) -> Vec<Arc<Param<D, T>>> {
        std::iter::once(self.weight.clone())
            .chain(self.bias.clone())
            .collect()
    }
}
