use std::sync::Arc;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::{Compute, Layer, LayerError, Port, check_count};
use crate::{
    hal::ops::Gemm,
    loom::{blob::Blob, device::Device, num::Float, shape::Shape},
    nn::{
        neuron::Neuron,
        param::{Initializer, Param, ParamRegistry, rng},
    },
};

/// Fully connected layer: `top = Wᵀ X + b 1ᵀ`.
///
/// The bottom `(d…, n)` is flattened to `D × n`. The weight `W` is stored `D × P` so a
/// [`TiedInnerProduct`](super::tied_inner_product::TiedInnerProduct) can reuse it untransposed.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct InnerProductConfig {
    pub output_dim: usize,
    pub neuron: Neuron,
    /// Key the weight is registered under; defaults to the layer name.
    pub param_key: Option<String>,
    pub bias: bool,
    pub weight_init: Initializer,
    pub bias_init: Initializer,
    pub weight_lr_mult: f64,
    pub bias_lr_mult: f64,
    pub seed: Option<u64>,
}

impl InnerProductConfig {
    pub fn new(output_dim: usize) -> Self {
        Self {
            output_dim,
            neuron: Neuron::Identity,
            param_key: None,
            bias: true,
            weight_init: Initializer::Xavier,
            bias_init: Initializer::Constant(0.0),
            weight_lr_mult: 1.0,
            bias_lr_mult: 1.0,
            seed: None,
        }
    }

    pub fn neuron(mut self, neuron: Neuron) -> Self {
        self.neuron = neuron;
        self
    }

    pub fn param_key(mut self, key: impl Into<String>) -> Self {
        self.param_key = Some(key.into());
        self
    }

    pub fn bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }

    pub fn weight_init(mut self, init: Initializer) -> Self {
        self.weight_init = init;
        self
    }

    pub fn bias_init(mut self, init: Initializer) -> Self {
        self.bias_init = init;
        self
    }

    pub fn lr_mult(mut self, weight: f64, bias: f64) -> Self {
        self.weight_lr_mult = weight;
        self.bias_lr_mult = bias;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

/// A column of ones of the batch size, used to broadcast and reduce the bias.
pub(crate) fn ones<D: Device, T: Float>(device: &D, batch: usize) -> Result<Blob<D, T>, LayerError> {
    Ok(Blob::create(device, [batch], &vec![T::one(); batch])?)
}

#[derive(Debug)]
pub struct InnerProduct<D: Device, T: Float> {
    weight: Arc<Param<D, T>>,
    bias: Option<Arc<Param<D, T>>>,
    ones: Option<Blob<D, T>>,
    input_dim: usize,
    output_dim: usize,
    batch: usize,
}

impl<D: Device, T: Float> InnerProduct<D, T> {
    pub(super) fn setup(
        device: &D,
        layer: &Layer,
        config: &InnerProductConfig,
        bottoms: &[Shape],
        registry: &mut ParamRegistry<D, T>,
    ) -> Result<(Self, Shape), LayerError> {
        check_count(Port::Bottom, 1, bottoms.len())?;
        check_count(Port::Top, 1, layer.tops.len())?;

        let input_dim = bottoms[0].sample_len();
        let output_dim = config.output_dim;
        let batch = bottoms[0].batch();
        let top = Shape::new([output_dim, batch])?;

        let mut rng = rng(config.seed);
        let key = config.param_key.clone().unwrap_or_else(|| layer.name.clone());
        let contents = config
            .weight_init
            .sample(&mut rng, input_dim * output_dim, input_dim)?;
        let mut params = vec![Param::new(
            device,
            key.clone(),
            [input_dim, output_dim],
            &contents,
            config.weight_lr_mult,
        )?];
        if config.bias {
            let contents = config.bias_init.sample(&mut rng, output_dim, input_dim)?;
            params.push(Param::new(
                device,
                format!("{key}.bias"),
                [output_dim],
                &contents,
                config.bias_lr_mult,
            )?);
        }
        let ones = Some(ones(device, batch)?);

        // nothing is registered unless the whole layer allocated
        let mut params = registry.extend(params)?.into_iter();
        let weight = params.next().ok_or(LayerError::UnknownParam(key))?;
        let bias = params.next();

        let state = Self {
            weight,
            bias,
            ones,
            input_dim,
            output_dim,
            batch,
        };
        Ok((state, top))
    }

    fn ones(&self) -> Result<&Blob<D, T>, LayerError> {
        self.ones.as_ref().ok_or(LayerError::Shutdown)
    }
}

impl<D: Device, T: Float> Compute<D, T> for InnerProduct<D, T> {
    fn forward(
        &mut self,
        bottoms: &[&Blob<D, T>],
        tops: &mut [&mut Blob<D, T>],
    ) -> Result<(), LayerError> {
        let (d, p, n) = (self.input_dim, self.output_dim, self.batch);
        let x = bottoms[0];
        let top = &mut *tops[0];

        Gemm::new(p, n, d)
            .trans_a()
            .execute(&self.weight.data(), x, top)?;
        if let Some(bias) = &self.bias {
            Gemm::new(p, n, 1)
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
        let (d, p, n) = (self.input_dim, self.output_dim, self.batch);
        let x = bottoms[0];
        let delta = top_diffs[0];

        // ∇W += X δᵀ
        Gemm::new(d, p, n)
            .trans_b()
            .beta(1.0)
            .execute(x, delta, &mut self.weight.grad_mut())?;
        // ∇b += δ 1
        if let Some(bias) = &self.bias {
            Gemm::new(p, 1, n)
                .beta(1.0)
                .execute(delta, self.ones()?, &mut bias.grad_mut())?;
        }
        // ∂X = W δ
        if let Some(diff) = bottom_diffs[0].as_deref_mut() {
            Gemm::new(d, n, p).execute(&self.weight.data(), delta, diff)?;
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

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::InnerProductConfig;
    use crate::{
        loom::{blob::Blob, device::Cpu},
        nn::{
            layer::{Layer, LayerError, LayerKind, LayerState},
            param::{Initializer, Param, ParamRegistry},
        },
    };

    #[test]
    fn test_inner_product() -> Result<(), Box<dyn Error>> {
        let cpu = Cpu::new();
        let mut registry = ParamRegistry::new();
        let config = InnerProductConfig::new(2)
            .weight_init(Initializer::Constant(0.0))
            .bias_init(Initializer::Constant(0.5));
        let layer = Layer::new("fc", LayerKind::InnerProduct(config))
            .bottom("x")
            .top("h");

        // two samples of three features each
        let x = Blob::create(&cpu, [3, 2], &[1.0f64, 2.0, 3.0, -1.0, 0.0, 1.0])?;
        let dx = x.zeros_like()?;
        let mut state = LayerState::setup(&cpu, &layer, &[&x], &[Some(&dx)], &mut registry)?;
        assert_eq!(state.top_shapes()[0].dims(), &[2, 2]);
        assert_eq!(registry.keys(), vec!["fc", "fc.bias"]);

        // W = [[1, 0], [0, 1], [1, 1]] stored column-major 3 × 2
        registry
            .get("fc")?
            .write_data(&[1.0, 0.0, 1.0, 0.0, 1.0, 1.0])?;
        let mut h = Blob::zeros(&cpu, state.top_shapes()[0].clone())?;
        state.forward(&[&x], &mut [&mut h])?;
        // Wᵀ x + b: sample 0 -> (1 + 3, 2 + 3), sample 1 -> (-1 + 1, 0 + 1)
        assert_eq!(h.read()?, vec![4.5, 5.5, 0.5, 1.5]);

        let delta = Blob::create(&cpu, [2, 2], &[1.0, 0.0, 0.0, 1.0])?;
        let mut dx = dx;
        state.backward(&[&x], &[&delta], &mut [Some(&mut dx)])?;
        // ∂X = W δ: sample 0 -> first column of Wᵀ, sample 1 -> second
        assert_eq!(dx.read()?, vec![1.0, 0.0, 1.0, 0.0, 1.0, 1.0]);
        // ∇W = X δᵀ
        assert_eq!(
            registry.get("fc")?.read_grad()?,
            vec![1.0, 2.0, 3.0, -1.0, 0.0, 1.0]
        );
        assert_eq!(registry.get("fc.bias")?.read_grad()?, vec![1.0, 1.0]);

        // gradients accumulate until cleared
        state.backward(&[&x], &[&delta], &mut [Some(&mut dx)])?;
        assert_eq!(registry.get("fc.bias")?.read_grad()?, vec![2.0, 2.0]);
        assert!(state.backward(&[&x], &[&delta], &mut [None]).is_err());
        state.zero_grad()?;
        assert_eq!(registry.get("fc.bias")?.read_grad()?, vec![0.0, 0.0]);
        Ok(())
    }

    #[test]
    fn test_taken_bias_key() -> Result<(), Box<dyn Error>> {
        let cpu = Cpu::new();
        let mut registry = ParamRegistry::new();
        registry.insert(Param::new(&cpu, "fc.bias", [2], &[0.0f32; 2], 1.0)?)?;

        let layer = Layer::new("fc", LayerKind::InnerProduct(InnerProductConfig::new(2)))
            .bottom("x")
            .top("h");
        let x = Blob::<_, f32>::zeros(&cpu, [3, 2])?;
        let result = LayerState::setup(&cpu, &layer, &[&x], &[None], &mut registry);
        assert!(matches!(result, Err(LayerError::DuplicateParam(key)) if key == "fc.bias"));
        // the weight is not left behind
        assert_eq!(registry.keys(), vec!["fc.bias"]);
        assert!(registry.get("fc").is_err());
        Ok(())
    }

    #[test]
    fn test_invalid_init() -> Result<(), Box<dyn Error>> {
        let cpu = Cpu::new();
        let mut registry = ParamRegistry::new();
        let config = InnerProductConfig::new(2).weight_init(Initializer::Gaussian { std: f64::NAN });
        let layer = Layer::new("fc", LayerKind::InnerProduct(config)).bottom("x").top("h");
        let x = Blob::<_, f64>::zeros(&cpu, [3, 2])?;
        let result = LayerState::setup(&cpu, &layer, &[&x], &[None], &mut registry);
        assert!(matches!(result, Err(LayerError::Init(_))));
        assert!(registry.is_empty());
        Ok(())
    }
}
