use std::marker::PhantomData;

use super::{
    Compute, LayerError, LossConfig, Port, check_count, check_shape, check_trainable,
};
use crate::{
    hal::ops::{EncoderGradOp, EncoderLossOp},
    loom::{
        blob::Blob,
        device::Device,
        num::Float,
        ops::Access,
        shape::Shape,
    },
};

/// KL penalty pulling the latent `N(z_mean, z_sd²)` towards `N(0, 1)`, averaged over the batch.
#[derive(Debug)]
pub struct EncoderLoss<D: Device, T: Float> {
    weight: f64,
    batch: usize,
    terms: Option<Blob<D, T>>,
    loss: f64,
}

impl<D: Device, T: Float> EncoderLoss<D, T> {
    pub(super) fn setup(
        device: &D,
        config: &LossConfig,
        bottoms: &[Shape],
        diffs: &[Option<&Blob<D, T>>],
        tops: usize,
    ) -> Result<Self, LayerError> {
        check_count(Port::Bottom, 2, bottoms.len())?;
        check_count(Port::Top, 0, tops)?;
        check_shape(&bottoms[0], &bottoms[1])?;
        check_trainable(&[true, true], diffs)?;

        let terms = Some(Blob::zeros(device, bottoms[0].clone())?);
        Ok(Self {
            weight: config.weight,
            batch: bottoms[0].batch(),
            terms,
            loss: 0.0,
        })
    }
}

impl<D: Device, T: Float> Compute<D, T> for EncoderLoss<D, T> {
    fn forward(
        &mut self,
        bottoms: &[&Blob<D, T>],
        _tops: &mut [&mut Blob<D, T>],
    ) -> Result<(), LayerError> {
        let terms = self.terms.as_mut().ok_or(LayerError::Shutdown)?;
        let op = EncoderLossOp::<T> {
            mu: bottoms[0].ir(Access::ReadOnly),
            sigma: bottoms[1].ir(Access::ReadOnly),
            terms: terms.ir(Access::WriteOnly),
            phantom: PhantomData,
        };
        terms.device().execute(&op)?;

        let sum: f64 = terms.read()?.into_iter().map(T::to_f64).sum();
        self.loss = self.weight * sum / self.batch as f64;
        Ok(())
    }

    fn backward(
        &mut self,
        bottoms: &[&Blob<D, T>],
        _top_diffs: &[&Blob<D, T>],
        bottom_diffs: &mut [Option<&mut Blob<D, T>>],
    ) -> Result<(), LayerError> {
        let [Some(mu_diff), Some(sigma_diff)] = bottom_diffs else {
            return Err(LayerError::MissingDiff(0));
        };
        let op = EncoderGradOp::<T> {
            scale: self.weight / self.batch as f64,
            mu: bottoms[0].ir(Access::ReadOnly),
            sigma: bottoms[1].ir(Access::ReadOnly),
            mu_diff: mu_diff.ir(Access::WriteOnly),
            sigma_diff: sigma_diff.ir(Access::WriteOnly),
            phantom: PhantomData,
        };
        mu_diff.device().execute(&op)?;
        Ok(())
    }

    fn shutdown(&mut self) {
        self.terms = None;
    }

    fn loss(&self) -> Option<f64> {
        Some(self.loss)
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use itertools::Itertools;

    use crate::{
        loom::{blob::Blob, device::Cpu},
        nn::{
            layer::{Layer, LayerError, LayerKind, LayerState, LossConfig},
            param::ParamRegistry,
        },
    };

    #[test]
    fn test_encoder_loss() -> Result<(), Box<dyn Error>> {
        let cpu = Cpu::new();
        let mut rng = fastrand::Rng::with_seed(9);
        let mut registry = ParamRegistry::new();
        let (d, n) = (6, 3);
        let mu = (0..d * n).map(|_| rng.f64() * 5.0 - 2.0).collect_vec();
        let sigma = (0..d * n).map(|_| rng.f64() * 2.0 + 0.01).collect_vec();

        let weight = 0.5;
        let layer = Layer::new("kl", LayerKind::EncoderLoss(LossConfig { weight }))
            .bottom("z_mean")
            .bottom("z_sd");
        let mu_blob = Blob::create(&cpu, [d, n], &mu)?;
        let sigma_blob = Blob::create(&cpu, [d, n], &sigma)?;
        let mut mu_diff = mu_blob.zeros_like()?;
        let mut sigma_diff = sigma_blob.zeros_like()?;
        let bottoms = [&mu_blob, &sigma_blob];

        let mut state = LayerState::setup(
            &cpu,
            &layer,
            &bottoms,
            &[Some(&mu_diff), Some(&sigma_diff)],
            &mut registry,
        )?;
        state.forward(&bottoms, &mut [])?;

        let expected = mu
            .iter()
            .zip_eq(&sigma)
            .map(|(m, s)| -(1.0 + 2.0 * s.ln() - m * m - s * s))
            .sum::<f64>()
            * weight
            / n as f64;
        let loss = state.loss().unwrap_or_default();
        assert!((loss - expected).abs() < 1e-8, "{loss} vs {expected}");
        assert!(loss >= 0.0);

        state.backward(&bottoms, &[], &mut [Some(&mut mu_diff), Some(&mut sigma_diff)])?;
        let scale = weight / n as f64;
        for (analytic, m) in mu_diff.read()?.into_iter().zip_eq(&mu) {
            assert!((analytic - scale * 2.0 * m).abs() < 1e-12);
        }
        for (analytic, s) in sigma_diff.read()?.into_iter().zip_eq(&sigma) {
            assert!((analytic - scale * (2.0 * s - 2.0 / s)).abs() < 1e-9);
        }

        state.shutdown();
        state.shutdown();
        assert_eq!(state.loss(), Some(loss));
        assert!(matches!(
            state.forward(&bottoms, &mut []),
            Err(LayerError::Shutdown)
        ));
        Ok(())
    }

    #[test]
    fn test_encoder_loss_f32() -> Result<(), Box<dyn Error>> {
        let cpu = Cpu::new();
        let mut registry = ParamRegistry::new();
        let layer = Layer::new("kl", LayerKind::EncoderLoss(LossConfig::default()))
            .bottom("z_mean")
            .bottom("z_sd");
        let mu = Blob::create(&cpu, [2, 2], &[0.0f32, 1.0, -1.0, 0.5])?;
        let sigma = Blob::create(&cpu, [2, 2], &[1.0f32, 0.5, 2.0, 1.0])?;
        let dmu = mu.zeros_like()?;
        let dsigma = sigma.zeros_like()?;

        let mut state = LayerState::setup(
            &cpu,
            &layer,
            &[&mu, &sigma],
            &[Some(&dmu), Some(&dsigma)],
            &mut registry,
        )?;
        state.forward(&[&mu, &sigma], &mut [])?;
        let expected = [(0.0f64, 1.0f64), (1.0, 0.5), (-1.0, 2.0), (0.5, 1.0)]
            .iter()
            .map(|(m, s)| -(1.0 + 2.0 * s.ln() - m * m - s * s))
            .sum::<f64>()
            / 2.0;
        let loss = state.loss().unwrap_or_default();
        assert!((loss - expected).abs() < 1e-2, "{loss} vs {expected}");
        Ok(())
    }

    #[test]
    fn test_encoder_loss_shapes() -> Result<(), Box<dyn Error>> {
        let cpu = Cpu::new();
        let mut registry = ParamRegistry::new();
        let layer = Layer::new("kl", LayerKind::EncoderLoss(LossConfig::default()))
            .bottom("z_mean")
            .bottom("z_sd");
        let mu = Blob::<_, f64>::zeros(&cpu, [3, 2])?;
        let sigma = Blob::<_, f64>::zeros(&cpu, [3, 4])?;
        let dmu = mu.zeros_like()?;
        let dsigma = sigma.zeros_like()?;

        assert!(matches!(
            LayerState::setup(
                &cpu,
                &layer,
                &[&mu, &sigma],
                &[Some(&dmu), Some(&dsigma)],
                &mut registry
            ),
            Err(LayerError::Shape { .. })
        ));
        assert!(matches!(
            LayerState::setup(
                &cpu,
                &layer,
                &[&mu, &mu],
                &[Some(&dmu), Some(&dsigma)],
                &mut registry
            ),
            Err(LayerError::Shape { .. })
        ));
        Ok(())
    }
}
