use std::marker::PhantomData;

use super::{
    Compute, LayerError, LossConfig, Port, check_count, check_shape, check_trainable,
};
use crate::{
    hal::ops::{GaussianReconGradOp, GaussianReconLossOp},
    loom::{
        blob::Blob,
        device::Device,
        num::Float,
        ops::Access,
        shape::Shape,
    },
};

/// Negative log-likelihood of `x` under `N(mu, diag sigma²)`, averaged over the batch.
#[derive(Debug)]
pub struct GaussianReconLoss<D: Device, T: Float> {
    weight: f64,
    batch: usize,
    terms: Option<Blob<D, T>>,
    loss: f64,
}

impl<D: Device, T: Float> GaussianReconLoss<D, T> {
    pub(super) fn setup(
        device: &D,
        config: &LossConfig,
        bottoms: &[Shape],
        diffs: &[Option<&Blob<D, T>>],
        tops: usize,
    ) -> Result<Self, LayerError> {
        check_count(Port::Bottom, 3, bottoms.len())?;
        check_count(Port::Top, 0, tops)?;
        check_shape(&bottoms[0], &bottoms[1])?;
        check_shape(&bottoms[0], &bottoms[2])?;
        check_trainable(&[true, true, false], diffs)?;

        let terms = Some(Blob::zeros(device, bottoms[0].clone())?);
        Ok(Self {
            weight: config.weight,
            batch: bottoms[0].batch(),
            terms,
            loss: 0.0,
        })
    }

    fn terms(&mut self) -> Result<&mut Blob<D, T>, LayerError> {
        self.terms.as_mut().ok_or(LayerError::Shutdown)
    }
}

impl<D: Device, T: Float> Compute<D, T> for GaussianReconLoss<D, T> {
    fn forward(
        &mut self,
        bottoms: &[&Blob<D, T>],
        _tops: &mut [&mut Blob<D, T>],
    ) -> Result<(), LayerError> {
        let terms = self.terms()?;
        let op = GaussianReconLossOp::<T> {
            mu: bottoms[0].ir(Access::ReadOnly),
            sigma: bottoms[1].ir(Access::ReadOnly),
            x: bottoms[2].ir(Access::ReadOnly),
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
        let [Some(mu_diff), Some(sigma_diff), _] = bottom_diffs else {
            return Err(LayerError::MissingDiff(0));
        };
        let op = GaussianReconGradOp::<T> {
            scale: self.weight / self.batch as f64,
            mu: bottoms[0].ir(Access::ReadOnly),
            sigma: bottoms[1].ir(Access::ReadOnly),
            x: bottoms[2].ir(Access::ReadOnly),
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
    use std::{error::Error, f64::consts::PI};

    use itertools::Itertools;

    use crate::{
        loom::{blob::Blob, device::Cpu},
        nn::{
            layer::{Layer, LayerError, LayerKind, LayerState, LossConfig},
            param::ParamRegistry,
        },
    };

    /// `d` features, `n` samples.
    fn data(rng: &mut fastrand::Rng, d: usize, n: usize) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
        let mu = (0..d * n).map(|_| rng.f64() * 5.0 - 2.0).collect_vec();
        let sigma = (0..d * n).map(|_| rng.f64() * 2.0 + 0.5).collect_vec();
        let x = (0..d * n).map(|_| rng.f64() * 4.0 - 2.0).collect_vec();
        (mu, sigma, x)
    }

    /// `-mean over samples of log N(x; mu, diag sigma²)`.
    fn nll(mu: &[f64], sigma: &[f64], x: &[f64], d: usize, n: usize) -> f64 {
        let total: f64 = (0..d * n)
            .map(|k| {
                let z = (x[k] - mu[k]) / sigma[k];
                0.5 * z * z + sigma[k].ln() + 0.5 * (2.0 * PI).ln()
            })
            .sum();
        total / n as f64
    }

    fn layer() -> Layer {
        Layer::new("recon", LayerKind::GaussianReconLoss(LossConfig::default()))
            .bottom("mu")
            .bottom("sigma")
            .bottom("x")
    }

    #[test]
    fn test_gaussian_recon_loss() -> Result<(), Box<dyn Error>> {
        let cpu = Cpu::new();
        let mut rng = fastrand::Rng::with_seed(5);
        let mut registry = ParamRegistry::new();
        let (d, n) = (5, 4);
        let (mu, sigma, x) = data(&mut rng, d, n);

        let mu_blob = Blob::create(&cpu, [d, n], &mu)?;
        let sigma_blob = Blob::create(&cpu, [d, n], &sigma)?;
        let x_blob = Blob::create(&cpu, [d, n], &x)?;
        let mut mu_diff = mu_blob.zeros_like()?;
        let mut sigma_diff = sigma_blob.zeros_like()?;
        let bottoms = [&mu_blob, &sigma_blob, &x_blob];

        let mut state = LayerState::setup(
            &cpu,
            &layer(),
            &bottoms,
            &[Some(&mu_diff), Some(&sigma_diff), None],
            &mut registry,
        )?;
        state.forward(&bottoms, &mut [])?;

        let expected = nll(&mu, &sigma, &x, d, n);
        let loss = state.loss().unwrap_or_default();
        assert!((loss - expected).abs() < 1e-8, "{loss} vs {expected}");

        state.backward(
            &bottoms,
            &[],
            &mut [Some(&mut mu_diff), Some(&mut sigma_diff), None],
        )?;
        let analytic = [mu_diff.read()?, sigma_diff.read()?];

        let h = 1e-6;
        for (slot, values) in [&mu, &sigma].into_iter().enumerate() {
            for k in 0..d * n {
                let mut run = |delta: f64| -> Result<f64, Box<dyn Error>> {
                    let mut values = values.clone();
                    values[k] += delta;
                    let perturbed = Blob::create(&cpu, [d, n], &values)?;
                    let mut bottoms = bottoms;
                    bottoms[slot] = &perturbed;
                    state.forward(&bottoms, &mut [])?;
                    Ok(state.loss().unwrap_or_default())
                };
                let numeric = (run(h)? - run(-h)?) / (2.0 * h);
                let analytic = analytic[slot][k];
                assert!(
                    (numeric - analytic).abs() < 1e-5,
                    "bottom {slot} element {k}: {analytic} vs {numeric}"
                );
            }
        }
        Ok(())
    }

    #[test]
    fn test_gaussian_recon_loss_f32() -> Result<(), Box<dyn Error>> {
        let cpu = Cpu::new();
        let mut rng = fastrand::Rng::with_seed(13);
        let mut registry = ParamRegistry::new();
        let (d, n) = (6, 3);
        let (mu, sigma, x) = data(&mut rng, d, n);
        let single = |values: &[f64]| values.iter().map(|&x| x as f32).collect_vec();

        let mu_blob = Blob::create(&cpu, [d, n], &single(&mu))?;
        let sigma_blob = Blob::create(&cpu, [d, n], &single(&sigma))?;
        let x_blob = Blob::create(&cpu, [d, n], &single(&x))?;
        let mut mu_diff = mu_blob.zeros_like()?;
        let mut sigma_diff = sigma_blob.zeros_like()?;
        let bottoms = [&mu_blob, &sigma_blob, &x_blob];

        let mut state = LayerState::setup(
            &cpu,
            &layer(),
            &bottoms,
            &[Some(&mu_diff), Some(&sigma_diff), None],
            &mut registry,
        )?;
        state.forward(&bottoms, &mut [])?;
        let expected = nll(&mu, &sigma, &x, d, n);
        let loss = state.loss().unwrap_or_default();
        assert!((loss - expected).abs() < 1e-2, "{loss} vs {expected}");

        state.backward(
            &bottoms,
            &[],
            &mut [Some(&mut mu_diff), Some(&mut sigma_diff), None],
        )?;
        // ∂/∂mu = (mu - x) / sigma² / n
        for (k, grad) in mu_diff.read()?.into_iter().enumerate() {
            let expected = (mu[k] - x[k]) / (sigma[k] * sigma[k]) / n as f64;
            assert!((grad as f64 - expected).abs() < 1e-2, "{k}: {grad} vs {expected}");
        }
        Ok(())
    }

    #[test]
    fn test_gaussian_recon_shapes() -> Result<(), Box<dyn Error>> {
        let cpu = Cpu::new();
        let mut registry = ParamRegistry::new();
        let a = Blob::<_, f64>::zeros(&cpu, [2, 2])?;
        let b = Blob::<_, f64>::zeros(&cpu, [2, 2])?;
        let narrow = Blob::<_, f64>::zeros(&cpu, [1, 2])?;
        let da = a.zeros_like()?;
        let db = b.zeros_like()?;
        let dn = narrow.zeros_like()?;

        // sigma narrower than mu
        assert!(matches!(
            LayerState::setup(
                &cpu,
                &layer(),
                &[&a, &narrow, &b],
                &[Some(&da), Some(&dn), None],
                &mut registry
            ),
            Err(LayerError::Shape { .. })
        ));
        // x narrower than mu
        assert!(matches!(
            LayerState::setup(
                &cpu,
                &layer(),
                &[&a, &b, &narrow],
                &[Some(&da), Some(&db), None],
                &mut registry
            ),
            Err(LayerError::Shape { .. })
        ));
        // a diff that does not match its input
        assert!(matches!(
            LayerState::setup(
                &cpu,
                &layer(),
                &[&a, &b, &b],
                &[Some(&da), Some(&dn), None],
                &mut registry
            ),
            Err(LayerError::Shape { .. })
        ));

        // blobs handed to forward are checked against the ones given at setup
        let mut state = LayerState::setup(
            &cpu,
            &layer(),
            &[&a, &b, &b],
            &[Some(&da), Some(&db), None],
            &mut registry,
        )?;
        assert!(matches!(
            state.forward(&[&a, &b, &narrow], &mut []),
            Err(LayerError::Shape { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_gaussian_recon_contract() -> Result<(), Box<dyn Error>> {
        let cpu = Cpu::new();
        let mut registry = ParamRegistry::new();
        let a = Blob::create(&cpu, [2, 1], &[0.0f64, 1.0])?;
        let b = Blob::create(&cpu, [2, 1], &[1.0f64, 1.0])?;
        let c = Blob::create(&cpu, [2, 1], &[0.5f64, 0.5])?;
        let da = a.zeros_like()?;
        let db = b.zeros_like()?;
        let dc = c.zeros_like()?;

        // the observed data must be fixed
        assert!(matches!(
            LayerState::setup(
                &cpu,
                &layer(),
                &[&a, &b, &c],
                &[Some(&da), Some(&db), Some(&dc)],
                &mut registry
            ),
            Err(LayerError::UnexpectedDiff(2))
        ));
        // the distribution must be trainable
        assert!(matches!(
            LayerState::setup(
                &cpu,
                &layer(),
                &[&a, &b, &c],
                &[Some(&da), None, None],
                &mut registry
            ),
            Err(LayerError::MissingDiff(1))
        ));
        assert!(matches!(
            LayerState::setup(&cpu, &layer(), &[&a, &b], &[None, None], &mut registry),
            Err(LayerError::Count { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_x_diff_untouched() -> Result<(), Box<dyn Error>> {
        let cpu = Cpu::new();
        let mut registry = ParamRegistry::new();
        let mu = Blob::create(&cpu, [2, 2], &[0.0f64, 1.0, 2.0, 3.0])?;
        let sigma = Blob::create(&cpu, [2, 2], &[1.0f64, 0.5, 2.0, 1.5])?;
        let x = Blob::create(&cpu, [2, 2], &[1.0f64, 1.0, 1.0, 1.0])?;
        let mut dmu = mu.zeros_like()?;
        let mut dsigma = sigma.zeros_like()?;
        let bottoms = [&mu, &sigma, &x];

        let mut state = LayerState::setup(
            &cpu,
            &layer(),
            &bottoms,
            &[Some(&dmu), Some(&dsigma), None],
            &mut registry,
        )?;
        state.forward(&bottoms, &mut [])?;
        state.backward(&bottoms, &[], &mut [Some(&mut dmu), Some(&mut dsigma), None])?;
        // inputs are not mutated
        assert_eq!(x.read()?, vec![1.0; 4]);
        assert_eq!(mu.read()?, vec![0.0, 1.0, 2.0, 3.0]);
        Ok(())
    }
}
