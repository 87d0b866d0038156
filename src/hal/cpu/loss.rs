use std::f64::consts::PI;

use super::for_each_mut;
use crate::{
    hal::ops::{EncoderGradOp, EncoderLossOp, GaussianReconGradOp, GaussianReconLossOp},
    loom::{
        device::{Cpu, DeviceError},
        num::Float,
        ops::DeviceOp,
    },
};

impl<T: Float> DeviceOp<Cpu> for GaussianReconLossOp<T> {
    fn execute(&self, device: &Cpu) -> Result<(), DeviceError> {
        self.check()?;
        bind_read!(device, mu: self.mu, T);
        bind_read!(device, sigma: self.sigma, T);
        bind_read!(device, x: self.x, T);
        bind_write!(device, terms: self.terms, T);

        let half_log_2pi = T::from_f64(0.5 * (2.0 * PI).ln());
        let two = T::from_f64(2.0);
        for_each_mut(terms, |index, term| {
            let (mu, sigma, x) = (mu[index], sigma[index], x[index]);
            let d = x - mu;
            *term = sigma.ln() + half_log_2pi + d * d / (two * sigma * sigma);
        });
        Ok(())
    }
}

impl<T: Float> DeviceOp<Cpu> for GaussianReconGradOp<T> {
    fn execute(&self, device: &Cpu) -> Result<(), DeviceError> {
        self.check()?;
        bind_read!(device, mu: self.mu, T);
        bind_read!(device, sigma: self.sigma, T);
        bind_read!(device, x: self.x, T);
        bind_write!(device, mu_diff: self.mu_diff, T);
        bind_write!(device, sigma_diff: self.sigma_diff, T);

        let scale = T::from_f64(self.scale);
        for_each_mut(mu_diff, |index, diff| {
            let d = x[index] - mu[index];
            let var = sigma[index] * sigma[index];
            *diff = -scale * d / var;
        });
        for_each_mut(sigma_diff, |index, diff| {
            let d = x[index] - mu[index];
            let sigma = sigma[index];
            *diff = scale * (T::one() / sigma - d * d / (sigma * sigma * sigma));
        });
        Ok(())
    }
}

impl<T: Float> DeviceOp<Cpu> for EncoderLossOp<T> {
    fn execute(&self, device: &Cpu) -> Result<(), DeviceError> {
        self.check()?;
        bind_read!(device, mu: self.mu, T);
        bind_read!(device, sigma: self.sigma, T);
        bind_write!(device, terms: self.terms, T);

        let two = T::from_f64(2.0);
        for_each_mut(terms, |index, term| {
            let (mu, sigma) = (mu[index], sigma[index]);
            *term = -(T::one() + two * sigma.ln() - mu * mu - sigma * sigma);
        });
        Ok(())
    }
}

impl<T: Float> DeviceOp<Cpu> for EncoderGradOp<T> {
    fn execute(&self, device: &Cpu) -> Result<(), DeviceError> {
        self.check()?;
        bind_read!(device, mu: self.mu, T);
        bind_read!(device, sigma: self.sigma, T);
        bind_write!(device, mu_diff: self.mu_diff, T);
        bind_write!(device, sigma_diff: self.sigma_diff, T);

        let scale = T::from_f64(self.scale);
        let two = T::from_f64(2.0);
        for_each_mut(mu_diff, |index, diff| *diff = scale * two * mu[index]);
        for_each_mut(sigma_diff, |index, diff| {
            let sigma = sigma[index];
            *diff = scale * (two * sigma - two / sigma);
        });
        Ok(())
    }
}
