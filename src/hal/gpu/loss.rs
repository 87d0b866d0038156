use super::{Uniform, shader};
use crate::{
    hal::ops::{EncoderGradOp, EncoderLossOp, GaussianReconGradOp, GaussianReconLossOp},
    loom::{
        device::{DeviceError, Gpu},
        ops::DeviceOp,
    },
};

impl DeviceOp<Gpu> for GaussianReconLossOp<f32> {
    fn execute(&self, device: &Gpu) -> Result<(), DeviceError> {
        self.check()?;
        let count = self.terms.count();
        let bindings = [&self.mu, &self.sigma, &self.x, &self.terms];
        device.launch(&shader::GAUSSIAN_RECON_LOSS, Uniform::new(count)?, &bindings, count)
    }
}

impl DeviceOp<Gpu> for GaussianReconGradOp<f32> {
    fn execute(&self, device: &Gpu) -> Result<(), DeviceError> {
        self.check()?;
        let count = self.mu_diff.count();
        let uniform = Uniform::new(count)?.f32(self.scale as f32);
        let bindings = [
            &self.mu,
            &self.sigma,
            &self.x,
            &self.mu_diff,
            &self.sigma_diff,
        ];
        device.launch(&shader::GAUSSIAN_RECON_GRAD, uniform, &bindings, count)
    }
}

impl DeviceOp<Gpu> for EncoderLossOp<f32> {
    fn execute(&self, device: &Gpu) -> Result<(), DeviceError> {
        self.check()?;
        let count = self.terms.count();
        let bindings = [&self.mu, &self.sigma, &self.terms];
        device.launch(&shader::ENCODER_LOSS, Uniform::new(count)?, &bindings, count)
    }
}

impl DeviceOp<Gpu> for EncoderGradOp<f32> {
    fn execute(&self, device: &Gpu) -> Result<(), DeviceError> {
        self.check()?;
        let count = self.mu_diff.count();
        let uniform = Uniform::new(count)?.f32(self.scale as f32);
        let bindings = [&self.mu, &self.sigma, &self.mu_diff, &self.sigma_diff];
        device.launch(&shader::ENCODER_GRAD, uniform, &bindings, count)
    }
}
