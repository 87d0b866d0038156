use super::{Uniform, shader};
use crate::{
    hal::ops::{AxpyOp, GemmOp},
    loom::{
        device::{DeviceError, Gpu},
        ops::DeviceOp,
    },
};

impl DeviceOp<Gpu> for GemmOp<f32> {
    fn execute(&self, device: &Gpu) -> Result<(), DeviceError> {
        self.check()?;
        let gemm = self.gemm;
        let count = gemm.m * gemm.n;
        let uniform = Uniform::new(count)?
            .usize(gemm.m)?
            .usize(gemm.n)?
            .usize(gemm.k)?
            .u32(gemm.trans_a as u32)
            .u32(gemm.trans_b as u32)
            .f32(gemm.alpha as f32)
            .f32(gemm.beta as f32);
        let bindings = [&self.a, &self.b, &self.c];
        device.launch(&shader::GEMM, uniform, &bindings, count)
    }
}

impl DeviceOp<Gpu> for AxpyOp<f32> {
    fn execute(&self, device: &Gpu) -> Result<(), DeviceError> {
        self.check()?;
        let count = self.y.count();
        let uniform = Uniform::new(count)?.f32(self.alpha as f32);
        device.launch(&shader::AXPY, uniform, &[&self.x, &self.y], count)
    }
}
