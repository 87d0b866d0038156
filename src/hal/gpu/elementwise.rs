use super::{Uniform, shader};
use crate::{
    hal::ops::{ElementWiseGradOp, ElementWiseOp},
    loom::{
        device::{DeviceError, Gpu},
        ops::DeviceOp,
    },
};

impl DeviceOp<Gpu> for ElementWiseOp<f32> {
    fn execute(&self, device: &Gpu) -> Result<(), DeviceError> {
        self.check()?;
        let count = self.output.count();
        let uniform = Uniform::new(count)?.u32(self.functor.code());
        let bindings = [&self.a, &self.b, &self.output];
        device.launch(&shader::ELEMENT_WISE, uniform, &bindings, count)
    }
}

impl DeviceOp<Gpu> for ElementWiseGradOp<f32> {
    fn execute(&self, device: &Gpu) -> Result<(), DeviceError> {
        self.check()?;
        let count = self.diff.count();
        let uniform = Uniform::new(count)?
            .u32(self.functor.code())
            .u32(self.operand.code());
        let bindings = [&self.a, &self.b, &self.top_diff, &self.diff];
        device.launch(&shader::ELEMENT_WISE_GRAD, uniform, &bindings, count)
    }
}
