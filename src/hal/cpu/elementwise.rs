use super::for_each_mut;
use crate::{
    hal::ops::{ElementWiseGradOp, ElementWiseOp},
    loom::{
        device::{Cpu, DeviceError},
        num::Float,
        ops::DeviceOp,
    },
};

impl<T: Float> DeviceOp<Cpu> for ElementWiseOp<T> {
    fn execute(&self, device: &Cpu) -> Result<(), DeviceError> {
        self.check()?;
        bind_read!(device, a: self.a, T);
        bind_read!(device, b: self.b, T);
        bind_write!(device, output: self.output, T);

        let functor = self.functor;
        for_each_mut(output, |index, z| *z = functor.value(a[index], b[index]));
        Ok(())
    }
}

impl<T: Float> DeviceOp<Cpu> for ElementWiseGradOp<T> {
    fn execute(&self, device: &Cpu) -> Result<(), DeviceError> {
        self.check()?;
        bind_read!(device, a: self.a, T);
        bind_read!(device, b: self.b, T);
        bind_read!(device, top_diff: self.top_diff, T);
        bind_write!(device, diff: self.diff, T);

        let functor = self.functor;
        let operand = self.operand;
        for_each_mut(diff, |index, d| {
            *d = functor.gradient(operand, a[index], b[index], top_diff[index])
        });
        Ok(())
    }
}
