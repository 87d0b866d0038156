use super::{Uniform, shader};
use crate::{
    hal::ops::{NeuronBackwardOp, NeuronForwardOp},
    loom::{
        device::{DeviceError, Gpu},
        ops::DeviceOp,
    },
};

impl DeviceOp<Gpu> for NeuronForwardOp<f32> {
    fn execute(&self, device: &Gpu) -> Result<(), DeviceError> {
        let count = self.output.count();
        let uniform = Uniform::new(count)?
            .u32(self.neuron.code())
            .f32(self.neuron.param() as f32);
        device.launch(&shader::NEURON_FORWARD, uniform, &[&self.output], count)
    }
}

impl DeviceOp<Gpu> for NeuronBackwardOp<f32> {
    fn execute(&self, device: &Gpu) -> Result<(), DeviceError> {
        self.check()?;
        let count = self.gradient.count();
        let uniform = Uniform::new(count)?
            .u32(self.neuron.code())
            .f32(self.neuron.param() as f32);
        let bindings = [&self.output, &self.gradient];
        device.launch(&shader::NEURON_BACKWARD, uniform, &bindings, count)
    }
}
