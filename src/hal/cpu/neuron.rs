use super::for_each_mut;
use crate::{
    hal::ops::{NeuronBackwardOp, NeuronForwardOp},
    loom::{
        device::{Cpu, DeviceError},
        num::Float,
        ops::DeviceOp,
    },
};

impl<T: Float> DeviceOp<Cpu> for NeuronForwardOp<T> {
    fn execute(&self, device: &Cpu) -> Result<(), DeviceError> {
        bind_write!(device, output: self.output, T);
        let neuron = self.neuron;
        for_each_mut(output, |_, y| *y = neuron.forward_value(*y));
        Ok(())
    }
}

impl<T: Float> DeviceOp<Cpu> for NeuronBackwardOp<T> {
    fn execute(&self, device: &Cpu) -> Result<(), DeviceError> {
        self.check()?;
        bind_read!(device, output: self.output, T);
        bind_write!(device, gradient: self.gradient, T);
        let neuron = self.neuron;
        for_each_mut(gradient, |index, g| {
            *g *= neuron.backward_factor(output[index])
        });
        Ok(())
    }
}
