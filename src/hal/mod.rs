//! Hardware abstraction layer: op definitions and their kernels on every device.

pub mod cpu;
pub mod gpu;
pub mod ops;
