//! Layers, neurons and parameters, and the net that wires them together.

pub mod check;
pub mod layer;
pub mod net;
pub mod neuron;
pub mod param;
