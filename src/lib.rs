//! A layer-based neural network training core.
//!
//! Nets are ordered lists of [layers](nn::layer) wired through named blobs. A forward pass runs
//! every layer in order; a backward pass runs them in reverse, overwriting blob diffs and
//! accumulating parameter gradients. Blobs live on a [`Device`](loom::device::Device): the
//! [`Cpu`](loom::device::Cpu) runs every op in `f32` and `f64`, the [`Gpu`](loom::device::Gpu)
//! runs them in `f32` through `wgpu` compute shaders.
//!
//! The loss layers implement the two terms of the variational auto-encoder objective: the
//! Gaussian reconstruction log-likelihood and the KL penalty of the encoder.

pub mod hal;
pub mod loom;
pub mod nn;
