//! Layers: configuration values and the state they set up into.
//!
//! A [`Layer`] names its bottoms and tops and carries the kind-specific configuration.
//! [`LayerState::setup`] validates the blobs a layer is wired to and allocates its scratch and
//! parameters. Every later `forward`/`backward` call must supply blobs of the same count and shapes.

use std::sync::Arc;

use derive_more::Display;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{
    neuron::Neuron,
    param::{InitError, Param, ParamRegistry},
};
use crate::loom::{
    blob::{Blob, BlobError},
    device::{Device, DeviceError},
    num::Float,
    shape::{Shape, ShapeError},
};

pub mod element_wise;
pub mod encoder_loss;
pub mod gaussian_recon_loss;
pub mod inner_product;
pub mod random_normal;
pub mod split;
pub mod tied_inner_product;

pub use element_wise::{ElementWiseConfig, ElementWiseFunctor, Operand};
pub use inner_product::InnerProductConfig;
pub use random_normal::RandomNormalConfig;
pub use tied_inner_product::TiedInnerProductConfig;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Port {
    #[display("bottoms")]
    Bottom,
    #[display("tops")]
    Top,
    #[display("diffs")]
    Diff,
}

#[derive(Debug, Error)]
pub enum LayerError {
    #[error("layer expects {expected} {port}, got {got}")]
    Count {
        port: Port,
        expected: usize,
        got: usize,
    },
    #[error("shape mismatch: expected {expected}, got {got}")]
    Shape { expected: Shape, got: Shape },
    #[error("input {0} is trainable but has no diff")]
    MissingDiff(usize),
    #[error("input {0} is fixed but has a diff")]
    UnexpectedDiff(usize),
    #[error("unknown tied parameter key {0}")]
    UnknownParam(String),
    #[error("parameter key {0} is already registered")]
    DuplicateParam(String),
    #[error("layer used after shutdown")]
    Shutdown,
    #[error(transparent)]
    Init(#[from] InitError),
    #[error(transparent)]
    InvalidShape(#[from] ShapeError),
    #[error(transparent)]
    Blob(#[from] BlobError),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Settings shared by the loss layers.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LossConfig {
    /// Multiplier of the loss and of its gradients.
    pub weight: f64,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self { weight: 1.0 }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum LayerKind {
    InnerProduct(InnerProductConfig),
    TiedInnerProduct(TiedInnerProductConfig),
    ElementWise(ElementWiseConfig),
    Split,
    RandomNormal(RandomNormalConfig),
    /// Bottoms: `mu`, `sigma` (trainable), `x` (fixed).
    GaussianReconLoss(LossConfig),
    /// Bottoms: `z_mean`, `z_sd` (both trainable).
    EncoderLoss(LossConfig),
}

impl LayerKind {
    pub fn name(&self) -> &'static str {
        match self {
            LayerKind::InnerProduct(_) => "InnerProduct",
            LayerKind::TiedInnerProduct(_) => "TiedInnerProduct",
            LayerKind::ElementWise(_) => "ElementWise",
            LayerKind::Split => "Split",
            LayerKind::RandomNormal(_) => "RandomNormal",
            LayerKind::GaussianReconLoss(_) => "GaussianReconLoss",
            LayerKind::EncoderLoss(_) => "EncoderLoss",
        }
    }

    /// The neuron applied to the layer's top after forward.
    pub fn neuron(&self) -> Neuron {
        match self {
            LayerKind::InnerProduct(config) => config.neuron,
            LayerKind::TiedInnerProduct(config) => config.neuron,
            _ => Neuron::Identity,
        }
    }

    /// Whether gradients flow back through the layer's tops, i.e. whether they get diffs.
    pub fn trainable_tops(&self) -> bool {
        !matches!(self, LayerKind::RandomNormal(_))
    }
}

/// A configured layer: name, wiring and kind.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Layer {
    pub name: String,
    pub bottoms: Vec<String>,
    pub tops: Vec<String>,
    pub kind: LayerKind,
}

impl Layer {
    pub fn new(name: impl Into<String>, kind: LayerKind) -> Self {
        Self {
            name: name.into(),
            bottoms: vec![],
            tops: vec![],
            kind,
        }
    }

    pub fn bottom(mut self, symbol: impl Into<String>) -> Self {
        self.bottoms.push(symbol.into());
        self
    }

    pub fn top(mut self, symbol: impl Into<String>) -> Self {
        self.tops.push(symbol.into());
        self
    }
}

/// What each layer kind computes, called once [`LayerState`] has validated the blobs.
trait Compute<D: Device, T: Float> {
    fn forward(
        &mut self,
        bottoms: &[&Blob<D, T>],
        tops: &mut [&mut Blob<D, T>],
    ) -> Result<(), LayerError>;

    fn backward(
        &mut self,
        bottoms: &[&Blob<D, T>],
        top_diffs: &[&Blob<D, T>],
        bottom_diffs: &mut [Option<&mut Blob<D, T>>],
    ) -> Result<(), LayerError>;

    /// Releases scratch blobs.
    fn shutdown(&mut self);

    fn loss(&self) -> Option<f64> {
        None
    }

    fn params(&self) -> Vec<Arc<Param<D, T>>> {
        vec![]
    }
}

/// The state of one layer kind.
#[derive(Debug)]
enum LayerImpl<D: Device, T: Float> {
    InnerProduct(inner_product::InnerProduct<D, T>),
    TiedInnerProduct(tied_inner_product::TiedInnerProduct<D, T>),
    ElementWise(element_wise::ElementWise<T>),
    Split(split::Split<T>),
    RandomNormal(random_normal::RandomNormal<T>),
    GaussianReconLoss(gaussian_recon_loss::GaussianReconLoss<D, T>),
    EncoderLoss(encoder_loss::EncoderLoss<D, T>),
}

/// Runs `$f` on the state inside a [`LayerImpl`], whatever its kind.
macro_rules! with_impl {
    ($inner:expr, $state:ident => $f:expr) => {
        match $inner {
            LayerImpl::InnerProduct($state) => $f,
            LayerImpl::TiedInnerProduct($state) => $f,
            LayerImpl::ElementWise($state) => $f,
            LayerImpl::Split($state) => $f,
            LayerImpl::RandomNormal($state) => $f,
            LayerImpl::GaussianReconLoss($state) => $f,
            LayerImpl::EncoderLoss($state) => $f,
        }
    };
}

impl<D: Device, T: Float> LayerImpl<D, T> {
    fn forward(
        &mut self,
        bottoms: &[&Blob<D, T>],
        tops: &mut [&mut Blob<D, T>],
    ) -> Result<(), LayerError> {
        with_impl!(self, state => Compute::<D, T>::forward(state, bottoms, tops))
    }

    fn backward(
        &mut self,
        bottoms: &[&Blob<D, T>],
        top_diffs: &[&Blob<D, T>],
        bottom_diffs: &mut [Option<&mut Blob<D, T>>],
    ) -> Result<(), LayerError> {
        with_impl!(self, state => {
            Compute::<D, T>::backward(state, bottoms, top_diffs, bottom_diffs)
        })
    }

    fn shutdown(&mut self) {
        with_impl!(self, state => Compute::<D, T>::shutdown(state))
    }

    fn loss(&self) -> Option<f64> {
        with_impl!(self, state => Compute::<D, T>::loss(state))
    }

    fn params(&self) -> Vec<Arc<Param<D, T>>> {
        with_impl!(self, state => Compute::<D, T>::params(state))
    }
}

#[derive(Debug)]
pub struct LayerState<D: Device, T: Float> {
    kind: &'static str,
    neuron: Neuron,
    bottoms: Vec<Shape>,
    tops: Vec<Shape>,
    trainable: Vec<bool>,
    inner: LayerImpl<D, T>,
    active: bool,
}

/// Checks the number of blobs at a port.
pub(crate) fn check_count(port: Port, expected: usize, got: usize) -> Result<(), LayerError> {
    match expected == got {
        true => Ok(()),
        false => Err(LayerError::Count {
            port,
            expected,
            got,
        }),
    }
}

pub(crate) fn check_shape(expected: &Shape, got: &Shape) -> Result<(), LayerError> {
    match expected == got {
        true => Ok(()),
        false => Err(LayerError::Shape {
            expected: expected.clone(),
            got: got.clone(),
        }),
    }
}

/// Checks that `diffs[i]` is present exactly when `trainable[i]` holds.
pub(crate) fn check_trainable<X>(trainable: &[bool], diffs: &[Option<X>]) -> Result<(), LayerError> {
    for (index, (&trainable, diff)) in trainable.iter().zip(diffs).enumerate() {
        match (trainable, diff.is_some()) {
            (true, false) => return Err(LayerError::MissingDiff(index)),
            (false, true) => return Err(LayerError::UnexpectedDiff(index)),
            _ => {}
        }
    }
    Ok(())
}

impl<D: Device, T: Float> LayerState<D, T> {
    /// Validates the wiring of `layer` and allocates its state.
    ///
    /// `diffs[i]` is `None` when bottom `i` is fixed. Parameters are registered in, or for tied
    /// layers looked up from, `registry`.
    pub fn setup(
        device: &D,
        layer: &Layer,
        bottoms: &[&Blob<D, T>],
        diffs: &[Option<&Blob<D, T>>],
        registry: &mut ParamRegistry<D, T>,
    ) -> Result<Self, LayerError> {
        check_count(Port::Diff, bottoms.len(), diffs.len())?;
        for (bottom, diff) in bottoms.iter().zip(diffs) {
            if let Some(diff) = diff {
                check_shape(bottom.shape(), diff.shape())?;
            }
        }

        let shapes: Vec<Shape> = bottoms.iter().map(|blob| blob.shape().clone()).collect();
        let tops = layer.tops.len();
        let (inner, top_shapes) = match &layer.kind {
            LayerKind::InnerProduct(config) => {
                let (state, shape) =
                    inner_product::InnerProduct::setup(device, layer, config, &shapes, registry)?;
                (LayerImpl::InnerProduct(state), vec![shape])
            }
            LayerKind::TiedInnerProduct(config) => {
                let (state, shape) = tied_inner_product::TiedInnerProduct::setup(
                    device, layer, config, &shapes, registry,
                )?;
                (LayerImpl::TiedInnerProduct(state), vec![shape])
            }
            LayerKind::ElementWise(config) => {
                let (state, shape) = element_wise::ElementWise::<T>::setup(config, &shapes, tops)?;
                (LayerImpl::ElementWise(state), vec![shape])
            }
            LayerKind::Split => {
                let (state, shapes) = split::Split::<T>::setup(&shapes, tops)?;
                (LayerImpl::Split(state), shapes)
            }
            LayerKind::RandomNormal(config) => {
                let (state, shapes) = random_normal::RandomNormal::<T>::setup(config, &shapes, tops)?;
                (LayerImpl::RandomNormal(state), shapes)
            }
            LayerKind::GaussianReconLoss(config) => {
                let state = gaussian_recon_loss::GaussianReconLoss::setup(
                    device, config, &shapes, diffs, tops,
                )?;
                (LayerImpl::GaussianReconLoss(state), vec![])
            }
            LayerKind::EncoderLoss(config) => {
                let state =
                    encoder_loss::EncoderLoss::setup(device, config, &shapes, diffs, tops)?;
                (LayerImpl::EncoderLoss(state), vec![])
            }
        };

        let kind = layer.kind.name();
        log::debug!("set up {kind} layer {}: {:?} -> {:?}", layer.name, shapes, top_shapes);
        Ok(Self {
            kind,
            neuron: layer.kind.neuron(),
            bottoms: shapes,
            tops: top_shapes,
            trainable: diffs.iter().map(Option::is_some).collect(),
            inner,
            active: true,
        })
    }

    #[inline]
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    #[inline]
    pub fn neuron(&self) -> Neuron {
        self.neuron
    }

    /// Shapes of the bottoms given to setup.
    #[inline]
    pub fn bottom_shapes(&self) -> &[Shape] {
        &self.bottoms
    }

    /// Shapes of the tops the layer produces.
    #[inline]
    pub fn top_shapes(&self) -> &[Shape] {
        &self.tops
    }

    fn check_bottoms(&self, bottoms: &[&Blob<D, T>]) -> Result<(), LayerError> {
        if !self.active {
            return Err(LayerError::Shutdown);
        }
        check_count(Port::Bottom, self.bottoms.len(), bottoms.len())?;
        for (expected, blob) in self.bottoms.iter().zip(bottoms) {
            check_shape(expected, blob.shape())?;
        }
        Ok(())
    }

    /// Computes the tops from the bottoms. The neuron is not applied here.
    pub fn forward(
        &mut self,
        bottoms: &[&Blob<D, T>],
        tops: &mut [&mut Blob<D, T>],
    ) -> Result<(), LayerError> {
        self.check_bottoms(bottoms)?;
        check_count(Port::Top, self.tops.len(), tops.len())?;
        for (expected, blob) in self.tops.iter().zip(tops.iter()) {
            check_shape(expected, blob.shape())?;
        }
        self.inner.forward(bottoms, tops)
    }

    /// Overwrites every present bottom diff and accumulates parameter gradients.
    ///
    /// `top_diffs` must already include the neuron's derivative.
    pub fn backward(
        &mut self,
        bottoms: &[&Blob<D, T>],
        top_diffs: &[&Blob<D, T>],
        bottom_diffs: &mut [Option<&mut Blob<D, T>>],
    ) -> Result<(), LayerError> {
        self.check_bottoms(bottoms)?;
        check_count(Port::Top, self.tops.len(), top_diffs.len())?;
        for (expected, blob) in self.tops.iter().zip(top_diffs) {
            check_shape(expected, blob.shape())?;
        }
        check_count(Port::Diff, self.bottoms.len(), bottom_diffs.len())?;
        check_trainable(&self.trainable, bottom_diffs)?;
        for (expected, diff) in self.bottoms.iter().zip(bottom_diffs.iter()) {
            if let Some(diff) = diff {
                check_shape(expected, diff.shape())?;
            }
        }
        self.inner.backward(bottoms, top_diffs, bottom_diffs)
    }

    /// Releases the scratch blobs. The last loss stays readable. Calling it again does nothing.
    pub fn shutdown(&mut self) {
        if self.active {
            self.inner.shutdown();
            self.active = false;
        }
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// The loss computed by the last forward, for loss layers.
    #[inline]
    pub fn loss(&self) -> Option<f64> {
        self.inner.loss()
    }

    /// Parameters the layer reads, including tied ones.
    #[inline]
    pub fn params(&self) -> Vec<Arc<Param<D, T>>> {
        self.inner.params()
    }

    pub fn zero_grad(&self) -> Result<(), BlobError> {
        self.params().iter().try_for_each(|param| param.zero_grad())
    }
}
