use std::sync::Arc;

use itertools::Itertools;
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{
    layer::{Layer, LayerError, LayerState},
    neuron::Neuron,
    param::{Param, ParamRegistry},
};
use crate::loom::{
    blob::{Blob, BlobError},
    device::Device,
    num::Float,
    shape::{Shape, ShapeError},
};

#[derive(Debug, Error)]
pub enum NetError {
    #[error("layer {layer}: bottom {symbol} is not bound by an input or an earlier layer")]
    Unbound { layer: String, symbol: String },
    #[error("layer {layer}: top {symbol} of shape {shape} rebinds a blob of shape {bound}")]
    ShapeConflict {
        layer: String,
        symbol: String,
        bound: Shape,
        shape: Shape,
    },
    #[error("layer {layer}: top {symbol} is also one of its bottoms")]
    InPlace { layer: String, symbol: String },
    #[error("duplicate layer name {0}")]
    DuplicateLayer(String),
    #[error("layer {layer}: bottom {symbol} is listed twice")]
    DuplicateBottom { layer: String, symbol: String },
    #[error("layer {layer}: top {symbol} is listed twice")]
    DuplicateTop { layer: String, symbol: String },
    #[error("duplicate input {0}")]
    DuplicateInput(String),
    #[error("layer {layer}: trainable blob {symbol} already feeds another layer, split it first")]
    SharedBlob { layer: String, symbol: String },
    #[error("unknown input {0}")]
    UnknownInput(String),
    #[error("unknown blob {0}")]
    UnknownBlob(String),
    #[error("net used after shutdown")]
    Shutdown,
    #[error("layer {name}: {source}")]
    Layer { name: String, source: LayerError },
    #[error(transparent)]
    Shape(#[from] ShapeError),
    #[error(transparent)]
    Blob(#[from] BlobError),
}

/// A blob fed by the data loader. Inputs are fixed: they never get a diff.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Input {
    pub symbol: String,
    pub shape: Vec<usize>,
}

/// Declared inputs plus the ordered layer list of a net.
#[derive(Debug, Default, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NetBuilder {
    pub inputs: Vec<Input>,
    pub layers: Vec<Layer>,
}

impl NetBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn input(mut self, symbol: impl Into<String>, shape: impl Into<Vec<usize>>) -> Self {
        self.inputs.push(Input {
            symbol: symbol.into(),
            shape: shape.into(),
        });
        self
    }

    pub fn layer(mut self, layer: Layer) -> Self {
        self.layers.push(layer);
        self
    }

    /// Allocates every blob and sets up every layer in order.
    pub fn build<D: Device, T: Float>(self, device: &D) -> Result<Net<D, T>, NetError> {
        let mut net = Net {
            data: vec![],
            diffs: vec![],
            symbols: HashMap::default(),
            inputs: HashMap::default(),
            nodes: vec![],
            registry: ParamRegistry::new(),
            last_loss: None,
        };
        let mut consumed = vec![];

        for Input { symbol, shape } in self.inputs {
            if net.symbols.contains_key(&symbol) {
                return Err(NetError::DuplicateInput(symbol));
            }
            let index = net.push(device, Shape::new(shape)?, false)?;
            consumed.push(false);
            net.symbols.insert(symbol.clone(), index);
            net.inputs.insert(symbol, index);
        }

        let mut names = HashSet::default();
        for layer in self.layers {
            if !names.insert(layer.name.clone()) {
                return Err(NetError::DuplicateLayer(layer.name));
            }
            let error = |symbol: &String| (layer.name.clone(), symbol.clone());

            let mut bottoms = vec![];
            for (k, symbol) in layer.bottoms.iter().enumerate() {
                if layer.bottoms[..k].contains(symbol) {
                    let (layer, symbol) = error(symbol);
                    return Err(NetError::DuplicateBottom { layer, symbol });
                }
                let Some(&index) = net.symbols.get(symbol) else {
                    let (layer, symbol) = error(symbol);
                    return Err(NetError::Unbound { layer, symbol });
                };
                if net.diffs[index].is_some() {
                    if consumed[index] {
                        let (layer, symbol) = error(symbol);
                        return Err(NetError::SharedBlob { layer, symbol });
                    }
                    consumed[index] = true;
                }
                bottoms.push(index);
            }
            for (k, symbol) in layer.tops.iter().enumerate() {
                if layer.bottoms.contains(symbol) {
                    let (layer, symbol) = error(symbol);
                    return Err(NetError::InPlace { layer, symbol });
                }
                if layer.tops[..k].contains(symbol) {
                    let (layer, symbol) = error(symbol);
                    return Err(NetError::DuplicateTop { layer, symbol });
                }
            }

            let state = {
                let blobs = bottoms.iter().map(|&index| &net.data[index]).collect_vec();
                let diffs = bottoms
                    .iter()
                    .map(|&index| net.diffs[index].as_ref())
                    .collect_vec();
                LayerState::setup(device, &layer, &blobs, &diffs, &mut net.registry).map_err(
                    |source| NetError::Layer {
                        name: layer.name.clone(),
                        source,
                    },
                )?
            };

            let mut tops = vec![];
            for (symbol, shape) in layer.tops.iter().zip(state.top_shapes()) {
                if let Some(&index) = net.symbols.get(symbol) {
                    let bound = net.data[index].shape();
                    if bound != shape {
                        let (layer, symbol) = error(symbol);
                        let bound = bound.clone();
                        let shape = shape.clone();
                        return Err(NetError::ShapeConflict {
                            layer,
                            symbol,
                            bound,
                            shape,
                        });
                    }
                }
                let index = net.push(device, shape.clone(), layer.kind.trainable_tops())?;
                consumed.push(false);
                net.symbols.insert(symbol.clone(), index);
                tops.push(index);
            }

            net.nodes.push(Node {
                name: layer.name,
                state,
                bottoms,
                tops,
            });
        }

        log::debug!(
            "built net: {} layers, {} blobs, {} params",
            net.nodes.len(),
            net.data.len(),
            net.registry.len()
        );
        Ok(net)
    }
}

#[derive(Debug)]
struct Node<D: Device, T: Float> {
    name: String,
    state: LayerState<D, T>,
    bottoms: Vec<usize>,
    tops: Vec<usize>,
}

/// Borrows `reads` immutably and `writes` mutably from `items`. Indices must be distinct.
fn pick<'a, X>(items: &'a mut [X], reads: &[usize], writes: &[usize]) -> (Vec<&'a X>, Vec<&'a mut X>) {
    let mut slots = items.iter_mut().map(Some).collect_vec();
    let mut take = |index: usize| slots[index].take().expect("blob indices are distinct");
    let writes = writes.iter().map(|&index| take(index)).collect_vec();
    let reads = reads.iter().map(|&index| &*take(index)).collect_vec();
    (reads, writes)
}

/// Ordered layers wired through named blobs.
///
/// Every symbol resolves to one blob in the arena; rebinding a symbol allocates a new blob, so
/// earlier consumers keep reading the old one.
#[derive(Debug)]
pub struct Net<D: Device, T: Float> {
    data: Vec<Blob<D, T>>,
    diffs: Vec<Option<Blob<D, T>>>,
    /// The latest binding of every symbol.
    symbols: HashMap<String, usize>,
    inputs: HashMap<String, usize>,
    nodes: Vec<Node<D, T>>,
    registry: ParamRegistry<D, T>,
    /// Total loss at shutdown.
    last_loss: Option<f64>,
}

impl<D: Device, T: Float> Net<D, T> {
    fn push(&mut self, device: &D, shape: Shape, trainable: bool) -> Result<usize, NetError> {
        let data = Blob::zeros(device, shape)?;
        let diff = match trainable {
            true => Some(data.zeros_like()?),
            false => None,
        };
        self.data.push(data);
        self.diffs.push(diff);
        Ok(self.data.len() - 1)
    }

    fn check_active(&self) -> Result<(), NetError> {
        match self.last_loss {
            Some(_) => Err(NetError::Shutdown),
            None => Ok(()),
        }
    }

    /// Runs every layer in order, each followed by its neuron.
    pub fn forward(&mut self) -> Result<(), NetError> {
        #[cfg(feature = "trace")]
        let _span = tracing::trace_span!("forward").entered();
        self.check_active()?;

        for node in &mut self.nodes {
            log::trace!("forward {}", node.name);
            let layer = |source: LayerError| NetError::Layer {
                name: node.name.clone(),
                source,
            };
            let (bottoms, mut tops) = pick(&mut self.data, &node.bottoms, &node.tops);
            node.state.forward(&bottoms, &mut tops).map_err(layer)?;

            let neuron = node.state.neuron();
            for top in tops.iter_mut() {
                neuron.forward(&mut **top).map_err(|err| layer(err.into()))?;
            }
        }
        Ok(())
    }

    /// Clears the parameter gradients, then runs every layer backwards in reverse order.
    pub fn backward(&mut self) -> Result<(), NetError> {
        #[cfg(feature = "trace")]
        let _span = tracing::trace_span!("backward").entered();
        self.check_active()?;
        self.registry.zero_grad()?;

        for node in self.nodes.iter_mut().rev() {
            log::trace!("backward {}", node.name);
            let layer = |source: LayerError| NetError::Layer {
                name: node.name.clone(),
                source,
            };

            let neuron = node.state.neuron();
            if neuron != Neuron::Identity {
                for &top in &node.tops {
                    if let Some(diff) = self.diffs[top].as_mut() {
                        neuron
                            .backward(&self.data[top], diff)
                            .map_err(|err| layer(err.into()))?;
                    }
                }
            }

            let bottoms = node.bottoms.iter().map(|&index| &self.data[index]).collect_vec();
            let (top_diffs, bottom_diffs) = pick(&mut self.diffs, &node.tops, &node.bottoms);
            // tops without diffs are sources, nothing flows back through them
            let Some(top_diffs) = top_diffs
                .into_iter()
                .map(Option::as_ref)
                .collect::<Option<Vec<_>>>()
            else {
                continue;
            };
            let mut bottom_diffs = bottom_diffs.into_iter().map(Option::as_mut).collect_vec();
            node.state
                .backward(&bottoms, &top_diffs, &mut bottom_diffs)
                .map_err(layer)?;
        }
        Ok(())
    }

    /// Sum of the losses of every loss layer from the last forward.
    pub fn loss(&self) -> f64 {
        match self.last_loss {
            Some(loss) => loss,
            None => self.nodes.iter().filter_map(|node| node.state.loss()).sum(),
        }
    }

    /// Trainable parameters in registration order.
    #[inline]
    pub fn params(&self) -> &[Arc<Param<D, T>>] {
        self.registry.params()
    }

    pub fn param(&self, key: &str) -> Option<Arc<Param<D, T>>> {
        self.registry.get(key).ok()
    }

    /// The blob of a declared input, to be filled by the data loader.
    pub fn input_mut(&mut self, symbol: &str) -> Result<&mut Blob<D, T>, NetError> {
        self.check_active()?;
        let &index = self
            .inputs
            .get(symbol)
            .ok_or_else(|| NetError::UnknownInput(symbol.to_owned()))?;
        Ok(&mut self.data[index])
    }

    fn index(&self, symbol: &str) -> Result<usize, NetError> {
        self.check_active()?;
        self.symbols
            .get(symbol)
            .copied()
            .ok_or_else(|| NetError::UnknownBlob(symbol.to_owned()))
    }

    /// The blob currently bound to `symbol`.
    pub fn blob(&self, symbol: &str) -> Result<&Blob<D, T>, NetError> {
        let index = self.index(symbol)?;
        Ok(&self.data[index])
    }

    /// The diff of the blob currently bound to `symbol`; `None` for fixed blobs.
    pub fn diff(&self, symbol: &str) -> Result<Option<&Blob<D, T>>, NetError> {
        let index = self.index(symbol)?;
        Ok(self.diffs[index].as_ref())
    }

    pub fn layer(&self, name: &str) -> Option<&LayerState<D, T>> {
        self.nodes
            .iter()
            .find(|node| node.name == name)
            .map(|node| &node.state)
    }

    /// Names of the layers in order.
    pub fn layer_names(&self) -> Vec<&str> {
        self.nodes.iter().map(|node| node.name.as_str()).collect()
    }

    /// Releases every layer state, blob and parameter. The loss stays readable.
    /// Calling it again does nothing.
    pub fn shutdown(&mut self) {
        if self.last_loss.is_some() {
            return;
        }
        self.last_loss = Some(self.loss());
        for node in &mut self.nodes {
            node.state.shutdown();
        }
        self.nodes.clear();
        self.registry.clear();
        self.data.clear();
        self.diffs.clear();
        log::debug!("net shut down");
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.last_loss.is_none()
    }
}

impl<D: Device, T: Float> Drop for Net<D, T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
