use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use itertools::Itertools;
use rand::{Rng, SeedableRng, distributions::Uniform, rngs::StdRng};
use rand_distr::{Normal, NormalError};
use rustc_hash::FxHashMap as HashMap;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::layer::LayerError;
use crate::loom::{
    blob::{Blob, BlobError},
    device::Device,
    num::Float,
    shape::{IntoShape, Shape},
};

#[derive(Debug, Error)]
pub enum InitError {
    #[error(transparent)]
    Normal(#[from] NormalError),
    #[error("invalid uniform range [{0}, {1}]")]
    Uniform(f64, f64),
}

/// How a parameter blob is filled at setup.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Initializer {
    Constant(f64),
    Uniform { low: f64, high: f64 },
    Gaussian { std: f64 },
    /// Uniform in `±sqrt(3 / fan_in)`.
    #[default]
    Xavier,
}

impl Initializer {
    /// Draws `count` values for a parameter whose rows receive `fan_in` inputs.
    pub fn sample<T: Float, R: Rng + ?Sized>(
        self,
        rng: &mut R,
        count: usize,
        fan_in: usize,
    ) -> Result<Vec<T>, InitError> {
        let values = match self {
            Initializer::Constant(value) => vec![value; count],
            Initializer::Uniform { low, high } => {
                let dist = uniform(low, high)?;
                (0..count).map(|_| rng.sample(dist)).collect()
            }
            Initializer::Gaussian { std } => {
                let dist = Normal::new(0.0, std)?;
                (0..count).map(|_| rng.sample(dist)).collect()
            }
            Initializer::Xavier => {
                let scale = (3.0 / fan_in.max(1) as f64).sqrt();
                let dist = uniform(-scale, scale)?;
                (0..count).map(|_| rng.sample(dist)).collect()
            }
        };
        Ok(values.into_iter().map(T::from_f64).collect())
    }
}

fn uniform(low: f64, high: f64) -> Result<Uniform<f64>, InitError> {
    match low.is_finite() && high.is_finite() && low <= high {
        true => Ok(Uniform::new_inclusive(low, high)),
        false => Err(InitError::Uniform(low, high)),
    }
}

/// A generator seeded with `seed`, or from system entropy.
pub(crate) fn rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// A named trainable parameter with its gradient.
///
/// Parameters are shared between layers through [`Arc`]. Both blobs sit behind a lock: readers
/// take [`Param::data`] or [`Param::grad`], while kernels writing them take the `_mut` guards.
#[derive(Debug)]
pub struct Param<D: Device, T: Float> {
    name: String,
    shape: Shape,
    data: RwLock<Blob<D, T>>,
    grad: RwLock<Blob<D, T>>,
    lr_mult: f64,
}

impl<D: Device, T: Float> Param<D, T> {
    pub fn new(
        device: &D,
        name: impl Into<String>,
        shape: impl IntoShape,
        contents: &[T],
        lr_mult: f64,
    ) -> Result<Self, BlobError> {
        let name = name.into();
        let data = Blob::create(device, shape, contents)?;
        let grad = data.zeros_like()?;
        let shape = data.shape().clone();
        Ok(Self {
            name,
            shape,
            data: RwLock::new(data),
            grad: RwLock::new(grad),
            lr_mult,
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn data(&self) -> RwLockReadGuard<'_, Blob<D, T>> {
        self.data.read().expect("failed to lock")
    }

    pub fn data_mut(&self) -> RwLockWriteGuard<'_, Blob<D, T>> {
        self.data.write().expect("failed to lock")
    }

    pub fn grad(&self) -> RwLockReadGuard<'_, Blob<D, T>> {
        self.grad.read().expect("failed to lock")
    }

    pub fn grad_mut(&self) -> RwLockWriteGuard<'_, Blob<D, T>> {
        self.grad.write().expect("failed to lock")
    }

    /// Learning-rate multiplier applied by the solver.
    #[inline]
    pub fn lr_mult(&self) -> f64 {
        self.lr_mult
    }

    #[inline]
    pub fn read_data(&self) -> Result<Vec<T>, BlobError> {
        self.data().read()
    }

    #[inline]
    pub fn read_grad(&self) -> Result<Vec<T>, BlobError> {
        self.grad().read()
    }

    /// Overwrites the parameter values, e.g. after a solver step.
    pub fn write_data(&self, contents: &[T]) -> Result<(), BlobError> {
        self.data_mut().write(contents)
    }

    pub fn zero_grad(&self) -> Result<(), BlobError> {
        self.grad_mut().fill(T::zero())
    }
}

/// Parameters of one net keyed by parameter key, in registration order.
#[derive(Debug)]
pub struct ParamRegistry<D: Device, T: Float> {
    params: Vec<Arc<Param<D, T>>>,
    keys: HashMap<String, usize>,
}

impl<D: Device, T: Float> Default for ParamRegistry<D, T> {
    fn default() -> Self {
        Self {
            params: vec![],
            keys: HashMap::default(),
        }
    }
}

impl<D: Device, T: Float> ParamRegistry<D, T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `param` under its name.
    pub fn insert(&mut self, param: Param<D, T>) -> Result<Arc<Param<D, T>>, LayerError> {
        if self.keys.contains_key(param.name()) {
            return Err(LayerError::DuplicateParam(param.name().to_owned()));
        }
        let param = Arc::new(param);
        self.keys.insert(param.name().to_owned(), self.params.len());
        self.params.push(param.clone());
        Ok(param)
    }

    /// Registers all of `params`, or none of them if any key is taken.
    pub fn extend(
        &mut self,
        params: impl IntoIterator<Item = Param<D, T>>,
    ) -> Result<Vec<Arc<Param<D, T>>>, LayerError> {
        let params = params.into_iter().collect_vec();
        for (index, param) in params.iter().enumerate() {
            let name = param.name();
            if self.keys.contains_key(name) || params[..index].iter().any(|x| x.name() == name) {
                return Err(LayerError::DuplicateParam(name.to_owned()));
            }
        }
        params.into_iter().map(|param| self.insert(param)).collect()
    }

    pub fn get(&self, key: &str) -> Result<Arc<Param<D, T>>, LayerError> {
        self.keys
            .get(key)
            .map(|&index| self.params[index].clone())
            .ok_or_else(|| LayerError::UnknownParam(key.to_owned()))
    }

    #[inline]
    pub fn params(&self) -> &[Arc<Param<D, T>>] {
        &self.params
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.params.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn zero_grad(&self) -> Result<(), BlobError> {
        self.params.iter().try_for_each(|param| param.zero_grad())
    }

    /// Names of all registered parameters.
    pub fn keys(&self) -> Vec<&str> {
        self.params.iter().map(|param| param.name()).collect_vec()
    }

    pub fn clear(&mut self) {
        self.params.clear();
        self.keys.clear();
    }
}
