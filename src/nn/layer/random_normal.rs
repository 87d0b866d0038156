use std::marker::PhantomData;

use itertools::Itertools;
use rand::{Rng, SeedableRng, rngs::StdRng};
use rand_distr::StandardNormal;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::{Compute, LayerError, Port, check_count};
use crate::loom::{blob::Blob, device::Device, num::Float, shape::Shape};

/// Source of standard normal noise: no bottoms, one top per shape.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RandomNormalConfig {
    pub shapes: Vec<Shape>,
    pub seed: Option<u64>,
    /// Replay the same samples on every forward instead of drawing new ones.
    pub frozen: bool,
}

impl RandomNormalConfig {
    pub fn new(shapes: impl IntoIterator<Item = Shape>) -> Self {
        Self {
            shapes: shapes.into_iter().collect(),
            seed: None,
            frozen: false,
        }
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn frozen(mut self, frozen: bool) -> Self {
        self.frozen = frozen;
        self
    }
}

#[derive(Debug)]
pub struct RandomNormal<T> {
    rng: StdRng,
    seed: u64,
    frozen: bool,
    phantom: PhantomData<T>,
}

impl<T: Float> RandomNormal<T> {
    pub(super) fn setup(
        config: &RandomNormalConfig,
        bottoms: &[Shape],
        tops: usize,
    ) -> Result<(Self, Vec<Shape>), LayerError> {
        check_count(Port::Bottom, 0, bottoms.len())?;
        check_count(Port::Top, config.shapes.len(), tops)?;

        let seed = config.seed.unwrap_or_else(rand::random);
        let state = Self {
            rng: StdRng::seed_from_u64(seed),
            seed,
            frozen: config.frozen,
            phantom: PhantomData,
        };
        Ok((state, config.shapes.clone()))
    }
}

impl<D: Device, T: Float> Compute<D, T> for RandomNormal<T> {
    fn forward(
        &mut self,
        _bottoms: &[&Blob<D, T>],
        tops: &mut [&mut Blob<D, T>],
    ) -> Result<(), LayerError> {
        if self.frozen {
            self.rng = StdRng::seed_from_u64(self.seed);
        }
        for top in tops.iter_mut() {
            let samples = (0..top.count())
                .map(|_| T::from_f64(self.rng.sample(StandardNormal)))
                .collect_vec();
            top.write(&samples)?;
        }
        Ok(())
    }

    fn backward(
        &mut self,
        _bottoms: &[&Blob<D, T>],
        _top_diffs: &[&Blob<D, T>],
        _bottom_diffs: &mut [Option<&mut Blob<D, T>>],
    ) -> Result<(), LayerError> {
        Ok(())
    }

    fn shutdown(&mut self) {}
}
