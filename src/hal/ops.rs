use std::marker::PhantomData;

use ristretto_derive::BlobOp;

use crate::{
    loom::{
        blob::Blob,
        device::{Device, DeviceError},
        num::Float,
        ops::{Access, BlobIr},
    },
    nn::{
        layer::element_wise::{ElementWiseFunctor, Operand},
        neuron::Neuron,
    },
};

/// Fails with [`DeviceError::Size`] unless every blob holds `count` elements.
fn check_count(count: usize, irs: &[&BlobIr]) -> Result<(), DeviceError> {
    match irs.iter().find(|ir| ir.count() != count) {
        Some(ir) => Err(DeviceError::Size {
            id: ir.id,
            size: ir.data_size(),
            len: count * ir.r#type.size(),
        }),
        None => Ok(()),
    }
}

/// Applies `neuron` to `output` in place.
#[derive(Debug, Clone, BlobOp)]
#[blob_op(crate = "crate", bound = "T: Float")]
pub struct NeuronForwardOp<T> {
    pub neuron: Neuron,
    #[blob_op]
    pub output: BlobIr,
    pub phantom: PhantomData<T>,
}

/// Multiplies `gradient` by the derivative of `neuron` evaluated at `output`.
#[derive(Debug, Clone, BlobOp)]
#[blob_op(crate = "crate", bound = "T: Float")]
pub struct NeuronBackwardOp<T> {
    pub neuron: Neuron,
    #[blob_op]
    pub output: BlobIr,
    #[blob_op]
    pub gradient: BlobIr,
    pub phantom: PhantomData<T>,
}

/// Per-element negative log-density of `x` under `N(mu, sigma²)`, written to `terms`.
#[derive(Debug, Clone, BlobOp)]
#[blob_op(crate = "crate", bound = "T: Float")]
pub struct GaussianReconLossOp<T> {
    #[blob_op]
    pub mu: BlobIr,
    #[blob_op]
    pub sigma: BlobIr,
    #[blob_op]
    pub x: BlobIr,
    #[blob_op]
    pub terms: BlobIr,
    pub phantom: PhantomData<T>,
}

/// Gradients of the Gaussian reconstruction loss, each multiplied by `scale`.
#[derive(Debug, Clone, BlobOp)]
#[blob_op(crate = "crate", bound = "T: Float")]
pub struct GaussianReconGradOp<T> {
    pub scale: f64,
    #[blob_op]
    pub mu: BlobIr,
    #[blob_op]
    pub sigma: BlobIr,
    #[blob_op]
    pub x: BlobIr,
    #[blob_op]
    pub mu_diff: BlobIr,
    #[blob_op]
    pub sigma_diff: BlobIr,
    pub phantom: PhantomData<T>,
}

/// Per-element `-(1 + 2 log σ - μ² - σ²)`, written to `terms`.
#[derive(Debug, Clone, BlobOp)]
#[blob_op(crate = "crate", bound = "T: Float")]
pub struct EncoderLossOp<T> {
    #[blob_op]
    pub mu: BlobIr,
    #[blob_op]
    pub sigma: BlobIr,
    #[blob_op]
    pub terms: BlobIr,
    pub phantom: PhantomData<T>,
}

/// Gradients of the encoder loss, each multiplied by `scale`.
#[derive(Debug, Clone, BlobOp)]
#[blob_op(crate = "crate", bound = "T: Float")]
pub struct EncoderGradOp<T> {
    pub scale: f64,
    #[blob_op]
    pub mu: BlobIr,
    #[blob_op]
    pub sigma: BlobIr,
    #[blob_op]
    pub mu_diff: BlobIr,
    #[blob_op]
    pub sigma_diff: BlobIr,
    pub phantom: PhantomData<T>,
}

/// Dimensions of `C = alpha * op(A) * op(B) + beta * C`, all matrices column-major.
///
/// `C` is `m × n`, `op(A)` is `m × k` and `op(B)` is `k × n`. A transposed operand is stored in the
/// transposed orientation, e.g. `A` is stored `k × m` when `trans_a` is set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Gemm {
    pub trans_a: bool,
    pub trans_b: bool,
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub alpha: f64,
    pub beta: f64,
}

impl Gemm {
    /// `C = op(A) op(B)` without transposes.
    pub fn new(m: usize, n: usize, k: usize) -> Self {
        Self {
            trans_a: false,
            trans_b: false,
            m,
            n,
            k,
            alpha: 1.0,
            beta: 0.0,
        }
    }

    pub fn trans_a(mut self) -> Self {
        self.trans_a = true;
        self
    }

    pub fn trans_b(mut self) -> Self {
        self.trans_b = true;
        self
    }

    pub fn alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn beta(mut self, beta: f64) -> Self {
        self.beta = beta;
        self
    }

    /// Runs the product on the device of `c`.
    pub fn execute<D: Device, T: Float>(
        self,
        a: &Blob<D, T>,
        b: &Blob<D, T>,
        c: &mut Blob<D, T>,
    ) -> Result<(), DeviceError> {
        let access = match self.beta == 0.0 {
            true => Access::WriteOnly,
            false => Access::ReadWrite,
        };
        let op = GemmOp::<T> {
            gemm: self,
            a: a.ir(Access::ReadOnly),
            b: b.ir(Access::ReadOnly),
            c: c.ir(access),
            phantom: PhantomData,
        };
        c.device().execute(&op)
    }

    /// Storage index of `op(A)[i, p]`.
    #[inline]
    pub fn index_a(&self, i: usize, p: usize) -> usize {
        match self.trans_a {
            false => i + p * self.m,
            true => p + i * self.k,
        }
    }

    /// Storage index of `op(B)[p, j]`.
    #[inline]
    pub fn index_b(&self, p: usize, j: usize) -> usize {
        match self.trans_b {
            false => p + j * self.k,
            true => j + p * self.n,
        }
    }
}

#[derive(Debug, Clone, BlobOp)]
#[blob_op(crate = "crate", bound = "T: Float")]
pub struct GemmOp<T> {
    pub gemm: Gemm,
    #[blob_op]
    pub a: BlobIr,
    #[blob_op]
    pub b: BlobIr,
    #[blob_op]
    pub c: BlobIr,
    pub phantom: PhantomData<T>,
}

/// `y += alpha * x`.
#[derive(Debug, Clone, BlobOp)]
#[blob_op(crate = "crate", bound = "T: Float")]
pub struct AxpyOp<T> {
    pub alpha: f64,
    #[blob_op]
    pub x: BlobIr,
    #[blob_op]
    pub y: BlobIr,
    pub phantom: PhantomData<T>,
}

impl<T: Float> AxpyOp<T> {
    /// Runs `y += alpha * x` on the device of `y`.
    pub fn run<D: Device>(
        alpha: f64,
        x: &Blob<D, T>,
        y: &mut Blob<D, T>,
    ) -> Result<(), DeviceError> {
        let op = Self {
            alpha,
            x: x.ir(Access::ReadOnly),
            y: y.ir(Access::ReadWrite),
            phantom: PhantomData,
        };
        y.device().execute(&op)
    }
}

/// `output = functor(a, b)` elementwise.
#[derive(Debug, Clone, BlobOp)]
#[blob_op(crate = "crate", bound = "T: Float")]
pub struct ElementWiseOp<T> {
    pub functor: ElementWiseFunctor,
    #[blob_op]
    pub a: BlobIr,
    #[blob_op]
    pub b: BlobIr,
    #[blob_op]
    pub output: BlobIr,
    pub phantom: PhantomData<T>,
}

/// Overwrites `diff` with the gradient flowing to `operand` given the top gradient.
#[derive(Debug, Clone, BlobOp)]
#[blob_op(crate = "crate", bound = "T: Float")]
pub struct ElementWiseGradOp<T> {
    pub functor: ElementWiseFunctor,
    pub operand: Operand,
    #[blob_op]
    pub a: BlobIr,
    #[blob_op]
    pub b: BlobIr,
    #[blob_op]
    pub top_diff: BlobIr,
    #[blob_op]
    pub diff: BlobIr,
    pub phantom: PhantomData<T>,
}

impl<T> NeuronBackwardOp<T> {
    /// Checks that the blobs agree in size before a kernel indexes them.
    pub fn check(&self) -> Result<(), DeviceError> {
        check_count(self.output.count(), &[&self.gradient])
    }
}

impl<T> GaussianReconLossOp<T> {
    pub fn check(&self) -> Result<(), DeviceError> {
        check_count(self.terms.count(), &[&self.mu, &self.sigma, &self.x])
    }
}

impl<T> GaussianReconGradOp<T> {
    pub fn check(&self) -> Result<(), DeviceError> {
        let blobs = [&self.mu, &self.sigma, &self.x, &self.sigma_diff];
        check_count(self.mu_diff.count(), &blobs)
    }
}

impl<T> EncoderLossOp<T> {
    pub fn check(&self) -> Result<(), DeviceError> {
        check_count(self.terms.count(), &[&self.mu, &self.sigma])
    }
}

impl<T> EncoderGradOp<T> {
    pub fn check(&self) -> Result<(), DeviceError> {
        let blobs = [&self.mu, &self.sigma, &self.sigma_diff];
        check_count(self.mu_diff.count(), &blobs)
    }
}

impl<T> GemmOp<T> {
    /// Checks the blob sizes against the dimensions of the product.
    pub fn check(&self) -> Result<(), DeviceError> {
        let Gemm { m, n, k, .. } = self.gemm;
        check_count(m * k, &[&self.a])?;
        check_count(k * n, &[&self.b])?;
        check_count(m * n, &[&self.c])
    }
}

impl<T> AxpyOp<T> {
    pub fn check(&self) -> Result<(), DeviceError> {
        check_count(self.y.count(), &[&self.x])
    }
}

impl<T> ElementWiseOp<T> {
    pub fn check(&self) -> Result<(), DeviceError> {
        check_count(self.output.count(), &[&self.a, &self.b])
    }
}

impl<T> ElementWiseGradOp<T> {
    pub fn check(&self) -> Result<(), DeviceError> {
        check_count(self.diff.count(), &[&self.a, &self.b, &self.top_diff])
    }
}
