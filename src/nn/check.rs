use itertools::Itertools;
use thiserror::Error;

use super::{
    net::{Net, NetError},
    param::Param,
};
use crate::loom::{blob::BlobError, device::Device, num::Float};

#[derive(Debug, Error)]
pub enum CheckError {
    #[error(
        "gradient mismatch at {param}[{index}]: analytic {analytic}, numeric {numeric}, relative error {error}"
    )]
    Mismatch {
        param: String,
        index: usize,
        analytic: f64,
        numeric: f64,
        error: f64,
    },
    #[error(transparent)]
    Net(#[from] NetError),
    #[error(transparent)]
    Blob(#[from] BlobError),
}

/// The worst element of one parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamReport {
    pub name: String,
    pub index: usize,
    pub error: f64,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct GradientReport {
    pub params: Vec<ParamReport>,
}

impl GradientReport {
    /// The largest relative error over all parameters.
    pub fn worst(&self) -> f64 {
        self.params.iter().map(|param| param.error).fold(0.0, f64::max)
    }
}

/// Compares the gradients from [`Net::backward`] against central differences of [`Net::loss`].
///
/// Every element of every parameter is perturbed by `±epsilon`. The relative error of an element
/// is `|analytic - numeric| / max(|analytic|, |numeric|, 1)`; the check fails on the first element
/// whose error exceeds `tolerance`, after all elements are visited. Parameters are restored and
/// the net is left after a clean forward.
///
/// Layers drawing random numbers must replay the same samples on every forward for the check to
/// be meaningful.
pub fn gradient_check<D: Device, T: Float>(
    net: &mut Net<D, T>,
    epsilon: f64,
    tolerance: f64,
) -> Result<GradientReport, CheckError> {
    net.forward()?;
    net.backward()?;

    let params = net.params().to_vec();
    let grads = params
        .iter()
        .map(|param| param.read_grad())
        .collect::<Result<Vec<_>, _>>()?;

    let mut report = GradientReport::default();
    let mut failure = None;
    for (param, grad) in params.iter().zip_eq(grads) {
        let worst = check_param(net, param, grad, epsilon, tolerance, &mut failure)?;
        log::debug!("{}: worst relative error {}", worst.name, worst.error);
        report.params.push(worst);
    }
    net.forward()?;

    match failure {
        Some(err) => Err(err),
        None => Ok(report),
    }
}

/// Loss of `net` with the values of `param` replaced by `values`.
fn loss_at<D: Device, T: Float>(
    net: &mut Net<D, T>,
    param: &Param<D, T>,
    values: &[T],
) -> Result<f64, CheckError> {
    param.write_data(values)?;
    net.forward()?;
    Ok(net.loss())
}

/// Checks every element of one parameter, recording the first mismatch in `failure`.
///
/// The parameter holds its original values on return, also when a forward fails.
fn check_param<D: Device, T: Float>(
    net: &mut Net<D, T>,
    param: &Param<D, T>,
    grad: Vec<T>,
    epsilon: f64,
    tolerance: f64,
    failure: &mut Option<CheckError>,
) -> Result<ParamReport, CheckError> {
    let original = param.read_data()?;
    let mut worst = ParamReport {
        name: param.name().to_owned(),
        index: 0,
        error: 0.0,
    };

    let mut values = original.clone();
    for (index, analytic) in grad.into_iter().enumerate() {
        let x = original[index].to_f64();
        let mut central = || -> Result<(f64, f64), CheckError> {
            values[index] = T::from_f64(x + epsilon);
            let plus = loss_at(net, param, &values)?;
            values[index] = T::from_f64(x - epsilon);
            let minus = loss_at(net, param, &values)?;
            Ok((plus, minus))
        };
        let (plus, minus) = match central() {
            Ok(losses) => losses,
            Err(err) => {
                param.write_data(&original)?;
                return Err(err);
            }
        };
        values[index] = original[index];

        let analytic = analytic.to_f64();
        let numeric = (plus - minus) / (2.0 * epsilon);
        let scale = analytic.abs().max(numeric.abs()).max(1.0);
        let error = (analytic - numeric).abs() / scale;

        if error > worst.error || error.is_nan() {
            worst.index = index;
            worst.error = error;
        }
        if error > tolerance || error.is_nan() {
            log::warn!(
                "{}[{index}]: analytic {analytic}, numeric {numeric}",
                param.name()
            );
            failure.get_or_insert(CheckError::Mismatch {
                param: param.name().to_owned(),
                index,
                analytic,
                numeric,
                error,
            });
        }
    }

    param.write_data(&original)?;
    Ok(worst)
}
