//! Value initializers for parameter and data tensors.

use rand::Rng;
use rand_distr::{Distribution, Normal, Uniform};
use serde::{Deserialize, Serialize};

use crate::error::{NetError, NetResult};
use crate::tensor::{cast, Element, Tensor};

/// Which fan a scaled initializer normalizes by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarianceNorm {
    #[default]
    FanIn,
    FanOut,
    Average,
}

fn one() -> f64 {
    1.0
}

/// Initializer description, tagged by `type` in JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FillerSpec {
    Constant {
        #[serde(default)]
        value: f64,
    },
    Uniform {
        #[serde(default)]
        min: f64,
        #[serde(default = "one")]
        max: f64,
    },
    Gaussian {
        #[serde(default)]
        mean: f64,
        #[serde(default = "one")]
        std: f64,
    },
    /// Uniform in `[-sqrt(3 / n), sqrt(3 / n)]` with `n` picked by `variance_norm`.
    Xavier {
        #[serde(default)]
        variance_norm: VarianceNorm,
    },
    /// Zero-mean gaussian with standard deviation `sqrt(2 / n)`.
    Msra {
        #[serde(default)]
        variance_norm: VarianceNorm,
    },
}

impl Default for FillerSpec {
    fn default() -> Self {
        FillerSpec::Constant { value: 0.0 }
    }
}

impl FillerSpec {
    pub fn constant(value: f64) -> Self {
        FillerSpec::Constant { value }
    }

    pub fn is_constant(&self) -> bool {
        matches!(self, FillerSpec::Constant { .. })
    }

    /// Overwrites every value of `tensor`.
    pub fn fill<T: Element, R: Rng + ?Sized>(&self, tensor: &Tensor<T>, rng: &mut R) -> NetResult<()> {
        let count = tensor.count();
        if count == 0 {
            return Ok(());
        }
        let mut values = tensor.values_mut()?;
        match *self {
            FillerSpec::Constant { value } => values.fill(cast(value)),
            FillerSpec::Uniform { min, max } => fill_uniform(&mut values, min, max, rng)?,
            FillerSpec::Gaussian { mean, std } => fill_gaussian(&mut values, mean, std, rng)?,
            FillerSpec::Xavier { variance_norm } => {
                let n = fan(tensor, variance_norm);
                let scale = (3.0 / n).sqrt();
                fill_uniform(&mut values, -scale, scale, rng)?;
            }
            FillerSpec::Msra { variance_norm } => {
                let n = fan(tensor, variance_norm);
                fill_gaussian(&mut values, 0.0, (2.0 / n).sqrt(), rng)?;
            }
        }
        Ok(())
    }
}

/// Fan size for scaled initializers: inputs per output unit and outputs per input unit.
fn fan<T: Element>(tensor: &Tensor<T>, norm: VarianceNorm) -> f64 {
    let shape = tensor.shape();
    let count = shape.num_elements() as f64;
    let dims = shape.dims();
    let fan_in = dims.first().map_or(count, |&d| count / d.max(1) as f64);
    let fan_out = dims.get(1).map_or(fan_in, |&d| count / d.max(1) as f64);
    match norm {
        VarianceNorm::FanIn => fan_in,
        VarianceNorm::FanOut => fan_out,
        VarianceNorm::Average => (fan_in + fan_out) / 2.0,
    }
}

fn fill_uniform<T: Element, R: Rng + ?Sized>(
    values: &mut [T],
    min: f64,
    max: f64,
    rng: &mut R,
) -> NetResult<()> {
    if !(min.is_finite() && max.is_finite() && min <= max) {
        return Err(NetError::graph(
            "filler",
            format!("uniform filler needs finite min <= max, got [{min}, {max}]"),
        ));
    }
    if min == max {
        values.fill(cast(min));
        return Ok(());
    }
    let dist = Uniform::new(min, max);
    for v in values.iter_mut() {
        *v = cast(dist.sample(rng));
    }
    Ok(())
}

fn fill_gaussian<T: Element, R: Rng + ?Sized>(
    values: &mut [T],
    mean: f64,
    std: f64,
    rng: &mut R,
) -> NetResult<()> {
    if !(mean.is_finite() && std.is_finite() && std >= 0.0) {
        return Err(NetError::graph(
            "filler",
            format!("gaussian filler needs a finite mean and std >= 0, got mean {mean}, std {std}"),
        ));
    }
    let dist = Normal::new(mean, std).map_err(|err| {
        NetError::graph("filler", format!("invalid gaussian filler (std {std}): {err}"))
    })?;
    for v in values.iter_mut() {
        *v = cast(dist.sample(rng));
    }
    Ok(())
}
