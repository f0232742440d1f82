//! Mean/variance normalization over each item (or each channel of each item).

use serde::{Deserialize, Serialize};

use crate::description::StageSpec;
use crate::error::{ensure_shape, NetResult};
use crate::stage::{Arity, Propagation, Stage};
use crate::tensor::{cast, FloatElement, Shape, Tensor};

pub const KIND: &str = "MVN";

fn default_true() -> bool {
    true
}

fn default_eps() -> f64 {
    1e-10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MvnConfig {
    #[serde(default = "default_true")]
    pub normalize_variance: bool,
    /// Normalize each item as a whole instead of each of its channels.
    #[serde(default)]
    pub across_channels: bool,
    #[serde(default = "default_eps")]
    pub eps: f64,
}

impl Default for MvnConfig {
    fn default() -> Self {
        MvnConfig {
            normalize_variance: true,
            across_channels: false,
            eps: default_eps(),
        }
    }
}

pub fn build<T: FloatElement>(spec: &StageSpec) -> NetResult<Box<dyn Stage<T>>> {
    let config: MvnConfig = spec.decode_config()?;
    Ok(Box::new(Mvn::<T>::new(config)))
}

pub struct Mvn<T: FloatElement> {
    config: MvnConfig,
    rows: usize,
    row_len: usize,
    /// `std + eps` per row from the last forward pass.
    scale: Vec<T>,
}

impl<T: FloatElement> Mvn<T> {
    pub fn new(config: MvnConfig) -> Self {
        Mvn {
            config,
            rows: 0,
            row_len: 0,
            scale: Vec::new(),
        }
    }
}

fn mean<T: FloatElement>(row: &[T]) -> T {
    let n: T = cast(row.len() as f64);
    row.iter().fold(T::zero(), |s, &v| s + v) / n
}

impl<T: FloatElement> Stage<T> for Mvn<T> {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn input_arity(&self) -> Arity {
        Arity::exactly(1)
    }

    fn output_arity(&self) -> Arity {
        Arity::exactly(1)
    }

    fn configure(&mut self, inputs: &[Shape], _num_outputs: usize) -> NetResult<Vec<Shape>> {
        let input = &inputs[0];
        ensure_shape!(
            input.rank() >= 2,
            "MVN input needs at least num and channel axes, got {:?}",
            input
        );
        let count = input.num_elements();
        self.rows = if self.config.across_channels {
            input.dims()[0]
        } else {
            input.count_range(0, 2)?
        };
        self.row_len = if self.rows == 0 { 0 } else { count / self.rows };
        self.scale = vec![T::one(); self.rows];
        Ok(vec![input.clone()])
    }

    fn forward_host(&mut self, inputs: &[&Tensor<T>], outputs: &[&Tensor<T>]) -> NetResult<()> {
        if self.row_len == 0 {
            return Ok(());
        }
        let x = inputs[0].values()?;
        let mut y = outputs[0].values_mut()?;
        let eps: T = cast(self.config.eps);
        for ((x_row, y_row), scale) in x
            .chunks_exact(self.row_len)
            .zip(y.chunks_exact_mut(self.row_len))
            .zip(self.scale.iter_mut())
        {
            let mu = mean(x_row);
            for (y, &x) in y_row.iter_mut().zip(x_row) {
                *y = x - mu;
            }
            if self.config.normalize_variance {
                let sq: Vec<T> = x_row.iter().map(|&v| v * v).collect();
                let variance = (mean(&sq) - mu * mu).max(T::zero());
                *scale = variance.sqrt() + eps;
                for y in y_row.iter_mut() {
                    *y = *y / *scale;
                }
            }
        }
        Ok(())
    }

    fn backward_host(
        &mut self,
        outputs: &[&Tensor<T>],
        propagate: &Propagation<'_>,
        inputs: &[&Tensor<T>],
    ) -> NetResult<()> {
        if !propagate.input(0) || self.row_len == 0 {
            return Ok(());
        }
        let y = outputs[0].values()?;
        let dy = outputs[0].grads()?;
        let mut dx = inputs[0].grads_mut()?;
        let n = self.row_len;
        for (((y_row, dy_row), dx_row), &scale) in y
            .chunks_exact(n)
            .zip(dy.chunks_exact(n))
            .zip(dx.chunks_exact_mut(n))
            .zip(&self.scale)
        {
            let mean_dy = mean(dy_row);
            if self.config.normalize_variance {
                let ydy: Vec<T> = y_row.iter().zip(dy_row).map(|(&a, &b)| a * b).collect();
                let mean_ydy = mean(&ydy);
                for ((dx, &dy), &y) in dx_row.iter_mut().zip(dy_row).zip(y_row) {
                    *dx = (dy - mean_dy - y * mean_ydy) / scale;
                }
            } else {
                for (dx, &dy) in dx_row.iter_mut().zip(dy_row) {
                    *dx = dy - mean_dy;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(config: MvnConfig, values: &[f64], dims: &[usize]) -> (Mvn<f64>, Tensor<f64>, Tensor<f64>) {
        let mut mvn = Mvn::<f64>::new(config);
        let x = Tensor::<f64>::with_shape(dims, None).unwrap();
        x.set_values(values).unwrap();
        let shapes = mvn.configure(&[x.shape()], 1).unwrap();
        let y = Tensor::<f64>::new(None);
        y.reshape_to(&shapes[0]).unwrap();
        mvn.forward_host(&[&x], &[&y]).unwrap();
        (mvn, x, y)
    }

    #[test]
    fn rows_have_zero_mean_unit_variance() {
        let values = [1.0, 2.0, 3.0, 4.0, 10.0, 20.0, 30.0, 40.0];
        let (_, _, y) = run(MvnConfig::default(), &values, &[1, 2, 2, 2]);
        let y = y.values().unwrap();
        for row in y.chunks(4) {
            let m: f64 = row.iter().sum::<f64>() / 4.0;
            let v: f64 = row.iter().map(|v| v * v).sum::<f64>() / 4.0;
            assert!(m.abs() < 1e-9);
            assert!((v - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn gradient_matches_finite_differences() {
        let values = [0.3, -1.2, 2.5, 0.7, 1.1, -0.4];
        let weights = [0.5, -1.0, 2.0, 0.25, 1.5, -0.75];
        let (mut mvn, x, y) = run(
            MvnConfig {
                across_channels: true,
                ..MvnConfig::default()
            },
            &values,
            &[1, 2, 3],
        );
        y.grads_mut().unwrap().copy_from_slice(&weights);
        mvn.backward_host(&[&y], &Propagation::new(&[true], &[]), &[&x])
            .unwrap();
        let analytic = x.grads().unwrap().to_vec();

        let objective = |vals: &[f64]| {
            let (_, _, y) = run(
                MvnConfig {
                    across_channels: true,
                    ..MvnConfig::default()
                },
                vals,
                &[1, 2, 3],
            );
            let out = y.values().unwrap().to_vec();
            out.iter().zip(&weights).map(|(a, b)| a * b).sum::<f64>()
        };
        let h = 1e-6;
        for i in 0..values.len() {
            let mut plus = values.to_vec();
            plus[i] += h;
            let mut minus = values.to_vec();
            minus[i] -= h;
            let numeric = (objective(&plus) - objective(&minus)) / (2.0 * h);
            assert!((numeric - analytic[i]).abs() < 1e-5, "{i}: {numeric} vs {}", analytic[i]);
        }
    }
}
