//! Rectified linear unit with an optional leak, computable in place.

use serde::{Deserialize, Serialize};

use crate::description::StageSpec;
use crate::error::NetResult;
use crate::stage::{Arity, Propagation, Stage};
use crate::tensor::{cast, FloatElement, Shape, Tensor};

pub const KIND: &str = "ReLU";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReluConfig {
    /// Slope applied to negative inputs; zero gives the plain rectifier.
    pub negative_slope: f64,
}

pub fn build<T: FloatElement>(spec: &StageSpec) -> NetResult<Box<dyn Stage<T>>> {
    let config: ReluConfig = spec.decode_config()?;
    Ok(Box::new(Relu {
        slope: cast(config.negative_slope),
    }))
}

pub struct Relu<T: FloatElement> {
    slope: T,
}

impl<T: FloatElement> Relu<T> {
    fn activate(&self, x: T) -> T {
        if x > T::zero() {
            x
        } else {
            self.slope * x
        }
    }

    /// Derivative evaluated from either the input or (in place) the output; both have the
    /// same sign for a non-negative slope.
    fn derivative(&self, v: T) -> T {
        if v > T::zero() {
            T::one()
        } else {
            self.slope
        }
    }
}

impl<T: FloatElement> Stage<T> for Relu<T> {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn input_arity(&self) -> Arity {
        Arity::exactly(1)
    }

    fn output_arity(&self) -> Arity {
        Arity::exactly(1)
    }

    fn supports_in_place(&self) -> bool {
        true
    }

    fn configure(&mut self, inputs: &[Shape], _num_outputs: usize) -> NetResult<Vec<Shape>> {
        Ok(vec![inputs[0].clone()])
    }

    fn forward_host(&mut self, inputs: &[&Tensor<T>], outputs: &[&Tensor<T>]) -> NetResult<()> {
        let (input, output) = (inputs[0], outputs[0]);
        if output.shares_values_with(input) {
            for v in output.values_mut()?.iter_mut() {
                *v = self.activate(*v);
            }
            return Ok(());
        }
        let x = input.values()?;
        let mut y = output.values_mut()?;
        for (y, &x) in y.iter_mut().zip(x.iter()) {
            *y = self.activate(x);
        }
        Ok(())
    }

    fn backward_host(
        &mut self,
        outputs: &[&Tensor<T>],
        propagate: &Propagation<'_>,
        inputs: &[&Tensor<T>],
    ) -> NetResult<()> {
        if !propagate.input(0) {
            return Ok(());
        }
        let (input, output) = (inputs[0], outputs[0]);
        let x = input.values()?;
        if input.shares_grads_with(output) {
            let mut g = input.grads_mut()?;
            for (g, &x) in g.iter_mut().zip(x.iter()) {
                *g *= self.derivative(x);
            }
            return Ok(());
        }
        let dy = output.grads()?;
        let mut dx = input.grads_mut()?;
        for ((dx, &dy), &x) in dx.iter_mut().zip(dy.iter()).zip(x.iter()) {
            *dx = dy * self.derivative(x);
        }
        Ok(())
    }
}
