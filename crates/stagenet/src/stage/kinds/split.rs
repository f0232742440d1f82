//! Fan-out duplication: one input, N outputs sharing its values, gradients summed back.

use crate::description::StageSpec;
use crate::error::{ensure_shape, NetResult};
use crate::stage::{Arity, Propagation, Stage};
use crate::tensor::{FloatElement, Shape, Tensor};

pub const KIND: &str = "Split";

pub fn build<T: FloatElement>(_spec: &StageSpec) -> NetResult<Box<dyn Stage<T>>> {
    Ok(Box::new(Split))
}

#[derive(Debug, Default)]
pub struct Split;

impl<T: FloatElement> Stage<T> for Split {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn input_arity(&self) -> Arity {
        Arity::exactly(1)
    }

    fn output_arity(&self) -> Arity {
        Arity::at_least(1)
    }

    fn configure(&mut self, inputs: &[Shape], num_outputs: usize) -> NetResult<Vec<Shape>> {
        Ok(vec![inputs[0].clone(); num_outputs])
    }

    fn value_aliases(&self, num_outputs: usize) -> Vec<(usize, usize)> {
        (0..num_outputs).map(|k| (k, 0)).collect()
    }

    fn forward_host(&mut self, inputs: &[&Tensor<T>], outputs: &[&Tensor<T>]) -> NetResult<()> {
        for out in outputs {
            if !out.shares_values_with(inputs[0]) {
                out.copy_from(inputs[0], false, true)?;
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
        if !propagate.input(0) {
            return Ok(());
        }
        let mut acc = inputs[0].grads_mut()?;
        acc.fill(T::zero());
        for out in outputs {
            let grads = out.grads()?;
            ensure_shape!(
                grads.len() == acc.len(),
                "split output holds {} gradients, input holds {}",
                grads.len(),
                acc.len()
            );
            for (a, &g) in acc.iter_mut().zip(grads.iter()) {
                *a += g;
            }
        }
        Ok(())
    }

    fn backward_device(
        &mut self,
        outputs: &[&Tensor<T>],
        propagate: &Propagation<'_>,
        inputs: &[&Tensor<T>],
    ) -> NetResult<()> {
        if !propagate.input(0) {
            return Ok(());
        }
        let Some(device) = inputs[0].device() else {
            return self.backward_host(outputs, propagate, inputs);
        };
        let count = inputs[0].count();
        let mut acc = inputs[0].device_grads_mut()?;
        device.fill(count, T::zero(), &mut acc)?;
        for out in outputs {
            let grads = out.device_grads()?;
            device.axpy(count, T::one(), &grads, &mut acc)?;
        }
        Ok(())
    }
}
