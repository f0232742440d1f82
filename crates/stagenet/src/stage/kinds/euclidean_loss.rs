//! Half mean squared distance between two inputs.

use crate::description::StageSpec;
use crate::error::{ensure_shape, NetResult};
use crate::stage::{Arity, Propagation, Stage};
use crate::tensor::{cast, FloatElement, Shape, Tensor};

pub const KIND: &str = "EuclideanLoss";

pub fn build<T: FloatElement>(_spec: &StageSpec) -> NetResult<Box<dyn Stage<T>>> {
    Ok(Box::new(EuclideanLoss::<T>::default()))
}

/// `sum((a - b)^2) / (2 * num)` where `num` is the leading dimension.
#[derive(Debug, Default)]
pub struct EuclideanLoss<T: FloatElement> {
    diff: Vec<T>,
    num: usize,
}

impl<T: FloatElement> Stage<T> for EuclideanLoss<T> {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn input_arity(&self) -> Arity {
        Arity::exactly(2)
    }

    fn output_arity(&self) -> Arity {
        Arity::exactly(1)
    }

    fn is_loss(&self) -> bool {
        true
    }

    fn configure(&mut self, inputs: &[Shape], _num_outputs: usize) -> NetResult<Vec<Shape>> {
        let (a, b) = (&inputs[0], &inputs[1]);
        ensure_shape!(
            a.num_elements() == b.num_elements(),
            "euclidean loss inputs differ in size: {:?} vs {:?}",
            a,
            b
        );
        ensure_shape!(a.rank() > 0, "euclidean loss needs a batch axis");
        self.num = a.dims()[0];
        self.diff.resize(a.num_elements(), T::zero());
        Ok(vec![Shape::scalar()])
    }

    fn forward_host(&mut self, inputs: &[&Tensor<T>], outputs: &[&Tensor<T>]) -> NetResult<()> {
        let a = inputs[0].values()?;
        let b = inputs[1].values()?;
        let mut sum = T::zero();
        for ((d, &a), &b) in self.diff.iter_mut().zip(a.iter()).zip(b.iter()) {
            *d = a - b;
            sum += *d * *d;
        }
        let denom: T = cast(2.0 * self.num.max(1) as f64);
        outputs[0].values_mut()?[0] = sum / denom;
        Ok(())
    }

    fn backward_host(
        &mut self,
        outputs: &[&Tensor<T>],
        propagate: &Propagation<'_>,
        inputs: &[&Tensor<T>],
    ) -> NetResult<()> {
        let top = outputs[0].grads()?[0];
        let num: T = cast(self.num.max(1) as f64);
        for (i, input) in inputs.iter().enumerate() {
            if !propagate.input(i) {
                continue;
            }
            let sign = if i == 0 { T::one() } else { -T::one() };
            let alpha = sign * top / num;
            let mut dx = input.grads_mut()?;
            for (dx, &d) in dx.iter_mut().zip(&self.diff) {
                *dx = alpha * d;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loss_and_gradients() {
        let a = Tensor::<f64>::with_shape(&[2, 2], None).unwrap();
        let b = Tensor::<f64>::with_shape(&[2, 2], None).unwrap();
        a.set_values(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        b.set_values(&[0.0, 2.0, 1.0, 4.0]).unwrap();
        let mut loss = EuclideanLoss::<f64>::default();
        let shapes = loss.configure(&[a.shape(), b.shape()], 1).unwrap();
        assert_eq!(shapes[0].num_elements(), 1);
        let out = Tensor::<f64>::new(None);
        out.reshape_to(&shapes[0]).unwrap();
        loss.forward_host(&[&a, &b], &[&out]).unwrap();
        // (1 + 0 + 4 + 0) / (2 * 2)
        assert_eq!(out.values().unwrap()[0], 1.25);

        out.grads_mut().unwrap()[0] = 2.0;
        loss.backward_host(&[&out], &Propagation::new(&[true, true], &[]), &[&a, &b])
            .unwrap();
        assert_eq!(&*a.grads().unwrap(), &[1.0, 0.0, 2.0, 0.0]);
        assert_eq!(&*b.grads().unwrap(), &[-1.0, 0.0, -2.0, 0.0]);
    }
}
