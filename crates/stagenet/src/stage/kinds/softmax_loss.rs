//! Softmax over one axis followed by the negative log-likelihood of integer labels.

use serde::{Deserialize, Serialize};

use crate::description::StageSpec;
use crate::error::{ensure_graph, ensure_shape, NetResult};
use crate::stage::{Arity, Propagation, Stage};
use crate::tensor::{cast, FloatElement, Shape, Tensor};

pub const KIND: &str = "SoftmaxWithLoss";

fn default_axis() -> i64 {
    1
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoftmaxLossConfig {
    /// Axis holding the class scores.
    #[serde(default = "default_axis")]
    pub axis: i64,
    /// Label value that contributes neither loss nor gradient.
    #[serde(default)]
    pub ignore_label: Option<i64>,
    /// Divide by the number of counted labels instead of the outer batch size.
    #[serde(default = "default_true")]
    pub normalize: bool,
}

impl Default for SoftmaxLossConfig {
    fn default() -> Self {
        SoftmaxLossConfig {
            axis: default_axis(),
            ignore_label: None,
            normalize: true,
        }
    }
}

pub fn build<T: FloatElement>(spec: &StageSpec) -> NetResult<Box<dyn Stage<T>>> {
    let config: SoftmaxLossConfig = spec.decode_config()?;
    Ok(Box::new(SoftmaxWithLoss::new(&spec.name, config)))
}

pub struct SoftmaxWithLoss<T: FloatElement> {
    name: String,
    config: SoftmaxLossConfig,
    outer: usize,
    classes: usize,
    inner: usize,
    prob: Vec<T>,
    normalizer: T,
}

impl<T: FloatElement> SoftmaxWithLoss<T> {
    pub fn new(name: &str, config: SoftmaxLossConfig) -> Self {
        SoftmaxWithLoss {
            name: name.to_string(),
            config,
            outer: 0,
            classes: 0,
            inner: 0,
            prob: Vec::new(),
            normalizer: T::one(),
        }
    }

    fn index(&self, n: usize, c: usize, j: usize) -> usize {
        (n * self.classes + c) * self.inner + j
    }

    /// Label at `(n, j)` as a class index, or `None` when ignored.
    fn label_at(&self, labels: &[T], n: usize, j: usize) -> NetResult<Option<usize>> {
        let raw = labels[n * self.inner + j];
        let Some(label) = raw.to_i64() else {
            return Err(crate::error::NetError::shape(format!(
                "label {:?} is not an integer class",
                raw
            )));
        };
        if self.config.ignore_label == Some(label) {
            return Ok(None);
        }
        ensure_shape!(
            label >= 0 && (label as usize) < self.classes,
            "label {} is outside 0..{}",
            label,
            self.classes
        );
        Ok(Some(label as usize))
    }

    fn softmax(&mut self, scores: &[T]) {
        for n in 0..self.outer {
            for j in 0..self.inner {
                let max = (0..self.classes)
                    .map(|c| scores[self.index(n, c, j)])
                    .fold(T::neg_infinity(), T::max);
                let mut sum = T::zero();
                for c in 0..self.classes {
                    let i = self.index(n, c, j);
                    let e = (scores[i] - max).exp();
                    self.prob[i] = e;
                    sum += e;
                }
                for c in 0..self.classes {
                    let i = self.index(n, c, j);
                    self.prob[i] = self.prob[i] / sum;
                }
            }
        }
    }
}

impl<T: FloatElement> Stage<T> for SoftmaxWithLoss<T> {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn input_arity(&self) -> Arity {
        Arity::exactly(2)
    }

    /// Loss, and optionally the class probabilities.
    fn output_arity(&self) -> Arity {
        Arity::between(1, 2)
    }

    fn is_loss(&self) -> bool {
        true
    }

    fn allow_force_backward(&self, index: usize) -> bool {
        index != 1
    }

    fn configure(&mut self, inputs: &[Shape], num_outputs: usize) -> NetResult<Vec<Shape>> {
        let (scores, labels) = (&inputs[0], &inputs[1]);
        let axis = scores.canonical_axis(self.config.axis)?;
        self.outer = scores.count_range(0, axis)?;
        self.classes = scores.dims()[axis];
        self.inner = scores.count_from(axis + 1)?;
        ensure_shape!(
            labels.num_elements() == self.outer * self.inner,
            "expected {} labels for scores {:?}, got {:?}",
            self.outer * self.inner,
            scores,
            labels
        );
        self.prob.resize(scores.num_elements(), T::zero());
        let mut shapes = vec![Shape::scalar()];
        if num_outputs > 1 {
            shapes.push(scores.clone());
        }
        Ok(shapes)
    }

    fn forward_host(&mut self, inputs: &[&Tensor<T>], outputs: &[&Tensor<T>]) -> NetResult<()> {
        {
            let scores = inputs[0].values()?;
            self.softmax(&scores);
        }
        let labels = inputs[1].values()?;
        let mut loss = T::zero();
        let mut counted = 0usize;
        let floor: T = T::min_positive_value();
        for n in 0..self.outer {
            for j in 0..self.inner {
                if let Some(label) = self.label_at(&labels, n, j)? {
                    loss -= self.prob[self.index(n, label, j)].max(floor).ln();
                    counted += 1;
                }
            }
        }
        let normalizer = if self.config.normalize {
            counted
        } else {
            self.outer
        };
        self.normalizer = cast(normalizer.max(1) as f64);
        outputs[0].values_mut()?[0] = loss / self.normalizer;
        if let Some(prob_out) = outputs.get(1) {
            prob_out.values_mut()?.copy_from_slice(&self.prob);
        }
        Ok(())
    }

    fn backward_host(
        &mut self,
        outputs: &[&Tensor<T>],
        propagate: &Propagation<'_>,
        inputs: &[&Tensor<T>],
    ) -> NetResult<()> {
        ensure_graph!(
            !propagate.input(1),
            self.name.as_str(),
            "cannot backpropagate to label inputs"
        );
        if !propagate.input(0) {
            return Ok(());
        }
        let scale = outputs[0].grads()?[0] / self.normalizer;
        let labels = inputs[1].values()?;
        let mut dx = inputs[0].grads_mut()?;
        for n in 0..self.outer {
            for j in 0..self.inner {
                let label = self.label_at(&labels, n, j)?;
                for c in 0..self.classes {
                    let i = self.index(n, c, j);
                    dx[i] = match label {
                        None => T::zero(),
                        Some(l) if l == c => (self.prob[i] - T::one()) * scale,
                        Some(_) => self.prob[i] * scale,
                    };
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NetError;

    fn setup(
        config: SoftmaxLossConfig,
        scores: &[f64],
        labels: &[f64],
    ) -> (SoftmaxWithLoss<f64>, Tensor<f64>, Tensor<f64>, Tensor<f64>) {
        let classes = scores.len() / labels.len();
        let x = Tensor::<f64>::with_shape(&[labels.len(), classes], None).unwrap();
        x.set_values(scores).unwrap();
        let l = Tensor::<f64>::with_shape(&[labels.len()], None).unwrap();
        l.set_values(labels).unwrap();
        let mut stage = SoftmaxWithLoss::new("loss", config);
        let shapes = stage.configure(&[x.shape(), l.shape()], 1).unwrap();
        let out = Tensor::<f64>::new(None);
        out.reshape_to(&shapes[0]).unwrap();
        (stage, x, l, out)
    }

    #[test]
    fn uniform_scores_give_log_classes() {
        let (mut stage, x, l, out) = setup(
            SoftmaxLossConfig::default(),
            &[0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            &[0.0, 2.0],
        );
        stage.forward_host(&[&x, &l], &[&out]).unwrap();
        assert!((out.values().unwrap()[0] - 3f64.ln()).abs() < 1e-12);

        out.grads_mut().unwrap()[0] = 1.0;
        stage
            .backward_host(&[&out], &Propagation::new(&[true, false], &[]), &[&x, &l])
            .unwrap();
        let dx = x.grads().unwrap();
        let third = 1.0 / 3.0;
        let expected = [third - 1.0, third, third, third, third, third - 1.0];
        for (got, want) in dx.iter().zip(expected) {
            assert!((got - want / 2.0).abs() < 1e-12);
        }
    }

    #[test]
    fn ignored_labels_do_not_count() {
        let config = SoftmaxLossConfig {
            ignore_label: Some(-1),
            ..SoftmaxLossConfig::default()
        };
        let (mut stage, x, l, out) = setup(config, &[0.0, 0.0, 5.0, -5.0], &[0.0, -1.0]);
        stage.forward_host(&[&x, &l], &[&out]).unwrap();
        assert!((out.values().unwrap()[0] - 2f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn rejects_out_of_range_labels_and_label_gradients() {
        let (mut stage, x, l, out) = setup(SoftmaxLossConfig::default(), &[0.0; 4], &[0.0, 2.0]);
        let err = stage.forward_host(&[&x, &l], &[&out]).unwrap_err();
        assert!(matches!(err, NetError::Shape(_)));

        l.set_values(&[0.0, 1.0]).unwrap();
        stage.forward_host(&[&x, &l], &[&out]).unwrap();
        let err = stage
            .backward_host(&[&out], &Propagation::new(&[true, true], &[]), &[&x, &l])
            .unwrap_err();
        assert!(matches!(err, NetError::Graph { .. }));
        assert!(!stage.allow_force_backward(1));
    }

    #[test]
    fn non_finite_labels_are_not_classes() {
        let (mut stage, x, l, out) = setup(SoftmaxLossConfig::default(), &[0.0; 4], &[0.0, 1.0]);
        for bad in [f64::NAN, f64::INFINITY] {
            l.set_values(&[0.0, bad]).unwrap();
            let err = stage.forward_host(&[&x, &l], &[&out]).unwrap_err();
            assert!(matches!(err, NetError::Shape(_)), "{bad}");
        }
    }
}
