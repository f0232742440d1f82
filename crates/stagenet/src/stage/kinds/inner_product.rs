//! Fully connected stage: `y = x * W^T + b` over the axes from `axis` on.

use serde::{Deserialize, Serialize};

use crate::description::StageSpec;
use crate::error::{ensure_graph, ensure_shape, NetResult};
use crate::filler::FillerSpec;
use crate::stage::math::gemm;
use crate::stage::{Arity, Propagation, SetupContext, Stage};
use crate::tensor::{FloatElement, Shape, Tensor};

pub const KIND: &str = "InnerProduct";

fn default_true() -> bool {
    true
}

fn default_axis() -> i64 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InnerProductConfig {
    pub num_output: usize,
    #[serde(default = "default_true")]
    pub bias_term: bool,
    #[serde(default)]
    pub weight_filler: FillerSpec,
    #[serde(default)]
    pub bias_filler: FillerSpec,
    /// First axis folded into the feature dimension; leading axes form the batch.
    #[serde(default = "default_axis")]
    pub axis: i64,
    /// Store the weight as `K x N` instead of `N x K`.
    #[serde(default)]
    pub transpose: bool,
}

pub fn build<T: FloatElement>(spec: &StageSpec) -> NetResult<Box<dyn Stage<T>>> {
    let config: InnerProductConfig = spec.decode_config()?;
    ensure_graph!(config.num_output > 0, &spec.name, "num_output must be positive");
    Ok(Box::new(InnerProduct {
        name: spec.name.clone(),
        config,
        params: Vec::new(),
        batch: 0,
        features: 0,
    }))
}

pub struct InnerProduct<T: FloatElement> {
    name: String,
    config: InnerProductConfig,
    params: Vec<Tensor<T>>,
    /// Rows of the flattened input (`M`).
    batch: usize,
    /// Columns of the flattened input (`K`).
    features: usize,
}

impl<T: FloatElement> InnerProduct<T> {
    fn outputs(&self) -> usize {
        self.config.num_output
    }
}

impl<T: FloatElement> Stage<T> for InnerProduct<T> {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn input_arity(&self) -> Arity {
        Arity::exactly(1)
    }

    fn output_arity(&self) -> Arity {
        Arity::exactly(1)
    }

    fn setup(&mut self, inputs: &[Shape], ctx: &mut SetupContext<'_, T>) -> NetResult<()> {
        let axis = inputs[0].canonical_axis(self.config.axis)?;
        let k = inputs[0].count_from(axis)?;
        let n = self.outputs();
        let weight_dims = if self.config.transpose { [k, n] } else { [n, k] };
        let weight = ctx.param(&weight_dims, &self.config.weight_filler)?;
        self.params = vec![weight];
        if self.config.bias_term {
            let bias = ctx.param(&[n], &self.config.bias_filler)?;
            self.params.push(bias);
        }
        self.features = k;
        Ok(())
    }

    fn configure(&mut self, inputs: &[Shape], _num_outputs: usize) -> NetResult<Vec<Shape>> {
        let input = &inputs[0];
        let axis = input.canonical_axis(self.config.axis)?;
        let k = input.count_from(axis)?;
        ensure_shape!(
            k == self.features,
            "{}: input has {} features per item but the weight expects {}",
            self.name,
            k,
            self.features
        );
        self.batch = input.count_range(0, axis)?;
        let mut dims = input.dims()[..axis].to_vec();
        dims.push(self.outputs());
        Ok(vec![Shape::new(dims)?])
    }

    fn forward_host(&mut self, inputs: &[&Tensor<T>], outputs: &[&Tensor<T>]) -> NetResult<()> {
        let (m, n, k) = (self.batch, self.outputs(), self.features);
        let x = inputs[0].values()?;
        let w = self.params[0].values()?;
        let mut y = outputs[0].values_mut()?;
        gemm(false, !self.config.transpose, m, n, k, T::one(), &x, &w, T::zero(), &mut y);
        if let Some(bias) = self.params.get(1) {
            let b = bias.values()?;
            for row in y.chunks_exact_mut(n) {
                for (out, &bv) in row.iter_mut().zip(b.iter()) {
                    *out += bv;
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
        let (m, n, k) = (self.batch, self.outputs(), self.features);
        let dy = outputs[0].grads()?;
        if propagate.param(0) {
            let x = inputs[0].values()?;
            let mut dw = self.params[0].grads_mut()?;
            if self.config.transpose {
                // dW (K x N) += x^T * dy
                gemm(true, false, k, n, m, T::one(), &x, &dy, T::one(), &mut dw);
            } else {
                // dW (N x K) += dy^T * x
                gemm(true, false, n, k, m, T::one(), &dy, &x, T::one(), &mut dw);
            }
        }
        if self.params.len() > 1 && propagate.param(1) {
            let mut db = self.params[1].grads_mut()?;
            for row in dy.chunks_exact(n) {
                for (acc, &g) in db.iter_mut().zip(row) {
                    *acc += g;
                }
            }
        }
        if propagate.input(0) {
            let w = self.params[0].values()?;
            let mut dx = inputs[0].grads_mut()?;
            gemm(false, self.config.transpose, m, k, n, T::one(), &dy, &w, T::zero(), &mut dx);
        }
        Ok(())
    }

    fn params(&self) -> &[Tensor<T>] {
        &self.params
    }

    fn params_mut(&mut self) -> &mut [Tensor<T>] {
        &mut self.params
    }
}
