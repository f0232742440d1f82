//! Joins inputs along one axis.

use serde::{Deserialize, Serialize};

use crate::description::StageSpec;
use crate::error::{ensure_shape, NetResult};
use crate::stage::{Arity, Propagation, Stage};
use crate::tensor::{FloatElement, Shape, Tensor};

pub const KIND: &str = "Concat";

fn default_axis() -> i64 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcatConfig {
    /// Axis to join along; negative values count from the last axis.
    #[serde(default = "default_axis")]
    pub axis: i64,
}

impl Default for ConcatConfig {
    fn default() -> Self {
        ConcatConfig {
            axis: default_axis(),
        }
    }
}

pub fn build<T: FloatElement>(spec: &StageSpec) -> NetResult<Box<dyn Stage<T>>> {
    let config: ConcatConfig = spec.decode_config()?;
    Ok(Box::new(Concat::new(config)))
}

#[derive(Debug)]
pub struct Concat {
    config: ConcatConfig,
    /// Product of the axes before the join axis.
    outer: usize,
    /// Product of the axes after the join axis.
    inner: usize,
    /// Join-axis extent of each input.
    extents: Vec<usize>,
}

impl Concat {
    pub fn new(config: ConcatConfig) -> Self {
        Concat {
            config,
            outer: 0,
            inner: 0,
            extents: Vec::new(),
        }
    }

    /// Output offset (along the join axis) and extent for each input.
    fn segments(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.extents.iter().scan(0usize, |offset, &extent| {
            let start = *offset;
            *offset += extent;
            Some((start, extent))
        })
    }

    fn total(&self) -> usize {
        self.extents.iter().sum()
    }
}

impl<T: FloatElement> Stage<T> for Concat {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn input_arity(&self) -> Arity {
        Arity::at_least(1)
    }

    fn output_arity(&self) -> Arity {
        Arity::exactly(1)
    }

    fn configure(&mut self, inputs: &[Shape], _num_outputs: usize) -> NetResult<Vec<Shape>> {
        let first = &inputs[0];
        let axis = first.canonical_axis(self.config.axis)?;
        self.extents.clear();
        for (i, shape) in inputs.iter().enumerate() {
            ensure_shape!(
                shape.rank() == first.rank(),
                "concat input {} has rank {}, expected {}",
                i,
                shape.rank(),
                first.rank()
            );
            for a in (0..first.rank()).filter(|&a| a != axis) {
                ensure_shape!(
                    shape.dims()[a] == first.dims()[a],
                    "concat input {} differs on axis {}: {:?} vs {:?}",
                    i,
                    a,
                    shape,
                    first
                );
            }
            self.extents.push(shape.dims()[axis]);
        }
        self.outer = first.count_range(0, axis)?;
        self.inner = first.count_from(axis + 1)?;
        Ok(vec![first.with_dim(axis, self.total())?])
    }

    fn forward_host(&mut self, inputs: &[&Tensor<T>], outputs: &[&Tensor<T>]) -> NetResult<()> {
        let mut y = outputs[0].values_mut()?;
        let row = self.total() * self.inner;
        for ((start, extent), input) in self.segments().zip(inputs) {
            let x = input.values()?;
            let chunk = extent * self.inner;
            for n in 0..self.outer {
                let dst = n * row + start * self.inner;
                y[dst..dst + chunk].copy_from_slice(&x[n * chunk..(n + 1) * chunk]);
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
        let dy = outputs[0].grads()?;
        let row = self.total() * self.inner;
        for (i, ((start, extent), input)) in self.segments().zip(inputs).enumerate() {
            if !propagate.input(i) {
                continue;
            }
            let mut dx = input.grads_mut()?;
            let chunk = extent * self.inner;
            for n in 0..self.outer {
                let src = n * row + start * self.inner;
                dx[n * chunk..(n + 1) * chunk].copy_from_slice(&dy[src..src + chunk]);
            }
        }
        Ok(())
    }
}
