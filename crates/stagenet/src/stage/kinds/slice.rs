//! Cuts one input into consecutive pieces along an axis.

use serde::{Deserialize, Serialize};

use crate::description::StageSpec;
use crate::error::{ensure_shape, NetResult};
use crate::stage::{Arity, Propagation, Stage};
use crate::tensor::{FloatElement, Shape, Tensor};

pub const KIND: &str = "Slice";

fn default_axis() -> i64 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SliceConfig {
    #[serde(default = "default_axis")]
    pub axis: i64,
    /// Boundaries between consecutive pieces. Empty means equal pieces.
    #[serde(default)]
    pub slice_point: Vec<usize>,
}

impl Default for SliceConfig {
    fn default() -> Self {
        SliceConfig {
            axis: default_axis(),
            slice_point: Vec::new(),
        }
    }
}

pub fn build<T: FloatElement>(spec: &StageSpec) -> NetResult<Box<dyn Stage<T>>> {
    let config: SliceConfig = spec.decode_config()?;
    Ok(Box::new(Slice::new(config)))
}

#[derive(Debug)]
pub struct Slice {
    config: SliceConfig,
    outer: usize,
    inner: usize,
    axis_len: usize,
    extents: Vec<usize>,
}

impl Slice {
    pub fn new(config: SliceConfig) -> Self {
        Slice {
            config,
            outer: 0,
            inner: 0,
            axis_len: 0,
            extents: Vec::new(),
        }
    }

    fn piece_extents(&self, axis_len: usize, num_outputs: usize) -> NetResult<Vec<usize>> {
        let points = &self.config.slice_point;
        if points.is_empty() {
            ensure_shape!(
                num_outputs > 0 && axis_len % num_outputs == 0,
                "axis of length {} cannot be sliced into {} equal pieces",
                axis_len,
                num_outputs
            );
            return Ok(vec![axis_len / num_outputs; num_outputs]);
        }
        ensure_shape!(
            points.len() + 1 == num_outputs,
            "{} slice points given for {} outputs",
            points.len(),
            num_outputs
        );
        let mut extents = Vec::with_capacity(num_outputs);
        let mut prev = 0usize;
        for &point in points {
            ensure_shape!(
                point > prev,
                "slice points must be strictly increasing and positive: {:?}",
                points
            );
            ensure_shape!(
                point < axis_len,
                "slice point {} is beyond the axis length {}",
                point,
                axis_len
            );
            extents.push(point - prev);
            prev = point;
        }
        extents.push(axis_len - prev);
        Ok(extents)
    }

    fn segments(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.extents.iter().scan(0usize, |offset, &extent| {
            let start = *offset;
            *offset += extent;
            Some((start, extent))
        })
    }
}

impl<T: FloatElement> Stage<T> for Slice {
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
        let input = &inputs[0];
        let axis = input.canonical_axis(self.config.axis)?;
        self.axis_len = input.dims()[axis];
        self.extents = self.piece_extents(self.axis_len, num_outputs)?;
        self.outer = input.count_range(0, axis)?;
        self.inner = input.count_from(axis + 1)?;
        self.extents
            .iter()
            .map(|&extent| input.with_dim(axis, extent))
            .collect()
    }

    fn forward_host(&mut self, inputs: &[&Tensor<T>], outputs: &[&Tensor<T>]) -> NetResult<()> {
        let x = inputs[0].values()?;
        let row = self.axis_len * self.inner;
        for ((start, extent), output) in self.segments().zip(outputs) {
            let mut y = output.values_mut()?;
            let chunk = extent * self.inner;
            for n in 0..self.outer {
                let src = n * row + start * self.inner;
                y[n * chunk..(n + 1) * chunk].copy_from_slice(&x[src..src + chunk]);
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
        let mut dx = inputs[0].grads_mut()?;
        let row = self.axis_len * self.inner;
        for ((start, extent), output) in self.segments().zip(outputs) {
            let dy = output.grads()?;
            let chunk = extent * self.inner;
            for n in 0..self.outer {
                let dst = n * row + start * self.inner;
                dx[dst..dst + chunk].copy_from_slice(&dy[n * chunk..(n + 1) * chunk]);
            }
        }
        Ok(())
    }
}
