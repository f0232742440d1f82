//! Data source fed from caller-owned batches.

use serde::{Deserialize, Serialize};

use crate::description::StageSpec;
use crate::error::{ensure_graph, ensure_shape, NetError, NetResult};
use crate::stage::{Arity, Propagation, Stage};
use crate::tensor::{FloatElement, Shape, Tensor};

pub const KIND: &str = "MemoryData";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryDataConfig {
    pub batch_size: usize,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

pub fn build<T: FloatElement>(spec: &StageSpec) -> NetResult<Box<dyn Stage<T>>> {
    let config: MemoryDataConfig = spec.decode_config()?;
    ensure_graph!(config.batch_size > 0, &spec.name, "batch_size must be positive");
    Ok(Box::new(MemoryData::<T>::new(&spec.name, config)))
}

/// Serves `batch_size` items per forward from data supplied through [`reset`](Self::reset),
/// wrapping around at the end.
pub struct MemoryData<T: FloatElement> {
    name: String,
    config: MemoryDataConfig,
    data: Vec<T>,
    labels: Vec<T>,
    len: usize,
    pos: usize,
}

impl<T: FloatElement> MemoryData<T> {
    pub fn new(name: &str, config: MemoryDataConfig) -> Self {
        MemoryData {
            name: name.to_string(),
            config,
            data: Vec::new(),
            labels: Vec::new(),
            len: 0,
            pos: 0,
        }
    }

    fn item_size(&self) -> usize {
        self.config.channels * self.config.height * self.config.width
    }

    pub fn batch_size(&self) -> usize {
        self.config.batch_size
    }

    /// Replaces the served data with `n` items. `n` must be a multiple of the batch size.
    pub fn reset(&mut self, data: Vec<T>, labels: Vec<T>, n: usize) -> NetResult<()> {
        ensure_shape!(
            n > 0 && n % self.config.batch_size == 0,
            "{}: item count {} must be a positive multiple of the batch size {}",
            self.name,
            n,
            self.config.batch_size
        );
        ensure_shape!(
            data.len() == n * self.item_size() && labels.len() == n,
            "{}: expected {} data values and {} labels, got {} and {}",
            self.name,
            n * self.item_size(),
            n,
            data.len(),
            labels.len()
        );
        self.data = data;
        self.labels = labels;
        self.len = n;
        self.pos = 0;
        Ok(())
    }

    /// Index of the next item to be served.
    pub fn position(&self) -> usize {
        self.pos
    }
}

impl<T: FloatElement> Stage<T> for MemoryData<T> {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn input_arity(&self) -> Arity {
        Arity::exactly(0)
    }

    fn output_arity(&self) -> Arity {
        Arity::exactly(2)
    }

    fn configure(&mut self, _inputs: &[Shape], _num_outputs: usize) -> NetResult<Vec<Shape>> {
        let c = &self.config;
        Ok(vec![
            Shape::new([c.batch_size, c.channels, c.height, c.width])?,
            Shape::new([c.batch_size])?,
        ])
    }

    fn forward_host(&mut self, _inputs: &[&Tensor<T>], outputs: &[&Tensor<T>]) -> NetResult<()> {
        if self.len == 0 {
            return Err(NetError::graph(
                &self.name,
                "memory data source needs reset() before the first forward",
            ));
        }
        let batch = self.config.batch_size;
        let item = self.item_size();
        let start = self.pos;
        outputs[0].set_values(&self.data[start * item..(start + batch) * item])?;
        outputs[1].set_values(&self.labels[start..start + batch])?;
        self.pos = (self.pos + batch) % self.len;
        Ok(())
    }

    fn backward_host(
        &mut self,
        _outputs: &[&Tensor<T>],
        _propagate: &Propagation<'_>,
        _inputs: &[&Tensor<T>],
    ) -> NetResult<()> {
        Ok(())
    }
}
