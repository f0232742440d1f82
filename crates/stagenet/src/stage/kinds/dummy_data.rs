//! Data source that produces filler-generated tensors.

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::description::StageSpec;
use crate::error::{ensure_graph, NetResult};
use crate::filler::FillerSpec;
use crate::stage::{Arity, Propagation, SetupContext, Stage};
use crate::tensor::{FloatElement, Shape, Tensor};

pub const KIND: &str = "DummyData";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DummyDataConfig {
    /// Zero fillers means constant zero; one filler is reused for every output.
    pub data_filler: Vec<FillerSpec>,
    /// One shape for every output, or one per output.
    pub shape: Vec<Vec<i64>>,
}

pub fn build<T: FloatElement>(spec: &StageSpec) -> NetResult<Box<dyn Stage<T>>> {
    let config: DummyDataConfig = spec.decode_config()?;
    Ok(Box::new(DummyData {
        name: spec.name.clone(),
        config,
        fillers: Vec::new(),
        refill: true,
        filled: false,
        rng: None,
    }))
}

pub struct DummyData {
    name: String,
    config: DummyDataConfig,
    fillers: Vec<FillerSpec>,
    /// Constant outputs are written once; anything random is redrawn every forward.
    refill: bool,
    filled: bool,
    rng: Option<StdRng>,
}

impl<T: FloatElement> Stage<T> for DummyData {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn input_arity(&self) -> Arity {
        Arity::exactly(0)
    }

    fn output_arity(&self) -> Arity {
        Arity::at_least(1)
    }

    fn setup(&mut self, _inputs: &[Shape], ctx: &mut SetupContext<'_, T>) -> NetResult<()> {
        self.rng = Some(ctx.fork_rng());
        Ok(())
    }

    fn configure(&mut self, _inputs: &[Shape], num_outputs: usize) -> NetResult<Vec<Shape>> {
        let num_fillers = self.config.data_filler.len();
        ensure_graph!(
            num_fillers == 0 || num_fillers == 1 || num_fillers == num_outputs,
            &self.name,
            "number of data fillers must be 0, 1 or {}; got {}",
            num_outputs,
            num_fillers
        );
        let num_shapes = self.config.shape.len();
        ensure_graph!(
            num_shapes == 1 || num_shapes == num_outputs,
            &self.name,
            "number of shapes must be 1 or {}; got {}",
            num_outputs,
            num_shapes
        );
        self.fillers = (0..num_outputs)
            .map(|i| match num_fillers {
                0 => FillerSpec::default(),
                1 => self.config.data_filler[0].clone(),
                _ => self.config.data_filler[i].clone(),
            })
            .collect();
        self.refill = !self.fillers.iter().all(FillerSpec::is_constant);
        self.filled = false;
        (0..num_outputs)
            .map(|i| Shape::from_signed(&self.config.shape[if num_shapes == 1 { 0 } else { i }]))
            .collect()
    }

    fn forward_host(&mut self, _inputs: &[&Tensor<T>], outputs: &[&Tensor<T>]) -> NetResult<()> {
        if self.filled && !self.refill {
            return Ok(());
        }
        let rng = self.rng.get_or_insert_with(|| StdRng::seed_from_u64(0));
        for (filler, out) in self.fillers.iter().zip(outputs) {
            filler.fill(*out, rng)?;
        }
        self.filled = true;
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
