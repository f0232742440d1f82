//! Stage capability interface and the built-in stage kinds.
//!
//! A stage is configured from its input shapes, produces outputs from inputs in the forward
//! pass, and in the backward pass reads its output gradients to overwrite input gradients
//! and accumulate into its own parameter gradients. The graph owns the sequencing; stages
//! only ever see the tensors wired to them.

use std::any::Any;

use rand::rngs::StdRng;

use crate::context::{ExecutionContext, Phase};
use crate::device::DeviceRef;
use crate::error::NetResult;
use crate::filler::FillerSpec;
use crate::tensor::{FloatElement, Shape, Tensor};

pub(crate) mod im2col;
pub mod kinds;
pub(crate) mod math;
pub mod registry;

pub use registry::{stage_factories, BuildFn, StageFactory, StageRegistry};

/// Accepted number of input or output tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arity {
    pub min: usize,
    pub max: Option<usize>,
}

impl Arity {
    pub const ANY: Arity = Arity { min: 0, max: None };

    pub const fn exactly(n: usize) -> Self {
        Arity {
            min: n,
            max: Some(n),
        }
    }

    pub const fn at_least(n: usize) -> Self {
        Arity { min: n, max: None }
    }

    pub const fn between(min: usize, max: usize) -> Self {
        Arity {
            min,
            max: Some(max),
        }
    }

    pub fn accepts(&self, n: usize) -> bool {
        n >= self.min && self.max.map_or(true, |max| n <= max)
    }
}

/// Which gradients a backward call must produce.
#[derive(Debug, Clone, Copy)]
pub struct Propagation<'a> {
    inputs: &'a [bool],
    params: &'a [bool],
}

impl<'a> Propagation<'a> {
    pub fn new(inputs: &'a [bool], params: &'a [bool]) -> Self {
        Propagation { inputs, params }
    }

    /// Whether input `index` needs its gradient overwritten.
    pub fn input(&self, index: usize) -> bool {
        self.inputs.get(index).copied().unwrap_or(false)
    }

    /// Whether parameter `index` needs its gradient accumulated.
    pub fn param(&self, index: usize) -> bool {
        self.params.get(index).copied().unwrap_or(false)
    }

    pub fn any_input(&self) -> bool {
        self.inputs.iter().any(|&b| b)
    }
}

/// Construction-time services for [`Stage::setup`].
pub struct SetupContext<'a, T: FloatElement> {
    exec: &'a ExecutionContext<T>,
    rng: StdRng,
}

impl<'a, T: FloatElement> SetupContext<'a, T> {
    pub(crate) fn new(exec: &'a ExecutionContext<T>, stage_index: usize) -> Self {
        SetupContext {
            exec,
            rng: exec.stage_rng(stage_index),
        }
    }

    pub fn phase(&self) -> Phase {
        self.exec.phase()
    }

    pub fn device(&self) -> Option<DeviceRef<T>> {
        self.exec.device().cloned()
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    /// Generator seeded for this stage, for stages that draw again during execution.
    pub fn fork_rng(&self) -> StdRng {
        self.rng.clone()
    }

    /// Allocates a tensor on the graph's device (if any).
    pub fn tensor(&self, dims: &[usize]) -> NetResult<Tensor<T>> {
        Tensor::with_shape(dims, self.device())
    }

    /// Allocates a parameter tensor and initializes it with `filler`.
    pub fn param(&mut self, dims: &[usize], filler: &FillerSpec) -> NetResult<Tensor<T>> {
        let tensor = self.tensor(dims)?;
        filler.fill(&tensor, &mut self.rng)?;
        Ok(tensor)
    }
}

/// Downcasting hook so callers can reach stage-specific APIs (e.g. feeding a memory source).
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<S: Any> AsAny for S {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// One processing unit of a graph.
pub trait Stage<T: FloatElement>: AsAny {
    fn kind(&self) -> &'static str;

    fn input_arity(&self) -> Arity {
        Arity::ANY
    }

    fn output_arity(&self) -> Arity {
        Arity::ANY
    }

    /// One-time initialization given the first known input shapes; creates parameters.
    fn setup(&mut self, _inputs: &[Shape], _ctx: &mut SetupContext<'_, T>) -> NetResult<()> {
        Ok(())
    }

    /// Computes output shapes for the current input shapes. Called at construction and
    /// again whenever the graph is reshaped.
    fn configure(&mut self, inputs: &[Shape], num_outputs: usize) -> NetResult<Vec<Shape>>;

    fn forward_host(&mut self, inputs: &[&Tensor<T>], outputs: &[&Tensor<T>]) -> NetResult<()>;

    /// Accelerator entry point; stages without a device kernel run the host path, which
    /// pulls data across lazily.
    fn forward_device(&mut self, inputs: &[&Tensor<T>], outputs: &[&Tensor<T>]) -> NetResult<()> {
        self.forward_host(inputs, outputs)
    }

    fn backward_host(
        &mut self,
        outputs: &[&Tensor<T>],
        propagate: &Propagation<'_>,
        inputs: &[&Tensor<T>],
    ) -> NetResult<()>;

    fn backward_device(
        &mut self,
        outputs: &[&Tensor<T>],
        propagate: &Propagation<'_>,
        inputs: &[&Tensor<T>],
    ) -> NetResult<()> {
        self.backward_host(outputs, propagate, inputs)
    }

    fn params(&self) -> &[Tensor<T>] {
        &[]
    }

    fn params_mut(&mut self) -> &mut [Tensor<T>] {
        &mut []
    }

    /// Whether `force_backward` may request a gradient for input `index`.
    fn allow_force_backward(&self, _index: usize) -> bool {
        true
    }

    /// Loss stages default to a weight of one on their first output.
    fn is_loss(&self) -> bool {
        false
    }

    /// Whether an output may reuse the tensor of the input at the same position.
    fn supports_in_place(&self) -> bool {
        false
    }

    /// `(output, input)` pairs whose value storage the graph should alias after configure.
    fn value_aliases(&self, _num_outputs: usize) -> Vec<(usize, usize)> {
        Vec::new()
    }
}
