//! Graph assembly and forward/backward execution.
//!
//! A [`Graph`] is built once from a [`NetDescription`]: stages are filtered against the
//! net state, fan-outs get split stages, every stage is instantiated in order and wired
//! to named tensors, and the builder decides which edges need gradients. After that the
//! topology is fixed and the graph can be run forward and backward any number of times.

use std::collections::HashMap;

use tracing::info;

use crate::context::{ExecutionContext, ExecutionMode, Phase};
use crate::description::NetDescription;
use crate::error::{ensure_graph, NetError, NetResult};
use crate::stage::{Propagation, Stage, StageRegistry};
use crate::tensor::{cast, FloatElement, Tensor};

mod builder;
pub mod filter;
pub mod split;

pub use filter::{filter_net, state_meets_rule};
pub use split::{insert_splits, split_output_name, split_stage_name};

/// One instantiated stage and its wiring.
pub(crate) struct StageSlot<T: FloatElement> {
    pub(crate) name: String,
    pub(crate) stage: Box<dyn Stage<T>>,
    pub(crate) inputs: Vec<usize>,
    pub(crate) outputs: Vec<usize>,
    pub(crate) input_needs_backward: Vec<bool>,
    pub(crate) param_propagate: Vec<bool>,
    /// Weight per output; zero means the output does not contribute to the loss.
    pub(crate) loss_weights: Vec<T>,
    pub(crate) needs_backward: bool,
}

/// Bookkeeping for one stage parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamEntry {
    pub stage: String,
    pub stage_index: usize,
    /// Position within the stage's parameter list.
    pub index: usize,
    /// Sharing name, or the position when the parameter is unnamed.
    pub display_name: String,
    pub lr_mult: f64,
    pub decay_mult: f64,
    /// Entry that owns the values when this one is an alias.
    pub owner: Option<usize>,
}

impl ParamEntry {
    pub fn is_owner(&self) -> bool {
        self.owner.is_none()
    }
}

pub struct Graph<T: FloatElement> {
    name: String,
    ctx: ExecutionContext<T>,
    debug_info: bool,
    stages: Vec<StageSlot<T>>,
    stage_index: HashMap<String, usize>,
    tensors: Vec<Tensor<T>>,
    tensor_names: Vec<String>,
    tensor_index: HashMap<String, usize>,
    inputs: Vec<usize>,
    outputs: Vec<usize>,
    params: Vec<ParamEntry>,
    memory_bytes: usize,
}

impl<T: FloatElement> Graph<T> {
    /// Builds a graph using the built-in stage kinds.
    pub fn new(desc: &NetDescription, ctx: ExecutionContext<T>) -> NetResult<Self> {
        Self::with_registry(desc, ctx, &StageRegistry::builtin())
    }

    /// Builds a graph resolving stage kinds through `registry`.
    pub fn with_registry(
        desc: &NetDescription,
        ctx: ExecutionContext<T>,
        registry: &StageRegistry<T>,
    ) -> NetResult<Self> {
        builder::build(desc, ctx, registry)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phase(&self) -> Phase {
        self.ctx.phase()
    }

    pub fn context(&self) -> &ExecutionContext<T> {
        &self.ctx
    }

    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }

    pub fn stage_names(&self) -> impl Iterator<Item = &str> {
        self.stages.iter().map(|s| s.name.as_str())
    }

    pub fn tensor_names(&self) -> impl Iterator<Item = &str> {
        self.tensor_names.iter().map(String::as_str)
    }

    /// Bytes requested for the graph's data tensors (parameters excluded).
    pub fn memory_used_bytes(&self) -> usize {
        self.memory_bytes
    }

    pub fn tensor_by_name(&self, name: &str) -> Option<&Tensor<T>> {
        self.tensor_index.get(name).map(|&id| &self.tensors[id])
    }

    pub fn stage_by_name(&self, name: &str) -> Option<&dyn Stage<T>> {
        self.stage_index
            .get(name)
            .map(|&i| self.stages[i].stage.as_ref())
    }

    /// Downcasts a stage to its concrete type, e.g. to feed a memory source.
    pub fn stage_as<S: Stage<T>>(&self, name: &str) -> Option<&S> {
        let &i = self.stage_index.get(name)?;
        self.stages[i].stage.as_ref().as_any().downcast_ref::<S>()
    }

    pub fn stage_as_mut<S: Stage<T>>(&mut self, name: &str) -> Option<&mut S> {
        let &i = self.stage_index.get(name)?;
        self.stages[i].stage.as_mut().as_any_mut().downcast_mut::<S>()
    }

    pub fn inputs(&self) -> Vec<&Tensor<T>> {
        self.inputs.iter().map(|&id| &self.tensors[id]).collect()
    }

    pub fn input_names(&self) -> Vec<&str> {
        self.inputs
            .iter()
            .map(|&id| self.tensor_names[id].as_str())
            .collect()
    }

    /// Tensors produced but never consumed inside the graph.
    pub fn outputs(&self) -> Vec<&Tensor<T>> {
        self.outputs.iter().map(|&id| &self.tensors[id]).collect()
    }

    pub fn output_names(&self) -> Vec<&str> {
        self.outputs
            .iter()
            .map(|&id| self.tensor_names[id].as_str())
            .collect()
    }

    pub fn stage_needs_backward(&self, name: &str) -> Option<bool> {
        self.stage_index
            .get(name)
            .map(|&i| self.stages[i].needs_backward)
    }

    pub fn input_needs_backward(&self, name: &str) -> Option<&[bool]> {
        self.stage_index
            .get(name)
            .map(|&i| self.stages[i].input_needs_backward.as_slice())
    }

    pub fn loss_weights(&self, name: &str) -> Option<&[T]> {
        self.stage_index
            .get(name)
            .map(|&i| self.stages[i].loss_weights.as_slice())
    }

    /// Every parameter in registration order, aliases included.
    pub fn params(&self) -> &[ParamEntry] {
        &self.params
    }

    /// Parameters that own their values; the ones an optimizer should step.
    pub fn learnable_params(&self) -> impl Iterator<Item = (&ParamEntry, &Tensor<T>)> {
        self.params
            .iter()
            .filter(|p| p.is_owner())
            .map(|p| (p, self.param_tensor(p)))
    }

    pub fn param(&self, id: usize) -> Option<&Tensor<T>> {
        self.params.get(id).map(|p| self.param_tensor(p))
    }

    fn param_tensor(&self, entry: &ParamEntry) -> &Tensor<T> {
        &self.stages[entry.stage_index].stage.params()[entry.index]
    }

    fn input_slot(&self, index: usize) -> NetResult<usize> {
        self.inputs.get(index).copied().ok_or_else(|| {
            NetError::graph(
                self.name.as_str(),
                format!("input {index} out of range ({} inputs)", self.inputs.len()),
            )
        })
    }

    /// Copies `data` into graph input `index`.
    pub fn set_input(&self, index: usize, data: &[T]) -> NetResult<()> {
        self.tensors[self.input_slot(index)?].set_values(data)
    }

    /// Hands `data` to graph input `index` without copying.
    pub fn adopt_input(&self, index: usize, data: Vec<T>) -> NetResult<()> {
        self.tensors[self.input_slot(index)?].adopt_values(data)
    }

    /// Returns memory previously given to [`adopt_input`](Self::adopt_input).
    pub fn release_input(&self, index: usize) -> NetResult<Option<Vec<T>>> {
        Ok(self.tensors[self.input_slot(index)?].release_adopted())
    }

    /// Re-runs shape configuration for every stage, e.g. after an input was reshaped.
    pub fn reshape(&mut self) -> NetResult<()> {
        let Graph {
            stages, tensors, ..
        } = &mut *self;
        for slot in stages.iter_mut() {
            let shapes: Vec<_> = slot.inputs.iter().map(|&id| tensors[id].shape()).collect();
            let out_shapes = slot.stage.configure(&shapes, slot.outputs.len())?;
            ensure_graph!(
                out_shapes.len() == slot.outputs.len(),
                slot.name.as_str(),
                "stage reported {} output shapes for {} outputs",
                out_shapes.len(),
                slot.outputs.len()
            );
            for (&id, shape) in slot.outputs.iter().zip(&out_shapes) {
                tensors[id].reshape_to(shape)?;
            }
        }
        Ok(())
    }

    /// Copies each slice into the corresponding graph input, then runs forward.
    pub fn forward(&mut self, inputs: &[&[T]]) -> NetResult<T> {
        ensure_graph!(
            inputs.len() == self.inputs.len(),
            self.name.as_str(),
            "expected {} inputs, got {}",
            self.inputs.len(),
            inputs.len()
        );
        for (i, data) in inputs.iter().enumerate() {
            self.set_input(i, data)?;
        }
        self.forward_prefilled()
    }

    /// Runs forward with whatever the inputs currently hold; returns the weighted loss.
    pub fn forward_prefilled(&mut self) -> NetResult<T> {
        if self.stages.is_empty() {
            return Ok(T::zero());
        }
        self.forward_from_to(0, self.stages.len() - 1)
    }

    /// Runs stages `start..=end` forward and returns their weighted loss contribution.
    pub fn forward_from_to(&mut self, start: usize, end: usize) -> NetResult<T> {
        ensure_graph!(
            start <= end && end < self.stages.len(),
            self.name.as_str(),
            "invalid forward range {}..={} for {} stages",
            start,
            end,
            self.stages.len()
        );
        let mut loss = T::zero();
        for i in start..=end {
            loss += self.forward_stage(i)?;
        }
        Ok(loss)
    }

    fn forward_stage(&mut self, i: usize) -> NetResult<T> {
        let mode = self.ctx.mode();
        let Graph {
            stages, tensors, ..
        } = &mut *self;
        let slot = &mut stages[i];
        let inputs: Vec<&Tensor<T>> = slot.inputs.iter().map(|&id| &tensors[id]).collect();
        let outputs: Vec<&Tensor<T>> = slot.outputs.iter().map(|&id| &tensors[id]).collect();
        match mode {
            ExecutionMode::Host => slot.stage.forward_host(&inputs, &outputs)?,
            ExecutionMode::Device => slot.stage.forward_device(&inputs, &outputs)?,
        }
        let mut loss = T::zero();
        for (output, &weight) in outputs.iter().zip(&slot.loss_weights) {
            if weight != T::zero() {
                let sum = output.values()?.iter().fold(T::zero(), |acc, &v| acc + v);
                loss += weight * sum;
            }
        }
        if self.debug_info {
            self.log_forward(i)?;
        }
        Ok(loss)
    }

    /// Backward through every stage, then folds shared-parameter gradients into owners.
    pub fn backward(&mut self) -> NetResult<()> {
        if self.stages.is_empty() {
            return Ok(());
        }
        self.backward_from_to(self.stages.len() - 1, 0)
    }

    /// Runs stages `start` down to `end` (inclusive) backward.
    pub fn backward_from_to(&mut self, start: usize, end: usize) -> NetResult<()> {
        ensure_graph!(
            end <= start && start < self.stages.len(),
            self.name.as_str(),
            "invalid backward range {}..={} for {} stages",
            start,
            end,
            self.stages.len()
        );
        for i in (end..=start).rev() {
            self.backward_stage(i)?;
        }
        self.fold_shared_gradients()
    }

    fn backward_stage(&mut self, i: usize) -> NetResult<()> {
        let mode = self.ctx.mode();
        let Graph {
            stages, tensors, ..
        } = &mut *self;
        let slot = &mut stages[i];
        if !slot.needs_backward {
            return Ok(());
        }
        let inputs: Vec<&Tensor<T>> = slot.inputs.iter().map(|&id| &tensors[id]).collect();
        let outputs: Vec<&Tensor<T>> = slot.outputs.iter().map(|&id| &tensors[id]).collect();
        for (output, &weight) in outputs.iter().zip(&slot.loss_weights) {
            if weight != T::zero() {
                output.grads_mut()?.fill(weight);
            }
        }
        let propagate = Propagation::new(&slot.input_needs_backward, &slot.param_propagate);
        match mode {
            ExecutionMode::Host => slot.stage.backward_host(&outputs, &propagate, &inputs)?,
            ExecutionMode::Device => slot.stage.backward_device(&outputs, &propagate, &inputs)?,
        }
        if self.debug_info {
            self.log_backward(i)?;
        }
        Ok(())
    }

    /// Forward then backward; returns the loss.
    pub fn forward_backward(&mut self, inputs: &[&[T]]) -> NetResult<T> {
        let loss = self.forward(inputs)?;
        self.backward()?;
        Ok(loss)
    }

    /// Adds each alias parameter's gradient into its owner and clears the alias.
    fn fold_shared_gradients(&self) -> NetResult<()> {
        for entry in &self.params {
            let Some(owner) = entry.owner else { continue };
            let alias = self.param_tensor(entry);
            let owner = self.param_tensor(&self.params[owner]);
            let grads = alias.grads()?.to_vec();
            for (o, g) in owner.grads_mut()?.iter_mut().zip(grads) {
                *o += g;
            }
            alias.zero_grads()?;
        }
        Ok(())
    }

    /// Zeroes every parameter gradient, aliases included.
    pub fn zero_param_gradients(&self) -> NetResult<()> {
        for entry in &self.params {
            self.param_tensor(entry).zero_grads()?;
        }
        Ok(())
    }

    /// Applies `values -= grads` to every owning parameter. Aliases see the result through
    /// their shared values.
    pub fn update(&self) -> NetResult<()> {
        for (_, tensor) in self.learnable_params() {
            tensor.apply_gradient_step()?;
        }
        Ok(())
    }

    /// Points the parameters of every same-named stage at `other`'s parameter values.
    pub fn share_trained_stages_with(&mut self, other: &Graph<T>) -> NetResult<()> {
        for source in &other.stages {
            let Some(&i) = self.stage_index.get(&source.name) else {
                continue;
            };
            let target = &mut self.stages[i];
            let theirs = source.stage.params();
            ensure_graph!(
                theirs.len() == target.stage.params().len(),
                target.name.as_str(),
                "incompatible number of parameters: {} here, {} in '{}'",
                target.stage.params().len(),
                theirs.len(),
                other.name
            );
            for (mine, src) in target.stage.params_mut().iter_mut().zip(theirs) {
                ensure_graph!(
                    mine.shape() == src.shape(),
                    target.name.as_str(),
                    "cannot share parameter of shape {:?} with one of shape {:?}",
                    mine.shape(),
                    src.shape()
                );
                mine.adopt_values_handle(src.values_handle())?;
            }
            info!(stage = %source.name, from = %other.name, "sharing trained parameters");
        }
        Ok(())
    }

    fn log_forward(&self, i: usize) -> NetResult<()> {
        let slot = &self.stages[i];
        for &id in &slot.outputs {
            let t = &self.tensors[id];
            info!(
                "[Forward] stage {}, output {} data: {:e}",
                slot.name,
                self.tensor_names[id],
                mean_abs(t.sum_abs_values()?, t.count())
            );
        }
        for (k, p) in slot.stage.params().iter().enumerate() {
            info!(
                "[Forward] stage {}, param {} data: {:e}",
                slot.name,
                k,
                mean_abs(p.sum_abs_values()?, p.count())
            );
        }
        Ok(())
    }

    fn log_backward(&self, i: usize) -> NetResult<()> {
        let slot = &self.stages[i];
        for (j, &id) in slot.inputs.iter().enumerate() {
            if !slot.input_needs_backward[j] {
                continue;
            }
            let t = &self.tensors[id];
            info!(
                "[Backward] stage {}, input {} diff: {:e}",
                slot.name,
                self.tensor_names[id],
                mean_abs(t.sum_abs_grads()?, t.count())
            );
        }
        for (k, p) in slot.stage.params().iter().enumerate() {
            if !slot.param_propagate.get(k).copied().unwrap_or(false) {
                continue;
            }
            info!(
                "[Backward] stage {}, param {} diff: {:e}",
                slot.name,
                k,
                mean_abs(p.sum_abs_grads()?, p.count())
            );
        }
        Ok(())
    }
}

fn mean_abs<T: FloatElement>(sum: T, count: usize) -> f64 {
    if count == 0 {
        return 0.0;
    }
    sum.as_f64() / count as f64
}

/// Converts a description loss weight to the graph's element type.
pub(crate) fn weight_of<T: FloatElement>(weight: f64) -> T {
    cast(weight)
}
