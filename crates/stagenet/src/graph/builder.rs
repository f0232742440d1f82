//! Turns a description into a wired [`Graph`].

use std::collections::{BTreeSet, HashMap, HashSet};
use std::mem;

use tracing::{debug, info};

use super::filter::filter_net;
use super::split::insert_splits;
use super::{weight_of, Graph, ParamEntry, StageSlot};
use crate::context::ExecutionContext;
use crate::description::{NetDescription, ParamSpec, StageSpec};
use crate::env;
use crate::error::{ensure_graph, NetError, NetResult};
use crate::stage::{SetupContext, StageRegistry};
use crate::tensor::{FloatElement, Shape, Tensor};

pub(super) fn build<T: FloatElement>(
    desc: &NetDescription,
    ctx: ExecutionContext<T>,
    registry: &StageRegistry<T>,
) -> NetResult<Graph<T>> {
    let mut state = desc.state.clone();
    state.phase = ctx.phase();
    let filtered = filter_net(desc, &state)?;
    let weighted = with_default_loss_weights(filtered, registry);
    let expanded = insert_splits(&weighted)?;
    info!(
        net = %expanded.name,
        phase = ?state.phase,
        inputs = expanded.inputs.len(),
        stages = expanded.stages.len(),
        "building graph"
    );

    let mut graph = Graph {
        name: expanded.name.clone(),
        debug_info: expanded.debug_info || env::debug_info_forced(),
        ctx,
        stages: Vec::with_capacity(expanded.stages.len()),
        stage_index: HashMap::new(),
        tensors: Vec::new(),
        tensor_names: Vec::new(),
        tensor_index: HashMap::new(),
        inputs: Vec::new(),
        outputs: Vec::new(),
        params: Vec::new(),
        memory_bytes: 0,
    };
    // Tensors produced and not yet consumed, in creation order.
    let mut available = BTreeSet::new();

    for input in &expanded.inputs {
        ensure_graph!(
            !graph.tensor_index.contains_key(&input.name),
            "input",
            "duplicate graph input '{}'",
            input.name
        );
        let id = graph.push_tensor(&input.name);
        graph.tensors[id].reshape_signed(&input.shape)?;
        debug!(input = %input.name, shape = ?graph.tensors[id].shape(), "declared graph input");
        graph.inputs.push(id);
        available.insert(id);
    }

    for (i, spec) in expanded.stages.iter().enumerate() {
        let slot = graph.instantiate(i, spec, registry, &mut available)?;
        graph.stage_index.insert(spec.name.clone(), i);
        graph.stages.push(slot);
    }

    mark_backward(&mut graph, &expanded.stages);
    if expanded.force_backward {
        force_backward(&mut graph);
    }
    register_params(&mut graph, &expanded.stages)?;

    graph.outputs = available.into_iter().collect();
    for &id in &graph.outputs {
        info!(net = %graph.name, output = %graph.tensor_names[id], "graph output");
    }
    graph.memory_bytes = graph
        .tensors
        .iter()
        .map(|t| t.capacity().saturating_mul(mem::size_of::<T>()))
        .fold(0usize, usize::saturating_add);
    info!(net = %graph.name, bytes = graph.memory_bytes, "memory required for data");
    Ok(graph)
}

/// Loss kinds with no explicit weights get a weight of one on their first output.
fn with_default_loss_weights<T: FloatElement>(
    mut desc: NetDescription,
    registry: &StageRegistry<T>,
) -> NetDescription {
    for stage in &mut desc.stages {
        if stage.loss_weights.is_empty() && registry.is_loss_kind(&stage.kind) {
            stage.loss_weights = vec![1.0];
        }
    }
    desc
}

impl<T: FloatElement> Graph<T> {
    fn push_tensor(&mut self, name: &str) -> usize {
        let id = self.tensors.len();
        self.tensors.push(Tensor::new(self.ctx.device().cloned()));
        self.tensor_names.push(name.to_string());
        self.tensor_index.insert(name.to_string(), id);
        id
    }

    fn instantiate(
        &mut self,
        index: usize,
        spec: &StageSpec,
        registry: &StageRegistry<T>,
        available: &mut BTreeSet<usize>,
    ) -> NetResult<StageSlot<T>> {
        let stage_name = spec.name.as_str();
        ensure_graph!(
            !self.stage_index.contains_key(stage_name),
            stage_name,
            "duplicate stage name"
        );
        let factory = registry.get(&spec.kind).ok_or_else(|| {
            NetError::graph(stage_name, format!("unknown stage kind '{}'", spec.kind))
        })?;
        let mut stage = (factory.build)(spec)?;
        ensure_graph!(
            stage.input_arity().accepts(spec.inputs.len()),
            stage_name,
            "{} does not accept {} inputs ({:?})",
            spec.kind,
            spec.inputs.len(),
            stage.input_arity()
        );
        ensure_graph!(
            stage.output_arity().accepts(spec.outputs.len()),
            stage_name,
            "{} does not accept {} outputs ({:?})",
            spec.kind,
            spec.outputs.len(),
            stage.output_arity()
        );
        ensure_graph!(
            spec.propagate_down.is_empty() || spec.propagate_down.len() == spec.inputs.len(),
            stage_name,
            "propagate_down lists {} flags for {} inputs",
            spec.propagate_down.len(),
            spec.inputs.len()
        );

        let mut inputs = Vec::with_capacity(spec.inputs.len());
        for name in &spec.inputs {
            let &id = self
                .tensor_index
                .get(name)
                .ok_or_else(|| NetError::graph(stage_name, format!("unknown blob '{name}'")))?;
            available.remove(&id);
            inputs.push(id);
        }

        let mut outputs = Vec::with_capacity(spec.outputs.len());
        for (j, name) in spec.outputs.iter().enumerate() {
            let existing = self.tensor_index.get(name).copied();
            let id = match existing {
                Some(id) if spec.inputs.get(j) == Some(name) => {
                    ensure_graph!(
                        stage.supports_in_place(),
                        stage_name,
                        "{} cannot compute '{}' in place",
                        spec.kind,
                        name
                    );
                    debug!(stage = %stage_name, tensor = %name, "in-place output");
                    id
                }
                Some(_) => {
                    return Err(NetError::graph(
                        stage_name,
                        format!("output '{name}' produced by multiple sources"),
                    ))
                }
                None => self.push_tensor(name),
            };
            available.insert(id);
            outputs.push(id);
        }

        let input_shapes: Vec<Shape> = inputs.iter().map(|&id| self.tensors[id].shape()).collect();
        let mut setup = SetupContext::new(&self.ctx, index);
        stage.setup(&input_shapes, &mut setup)?;
        let output_shapes = stage.configure(&input_shapes, outputs.len())?;
        ensure_graph!(
            output_shapes.len() == outputs.len(),
            stage_name,
            "stage reported {} output shapes for {} outputs",
            output_shapes.len(),
            outputs.len()
        );
        for (&id, shape) in outputs.iter().zip(&output_shapes) {
            self.tensors[id].reshape_to(shape)?;
        }
        for (out, inp) in stage.value_aliases(outputs.len()) {
            let handle = self.tensors[inputs[inp]].values_handle();
            self.tensors[outputs[out]].adopt_values_handle(handle)?;
        }

        ensure_graph!(
            spec.loss_weights.len() <= outputs.len(),
            stage_name,
            "{} loss weights given for {} outputs",
            spec.loss_weights.len(),
            outputs.len()
        );
        let mut loss_weights = vec![T::zero(); outputs.len()];
        for (w, &given) in loss_weights.iter_mut().zip(&spec.loss_weights) {
            *w = weight_of(given);
        }
        ensure_graph!(
            spec.params.len() <= stage.params().len(),
            stage_name,
            "{} parameter specs given but the stage has {} parameters",
            spec.params.len(),
            stage.params().len()
        );

        for (&id, shape) in outputs.iter().zip(&output_shapes) {
            debug!(stage = %stage_name, output = %self.tensor_names[id], shape = %shape, "output shape");
        }
        for (k, w) in loss_weights.iter().enumerate() {
            if *w != T::zero() {
                debug!(stage = %stage_name, output = k, weight = w.as_f64(), "loss weight");
            }
        }
        info!(stage = %stage_name, kind = %spec.kind, "created stage");

        Ok(StageSlot {
            name: spec.name.clone(),
            input_needs_backward: vec![false; inputs.len()],
            param_propagate: vec![false; stage.params().len()],
            stage,
            inputs,
            outputs,
            loss_weights,
            needs_backward: false,
        })
    }
}

fn param_spec(spec: &StageSpec, index: usize) -> ParamSpec {
    spec.params.get(index).cloned().unwrap_or_default()
}

/// Decides which stages run backward and which of their inputs receive gradients.
///
/// A forward sweep marks a stage when any input carries a gradient or any parameter has a
/// nonzero learning multiplier; its outputs then carry gradients too. A reverse sweep
/// clears stages whose outputs never reach a weighted loss, and stages whose consumers all
/// declined the gradient.
fn mark_backward<T: FloatElement>(graph: &mut Graph<T>, specs: &[StageSpec]) {
    let mut tensor_needs = vec![false; graph.tensors.len()];
    for (slot, spec) in graph.stages.iter_mut().zip(specs) {
        let mut needs = false;
        for (j, &id) in slot.inputs.iter().enumerate() {
            needs |= tensor_needs[id];
            let allowed = spec.propagate_down.get(j).copied().unwrap_or(true);
            slot.input_needs_backward[j] = tensor_needs[id] && allowed;
        }
        for (k, flag) in slot.param_propagate.iter_mut().enumerate() {
            *flag = param_spec(spec, k).lr_mult != 0.0;
            needs |= *flag;
        }
        for &id in &slot.outputs {
            tensor_needs[id] = needs;
        }
        slot.needs_backward = needs;
    }

    let mut under_loss = HashSet::new();
    let mut skipped = HashSet::new();
    for slot in graph.stages.iter_mut().rev() {
        let mut contributes = false;
        let mut all_skipped = true;
        for (k, id) in slot.outputs.iter().enumerate() {
            if slot.loss_weights[k] != T::zero() || under_loss.contains(id) {
                contributes = true;
            }
            if !skipped.contains(id) {
                all_skipped = false;
            }
            if contributes && !all_skipped {
                break;
            }
        }
        if slot.needs_backward && all_skipped {
            slot.needs_backward = false;
            slot.input_needs_backward.fill(false);
        }
        if !contributes {
            slot.needs_backward = false;
        }
        for (j, &id) in slot.inputs.iter().enumerate() {
            if contributes {
                under_loss.insert(id);
            } else {
                slot.input_needs_backward[j] = false;
            }
            if !slot.input_needs_backward[j] {
                skipped.insert(id);
            }
        }
        debug!(
            stage = %slot.name,
            needs_backward = slot.needs_backward,
            contributes_loss = contributes,
            inputs = ?slot.input_needs_backward,
            "backward decision"
        );
    }
}

/// Every stage runs backward and every input that allows it receives a gradient.
fn force_backward<T: FloatElement>(graph: &mut Graph<T>) {
    for slot in &mut graph.stages {
        slot.needs_backward = true;
        for (j, flag) in slot.input_needs_backward.iter_mut().enumerate() {
            *flag = *flag || slot.stage.allow_force_backward(j);
        }
        slot.param_propagate.fill(true);
    }
}

/// Records every stage parameter and aliases same-named parameters to their first owner.
fn register_params<T: FloatElement>(graph: &mut Graph<T>, specs: &[StageSpec]) -> NetResult<()> {
    let mut owners: HashMap<String, usize> = HashMap::new();
    for (si, spec) in specs.iter().enumerate() {
        let count = graph.stages[si].stage.params().len();
        for k in 0..count {
            let pspec = param_spec(spec, k);
            let id = graph.params.len();
            let display_name = pspec.name.clone().unwrap_or_else(|| k.to_string());
            let owner = pspec.name.as_ref().and_then(|n| owners.get(n).copied());
            match owner {
                None => {
                    if let Some(name) = &pspec.name {
                        owners.insert(name.clone(), id);
                    }
                }
                Some(owner) => {
                    let owner_entry = &graph.params[owner];
                    ensure_graph!(
                        owner_entry.lr_mult == pspec.lr_mult,
                        spec.name.as_str(),
                        "shared parameter '{}' has mismatched lr_mult ({} vs {})",
                        display_name,
                        pspec.lr_mult,
                        owner_entry.lr_mult
                    );
                    ensure_graph!(
                        owner_entry.decay_mult == pspec.decay_mult,
                        spec.name.as_str(),
                        "shared parameter '{}' has mismatched decay_mult ({} vs {})",
                        display_name,
                        pspec.decay_mult,
                        owner_entry.decay_mult
                    );
                    let source = &graph.stages[owner_entry.stage_index].stage.params()
                        [owner_entry.index];
                    let mine = &graph.stages[si].stage.params()[k];
                    ensure_graph!(
                        source.count() == mine.count(),
                        spec.name.as_str(),
                        "cannot share parameter '{}': {} elements here, owner has {}",
                        display_name,
                        mine.count(),
                        source.count()
                    );
                    let handle = source.values_handle();
                    graph.stages[si].stage.params_mut()[k].adopt_values_handle(handle)?;
                    debug!(
                        stage = %spec.name,
                        param = %display_name,
                        owner = %graph.params[owner].stage,
                        "sharing parameter"
                    );
                }
            }
            graph.params.push(ParamEntry {
                stage: spec.name.clone(),
                stage_index: si,
                index: k,
                display_name,
                lr_mult: pspec.lr_mult,
                decay_mult: pspec.decay_mult,
                owner,
            });
        }
    }
    Ok(())
}
