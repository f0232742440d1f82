//! Rewrites a description so every tensor has at most one consumer.
//!
//! A tensor read by several stages (or read once and also weighted as a loss) gets a
//! `Split` stage right after its producer; each consumer is rewired to its own output of
//! that split. Backward then sums the consumers' gradients in one place.

use std::collections::HashMap;

use tracing::debug;

use crate::description::{NetDescription, StageSpec};
use crate::error::{NetError, NetResult};
use crate::stage::kinds::split;

/// Producer name used for the graph's declared inputs.
const INPUT_PRODUCER: &str = "input";

/// `(stage index, output index)`; declared inputs use `None` as the stage.
type Slot = (Option<usize>, usize);

pub fn split_stage_name(producer: &str, tensor: &str, output_index: usize) -> String {
    format!("{tensor}_{producer}_{output_index}_split")
}

pub fn split_output_name(producer: &str, tensor: &str, output_index: usize, k: usize) -> String {
    format!("{}_{k}", split_stage_name(producer, tensor, output_index))
}

fn split_spec(
    producer: &str,
    tensor: &str,
    output_index: usize,
    consumers: usize,
    loss_weight: f64,
) -> StageSpec {
    let outputs =
        (0..consumers).map(|k| split_output_name(producer, tensor, output_index, k));
    let mut spec = StageSpec::new(split_stage_name(producer, tensor, output_index), split::KIND)
        .with_inputs([tensor])
        .with_outputs(outputs);
    if loss_weight != 0.0 {
        let mut weights = vec![0.0; consumers];
        weights[consumers - 1] = loss_weight;
        spec.loss_weights = weights;
    }
    spec
}

/// Inserts split stages. Loss weights must already carry their per-kind defaults.
pub fn insert_splits(desc: &NetDescription) -> NetResult<NetDescription> {
    let mut last_producer: HashMap<&str, Slot> = HashMap::new();
    let mut source_of: HashMap<(usize, usize), Slot> = HashMap::new();
    let mut consumers: HashMap<Slot, usize> = HashMap::new();
    let mut loss_weight: HashMap<Slot, f64> = HashMap::new();

    for (i, input) in desc.inputs.iter().enumerate() {
        last_producer.insert(input.name.as_str(), (None, i));
    }
    for (i, stage) in desc.stages.iter().enumerate() {
        for (j, name) in stage.inputs.iter().enumerate() {
            let slot = *last_producer.get(name.as_str()).ok_or_else(|| {
                NetError::graph(stage.name.as_str(), format!("unknown blob '{name}'"))
            })?;
            source_of.insert((i, j), slot);
            *consumers.entry(slot).or_default() += 1;
        }
        for (j, name) in stage.outputs.iter().enumerate() {
            last_producer.insert(name.as_str(), (Some(i), j));
        }
        for (j, &weight) in stage.loss_weights.iter().enumerate() {
            let slot = (Some(i), j);
            loss_weight.insert(slot, weight);
            if weight != 0.0 {
                *consumers.entry(slot).or_default() += 1;
            }
        }
    }

    let mut split_cursor: HashMap<Slot, usize> = HashMap::new();
    let mut out = NetDescription {
        stages: Vec::with_capacity(desc.stages.len()),
        ..desc.clone()
    };

    for (i, input) in desc.inputs.iter().enumerate() {
        let count = consumers.get(&(None, i)).copied().unwrap_or(0);
        if count > 1 {
            debug!(tensor = %input.name, consumers = count, "splitting graph input");
            out.stages
                .push(split_spec(INPUT_PRODUCER, &input.name, i, count, 0.0));
        }
    }

    for (i, stage) in desc.stages.iter().enumerate() {
        let mut rewritten = stage.clone();
        for (j, name) in stage.inputs.iter().enumerate() {
            let slot = source_of[&(i, j)];
            if consumers.get(&slot).copied().unwrap_or(0) > 1 {
                let producer = match slot.0 {
                    Some(p) => desc.stages[p].name.as_str(),
                    None => INPUT_PRODUCER,
                };
                let cursor = split_cursor.entry(slot).or_default();
                rewritten.inputs[j] = split_output_name(producer, name, slot.1, *cursor);
                *cursor += 1;
            }
        }
        let mut splits = Vec::new();
        for (j, name) in stage.outputs.iter().enumerate() {
            let slot = (Some(i), j);
            let count = consumers.get(&slot).copied().unwrap_or(0);
            if count > 1 {
                let weight = loss_weight.get(&slot).copied().unwrap_or(0.0);
                if weight != 0.0 {
                    rewritten.loss_weights[j] = 0.0;
                }
                debug!(stage = %stage.name, tensor = %name, consumers = count, "inserting split");
                splits.push(split_spec(&stage.name, name, j, count, weight));
            }
        }
        out.stages.push(rewritten);
        out.stages.extend(splits);
    }
    Ok(out)
}
