//! Migration of the legacy description dialect.
//!
//! The legacy format lists stages under `layers` with upper-case enum kind names, keeps
//! per-parameter learning multipliers in parallel `blobs_lr` / `weight_decay` arrays and
//! names shared parameters in a flat `param` list. Graph inputs may be declared with the
//! deprecated flat `input_dim` list (four dimensions per input). Kind-specific settings live
//! in `<kind>_param` blocks next to the stage fields.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::description::{InputSpec, NetDescription, NetState, ParamSpec, StageSpec, StateRule};

/// Reports whether `value` is written in the legacy dialect.
pub fn net_needs_upgrade(value: &Value) -> bool {
    let Some(obj) = value.as_object() else {
        return false;
    };
    let has_layers = obj.get("layers").is_some_and(Value::is_array);
    let has_input_dim = obj
        .get("input_dim")
        .and_then(Value::as_array)
        .is_some_and(|dims| !dims.is_empty());
    has_layers || has_input_dim
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LegacyShape {
    #[serde(default)]
    pub dim: Vec<i64>,
}

/// Legacy stage record.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LegacyStage {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub bottom: Vec<String>,
    #[serde(default)]
    pub top: Vec<String>,
    #[serde(default)]
    pub blobs_lr: Vec<f64>,
    #[serde(default)]
    pub weight_decay: Vec<f64>,
    #[serde(default)]
    pub param: Vec<String>,
    #[serde(default)]
    pub loss_weight: Vec<f64>,
    #[serde(default)]
    pub propagate_down: Vec<bool>,
    #[serde(default)]
    pub include: Vec<StateRule>,
    #[serde(default)]
    pub exclude: Vec<StateRule>,
    /// `<kind>_param` blocks and anything else not recognised above.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Legacy graph description.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LegacyNetDescription {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub input: Vec<String>,
    #[serde(default)]
    pub input_dim: Vec<i64>,
    #[serde(default)]
    pub input_shape: Vec<LegacyShape>,
    #[serde(default)]
    pub force_backward: bool,
    #[serde(default)]
    pub debug_info: bool,
    #[serde(default)]
    pub state: NetState,
    #[serde(default)]
    pub layers: Vec<LegacyStage>,
}

/// Legacy kind name, current kind name, and the key of its parameter block.
const KIND_TABLE: &[(&str, &str, &str)] = &[
    ("CONCAT", "Concat", "concat_param"),
    ("CONVOLUTION", "Convolution", "convolution_param"),
    ("DUMMY_DATA", "DummyData", "dummy_data_param"),
    ("EUCLIDEAN_LOSS", "EuclideanLoss", "euclidean_loss_param"),
    ("INNER_PRODUCT", "InnerProduct", "inner_product_param"),
    ("MEMORY_DATA", "MemoryData", "memory_data_param"),
    ("MVN", "MVN", "mvn_param"),
    ("RELU", "ReLU", "relu_param"),
    ("SLICE", "Slice", "slice_param"),
    ("SOFTMAX_LOSS", "SoftmaxWithLoss", "softmax_param"),
    ("SPLIT", "Split", "split_param"),
];

/// Translates a legacy description into the current one.
///
/// The flag is `false` when something could not be carried over faithfully (unknown kind,
/// stray parameter blocks, malformed input dimensions); the returned description is still
/// the best available translation.
pub fn upgrade_legacy(legacy: &LegacyNetDescription) -> (NetDescription, bool) {
    let mut complete = true;
    let mut net = NetDescription {
        name: legacy.name.clone(),
        inputs: Vec::with_capacity(legacy.input.len()),
        force_backward: legacy.force_backward,
        debug_info: legacy.debug_info,
        state: legacy.state.clone(),
        stages: Vec::with_capacity(legacy.layers.len()),
    };

    if !legacy.input_dim.is_empty() && !legacy.input_shape.is_empty() {
        warn!(net = %legacy.name, "both input_dim and input_shape given; using input_shape");
        complete = false;
    }
    for (i, name) in legacy.input.iter().enumerate() {
        let shape = if !legacy.input_shape.is_empty() {
            legacy.input_shape.get(i).map(|s| s.dim.clone())
        } else {
            legacy.input_dim.get(i * 4..i * 4 + 4).map(<[i64]>::to_vec)
        };
        match shape {
            Some(shape) => net.inputs.push(InputSpec {
                name: name.clone(),
                shape,
            }),
            None => {
                warn!(input = %name, "input has no dimensions in the legacy description");
                complete = false;
                net.inputs.push(InputSpec {
                    name: name.clone(),
                    shape: Vec::new(),
                });
            }
        }
    }
    if legacy.input_shape.is_empty() && legacy.input_dim.len() != legacy.input.len() * 4 {
        warn!(
            dims = legacy.input_dim.len(),
            inputs = legacy.input.len(),
            "input_dim must hold four dimensions per input"
        );
        complete = false;
    }

    for layer in &legacy.layers {
        let (stage, ok) = upgrade_stage(layer);
        complete &= ok;
        net.stages.push(stage);
    }
    debug!(net = %net.name, stages = net.stages.len(), complete, "upgraded legacy description");
    (net, complete)
}

fn upgrade_stage(layer: &LegacyStage) -> (StageSpec, bool) {
    let mut complete = true;
    let entry = KIND_TABLE
        .iter()
        .find(|(legacy, current, _)| *legacy == layer.kind || *current == layer.kind);
    let (kind, param_key) = match entry {
        Some((_, current, key)) => (current.to_string(), Some(*key)),
        None => {
            warn!(stage = %layer.name, kind = %layer.kind, "unknown legacy stage kind");
            complete = false;
            (layer.kind.clone(), None)
        }
    };

    let mut config = Value::Null;
    for (key, value) in &layer.extra {
        if Some(key.as_str()) == param_key {
            config = value.clone();
        } else {
            warn!(stage = %layer.name, field = %key, "dropping unrecognised legacy field");
            complete = false;
        }
    }

    let param_count = layer
        .blobs_lr
        .len()
        .max(layer.weight_decay.len())
        .max(layer.param.len());
    let params = (0..param_count)
        .map(|i| ParamSpec {
            name: layer.param.get(i).filter(|n| !n.is_empty()).cloned(),
            lr_mult: layer.blobs_lr.get(i).copied().unwrap_or(1.0),
            decay_mult: layer.weight_decay.get(i).copied().unwrap_or(1.0),
        })
        .collect();

    let stage = StageSpec {
        name: layer.name.clone(),
        kind,
        inputs: layer.bottom.clone(),
        outputs: layer.top.clone(),
        loss_weights: layer.loss_weight.clone(),
        params,
        propagate_down: layer.propagate_down.clone(),
        include: layer.include.clone(),
        exclude: layer.exclude.clone(),
        config,
    };
    (stage, complete)
}
