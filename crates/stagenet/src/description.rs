//! Declarative graph description.
//!
//! A [`NetDescription`] is plain data: an ordered stage list plus top-level inputs and the
//! state used to filter stages. Each [`StageSpec`] carries its kind-specific parameters as
//! an untyped JSON value that the stage decodes into its own config struct.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::context::Phase;
use crate::error::{NetError, NetResult};
use crate::upgrade;

fn one() -> f64 {
    1.0
}

/// A graph-level input tensor declared up front.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSpec {
    pub name: String,
    pub shape: Vec<i64>,
}

impl InputSpec {
    pub fn new(name: impl Into<String>, shape: &[i64]) -> Self {
        InputSpec {
            name: name.into(),
            shape: shape.to_vec(),
        }
    }
}

/// Per-parameter sharing name and learning multipliers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    /// Parameters with the same name across stages share values.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "one")]
    pub lr_mult: f64,
    #[serde(default = "one")]
    pub decay_mult: f64,
}

impl Default for ParamSpec {
    fn default() -> Self {
        ParamSpec {
            name: None,
            lr_mult: 1.0,
            decay_mult: 1.0,
        }
    }
}

impl ParamSpec {
    pub fn named(name: impl Into<String>) -> Self {
        ParamSpec {
            name: Some(name.into()),
            ..ParamSpec::default()
        }
    }

    pub fn with_lr_mult(mut self, lr_mult: f64) -> Self {
        self.lr_mult = lr_mult;
        self
    }

    pub fn with_decay_mult(mut self, decay_mult: f64) -> Self {
        self.decay_mult = decay_mult;
        self
    }
}

/// Runtime state that inclusion rules are evaluated against.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NetState {
    #[serde(default)]
    pub phase: Phase,
    #[serde(default)]
    pub level: i32,
    #[serde(default)]
    pub stages: Vec<String>,
}

/// One include/exclude predicate. Every field that is set must match.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StateRule {
    #[serde(default)]
    pub phase: Option<Phase>,
    #[serde(default)]
    pub min_level: Option<i32>,
    #[serde(default)]
    pub max_level: Option<i32>,
    /// Every listed stage label must be present in the state.
    #[serde(default)]
    pub stage: Vec<String>,
    /// None of the listed labels may be present in the state.
    #[serde(default)]
    pub not_stage: Vec<String>,
}

impl StateRule {
    pub fn phase(phase: Phase) -> Self {
        StateRule {
            phase: Some(phase),
            ..StateRule::default()
        }
    }
}

/// One stage of the description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Weight of each output in the total loss; missing entries default per stage kind.
    #[serde(default)]
    pub loss_weights: Vec<f64>,
    #[serde(default)]
    pub params: Vec<ParamSpec>,
    /// Per-input switch that can suppress gradient flow to that input.
    #[serde(default)]
    pub propagate_down: Vec<bool>,
    #[serde(default)]
    pub include: Vec<StateRule>,
    #[serde(default)]
    pub exclude: Vec<StateRule>,
    #[serde(default)]
    pub config: Value,
}

impl StageSpec {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        StageSpec {
            name: name.into(),
            kind: kind.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            loss_weights: Vec::new(),
            params: Vec::new(),
            propagate_down: Vec::new(),
            include: Vec::new(),
            exclude: Vec::new(),
            config: Value::Null,
        }
    }

    pub fn with_inputs<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.inputs = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_outputs<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.outputs = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_loss_weights(mut self, weights: &[f64]) -> Self {
        self.loss_weights = weights.to_vec();
        self
    }

    pub fn with_params(mut self, params: impl Into<Vec<ParamSpec>>) -> Self {
        self.params = params.into();
        self
    }

    pub fn with_propagate_down(mut self, flags: impl Into<Vec<bool>>) -> Self {
        self.propagate_down = flags.into();
        self
    }

    pub fn with_include(mut self, rule: StateRule) -> Self {
        self.include.push(rule);
        self
    }

    pub fn with_exclude(mut self, rule: StateRule) -> Self {
        self.exclude.push(rule);
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    /// Decodes the kind-specific parameter block. A missing block decodes as `{}` so the
    /// config type's serde defaults apply.
    pub fn decode_config<P: DeserializeOwned>(&self) -> NetResult<P> {
        let raw = if self.config.is_null() {
            Value::Object(serde_json::Map::new())
        } else {
            self.config.clone()
        };
        serde_json::from_value(raw).map_err(|source| NetError::Description {
            stage: self.name.clone(),
            source,
        })
    }
}

/// Complete graph description.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NetDescription {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub inputs: Vec<InputSpec>,
    /// Compute gradients for every stage that allows it, even without learnable params.
    #[serde(default)]
    pub force_backward: bool,
    /// Log per-stage value and gradient magnitudes during execution.
    #[serde(default)]
    pub debug_info: bool,
    #[serde(default)]
    pub state: NetState,
    #[serde(default)]
    pub stages: Vec<StageSpec>,
}

impl NetDescription {
    pub fn new(name: impl Into<String>) -> Self {
        NetDescription {
            name: name.into(),
            ..NetDescription::default()
        }
    }

    pub fn with_input(mut self, input: InputSpec) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn with_stage(mut self, stage: StageSpec) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.state.phase = phase;
        self
    }

    /// Parses a JSON description, upgrading the legacy dialect when detected.
    pub fn from_json_str(text: &str) -> NetResult<Self> {
        let value: Value = serde_json::from_str(text).map_err(|source| NetError::Description {
            stage: "<description>".to_string(),
            source,
        })?;
        Self::from_json_value(value)
    }

    pub fn from_json_value(value: Value) -> NetResult<Self> {
        if upgrade::net_needs_upgrade(&value) {
            let legacy: upgrade::LegacyNetDescription =
                serde_json::from_value(value).map_err(|source| NetError::Description {
                    stage: "<legacy description>".to_string(),
                    source,
                })?;
            let (current, complete) = upgrade::upgrade_legacy(&legacy);
            if !complete {
                warn!(
                    net = %current.name,
                    "legacy description upgraded with loss; review the resulting stages"
                );
            }
            return Ok(current);
        }
        serde_json::from_value(value).map_err(|source| NetError::Description {
            stage: "<description>".to_string(),
            source,
        })
    }

    pub fn to_json_string(&self) -> NetResult<String> {
        serde_json::to_string_pretty(self).map_err(|source| NetError::Description {
            stage: self.name.clone(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_fill_missing_fields() {
        let desc = NetDescription::from_json_str(
            r#"{"name":"tiny","stages":[{"name":"fc","kind":"InnerProduct","inputs":["x"],"outputs":["y"],"params":[{"name":"w"}]}]}"#,
        )
        .unwrap();
        let stage = &desc.stages[0];
        assert_eq!(stage.params[0].lr_mult, 1.0);
        assert_eq!(stage.params[0].decay_mult, 1.0);
        assert!(stage.config.is_null());
        assert_eq!(desc.state.phase, Phase::Train);
    }

    #[test]
    fn decode_config_reports_stage_name() {
        #[derive(Debug, Deserialize)]
        struct Cfg {
            #[allow(dead_code)]
            num_output: usize,
        }
        let spec = StageSpec::new("fc7", "InnerProduct").with_config(json!({"num_output": -1}));
        let err = spec.decode_config::<Cfg>().unwrap_err();
        assert!(err.to_string().contains("fc7"));
    }

    #[test]
    fn round_trips_through_json() {
        let desc = NetDescription::new("n")
            .with_input(InputSpec::new("data", &[2, 3]))
            .with_stage(
                StageSpec::new("relu", "ReLU")
                    .with_inputs(["data"])
                    .with_outputs(["data"])
                    .with_include(StateRule::phase(Phase::Test)),
            );
        let text = desc.to_json_string().unwrap();
        assert_eq!(NetDescription::from_json_str(&text).unwrap(), desc);
    }
}
