//! Phase/level/label based stage selection.

use tracing::debug;

use crate::description::{NetDescription, NetState, StateRule};
use crate::error::{ensure_graph, NetResult};

/// Whether `state` satisfies every predicate `rule` sets.
pub fn state_meets_rule(state: &NetState, rule: &StateRule) -> bool {
    if rule.phase.is_some_and(|phase| phase != state.phase) {
        return false;
    }
    if rule.min_level.is_some_and(|min| state.level < min) {
        return false;
    }
    if rule.max_level.is_some_and(|max| state.level > max) {
        return false;
    }
    let has = |label: &String| state.stages.iter().any(|s| s == label);
    rule.stage.iter().all(has) && !rule.not_stage.iter().any(has)
}

/// Returns a copy of `desc` holding only the stages `state` selects.
///
/// A stage with include rules is kept when any of them matches; a stage without include
/// rules is kept unless one of its exclude rules matches.
pub fn filter_net(desc: &NetDescription, state: &NetState) -> NetResult<NetDescription> {
    let mut filtered = NetDescription {
        stages: Vec::with_capacity(desc.stages.len()),
        ..desc.clone()
    };
    for stage in &desc.stages {
        ensure_graph!(
            stage.include.is_empty() || stage.exclude.is_empty(),
            stage.name.as_str(),
            "specify either include rules or exclude rules, not both"
        );
        let keep = if stage.include.is_empty() {
            !stage.exclude.iter().any(|rule| state_meets_rule(state, rule))
        } else {
            stage.include.iter().any(|rule| state_meets_rule(state, rule))
        };
        if keep {
            filtered.stages.push(stage.clone());
        } else {
            debug!(stage = %stage.name, phase = ?state.phase, "stage filtered out");
        }
    }
    Ok(filtered)
}
