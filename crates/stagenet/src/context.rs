//! Immutable execution settings handed to graph construction and to stages.

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::device::DeviceRef;
use crate::error::{NetError, NetResult};
use crate::tensor::Element;

/// Whether the graph is being run for training or evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Train,
    Test,
}

/// Which compute entry point stages are dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ExecutionMode {
    #[default]
    Host,
    Device,
}

/// Phase, seed, execution mode and device, fixed for the lifetime of a graph.
#[derive(Debug, Clone)]
pub struct ExecutionContext<T: Element> {
    phase: Phase,
    seed: u64,
    mode: ExecutionMode,
    device: Option<DeviceRef<T>>,
}

impl<T: Element> ExecutionContext<T> {
    /// Host-only context.
    pub fn host(phase: Phase, seed: u64) -> Self {
        ExecutionContext {
            phase,
            seed,
            mode: ExecutionMode::Host,
            device: None,
        }
    }

    /// Context whose tensors carry `device`; stages still run their host entry points
    /// unless the mode is switched with [`with_mode`](Self::with_mode).
    pub fn with_device(phase: Phase, seed: u64, device: DeviceRef<T>) -> Self {
        ExecutionContext {
            phase,
            seed,
            mode: ExecutionMode::Host,
            device: Some(device),
        }
    }

    /// Selects the execution mode. Device mode without a device is rejected up front.
    pub fn with_mode(mut self, mode: ExecutionMode) -> NetResult<Self> {
        if mode == ExecutionMode::Device && self.device.is_none() {
            return Err(NetError::no_device(
                "device execution requested but the context carries no device",
            ));
        }
        self.mode = mode;
        Ok(self)
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn device(&self) -> Option<&DeviceRef<T>> {
        self.device.as_ref()
    }

    /// Static capability flag callers branch on before requesting device work.
    pub fn has_device(&self) -> bool {
        self.device.is_some()
    }

    /// Deterministic generator for the stage at `index`.
    pub fn stage_rng(&self, index: usize) -> StdRng {
        StdRng::seed_from_u64(self.seed.wrapping_add(index as u64))
    }
}

impl<T: Element> Default for ExecutionContext<T> {
    fn default() -> Self {
        ExecutionContext::host(Phase::Train, 1701)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_mode_requires_device() {
        let ctx = ExecutionContext::<f32>::host(Phase::Test, 7);
        assert!(matches!(
            ctx.with_mode(ExecutionMode::Device),
            Err(NetError::NoDevice(_))
        ));
    }

    #[test]
    fn stage_rngs_are_reproducible() {
        use rand::Rng;
        let ctx = ExecutionContext::<f32>::host(Phase::Train, 42);
        let a: f32 = ctx.stage_rng(3).gen();
        let b: f32 = ctx.stage_rng(3).gen();
        let c: f32 = ctx.stage_rng(4).gen();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
