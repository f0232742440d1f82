pub mod context;
pub mod description;
pub mod device;
mod env;
pub mod error;
pub mod filler;
pub mod graph;
pub mod stage;
pub mod tensor;
pub mod upgrade;

pub use context::{ExecutionContext, ExecutionMode, Phase};
pub use description::{InputSpec, NetDescription, NetState, ParamSpec, StageSpec, StateRule};
pub use device::{Device, DeviceAllocation, DeviceRef};
pub use error::{NetError, NetResult};
pub use filler::{FillerSpec, VarianceNorm};
pub use graph::{Graph, ParamEntry};
pub use stage::{Arity, Propagation, SetupContext, Stage, StageRegistry};
pub use tensor::{BufferHead, DType, Element, FloatElement, Shape, SyncedBuffer, Tensor};
