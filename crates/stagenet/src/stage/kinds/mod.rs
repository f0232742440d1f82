//! Built-in stage kinds.

pub mod concat;
pub mod convolution;
pub mod dummy_data;
pub mod euclidean_loss;
pub mod inner_product;
pub mod memory_data;
pub mod mvn;
pub mod relu;
pub mod slice;
pub mod softmax_loss;
pub mod split;

pub use concat::{Concat, ConcatConfig};
pub use convolution::{Convolution, ConvolutionConfig};
pub use dummy_data::{DummyData, DummyDataConfig};
pub use euclidean_loss::EuclideanLoss;
pub use inner_product::{InnerProduct, InnerProductConfig};
pub use memory_data::{MemoryData, MemoryDataConfig};
pub use mvn::{Mvn, MvnConfig};
pub use relu::{Relu, ReluConfig};
pub use slice::{Slice, SliceConfig};
pub use softmax_loss::{SoftmaxWithLoss, SoftmaxLossConfig};
pub use split::Split;
