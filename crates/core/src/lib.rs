pub mod collective;
pub mod device;
pub mod env;
pub mod error;
pub mod runtime;
pub mod topology;

pub use collective::{ProcessGroup, SerializedTensor};
pub use env::{AcceleratorEnv, RankEnv};
pub use error::{CoreError, Result};
pub use runtime::DistributedRuntime;
pub use topology::{resolve, Topology, GENERATION_SEED};
