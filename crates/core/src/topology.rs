//! Rank/world-size resolution and seed synchronisation.

use tracing::{debug, info};

use crate::error::{CoreError, Result};
use crate::runtime::DistributedRuntime;

/// Seed shared by every rank of a run.
pub const GENERATION_SEED: u64 = 1;

/// This process's position in its model-parallel group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Topology {
    /// `0..world_size`
    pub rank: usize,
    /// Processes in the model-parallel group
    pub world_size: usize,
    /// Sampling seed, identical on every rank
    pub seed: u64,
}

impl Topology {
    pub fn is_root(&self) -> bool {
        self.rank == 0
    }
}

/// Read rank and world size from the initialized runtime and synchronise
/// the generation seed across the group.
///
/// Rank 0's seed is broadcast to all ranks, then the device RNG is seeded.
/// Fails with [`CoreError::RuntimeNotInitialized`] when the runtime was
/// never initialized.
pub fn resolve(runtime: &DistributedRuntime) -> Result<Topology> {
    let rank = runtime.model_parallel_rank()?;
    let world_size = runtime.model_parallel_world_size()?;
    if rank >= world_size {
        return Err(CoreError::InvalidTopology(format!(
            "rank {rank} >= world size {world_size}"
        )));
    }

    let group = runtime.group()?;
    let seed = group.broadcast_u64(GENERATION_SEED)?;

    let device = runtime.device()?;
    if !device.is_cpu() {
        device.set_seed(seed)?;
        debug!("Seeded device RNG with {}", seed);
    }

    info!("Resolved topology: rank {} of {}, seed {}", rank, world_size, seed);
    Ok(Topology {
        rank,
        world_size,
        seed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_resolve_requires_initialized_runtime() {
        let runtime = DistributedRuntime::uninitialized();
        assert!(matches!(
            resolve(&runtime),
            Err(CoreError::RuntimeNotInitialized)
        ));
    }

    #[test]
    fn test_resolve_single_process() {
        let runtime = DistributedRuntime::single(Device::Cpu);
        let topology = resolve(&runtime).unwrap();
        assert_eq!(
            topology,
            Topology {
                rank: 0,
                world_size: 1,
                seed: GENERATION_SEED
            }
        );
        assert!(topology.is_root());
    }

    #[test]
    fn test_resolve_is_stable() {
        let runtime = DistributedRuntime::single(Device::Cpu);
        assert_eq!(resolve(&runtime).unwrap(), resolve(&runtime).unwrap());
    }
}
