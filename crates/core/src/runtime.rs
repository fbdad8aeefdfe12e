//! Distributed runtime state of one process.

use std::net::SocketAddr;
use std::sync::Arc;

use candle_core::Device;
use tracing::info;

use crate::collective::ProcessGroup;
use crate::device::select_device;
use crate::env::{AcceleratorEnv, RankEnv};
use crate::error::{CoreError, Result};

#[derive(Debug)]
struct Membership {
    global_rank: usize,
    global_world_size: usize,
    model_parallel_size: usize,
    device: Device,
    group: Arc<ProcessGroup>,
}

/// The process-group membership and device handle of this process.
///
/// Created uninitialized; [`DistributedRuntime::init`] or
/// [`DistributedRuntime::single`] must run before the topology is resolved.
#[derive(Debug)]
pub struct DistributedRuntime {
    membership: Option<Membership>,
}

impl DistributedRuntime {
    pub fn uninitialized() -> Self {
        Self { membership: None }
    }

    /// One process, one device.
    pub fn single(device: Device) -> Self {
        Self {
            membership: Some(Membership {
                global_rank: 0,
                global_world_size: 1,
                model_parallel_size: 1,
                device,
                group: Arc::new(ProcessGroup::single()),
            }),
        }
    }

    /// Join the model-parallel group described by `rank_env`, or run alone
    /// when no rank environment is present.
    ///
    /// Processes `[g * M, (g + 1) * M)` form model-parallel group `g`; group
    /// `g` rendezvous on the master port shifted by `g`.
    pub fn init(rank_env: Option<&RankEnv>, accel: &AcceleratorEnv) -> Result<Self> {
        let Some(rank_env) = rank_env else {
            let device = select_device(accel, 0)?;
            return Ok(Self::single(device));
        };
        rank_env.validate()?;

        let mp = rank_env.model_parallel_size;
        let group_index = rank_env.rank / mp;
        let group_rank = rank_env.rank % mp;
        let addr = group_address(&rank_env.master_addr, group_index)?;

        let device = select_device(accel, rank_env.local_rank)?;
        info!(
            "Rank {}/{} joining model-parallel group {} as rank {}/{}",
            rank_env.rank, rank_env.world_size, group_index, group_rank, mp
        );
        let group = ProcessGroup::connect(group_rank, mp, &addr)?;

        Ok(Self {
            membership: Some(Membership {
                global_rank: rank_env.rank,
                global_world_size: rank_env.world_size,
                model_parallel_size: mp,
                device,
                group: Arc::new(group),
            }),
        })
    }

    pub fn is_initialized(&self) -> bool {
        self.membership.is_some()
    }

    fn membership(&self) -> Result<&Membership> {
        self.membership.as_ref().ok_or(CoreError::RuntimeNotInitialized)
    }

    pub fn device(&self) -> Result<&Device> {
        Ok(&self.membership()?.device)
    }

    /// The model-parallel group this process belongs to.
    pub fn group(&self) -> Result<Arc<ProcessGroup>> {
        Ok(Arc::clone(&self.membership()?.group))
    }

    pub fn global_rank(&self) -> Result<usize> {
        Ok(self.membership()?.global_rank)
    }

    pub fn global_world_size(&self) -> Result<usize> {
        Ok(self.membership()?.global_world_size)
    }

    pub fn model_parallel_rank(&self) -> Result<usize> {
        let m = self.membership()?;
        Ok(m.global_rank % m.model_parallel_size)
    }

    pub fn model_parallel_world_size(&self) -> Result<usize> {
        Ok(self.membership()?.model_parallel_size)
    }
}

fn group_address(master_addr: &str, group_index: usize) -> Result<String> {
    if group_index == 0 {
        return Ok(master_addr.to_string());
    }
    let mut addr: SocketAddr = master_addr.parse().map_err(|_| {
        CoreError::InvalidTopology(format!("master address {master_addr:?} is not host:port"))
    })?;
    let port = usize::from(addr.port()) + group_index;
    let port = u16::try_from(port).map_err(|_| {
        CoreError::InvalidTopology(format!("no port left for model-parallel group {group_index}"))
    })?;
    addr.set_port(port);
    Ok(addr.to_string())
}
