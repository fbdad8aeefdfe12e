//! Process environment toggles.
//!
//! Two groups of variables are recognised: the accelerator switches that
//! select device class and launch mode, and the rank variables written by the
//! launcher for every worker it spawns.

use std::fmt;
use std::str::FromStr;

use crate::error::{CoreError, Result};

pub const USE_CUDA: &str = "USE_CUDA";
pub const USE_XLA: &str = "USE_XLA";
pub const USE_TORCH_DYNAMO: &str = "USE_TORCH_DYNAMO";
pub const GPU_NUM_DEVICES: &str = "GPU_NUM_DEVICES";
pub const CUDA_VISIBLE_DEVICES: &str = "CUDA_VISIBLE_DEVICES";

pub const RANK: &str = "MPLLAMA_RANK";
pub const WORLD_SIZE: &str = "MPLLAMA_WORLD_SIZE";
pub const MODEL_PARALLEL_SIZE: &str = "MPLLAMA_MODEL_PARALLEL_SIZE";
pub const LOCAL_RANK: &str = "MPLLAMA_LOCAL_RANK";
pub const MASTER_ADDR: &str = "MPLLAMA_MASTER_ADDR";

pub const DEFAULT_MASTER_ADDR: &str = "127.0.0.1:29500";

/// Accelerator switches read once at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcceleratorEnv {
    /// Run on CUDA devices with half precision
    pub use_cuda: bool,
    /// Take the distributed multi-process path
    pub use_xla: bool,
    /// Informational only
    pub use_torch_dynamo: bool,
    /// Device count hint, 0 when unset
    pub gpu_num_devices: usize,
    /// Raw `CUDA_VISIBLE_DEVICES`, used to count devices when no hint is given
    pub cuda_visible_devices: Option<String>,
}

impl AcceleratorEnv {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            use_cuda: parse_flag(&lookup, USE_CUDA, false)?,
            use_xla: parse_flag(&lookup, USE_XLA, false)?,
            use_torch_dynamo: parse_flag(&lookup, USE_TORCH_DYNAMO, true)?,
            gpu_num_devices: parse_or(&lookup, GPU_NUM_DEVICES, 0)?,
            cuda_visible_devices: lookup(CUDA_VISIBLE_DEVICES).filter(|v| !v.trim().is_empty()),
        })
    }
}

impl fmt::Display for AcceleratorEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "USE_XLA: {}, USE_CUDA: {}, USE_TORCH_DYNAMO: {}, NUM_GPU(S): {}",
            self.use_xla, self.use_cuda, self.use_torch_dynamo, self.gpu_num_devices
        )
    }
}

/// Rank variables of a worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankEnv {
    pub rank: usize,
    pub world_size: usize,
    pub model_parallel_size: usize,
    pub local_rank: usize,
    pub master_addr: String,
}

impl RankEnv {
    /// Returns `None` when this process was not started as a worker.
    pub fn from_env() -> Result<Option<Self>> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Option<Self>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let Some(raw_rank) = lookup(RANK) else {
            return Ok(None);
        };
        let rank = parse_value(RANK, &raw_rank)?;
        let world_size = match lookup(WORLD_SIZE) {
            Some(raw) => parse_value(WORLD_SIZE, &raw)?,
            None => {
                return Err(CoreError::InvalidTopology(format!(
                    "{RANK} is set but {WORLD_SIZE} is missing"
                )))
            }
        };
        let model_parallel_size = parse_or(&lookup, MODEL_PARALLEL_SIZE, world_size)?;
        let local_rank = parse_or(&lookup, LOCAL_RANK, rank)?;
        let master_addr = lookup(MASTER_ADDR).unwrap_or_else(|| DEFAULT_MASTER_ADDR.to_string());

        let env = Self {
            rank,
            world_size,
            model_parallel_size,
            local_rank,
            master_addr,
        };
        env.validate()?;
        Ok(Some(env))
    }

    pub fn validate(&self) -> Result<()> {
        if self.world_size == 0 {
            return Err(CoreError::InvalidTopology("world size must be >= 1".into()));
        }
        if self.rank >= self.world_size {
            return Err(CoreError::InvalidTopology(format!(
                "rank {} >= world size {}",
                self.rank, self.world_size
            )));
        }
        if self.model_parallel_size == 0 || self.world_size % self.model_parallel_size != 0 {
            return Err(CoreError::InvalidTopology(format!(
                "model parallel size {} does not divide world size {}",
                self.model_parallel_size, self.world_size
            )));
        }
        Ok(())
    }
}

fn parse_flag<F>(lookup: &F, name: &str, default: bool) -> Result<bool>
where
    F: Fn(&str) -> Option<String>,
{
    let value: u8 = parse_or(lookup, name, u8::from(default))?;
    Ok(value != 0)
}

fn parse_or<F, T>(lookup: &F, name: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(name) {
        Some(raw) => parse_value(name, &raw),
        None => Ok(default),
    }
}

fn parse_value<T: FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.trim().parse().map_err(|_| CoreError::InvalidEnv {
        name: name.to_string(),
        value: raw.to_string(),
    })
}
