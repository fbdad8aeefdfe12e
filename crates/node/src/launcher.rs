//! In-process run or one re-executed worker per visible device.
//!
//! Workers are the current binary with the same arguments plus the rank
//! variables:
//!
//! | Variable | Value |
//! |----------|-------|
//! | `MPLLAMA_RANK` | 0..N |
//! | `MPLLAMA_WORLD_SIZE` | N |
//! | `MPLLAMA_LOCAL_RANK` | same as rank |
//! | `MPLLAMA_MASTER_ADDR` | inherited, else `127.0.0.1:29500` |

use std::ffi::OsString;
use std::path::Path;
use std::process::ExitStatus;

use futures::future::join_all;
use mpllama_core::device::visible_device_count;
use mpllama_core::env::{self as rank_vars, DEFAULT_MASTER_ADDR};
use mpllama_core::{AcceleratorEnv, RankEnv};
use tokio::process::Command;
use tracing::{debug, error, info};

use crate::config::RunConfig;
use crate::error::{NodeError, Result};
use crate::pipeline;

pub async fn launch(config: RunConfig, env: AcceleratorEnv) -> Result<()> {
    let rank_env = RankEnv::from_env()?;
    if should_spawn(&config, &env, rank_env.as_ref()) {
        let world_size = visible_device_count(&env);
        let master_addr = std::env::var(rank_vars::MASTER_ADDR)
            .unwrap_or_else(|_| DEFAULT_MASTER_ADDR.to_string());
        return spawn_workers(world_size, &master_addr).await;
    }

    tokio::task::spawn_blocking(move || pipeline::run(&config, &env, rank_env.as_ref())).await?
}

/// Fan out only on the distributed path, and never from inside a worker.
pub fn should_spawn(config: &RunConfig, env: &AcceleratorEnv, rank_env: Option<&RankEnv>) -> bool {
    config.use_multiprocess && env.use_xla && rank_env.is_none()
}

pub fn worker_env(rank: usize, world_size: usize, master_addr: &str) -> Vec<(&'static str, String)> {
    vec![
        (rank_vars::RANK, rank.to_string()),
        (rank_vars::WORLD_SIZE, world_size.to_string()),
        (rank_vars::LOCAL_RANK, rank.to_string()),
        (rank_vars::MASTER_ADDR, master_addr.to_string()),
    ]
}

async fn spawn_workers(world_size: usize, master_addr: &str) -> Result<()> {
    let exe = std::env::current_exe()?;
    let args: Vec<OsString> = std::env::args_os().skip(1).collect();
    info!("Spawning {} worker processes, rendezvous at {}", world_size, master_addr);

    let workers = (0..world_size).map(|rank| {
        let exe = &exe;
        let args = &args;
        async move {
            let status = run_worker(exe, args, rank, world_size, master_addr).await;
            (rank, status)
        }
    });

    check_workers(join_all(workers).await)
}

/// Log every child's outcome on its own; the first failing rank makes the
/// launcher fail.
fn check_workers(outcomes: Vec<(usize, std::io::Result<ExitStatus>)>) -> Result<()> {
    let mut first_failed = None;
    for (rank, outcome) in outcomes {
        match outcome {
            Ok(status) if status.success() => {
                debug!("Worker rank {} exited cleanly", rank);
                continue;
            }
            Ok(status) => error!("Worker rank {} exited with {}", rank, status),
            Err(e) => error!("Failed to run worker rank {}: {}", rank, e),
        }
        first_failed.get_or_insert(rank);
    }

    match first_failed {
        Some(rank) => Err(NodeError::WorkerFailed { rank }),
        None => Ok(()),
    }
}

async fn run_worker(
    exe: &Path,
    args: &[OsString],
    rank: usize,
    world_size: usize,
    master_addr: &str,
) -> std::io::Result<ExitStatus> {
    Command::new(exe)
        .args(args)
        .envs(worker_env(rank, world_size, master_addr))
        .kill_on_drop(true)
        .status()
        .await
}
