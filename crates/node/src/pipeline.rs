//! One process's run: topology, shard, placement, timed generation, report.

use std::io::{self, Write};
use std::time::Instant;

use mpllama_core::{topology, AcceleratorEnv, DistributedRuntime, RankEnv};
use mpllama_inference::placement::{self, PlacementOptions};
use mpllama_inference::{checkpoint, GenerationOrchestrator, HfTokenizer, LlamaGenerator};
use tracing::{debug, info, info_span};

use crate::config::RunConfig;
use crate::error::Result;
use crate::report::Reporter;

pub fn run(config: &RunConfig, env: &AcceleratorEnv, rank_env: Option<&RankEnv>) -> Result<()> {
    run_with(config, env, rank_env, io::stdout())
}

/// [`run`] with the report written to `stdout` on rank 0.
pub fn run_with<W: Write + Send + 'static>(
    config: &RunConfig,
    env: &AcceleratorEnv,
    rank_env: Option<&RankEnv>,
    stdout: W,
) -> Result<()> {
    let runtime = DistributedRuntime::init(rank_env, env)?;
    let topology = topology::resolve(&runtime)?;
    let span = info_span!("rank", rank = topology.rank);
    let _enter = span.enter();

    let mut reporter = Reporter::for_rank_with(&topology, stdout);
    let device = runtime.device()?.clone();

    let start = Instant::now();
    info!("Loading");
    let (weights, mut manifest) =
        checkpoint::load(config.ckpt_dir.as_deref(), &topology, &config.architecture)?;
    let tokenizer = HfTokenizer::from_file(&config.tokenizer_path)?;
    let options = PlacementOptions {
        device: device.clone(),
        precision: config.precision(env),
        max_seq_len: config.max_seq_len,
        max_batch_size: config.max_batch_size,
    };
    let placed = placement::place(
        &mut manifest,
        weights.as_ref(),
        &tokenizer,
        &options,
        runtime.group()?,
    )?;
    drop(weights);
    debug!(
        "{} tensors loaded, {} missing, {} unexpected",
        placed.report.loaded,
        placed.report.missing.len(),
        placed.report.unexpected.len()
    );
    info!("Loaded in {:.2} seconds", start.elapsed().as_secs_f64());

    let generator = LlamaGenerator::new(placed.model, tokenizer, device, topology.seed);
    let mut orchestrator = GenerationOrchestrator::new(generator);
    let run = orchestrator.generate_run(&config.request(), config.n_times)?;

    reporter.report(&run, env, config)?;
    Ok(())
}
