use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use mpllama_core::AcceleratorEnv;

mod config;
mod error;
mod launcher;
mod pipeline;
mod report;

use config::{RunArgs, RunConfig};

#[derive(Parser)]
#[command(name = "mpllama")]
#[command(about = "Model-parallel LLaMA generation with warmup and latency measurement", long_about = None)]
struct Cli {
    #[command(flatten)]
    run: RunArgs,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let env = AcceleratorEnv::from_env()?;
    let config = RunConfig::from(cli.run);

    if let Err(e) = launcher::launch(config, env).await {
        error!("{}", e);
        std::process::exit(1);
    }
    Ok(())
}
