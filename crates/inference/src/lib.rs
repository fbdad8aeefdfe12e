//! Model-parallel LLaMA inference
//!
//! Everything one rank does between topology resolution and reporting:
//! - **Shard loading**: pick this rank's weight file and the shared manifest
//! - **Placement**: build the model in reduced precision, apply weights
//!   non-strictly, move parameters and the key/value cache to the device
//! - **Orchestration**: one warmup generation plus N timed generations
//!
//! ## Pipeline
//!
//! ```text
//! Topology ──► checkpoint::load ──► placement::place ──► GenerationOrchestrator
//!              (weights, manifest)   (Transformer on device)  (results, LatencyRecord)
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use mpllama_inference::{checkpoint, placement, GenerationOrchestrator, LlamaGenerator};
//!
//! let (weights, mut manifest) = checkpoint::load(ckpt_dir, &topology, &defaults)?;
//! let tokenizer = HfTokenizer::from_file(tokenizer_path)?;
//! let placed = placement::place(&mut manifest, weights.as_ref(), &tokenizer, &options, group)?;
//!
//! let generator = LlamaGenerator::new(placed.model, tokenizer, device, topology.seed);
//! let run = GenerationOrchestrator::new(generator).generate_run(&request, 3)?;
//! ```

pub mod checkpoint;
pub mod error;
pub mod generation;
pub mod latency;
pub mod model;
pub mod orchestrator;
pub mod parallel;
pub mod placement;
pub mod precision;
pub mod tokenizer;

pub use checkpoint::{ArchitectureDefaults, CheckpointManifest, ShardFile, ShardFormat, ShardWeights};
pub use error::{InferenceError, Result};
pub use generation::{GenerationOutput, GenerationRequest, LlamaGenerator, TextGenerator};
pub use latency::{LatencyEntry, LatencyRecord, LatencySummary};
pub use model::{ModelArgs, Transformer};
pub use orchestrator::{GenerationOrchestrator, GenerationRun};
pub use placement::{LoadReport, PlacedModel, PlacementOptions};
pub use precision::{PrecisionGuard, DEFAULT_PRECISION};
pub use tokenizer::{HfTokenizer, TextTokenizer};
