//! Build the model on the host and move it onto the execution device
//!
//! Steps, in order:
//! 1. size the vocabulary from the tokenizer
//! 2. construct every layer under a reduced-precision scope
//! 3. apply the shard weights non-strictly
//! 4. move parameters to the device
//! 5. move each key/value cache tensor to the device

use std::collections::BTreeSet;
use std::sync::Arc;

use candle_core::{DType, Device};
use mpllama_core::ProcessGroup;
use tracing::{debug, info, warn};

use crate::checkpoint::{CheckpointManifest, ShardWeights};
use crate::error::Result;
use crate::model::{ModelArgs, Transformer};
use crate::parallel::AllocContext;
use crate::precision::PrecisionGuard;
use crate::tokenizer::TextTokenizer;

#[derive(Debug, Clone)]
pub struct PlacementOptions {
    pub device: Device,
    /// Precision the model is constructed in
    pub precision: DType,
    pub max_seq_len: usize,
    pub max_batch_size: usize,
}

/// Outcome of a non-strict weight load.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: usize,
    /// Parameters absent from the shard; they keep their fresh values
    pub missing: Vec<String>,
    /// Shard tensors with no matching parameter
    pub unexpected: Vec<String>,
    /// Names present on both sides whose shapes differ
    pub mismatched: Vec<String>,
}

impl LoadReport {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty() && self.mismatched.is_empty()
    }
}

pub struct PlacedModel {
    pub model: Transformer,
    pub report: LoadReport,
}

/// Copy matching tensors into `model`, converting to each parameter's
/// dtype. Nothing is required to match.
pub fn load_state_dict(model: &mut Transformer, weights: &ShardWeights) -> Result<LoadReport> {
    let mut report = LoadReport::default();
    let mut known = BTreeSet::new();

    for (name, param) in model.named_parameters_mut() {
        match weights.get(&name) {
            Some(w) if w.dims() == param.dims() => {
                // pickled tensors may arrive as strided views
                *param = w
                    .to_dtype(param.dtype())?
                    .contiguous()?
                    .to_device(param.device())?;
                report.loaded += 1;
            }
            Some(w) => {
                warn!(
                    "Skipping {}: checkpoint shape {:?} but parameter shape {:?}",
                    name,
                    w.dims(),
                    param.dims()
                );
                report.mismatched.push(name.clone());
            }
            None => report.missing.push(name.clone()),
        }
        known.insert(name);
    }

    report.unexpected = weights
        .keys()
        .filter(|k| !known.contains(*k))
        .cloned()
        .collect();
    report.unexpected.sort();

    if !report.missing.is_empty() {
        warn!("{} parameters missing from checkpoint", report.missing.len());
    }
    if !report.unexpected.is_empty() {
        debug!("Ignoring {} unexpected checkpoint tensors", report.unexpected.len());
    }
    Ok(report)
}

/// Construct, load and place the model for this rank.
///
/// Records the tokenizer's vocabulary size into `manifest`.
pub fn place(
    manifest: &mut CheckpointManifest,
    weights: Option<&ShardWeights>,
    tokenizer: &dyn TextTokenizer,
    options: &PlacementOptions,
    group: Arc<ProcessGroup>,
) -> Result<PlacedModel> {
    manifest.vocab_size = Some(tokenizer.n_words());
    let args = ModelArgs::from_manifest(
        manifest,
        options.max_seq_len,
        options.max_batch_size,
        group.world_size(),
    )?;
    if args.quant {
        warn!("Quantized checkpoints are loaded as dense weights");
    }

    let mut model = {
        let guard = PrecisionGuard::acquire(options.precision);
        let ctx = AllocContext::new(guard.dtype(), Device::Cpu);
        Transformer::new(&args, &ctx, group)?
    };

    let report = match weights {
        Some(weights) => {
            let report = load_state_dict(&mut model, weights)?;
            info!(
                "Applied {} of {} checkpoint tensors",
                report.loaded,
                weights.len()
            );
            report
        }
        None => LoadReport::default(),
    };

    model.to_device(&options.device)?;
    model.migrate_cache(&options.device)?;
    debug!("Model placed on {:?}", options.device);

    Ok(PlacedModel { model, report })
}
