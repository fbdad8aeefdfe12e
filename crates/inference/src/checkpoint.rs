//! Rank-local checkpoint loading
//!
//! A checkpoint directory holds one weight file per model-parallel rank plus
//! a `params.json` manifest shared by every rank:
//!
//! ```text
//! ckpt/
//!   consolidated.00.pth
//!   consolidated.01.pth
//!   params.json
//! ```
//!
//! Each shard file embeds its rank in its name (the last run of digits in
//! the file stem). Files are sorted by name and the file at position `i`
//! must embed rank `i`, so the positional binding is checked instead of
//! assumed.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use mpllama_core::Topology;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{InferenceError, Result};

pub const MANIFEST_FILE: &str = "params.json";

/// Named host tensors of one rank's shard.
pub type ShardWeights = HashMap<String, Tensor>;

fn default_multiple_of() -> usize {
    256
}

fn default_norm_eps() -> f64 {
    1e-5
}

/// Architecture hyperparameters shared by every rank.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    #[serde(default)]
    pub quant: bool,
    #[serde(default = "default_multiple_of")]
    pub multiple_of: usize,
    #[serde(default = "default_norm_eps")]
    pub norm_eps: f64,
    /// Filled in from the tokenizer, never read from disk
    #[serde(skip_deserializing)]
    pub vocab_size: Option<usize>,
}

impl CheckpointManifest {
    pub fn read(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE);
        if !path.is_file() {
            return Err(InferenceError::ManifestNotFound(path));
        }
        let file = fs::File::open(&path)?;
        let manifest: Self = serde_json::from_reader(file)
            .map_err(|e| InferenceError::InvalidManifest(format!("{}: {}", path.display(), e)))?;
        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> Result<()> {
        if self.dim == 0 || self.n_layers == 0 || self.n_heads == 0 || self.multiple_of == 0 {
            return Err(InferenceError::InvalidManifest(format!(
                "dim, n_layers, n_heads and multiple_of must be positive: {self:?}"
            )));
        }
        Ok(())
    }
}

/// Hyperparameters used when no checkpoint directory is given.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchitectureDefaults {
    pub dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub quant: bool,
}

impl Default for ArchitectureDefaults {
    fn default() -> Self {
        Self {
            dim: 4096,
            n_layers: 32,
            n_heads: 32,
            quant: false,
        }
    }
}

impl From<&ArchitectureDefaults> for CheckpointManifest {
    fn from(d: &ArchitectureDefaults) -> Self {
        Self {
            dim: d.dim,
            n_layers: d.n_layers,
            n_heads: d.n_heads,
            quant: d.quant,
            multiple_of: default_multiple_of(),
            norm_eps: default_norm_eps(),
            vocab_size: None,
        }
    }
}

/// On-disk encoding of a shard file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardFormat {
    /// PyTorch pickle archive (`.pth`, `.pt`)
    Pickle,
    Safetensors,
}

impl ShardFormat {
    fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "pth" | "pt" => Some(Self::Pickle),
            "safetensors" => Some(Self::Safetensors),
            _ => None,
        }
    }
}

/// One rank's weight file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardFile {
    pub path: PathBuf,
    pub rank: usize,
    pub format: ShardFormat,
}

impl ShardFile {
    /// Read every tensor of the shard into host memory.
    pub fn load(&self) -> Result<ShardWeights> {
        let weights = match self.format {
            ShardFormat::Pickle => candle_core::pickle::read_all(&self.path)?
                .into_iter()
                .collect(),
            ShardFormat::Safetensors => candle_core::safetensors::load(&self.path, &Device::Cpu)?,
        };
        Ok(weights)
    }
}

/// Rank embedded in a shard name: the last run of ASCII digits in the stem.
pub fn embedded_rank(path: &Path) -> Option<usize> {
    let stem = path.file_stem()?.to_str()?;
    let end = stem.rfind(|c: char| c.is_ascii_digit())? + 1;
    let start = stem[..end]
        .rfind(|c: char| !c.is_ascii_digit())
        .map_or(0, |i| i + 1);
    stem[start..end].parse().ok()
}

/// List the shard files of `dir` in name order.
///
/// A directory holding both encodings is read as safetensors only.
pub fn discover_shards(dir: &Path) -> Result<Vec<ShardFile>> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && ShardFormat::from_path(p).is_some())
        .collect();
    let has_safetensors = paths
        .iter()
        .any(|p| ShardFormat::from_path(p) == Some(ShardFormat::Safetensors));
    if has_safetensors {
        let before = paths.len();
        paths.retain(|p| ShardFormat::from_path(p) == Some(ShardFormat::Safetensors));
        if paths.len() < before {
            debug!("Ignoring {} pickle shards next to safetensors", before - paths.len());
        }
    }
    paths.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

    paths
        .into_iter()
        .map(|path| {
            let rank =
                embedded_rank(&path).ok_or_else(|| InferenceError::ShardMissingRank(path.clone()))?;
            let format = ShardFormat::from_path(&path)
                .ok_or_else(|| InferenceError::UnsupportedFormat(path.clone()))?;
            Ok(ShardFile { path, rank, format })
        })
        .collect()
}

/// Pick this rank's shard after checking the directory matches the topology.
pub fn select_shard(shards: &[ShardFile], topology: &Topology) -> Result<ShardFile> {
    if shards.len() != topology.world_size {
        return Err(InferenceError::ShardCountMismatch {
            found: shards.len(),
            world_size: topology.world_size,
        });
    }
    for (position, shard) in shards.iter().enumerate() {
        if shard.rank != position {
            return Err(InferenceError::ShardRankMismatch {
                path: shard.path.clone(),
                embedded: shard.rank,
                position,
            });
        }
    }
    Ok(shards[topology.rank].clone())
}

/// Load this rank's shard and the shared manifest.
///
/// Without a checkpoint directory no weights are loaded and the manifest is
/// built from `defaults`.
pub fn load(
    checkpoint_dir: Option<&Path>,
    topology: &Topology,
    defaults: &ArchitectureDefaults,
) -> Result<(Option<ShardWeights>, CheckpointManifest)> {
    let Some(dir) = checkpoint_dir else {
        debug!("No checkpoint directory, using explicit hyperparameters");
        return Ok((None, CheckpointManifest::from(defaults)));
    };

    let shards = discover_shards(dir)?;
    info!("Found {} shard files in {}", shards.len(), dir.display());
    let shard = select_shard(&shards, topology)?;

    info!("Rank {} loading {}", topology.rank, shard.path.display());
    let weights = shard.load()?;
    debug!("Loaded {} tensors", weights.len());

    let manifest = CheckpointManifest::read(dir)?;
    Ok((Some(weights), manifest))
}
