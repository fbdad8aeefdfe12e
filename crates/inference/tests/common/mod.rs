use std::collections::HashMap;
use std::fs;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use mpllama_inference::{Result, TextTokenizer};

pub const BOS: u32 = 1;
pub const EOS: u32 = 2;

/// One id per byte, offset past the special tokens.
pub struct ByteTokenizer;

impl TextTokenizer for ByteTokenizer {
    fn n_words(&self) -> usize {
        260
    }

    fn bos_id(&self) -> Option<u32> {
        Some(BOS)
    }

    fn eos_id(&self) -> Option<u32> {
        Some(EOS)
    }

    fn encode(&self, text: &str, bos: bool) -> Result<Vec<u32>> {
        let mut ids: Vec<u32> = bos.then_some(BOS).into_iter().collect();
        ids.extend(text.bytes().map(|b| b as u32 + 4));
        Ok(ids)
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        let bytes: Vec<u8> = ids
            .iter()
            .filter(|&&id| id >= 4)
            .map(|&id| (id - 4) as u8)
            .collect();
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Write `shards` rank-named safetensors files plus `params.json`. Every
/// shard carries the norm weight at 0.5 so loads are observable.
pub fn write_checkpoint(dir: &Path, shards: usize, dim: usize) {
    for rank in 0..shards {
        let norm = Tensor::full(0.5f32, dim, &Device::Cpu).unwrap();
        let stray = Tensor::zeros(4, DType::F32, &Device::Cpu).unwrap();
        let weights = HashMap::from([
            ("norm.weight".to_string(), norm),
            ("rope.freqs".to_string(), stray),
        ]);
        candle_core::safetensors::save(
            &weights,
            dir.join(format!("consolidated.{rank:02}.safetensors")),
        )
        .unwrap();
    }
    fs::write(
        dir.join("params.json"),
        format!(r#"{{"dim": {dim}, "multiple_of": 16, "n_heads": 4, "n_layers": 2, "norm_eps": 1e-06, "vocab_size": -1}}"#),
    )
    .unwrap();
}
