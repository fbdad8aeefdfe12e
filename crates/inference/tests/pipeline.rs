mod common;

use std::sync::Arc;

use candle_core::{DType, Device};
use common::{write_checkpoint, ByteTokenizer};
use mpllama_core::{ProcessGroup, Topology};
use mpllama_inference::checkpoint;
use mpllama_inference::placement::{self, PlacementOptions};
use mpllama_inference::{
    ArchitectureDefaults, GenerationOrchestrator, GenerationRequest, InferenceError, LlamaGenerator,
};
use tempfile::TempDir;

fn single() -> Topology {
    Topology {
        rank: 0,
        world_size: 1,
        seed: 1,
    }
}

fn options() -> PlacementOptions {
    PlacementOptions {
        device: Device::Cpu,
        precision: DType::F32,
        max_seq_len: 64,
        max_batch_size: 4,
    }
}

#[test]
fn test_checkpoint_to_timed_generation() {
    let dir = TempDir::new().unwrap();
    write_checkpoint(dir.path(), 1, 32);

    let (weights, mut manifest) =
        checkpoint::load(Some(dir.path()), &single(), &ArchitectureDefaults::default()).unwrap();
    let weights = weights.unwrap();
    assert_eq!(manifest.vocab_size, None);

    let placed = placement::place(
        &mut manifest,
        Some(&weights),
        &ByteTokenizer,
        &options(),
        Arc::new(ProcessGroup::single()),
    )
    .unwrap();
    assert_eq!(manifest.vocab_size, Some(260));
    assert_eq!(placed.report.loaded, 1);
    assert_eq!(placed.report.unexpected, vec!["rope.freqs".to_string()]);

    let model = &placed.model;
    assert!(model.parameters().all(|p| p.device().is_cpu()));
    assert!(model
        .cache_kvs
        .iter()
        .all(|(k, v)| k.device().is_cpu() && v.device().is_cpu()));
    let (_, norm) = model
        .named_parameters()
        .into_iter()
        .find(|(name, _)| name == "norm.weight")
        .unwrap();
    assert_eq!(norm.to_vec1::<f32>().unwrap(), vec![0.5; 32]);

    let generator = LlamaGenerator::new(placed.model, ByteTokenizer, Device::Cpu, 1);
    let mut orchestrator = GenerationOrchestrator::new(generator);
    let request = GenerationRequest {
        prompts: vec!["I believe the meaning of life is".to_string()],
        max_new_tokens: 8,
        temperature: 0.8,
        top_p: 0.95,
    };
    let run = orchestrator.generate_run(&request, 3).unwrap();

    assert_eq!(run.results.len(), 3);
    for batch in &run.results {
        assert_eq!(batch.len(), 1);
        assert!(batch[0].starts_with("I believe the meaning of life is"));
    }
    assert_eq!(run.latency.len(), 4);
    assert_eq!(run.summary.timed_calls, 3);
    assert!(run.summary.mean_latency_secs > 0.0);
}

#[test]
fn test_shard_count_mismatch_is_fatal_before_construction() {
    let dir = TempDir::new().unwrap();
    write_checkpoint(dir.path(), 2, 32);
    let topology = Topology {
        rank: 0,
        world_size: 4,
        seed: 1,
    };

    let err = checkpoint::load(Some(dir.path()), &topology, &ArchitectureDefaults::default())
        .unwrap_err();
    assert!(matches!(
        err,
        InferenceError::ShardCountMismatch {
            found: 2,
            world_size: 4
        }
    ));
}

#[test]
fn test_explicit_hyperparameters_without_checkpoint() {
    let defaults = ArchitectureDefaults {
        dim: 256,
        n_layers: 4,
        n_heads: 4,
        quant: false,
    };
    let (weights, mut manifest) = checkpoint::load(None, &single(), &defaults).unwrap();
    assert!(weights.is_none());
    assert_eq!(manifest.vocab_size, None);

    let options = PlacementOptions {
        max_seq_len: 16,
        max_batch_size: 1,
        ..options()
    };
    let placed = placement::place(
        &mut manifest,
        None,
        &ByteTokenizer,
        &options,
        Arc::new(ProcessGroup::single()),
    )
    .unwrap();

    assert_eq!(manifest.vocab_size, Some(260));
    let args = placed.model.args();
    assert_eq!((args.dim, args.n_layers, args.n_heads), (256, 4, 4));
    assert_eq!(args.vocab_size, 260);
    assert_eq!(placed.model.cache_kvs.len(), 4);
}
