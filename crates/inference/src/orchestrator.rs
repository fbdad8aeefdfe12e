//! Warmup plus timed generation runs
//!
//! ```text
//! call 0        warmup, texts discarded, timing kept at record[0]
//! call 1..=n    timed, texts returned, timing at record[1..=n]
//! ```

use std::time::Instant;

use tracing::{debug, info};

use crate::error::Result;
use crate::generation::{GenerationRequest, TextGenerator};
use crate::latency::{LatencyEntry, LatencyRecord, LatencySummary};

/// Texts of every timed call with the timings of the run that produced them.
#[derive(Debug, Clone)]
pub struct GenerationRun {
    /// One batch per timed call, each in prompt order
    pub results: Vec<Vec<String>>,
    /// Every call of this run, warmup first
    pub latency: LatencyRecord,
    pub summary: LatencySummary,
}

pub struct GenerationOrchestrator<G> {
    generator: G,
}

impl<G: TextGenerator> GenerationOrchestrator<G> {
    pub fn new(generator: G) -> Self {
        Self { generator }
    }

    pub fn generator(&self) -> &G {
        &self.generator
    }

    pub fn into_inner(self) -> G {
        self.generator
    }

    /// One warmup call followed by `n_times` timed calls with the same
    /// request. Each run owns its record.
    pub fn generate_run(&mut self, request: &GenerationRequest, n_times: usize) -> Result<GenerationRun> {
        request.validate()?;
        let mut latency = LatencyRecord::new();

        info!("Warmup generation over {} prompt(s)", request.prompts.len());
        self.timed_call(request, &mut latency)?;

        let mut results = Vec::with_capacity(n_times);
        for i in 0..n_times {
            let texts = self.timed_call(request, &mut latency)?;
            debug!("Timed call {}/{} done", i + 1, n_times);
            results.push(texts);
        }

        let summary = latency.summary();
        Ok(GenerationRun {
            results,
            latency,
            summary,
        })
    }

    fn timed_call(&mut self, request: &GenerationRequest, latency: &mut LatencyRecord) -> Result<Vec<String>> {
        let start = Instant::now();
        let output = self.generator.generate(request)?;
        let entry = LatencyEntry::new(start.elapsed(), output.tokens_generated);
        debug!(
            "Generated {} tokens in {:.3}s",
            entry.tokens_generated, entry.call_latency_secs
        );
        latency.push(entry);
        Ok(output.texts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InferenceError;
    use crate::generation::GenerationOutput;

    /// Echoes prompts with a call counter.
    #[derive(Default)]
    struct CountingGenerator {
        calls: usize,
        fail_on: Option<usize>,
    }

    impl TextGenerator for CountingGenerator {
        fn generate(&mut self, request: &GenerationRequest) -> Result<GenerationOutput> {
            let call = self.calls;
            self.calls += 1;
            if self.fail_on == Some(call) {
                return Err(InferenceError::InvalidRequest("device lost".into()));
            }
            Ok(GenerationOutput {
                texts: request.prompts.iter().map(|p| format!("{p} #{call}")).collect(),
                tokens_generated: request.max_new_tokens * request.prompts.len(),
            })
        }
    }

    fn request(prompts: &[&str]) -> GenerationRequest {
        GenerationRequest {
            prompts: prompts.iter().map(|p| p.to_string()).collect(),
            max_new_tokens: 256,
            temperature: 0.8,
            top_p: 0.95,
        }
    }

    #[test]
    fn test_warmup_plus_three_timed_calls() {
        let mut orchestrator = GenerationOrchestrator::new(CountingGenerator::default());
        let run = orchestrator
            .generate_run(&request(&["I believe the meaning of life is"]), 3)
            .unwrap();

        assert_eq!(orchestrator.generator().calls, 4);
        assert_eq!(run.results.len(), 3);
        assert!(run.results.iter().all(|batch| batch.len() == 1));
        assert_eq!(run.latency.len(), 4);
        assert_eq!(run.summary.timed_calls, 3);
        assert!(run
            .latency
            .entries()
            .iter()
            .all(|e| e.tokens_generated == 256));
    }

    #[test]
    fn test_warmup_results_never_returned() {
        let mut orchestrator = GenerationOrchestrator::new(CountingGenerator::default());
        let run = orchestrator.generate_run(&request(&["a", "b"]), 2).unwrap();
        assert_eq!(
            run.results,
            vec![
                vec!["a #1".to_string(), "b #1".to_string()],
                vec!["a #2".to_string(), "b #2".to_string()],
            ]
        );
    }

    #[test]
    fn test_zero_timed_calls() {
        let mut orchestrator = GenerationOrchestrator::new(CountingGenerator::default());
        let run = orchestrator.generate_run(&request(&["a"]), 0).unwrap();
        assert!(run.results.is_empty());
        assert_eq!(run.latency.len(), 1);
        assert_eq!(run.summary, LatencySummary::default());
    }

    #[test]
    fn test_generator_error_propagates() {
        let mut orchestrator = GenerationOrchestrator::new(CountingGenerator {
            calls: 0,
            fail_on: Some(2),
        });
        assert!(orchestrator.generate_run(&request(&["a"]), 3).is_err());
    }

    #[test]
    fn test_each_run_owns_its_record() {
        let mut orchestrator = GenerationOrchestrator::new(CountingGenerator::default());
        let first = orchestrator.generate_run(&request(&["a"]), 3).unwrap();
        let second = orchestrator.generate_run(&request(&["a"]), 1).unwrap();
        assert_eq!(first.latency.len(), 4);
        assert_eq!(second.latency.len(), 2);
        assert_eq!(orchestrator.generator().calls, 6);
    }

    #[test]
    fn test_invalid_request_makes_no_calls() {
        let mut orchestrator = GenerationOrchestrator::new(CountingGenerator::default());
        assert!(orchestrator.generate_run(&request(&[]), 3).is_err());
        assert_eq!(orchestrator.into_inner().calls, 0);
    }
}
