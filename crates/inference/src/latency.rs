use std::time::Duration;

use serde::Serialize;

/// Timing of one generation call
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencyEntry {
    /// Wall-clock time of the whole call (s)
    pub call_latency_secs: f64,
    /// Call latency divided by the tokens it generated (s)
    pub per_token_latency_secs: f64,
    /// Newly generated tokens, summed over the batch
    pub tokens_generated: usize,
}

impl LatencyEntry {
    pub fn new(elapsed: Duration, tokens_generated: usize) -> Self {
        let call_latency_secs = elapsed.as_secs_f64();
        Self {
            call_latency_secs,
            per_token_latency_secs: call_latency_secs / tokens_generated.max(1) as f64,
            tokens_generated,
        }
    }
}

/// Append-only timings of every generation call of a run. Entry 0 is the
/// warmup call.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LatencyRecord {
    entries: Vec<LatencyEntry>,
}

impl LatencyRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: LatencyEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[LatencyEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Means over every entry after the warmup.
    pub fn summary(&self) -> LatencySummary {
        let timed = self.entries.get(1..).unwrap_or_default();
        if timed.is_empty() {
            return LatencySummary::default();
        }
        let n = timed.len() as f64;
        let call: f64 = timed.iter().map(|e| e.call_latency_secs).sum();
        let per_token: f64 = timed.iter().map(|e| e.per_token_latency_secs).sum();
        LatencySummary {
            timed_calls: timed.len(),
            mean_latency_secs: call / n,
            mean_per_token_latency_ms: per_token / n * 1000.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    pub timed_calls: usize,
    pub mean_latency_secs: f64,
    pub mean_per_token_latency_ms: f64,
}
