use std::io::{self, Write};

use mpllama_core::{AcceleratorEnv, Topology};
use mpllama_inference::GenerationRun;

use crate::config::RunConfig;

const SEPARATOR: &str = "==================================";

/// Result and latency printer. Only rank 0 writes to stdout; every other
/// rank writes into a sink.
pub struct Reporter<W> {
    out: W,
}

impl Reporter<Box<dyn Write + Send>> {
    pub fn for_rank(topology: &Topology) -> Self {
        Self::for_rank_with(topology, io::stdout())
    }

    /// `root_out` receives the report on rank 0 and is never written to on
    /// any other rank.
    pub fn for_rank_with<W: Write + Send + 'static>(topology: &Topology, root_out: W) -> Self {
        let out: Box<dyn Write + Send> = if topology.is_root() {
            Box::new(root_out)
        } else {
            Box::new(io::sink())
        };
        Self::new(out)
    }
}

impl<W: Write> Reporter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    pub fn report(
        &mut self,
        run: &GenerationRun,
        env: &AcceleratorEnv,
        config: &RunConfig,
    ) -> io::Result<()> {
        for result in run.results.iter().flatten() {
            writeln!(self.out, "{result}")?;
            writeln!(self.out, "\n{SEPARATOR}\n")?;
        }
        writeln!(self.out, "XLA:GPU ENV INFO:")?;
        writeln!(self.out, "{env}")?;
        writeln!(
            self.out,
            "Run LLaMA model in {} for {} prompts with {} max batch size(s)",
            config.ckpt_dir_display(),
            config.n_times,
            config.max_batch_size
        )?;
        writeln!(self.out, "\t- mean latency: {}(s)", run.summary.mean_latency_secs)?;
        writeln!(
            self.out,
            "\t- mean per-token latency: {}(ms/token)",
            run.summary.mean_per_token_latency_ms
        )?;
        self.out.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunArgs;
    use clap::Parser;
    use mpllama_inference::{LatencyRecord, LatencySummary};
    use std::sync::{Arc, Mutex};

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        run: RunArgs,
    }

    fn config() -> RunConfig {
        TestCli::try_parse_from(["mpllama", "--tokenizer-path", "t.json", "--ckpt-dir", "7B"])
            .unwrap()
            .run
            .into()
    }

    fn run() -> GenerationRun {
        GenerationRun {
            results: vec![vec!["first".to_string()], vec!["second".to_string()]],
            latency: LatencyRecord::new(),
            summary: LatencySummary {
                timed_calls: 2,
                mean_latency_secs: 1.5,
                mean_per_token_latency_ms: 12.5,
            },
        }
    }

    #[test]
    fn test_report_layout() {
        let mut reporter = Reporter::new(Vec::new());
        reporter
            .report(&run(), &AcceleratorEnv::default(), &config())
            .unwrap();
        let text = String::from_utf8(reporter.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[0], "first");
        assert_eq!(lines[2], SEPARATOR);
        assert_eq!(lines[4], "second");
        assert!(text.contains("USE_XLA: false, USE_CUDA: false, USE_TORCH_DYNAMO: false, NUM_GPU(S): 0"));
        assert!(text.contains("Run LLaMA model in 7B for 3 prompts with 32 max batch size(s)"));
        assert!(text.contains("\t- mean latency: 1.5(s)"));
        assert!(text.ends_with("\t- mean per-token latency: 12.5(ms/token)\n"));
    }

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuffer {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    fn topology(rank: usize) -> Topology {
        Topology {
            rank,
            world_size: 2,
            seed: 1,
        }
    }

    #[test]
    fn test_non_root_rank_is_silent() {
        let stdout = SharedBuffer::default();
        let mut reporter = Reporter::for_rank_with(&topology(1), stdout.clone());
        reporter
            .report(&run(), &AcceleratorEnv::default(), &config())
            .unwrap();
        assert!(stdout.contents().is_empty());
    }

    #[test]
    fn test_root_rank_writes_full_report() {
        let stdout = SharedBuffer::default();
        let mut reporter = Reporter::for_rank_with(&topology(0), stdout.clone());
        reporter
            .report(&run(), &AcceleratorEnv::default(), &config())
            .unwrap();

        let text = stdout.contents();
        assert!(text.starts_with("first\n"));
        assert_eq!(text.matches(SEPARATOR).count(), 2);
        assert!(text.contains("XLA:GPU ENV INFO:"));
        assert!(text.ends_with("\t- mean per-token latency: 12.5(ms/token)\n"));
    }
}
