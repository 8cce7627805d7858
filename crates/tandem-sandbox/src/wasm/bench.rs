//! Latency collection for comparing direct and bridged calls.

use std::time::{Duration, Instant};

/// Collects per-call latencies.
#[derive(Debug, Default, Clone)]
pub struct WasmBenchmark {
    label: String,
    samples: Vec<Duration>,
}

impl WasmBenchmark {
    /// Create an empty collector.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            samples: Vec::new(),
        }
    }

    /// Label shown in the summary.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Record one sample.
    pub fn record(&mut self, elapsed: Duration) {
        self.samples.push(elapsed);
    }

    /// Run `f`, record its latency and pass its output through.
    pub fn time<T>(&mut self, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let out = f();
        self.record(start.elapsed());
        out
    }

    /// Number of samples.
    pub fn count(&self) -> usize {
        self.samples.len()
    }

    /// Mean latency.
    pub fn mean(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        self.samples.iter().sum::<Duration>() / self.samples.len() as u32
    }

    /// Nearest-rank percentile; `p` is clamped to 0..=100.
    pub fn percentile(&self, p: usize) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_unstable();
        let idx = (p.min(100) * sorted.len() / 100).min(sorted.len() - 1);
        sorted[idx]
    }

    /// Fastest sample.
    pub fn min(&self) -> Duration {
        self.samples.iter().copied().min().unwrap_or_default()
    }

    /// Slowest sample.
    pub fn max(&self) -> Duration {
        self.samples.iter().copied().max().unwrap_or_default()
    }

    /// One-line report.
    pub fn summary(&self) -> String {
        format!(
            "{}: n={} min={:?} mean={:?} p50={:?} p99={:?} max={:?}",
            self.label,
            self.count(),
            self.min(),
            self.mean(),
            self.percentile(50),
            self.percentile(99),
            self.max()
        )
    }
}
