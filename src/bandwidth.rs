use std::collections::VecDeque;

const MAX_SAMPLES: usize = 20;

/// Rolling-window throughput tracker. Samples are (bytes, elapsed ms) pairs
/// from observed chunk transfers; the window is a fixed-size FIFO.
#[derive(Debug, Default)]
pub struct BandwidthEstimator {
    samples: VecDeque<(u64, u64)>,
}

impl BandwidthEstimator {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(MAX_SAMPLES),
        }
    }

    pub fn add_sample(&mut self, bytes: u64, duration_ms: u64) {
        self.samples.push_back((bytes, duration_ms));
        if self.samples.len() > MAX_SAMPLES {
            self.samples.pop_front();
        }
    }

    /// Estimated throughput in kbps; 0 when there is nothing to go on.
    pub fn estimate(&self) -> u32 {
        if self.samples.is_empty() {
            return 0;
        }

        let total_bytes: u64 = self.samples.iter().map(|(b, _)| b).sum();
        let total_duration: u64 = self.samples.iter().map(|(_, d)| d).sum();

        if total_duration == 0 {
            return 0;
        }

        // bytes per ms -> kbps
        let bytes_per_ms = total_bytes as f64 / total_duration as f64;
        (bytes_per_ms * 8.0).round() as u32
    }

    /// Whether the estimate covers `required_kbps` with a 20% safety margin.
    pub fn can_handle(&self, required_kbps: u32) -> bool {
        self.estimate() as f64 >= required_kbps as f64 * 1.2
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}
