use tracing::info;

use crate::config::MemoryConfig;
use crate::engine::EngineStats;

/// Decides when memory pressure warrants an explicit trim.
///
/// A trim is requested once live engine memory is above the threshold and
/// has grown by at least `growth_ratio` since the previous trim. The
/// high-water mark is kept for reporting.
#[derive(Debug, Clone)]
pub struct MemoryWatchdog {
    threshold_bytes: usize,
    growth_ratio: f64,
    last_trim_bytes: usize,
    high_water: usize,
    trims: u64,
}

impl MemoryWatchdog {
    pub fn new(config: &MemoryConfig) -> Self {
        MemoryWatchdog {
            threshold_bytes: config.watchdog_threshold_bytes,
            growth_ratio: config.watchdog_growth_ratio.max(1.0),
            last_trim_bytes: 0,
            high_water: 0,
            trims: 0,
        }
    }

    /// Observes current engine usage; returns true when the caller should
    /// trim the pool and collect.
    pub fn check(&mut self, stats: &EngineStats) -> bool {
        let live = stats.live_bytes;
        self.high_water = self.high_water.max(live).max(stats.peak_bytes);
        if live <= self.threshold_bytes {
            return false;
        }
        let grown = self.last_trim_bytes == 0 || live as f64 >= self.last_trim_bytes as f64 * self.growth_ratio;
        if grown {
            info!(
                live_bytes = live,
                threshold = self.threshold_bytes,
                last_trim = self.last_trim_bytes,
                "memory above threshold, requesting trim"
            );
        }
        grown
    }

    /// Records the usage measured right after a trim.
    pub fn record_trim(&mut self, stats: &EngineStats) {
        self.last_trim_bytes = stats.live_bytes.max(1);
        self.trims += 1;
    }

    pub fn high_water(&self) -> usize {
        self.high_water
    }

    pub fn trims(&self) -> u64 {
        self.trims
    }
}
