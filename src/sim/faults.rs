use serde::{Deserialize, Serialize};

// Per-transaction fault rates seen on long, badly terminated installations
const DROP_REPLY_PERCENT: f32 = 2.0;
const CORRUPT_TIMING_PERCENT: f32 = 1.0;
const STUCK_ACTIVE_PERCENT: f32 = 0.2;

const DEFAULT_SEED: u64 = 0x1234_5678_9ABC_DEF0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LineFault {
    /// Gear answers but the reply never reaches the receiver.
    DropReply,
    /// One reply half-bit is stretched out of tolerance.
    CorruptTiming,
    /// Line is held driven while we transmit.
    StuckActive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineFaultConfig {
    pub enabled: bool,
    pub drop_reply_percent: f32,
    pub corrupt_timing_percent: f32,
    pub stuck_active_percent: f32,
    pub seed: u64,
}

impl Default for LineFaultConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            drop_reply_percent: DROP_REPLY_PERCENT,
            corrupt_timing_percent: CORRUPT_TIMING_PERCENT,
            stuck_active_percent: STUCK_ACTIVE_PERCENT,
            seed: DEFAULT_SEED,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LineFaultStats {
    pub transactions: u32,
    pub replies_dropped: u32,
    pub timings_corrupted: u32,
    pub stuck_events: u32,
}

/// Probabilistic line fault source with a deterministic PRNG.
#[derive(Debug)]
pub struct LineFaultInjector {
    config: LineFaultConfig,
    stats: LineFaultStats,
    rng_state: u64,
}

impl LineFaultInjector {
    pub fn new(config: LineFaultConfig) -> Self {
        Self {
            rng_state: config.seed,
            config,
            stats: LineFaultStats::default(),
        }
    }

    pub fn disabled() -> Self {
        Self::new(LineFaultConfig::default())
    }

    /// Pick at most one fault for the next transaction.
    pub fn roll(&mut self) -> Option<LineFault> {
        if !self.config.enabled {
            return None;
        }
        self.stats.transactions += 1;

        if self.chance(self.config.stuck_active_percent) {
            self.stats.stuck_events += 1;
            return Some(LineFault::StuckActive);
        }
        if self.chance(self.config.corrupt_timing_percent) {
            self.stats.timings_corrupted += 1;
            return Some(LineFault::CorruptTiming);
        }
        if self.chance(self.config.drop_reply_percent) {
            self.stats.replies_dropped += 1;
            return Some(LineFault::DropReply);
        }
        None
    }

    pub fn stats(&self) -> &LineFaultStats {
        &self.stats
    }

    pub fn config(&self) -> &LineFaultConfig {
        &self.config
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.config.enabled = enabled;
    }

    fn chance(&mut self, percent: f32) -> bool {
        if percent <= 0.0 {
            return false;
        }
        self.random_float() < percent / 100.0
    }

    // LCG, Knuth's MMIX constants
    fn next_random(&mut self) -> u64 {
        self.rng_state = self
            .rng_state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.rng_state
    }

    /// Uniform in [0, 1).
    fn random_float(&mut self) -> f32 {
        ((self.next_random() >> 40) as f32) / ((1u64 << 24) as f32)
    }
}

impl Default for LineFaultInjector {
    fn default() -> Self {
        Self::disabled()
    }
}
