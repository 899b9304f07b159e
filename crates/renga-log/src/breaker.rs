//! Runaway-broadcast circuit breaker.
//!
//! Counts consecutive outward diffs larger than `large_batch_threshold`. When
//! the count reaches `trip_after`, the breaker trips and every later diff is
//! suppressed until [`CircuitBreaker::reset`] is called. There is no automatic
//! recovery.
//!
//! ```text
//!   sizes:   60   70   55   20   5
//!   gate:    Open Open Trip Supp Supp   (T = 50, K = 3)
//! ```
//!
//! The batch that trips the breaker is still sent; suppression starts with the
//! next one.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Breaker thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Batches strictly larger than this count as large (T).
    pub large_batch_threshold: usize,
    /// Consecutive large batches before tripping (K).
    pub trip_after: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            large_batch_threshold: 50,
            trip_after: 3,
        }
    }
}

/// What to do with one outward diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// Send it.
    Open,
    /// Send it; the breaker tripped on this batch and will suppress the next.
    Tripping { consecutive: u32 },
    /// Do not send it: the breaker is tripped.
    Suppressed,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    consecutive_large: u32,
    tripped: bool,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            consecutive_large: 0,
            tripped: false,
        }
    }

    pub fn config(&self) -> BreakerConfig {
        self.config
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped
    }

    pub fn consecutive_large(&self) -> u32 {
        self.consecutive_large
    }

    /// Feed one outward diff size through the breaker.
    pub fn observe(&mut self, batch_size: usize) -> Gate {
        if self.tripped {
            return Gate::Suppressed;
        }
        if batch_size <= self.config.large_batch_threshold {
            self.consecutive_large = 0;
            return Gate::Open;
        }

        self.consecutive_large += 1;
        if self.consecutive_large >= self.config.trip_after {
            self.tripped = true;
            warn!(
                batch_size,
                consecutive = self.consecutive_large,
                threshold = self.config.large_batch_threshold,
                "circuit breaker tripped; outward sync suspended"
            );
            return Gate::Tripping {
                consecutive: self.consecutive_large,
            };
        }
        Gate::Open
    }

    /// Manually clear a trip and the counter.
    pub fn reset(&mut self) {
        if self.tripped {
            info!("circuit breaker reset");
        }
        self.tripped = false;
        self.consecutive_large = 0;
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}
