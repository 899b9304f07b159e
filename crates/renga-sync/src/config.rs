//! Session configuration, loaded from RON.
//!
//! ```ron
//! (
//!     auto_persist_secs: 30,
//!     breaker: (large_batch_threshold: 50, trip_after: 3),
//!     retry_delay_ms: 1200,
//!     dedup_retention_secs: 0,
//!     categories: ["clocks", "traits", "journal"],
//! )
//! ```
//!
//! Every field is optional; missing ones take the defaults above.

use std::path::Path;
use std::time::Duration;

use renga_log::BreakerConfig;
use renga_types::Category;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("RON parse error: {0}")]
    Ron(#[from] ron::error::SpannedError),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Seconds between authority saves; 0 disables periodic persistence.
    pub auto_persist_secs: u64,
    pub breaker: BreakerConfig,
    /// Pause between spending a retry and the automatic reroll.
    pub retry_delay_ms: u64,
    /// How long applied command ids are remembered; 0 keeps them all.
    pub dedup_retention_secs: u64,
    /// Replicated categories, in replication order.
    pub categories: Vec<Category>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            auto_persist_secs: 30,
            breaker: BreakerConfig::default(),
            retry_delay_ms: 1200,
            dedup_retention_secs: 0,
            categories: Category::defaults(),
        }
    }
}

impl SyncConfig {
    pub fn from_ron_str(text: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig = ron::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_ron_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.breaker.trip_after == 0 {
            return Err(ConfigError::Invalid("breaker.trip_after must be at least 1".into()));
        }
        if self.categories.is_empty() {
            return Err(ConfigError::Invalid("at least one category is required".into()));
        }
        for (i, category) in self.categories.iter().enumerate() {
            if category.as_str().trim().is_empty() {
                return Err(ConfigError::Invalid(format!("category {i} has an empty name")));
            }
            if self.categories[..i].contains(category) {
                return Err(ConfigError::Invalid(format!("category {category} listed twice")));
            }
        }
        Ok(())
    }

    /// `None` when periodic persistence is off.
    pub fn auto_persist_interval(&self) -> Option<Duration> {
        (self.auto_persist_secs > 0).then(|| Duration::from_secs(self.auto_persist_secs))
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Retention window in milliseconds, or `None` to keep every id.
    pub fn dedup_retention_ms(&self) -> Option<u64> {
        (self.dedup_retention_secs > 0).then(|| self.dedup_retention_secs.saturating_mul(1000))
    }
}
