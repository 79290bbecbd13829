//! Configuration types for RunVault
//!
//! This module defines the pipeline configuration and its validation rules.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Largest document the store accepts, in bytes.
pub const MAX_STORE_DOCUMENT_SIZE: usize = 16_000_000;

/// Upper bound for `embedder_size + page_size`. A page can grow to one
/// embedder dump past the page threshold, so the sum must leave headroom
/// below the store's document limit.
pub const MAX_PAGE_BUDGET: usize = 15_000_000;

/// Smallest accepted page buffer size.
pub const MIN_EMBEDDER_SIZE: usize = 1_000;

/// Smallest accepted page size threshold.
pub const MIN_PAGE_SIZE: usize = 1_000;

/// There is no throughput gain past this many workers.
pub const MAX_THREADS: usize = 10;

/// Ingestion pipeline configuration
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Workers per document class (validated; one worker owns each class)
    pub num_threads: usize,
    /// Capacity of each per-class queue
    pub queue_size: usize,
    /// Maximum page buffer size in bytes
    pub embedder_size: usize,
    /// Page size threshold in bytes; pages at or above it are closed
    pub page_size: usize,
    /// Longest time buffered documents may wait before a forced flush
    pub max_insert_time_ms: u64,
    /// Queue read timeout; an idle read triggers a flush
    pub poll_interval_ms: u64,
    /// Count aggregator wake interval
    pub count_interval_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            num_threads: 1,
            queue_size: 20,
            embedder_size: 1_000_000,
            page_size: 5_000_000,
            max_insert_time_ms: 10_000,
            poll_interval_ms: 500,
            count_interval_ms: 5_000,
        }
    }
}

impl PipelineConfig {
    /// Check every option against its allowed range.
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_THREADS).contains(&self.num_threads) {
            return Err(Error::configuration(format!(
                "num_threads must be between 1 and {MAX_THREADS} inclusive, got {}",
                self.num_threads
            )));
        }
        if self.queue_size == 0 {
            return Err(Error::configuration("queue_size must be >= 1"));
        }
        validate_embedder_size(self.embedder_size)?;
        if self.page_size < MIN_PAGE_SIZE {
            return Err(Error::configuration(format!(
                "page_size must be >= {MIN_PAGE_SIZE}, got {}",
                self.page_size
            )));
        }
        if self.embedder_size + self.page_size > MAX_PAGE_BUDGET {
            return Err(Error::configuration(format!(
                "embedder_size: {} + page_size: {} is greater than {MAX_PAGE_BUDGET}",
                self.embedder_size, self.page_size
            )));
        }
        for (name, value) in [
            ("max_insert_time_ms", self.max_insert_time_ms),
            ("poll_interval_ms", self.poll_interval_ms),
            ("count_interval_ms", self.count_interval_ms),
        ] {
            if value == 0 {
                return Err(Error::configuration(format!("{name} must be >= 1")));
            }
        }
        Ok(())
    }

    pub fn max_insert_time(&self) -> Duration {
        Duration::from_millis(self.max_insert_time_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn count_interval(&self) -> Duration {
        Duration::from_millis(self.count_interval_ms)
    }
}

/// Validate a page buffer size on its own; the embedder checks this at
/// construction even when built outside a pipeline.
pub fn validate_embedder_size(size: usize) -> Result<()> {
    if (MIN_EMBEDDER_SIZE..=MAX_PAGE_BUDGET).contains(&size) {
        Ok(())
    } else {
        Err(Error::configuration(format!(
            "invalid embedder size {size}, must be between {MIN_EMBEDDER_SIZE} and \
             {MAX_PAGE_BUDGET} inclusive"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        PipelineConfig::default().validate().unwrap();
    }

    #[test]
    fn test_thread_bounds() {
        for num_threads in [0, 11] {
            let config = PipelineConfig {
                num_threads,
                ..Default::default()
            };
            assert!(config.validate().unwrap_err().is_configuration());
        }
        let config = PipelineConfig {
            num_threads: 10,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_page_budget() {
        let config = PipelineConfig {
            embedder_size: 10_000_000,
            page_size: 5_000_001,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = PipelineConfig {
            embedder_size: 10_000_000,
            page_size: 5_000_000,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_small_sizes_rejected() {
        let config = PipelineConfig {
            page_size: 999,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        assert!(validate_embedder_size(999).is_err());
        assert!(validate_embedder_size(15_000_001).is_err());
        assert!(validate_embedder_size(1_000).is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: PipelineConfig = toml::from_str("queue_size = 64\npage_size = 2000").unwrap();
        assert_eq!(config.queue_size, 64);
        assert_eq!(config.page_size, 2000);
        assert_eq!(config.embedder_size, 1_000_000);
        assert_eq!(config.poll_interval(), Duration::from_millis(500));
    }
}
