//! Automatic transaction generator hooks
//!
//! The generator itself is an external collaborator driving StartTransaction
//! and StopTransaction through the engine; the runtime only starts and stops
//! it around the station lifecycle. `NoopGenerator` stands in for stations
//! without ATG configuration.

use crate::template::AtgConfiguration;
use anyhow::Result;
use async_trait::async_trait;
use ocsim_types::ConnectorId;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;

/// A driver producing synthetic transactions.
#[async_trait]
pub trait TransactionGenerator: Send + Sync {
    /// Begin generating on the given connectors, or all of them.
    async fn start(&self, connector_ids: Option<&[ConnectorId]>) -> Result<()>;

    /// Stop generating on the given connectors, or all of them.
    async fn stop(&self, connector_ids: Option<&[ConnectorId]>) -> Result<()>;

    fn started(&self) -> bool;
}

/// Generator that does nothing, for stations without ATG configuration.
#[derive(Debug, Default)]
pub struct NoopGenerator {
    started: AtomicBool,
}

impl NoopGenerator {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransactionGenerator for NoopGenerator {
    async fn start(&self, _connector_ids: Option<&[ConnectorId]>) -> Result<()> {
        debug!("noop transaction generator started");
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self, _connector_ids: Option<&[ConnectorId]>) -> Result<()> {
        debug!("noop transaction generator stopped");
        self.started.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

/// Draw a transaction duration from the configured range.
pub fn draw_duration(config: &AtgConfiguration) -> Duration {
    let (lo, hi) = ordered(config.min_duration, config.max_duration);
    Duration::from_secs(rand::thread_rng().gen_range(lo..=hi))
}

/// Draw the idle delay between two transactions.
pub fn draw_delay(config: &AtgConfiguration) -> Duration {
    let (lo, hi) = ordered(
        config.min_delay_between_two_transactions,
        config.max_delay_between_two_transactions,
    );
    Duration::from_secs(rand::thread_rng().gen_range(lo..=hi))
}

/// Whether this cycle should start a transaction.
pub fn draw_start(config: &AtgConfiguration) -> bool {
    rand::thread_rng().gen_range(0..100) < config.probability_of_start.min(100)
}

fn ordered(a: u64, b: u64) -> (u64, u64) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_tracks_started_flag() {
        let generator = NoopGenerator::new();
        assert!(!generator.started());
        generator.start(None).await.unwrap();
        assert!(generator.started());
        generator.stop(Some(&[1, 2])).await.unwrap();
        assert!(!generator.started());
    }

    #[test]
    fn draws_stay_in_range() {
        let config = AtgConfiguration {
            min_duration: 10,
            max_duration: 20,
            min_delay_between_two_transactions: 5,
            max_delay_between_two_transactions: 6,
            ..Default::default()
        };
        for _ in 0..100 {
            let duration = draw_duration(&config).as_secs();
            assert!((10..=20).contains(&duration));
            let delay = draw_delay(&config).as_secs();
            assert!((5..=6).contains(&delay));
        }
    }

    #[test]
    fn inverted_range_is_tolerated() {
        let config = AtgConfiguration {
            min_duration: 30,
            max_duration: 10,
            ..Default::default()
        };
        let duration = draw_duration(&config).as_secs();
        assert!((10..=30).contains(&duration));
    }

    #[test]
    fn certain_probability_always_starts() {
        let config = AtgConfiguration {
            probability_of_start: 100,
            ..Default::default()
        };
        assert!((0..50).all(|_| draw_start(&config)));

        let never = AtgConfiguration {
            probability_of_start: 0,
            ..Default::default()
        };
        assert!(!(0..50).any(|_| draw_start(&never)));
    }
}
