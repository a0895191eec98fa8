//! Per-command performance statistics
//!
//! Each OCPP command accumulates request/response/error counts and a bounded
//! ring of call durations from which the summary quantiles are derived.

use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

/// Ring capacity for duration samples per command.
const DURATION_WINDOW: usize = 256;

/// Summary over the retained duration window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Default)]
pub struct TimeSummary {
    pub min_ms: f64,
    pub max_ms: f64,
    pub avg_ms: f64,
    pub median_ms: f64,
    pub p95_ms: f64,
    pub stddev_ms: f64,
}

/// Statistics for one command name.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CommandStatistics {
    pub request_count: u64,
    pub response_count: u64,
    pub error_count: u64,
    /// Size in bytes of the most recent request for this command.
    pub message_size: usize,
    #[serde(skip)]
    durations: Vec<Duration>,
    #[serde(skip)]
    next_slot: usize,
}

impl CommandStatistics {
    fn record_duration(&mut self, elapsed: Duration) {
        if self.durations.len() < DURATION_WINDOW {
            self.durations.push(elapsed);
        } else {
            self.durations[self.next_slot] = elapsed;
        }
        self.next_slot = (self.next_slot + 1) % DURATION_WINDOW;
    }

    /// Compute the timing summary over the retained window.
    pub fn time_summary(&self) -> TimeSummary {
        if self.durations.is_empty() {
            return TimeSummary::default();
        }
        let mut ms: Vec<f64> = self
            .durations
            .iter()
            .map(|d| d.as_secs_f64() * 1000.0)
            .collect();
        ms.sort_by(|a, b| a.total_cmp(b));

        let n = ms.len();
        let sum: f64 = ms.iter().sum();
        let avg = sum / n as f64;
        let variance = ms.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / n as f64;

        TimeSummary {
            min_ms: ms[0],
            max_ms: ms[n - 1],
            avg_ms: avg,
            median_ms: percentile(&ms, 0.50),
            p95_ms: percentile(&ms, 0.95),
            stddev_ms: variance.sqrt(),
        }
    }
}

/// Nearest-rank percentile over a sorted slice.
fn percentile(sorted_ms: &[f64], q: f64) -> f64 {
    let rank = ((sorted_ms.len() as f64) * q).ceil() as usize;
    sorted_ms[rank.clamp(1, sorted_ms.len()) - 1]
}

/// Statistics for every command a station has exchanged.
#[derive(Debug, Default)]
pub struct StationStatistics {
    commands: HashMap<String, CommandStatistics>,
}

impl StationStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an outbound request and its serialized size. The size is kept
    /// as a last-seen value per command.
    pub fn record_request(&mut self, command: &str, message_size: usize) {
        let entry = self.commands.entry(command.to_string()).or_default();
        entry.request_count += 1;
        entry.message_size = message_size;
    }

    pub fn record_response(&mut self, command: &str, elapsed: Duration) {
        let entry = self.commands.entry(command.to_string()).or_default();
        entry.response_count += 1;
        entry.record_duration(elapsed);
    }

    pub fn record_error(&mut self, command: &str, elapsed: Duration) {
        let entry = self.commands.entry(command.to_string()).or_default();
        entry.error_count += 1;
        entry.record_duration(elapsed);
    }

    pub fn command(&self, command: &str) -> Option<&CommandStatistics> {
        self.commands.get(command)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &CommandStatistics)> {
        self.commands.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_accumulate() {
        let mut stats = StationStatistics::new();
        stats.record_request("Heartbeat", 42);
        stats.record_request("Heartbeat", 40);
        stats.record_response("Heartbeat", Duration::from_millis(10));
        stats.record_error("Heartbeat", Duration::from_millis(30));

        let cmd = stats.command("Heartbeat").unwrap();
        assert_eq!(cmd.request_count, 2);
        assert_eq!(cmd.response_count, 1);
        assert_eq!(cmd.error_count, 1);
    }

    #[test]
    fn message_size_is_last_seen() {
        let mut stats = StationStatistics::new();
        stats.record_request("BootNotification", 100);
        stats.record_request("BootNotification", 250);
        assert_eq!(stats.command("BootNotification").unwrap().message_size, 250);
    }

    #[test]
    fn summary_over_known_samples() {
        let mut stats = StationStatistics::new();
        for ms in [10u64, 20, 30, 40] {
            stats.record_response("MeterValues", Duration::from_millis(ms));
        }
        let summary = stats.command("MeterValues").unwrap().time_summary();
        assert_eq!(summary.min_ms, 10.0);
        assert_eq!(summary.max_ms, 40.0);
        assert_eq!(summary.avg_ms, 25.0);
        assert_eq!(summary.median_ms, 20.0);
        assert_eq!(summary.p95_ms, 40.0);
        assert!((summary.stddev_ms - 11.1803).abs() < 0.001);
    }

    #[test]
    fn window_is_bounded() {
        let mut stats = StationStatistics::new();
        for i in 0..1000u64 {
            stats.record_response("Heartbeat", Duration::from_millis(i));
        }
        let cmd = stats.command("Heartbeat").unwrap();
        assert_eq!(cmd.durations.len(), DURATION_WINDOW);
        assert_eq!(cmd.response_count, 1000);
    }

    #[test]
    fn empty_summary_is_zero() {
        let stats = CommandStatistics::default();
        assert_eq!(stats.time_summary(), TimeSummary::default());
    }
}
