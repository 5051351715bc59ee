//! Per-batch aggregation of token usage.

use serde::{Deserialize, Serialize};

use crate::types::UsageRecord;

/// The job with the largest total token count so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsagePeak {
    pub total_tokens: u64,
    pub label: String,
}

/// Point-in-time view of a batch's usage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    /// Jobs that reported usage
    pub count: u64,
    pub avg_input: f64,
    pub avg_output: f64,
    pub avg_total: f64,
    /// Sum of total tokens across all counted jobs
    pub total: u64,
    pub total_elapsed_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peak: Option<UsagePeak>,
}

/// Running sums over the usage records of one batch.
#[derive(Debug, Default)]
pub struct UsageAccumulator {
    count: u64,
    input: u64,
    output: u64,
    total: u64,
    elapsed: f64,
    peak: Option<UsagePeak>,
}

impl UsageAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one record in. `label` identifies the job in the peak.
    pub fn record(&mut self, label: &str, usage: &UsageRecord) {
        self.count += 1;
        self.input += u64::from(usage.prompt_tokens);
        self.output += u64::from(usage.completion_tokens);
        self.total += u64::from(usage.total_tokens);
        self.elapsed += usage.elapsed_seconds;

        let total = u64::from(usage.total_tokens);
        // Ties keep the earlier job
        let is_new_peak = self.peak.as_ref().map_or(true, |p| total > p.total_tokens);
        if is_new_peak {
            self.peak = Some(UsagePeak {
                total_tokens: total,
                label: label.to_string(),
            });
        }
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        if self.count == 0 {
            return UsageSnapshot::default();
        }
        let n = self.count as f64;
        UsageSnapshot {
            count: self.count,
            avg_input: self.input as f64 / n,
            avg_output: self.output as f64 / n,
            avg_total: self.total as f64 / n,
            total: self.total,
            total_elapsed_seconds: self.elapsed,
            peak: self.peak.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_empty_snapshot() {
        let acc = UsageAccumulator::new();
        let snap = acc.snapshot();
        assert_eq!(snap.count, 0);
        assert_eq!(snap.avg_total, 0.0);
        assert!(snap.peak.is_none());
    }

    #[test]
    fn test_averages_and_peak() {
        let mut acc = UsageAccumulator::new();
        let jobs = [("a.jpg", 100, 20), ("b.jpg", 300, 50), ("c.jpg", 50, 10)];
        for (label, input, output) in jobs {
            acc.record(label, &UsageRecord::from_counts(input, output, Duration::from_secs(1)));
        }
        let snap = acc.snapshot();
        let totals: u64 = [120u64, 350, 60].iter().sum();
        assert_eq!(snap.count, 3);
        assert_eq!(snap.total, totals);
        assert!((snap.avg_total - totals as f64 / 3.0).abs() < 1e-9);
        assert!((snap.avg_input - 150.0).abs() < 1e-9);
        assert!((snap.avg_output - 80.0 / 3.0).abs() < 1e-9);
        assert_eq!(snap.total_elapsed_seconds, 3.0);

        let peak = snap.peak.unwrap();
        assert_eq!(peak.total_tokens, 350);
        assert_eq!(peak.label, "b.jpg");
    }

    #[test]
    fn test_peak_tie_keeps_first() {
        let mut acc = UsageAccumulator::new();
        acc.record("first", &UsageRecord::from_counts(10, 10, Duration::ZERO));
        acc.record("second", &UsageRecord::from_counts(15, 5, Duration::ZERO));
        assert_eq!(acc.snapshot().peak.unwrap().label, "first");
    }
}
