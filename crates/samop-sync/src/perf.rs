use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::fetcher::FetchPerformance;

pub const LOW_CACHE_HIT_RATE: f64 = 0.30;
pub const LOW_CACHE_HIT_MIN_QUERIES: usize = 5;
pub const HIGH_DUPLICATE_RATE: f64 = 0.30;
pub const SLOW_AVERAGE_MS: f64 = 3_000.0;
pub const HIGH_FAILURE_RATE: f64 = 0.20;

/// Per-run numbers fed to the performance log.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub total_duration_ms: u64,
    pub partitions_queried: usize,
    pub partitions_failed: usize,
    pub cache_hits: usize,
    pub cache_misses: usize,
    pub count_before_dedup: usize,
    pub duplicates_removed: usize,
    /// Cached partitions contribute zero.
    pub partition_durations_ms: Vec<u64>,
}

impl PerformanceMetrics {
    pub fn from_fetch(
        perf: &FetchPerformance,
        partitions_failed: usize,
        count_before_dedup: usize,
        duplicates_removed: usize,
    ) -> Self {
        Self {
            total_duration_ms: perf.total_duration_ms,
            partitions_queried: perf.partitions.len(),
            partitions_failed,
            cache_hits: perf.cache_hits,
            cache_misses: perf.cache_misses,
            count_before_dedup,
            duplicates_removed,
            partition_durations_ms: perf.partitions.iter().map(|t| t.duration_ms).collect(),
        }
    }

    pub fn total_queries(&self) -> usize {
        self.cache_hits + self.cache_misses
    }

    pub fn cache_hit_rate(&self) -> f64 {
        ratio(self.cache_hits, self.total_queries())
    }

    pub fn duplicate_rate(&self) -> f64 {
        ratio(self.duplicates_removed, self.count_before_dedup)
    }

    pub fn failure_rate(&self) -> f64 {
        ratio(self.partitions_failed, self.partitions_queried)
    }

    pub fn average_partition_ms(&self) -> f64 {
        if self.partition_durations_ms.is_empty() {
            return 0.0;
        }
        self.partition_durations_ms.iter().sum::<u64>() as f64 / self.partition_durations_ms.len() as f64
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PerformanceWarning {
    LowCacheHitRate { rate: f64, queries: usize },
    HighDuplicateRate { rate: f64 },
    SlowQueries { average_ms: f64 },
    HighFailureRate { rate: f64 },
}

impl fmt::Display for PerformanceWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PerformanceWarning::LowCacheHitRate { rate, queries } => write!(
                f,
                "cache hit rate {:.1}% over {queries} queries; review cache TTL or query pattern",
                rate * 100.0
            ),
            PerformanceWarning::HighDuplicateRate { rate } => write!(
                f,
                "duplicate rate {:.1}%; review NAICS selection for overlap",
                rate * 100.0
            ),
            PerformanceWarning::SlowQueries { average_ms } => {
                write!(f, "average partition query took {average_ms:.0}ms")
            }
            PerformanceWarning::HighFailureRate { rate } => write!(
                f,
                "{:.1}% of partitions failed; check API credentials and connectivity",
                rate * 100.0
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PerformanceLogger;

impl PerformanceLogger {
    /// Advisory only; the returned warnings never change the run outcome.
    pub fn analyze(&self, metrics: &PerformanceMetrics) -> Vec<PerformanceWarning> {
        let mut warnings = Vec::new();

        let queries = metrics.total_queries();
        let hit_rate = metrics.cache_hit_rate();
        if hit_rate < LOW_CACHE_HIT_RATE && queries > LOW_CACHE_HIT_MIN_QUERIES {
            warnings.push(PerformanceWarning::LowCacheHitRate { rate: hit_rate, queries });
        }

        let dup_rate = metrics.duplicate_rate();
        if dup_rate > HIGH_DUPLICATE_RATE {
            warnings.push(PerformanceWarning::HighDuplicateRate { rate: dup_rate });
        }

        let average_ms = metrics.average_partition_ms();
        if average_ms > SLOW_AVERAGE_MS {
            warnings.push(PerformanceWarning::SlowQueries { average_ms });
        }

        let failure_rate = metrics.failure_rate();
        if failure_rate > HIGH_FAILURE_RATE {
            warnings.push(PerformanceWarning::HighFailureRate { rate: failure_rate });
        }

        warnings
    }

    /// Emits the summary event and one warning event per tripped rule.
    pub fn log(&self, metrics: &PerformanceMetrics) {
        info!(
            total_duration_ms = metrics.total_duration_ms,
            partitions_queried = metrics.partitions_queried,
            partitions_failed = metrics.partitions_failed,
            cache_hits = metrics.cache_hits,
            cache_misses = metrics.cache_misses,
            cache_hit_rate = metrics.cache_hit_rate(),
            duplicate_rate = metrics.duplicate_rate(),
            avg_partition_ms = metrics.average_partition_ms(),
            "sam fetch performance"
        );
        for warning in self.analyze(metrics) {
            warn!(warning = %warning, "sam fetch performance warning");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn healthy() -> PerformanceMetrics {
        PerformanceMetrics {
            total_duration_ms: 1_200,
            partitions_queried: 4,
            partitions_failed: 0,
            cache_hits: 2,
            cache_misses: 2,
            count_before_dedup: 10,
            duplicates_removed: 1,
            partition_durations_ms: vec![0, 0, 600, 600],
        }
    }

    #[test]
    fn healthy_run_has_no_warnings() {
        assert!(PerformanceLogger.analyze(&healthy()).is_empty());
    }

    #[test]
    fn low_hit_rate_needs_more_than_five_queries() {
        let mut m = healthy();
        m.cache_hits = 0;
        m.cache_misses = 5;
        assert!(PerformanceLogger.analyze(&m).is_empty());

        m.cache_misses = 6;
        let warnings = PerformanceLogger.analyze(&m);
        assert!(matches!(
            warnings.as_slice(),
            [PerformanceWarning::LowCacheHitRate { queries: 6, .. }]
        ));
    }

    #[test]
    fn each_rule_fires_independently() {
        let m = PerformanceMetrics {
            total_duration_ms: 20_000,
            partitions_queried: 4,
            partitions_failed: 1,
            cache_hits: 0,
            cache_misses: 8,
            count_before_dedup: 10,
            duplicates_removed: 4,
            partition_durations_ms: vec![4_000, 5_000, 3_500, 3_100],
        };
        PerformanceLogger.log(&m);
        let warnings = PerformanceLogger.analyze(&m);
        assert_eq!(warnings.len(), 4);
        assert!(warnings.iter().any(|w| matches!(w, PerformanceWarning::HighDuplicateRate { .. })));
        assert!(warnings.iter().any(|w| matches!(w, PerformanceWarning::SlowQueries { .. })));
        assert!(warnings.iter().any(|w| matches!(w, PerformanceWarning::HighFailureRate { .. })));
    }

    #[test]
    fn failure_rate_boundary_is_exclusive() {
        let mut m = healthy();
        m.partitions_queried = 5;
        m.partitions_failed = 1;
        assert!(PerformanceLogger.analyze(&m).is_empty());
    }

    #[test]
    fn warnings_render_readable_messages() {
        let text = PerformanceWarning::HighFailureRate { rate: 0.5 }.to_string();
        assert!(text.starts_with("50.0% of partitions failed"));
    }
}
