//! Bucketed activity accumulator behind the receiver diagnostics.
//!
//! Each `apply_batch` adds one sample to the bucket covering its wall-clock
//! time. Buckets older than the history window are pruned on insert, so the
//! timeline is bounded and never rescans past samples.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// One bucket of the rolling timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityPoint {
    /// Bucket start, unix milliseconds, aligned to the bucket width.
    pub ts_bucket_start: i64,
    /// Operations submitted (applied + skipped).
    pub ops: u64,
    pub skipped_ops: u64,
    pub apply_duration_ms_avg: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivitySnapshot {
    pub bucket_ms: i64,
    pub points: Vec<ActivityPoint>,
}

impl ActivitySnapshot {
    pub fn total_ops(&self) -> u64 {
        self.points.iter().map(|p| p.ops).sum()
    }

    pub fn total_skipped(&self) -> u64 {
        self.points.iter().map(|p| p.skipped_ops).sum()
    }
}

#[derive(Debug, Clone)]
struct Bucket {
    start: i64,
    ops: u64,
    skipped: u64,
    duration_total_ms: f64,
    samples: u64,
}

#[derive(Debug, Clone)]
pub struct ActivityTimeline {
    bucket_ms: i64,
    history_ms: i64,
    buckets: VecDeque<Bucket>,
}

impl Default for ActivityTimeline {
    fn default() -> Self {
        Self::new(60_000, 1_000)
    }
}

impl ActivityTimeline {
    /// Zero or negative widths are clamped to 1ms.
    pub fn new(history_ms: i64, bucket_ms: i64) -> Self {
        Self {
            bucket_ms: bucket_ms.max(1),
            history_ms: history_ms.max(1),
            buckets: VecDeque::new(),
        }
    }

    pub fn bucket_ms(&self) -> i64 {
        self.bucket_ms
    }

    pub fn history_ms(&self) -> i64 {
        self.history_ms
    }

    /// Record a sample at the current wall-clock time.
    pub fn record(&mut self, ops: u64, skipped: u64, duration_ms: f64) {
        self.record_at(chrono::Utc::now().timestamp_millis(), ops, skipped, duration_ms);
    }

    pub fn record_at(&mut self, ts_ms: i64, ops: u64, skipped: u64, duration_ms: f64) {
        let start = ts_ms.div_euclid(self.bucket_ms) * self.bucket_ms;

        match self.buckets.iter_mut().rev().find(|b| b.start == start) {
            Some(bucket) => {
                bucket.ops += ops;
                bucket.skipped += skipped;
                bucket.duration_total_ms += duration_ms;
                bucket.samples += 1;
            }
            None => {
                let bucket = Bucket {
                    start,
                    ops,
                    skipped,
                    duration_total_ms: duration_ms,
                    samples: 1,
                };
                // Samples normally arrive in time order; keep the deque sorted
                // if a clock step sends one backwards.
                let pos = self
                    .buckets
                    .iter()
                    .rposition(|b| b.start < start)
                    .map_or(0, |p| p + 1);
                self.buckets.insert(pos, bucket);
            }
        }

        self.prune(ts_ms);
    }

    fn prune(&mut self, now_ms: i64) {
        let cutoff = now_ms - self.history_ms;
        while self
            .buckets
            .front()
            .is_some_and(|b| b.start + self.bucket_ms <= cutoff)
        {
            self.buckets.pop_front();
        }
    }

    pub fn snapshot(&self) -> ActivitySnapshot {
        ActivitySnapshot {
            bucket_ms: self.bucket_ms,
            points: self
                .buckets
                .iter()
                .map(|b| ActivityPoint {
                    ts_bucket_start: b.start,
                    ops: b.ops,
                    skipped_ops: b.skipped,
                    apply_duration_ms_avg: if b.samples == 0 {
                        0.0
                    } else {
                        b.duration_total_ms / b.samples as f64
                    },
                })
                .collect(),
        }
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_samples_share_aligned_buckets() {
        let mut timeline = ActivityTimeline::new(60_000, 1_000);
        timeline.record_at(10_100, 5, 3, 2.0);
        timeline.record_at(10_900, 3, 1, 4.0);
        timeline.record_at(11_000, 1, 0, 1.0);

        let snap = timeline.snapshot();
        assert_eq!(snap.bucket_ms, 1_000);
        assert_eq!(snap.points.len(), 2);
        assert_eq!(snap.points[0].ts_bucket_start, 10_000);
        assert_eq!(snap.points[0].ops, 8);
        assert_eq!(snap.points[0].skipped_ops, 4);
        assert_eq!(snap.points[0].apply_duration_ms_avg, 3.0);
        assert_eq!(snap.points[1].ts_bucket_start, 11_000);
        assert_eq!(snap.total_ops(), 9);
    }

    #[test]
    fn test_old_buckets_are_pruned() {
        let mut timeline = ActivityTimeline::new(5_000, 1_000);
        timeline.record_at(1_000, 1, 0, 0.0);
        timeline.record_at(4_000, 1, 0, 0.0);
        timeline.record_at(9_500, 1, 0, 0.0);

        let starts: Vec<i64> = timeline
            .snapshot()
            .points
            .iter()
            .map(|p| p.ts_bucket_start)
            .collect();
        assert_eq!(starts, vec![4_000, 9_000]);
    }

    #[test]
    fn test_out_of_order_sample_stays_sorted() {
        let mut timeline = ActivityTimeline::new(60_000, 1_000);
        timeline.record_at(5_000, 1, 0, 0.0);
        timeline.record_at(3_000, 1, 0, 0.0);
        let starts: Vec<i64> = timeline.snapshot().points.iter().map(|p| p.ts_bucket_start).collect();
        assert_eq!(starts, vec![3_000, 5_000]);
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let mut timeline = ActivityTimeline::new(60_000, 500);
        timeline.record_at(0, 2, 1, 1.5);
        let json = serde_json::to_value(timeline.snapshot()).unwrap();
        assert_eq!(json["bucketMs"], 500);
        assert_eq!(json["points"][0]["skippedOps"], 1);
        assert_eq!(json["points"][0]["applyDurationMsAvg"], 1.5);
        assert_eq!(json["points"][0]["tsBucketStart"], 0);
    }
}
