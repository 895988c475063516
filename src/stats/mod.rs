use chrono::{DateTime, Utc};
use hdrhistogram::Histogram;
use parking_lot::RwLock as ParkingLotRwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::engine::thresholds::ThresholdResult;
use crate::error::RequestErrorKind;
use crate::utils::as_millis_f64;

/// Result of one HTTP call: a status code, or the reason there was none.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Status(u16),
    Error(RequestErrorKind),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub name: Arc<str>,
    pub passed: bool,
}

/// One iteration's measurement. Immutable once recorded.
#[derive(Debug, Clone)]
pub struct RequestSample {
    pub vu_id: u64,
    pub iteration: u64,
    pub timestamp: DateTime<Utc>,
    pub duration: Duration,
    pub outcome: Outcome,
    pub checks: Vec<CheckResult>,
    pub checks_passed: bool,
}

impl RequestSample {
    /// Transport error or HTTP status >= 400.
    pub fn is_failed(&self) -> bool {
        match self.outcome {
            Outcome::Status(code) => code >= 400,
            Outcome::Error(_) => true,
        }
    }
}

fn latency_histogram() -> Option<Histogram<u64>> {
    // 1us to 1h, microsecond resolution
    Histogram::<u64>::new_with_bounds(1, 60 * 60 * 1000 * 1000, 2).ok()
}

/// One shard of recorded samples.
pub struct StatsAggregator {
    samples: Vec<RequestSample>,
    failed: usize,
    status_codes: BTreeMap<u16, usize>,
    errors: BTreeMap<RequestErrorKind, usize>,
    /// name -> (total, passes)
    checks: BTreeMap<Arc<str>, (usize, usize)>,
    /// Approximate latencies for the live progress line only
    histogram: Option<Histogram<u64>>,
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self {
            samples: Vec::new(),
            failed: 0,
            status_codes: BTreeMap::new(),
            errors: BTreeMap::new(),
            checks: BTreeMap::new(),
            histogram: latency_histogram(),
        }
    }

    pub fn record(&mut self, sample: RequestSample) {
        if sample.is_failed() {
            self.failed += 1;
        }
        match sample.outcome {
            Outcome::Status(code) => *self.status_codes.entry(code).or_insert(0) += 1,
            Outcome::Error(kind) => *self.errors.entry(kind).or_insert(0) += 1,
        }
        for check in &sample.checks {
            let entry = self.checks.entry(check.name.clone()).or_insert((0, 0));
            entry.0 += 1;
            if check.passed {
                entry.1 += 1;
            }
        }
        if let Some(h) = self.histogram.as_mut() {
            h.saturating_record(sample.duration.as_micros() as u64);
        }
        self.samples.push(sample);
    }

}

/// Sharded aggregator for reduced lock contention at high concurrency
/// Samples are distributed across N shards based on vu_id % num_shards
/// Uses parking_lot::RwLock for faster lock acquisition under contention
pub struct ShardedAggregator {
    shards: Vec<ParkingLotRwLock<StatsAggregator>>,
    num_shards: usize,
    started: Instant,
}

impl ShardedAggregator {
    pub fn new(num_shards: usize) -> Self {
        let num_shards = num_shards.max(1);
        let shards = (0..num_shards)
            .map(|_| ParkingLotRwLock::new(StatsAggregator::new()))
            .collect();
        Self {
            shards,
            num_shards,
            started: Instant::now(),
        }
    }

    /// Shard count for a run peaking at `peak_vus`.
    pub fn shards_for(peak_vus: usize) -> usize {
        (num_cpus::get() * 4).min(peak_vus.max(1)).max(1)
    }

    /// Add a sample to the appropriate shard based on vu_id
    pub fn record(&self, sample: RequestSample) {
        let shard_idx = (sample.vu_id % self.num_shards as u64) as usize;
        self.shards[shard_idx].write().record(sample);
    }

    pub fn total(&self) -> usize {
        self.shards.iter().map(|s| s.read().samples.len()).sum()
    }

    /// Merge all shards into an immutable view.
    ///
    /// Every shard's read lock is held while merging, so the snapshot is a
    /// single point in time: a sample is either fully in it or not at all.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let guards: Vec<_> = self.shards.iter().map(|s| s.read()).collect();
        let elapsed = self.started.elapsed();

        let total: usize = guards.iter().map(|g| g.samples.len()).sum();
        let mut durations = Vec::with_capacity(total);
        let mut snapshot = MetricsSnapshot {
            elapsed,
            ..MetricsSnapshot::default()
        };

        for shard in &guards {
            snapshot.failed_requests += shard.failed;
            for (code, count) in &shard.status_codes {
                *snapshot.status_codes.entry(*code).or_insert(0) += count;
            }
            for (kind, count) in &shard.errors {
                *snapshot.errors.entry(*kind).or_insert(0) += count;
            }
            for (name, (total, passes)) in &shard.checks {
                let entry = snapshot.checks.entry(name.to_string()).or_insert((0, 0));
                entry.0 += total;
                entry.1 += passes;
            }
            for sample in &shard.samples {
                durations.push(sample.duration);
                snapshot.total_duration += sample.duration;
                snapshot.first_sample = Some(match snapshot.first_sample {
                    Some(t) => t.min(sample.timestamp),
                    None => sample.timestamp,
                });
                snapshot.last_sample = Some(match snapshot.last_sample {
                    Some(t) => t.max(sample.timestamp),
                    None => sample.timestamp,
                });
            }
        }
        drop(guards);

        durations.sort_unstable();
        snapshot.total_requests = durations.len();
        // One request per iteration
        snapshot.iterations = durations.len();
        snapshot.durations = durations;
        snapshot
    }

    /// Cheap approximate view for the periodic progress line.
    pub fn live_view(&self) -> LiveView {
        let mut merged = latency_histogram();
        let mut view = LiveView::default();
        for shard in &self.shards {
            let shard = shard.read();
            view.requests += shard.samples.len();
            view.failed += shard.failed;
            if let (Some(m), Some(h)) = (merged.as_mut(), shard.histogram.as_ref()) {
                m.add(h).ok();
            }
        }
        if let Some(h) = merged.filter(|h| !h.is_empty()) {
            view.p50 = Duration::from_micros(h.value_at_quantile(0.5));
            view.p95 = Duration::from_micros(h.value_at_quantile(0.95));
        }
        view
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LiveView {
    pub requests: usize,
    pub failed: usize,
    pub p50: Duration,
    pub p95: Duration,
}

/// Immutable merged view of every sample recorded so far.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub total_requests: usize,
    pub failed_requests: usize,
    pub iterations: usize,
    pub total_duration: Duration,
    /// Sorted ascending
    durations: Vec<Duration>,
    pub status_codes: BTreeMap<u16, usize>,
    pub errors: BTreeMap<RequestErrorKind, usize>,
    /// name -> (total, passes)
    pub checks: BTreeMap<String, (usize, usize)>,
    pub first_sample: Option<DateTime<Utc>>,
    pub last_sample: Option<DateTime<Utc>>,
    pub elapsed: Duration,
}

impl MetricsSnapshot {
    /// Nearest-rank percentile: the smallest recorded value such that at
    /// least `p` percent of samples are <= it. `p = 0` yields the minimum.
    pub fn percentile(&self, p: f64) -> Option<Duration> {
        let n = self.durations.len();
        if n == 0 {
            return None;
        }
        let p = if p.is_nan() { 0.0 } else { p.clamp(0.0, 100.0) };
        // rank = ceil(p * n / 100) in integers, p kept to 0.001
        let p_milli = (p * 1000.0).round() as u128;
        let rank = (p_milli * n as u128).div_ceil(100_000) as usize;
        Some(self.durations[rank.clamp(1, n) - 1])
    }

    pub fn min(&self) -> Option<Duration> {
        self.durations.first().copied()
    }

    pub fn max(&self) -> Option<Duration> {
        self.durations.last().copied()
    }

    pub fn median(&self) -> Option<Duration> {
        self.percentile(50.0)
    }

    pub fn avg(&self) -> Option<Duration> {
        if self.total_requests == 0 {
            return None;
        }
        Some(self.total_duration / self.total_requests as u32)
    }

    pub fn failed_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.failed_requests as f64 / self.total_requests as f64
    }

    /// Pass rate across every check result, 0 when no check ran.
    pub fn checks_rate(&self) -> f64 {
        let (total, passes) = self
            .checks
            .values()
            .fold((0usize, 0usize), |acc, (t, p)| (acc.0 + t, acc.1 + p));
        if total == 0 {
            return 0.0;
        }
        passes as f64 / total as f64
    }

    /// Requests per second over the run so far.
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.total_requests as f64 / secs
    }

    pub fn to_report(&self) -> ReportStats {
        let ms = |d: Option<Duration>| d.map(as_millis_f64).unwrap_or(0.0);
        ReportStats {
            total_requests: self.total_requests,
            failed_requests: self.failed_requests,
            failed_rate: self.failed_rate(),
            iterations: self.iterations,
            duration_secs: self.elapsed.as_secs_f64(),
            throughput_rps: self.throughput(),
            avg_latency_ms: ms(self.avg()),
            min_latency_ms: ms(self.min()),
            max_latency_ms: ms(self.max()),
            p50_latency_ms: ms(self.median()),
            p90_latency_ms: ms(self.percentile(90.0)),
            p95_latency_ms: ms(self.percentile(95.0)),
            p99_latency_ms: ms(self.percentile(99.0)),
            status_codes: self.status_codes.clone(),
            errors: self
                .errors
                .iter()
                .map(|(kind, count)| (kind.to_string(), *count))
                .collect(),
            checks: self.checks.clone(),
            checks_rate: self.checks_rate(),
            ..ReportStats::default()
        }
    }

    pub fn to_json(&self) -> String {
        self.to_report().to_json()
    }

    pub fn report(&self) {
        self.to_report().print();
    }
}

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct ReportStats {
    pub total_requests: usize,
    pub failed_requests: usize,
    pub failed_rate: f64,
    pub iterations: usize,
    pub duration_secs: f64,
    pub throughput_rps: f64,
    pub avg_latency_ms: f64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
    pub p50_latency_ms: f64,
    pub p90_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub status_codes: BTreeMap<u16, usize>,
    pub errors: BTreeMap<String, usize>,
    pub checks: BTreeMap<String, (usize, usize)>,
    pub checks_rate: f64,
    #[serde(default)]
    pub thresholds: Vec<ThresholdResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thresholds_passed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
}

impl ReportStats {
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    pub fn print(&self) {
        println!("\n--- Test Summary ---");

        if let Some(reason) = &self.aborted {
            println!("Run aborted: {}", reason);
        }

        if self.total_requests == 0 {
            println!("No metrics collected.");
        } else {
            let fmt_ms = |ms: f64| format!("{:.2}ms", ms);
            println!("Total Requests: {}", self.total_requests);
            println!("Iterations:     {}", self.iterations);
            println!(
                "Failed:         {} ({:.2}%)",
                self.failed_requests,
                self.failed_rate * 100.0
            );
            println!("Duration:       {:.2}s", self.duration_secs);
            println!("Throughput:     {:.2} req/s", self.throughput_rps);
            println!("Avg Latency:    {}", fmt_ms(self.avg_latency_ms));
            println!("Min Latency:    {}", fmt_ms(self.min_latency_ms));
            println!("Max Latency:    {}", fmt_ms(self.max_latency_ms));
            println!("P50 Latency:    {}", fmt_ms(self.p50_latency_ms));
            println!("P90 Latency:    {}", fmt_ms(self.p90_latency_ms));
            println!("P95 Latency:    {}", fmt_ms(self.p95_latency_ms));
            println!("P99 Latency:    {}", fmt_ms(self.p99_latency_ms));

            if !self.status_codes.is_empty() {
                println!("\nStatus Codes:");
                for (code, count) in &self.status_codes {
                    println!("  {}: {}", code, count);
                }
            }
        }

        if !self.errors.is_empty() {
            println!("\nErrors:");
            for (err, count) in &self.errors {
                println!("  {}: {}", err, count);
            }
        }

        if !self.checks.is_empty() {
            println!("\nChecks:");
            for (name, (total, passes)) in &self.checks {
                let fail = total - passes;
                let percent = (*passes as f64 / (*total).max(1) as f64) * 100.0;
                if fail > 0 {
                    println!(
                        "  ✗ {} : {:.2}% ({} passed, {} failed)",
                        name, percent, passes, fail
                    );
                } else {
                    println!("  ✓ {} : 100% ({} passed)", name, passes);
                }
            }
        }

        if !self.thresholds.is_empty() {
            println!("\nThresholds:");
            for t in &self.thresholds {
                let mark = if t.passed { "✓" } else { "✗" };
                println!(
                    "  {} {} {} (actual: {:.2})",
                    mark, t.metric, t.expression, t.actual
                );
            }
        }

        println!("--------------------\n");
    }
}
