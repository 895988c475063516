//! Pass/fail criteria evaluated against a metrics snapshot.
//!
//! Expressions follow the k6 shape, `p(95) < 100`, `rate<0.01`,
//! `avg <= 250ms`. Whitespace is ignored. Duration bounds are compared in
//! milliseconds; a bare number on `http_req_duration` is milliseconds too.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::cli::config::ThresholdConfig;
use crate::error::ConfigError;
use crate::stats::MetricsSnapshot;
use crate::utils::{as_millis_f64, parse_duration_str};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdMetric {
    HttpReqDuration,
    HttpReqFailed,
    Checks,
    HttpReqs,
    Iterations,
}

impl ThresholdMetric {
    pub fn parse(name: &str) -> Result<Self, ConfigError> {
        match name.trim() {
            "http_req_duration" => Ok(Self::HttpReqDuration),
            "http_req_failed" => Ok(Self::HttpReqFailed),
            "checks" => Ok(Self::Checks),
            "http_reqs" => Ok(Self::HttpReqs),
            "iterations" => Ok(Self::Iterations),
            other => Err(ConfigError::UnknownMetric {
                metric: other.to_string(),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HttpReqDuration => "http_req_duration",
            Self::HttpReqFailed => "http_req_failed",
            Self::Checks => "checks",
            Self::HttpReqs => "http_reqs",
            Self::Iterations => "iterations",
        }
    }

    fn supports(&self, statistic: &Statistic) -> bool {
        use Statistic::*;
        match self {
            Self::HttpReqDuration => matches!(statistic, Percentile(_) | Avg | Min | Max | Med),
            Self::HttpReqFailed | Self::Checks => matches!(statistic, Rate),
            Self::HttpReqs | Self::Iterations => matches!(statistic, Count | Rate),
        }
    }
}

impl fmt::Display for ThresholdMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Statistic {
    Percentile(f64),
    Avg,
    Min,
    Max,
    Med,
    Count,
    Rate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Comparison {
    pub fn holds(&self, actual: f64, bound: f64) -> bool {
        match self {
            Self::Lt => actual < bound,
            Self::Le => actual <= bound,
            Self::Gt => actual > bound,
            Self::Ge => actual >= bound,
            Self::Eq => (actual - bound).abs() < f64::EPSILON,
            Self::Ne => (actual - bound).abs() >= f64::EPSILON,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Threshold {
    pub metric: ThresholdMetric,
    /// Expression as written in the scenario
    pub expression: String,
    pub statistic: Statistic,
    pub op: Comparison,
    /// Milliseconds for durations, a plain number otherwise
    pub bound: f64,
    pub abort_on_fail: bool,
    pub delay_abort_eval: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdResult {
    pub metric: String,
    pub expression: String,
    pub actual: f64,
    pub passed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub results: Vec<ThresholdResult>,
    pub passed: bool,
}

impl Threshold {
    pub fn parse(metric: &str, expression: &str) -> Result<Self, ConfigError> {
        let metric_kind = ThresholdMetric::parse(metric)?;
        let invalid = |reason: &str| ConfigError::InvalidThreshold {
            metric: metric.to_string(),
            expression: expression.to_string(),
            reason: reason.to_string(),
        };

        let compact: String = expression.chars().filter(|c| !c.is_whitespace()).collect();
        let (statistic, rest) = parse_statistic(&compact).ok_or_else(|| {
            invalid("expected p(N), avg, min, max, med, count or rate")
        })?;
        if let Statistic::Percentile(p) = statistic {
            if !(0.0..=100.0).contains(&p) {
                return Err(invalid("percentile must be between 0 and 100"));
            }
        }
        if !metric_kind.supports(&statistic) {
            return Err(invalid("statistic is not available for this metric"));
        }

        let (op, rest) = parse_comparison(rest)
            .ok_or_else(|| invalid("expected one of <, <=, >, >=, ==, !="))?;

        let bound = if metric_kind == ThresholdMetric::HttpReqDuration {
            if rest.ends_with(|c: char| c.is_ascii_digit() || c == '.') {
                rest.parse::<f64>().ok()
            } else {
                parse_duration_str(rest).map(as_millis_f64)
            }
        } else {
            if rest.ends_with('s') {
                return Err(invalid("time units are only valid for http_req_duration"));
            }
            rest.parse::<f64>().ok()
        }
        .filter(|b| b.is_finite())
        .ok_or_else(|| invalid("bound is not a number"))?;

        Ok(Self {
            metric: metric_kind,
            expression: expression.trim().to_string(),
            statistic,
            op,
            bound,
            abort_on_fail: false,
            delay_abort_eval: Duration::ZERO,
        })
    }

    pub fn from_config(metric: &str, config: &ThresholdConfig) -> Result<Self, ConfigError> {
        match config {
            ThresholdConfig::Expression(expr) => Self::parse(metric, expr),
            ThresholdConfig::Detailed {
                threshold,
                abort_on_fail,
                delay_abort_eval,
            } => {
                let mut parsed = Self::parse(metric, threshold)?;
                parsed.abort_on_fail = *abort_on_fail;
                if let Some(delay) = delay_abort_eval {
                    parsed.delay_abort_eval = parse_duration_str(delay)
                        .ok_or_else(|| ConfigError::duration("delayAbortEval", delay))?;
                }
                Ok(parsed)
            }
        }
    }

    /// The statistic's value on `snapshot`. Empty data evaluates to 0.
    pub fn actual(&self, snapshot: &MetricsSnapshot) -> f64 {
        let ms = |d: Option<Duration>| d.map(as_millis_f64).unwrap_or(0.0);
        let per_sec = |n: usize| {
            let secs = snapshot.elapsed.as_secs_f64();
            if secs > 0.0 {
                n as f64 / secs
            } else {
                0.0
            }
        };
        match (self.metric, self.statistic) {
            (ThresholdMetric::HttpReqDuration, Statistic::Percentile(p)) => {
                ms(snapshot.percentile(p))
            }
            (ThresholdMetric::HttpReqDuration, Statistic::Avg) => ms(snapshot.avg()),
            (ThresholdMetric::HttpReqDuration, Statistic::Min) => ms(snapshot.min()),
            (ThresholdMetric::HttpReqDuration, Statistic::Max) => ms(snapshot.max()),
            (ThresholdMetric::HttpReqDuration, Statistic::Med) => ms(snapshot.median()),
            (ThresholdMetric::HttpReqFailed, Statistic::Rate) => snapshot.failed_rate(),
            (ThresholdMetric::Checks, Statistic::Rate) => snapshot.checks_rate(),
            (ThresholdMetric::HttpReqs, Statistic::Count) => snapshot.total_requests as f64,
            (ThresholdMetric::HttpReqs, Statistic::Rate) => per_sec(snapshot.total_requests),
            (ThresholdMetric::Iterations, Statistic::Count) => snapshot.iterations as f64,
            (ThresholdMetric::Iterations, Statistic::Rate) => per_sec(snapshot.iterations),
            // Rejected by parse
            _ => 0.0,
        }
    }

    pub fn check(&self, snapshot: &MetricsSnapshot) -> ThresholdResult {
        let actual = self.actual(snapshot);
        ThresholdResult {
            metric: self.metric.to_string(),
            expression: self.expression.clone(),
            actual,
            passed: self.op.holds(actual, self.bound),
        }
    }
}

fn parse_statistic(s: &str) -> Option<(Statistic, &str)> {
    if let Some(rest) = s.strip_prefix("p(") {
        let close = rest.find(')')?;
        let p = rest[..close].parse::<f64>().ok()?;
        return Some((Statistic::Percentile(p), &rest[close + 1..]));
    }
    for (word, stat) in [
        ("avg", Statistic::Avg),
        ("min", Statistic::Min),
        ("max", Statistic::Max),
        ("med", Statistic::Med),
        ("count", Statistic::Count),
        ("rate", Statistic::Rate),
    ] {
        if let Some(rest) = s.strip_prefix(word) {
            return Some((stat, rest));
        }
    }
    // p95 / p99.9 shorthand
    let rest = s.strip_prefix('p')?;
    let end = rest
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(rest.len());
    let p = rest[..end].parse::<f64>().ok()?;
    Some((Statistic::Percentile(p), &rest[end..]))
}

fn parse_comparison(s: &str) -> Option<(Comparison, &str)> {
    for (token, op) in [
        ("<=", Comparison::Le),
        (">=", Comparison::Ge),
        ("==", Comparison::Eq),
        ("!=", Comparison::Ne),
        ("<", Comparison::Lt),
        (">", Comparison::Gt),
    ] {
        if let Some(rest) = s.strip_prefix(token) {
            return Some((op, rest));
        }
    }
    None
}

/// Evaluate every threshold. The verdict passes only if all of them do;
/// with no thresholds it passes.
pub fn evaluate(snapshot: &MetricsSnapshot, thresholds: &[Threshold]) -> Verdict {
    let results: Vec<ThresholdResult> = thresholds.iter().map(|t| t.check(snapshot)).collect();
    let passed = results.iter().all(|r| r.passed);
    Verdict { results, passed }
}

/// First abort-on-fail threshold that is breached once its delay has passed.
pub fn first_abort_breach(
    snapshot: &MetricsSnapshot,
    thresholds: &[Threshold],
    elapsed: Duration,
) -> Option<ThresholdResult> {
    thresholds
        .iter()
        .filter(|t| t.abort_on_fail && elapsed >= t.delay_abort_eval)
        .map(|t| t.check(snapshot))
        .find(|r| !r.passed)
}
