use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::engine::checks::Check;
use crate::engine::plan::{self, RunPlan};
use crate::engine::request::RequestTemplate;
use crate::engine::schedule::StageTimeline;
use crate::engine::thresholds::Threshold;
use crate::error::ConfigError;
use crate::utils::parse_duration_str;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct ScheduleStep {
    pub duration: String,
    pub target: usize,
}

/// Request issued by every iteration. `{{vu}}` and `{{iter}}` in the url,
/// header values and body are replaced with the VU id and its iteration.
#[derive(Debug, Serialize, Deserialize, Clone, Default, JsonSchema)]
pub struct RequestConfig {
    pub url: Option<String>,
    /// HTTP method (default: GET, or POST when a body is given)
    pub method: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Raw request body
    pub body: Option<String>,
    /// JSON request body; sets `Content-Type: application/json` unless a header overrides it
    pub json: Option<serde_json::Value>,
}

/// A per-response assertion. Exactly one rule field must be set.
#[derive(Debug, Serialize, Deserialize, Clone, Default, JsonSchema)]
pub struct CheckConfig {
    pub name: String,
    /// Status code must equal this value
    pub status: Option<u16>,
    /// Status code must be one of these values
    #[serde(alias = "statusIn")]
    pub status_in: Option<Vec<u16>>,
    /// Inclusive status code range, e.g. [200, 299]
    #[serde(alias = "statusRange")]
    pub status_range: Option<[u16; 2]>,
    /// Response body must contain this text
    #[serde(alias = "bodyContains")]
    pub body_contains: Option<String>,
    /// Response must carry this header
    #[serde(alias = "headerPresent")]
    pub header_present: Option<String>,
    /// Request must complete within this duration (e.g., "200ms")
    #[serde(alias = "maxDuration")]
    pub max_duration: Option<String>,
}

/// A threshold entry: either `"p(95)<100"` or the detailed k6 object form.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
#[serde(untagged)]
pub enum ThresholdConfig {
    Expression(String),
    Detailed {
        threshold: String,
        /// Abort the run as soon as this threshold is breached
        #[serde(default, alias = "abortOnFail")]
        abort_on_fail: bool,
        /// Do not evaluate for early abort until this much of the run has elapsed
        #[serde(default, alias = "delayAbortEval")]
        delay_abort_eval: Option<String>,
    },
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, JsonSchema)]
pub struct Config {
    /// Scenario name shown in logs and the summary
    pub name: Option<String>,
    /// Ramping schedule (k6: stages)
    #[serde(alias = "schedule")]
    pub stages: Option<Vec<ScheduleStep>>,
    /// Request issued by every iteration
    pub request: Option<RequestConfig>,
    /// Per-response checks
    pub checks: Option<Vec<CheckConfig>>,
    /// Pause between iterations (k6: sleep), e.g. "100ms"
    #[serde(alias = "sleep")]
    pub pause: Option<String>,
    /// Per-request timeout (default: 60s)
    pub timeout: Option<String>,
    /// Pass/Fail criteria keyed by metric name (k6: thresholds)
    #[serde(alias = "criteria")]
    pub thresholds: Option<BTreeMap<String, Vec<ThresholdConfig>>>,
    /// Scheduler reconciliation interval (default: 100ms)
    pub tick: Option<String>,
    /// Upper bound on waiting for in-flight iterations at the end of the run (default: 30s)
    #[serde(alias = "gracefulStop", alias = "stop")]
    pub graceful_stop: Option<String>,
}

impl Config {
    /// Load a scenario file. `.json` files are parsed as JSON, anything else as YAML.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Unreadable {
            path: path.to_path_buf(),
            details: e.to_string(),
        })?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let parsed = if ext.eq_ignore_ascii_case("json") {
            serde_json::from_str(&content).map_err(|e| e.to_string())
        } else {
            serde_yaml::from_str(&content).map_err(|e| e.to_string())
        };
        parsed.map_err(|details| ConfigError::Parse {
            path: path.to_path_buf(),
            details,
        })
    }

    /// Validate and freeze into the immutable plan shared by the engine.
    pub fn into_plan(self) -> Result<RunPlan, ConfigError> {
        let steps = self.stages.unwrap_or_default();
        let timeline = StageTimeline::from_steps(&steps)?;

        let request = RequestTemplate::from_config(&self.request.unwrap_or_default())?;

        let checks = self
            .checks
            .unwrap_or_default()
            .iter()
            .map(Check::from_config)
            .collect::<Result<Vec<_>, _>>()?;

        let pause = optional_duration("pause", self.pause.as_deref())?.unwrap_or(Duration::ZERO);

        let request_timeout = optional_duration("timeout", self.timeout.as_deref())?
            .unwrap_or(plan::DEFAULT_REQUEST_TIMEOUT);
        if request_timeout.is_zero() {
            return Err(ConfigError::OutOfRange {
                field: "timeout",
                min: "1ms".to_string(),
            });
        }

        let tick = optional_duration("tick", self.tick.as_deref())?.unwrap_or(plan::DEFAULT_TICK);
        if tick < plan::MIN_TICK {
            return Err(ConfigError::OutOfRange {
                field: "tick",
                min: crate::utils::format_duration(plan::MIN_TICK),
            });
        }

        // Never cut an in-flight request short of its own timeout.
        let graceful_stop = optional_duration("graceful_stop", self.graceful_stop.as_deref())?
            .unwrap_or(plan::DEFAULT_GRACEFUL_STOP)
            .max(request_timeout);

        let mut thresholds = Vec::new();
        for (metric, entries) in self.thresholds.unwrap_or_default() {
            for entry in entries {
                thresholds.push(Threshold::from_config(&metric, &entry)?);
            }
        }

        Ok(RunPlan {
            name: self.name.unwrap_or_else(|| "default".to_string()),
            timeline,
            request: Arc::new(request),
            checks: Arc::from(checks),
            pause,
            request_timeout,
            thresholds,
            tick,
            graceful_stop,
            threshold_interval: plan::DEFAULT_THRESHOLD_INTERVAL,
        })
    }
}

fn optional_duration(field: &str, value: Option<&str>) -> Result<Option<Duration>, ConfigError> {
    value
        .map(|v| parse_duration_str(v).ok_or_else(|| ConfigError::duration(field, v)))
        .transpose()
}

/// Parse a `--stage 30s:100` command line value.
pub fn parse_stage_arg(value: &str) -> Result<ScheduleStep, ConfigError> {
    let invalid = || ConfigError::InvalidStage {
        value: value.to_string(),
    };
    let (duration, target) = value.split_once(':').ok_or_else(invalid)?;
    let target = target.trim().parse::<usize>().map_err(|_| invalid())?;
    if parse_duration_str(duration).is_none() {
        return Err(invalid());
    }
    Ok(ScheduleStep {
        duration: duration.trim().to_string(),
        target,
    })
}
