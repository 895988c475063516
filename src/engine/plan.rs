use std::sync::Arc;
use std::time::Duration;

use super::checks::Check;
use super::request::RequestTemplate;
use super::schedule::StageTimeline;
use super::thresholds::Threshold;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_TICK: Duration = Duration::from_millis(100);
pub const MIN_TICK: Duration = Duration::from_millis(10);
pub const DEFAULT_GRACEFUL_STOP: Duration = Duration::from_secs(30);
pub const DEFAULT_THRESHOLD_INTERVAL: Duration = Duration::from_secs(1);

/// Validated, immutable description of a run. Built once from [`crate::cli::config::Config`]
/// and shared by every component.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub name: String,
    pub timeline: StageTimeline,
    pub request: Arc<RequestTemplate>,
    pub checks: Arc<[Check]>,
    pub pause: Duration,
    pub request_timeout: Duration,
    pub thresholds: Vec<Threshold>,
    pub tick: Duration,
    pub graceful_stop: Duration,
    pub threshold_interval: Duration,
}
