use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Receiver;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::stats::{MetricsSnapshot, ReportStats, ShardedAggregator};
use crate::utils::format_duration;

pub mod checks;
pub mod control;
pub mod executor;
pub mod http_client;
pub mod memory;
pub mod plan;
pub mod pool;
pub mod request;
pub mod schedule;
pub mod thresholds;

use control::{ControlCommand, ControlState};
use executor::VuContext;
use http_client::HttpTransport;
use plan::RunPlan;
use pool::VuPool;
use schedule::RampScheduler;
use thresholds::{Verdict, ThresholdResult};

/// Exit status when at least one threshold failed.
pub const EXIT_THRESHOLDS_FAILED: i32 = 99;
/// Exit status when the run was aborted from outside (Ctrl-C, `stop`).
pub const EXIT_ABORTED: i32 = 105;

const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub enum AbortReason {
    /// Ctrl-C or an interactive `stop`
    External,
    /// An abort-on-fail threshold was breached
    ThresholdBreached(ThresholdResult),
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::External => write!(f, "stopped by user"),
            Self::ThresholdBreached(r) => write!(
                f,
                "threshold {} {} breached (actual: {:.2})",
                r.metric, r.expression, r.actual
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub snapshot: MetricsSnapshot,
    pub verdict: Verdict,
    pub aborted: Option<AbortReason>,
    pub duration: Duration,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match &self.aborted {
            Some(AbortReason::External) => EXIT_ABORTED,
            Some(AbortReason::ThresholdBreached(_)) => EXIT_THRESHOLDS_FAILED,
            None if !self.verdict.passed => EXIT_THRESHOLDS_FAILED,
            None => 0,
        }
    }

    pub fn to_report(&self) -> ReportStats {
        let mut report = self.snapshot.to_report();
        report.duration_secs = self.duration.as_secs_f64();
        report.thresholds = self.verdict.results.clone();
        if !self.verdict.results.is_empty() {
            report.thresholds_passed = Some(self.verdict.passed);
        }
        report.aborted = self.aborted.as_ref().map(|r| r.to_string());
        report
    }

    pub fn report(&self) {
        self.to_report().print();
    }

    pub fn to_json(&self) -> String {
        self.to_report().to_json()
    }
}

/// Build the multi-thread runtime, scaled with the peak VU count.
pub fn build_runtime(peak_vus: usize) -> std::io::Result<tokio::runtime::Runtime> {
    let base_parallelism = std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(8);

    // ~75 VUs per thread at high concurrency for lower task queue latency
    let threads = if peak_vus > 5000 {
        (peak_vus / 75).clamp(base_parallelism * 2, 128)
    } else if peak_vus > 1000 {
        (peak_vus / 50).clamp(base_parallelism, 64)
    } else {
        base_parallelism.max(8)
    };

    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(threads)
        .thread_name("barrage-worker")
        .enable_all()
        .build()
}

/// Idle connections kept per host: about one per 5 VUs.
pub fn pool_size_for(peak_vus: usize) -> usize {
    (peak_vus / 5).clamp(500, 2000)
}

pub struct Engine {
    plan: Arc<RunPlan>,
    transport: Arc<dyn HttpTransport>,
}

impl Engine {
    pub fn new(plan: RunPlan, transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            plan: Arc::new(plan),
            transport,
        }
    }

    /// Drive the timeline to completion or abort, then drain every VU.
    ///
    /// Paused time does not count against the timeline. Every sample
    /// recorded before an abort is kept.
    pub async fn run(
        &self,
        control: Arc<ControlState>,
        commands: Option<Receiver<ControlCommand>>,
    ) -> RunOutcome {
        let plan = &self.plan;
        let scheduler = RampScheduler::new(plan.timeline.clone());
        let peak = plan.timeline.peak_target();
        let aggregator = Arc::new(ShardedAggregator::new(ShardedAggregator::shards_for(peak)));

        let ctx = Arc::new(VuContext {
            request: plan.request.clone(),
            transport: self.transport.clone(),
            checks: plan.checks.clone(),
            aggregator: aggregator.clone(),
            control: control.clone(),
            request_timeout: plan.request_timeout,
            pause: plan.pause,
        });
        let mut pool = VuPool::new(ctx);

        info!(
            "Starting '{}': {} stages over {}, peak {} VUs",
            plan.name,
            plan.timeline.stages().len(),
            format_duration(plan.timeline.total_duration()),
            peak
        );

        let abort_thresholds = plan.thresholds.iter().any(|t| t.abort_on_fail);
        let started = Instant::now();
        let mut ticker = tokio::time::interval(plan.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut current_stage = None;
        let mut last_progress = started;
        let mut last_threshold_check = started;

        let aborted = loop {
            ticker.tick().await;

            if let Some(rx) = &commands {
                for cmd in rx.try_iter() {
                    match cmd {
                        ControlCommand::Pause => info!("[Control] Pausing VUs..."),
                        ControlCommand::Resume => info!("[Control] Resuming VUs..."),
                        ControlCommand::Stop => info!("[Control] Stopping test..."),
                        ControlCommand::Status => {
                            let status = pool.status();
                            let state = if control.is_paused() { "PAUSED" } else { "RUNNING" };
                            info!(
                                "[Status] VUs: {} live ({} running, {} sleeping, {} idle), {} draining, State: {}",
                                status.live,
                                status.running,
                                status.sleeping,
                                status.idle,
                                status.draining,
                                state
                            );
                        }
                    }
                    control.apply(cmd);
                }
            }

            if control.is_stopped() {
                break Some(AbortReason::External);
            }

            let elapsed = started.elapsed().saturating_sub(control.total_paused());
            let stage = plan.timeline.stage_index_at(elapsed);
            if stage != current_stage {
                if let Some(i) = stage {
                    let s = plan.timeline.stages()[i];
                    info!(
                        "Stage {}/{}: ramping to {} VUs over {}",
                        i + 1,
                        plan.timeline.stages().len(),
                        s.target,
                        format_duration(s.duration)
                    );
                }
                current_stage = stage;
            }

            let desired = scheduler.desired_at(elapsed);
            pool.reconcile(desired);
            pool.reap();

            if scheduler.is_finished(elapsed) {
                break None;
            }

            let now = Instant::now();
            if now.duration_since(last_progress) >= PROGRESS_INTERVAL {
                last_progress = now;
                let live = aggregator.live_view();
                info!(
                    "[{}] VUs: {}/{}, requests: {}, failed: {}, p50: {:?}, p95: {:?}",
                    format_duration(elapsed),
                    pool.live_count(),
                    desired,
                    live.requests,
                    live.failed,
                    live.p50,
                    live.p95
                );
            }

            if abort_thresholds && now.duration_since(last_threshold_check) >= plan.threshold_interval {
                last_threshold_check = now;
                let snapshot = aggregator.snapshot();
                if let Some(breach) = thresholds::first_abort_breach(&snapshot, &plan.thresholds, elapsed) {
                    break Some(AbortReason::ThresholdBreached(breach));
                }
            }
        };

        match &aborted {
            Some(reason) => warn!("Run aborted: {}", reason),
            None => debug!("Timeline complete"),
        }

        let draining = pool.live_count() + pool.draining_count();
        if draining > 0 {
            info!(
                "Graceful stop: waiting up to {} for {} VUs to finish...",
                format_duration(plan.graceful_stop),
                draining
            );
        }
        pool.drain(plan.graceful_stop).await;

        let snapshot = aggregator.snapshot();
        let verdict = thresholds::evaluate(&snapshot, &plan.thresholds);
        RunOutcome {
            snapshot,
            verdict,
            aborted,
            duration: started.elapsed(),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::cli::config::RequestConfig;
    use crate::engine::checks::Check;
    use crate::engine::http_client::HttpResponse;
    use crate::engine::request::RequestTemplate;
    use crate::error::RequestError;
    use async_trait::async_trait;
    use http::{HeaderMap, Request};
    use hyper::body::Bytes;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// In-process transport: answers every request with `status` after `delay`.
    pub struct FakeTransport {
        delay: Duration,
        status: u16,
        refuse: bool,
        started: AtomicU64,
        completed: AtomicU64,
        bodies: Mutex<Vec<String>>,
    }

    impl FakeTransport {
        pub fn new(delay: Duration, status: u16) -> Self {
            Self {
                delay,
                status,
                refuse: false,
                started: AtomicU64::new(0),
                completed: AtomicU64::new(0),
                bodies: Mutex::new(Vec::new()),
            }
        }

        /// Every request fails with a connection error after `delay`.
        pub fn refusing(delay: Duration) -> Self {
            Self {
                refuse: true,
                ..Self::new(delay, 0)
            }
        }

        pub fn started(&self) -> u64 {
            self.started.load(Ordering::SeqCst)
        }

        pub fn completed(&self) -> u64 {
            self.completed.load(Ordering::SeqCst)
        }

        pub fn in_flight(&self) -> u64 {
            self.started() - self.completed()
        }

        pub fn bodies(&self) -> Vec<String> {
            self.bodies.lock().clone()
        }
    }

    #[async_trait]
    impl HttpTransport for FakeTransport {
        async fn send(&self, req: Request<String>) -> Result<HttpResponse, RequestError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            // Counts as completed even when the caller times out and drops us
            struct Done<'a>(&'a AtomicU64);
            impl Drop for Done<'_> {
                fn drop(&mut self) {
                    self.0.fetch_add(1, Ordering::SeqCst);
                }
            }
            let _done = Done(&self.completed);

            tokio::time::sleep(self.delay).await;
            self.bodies.lock().push(req.body().clone());
            if self.refuse {
                return Err(RequestError::Connect("connection refused".into()));
            }
            Ok(HttpResponse {
                status: self.status,
                headers: HeaderMap::new(),
                body: Bytes::from_static(b"{\"queued\":true}"),
            })
        }
    }

    pub fn fake_template() -> RequestTemplate {
        RequestTemplate::from_config(&RequestConfig {
            url: Some("http://fake.local/api/v1/queue".into()),
            method: Some("POST".into()),
            body: Some("{{vu}}:{{iter}}".into()),
            ..Default::default()
        })
        .unwrap()
    }

    pub fn vu_context_with(
        transport: Arc<FakeTransport>,
        pause: Duration,
        request_timeout: Duration,
        checks: Vec<Check>,
    ) -> Arc<VuContext> {
        Arc::new(VuContext {
            request: Arc::new(fake_template()),
            transport,
            checks: Arc::from(checks),
            aggregator: Arc::new(ShardedAggregator::new(4)),
            control: Arc::new(ControlState::new()),
            request_timeout,
            pause,
        })
    }

    pub fn vu_context(transport: Arc<FakeTransport>, pause: Duration) -> Arc<VuContext> {
        vu_context_with(transport, pause, plan::DEFAULT_REQUEST_TIMEOUT, Vec::new())
    }
}
