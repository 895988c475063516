use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::debug;

use super::checks::Check;
use super::control::ControlState;
use super::http_client::HttpTransport;
use super::pool::{VirtualUser, VuState};
use super::request::RequestFactory;
use crate::error::RequestError;
use crate::stats::{CheckResult, Outcome, RequestSample, ShardedAggregator};

/// How often a VU re-checks the pause flag while the run is paused.
const PAUSED_POLL: Duration = Duration::from_millis(100);

/// Everything a VU needs, shared by all VUs of a run.
pub struct VuContext {
    pub request: Arc<dyn RequestFactory>,
    pub transport: Arc<dyn HttpTransport>,
    pub checks: Arc<[Check]>,
    pub aggregator: Arc<ShardedAggregator>,
    pub control: Arc<ControlState>,
    pub request_timeout: Duration,
    pub pause: Duration,
}

/// Execute one iteration and build its sample. Never fails: request errors
/// become a failed sample.
pub async fn run_iteration(ctx: &VuContext, vu_id: u64, iteration: u64) -> RequestSample {
    let timestamp = Utc::now();
    let start = Instant::now();

    let result = match ctx.request.build(vu_id, iteration) {
        Ok(req) => match tokio::time::timeout(ctx.request_timeout, ctx.transport.send(req)).await {
            Ok(result) => result,
            Err(_) => Err(RequestError::Timeout),
        },
        Err(e) => Err(e),
    };
    let duration = start.elapsed();

    let (outcome, checks): (Outcome, Vec<CheckResult>) = match result {
        Ok(response) => {
            let checks = ctx
                .checks
                .iter()
                .map(|check| CheckResult {
                    name: check.name.clone(),
                    passed: check.evaluate(&response, duration),
                })
                .collect();
            (Outcome::Status(response.status), checks)
        }
        Err(e) => {
            debug!("VU {} iteration {} failed: {}", vu_id, iteration, e);
            // No response to check against
            let checks = ctx
                .checks
                .iter()
                .map(|check| CheckResult {
                    name: check.name.clone(),
                    passed: false,
                })
                .collect();
            (Outcome::Error(e.kind()), checks)
        }
    };

    let checks_passed = match outcome {
        Outcome::Status(_) => checks.iter().all(|c| c.passed),
        Outcome::Error(_) => false,
    };

    RequestSample {
        vu_id,
        iteration,
        timestamp,
        duration,
        outcome,
        checks,
        checks_passed,
    }
}

/// A VU's task: iterate until retired. Retirement is only observed between
/// iterations, never in the middle of a request.
pub async fn run_vu(ctx: Arc<VuContext>, mut vu: VirtualUser) {
    let mut iteration: u64 = 0;
    loop {
        if vu.is_retiring() {
            break;
        }

        if ctx.control.is_paused() {
            if !vu.handle().set_state(VuState::Idle) {
                break;
            }
            tokio::select! {
                _ = vu.retired() => break,
                _ = tokio::time::sleep(PAUSED_POLL) => continue,
            }
        }

        if !vu.handle().set_state(VuState::Running) {
            break;
        }
        let sample = run_iteration(&ctx, vu.id(), iteration).await;
        ctx.aggregator.record(sample);
        vu.handle().complete_iteration();
        iteration += 1;

        if !vu.handle().set_state(VuState::Sleeping) {
            break;
        }
        if ctx.pause.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::select! {
                _ = vu.retired() => break,
                _ = tokio::time::sleep(ctx.pause) => {}
            }
        }
    }
    debug!("VU {} retired after {} iterations", vu.id(), vu.handle().iterations());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::config::CheckConfig;
    use crate::engine::testing::{vu_context_with, FakeTransport};
    use crate::error::RequestErrorKind;

    fn status_check() -> Check {
        Check::from_config(&CheckConfig {
            name: "status is 200".into(),
            status: Some(200),
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_iteration() {
        let transport = Arc::new(FakeTransport::new(Duration::from_millis(40), 200));
        let ctx = vu_context_with(transport.clone(), Duration::ZERO, Duration::from_secs(5), vec![status_check()]);

        let sample = run_iteration(&ctx, 3, 7).await;
        assert_eq!(sample.vu_id, 3);
        assert_eq!(sample.iteration, 7);
        assert_eq!(sample.outcome, Outcome::Status(200));
        assert!(sample.duration >= Duration::from_millis(40));
        assert!(sample.duration < Duration::from_millis(45));
        assert!(sample.checks_passed);
        assert!(!sample.is_failed());
        assert_eq!(transport.bodies(), vec!["3:7".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_check_is_soft() {
        let transport = Arc::new(FakeTransport::new(Duration::from_millis(5), 503));
        let ctx = vu_context_with(transport, Duration::ZERO, Duration::from_secs(5), vec![status_check()]);

        let sample = run_iteration(&ctx, 1, 0).await;
        assert_eq!(sample.outcome, Outcome::Status(503));
        assert!(sample.is_failed());
        assert!(!sample.checks_passed);
        assert!(!sample.checks[0].passed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_yields_failed_sample() {
        let transport = Arc::new(FakeTransport::new(Duration::from_secs(10), 200));
        let ctx = vu_context_with(transport, Duration::ZERO, Duration::from_secs(5), vec![status_check()]);

        let sample = run_iteration(&ctx, 1, 0).await;
        assert_eq!(sample.outcome, Outcome::Error(RequestErrorKind::Timeout));
        assert!(sample.duration >= Duration::from_secs(5));
        assert!(sample.duration < Duration::from_millis(5010));
        assert!(sample.is_failed());
        assert!(!sample.checks_passed);
        assert_eq!(sample.checks.len(), 1);
        assert!(!sample.checks[0].passed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_vu_continues_after_timeout() {
        let transport = Arc::new(FakeTransport::new(Duration::from_secs(10), 200));
        let ctx = vu_context_with(
            transport.clone(),
            Duration::from_millis(100),
            Duration::from_secs(5),
            vec![status_check()],
        );
        let mut pool = crate::engine::pool::VuPool::new(ctx.clone());
        pool.reconcile(1);

        // 5s timeout + 100ms pause, then the second iteration starts
        tokio::time::sleep(Duration::from_millis(5200)).await;
        assert_eq!(transport.started(), 2);
        let snap = ctx.aggregator.snapshot();
        assert_eq!(snap.total_requests, 1);
        assert_eq!(snap.errors.get(&RequestErrorKind::Timeout), Some(&1));

        pool.drain(Duration::from_secs(10)).await;
        assert_eq!(ctx.aggregator.snapshot().total_requests, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_error_is_failed_sample_and_vu_keeps_going() {
        let transport = Arc::new(FakeTransport::refusing(Duration::from_millis(5)));
        let ctx = vu_context_with(
            transport.clone(),
            Duration::from_millis(95),
            Duration::from_secs(5),
            vec![status_check()],
        );

        let sample = run_iteration(&ctx, 2, 0).await;
        assert_eq!(sample.outcome, Outcome::Error(RequestErrorKind::Connect));
        assert!(sample.is_failed());
        assert!(!sample.checks_passed);
        assert!(!sample.checks[0].passed);

        let mut pool = crate::engine::pool::VuPool::new(ctx.clone());
        pool.reconcile(1);
        // 5ms request + 95ms pause per iteration
        tokio::time::sleep(Duration::from_millis(1050)).await;
        assert!(transport.started() >= 10);
        pool.drain(Duration::from_secs(1)).await;

        let snap = ctx.aggregator.snapshot();
        assert_eq!(snap.total_requests as u64, transport.completed() - 1);
        assert_eq!(snap.failed_requests, snap.total_requests);
        assert_eq!(snap.errors.get(&RequestErrorKind::Connect), Some(&snap.total_requests));
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_run_issues_no_requests() {
        let transport = Arc::new(FakeTransport::new(Duration::from_millis(10), 200));
        let ctx = vu_context_with(transport.clone(), Duration::from_millis(10), Duration::from_secs(5), vec![]);
        ctx.control.pause();

        let mut pool = crate::engine::pool::VuPool::new(ctx.clone());
        pool.reconcile(3);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(transport.started(), 0);
        assert_eq!(pool.status().idle, 3);

        ctx.control.resume();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(transport.started() > 0);
        pool.drain(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_retire_interrupts_pause() {
        let transport = Arc::new(FakeTransport::new(Duration::from_millis(10), 200));
        let ctx = vu_context_with(transport.clone(), Duration::from_secs(3600), Duration::from_secs(5), vec![]);
        let mut pool = crate::engine::pool::VuPool::new(ctx.clone());
        pool.reconcile(1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.completed(), 1);

        let started = Instant::now();
        assert_eq!(pool.drain(Duration::from_secs(60)).await, 0);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(transport.started(), 1);
    }
}
