use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Commands that can be sent to control a running load test
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Pause all VUs (idle loop) and freeze the stage timeline
    Pause,
    /// Resume execution
    Resume,
    /// Log current status
    Status,
    /// Abort the run, keeping every recorded sample
    Stop,
}

/// Shared state between the control loop and every VU
pub struct ControlState {
    /// When true, VUs idle instead of issuing requests
    paused: AtomicBool,
    /// Abort flag
    stopped: AtomicBool,
    /// Accumulated paused duration in milliseconds
    total_paused_ms: AtomicU64,
    /// Offset (ms since `reference_instant`, plus one) when the current pause
    /// started, 0 if not paused
    pause_started_ms: AtomicU64,
    reference_instant: Instant,
}

impl ControlState {
    pub fn new() -> Self {
        Self {
            paused: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            total_paused_ms: AtomicU64::new(0),
            pause_started_ms: AtomicU64::new(0),
            reference_instant: Instant::now(),
        }
    }

    fn now_mark(&self) -> u64 {
        self.reference_instant.elapsed().as_millis() as u64 + 1
    }

    pub fn pause(&self) {
        if self.paused.swap(true, Ordering::SeqCst) {
            return;
        }
        self.pause_started_ms.store(self.now_mark(), Ordering::SeqCst);
    }

    pub fn resume(&self) {
        if !self.paused.swap(false, Ordering::SeqCst) {
            return;
        }
        let started = self.pause_started_ms.swap(0, Ordering::SeqCst);
        if started > 0 {
            let paused_dur = self.now_mark().saturating_sub(started);
            self.total_paused_ms.fetch_add(paused_dur, Ordering::SeqCst);
        }
    }

    /// Returns total time spent paused (including current pause if active)
    pub fn total_paused(&self) -> Duration {
        let mut total = self.total_paused_ms.load(Ordering::SeqCst);
        let started = self.pause_started_ms.load(Ordering::SeqCst);
        if started > 0 {
            total += self.now_mark().saturating_sub(started);
        }
        Duration::from_millis(total)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Apply a command that only touches shared flags. `Status` is handled by
    /// the control loop, which owns the pool.
    pub fn apply(&self, cmd: ControlCommand) {
        match cmd {
            ControlCommand::Pause => self.pause(),
            ControlCommand::Resume => self.resume(),
            ControlCommand::Stop => self.stop(),
            ControlCommand::Status => {}
        }
    }
}

impl Default for ControlState {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a control command from user input
pub fn parse_control_command(input: &str) -> Option<ControlCommand> {
    let word = input.split_whitespace().next()?;

    match word.to_lowercase().as_str() {
        "pause" => Some(ControlCommand::Pause),
        "resume" | "unpause" => Some(ControlCommand::Resume),
        "status" | "stats" => Some(ControlCommand::Status),
        "stop" | "quit" | "exit" => Some(ControlCommand::Stop),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pause_resume() {
        assert_eq!(parse_control_command("pause"), Some(ControlCommand::Pause));
        assert_eq!(parse_control_command("resume"), Some(ControlCommand::Resume));
        assert_eq!(parse_control_command(" Unpause "), Some(ControlCommand::Resume));
    }

    #[test]
    fn test_parse_stop() {
        assert_eq!(parse_control_command("stop"), Some(ControlCommand::Stop));
        assert_eq!(parse_control_command("quit"), Some(ControlCommand::Stop));
        assert_eq!(parse_control_command("exit"), Some(ControlCommand::Stop));
    }

    #[test]
    fn test_parse_unknown() {
        assert_eq!(parse_control_command(""), None);
        assert_eq!(parse_control_command("ramp 50"), None);
    }

    #[test]
    fn test_control_state() {
        let state = ControlState::new();

        assert!(!state.is_paused());
        state.apply(ControlCommand::Pause);
        assert!(state.is_paused());
        std::thread::sleep(Duration::from_millis(20));
        assert!(state.total_paused() >= Duration::from_millis(20));
        state.apply(ControlCommand::Resume);
        assert!(!state.is_paused());

        let frozen = state.total_paused();
        assert!(frozen >= Duration::from_millis(20));
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(state.total_paused(), frozen);
    }

    #[test]
    fn test_double_pause_keeps_first_start() {
        let state = ControlState::new();
        state.pause();
        std::thread::sleep(Duration::from_millis(15));
        state.pause();
        state.resume();
        assert!(state.total_paused() >= Duration::from_millis(15));
    }

    #[test]
    fn test_control_state_stop() {
        let state = ControlState::new();
        assert!(!state.is_stopped());
        state.apply(ControlCommand::Stop);
        assert!(state.is_stopped());
    }
}
