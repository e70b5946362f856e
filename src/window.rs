// src/window.rs

//! Maintenance window and cancellation control
//!
//! One `RunControl` is shared between the orchestrator, the command runner
//! and the signal handler. The window owns the wall-clock budget; the
//! control carries the hard deadline (observed by the runner mid-command)
//! and the cooperative cancellation flag (observed by the orchestrator at
//! patch boundaries only).

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Window needed to schedule a reboot at the end of a run
pub const REBOOT_BUFFER: Duration = Duration::from_secs(15 * 60);

/// Expected worst-case time for one package install
pub const PACKAGE_INSTALL_ESTIMATE: Duration = Duration::from_secs(5 * 60);

/// Budget for a graceful wrap-up (status flush, no reboot)
pub const WRAP_UP_BUDGET: Duration = Duration::from_secs(60);

/// Verdict from a deadline checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    /// Enough time remains for the next step
    Continue,
    /// Not enough for the step, but a graceful wrap-up still fits
    StopWithPartial,
    /// The deadline has passed
    StopNow,
}

/// Wall-clock budget for one run: `startTime + maximumDuration`.
#[derive(Debug, Clone)]
pub struct MaintenanceWindow {
    start_time: DateTime<Utc>,
    duration: Duration,
}

impl MaintenanceWindow {
    pub fn new(start_time: DateTime<Utc>, duration: Duration) -> Self {
        Self { start_time, duration }
    }

    pub fn elapsed(&self) -> Duration {
        let now = Utc::now();
        if now <= self.start_time {
            return Duration::ZERO;
        }
        (now - self.start_time).to_std().unwrap_or(Duration::ZERO)
    }

    /// Time left in the window, saturating at zero.
    pub fn remaining(&self) -> Duration {
        self.duration.saturating_sub(self.elapsed())
    }

    pub fn is_exceeded(&self) -> bool {
        self.remaining() == Duration::ZERO
    }

    /// The `Instant` at which the window closes, for the command runner.
    pub fn deadline_instant(&self) -> Instant {
        Instant::now() + self.remaining()
    }

    /// Gate a step expected to take `estimate`.
    pub fn checkpoint(&self, stage: &str, estimate: Duration) -> Checkpoint {
        let remaining = self.remaining();
        if remaining == Duration::ZERO {
            warn!("Window exceeded at stage '{}'", stage);
            return Checkpoint::StopNow;
        }
        // Estimate padded by half again; observed medians understate tails
        let padded = estimate + estimate / 2;
        if remaining > padded {
            debug!(
                "Checkpoint '{}': {:?} remaining, {:?} needed",
                stage, remaining, padded
            );
            return Checkpoint::Continue;
        }
        if remaining > WRAP_UP_BUDGET {
            warn!(
                "Checkpoint '{}': {:?} remaining is under the {:?} step estimate; wrapping up",
                stage, remaining, padded
            );
            return Checkpoint::StopWithPartial;
        }
        warn!("Checkpoint '{}': {:?} remaining; stopping now", stage, remaining);
        Checkpoint::StopNow
    }

    /// Whether enough window remains to schedule a reboot.
    pub fn reboot_time_available(&self) -> bool {
        self.remaining() >= REBOOT_BUFFER
    }
}

/// Shared run state: hard deadline plus cooperative cancellation.
#[derive(Debug, Default)]
pub struct RunControl {
    deadline: Mutex<Option<Instant>>,
    cancelled: AtomicBool,
    cancel_reason: Mutex<Option<String>>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the hard deadline; the command runner kills children past it.
    pub fn set_deadline(&self, deadline: Instant) {
        *self.deadline.lock().unwrap() = Some(deadline);
    }

    pub fn clear_deadline(&self) {
        *self.deadline.lock().unwrap() = None;
    }

    pub fn deadline_exceeded(&self) -> bool {
        self.deadline
            .lock()
            .unwrap()
            .map(|d| Instant::now() >= d)
            .unwrap_or(false)
    }

    /// Request cooperative cancellation. First reason wins.
    pub fn request_cancel(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut slot = self.cancel_reason.lock().unwrap();
        if slot.is_none() {
            warn!("Cancellation requested: {}", reason);
            *slot = Some(reason);
        }
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn cancel_reason(&self) -> Option<String> {
        self.cancel_reason.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn test_remaining_saturates_at_zero() {
        let window = MaintenanceWindow::new(
            Utc::now() - ChronoDuration::hours(2),
            Duration::from_secs(3600),
        );
        assert_eq!(window.remaining(), Duration::ZERO);
        assert!(window.is_exceeded());
    }

    #[test]
    fn test_future_start_counts_full_window() {
        let window = MaintenanceWindow::new(
            Utc::now() + ChronoDuration::minutes(10),
            Duration::from_secs(3600),
        );
        assert_eq!(window.remaining(), Duration::from_secs(3600));
    }

    #[test]
    fn test_checkpoint_continue() {
        let window = MaintenanceWindow::new(Utc::now(), Duration::from_secs(3600));
        assert_eq!(
            window.checkpoint("install", PACKAGE_INSTALL_ESTIMATE),
            Checkpoint::Continue
        );
    }

    #[test]
    fn test_checkpoint_stop_with_partial() {
        // 3 minutes left, a 5-minute step pending: too tight for the step,
        // plenty for a wrap-up.
        let window = MaintenanceWindow::new(
            Utc::now() - ChronoDuration::minutes(57),
            Duration::from_secs(3600),
        );
        assert_eq!(
            window.checkpoint("install", PACKAGE_INSTALL_ESTIMATE),
            Checkpoint::StopWithPartial
        );
    }

    #[test]
    fn test_checkpoint_stop_now() {
        let window = MaintenanceWindow::new(
            Utc::now() - ChronoDuration::hours(2),
            Duration::from_secs(3600),
        );
        assert_eq!(
            window.checkpoint("install", PACKAGE_INSTALL_ESTIMATE),
            Checkpoint::StopNow
        );
    }

    #[test]
    fn test_cancel_reason_first_wins() {
        let control = RunControl::new();
        assert!(!control.is_cancelled());
        control.request_cancel("sigterm");
        control.request_cancel("no-operation supersession");
        assert!(control.is_cancelled());
        assert_eq!(control.cancel_reason().unwrap(), "sigterm");
    }

    #[test]
    fn test_deadline_exceeded() {
        let control = RunControl::new();
        assert!(!control.deadline_exceeded());
        control.set_deadline(Instant::now());
        assert!(control.deadline_exceeded());
        control.clear_deadline();
        assert!(!control.deadline_exceeded());
    }
}
