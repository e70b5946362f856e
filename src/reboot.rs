// src/reboot.rs

//! Reboot policy and controlled reboot across process death
//!
//! Reboots only happen after the install loop has exited and the status
//! document has been flushed with `rebootStatus=Started`. Before invoking
//! the OS, a marker with the run's identity and intended terminal outcome
//! is persisted to the handler-state directory; the next invocation picks
//! the marker up, seals the previous run with `rebootStatus=Completed`,
//! and deletes it. A SIGTERM while waiting for the machine to go down is
//! the expected way for this process to die.

use crate::config::RebootSetting;
use crate::error::{Error, Result};
use crate::model::{RebootStatus, Run, RunStatus};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Grace for the machine to actually go down after `shutdown` returns
const REBOOT_WAIT_TIMEOUT: Duration = Duration::from_secs(6 * 60);

const REBOOT_MESSAGE: &str = "Patch installation initiated a reboot.";

/// What the policy table says to do once the install loop is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootDecision {
    /// No reboot; `required` notes whether one is pending anyway
    Skip { required: bool },
    Reboot,
}

/// Persisted across the reboot so the next invocation can seal the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebootMarker {
    pub sequence: u64,
    pub activity_id: String,
    pub intended_status: RunStatus,
    pub run_snapshot: Run,
}

pub struct RebootManager {
    setting: RebootSetting,
    marker_path: PathBuf,
    command: Vec<String>,
    wait_timeout: Duration,
}

impl RebootManager {
    pub fn new(setting: RebootSetting, marker_path: PathBuf) -> Self {
        Self {
            setting,
            marker_path,
            command: vec![
                "shutdown".to_string(),
                "-r".to_string(),
                "+1".to_string(),
                REBOOT_MESSAGE.to_string(),
            ],
            wait_timeout: REBOOT_WAIT_TIMEOUT,
        }
    }

    /// Replace the OS reboot command (test seam).
    pub fn with_command(mut self, command: Vec<String>) -> Self {
        self.command = command;
        self
    }

    pub fn with_wait_timeout(mut self, wait_timeout: Duration) -> Self {
        self.wait_timeout = wait_timeout;
        self
    }

    /// The policy table. `cancelled` wins over everything: an aborted run
    /// never reboots the machine.
    pub fn decide(&self, reboot_pending: bool, cancelled: bool) -> RebootDecision {
        if cancelled {
            return RebootDecision::Skip { required: reboot_pending };
        }
        match self.setting {
            RebootSetting::Never => RebootDecision::Skip { required: reboot_pending },
            RebootSetting::Always => RebootDecision::Reboot,
            RebootSetting::IfRequired if reboot_pending => RebootDecision::Reboot,
            RebootSetting::IfRequired => RebootDecision::Skip { required: false },
        }
    }

    /// Persist the marker and invoke the OS reboot.
    ///
    /// `terminated` reports whether the host has started tearing this
    /// process down (SIGTERM observed); that is the success signal. Only
    /// call after the status document shows `rebootStatus=Started`.
    pub fn start_reboot(
        &self,
        marker: &RebootMarker,
        terminated: &dyn Fn() -> bool,
    ) -> Result<()> {
        self.persist_marker(marker)?;

        info!("Invoking OS reboot: {}", self.command.join(" "));
        let status = Command::new(&self.command[0])
            .args(&self.command[1..])
            .status()
            .map_err(|e| Error::RebootFailure(format!("Failed to invoke reboot: {}", e)))?;
        if !status.success() {
            return Err(Error::RebootFailure(format!(
                "Reboot command exited {}",
                status.code().unwrap_or(-1)
            )));
        }

        let started = Instant::now();
        let poll = self.wait_timeout.min(Duration::from_secs(1)) / 2;
        while started.elapsed() < self.wait_timeout {
            if terminated() {
                info!("Shutdown signal observed; reboot is proceeding");
                return Ok(());
            }
            if !poll.is_zero() {
                std::thread::sleep(poll);
            }
        }

        warn!("Machine did not go down within {:?}", self.wait_timeout);
        Err(Error::RebootFailure(
            "Reboot failed to proceed on the machine in a timely manner".to_string(),
        ))
    }

    fn persist_marker(&self, marker: &RebootMarker) -> Result<()> {
        let tmp = self.marker_path.with_extension("marker.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(marker)?)?;
        std::fs::rename(&tmp, &self.marker_path)?;
        Ok(())
    }

    pub fn marker_path(&self) -> &Path {
        &self.marker_path
    }
}

/// Read a persisted marker, if any. A corrupt marker is discarded: the
/// previous run's terminal state is already on disk in its status file.
pub fn load_marker(path: &Path) -> Option<RebootMarker> {
    let content = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(marker) => Some(marker),
        Err(e) => {
            warn!("Discarding unreadable reboot marker {}: {}", path.display(), e);
            let _ = std::fs::remove_file(path);
            None
        }
    }
}

pub fn clear_marker(path: &Path) {
    let _ = std::fs::remove_file(path);
}

/// Seal a resumed run the way the marker intended.
pub fn finalize_resumed_run(marker: RebootMarker) -> Run {
    let mut run = marker.run_snapshot;
    run.reboot_status = RebootStatus::Completed;
    run.seal(marker.intended_status);
    run
}
