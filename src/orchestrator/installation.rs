// src/orchestrator/installation.rs

//! Installation: the gated per-patch install loop
//!
//! Patches go one at a time so every failure stays attributable to one
//! row. Between patches the loop checks the cancellation flag and the
//! maintenance window; a single failed patch never stops the loop, a
//! fatal adapter outcome always does. The reboot decision is made only
//! after the loop exits.

use super::Orchestrator;
use crate::lockfile::InstanceLock;
use crate::model::{InstallState, Patch, RebootStatus, Run, RunStatus, SelectedState};
use crate::reboot::{RebootDecision, RebootMarker};
use crate::selection;
use crate::signals;
use crate::window::{Checkpoint, MaintenanceWindow};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Why the install loop stopped before exhausting its selection.
#[derive(Debug, PartialEq, Eq)]
enum LoopExit {
    Completed,
    Cancelled,
    WindowExhausted,
    AdapterFatal,
}

impl Orchestrator<'_> {
    pub(super) fn run_installation(&mut self) -> Run {
        let mut run = Run::new(&self.request.activity_id, self.request.operation.as_str());
        self.flush_progress(&run);

        let _lock = match InstanceLock::acquire_with_wait(self.environment.paths().lock_file()) {
            Ok(lock) => lock,
            Err(e) => {
                warn!("Installation could not take the orchestrator lock: {}", e);
                self.errors.add("OPERATION_FAILED", e.to_string());
                run.seal(RunStatus::Failed);
                self.flush_terminal(&run);
                return run;
            }
        };

        let window = MaintenanceWindow::new(
            self.request.start_time,
            self.request
                .maximum_duration
                .unwrap_or(crate::config::DEFAULT_MAXIMUM_DURATION),
        );
        let control = self.environment.control();
        control.set_deadline(window.deadline_instant());

        // Plan: filter + closure
        let adapter = self.environment.adapter();
        match selection::build_installation_selection(
            adapter.as_ref(),
            &self.request,
            &self.environment.os_tag(),
        ) {
            Ok(patches) => run.patches = patches,
            Err(e) => {
                warn!("Planning failed: {}", e);
                self.errors.add("PACKAGE_MANAGER_FAILURE", e.to_string());
                run.seal(RunStatus::Failed);
                control.clear_deadline();
                self.flush_terminal(&run);
                return run;
            }
        }
        self.flush_progress(&run);

        // Execute
        let exit = self.install_loop(&mut run, &window);

        // Patches the loop never reached stay visible as NotStarted
        for patch in &mut run.patches {
            if patch.selected_state == SelectedState::Selected
                && !patch.install_state.is_terminal()
                && patch.install_state != InstallState::NotStarted
            {
                patch.set_install_state(InstallState::NotStarted);
            }
        }

        run.seal(self.terminal_status(&run, &exit));
        control.clear_deadline();

        self.handle_reboot(&mut run, &window, exit == LoopExit::Cancelled);
        self.flush_terminal(&run);
        run
    }

    fn install_loop(&mut self, run: &mut Run, window: &MaintenanceWindow) -> LoopExit {
        let adapter = self.environment.adapter();
        let control = self.environment.control();
        let selected: Vec<(String, String)> = run
            .patches
            .iter()
            .filter(|p| p.selected_state == SelectedState::Selected)
            .map(|p| (p.name.clone(), p.version.clone()))
            .collect();

        info!("Installing {} selected patches", selected.len());

        // Observed single-patch install times; the checkpoint estimate is
        // their median (the first patch is always attempted)
        let mut observed: Vec<Duration> = Vec::new();

        for (name, version) in selected {
            if signals::sigterm_received() {
                control.request_cancel("SIGTERM from host agent");
            }
            if control.is_cancelled() {
                info!(
                    "Cancellation observed before {}: {}",
                    name,
                    control.cancel_reason().unwrap_or_default()
                );
                return LoopExit::Cancelled;
            }

            match window.checkpoint(&name, median(&observed)) {
                Checkpoint::Continue => {}
                Checkpoint::StopWithPartial | Checkpoint::StopNow => {
                    run.maintenance_window_exceeded = true;
                    self.errors.add(
                        "OPERATION_FAILED",
                        "Maintenance window exhausted before all patches were attempted",
                    );
                    return LoopExit::WindowExhausted;
                }
            }

            if let Some(patch) = run.patch_mut(&name, &version) {
                patch.set_install_state(InstallState::Installing);
            }
            self.flush_progress(run);

            let version_arg = if version.is_empty() { None } else { Some(version.as_str()) };
            let install_started = Instant::now();
            let outcome = adapter.install_one(&name, version_arg);
            observed.push(install_started.elapsed());

            let fatal = outcome.fatal;
            if let Some(patch) = run.patch_mut(&name, &version) {
                if outcome.succeeded {
                    patch.set_install_state(InstallState::Installed);
                    patch.error_message = None;
                } else {
                    patch.set_install_state(InstallState::Failed);
                    patch.error_message = outcome.error.clone();
                    self.errors.add(
                        "PACKAGE_MANAGER_FAILURE",
                        outcome
                            .error
                            .clone()
                            .unwrap_or_else(|| format!("Install of {} failed", name)),
                    );
                }
            }
            self.flush_progress(run);

            if fatal {
                warn!("Adapter reported a fatal condition; aborting the loop");
                return LoopExit::AdapterFatal;
            }
        }

        LoopExit::Completed
    }
}

/// Median of observed install times; zero until something was observed.
fn median(observed: &[Duration]) -> Duration {
    if observed.is_empty() {
        return Duration::ZERO;
    }
    let mut sorted = observed.to_vec();
    sorted.sort();
    sorted[sorted.len() / 2]
}

impl Orchestrator<'_> {

    /// Terminal status per the finalize rules.
    fn terminal_status(&self, run: &Run, exit: &LoopExit) -> RunStatus {
        if *exit == LoopExit::Cancelled {
            return RunStatus::Aborted;
        }

        let selected: Vec<&Patch> = run
            .patches
            .iter()
            .filter(|p| p.selected_state == SelectedState::Selected)
            .collect();
        let installed = selected
            .iter()
            .filter(|p| p.install_state == InstallState::Installed)
            .count();
        let failed = selected
            .iter()
            .filter(|p| p.install_state == InstallState::Failed)
            .count();
        let unfinished = selected
            .iter()
            .filter(|p| p.install_state == InstallState::NotStarted)
            .count();
        let excluded_deps = run
            .patches
            .iter()
            .filter(|p| {
                p.install_state == InstallState::Excluded
                    && p.error_message.as_deref() == Some(selection::REASON_EXCLUDED_DEP)
            })
            .count();

        if selected.is_empty() && excluded_deps == 0 {
            return RunStatus::Succeeded;
        }
        if installed == selected.len() && !selected.is_empty() {
            return RunStatus::Succeeded;
        }
        if selected.is_empty() && excluded_deps > 0 {
            // Whole transactions were excluded; nothing to do was the
            // correct outcome
            return RunStatus::Succeeded;
        }
        if installed > 0 {
            return RunStatus::CompletedWithErrors;
        }
        if failed == 0 && unfinished > 0 && *exit == LoopExit::WindowExhausted {
            // Ran out of window before anything failed
            return RunStatus::CompletedWithErrors;
        }
        RunStatus::Failed
    }

    /// Apply the reboot policy once the loop has exited.
    fn handle_reboot(&mut self, run: &mut Run, window: &MaintenanceWindow, cancelled: bool) {
        let adapter = self.environment.adapter();
        let manager = self.reboot_manager();
        let reboot_pending = adapter.reboot_required();

        match manager.decide(reboot_pending, cancelled) {
            RebootDecision::Skip { required } => {
                if required {
                    run.reboot_status = RebootStatus::Required;
                }
            }
            RebootDecision::Reboot => {
                if !window.reboot_time_available() {
                    warn!("Not enough window left to schedule a reboot");
                    run.reboot_status = RebootStatus::Required;
                    run.maintenance_window_exceeded = true;
                    self.errors.add(
                        "OPERATION_FAILED",
                        "There is not enough time left in the maintenance window to reboot",
                    );
                    return;
                }

                let marker = RebootMarker {
                    sequence: self.request.sequence,
                    activity_id: run.activity_id.clone(),
                    intended_status: run.status,
                    run_snapshot: run.clone(),
                };

                // The host must see Started before the machine goes down
                run.reboot_status = RebootStatus::Started;
                self.flush_terminal(run);

                match manager.start_reboot(&marker, &signals::sigterm_received) {
                    Ok(()) => info!("Reboot in progress"),
                    Err(e) => {
                        warn!("Reboot failed: {}", e);
                        run.reboot_status = RebootStatus::Failed;
                        self.errors.add("OPERATION_FAILED", e.to_string());
                    }
                }
            }
        }
    }
}
