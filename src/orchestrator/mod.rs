// src/orchestrator/mod.rs

//! The run state machine
//!
//! `Ingest -> Plan -> Execute -> Finalize`, with assessment and
//! installation as the two Execute shapes and configure-patching /
//! no-operation handled entirely around the edges. The orchestrator owns
//! the `Run` record; adapters, filter, window and reboot manager are
//! handed in from the environment and never share mutable state. Every
//! status change flows through the writer channel.

mod assessment;
mod configure;
mod installation;
mod watcher;

pub use watcher::spawn_config_watcher;

use crate::config::{self, Operation, Request};
use crate::environment::Environment;
use crate::error::{Error, Result};
use crate::lockfile::InstanceLock;
use crate::model::{RebootStatus, Run, RunStatus};
use crate::reboot::{self, RebootManager};
use crate::signals;
use crate::status::{self, ErrorLog, StatusWriter, WriterHandle};
use std::path::Path;
use std::time::Duration;
use tracing::{error, info, warn};

/// Process exit codes shared with the host agent's shim
pub const EXIT_OK: i32 = 0;
pub const EXIT_ENVIRONMENT_ERROR: i32 = 52;
pub const EXIT_CONFIGURATION_ERROR: i32 = 53;

/// Orchestrates one run of one request.
pub struct Orchestrator<'a> {
    environment: &'a Environment,
    request: Request,
    writer: StatusWriter,
    errors: ErrorLog,
    reboot_command: Option<Vec<String>>,
    reboot_wait: Option<Duration>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(environment: &'a Environment, request: Request, writer: StatusWriter) -> Self {
        Self {
            environment,
            request,
            writer,
            errors: ErrorLog::new(),
            reboot_command: None,
            reboot_wait: None,
        }
    }

    /// Override the OS reboot command (test seam).
    pub fn with_reboot_command(mut self, command: Vec<String>, wait: Duration) -> Self {
        self.reboot_command = Some(command);
        self.reboot_wait = Some(wait);
        self
    }

    /// Drive the request to a sealed run. Never returns an error for
    /// in-run failures; those become the run's terminal state.
    pub fn run(&mut self) -> Run {
        info!(
            "Starting {} run, sequence {}, activity {}",
            self.request.operation.as_str(),
            self.request.sequence,
            self.request.activity_id
        );

        let run = match self.request.operation {
            Operation::Assessment => self.run_assessment(),
            Operation::Installation => self.run_installation(),
            Operation::ConfigurePatching => self.run_configure_patching(),
            Operation::NoOperation => self.run_no_operation(),
        };

        info!(
            "Run sealed: {:?} ({} patches)",
            run.status,
            run.patches.len()
        );
        run
    }

    fn reboot_manager(&self) -> RebootManager {
        let mut manager = RebootManager::new(
            self.request.reboot_setting,
            self.environment.paths().reboot_marker(),
        );
        if let Some(command) = &self.reboot_command {
            manager = manager.with_command(command.clone());
        }
        if let Some(wait) = self.reboot_wait {
            manager = manager.with_wait_timeout(wait);
        }
        manager
    }

    /// NoOperation: wait for any concurrent Execute phase to settle, then
    /// report success without touching package state.
    fn run_no_operation(&mut self) -> Run {
        let mut run = Run::new(&self.request.activity_id, Operation::NoOperation.as_str());

        match InstanceLock::acquire_with_wait(self.environment.paths().lock_file()) {
            Ok(lock) => {
                drop(lock);
                run.seal(RunStatus::Succeeded);
            }
            Err(e) => {
                warn!("NoOperation could not confirm the previous run settled: {}", e);
                self.errors.add("OPERATION_FAILED", e.to_string());
                run.seal(RunStatus::Failed);
            }
        }

        self.flush_terminal(&run);
        run
    }

    /// Compose and queue a progress snapshot for the current run state.
    fn flush_progress(&self, run: &Run) {
        self.writer.queue_progress(self.compose(run));
    }

    /// Compose and synchronously hand over a terminal snapshot.
    fn flush_terminal(&self, run: &Run) {
        self.writer.write_terminal(self.compose(run));
    }

    fn compose(&self, run: &Run) -> serde_json::Value {
        let operation = self.request.operation;
        let host_status = status::host_status(run.status);
        let code = i64::from(matches!(run.status, RunStatus::Failed | RunStatus::Aborted));
        let summary = match operation {
            Operation::Assessment | Operation::NoOperation => status::assessment_summary(
                run,
                &self.request,
                &self.errors,
                run.reboot_status == RebootStatus::Required,
            ),
            Operation::Installation => {
                status::installation_summary(run, &self.request, &self.errors)
            }
            Operation::ConfigurePatching => {
                status::configure_patching_summary(&self.request, &self.errors)
            }
        };
        status::compose_document(
            operation,
            host_status,
            code,
            status::substatus_name_for(operation),
            &summary,
            &[],
        )
    }
}

/// Seal and publish a run left behind by a reboot, if a marker exists.
///
/// Runs before any new request is read so that the previous run's terminal
/// row is the last write before the new run begins.
pub fn finalize_previous_run(environment: &Environment) -> Result<()> {
    let marker_path = environment.paths().reboot_marker();
    let Some(marker) = reboot::load_marker(&marker_path) else {
        return Ok(());
    };

    info!(
        "Found reboot marker for sequence {} (activity {}); sealing the previous run",
        marker.sequence, marker.activity_id
    );

    let sequence = marker.sequence;
    let run = reboot::finalize_resumed_run(marker);
    let status_path = environment.paths().status_file(sequence);
    let (writer, handle) = WriterHandle::spawn(status_path);

    // The resumed run has no live request; rebuild a minimal view of it
    // from the snapshot for the summary payload.
    let document = status::compose_document(
        Operation::Installation,
        status::host_status(run.status),
        0,
        status::PATCH_INSTALLATION_SUMMARY,
        &status::installation_summary_for_resumed(&run),
        &[],
    );
    writer.write_terminal(document);
    handle.shutdown();

    reboot::clear_marker(&marker_path);
    Ok(())
}

/// Full driver for one host invocation: resume any rebooted run, ingest
/// the newest settings, execute, and report the process exit code.
pub fn run_from_environment(descriptor_dir: &Path) -> i32 {
    let environment = match Environment::resolve(descriptor_dir) {
        Ok(environment) => environment,
        Err(e) => {
            error!("Environment resolution failed: {}", e);
            return EXIT_ENVIRONMENT_ERROR;
        }
    };

    if let Err(e) = signals::install_sigterm_handler() {
        warn!("Could not install SIGTERM handler: {}", e);
    }

    if let Err(e) = finalize_previous_run(&environment) {
        warn!("Could not finalize the pre-reboot run: {}", e);
    }

    let settings = match config::latest_settings(&environment.paths().config_folder) {
        Ok(Some(settings)) => settings,
        Ok(None) => {
            error!("No settings file found in the config folder");
            return EXIT_CONFIGURATION_ERROR;
        }
        Err(e) => {
            error!("Cannot enumerate settings: {}", e);
            return EXIT_ENVIRONMENT_ERROR;
        }
    };

    let status_path = environment.paths().status_file(settings.sequence);
    let (writer, handle) = WriterHandle::spawn(status_path);

    let raw = match config::read_raw(&settings) {
        Ok(raw) => raw,
        Err(e) => {
            error!("Cannot read settings sequence {}: {}", settings.sequence, e);
            write_ingest_failure(&writer, &e);
            handle.shutdown();
            return EXIT_CONFIGURATION_ERROR;
        }
    };

    let request = match Request::from_raw(settings.sequence, raw) {
        Ok(request) => request,
        Err(e) => {
            // The run started but the request is invalid: the outcome goes
            // into the status file and the process itself exits cleanly.
            error!("Configuration ingest failed: {}", e);
            write_ingest_failure(&writer, &e);
            handle.shutdown();
            return EXIT_OK;
        }
    };

    // Observe newer sequences carrying a NoOperation for this activity
    let watcher = spawn_config_watcher(
        environment.paths().config_folder.clone(),
        request.sequence,
        request.activity_id.clone(),
        environment.control(),
    );

    let mut orchestrator = Orchestrator::new(&environment, request, writer);
    orchestrator.run();

    watcher.stop();
    handle.shutdown();
    EXIT_OK
}

fn write_ingest_failure(writer: &StatusWriter, error: &Error) {
    let summary = serde_json::json!({
        "errors": {
            "code": 1,
            "details": [{"code": "OPERATION_FAILED", "message": error.to_string()}],
        },
    });
    let document = status::compose_document(
        Operation::NoOperation,
        status::STATUS_ERROR,
        1,
        status::PATCH_ASSESSMENT_SUMMARY,
        &summary,
        &[],
    );
    writer.write_terminal(document);
}
