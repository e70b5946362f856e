// src/orchestrator/assessment.rs

//! Assessment: enumerate without mutating
//!
//! One adapter call discovers the candidate set; cancellation is observed
//! only at its completion (there is nothing useful to interrupt inside).

use super::Orchestrator;
use crate::lockfile::InstanceLock;
use crate::model::{RebootStatus, Run, RunStatus};
use crate::selection;
use tracing::{info, warn};

impl Orchestrator<'_> {
    pub(super) fn run_assessment(&mut self) -> Run {
        let mut run = Run::new(&self.request.activity_id, self.request.operation.as_str());
        self.flush_progress(&run);

        let _lock = match InstanceLock::acquire_with_wait(self.environment.paths().lock_file()) {
            Ok(lock) => lock,
            Err(e) => {
                warn!("Assessment could not take the orchestrator lock: {}", e);
                self.errors.add("OPERATION_FAILED", e.to_string());
                run.seal(RunStatus::Failed);
                self.flush_terminal(&run);
                return run;
            }
        };

        let adapter = self.environment.adapter();
        match adapter.list_available_updates() {
            Ok(candidates) => {
                run.patches =
                    selection::build_assessment_rows(&candidates, &self.environment.os_tag());
                if adapter.reboot_required() {
                    run.reboot_status = RebootStatus::Required;
                }
                info!("Assessment discovered {} patches", run.patches.len());

                let control = self.environment.control();
                if control.is_cancelled() {
                    run.seal(RunStatus::Aborted);
                } else {
                    run.seal(RunStatus::Succeeded);
                }
            }
            Err(e) => {
                warn!("Assessment failed: {}", e);
                self.errors.add("PACKAGE_MANAGER_FAILURE", e.to_string());
                run.seal(RunStatus::Failed);
            }
        }

        self.flush_terminal(&run);
        run
    }
}
