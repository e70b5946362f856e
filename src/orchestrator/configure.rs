// src/orchestrator/configure.rs

//! ConfigurePatching: persist the requested automatic modes
//!
//! The modes land in a JSON file under the handler-state directory; the
//! external auto-assessment timer consumes it. No package state is
//! touched.

use super::Orchestrator;
use crate::model::{Run, RunStatus};
use serde_json::json;
use tracing::{info, warn};

impl Orchestrator<'_> {
    pub(super) fn run_configure_patching(&mut self) -> Run {
        let mut run = Run::new(&self.request.activity_id, self.request.operation.as_str());

        let modes = json!({
            "patchMode": self.request.patch_mode.map(|m| format!("{:?}", m)),
            "assessmentMode": self.request.assessment_mode.map(|m| format!("{:?}", m)),
            "maximumAssessmentInterval": self
                .request
                .maximum_assessment_interval
                .map(|d| d.as_secs()),
            "activityId": self.request.activity_id,
            "configuredAt": chrono::Utc::now().to_rfc3339(),
        });

        let path = self.environment.paths().patch_modes_file();
        match write_modes_file(&path, &modes) {
            Ok(()) => {
                info!("Persisted patch modes to {}", path.display());
                run.seal(RunStatus::Succeeded);
            }
            Err(e) => {
                warn!("Could not persist patch modes: {}", e);
                self.errors.add("OPERATION_FAILED", e.to_string());
                run.seal(RunStatus::Failed);
            }
        }

        self.flush_terminal(&run);
        run
    }
}

fn write_modes_file(path: &std::path::Path, modes: &serde_json::Value) -> std::io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_string_pretty(modes)?)?;
    std::fs::rename(&tmp, path)
}
