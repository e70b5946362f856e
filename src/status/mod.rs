// src/status/mod.rs

//! Status document composition
//!
//! The host agent reads `<sequence>.status`: a JSON array holding exactly
//! one envelope, whose `formattedMessage.message` fields are themselves
//! JSON-encoded strings (the host contract predates sane nesting and every
//! consumer depends on it). Everything here is pure composition; the
//! writer task in `writer.rs` owns the file.

pub mod writer;

pub use writer::{StatusWriter, WriterHandle};

use crate::config::{Operation, Request};
use crate::model::{Classification, InstallState, Patch, Run, RunStatus, SelectedState};
use chrono::Utc;
use serde_json::{json, Value};

/// Host-contract status strings
pub const STATUS_TRANSITIONING: &str = "transitioning";
pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_WARNING: &str = "warning";
pub const STATUS_ERROR: &str = "error";

/// Substatus names the host recognizes
pub const PATCH_ASSESSMENT_SUMMARY: &str = "PatchAssessmentSummary";
pub const PATCH_INSTALLATION_SUMMARY: &str = "PatchInstallationSummary";
pub const CONFIGURE_PATCHING_SUMMARY: &str = "ConfigurePatchingSummary";

/// At most this many error details are kept in the status payload
pub const ERROR_LIMIT: usize = 5;
/// Individual error messages are clipped to this many characters
pub const ERROR_MESSAGE_LIMIT: usize = 128;

/// Bounded error list for the status payload. Keeps the most recent
/// `ERROR_LIMIT` entries and counts the rest.
#[derive(Debug, Clone, Default)]
pub struct ErrorLog {
    entries: Vec<(String, String)>,
    total: usize,
}

impl ErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, code: &str, message: impl Into<String>) {
        let mut message = message.into();
        if message.chars().count() > ERROR_MESSAGE_LIMIT {
            message = message.chars().take(ERROR_MESSAGE_LIMIT).collect();
        }
        self.total += 1;
        self.entries.insert(0, (code.to_string(), message));
        self.entries.truncate(ERROR_LIMIT);
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    pub fn total(&self) -> usize {
        self.total
    }

    fn to_json(&self) -> Value {
        json!({
            "code": if self.total == 0 { 0 } else { 1 },
            "details": self.entries.iter().map(|(code, message)| {
                json!({"code": code, "message": message})
            }).collect::<Vec<_>>(),
            "message": if self.total == 0 {
                "0 error/s reported.".to_string()
            } else {
                format!(
                    "{} error/s reported. The latest {} are shared in detail. To view all errors, review this log file on the machine.",
                    self.total,
                    self.entries.len()
                )
            },
        })
    }
}

/// Host status string for a run state.
pub fn host_status(status: RunStatus) -> &'static str {
    match status {
        RunStatus::InProgress => STATUS_TRANSITIONING,
        RunStatus::Succeeded => STATUS_SUCCESS,
        RunStatus::CompletedWithErrors => STATUS_WARNING,
        RunStatus::Failed | RunStatus::Aborted => STATUS_ERROR,
    }
}

fn patch_row_assessment(patch: &Patch) -> Value {
    json!({
        "patchId": patch.id,
        "name": patch.name,
        "version": patch.version,
        "classifications": [patch.classification.as_str()],
        "patchState": "Available",
    })
}

fn patch_row_installation(patch: &Patch) -> Value {
    let state = match (patch.selected_state, patch.install_state) {
        (SelectedState::NotSelected, _) => "NotSelected".to_string(),
        (_, state) => state.as_str().to_string(),
    };
    let mut row = json!({
        "patchId": patch.id,
        "name": patch.name,
        "version": patch.version,
        "classifications": [patch.classification.as_str()],
        "patchInstallationState": state,
    });
    if let Some(message) = &patch.error_message {
        row["errorMessage"] = json!(message);
    }
    row
}

/// Inner message of the `PatchAssessmentSummary` substatus.
pub fn assessment_summary(run: &Run, request: &Request, errors: &ErrorLog, reboot_pending: bool) -> Value {
    let critsec = run
        .patches
        .iter()
        .filter(|p| {
            matches!(
                p.classification,
                Classification::Critical | Classification::Security
            )
        })
        .count();
    json!({
        "assessmentActivityId": run.activity_id,
        "rebootPending": reboot_pending,
        "criticalAndSecurityPatchCount": critsec,
        "otherPatchCount": run.patches.len() - critsec,
        "patches": run.patches.iter().map(patch_row_assessment).collect::<Vec<_>>(),
        "startTime": request.start_time.to_rfc3339(),
        "lastModifiedTime": Utc::now().to_rfc3339(),
        "startedBy": "User",
        "errors": errors.to_json(),
    })
}

/// Inner message of the `PatchInstallationSummary` substatus.
pub fn installation_summary(run: &Run, request: &Request, errors: &ErrorLog) -> Value {
    json!({
        "installationActivityId": run.activity_id,
        "rebootStatus": run.reboot_status.as_str(),
        "maintenanceWindowExceeded": run.maintenance_window_exceeded,
        "notSelectedPatchCount": run.patches.iter()
            .filter(|p| p.selected_state == SelectedState::NotSelected).count(),
        "excludedPatchCount": run.count_install_state(InstallState::Excluded),
        "pendingPatchCount": run.count_install_state(InstallState::Pending)
            + run.count_install_state(InstallState::Installing),
        "installedPatchCount": run.count_install_state(InstallState::Installed),
        "failedPatchCount": run.count_install_state(InstallState::Failed),
        "patches": run.patches.iter().map(patch_row_installation).collect::<Vec<_>>(),
        "startTime": request.start_time.to_rfc3339(),
        "lastModifiedTime": Utc::now().to_rfc3339(),
        "errors": errors.to_json(),
    })
}

/// Installation summary for a run resumed from a reboot marker, where the
/// originating request is gone and the snapshot is all we have.
pub fn installation_summary_for_resumed(run: &Run) -> Value {
    json!({
        "installationActivityId": run.activity_id,
        "rebootStatus": run.reboot_status.as_str(),
        "maintenanceWindowExceeded": run.maintenance_window_exceeded,
        "notSelectedPatchCount": run.patches.iter()
            .filter(|p| p.selected_state == SelectedState::NotSelected).count(),
        "excludedPatchCount": run.count_install_state(InstallState::Excluded),
        "pendingPatchCount": run.count_install_state(InstallState::Pending),
        "installedPatchCount": run.count_install_state(InstallState::Installed),
        "failedPatchCount": run.count_install_state(InstallState::Failed),
        "patches": run.patches.iter().map(patch_row_installation).collect::<Vec<_>>(),
        "startTime": run.started_at.to_rfc3339(),
        "lastModifiedTime": Utc::now().to_rfc3339(),
        "errors": ErrorLog::new().to_json(),
    })
}

/// Inner message of the `ConfigurePatchingSummary` substatus.
pub fn configure_patching_summary(request: &Request, errors: &ErrorLog) -> Value {
    json!({
        "activityId": request.activity_id,
        "startTime": request.start_time.to_rfc3339(),
        "lastModifiedTime": Utc::now().to_rfc3339(),
        "patchMode": request.patch_mode.map(|m| format!("{:?}", m)),
        "assessmentMode": request.assessment_mode.map(|m| format!("{:?}", m)),
        "errors": errors.to_json(),
    })
}

fn substatus(name: &str, status: &str, code: i64, message: &Value) -> Value {
    json!({
        "name": name,
        "status": status,
        "code": code,
        "formattedMessage": {
            "lang": "en-US",
            // The host contract nests the payload as a JSON string
            "message": message.to_string(),
        },
    })
}

/// Compose the complete on-disk document.
pub fn compose_document(
    operation: Operation,
    status: &str,
    code: i64,
    substatus_name: &str,
    summary: &Value,
    extra_substatus: &[Value],
) -> Value {
    let mut substatuses = vec![substatus(substatus_name, status, code, summary)];
    substatuses.extend_from_slice(extra_substatus);

    json!([{
        "version": "1.0",
        "timestampUTC": Utc::now().to_rfc3339(),
        "status": {
            "name": "Guest Patch Management",
            "operation": operation.as_str(),
            "status": status,
            "code": code,
            "formattedMessage": {
                "lang": "en-US",
                "message": format!("{} {}", operation.as_str(), status),
            },
            "substatus": substatuses,
        },
    }])
}

/// Substatus name for an operation.
pub fn substatus_name_for(operation: Operation) -> &'static str {
    match operation {
        Operation::Assessment | Operation::NoOperation => PATCH_ASSESSMENT_SUMMARY,
        Operation::Installation => PATCH_INSTALLATION_SUMMARY,
        Operation::ConfigurePatching => CONFIGURE_PATCHING_SUMMARY,
    }
}
