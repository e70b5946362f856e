// src/model.rs

//! Patch and run records
//!
//! These are the records the orchestrator mutates and the status writer
//! serializes. State enums are closed sets; transitions that would regress
//! a terminal state are rejected at the setter so no caller can violate
//! monotonicity by accident.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Patch classification, as reported by the package manager's advisory
/// system or repository pocket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Classification {
    Critical,
    Security,
    Other,
    Unknown,
}

impl Classification {
    /// Sort rank: Critical < Security < Other < Unknown
    pub fn rank(&self) -> u8 {
        match self {
            Self::Critical => 0,
            Self::Security => 1,
            Self::Other => 2,
            Self::Unknown => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "Critical",
            Self::Security => "Security",
            Self::Other => "Other",
            Self::Unknown => "Unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Critical" => Some(Self::Critical),
            "Security" => Some(Self::Security),
            "Other" => Some(Self::Other),
            "Unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a patch made it through the filter engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectedState {
    Selected,
    NotSelected,
    Excluded,
    Pending,
}

/// Installation progress for a single patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstallState {
    Pending,
    Installing,
    Installed,
    Failed,
    NotStarted,
    Excluded,
}

impl InstallState {
    /// Terminal states never transition out.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Installed | Self::Failed | Self::Excluded)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Installing => "Installing",
            Self::Installed => "Installed",
            Self::Failed => "Failed",
            Self::NotStarted => "NotStarted",
            Self::Excluded => "Excluded",
        }
    }
}

/// A single patch row within a run. Identity is `(name, version)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Patch {
    /// Stable within a run: `<name>_<version>_<os-name>_<os-version>`
    pub id: String,
    pub name: String,
    pub version: String,
    pub classification: Classification,
    pub selected_state: SelectedState,
    pub install_state: InstallState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Patch {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        classification: Classification,
        os_tag: &str,
    ) -> Self {
        let name = name.into();
        let version = version.into();
        Self {
            id: format!("{}_{}_{}", name, version, os_tag),
            name,
            version,
            classification,
            selected_state: SelectedState::Pending,
            install_state: InstallState::Pending,
            error_message: None,
        }
    }

    /// Update the install state, preserving terminal states.
    ///
    /// Returns false when the transition was rejected because the patch
    /// already reached a terminal state.
    pub fn set_install_state(&mut self, next: InstallState) -> bool {
        if self.install_state.is_terminal() && self.install_state != next {
            return false;
        }
        self.install_state = next;
        true
    }

    /// Mark the patch excluded, forcing both state axes into agreement.
    pub fn mark_excluded(&mut self, reason: impl Into<String>) {
        self.selected_state = SelectedState::Excluded;
        self.install_state = InstallState::Excluded;
        self.error_message = Some(reason.into());
    }

    pub fn mark_not_selected(&mut self) {
        self.selected_state = SelectedState::NotSelected;
        if !self.install_state.is_terminal() {
            self.install_state = InstallState::NotStarted;
        }
    }
}

/// Run-level terminal status. Monotone once terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    InProgress,
    Succeeded,
    CompletedWithErrors,
    Failed,
    Aborted,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

/// Reboot progress across the tail of an installation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RebootStatus {
    NotStarted,
    Required,
    Started,
    Completed,
    Failed,
}

impl RebootStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "NotStarted",
            Self::Required => "Required",
            Self::Started => "Started",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
        }
    }
}

/// One execution of an operation against one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub activity_id: String,
    pub operation: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub patches: Vec<Patch>,
    pub reboot_status: RebootStatus,
    pub maintenance_window_exceeded: bool,
    pub substatus_messages: Vec<String>,
}

impl Run {
    pub fn new(activity_id: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            activity_id: activity_id.into(),
            operation: operation.into(),
            started_at: Utc::now(),
            completed_at: None,
            status: RunStatus::InProgress,
            patches: Vec::new(),
            reboot_status: RebootStatus::NotStarted,
            maintenance_window_exceeded: false,
            substatus_messages: Vec::new(),
        }
    }

    /// Seal the run. Terminal status is monotone: once set, later calls
    /// are ignored.
    pub fn seal(&mut self, status: RunStatus) {
        if self.status.is_terminal() {
            return;
        }
        self.status = status;
        self.completed_at = Some(Utc::now());
    }

    pub fn patch_mut(&mut self, name: &str, version: &str) -> Option<&mut Patch> {
        self.patches
            .iter_mut()
            .find(|p| p.name == name && p.version == version)
    }

    /// Counts used by the installation summary payload.
    pub fn count_install_state(&self, state: InstallState) -> usize {
        self.patches
            .iter()
            .filter(|p| p.install_state == state)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_rank_ordering() {
        assert!(Classification::Critical.rank() < Classification::Security.rank());
        assert!(Classification::Security.rank() < Classification::Other.rank());
        assert!(Classification::Other.rank() < Classification::Unknown.rank());
    }

    #[test]
    fn test_install_state_never_regresses_from_terminal() {
        let mut patch = Patch::new("openssl", "1.1.1k", Classification::Security, "ubuntu_20.04");
        assert!(patch.set_install_state(InstallState::Installing));
        assert!(patch.set_install_state(InstallState::Installed));
        assert!(!patch.set_install_state(InstallState::Pending));
        assert_eq!(patch.install_state, InstallState::Installed);
    }

    #[test]
    fn test_excluded_patch_satisfies_state_lattice() {
        let mut patch = Patch::new("kernel-core", "5.14.0", Classification::Critical, "rhel_9");
        patch.mark_excluded("excluded-dep");
        assert_eq!(patch.selected_state, SelectedState::Excluded);
        assert_eq!(patch.install_state, InstallState::Excluded);
    }

    #[test]
    fn test_run_status_is_monotone() {
        let mut run = Run::new("a1", "Installation");
        run.seal(RunStatus::Succeeded);
        let sealed_at = run.completed_at;
        run.seal(RunStatus::Failed);
        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.completed_at, sealed_at);
    }

    #[test]
    fn test_patch_id_is_stable() {
        let patch = Patch::new("vim", "8.2", Classification::Other, "ubuntu_20.04");
        assert_eq!(patch.id, "vim_8.2_ubuntu_20.04");
    }
}
