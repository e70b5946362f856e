// src/managers/mod.rs

//! Package manager adapters
//!
//! One adapter per distribution family (apt, yum, dnf, zypper), all
//! implementing the same capability set. Differences in invocation lines,
//! exit-code conventions and output shapes stay inside each adapter; the
//! orchestrator and filter engine only ever see the uniform contract.
//!
//! Adapters never panic and never propagate raw process errors upward:
//! every operation returns a structured outcome. Transient failures (lock
//! contention, repository blips) are retried internally with backoff before
//! surfacing.

mod apt;
mod common;
mod dnf;
pub mod runner;
mod yum;
mod zypper;

pub use apt::AptManager;
pub use dnf::DnfManager;
pub use yum::YumManager;
pub use zypper::ZypperManager;

use crate::environment::{DistroFamily, DistroInfo};
use crate::error::{Error, Result};
use crate::model::Classification;
use runner::CommandRunner;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry budget for read-only discovery operations
pub const MAX_ASSESSMENT_RETRIES: u32 = 5;
/// Retry budget for mutating operations
pub const MAX_INSTALL_RETRIES: u32 = 3;

/// How an adapter operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterErrorKind {
    /// Worth retrying: lock contention, momentary repository failure
    Transient,
    /// This operation failed but the tool is healthy
    Failed,
    /// The package manager itself is unusable (corrupt cache, interrupted
    /// dpkg, missing binary); the run must stop
    Fatal,
}

/// Structured adapter failure; adapters return these as values.
#[derive(Debug, Clone)]
pub struct AdapterError {
    pub kind: AdapterErrorKind,
    pub message: String,
}

impl AdapterError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self { kind: AdapterErrorKind::Transient, message: message.into() }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self { kind: AdapterErrorKind::Failed, message: message.into() }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self { kind: AdapterErrorKind::Fatal, message: message.into() }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind == AdapterErrorKind::Fatal
    }
}

impl std::fmt::Display for AdapterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

pub type AdapterResult<T> = std::result::Result<T, AdapterError>;

/// An update the package manager can install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailableUpdate {
    pub name: String,
    pub version: String,
    pub classification: Classification,
}

/// An installed package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledPackage {
    pub name: String,
    pub version: String,
}

/// Result of a dry-run install of one or more packages.
#[derive(Debug, Clone, Default)]
pub struct Simulation {
    pub requested: Vec<String>,
    /// Packages the transaction would pull in beyond those requested
    pub additional_dependencies: Vec<String>,
    /// Packages the transaction would remove or conflict with
    pub conflicts: Vec<String>,
}

/// Outcome of a single-package install attempt. Never an error: a non-zero
/// exit is data, attributed to that one patch row.
#[derive(Debug, Clone)]
pub struct InstallOutcome {
    pub exit_code: i32,
    pub succeeded: bool,
    pub reboot_required: bool,
    pub stdout: String,
    pub stderr: String,
    /// Set when the attempt failed; also set alongside `succeeded=false`
    /// when the tool exited 0 but the version never landed
    pub error: Option<String>,
    /// The tool is beyond repair; the orchestrator must abort the run
    pub fatal: bool,
}

impl InstallOutcome {
    pub fn failure(exit_code: i32, error: impl Into<String>) -> Self {
        Self {
            exit_code,
            succeeded: false,
            reboot_required: false,
            stdout: String::new(),
            stderr: String::new(),
            error: Some(error.into()),
            fatal: false,
        }
    }
}

/// Capability-uniform contract over a native package manager.
pub trait PackageManager: Send + Sync {
    fn family(&self) -> DistroFamily;

    /// Enumerate updates available for installation. Classification is
    /// `Unknown` when the underlying tool does not expose one.
    fn list_available_updates(&self) -> AdapterResult<Vec<AvailableUpdate>>;

    /// Enumerate installed packages.
    fn list_installed(&self) -> AdapterResult<Vec<InstalledPackage>>;

    /// Classify the named packages. Names absent from the result map are
    /// `Unknown` to the caller.
    fn classify(&self, names: &[String]) -> AdapterResult<HashMap<String, Classification>>;

    /// Dry-run an install to discover the dependency closure.
    fn simulate_install(&self, names: &[String]) -> AdapterResult<Simulation>;

    /// Install exactly one package, best effort. Bulk installs are
    /// decomposed by the orchestrator so failures stay attributable.
    fn install_one(&self, name: &str, version: Option<&str>) -> InstallOutcome;

    /// Whether the system signals that a reboot is pending.
    fn reboot_required(&self) -> bool;
}

/// Select the adapter for a detected distribution.
pub fn adapter_for(
    distro: &DistroInfo,
    runner: Arc<CommandRunner>,
) -> Result<Arc<dyn PackageManager>> {
    let adapter: Arc<dyn PackageManager> = match distro.family {
        DistroFamily::Apt => Arc::new(AptManager::new(runner)),
        DistroFamily::Yum => Arc::new(YumManager::new(runner)),
        DistroFamily::Dnf => Arc::new(DnfManager::new(runner)),
        DistroFamily::Zypper => Arc::new(ZypperManager::new(runner)),
    };
    if !adapter_binary_present(distro.family) {
        return Err(Error::UnsupportedDistro(format!(
            "Distribution {} resolved to {} but the tool is not on PATH",
            distro.name,
            distro.family
        )));
    }
    Ok(adapter)
}

fn adapter_binary_present(family: DistroFamily) -> bool {
    let binary = match family {
        DistroFamily::Apt => "apt-get",
        DistroFamily::Yum => "yum",
        DistroFamily::Dnf => "dnf",
        DistroFamily::Zypper => "zypper",
    };
    std::process::Command::new(binary)
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Run `op` up to `attempts` times, backing off exponentially between
/// transient failures. Non-transient errors surface immediately.
pub(crate) fn with_retries<T>(
    attempts: u32,
    label: &str,
    mut op: impl FnMut() -> AdapterResult<T>,
) -> AdapterResult<T> {
    let mut last = None;
    for attempt in 0..attempts {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if e.kind == AdapterErrorKind::Transient && attempt + 1 < attempts => {
                let backoff = Duration::from_secs(2u64.saturating_pow(attempt).min(30));
                warn!(
                    "{} failed transiently (attempt {}/{}): {}; retrying in {:?}",
                    label,
                    attempt + 1,
                    attempts,
                    e.message,
                    backoff
                );
                std::thread::sleep(backoff);
                last = Some(e);
            }
            Err(e) => {
                debug!("{} failed: {}", label, e.message);
                return Err(e);
            }
        }
    }
    Err(last.unwrap_or_else(|| AdapterError::failed(format!("{} exhausted retries", label))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_with_retries_recovers_from_transient() {
        let calls = AtomicU32::new(0);
        let result = with_retries(3, "probe", || {
            if calls.fetch_add(1, Ordering::SeqCst) < 1 {
                Err(AdapterError::transient("lock held"))
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_with_retries_does_not_retry_fatal() {
        let calls = AtomicU32::new(0);
        let result: AdapterResult<()> = with_retries(5, "probe", || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(AdapterError::fatal("cache corrupt"))
        });
        assert!(result.unwrap_err().is_fatal());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_with_retries_surfaces_last_transient() {
        let result: AdapterResult<()> =
            with_retries(2, "probe", || Err(AdapterError::transient("still locked")));
        let err = result.unwrap_err();
        assert_eq!(err.kind, AdapterErrorKind::Transient);
    }
}
