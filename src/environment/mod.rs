// src/environment/mod.rs

//! Host environment descriptor and distribution resolution
//!
//! The host agent drops a `HandlerEnvironment.json` next to the extension
//! describing where logs, config and status live. This module reads it,
//! detects the distribution, and hands back the matching package manager
//! adapter. Everything downstream receives these as explicit handles; no
//! module-level globals.

mod distro;

pub use distro::{detect_distro, DistroFamily, DistroInfo};

use crate::error::{Error, Result};
use crate::managers::runner::CommandRunner;
use crate::managers::{self, PackageManager};
use crate::window::RunControl;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// File name of the host-provided environment descriptor
pub const HANDLER_ENVIRONMENT_FILE: &str = "HandlerEnvironment.json";

/// Directory (under the config folder's parent) holding orchestrator state:
/// the advisory lock, the reboot marker, and the persisted patch modes.
pub const HANDLER_STATE_DIR: &str = "state";

/// Runtime directories resolved from the environment descriptor.
#[derive(Debug, Clone)]
pub struct HandlerPaths {
    pub log_folder: PathBuf,
    pub config_folder: PathBuf,
    pub status_folder: PathBuf,
    pub state_folder: PathBuf,
}

impl HandlerPaths {
    pub fn lock_file(&self) -> PathBuf {
        self.state_folder.join("orchestrator.lock")
    }

    pub fn reboot_marker(&self) -> PathBuf {
        self.state_folder.join(".reboot.marker")
    }

    pub fn patch_modes_file(&self) -> PathBuf {
        self.state_folder.join("patch.modes.json")
    }

    pub fn status_file(&self, sequence: u64) -> PathBuf {
        self.status_folder.join(format!("{}.status", sequence))
    }

    pub fn log_file(&self, sequence: u64) -> PathBuf {
        self.log_folder.join(format!("{}.core.log", sequence))
    }
}

// HandlerEnvironment.json is an array of one object:
// [{"version": 1.0, "handlerEnvironment": {"logFolder": ..., ...}}]
#[derive(Debug, Deserialize)]
struct HandlerEnvelope {
    #[serde(rename = "handlerEnvironment")]
    handler_environment: HandlerEnvironmentJson,
}

#[derive(Debug, Deserialize)]
struct HandlerEnvironmentJson {
    #[serde(rename = "logFolder")]
    log_folder: PathBuf,
    #[serde(rename = "configFolder")]
    config_folder: PathBuf,
    #[serde(rename = "statusFolder")]
    status_folder: PathBuf,
}

/// Resolved execution environment: directories, the active adapter, and the
/// shared run control the command runner observes.
pub struct Environment {
    paths: HandlerPaths,
    distro: DistroInfo,
    control: Arc<RunControl>,
    adapter: Arc<dyn PackageManager>,
}

impl Environment {
    /// Resolve the environment from a descriptor directory.
    ///
    /// Reads `HandlerEnvironment.json` from `descriptor_dir`, detects the
    /// distribution from the filesystem root, and selects an adapter.
    pub fn resolve(descriptor_dir: &Path) -> Result<Self> {
        let paths = Self::read_descriptor(descriptor_dir)?;
        let distro = detect_distro(Path::new("/"))?;
        let control = Arc::new(RunControl::new());
        let runner = Arc::new(CommandRunner::new(Arc::clone(&control)));
        let adapter = managers::adapter_for(&distro, runner)?;
        info!(
            "Resolved environment: distro={} {}, package manager={}",
            distro.name,
            distro.version,
            adapter.family()
        );
        Ok(Self { paths, distro, control, adapter })
    }

    /// Construct an environment from pre-resolved parts (tests, resume paths).
    pub fn from_parts(
        paths: HandlerPaths,
        distro: DistroInfo,
        adapter: Arc<dyn PackageManager>,
    ) -> Self {
        Self {
            paths,
            distro,
            control: Arc::new(RunControl::new()),
            adapter,
        }
    }

    /// Shared deadline/cancellation control for this process.
    pub fn control(&self) -> Arc<RunControl> {
        Arc::clone(&self.control)
    }

    fn read_descriptor(descriptor_dir: &Path) -> Result<HandlerPaths> {
        let descriptor = descriptor_dir.join(HANDLER_ENVIRONMENT_FILE);
        debug!("Reading environment descriptor: {}", descriptor.display());

        let content = std::fs::read_to_string(&descriptor).map_err(|e| {
            Error::Environment(format!(
                "Cannot read {}: {}",
                descriptor.display(),
                e
            ))
        })?;

        let envelopes: Vec<HandlerEnvelope> = serde_json::from_str(&content)
            .map_err(|e| Error::Environment(format!("Malformed environment descriptor: {}", e)))?;
        let envelope = envelopes
            .into_iter()
            .next()
            .ok_or_else(|| Error::Environment("Environment descriptor array is empty".to_string()))?;

        let he = envelope.handler_environment;
        let state_folder = he
            .config_folder
            .parent()
            .unwrap_or(&he.config_folder)
            .join(HANDLER_STATE_DIR);
        std::fs::create_dir_all(&state_folder)?;

        Ok(HandlerPaths {
            log_folder: he.log_folder,
            config_folder: he.config_folder,
            status_folder: he.status_folder,
            state_folder,
        })
    }

    pub fn paths(&self) -> &HandlerPaths {
        &self.paths
    }

    pub fn distro(&self) -> &DistroInfo {
        &self.distro
    }

    pub fn adapter(&self) -> Arc<dyn PackageManager> {
        Arc::clone(&self.adapter)
    }

    /// `<os-name>_<os-version>` tag used for stable patch ids.
    pub fn os_tag(&self) -> String {
        format!(
            "{}_{}",
            self.distro.name.replace(' ', "_"),
            self.distro.version
        )
    }
}
