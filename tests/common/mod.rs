// tests/common/mod.rs

//! Shared test utilities: a scriptable package manager adapter and
//! environment builders for orchestrator integration tests.

#![allow(dead_code)]

use guestpatch::config::RawSettings;
use guestpatch::environment::{DistroFamily, DistroInfo, Environment, HandlerPaths};
use guestpatch::managers::{
    AdapterError, AdapterResult, AvailableUpdate, InstallOutcome, InstalledPackage,
    PackageManager, Simulation,
};
use guestpatch::model::Classification;
use guestpatch::Request;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Scriptable in-memory package manager.
#[derive(Default)]
pub struct MockAdapter {
    pub updates: Vec<AvailableUpdate>,
    /// name -> additional packages a transaction would pull in
    pub dependencies: HashMap<String, Vec<String>>,
    /// packages whose install should fail
    pub failing: HashSet<String>,
    /// package whose install reports a fatal tool condition
    pub fatal_package: Option<String>,
    pub install_delay: Duration,
    pub reboot_required: bool,
    pub fail_listing: bool,
    /// names passed to install_one, in order
    pub installs: Mutex<Vec<String>>,
}

impl MockAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_update(mut self, name: &str, version: &str, classification: Classification) -> Self {
        self.updates.push(AvailableUpdate {
            name: name.to_string(),
            version: version.to_string(),
            classification,
        });
        self
    }

    pub fn with_dependency(mut self, name: &str, dep: &str) -> Self {
        self.dependencies
            .entry(name.to_string())
            .or_default()
            .push(dep.to_string());
        self
    }

    pub fn with_failing(mut self, name: &str) -> Self {
        self.failing.insert(name.to_string());
        self
    }

    pub fn with_install_delay(mut self, delay: Duration) -> Self {
        self.install_delay = delay;
        self
    }

    pub fn install_count(&self) -> usize {
        self.installs.lock().unwrap().len()
    }

    pub fn installed_names(&self) -> Vec<String> {
        self.installs.lock().unwrap().clone()
    }
}

impl PackageManager for MockAdapter {
    fn family(&self) -> DistroFamily {
        DistroFamily::Apt
    }

    fn list_available_updates(&self) -> AdapterResult<Vec<AvailableUpdate>> {
        if self.fail_listing {
            return Err(AdapterError::failed("listing failed by test design"));
        }
        Ok(self.updates.clone())
    }

    fn list_installed(&self) -> AdapterResult<Vec<InstalledPackage>> {
        Ok(Vec::new())
    }

    fn classify(&self, names: &[String]) -> AdapterResult<HashMap<String, Classification>> {
        let mut map = HashMap::new();
        for name in names {
            if let Some(update) = self.updates.iter().find(|u| &u.name == name) {
                map.insert(name.clone(), update.classification);
            }
        }
        Ok(map)
    }

    fn simulate_install(&self, names: &[String]) -> AdapterResult<Simulation> {
        let mut additional = Vec::new();
        for name in names {
            for dep in self.dependencies.get(name).cloned().unwrap_or_default() {
                if !names.contains(&dep) && !additional.contains(&dep) {
                    additional.push(dep);
                }
            }
        }
        Ok(Simulation {
            requested: names.to_vec(),
            additional_dependencies: additional,
            conflicts: Vec::new(),
        })
    }

    fn install_one(&self, name: &str, _version: Option<&str>) -> InstallOutcome {
        if !self.install_delay.is_zero() {
            std::thread::sleep(self.install_delay);
        }
        self.installs.lock().unwrap().push(name.to_string());

        if self.fatal_package.as_deref() == Some(name) {
            let mut outcome = InstallOutcome::failure(1, "package database corrupted");
            outcome.fatal = true;
            return outcome;
        }
        if self.failing.contains(name) {
            return InstallOutcome::failure(100, format!("Install of {} failed", name));
        }
        InstallOutcome {
            exit_code: 0,
            succeeded: true,
            reboot_required: self.reboot_required,
            stdout: String::new(),
            stderr: String::new(),
            error: None,
            fatal: false,
        }
    }

    fn reboot_required(&self) -> bool {
        self.reboot_required
    }
}

/// A ready-to-run environment rooted in a temp directory.
pub struct TestEnv {
    pub temp: TempDir,
    pub environment: Environment,
    pub adapter: Arc<MockAdapter>,
}

pub fn setup_env(adapter: MockAdapter) -> TestEnv {
    let temp = TempDir::new().unwrap();
    let paths = HandlerPaths {
        log_folder: temp.path().join("log"),
        config_folder: temp.path().join("config"),
        status_folder: temp.path().join("status"),
        state_folder: temp.path().join("state"),
    };
    for dir in [
        &paths.log_folder,
        &paths.config_folder,
        &paths.status_folder,
        &paths.state_folder,
    ] {
        std::fs::create_dir_all(dir).unwrap();
    }

    let distro = DistroInfo {
        name: "Ubuntu".to_string(),
        version: "20.04".to_string(),
        family: DistroFamily::Apt,
    };
    let adapter = Arc::new(adapter);
    let environment = Environment::from_parts(
        paths,
        distro,
        Arc::clone(&adapter) as Arc<dyn PackageManager>,
    );
    TestEnv { temp, environment, adapter }
}

pub fn raw_settings(operation: &str, activity_id: &str) -> RawSettings {
    RawSettings {
        operation: operation.to_string(),
        activity_id: activity_id.to_string(),
        start_time: chrono::Utc::now().to_rfc3339(),
        maximum_duration: None,
        reboot_setting: None,
        classifications_to_include: vec![],
        patches_to_include: vec![],
        patches_to_exclude: vec![],
        patch_mode: None,
        assessment_mode: None,
        maximum_assessment_interval: None,
        extra: BTreeMap::new(),
    }
}

pub fn assessment_request(sequence: u64) -> Request {
    Request::from_raw(sequence, raw_settings("Assessment", "a1")).unwrap()
}

pub fn installation_request(
    sequence: u64,
    duration: &str,
    reboot: &str,
    includes: &[&str],
    excludes: &[&str],
    classifications: &[&str],
) -> Request {
    let mut raw = raw_settings("Installation", "a1");
    raw.maximum_duration = Some(duration.to_string());
    raw.reboot_setting = Some(reboot.to_string());
    raw.patches_to_include = includes.iter().map(|s| s.to_string()).collect();
    raw.patches_to_exclude = excludes.iter().map(|s| s.to_string()).collect();
    raw.classifications_to_include = classifications.iter().map(|s| s.to_string()).collect();
    Request::from_raw(sequence, raw).unwrap()
}

/// Read `<sequence>.status` and return (envelope, decoded inner message).
pub fn read_status(env: &TestEnv, sequence: u64) -> (Value, Value) {
    let path = env.environment.paths().status_file(sequence);
    let content = std::fs::read_to_string(&path).unwrap();
    let parsed: Value = serde_json::from_str(&content).unwrap();
    let envelope = parsed[0].clone();
    let message = envelope["status"]["substatus"][0]["formattedMessage"]["message"]
        .as_str()
        .unwrap();
    let inner: Value = serde_json::from_str(message).unwrap();
    (envelope, inner)
}

/// Patch rows from an inner summary, keyed by name.
pub fn patch_states(inner: &Value) -> HashMap<String, String> {
    inner["patches"]
        .as_array()
        .unwrap()
        .iter()
        .map(|row| {
            let state = row
                .get("patchInstallationState")
                .or_else(|| row.get("patchState"))
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            (
                row["name"].as_str().unwrap().to_string(),
                state.to_string(),
            )
        })
        .collect()
}

/// Run one request through the orchestrator and hand back the sealed run.
pub fn run_orchestrator(env: &TestEnv, request: Request) -> guestpatch::Run {
    run_orchestrator_with(env, request, None)
}

pub fn run_orchestrator_with(
    env: &TestEnv,
    request: Request,
    reboot_command: Option<(Vec<String>, Duration)>,
) -> guestpatch::Run {
    let sequence = request.sequence;
    let status_path = env.environment.paths().status_file(sequence);
    let (writer, handle) = guestpatch::WriterHandle::spawn(status_path);

    let mut orchestrator = guestpatch::Orchestrator::new(&env.environment, request, writer);
    if let Some((command, wait)) = reboot_command {
        orchestrator = orchestrator.with_reboot_command(command, wait);
    }
    let run = orchestrator.run();
    handle.shutdown();
    run
}
