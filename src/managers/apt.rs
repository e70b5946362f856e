// src/managers/apt.rs

//! apt adapter for Debian/Ubuntu
//!
//! Discovery runs `apt-get -s dist-upgrade` and reads the `Inst` lines;
//! classification is derived from the source pocket on each line (a
//! `-security` pocket means Security, any other pocket means Other, no
//! pocket at all means Unknown). Installs are one package at a time with
//! `--only-upgrade`, followed by a dpkg-level verification that the version
//! actually landed.

use super::runner::CommandRunner;
use super::{
    with_retries, AdapterError, AdapterResult, AvailableUpdate, InstallOutcome, InstalledPackage,
    PackageManager, Simulation, MAX_ASSESSMENT_RETRIES,
};
use crate::environment::DistroFamily;
use crate::model::Classification;
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

const REBOOT_REQUIRED_FILE: &str = "/var/run/reboot-required";

const STR_DPKG_INTERRUPTED: &str = "dpkg was interrupted";
const LOCK_MARKERS: &[&str] = &[
    "Could not get lock",
    "Unable to acquire the dpkg frontend lock",
    "is another process using it?",
];

pub struct AptManager {
    runner: Arc<CommandRunner>,
    available_cache: Mutex<Option<Vec<AvailableUpdate>>>,
}

impl AptManager {
    pub fn new(runner: Arc<CommandRunner>) -> Self {
        Self { runner, available_cache: Mutex::new(None) }
    }

    fn invoke(&self, args: &[&str]) -> AdapterResult<(i32, String)> {
        let output = self
            .runner
            .run_with_env("apt-get", args, &[("DEBIAN_FRONTEND", "noninteractive")])
            .map_err(|e| AdapterError::fatal(format!("Failed to run apt-get: {}", e)))?;

        let combined = output.combined();
        if combined.contains(STR_DPKG_INTERRUPTED) {
            return Err(AdapterError::fatal(
                "dpkg was interrupted; run 'dpkg --configure -a' to repair the package manager",
            ));
        }
        if output.terminated {
            return Err(AdapterError::failed("apt-get was terminated by the deadline"));
        }
        if !output.success() && LOCK_MARKERS.iter().any(|m| combined.contains(m)) {
            return Err(AdapterError::transient(format!(
                "apt lock contention (exit {})",
                output.exit_code
            )));
        }
        Ok((output.exit_code, combined))
    }

    fn available_updates_cached(&self) -> AdapterResult<Vec<AvailableUpdate>> {
        if let Some(cached) = self.available_cache.lock().unwrap().as_ref() {
            return Ok(cached.clone());
        }
        let updates = with_retries(MAX_ASSESSMENT_RETRIES, "apt dist-upgrade simulation", || {
            let (code, out) = self.invoke(&["-q", "-s", "-o", "Debug::NoLocking=true", "dist-upgrade"])?;
            if code != 0 {
                return Err(AdapterError::failed(format!(
                    "apt-get -s dist-upgrade exited {}",
                    code
                )));
            }
            Ok(parse_dist_upgrade_simulation(&out))
        })?;
        debug!("Discovered {} upgradable package entries", updates.len());
        *self.available_cache.lock().unwrap() = Some(updates.clone());
        Ok(updates)
    }

    fn verify_installed(&self, name: &str, version: Option<&str>) -> bool {
        let output = self.runner.run(
            "dpkg-query",
            &["-W", "-f", "${Package}|${Version}|${Status}\n", name],
        );
        match output {
            Ok(out) if out.success() => parse_dpkg_status(&out.stdout, name, version),
            _ => false,
        }
    }
}

impl PackageManager for AptManager {
    fn family(&self) -> DistroFamily {
        DistroFamily::Apt
    }

    fn list_available_updates(&self) -> AdapterResult<Vec<AvailableUpdate>> {
        self.available_updates_cached()
    }

    fn list_installed(&self) -> AdapterResult<Vec<InstalledPackage>> {
        let output = self
            .runner
            .run("dpkg-query", &["-W", "-f", "${Package}|${Version}\n"])
            .map_err(|e| AdapterError::fatal(format!("Failed to run dpkg-query: {}", e)))?;
        if !output.success() {
            return Err(AdapterError::failed(format!(
                "dpkg-query exited {}: {}",
                output.exit_code, output.stderr
            )));
        }

        Ok(output
            .stdout
            .lines()
            .filter_map(|line| {
                let (name, version) = line.split_once('|')?;
                Some(InstalledPackage {
                    name: name.trim().to_string(),
                    version: version.trim().to_string(),
                })
            })
            .collect())
    }

    fn classify(&self, names: &[String]) -> AdapterResult<HashMap<String, Classification>> {
        let available = self.available_updates_cached()?;
        let mut map = HashMap::new();
        for name in names {
            if let Some(update) = available.iter().find(|u| &u.name == name) {
                map.insert(name.clone(), update.classification);
            }
        }
        Ok(map)
    }

    fn simulate_install(&self, names: &[String]) -> AdapterResult<Simulation> {
        if names.is_empty() {
            return Ok(Simulation::default());
        }
        let mut args = vec!["-q", "-y", "-s", "--only-upgrade", "install"];
        let name_refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
        args.extend(&name_refs);

        let (code, out) = self.invoke(&args)?;
        if code != 0 {
            return Err(AdapterError::failed(format!(
                "apt-get -s install exited {}: {}",
                code,
                first_lines(&out, 4)
            )));
        }

        let touched = parse_dist_upgrade_simulation(&out);
        let additional_dependencies = touched
            .iter()
            .map(|u| u.name.clone())
            .filter(|n| !names.contains(n))
            .collect();

        Ok(Simulation {
            requested: names.to_vec(),
            additional_dependencies,
            conflicts: parse_removals(&out),
        })
    }

    fn install_one(&self, name: &str, version: Option<&str>) -> InstallOutcome {
        let spec = match version {
            Some(v) => format!("{}={}", name, v),
            None => name.to_string(),
        };

        let result = self.runner.run_with_env(
            "apt-get",
            &["-q", "-y", "--only-upgrade", "install", &spec],
            &[("DEBIAN_FRONTEND", "noninteractive")],
        );
        let output = match result {
            Ok(o) => o,
            Err(e) => return InstallOutcome::failure(-1, format!("Failed to run apt-get: {}", e)),
        };

        let combined = output.combined();
        if combined.contains(STR_DPKG_INTERRUPTED) {
            let mut outcome = InstallOutcome::failure(
                output.exit_code,
                "dpkg was interrupted; run 'dpkg --configure -a' to repair the package manager",
            );
            outcome.fatal = true;
            return outcome;
        }

        let installed = output.success() && self.verify_installed(name, version);
        if output.success() && !installed {
            warn!("apt-get exited 0 for {} but the version is not installed", spec);
        }

        InstallOutcome {
            exit_code: output.exit_code,
            succeeded: installed,
            reboot_required: self.reboot_required(),
            stdout: output.stdout,
            stderr: output.stderr,
            error: if installed {
                None
            } else {
                Some(format!(
                    "Install of {} did not complete (exit {})",
                    spec, output.exit_code
                ))
            },
            fatal: false,
        }
    }

    fn reboot_required(&self) -> bool {
        Path::new(REBOOT_REQUIRED_FILE).exists()
    }
}

/// Parse `Inst` lines out of an `apt-get -s` run.
///
/// ```text
/// Inst coreutils [8.25-2ubuntu2] (8.25-2ubuntu3~16.10 Ubuntu:16.10/yakkety-updates [amd64])
/// Inst openssl [1.1.1f-1ubuntu2.19] (1.1.1f-1ubuntu2.20 Ubuntu:20.04/focal-security [amd64])
/// ```
pub(crate) fn parse_dist_upgrade_simulation(output: &str) -> Vec<AvailableUpdate> {
    let pattern = Regex::new(r"(?m)^Inst\s+(\S+)\s+(?:\[.*?\]\s+)?\((\S+)(?:\s+(\S*))?\s+\[.*?\]")
        .expect("static regex");

    let mut updates = Vec::new();
    for caps in pattern.captures_iter(output) {
        let name = caps[1].to_string();
        let version = caps[2].to_string();
        let origin = caps.get(3).map(|m| m.as_str()).unwrap_or("");
        let classification = classify_origin(origin);
        updates.push(AvailableUpdate { name, version, classification });
    }
    updates
}

/// Source-pocket to classification mapping.
fn classify_origin(origin: &str) -> Classification {
    if origin.is_empty() {
        Classification::Unknown
    } else if origin.contains("-security") || origin.contains("Debian-Security") {
        Classification::Security
    } else {
        Classification::Other
    }
}

/// Parse `Remv` lines (packages a simulated transaction would remove).
pub(crate) fn parse_removals(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.strip_prefix("Remv "))
        .filter_map(|rest| rest.split_whitespace().next())
        .map(|s| s.to_string())
        .collect()
}

/// Interpret `dpkg-query -W -f '${Package}|${Version}|${Status}'` output.
pub(crate) fn parse_dpkg_status(output: &str, name: &str, version: Option<&str>) -> bool {
    for line in output.lines() {
        let parts: Vec<&str> = line.trim().split('|').collect();
        if parts.len() != 3 {
            continue;
        }
        if parts[0] != name {
            continue;
        }
        if let Some(v) = version {
            if parts[1] != v {
                continue;
            }
        }
        return parts[2].contains("install ok installed");
    }
    false
}

fn first_lines(text: &str, count: usize) -> String {
    text.lines().take(count).collect::<Vec<_>>().join(" | ")
}
