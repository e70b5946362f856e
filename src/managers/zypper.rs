// src/managers/zypper.rs

//! zypper adapter for SUSE systems
//!
//! zypper's exit codes carry meaning beyond success/failure: 102 means the
//! update needs a reboot, 103 means zypper updated itself mid-run, and 7
//! means the management stack is locked by another process. Classification
//! comes from patch categories: the package set covered by
//! `patch --category security --dry-run` is Security, the rest Other.

use super::runner::CommandRunner;
use super::{
    with_retries, AdapterError, AdapterResult, AvailableUpdate, InstallOutcome, InstalledPackage,
    PackageManager, Simulation, MAX_ASSESSMENT_RETRIES,
};
use crate::environment::DistroFamily;
use crate::model::Classification;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

const EXIT_OK: i32 = 0;
const EXIT_LOCKED: i32 = 7;
const EXIT_REBOOT_NEEDED: i32 = 102;
const EXIT_ZYPPER_UPDATED: i32 = 103;

const SELF_UPDATE_WARNING: &str =
    "One of the installed patches affects the package manager itself";

pub struct ZypperManager {
    runner: Arc<CommandRunner>,
    available_cache: Mutex<Option<Vec<AvailableUpdate>>>,
    security_cache: Mutex<Option<HashSet<String>>>,
}

impl ZypperManager {
    pub fn new(runner: Arc<CommandRunner>) -> Self {
        Self {
            runner,
            available_cache: Mutex::new(None),
            security_cache: Mutex::new(None),
        }
    }

    fn invoke(&self, args: &[&str]) -> AdapterResult<(i32, String)> {
        let mut full_args = vec!["--non-interactive"];
        full_args.extend(args);
        let output = self
            .runner
            .run("zypper", &full_args)
            .map_err(|e| AdapterError::fatal(format!("Failed to run zypper: {}", e)))?;

        if output.terminated {
            return Err(AdapterError::failed("zypper was terminated by the deadline"));
        }
        if output.exit_code == EXIT_LOCKED {
            return Err(AdapterError::transient("zypper management stack is locked"));
        }
        Ok((output.exit_code, output.combined()))
    }

    fn available_updates_cached(&self) -> AdapterResult<Vec<AvailableUpdate>> {
        if let Some(cached) = self.available_cache.lock().unwrap().as_ref() {
            return Ok(cached.clone());
        }

        let rows = with_retries(MAX_ASSESSMENT_RETRIES, "zypper list-updates", || {
            let (code, out) = self.invoke(&["-q", "list-updates"])?;
            if code != EXIT_OK && code != EXIT_ZYPPER_UPDATED {
                return Err(AdapterError::failed(format!(
                    "zypper list-updates exited {}",
                    code
                )));
            }
            Ok(parse_list_updates(&out))
        })?;

        let security = self.security_packages();
        let updates: Vec<AvailableUpdate> = rows
            .into_iter()
            .map(|(name, version)| {
                let classification = if security.contains(&name) {
                    Classification::Security
                } else {
                    Classification::Other
                };
                AvailableUpdate { name, version, classification }
            })
            .collect();

        debug!("Discovered {} update entries", updates.len());
        *self.available_cache.lock().unwrap() = Some(updates.clone());
        Ok(updates)
    }

    /// Packages covered by security-category patches, from a dry run.
    fn security_packages(&self) -> HashSet<String> {
        if let Some(cached) = self.security_cache.lock().unwrap().as_ref() {
            return cached.clone();
        }
        let set = match self.invoke(&["patch", "--category", "security", "--dry-run"]) {
            Ok((code, out)) if code == EXIT_OK || code == EXIT_ZYPPER_UPDATED => {
                parse_patch_dry_run_packages(&out).into_iter().collect()
            }
            Ok((code, _)) => {
                warn!("zypper security patch dry-run exited {}; treating none as security", code);
                HashSet::new()
            }
            Err(e) => {
                warn!("zypper security patch dry-run unavailable: {}", e);
                HashSet::new()
            }
        };
        *self.security_cache.lock().unwrap() = Some(set.clone());
        set
    }

    fn verify_installed(&self, name: &str, version: Option<&str>) -> bool {
        match self.invoke(&["-q", "search", "-is", name]) {
            Ok((code, out)) if code == EXIT_OK => parse_search_installed(&out, name, version),
            _ => false,
        }
    }
}

impl PackageManager for ZypperManager {
    fn family(&self) -> DistroFamily {
        DistroFamily::Zypper
    }

    fn list_available_updates(&self) -> AdapterResult<Vec<AvailableUpdate>> {
        self.available_updates_cached()
    }

    fn list_installed(&self) -> AdapterResult<Vec<InstalledPackage>> {
        let (code, out) = self.invoke(&["-q", "search", "-is"])?;
        if code != EXIT_OK {
            return Err(AdapterError::failed(format!(
                "zypper search -is exited {}",
                code
            )));
        }
        Ok(parse_search_table(&out)
            .into_iter()
            .map(|(name, version)| InstalledPackage { name, version })
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
        let mut args = vec!["update", "--dry-run"];
        let name_refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
        args.extend(&name_refs);

        let (code, out) = self.invoke(&args)?;
        if code != EXIT_OK && code != EXIT_ZYPPER_UPDATED {
            return Err(AdapterError::failed(format!(
                "zypper update --dry-run exited {}",
                code
            )));
        }

        let touched = parse_patch_dry_run_packages(&out);
        let additional_dependencies = touched
            .into_iter()
            .filter(|n| !names.contains(n))
            .collect();

        Ok(Simulation {
            requested: names.to_vec(),
            additional_dependencies,
            conflicts: parse_dry_run_removals(&out),
        })
    }

    fn install_one(&self, name: &str, version: Option<&str>) -> InstallOutcome {
        let output = match self
            .runner
            .run("zypper", &["--non-interactive", "update", name])
        {
            Ok(o) => o,
            Err(e) => return InstallOutcome::failure(-1, format!("Failed to run zypper: {}", e)),
        };

        let exit_ok = matches!(
            output.exit_code,
            EXIT_OK | EXIT_REBOOT_NEEDED | EXIT_ZYPPER_UPDATED
        ) && !output.terminated;

        if output.combined().contains(SELF_UPDATE_WARNING) {
            warn!("zypper updated itself while installing {}; remaining patches may need a re-run", name);
        }

        let installed = exit_ok && self.verify_installed(name, version);
        InstallOutcome {
            exit_code: output.exit_code,
            succeeded: installed,
            reboot_required: output.exit_code == EXIT_REBOOT_NEEDED || self.reboot_required(),
            stdout: output.stdout,
            stderr: output.stderr,
            error: if installed {
                None
            } else {
                Some(format!(
                    "Install of {} did not complete (exit {})",
                    name, output.exit_code
                ))
            },
            fatal: false,
        }
    }

    fn reboot_required(&self) -> bool {
        // `zypper ps -s` lists processes still using deleted files; any
        // data row is a restart hint
        match self.invoke(&["ps", "-s"]) {
            Ok((code, out)) if code == EXIT_OK => parse_ps_has_processes(&out),
            _ => false,
        }
    }
}

/// Parse `zypper list-updates` table rows into `(name, version)` pairs.
///
/// ```text
/// S | Repository         | Name | Current Version | Available Version | Arch
/// --+--------------------+------+-----------------+-------------------+-------
/// v | SLES12-SP2-Updates | at   | 3.1.14-7.3      | 3.1.14-8.3.1      | x86_64
/// ```
pub(crate) fn parse_list_updates(output: &str) -> Vec<(String, String)> {
    let mut rows = Vec::new();
    for line in output.lines() {
        let cells: Vec<&str> = line.split('|').map(|c| c.trim()).collect();
        if cells.len() < 5 || cells[0] != "v" {
            continue;
        }
        rows.push((cells[2].to_string(), cells[4].to_string()));
    }
    rows
}

/// Parse the package lists out of a `zypper ... --dry-run`.
///
/// ```text
/// The following 3 packages are going to be upgraded:
///   apparmor-parser bash libopenssl1_1
/// ```
pub(crate) fn parse_patch_dry_run_packages(output: &str) -> Vec<String> {
    let mut packages = Vec::new();
    let mut collecting = false;

    for line in output.lines() {
        if line.contains("going to be upgraded:")
            || line.contains("going to be installed:")
            || line.contains("is going to be upgraded:")
        {
            collecting = true;
            continue;
        }
        if collecting {
            // Package names continue on indented lines
            if line.starts_with(' ') || line.starts_with('\t') {
                for name in line.split_whitespace() {
                    let name = name.to_string();
                    if !packages.contains(&name) {
                        packages.push(name);
                    }
                }
            } else {
                collecting = false;
            }
        }
    }

    packages
}

/// Packages a dry-run says would be removed.
pub(crate) fn parse_dry_run_removals(output: &str) -> Vec<String> {
    let mut removed = Vec::new();
    let mut collecting = false;

    for line in output.lines() {
        if line.contains("going to be REMOVED:") {
            collecting = true;
            continue;
        }
        if collecting {
            if line.starts_with(' ') || line.starts_with('\t') {
                removed.extend(line.split_whitespace().map(|s| s.to_string()));
            } else {
                collecting = false;
            }
        }
    }

    removed
}

/// Parse `zypper search -is` rows into `(name, version)` pairs.
pub(crate) fn parse_search_table(output: &str) -> Vec<(String, String)> {
    let mut rows = Vec::new();
    for line in output.lines() {
        let cells: Vec<&str> = line.split('|').map(|c| c.trim()).collect();
        // S | Name | Type | Version | Arch | Repository
        if cells.len() < 6 || !(cells[0] == "i" || cells[0] == "i+") {
            continue;
        }
        rows.push((cells[1].to_string(), cells[3].to_string()));
    }
    rows
}

pub(crate) fn parse_search_installed(output: &str, name: &str, version: Option<&str>) -> bool {
    parse_search_table(output)
        .iter()
        .any(|(n, v)| n == name && version.map(|want| v == want).unwrap_or(true))
}

/// True when `zypper ps -s` shows processes using deleted files.
pub(crate) fn parse_ps_has_processes(output: &str) -> bool {
    if output.contains("No processes using deleted files found") {
        return false;
    }
    for line in output.lines() {
        let cells: Vec<&str> = line.split('|').map(|c| c.trim()).collect();
        // PID | PPID | UID | User | Command | Service
        if cells.len() >= 5 && cells[0].chars().all(|c| c.is_ascii_digit()) && !cells[0].is_empty()
        {
            return true;
        }
    }
    false
}
