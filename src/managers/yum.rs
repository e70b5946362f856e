// src/managers/yum.rs

//! yum adapter for RHEL/CentOS 7-era systems
//!
//! `yum check-update` exits 100 when updates exist, 0 when none do, and 1
//! on tool failure; the table it prints wraps columns for long package
//! names. Classification comes from `yum updateinfo list` advisory types;
//! machines without updateinfo metadata simply yield Unknown rows.

use super::common::{
    parse_check_update, parse_transaction_dependencies, parse_transaction_removals,
    parse_updateinfo_list, split_arch, strip_epoch,
};
use super::runner::CommandRunner;
use super::{
    with_retries, AdapterError, AdapterResult, AvailableUpdate, InstallOutcome, InstalledPackage,
    PackageManager, Simulation, MAX_ASSESSMENT_RETRIES,
};
use crate::environment::DistroFamily;
use crate::model::Classification;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

const EXIT_NO_UPDATES: i32 = 0;
const EXIT_TOOL_ERROR: i32 = 1;
const EXIT_UPDATES_AVAILABLE: i32 = 100;

const TRANSIENT_MARKERS: &[&str] = &[
    "Another app is currently holding the yum lock",
    "Cannot retrieve repository metadata",
    "Failed to download metadata for repo",
    "Curl error",
];
const FATAL_MARKERS: &[&str] = &[
    "rpmdb open failed",
    "database disk image is malformed",
    "Rpmdb checksum is invalid",
];

pub struct YumManager {
    runner: Arc<CommandRunner>,
    available_cache: Mutex<Option<Vec<AvailableUpdate>>>,
}

impl YumManager {
    pub fn new(runner: Arc<CommandRunner>) -> Self {
        Self { runner, available_cache: Mutex::new(None) }
    }

    fn invoke(&self, args: &[&str]) -> AdapterResult<(i32, String)> {
        let output = self
            .runner
            .run("yum", args)
            .map_err(|e| AdapterError::fatal(format!("Failed to run yum: {}", e)))?;
        let combined = output.combined();

        if FATAL_MARKERS.iter().any(|m| combined.contains(m)) {
            return Err(AdapterError::fatal(format!(
                "yum package database is unhealthy: {}",
                first_line_matching(&combined, FATAL_MARKERS)
            )));
        }
        if output.terminated {
            return Err(AdapterError::failed("yum was terminated by the deadline"));
        }
        if TRANSIENT_MARKERS.iter().any(|m| combined.contains(m)) {
            return Err(AdapterError::transient(format!(
                "yum transient failure (exit {}): {}",
                output.exit_code,
                first_line_matching(&combined, TRANSIENT_MARKERS)
            )));
        }
        Ok((output.exit_code, combined))
    }

    fn available_updates_cached(&self) -> AdapterResult<Vec<AvailableUpdate>> {
        if let Some(cached) = self.available_cache.lock().unwrap().as_ref() {
            return Ok(cached.clone());
        }

        let updates = with_retries(MAX_ASSESSMENT_RETRIES, "yum check-update", || {
            let (code, out) = self.invoke(&["-q", "check-update"])?;
            if code != EXIT_NO_UPDATES && code != EXIT_UPDATES_AVAILABLE {
                return Err(AdapterError::failed(format!(
                    "yum check-update exited {}",
                    code
                )));
            }
            Ok(parse_check_update(&out))
        })?;

        // updateinfo is best effort: absent metadata leaves rows Unknown
        let classifications = self.advisory_classifications();

        let enriched: Vec<AvailableUpdate> = updates
            .into_iter()
            .map(|(name, version)| {
                let (product, _) = split_arch(&name);
                let classification = classifications
                    .get(product)
                    .copied()
                    .unwrap_or(Classification::Unknown);
                AvailableUpdate { name: product.to_string(), version, classification }
            })
            .collect();

        debug!("Discovered {} update entries", enriched.len());
        *self.available_cache.lock().unwrap() = Some(enriched.clone());
        Ok(enriched)
    }

    fn advisory_classifications(&self) -> HashMap<String, Classification> {
        let mut map = HashMap::new();
        match self.invoke(&["-q", "updateinfo", "list", "updates"]) {
            Ok((code, out)) if code == EXIT_NO_UPDATES || code == EXIT_UPDATES_AVAILABLE => {
                for (name, classification) in parse_updateinfo_list(&out) {
                    // Keep the most severe advisory seen for a package
                    map.entry(name)
                        .and_modify(|existing: &mut Classification| {
                            if classification.rank() < existing.rank() {
                                *existing = classification;
                            }
                        })
                        .or_insert(classification);
                }
            }
            Ok((code, _)) => {
                warn!("yum updateinfo exited {}; classifications will be Unknown", code)
            }
            Err(e) => warn!("yum updateinfo unavailable: {}", e),
        }
        map
    }

    /// `name-version.arch` with the epoch stripped, for install commands.
    fn composite_identifier(&self, name: &str, version: &str) -> String {
        let (product, arch) = split_arch(name);
        let mut id = format!("{}-{}", product, strip_epoch(version));
        if let Some(arch) = arch {
            id.push('.');
            id.push_str(arch);
        }
        id
    }

    fn verify_installed(&self, name: &str, version: Option<&str>) -> bool {
        let (product, _) = split_arch(name);
        match self.invoke(&["-q", "list", "installed", product]) {
            Ok((code, out)) if code == EXIT_NO_UPDATES => {
                parse_check_update(&out).iter().any(|(n, v)| {
                    split_arch(n).0 == product
                        && version.map(|want| v == want || strip_epoch(v) == strip_epoch(want)).unwrap_or(true)
                })
            }
            _ => false,
        }
    }
}

impl PackageManager for YumManager {
    fn family(&self) -> DistroFamily {
        DistroFamily::Yum
    }

    fn list_available_updates(&self) -> AdapterResult<Vec<AvailableUpdate>> {
        self.available_updates_cached()
    }

    fn list_installed(&self) -> AdapterResult<Vec<InstalledPackage>> {
        let (code, out) = self.invoke(&["-q", "list", "installed"])?;
        if code != EXIT_NO_UPDATES {
            return Err(AdapterError::failed(format!(
                "yum list installed exited {}",
                code
            )));
        }
        Ok(parse_check_update(&out)
            .into_iter()
            .map(|(name, version)| InstalledPackage {
                name: split_arch(&name).0.to_string(),
                version,
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
        let mut args = vec!["install", "--assumeno"];
        let name_refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
        args.extend(&name_refs);

        // --assumeno answers the confirmation prompt with no, so a clean
        // simulation still exits 1 with an 'Operation aborted.' footer
        let (code, out) = self.invoke(&args)?;
        if code != EXIT_NO_UPDATES && code != EXIT_TOOL_ERROR {
            return Err(AdapterError::failed(format!(
                "yum install --assumeno exited {}",
                code
            )));
        }

        Ok(Simulation {
            requested: names.to_vec(),
            additional_dependencies: parse_transaction_dependencies(&out, names),
            conflicts: parse_transaction_removals(&out),
        })
    }

    fn install_one(&self, name: &str, version: Option<&str>) -> InstallOutcome {
        let spec = match version {
            Some(v) => self.composite_identifier(name, v),
            None => name.to_string(),
        };

        let output = match self.runner.run("yum", &["-y", "install", &spec]) {
            Ok(o) => o,
            Err(e) => return InstallOutcome::failure(-1, format!("Failed to run yum: {}", e)),
        };

        let combined = output.combined();
        if FATAL_MARKERS.iter().any(|m| combined.contains(m)) {
            let mut outcome = InstallOutcome::failure(
                output.exit_code,
                format!(
                    "yum package database is unhealthy: {}",
                    first_line_matching(&combined, FATAL_MARKERS)
                ),
            );
            outcome.fatal = true;
            return outcome;
        }

        let installed = output.success() && self.verify_installed(name, version);
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
        // needs-restarting -r exits 1 when a reboot is required
        match self.runner.run("needs-restarting", &["-r"]) {
            Ok(out) => out.exit_code == 1,
            Err(_) => false,
        }
    }
}

fn first_line_matching(text: &str, markers: &[&str]) -> String {
    text.lines()
        .find(|line| markers.iter().any(|m| line.contains(m)))
        .unwrap_or("")
        .to_string()
}
