// src/managers/dnf.rs

//! dnf adapter for Fedora and RHEL 8+
//!
//! Exit-code conventions match yum (100 means updates available) and the
//! check-update table parses the same way, wrapped columns included. The
//! difference is dependency resolution output: dnf prints a columnar
//! transaction table instead of yum's prose, so this adapter owns that
//! parser.

use super::common::{parse_check_update, parse_updateinfo_list, split_arch, strip_epoch};
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

const EXIT_OK: i32 = 0;
const EXIT_TOOL_ERROR: i32 = 1;
const EXIT_UPDATES_AVAILABLE: i32 = 100;

const TRANSIENT_MARKERS: &[&str] = &[
    "Waiting for process with pid",
    "Failed to download metadata for repo",
    "Curl error",
    "Temporary failure in name resolution",
];
const FATAL_MARKERS: &[&str] = &[
    "rpmdb open failed",
    "database disk image is malformed",
    "Rpmdb checksum is invalid",
];

pub struct DnfManager {
    runner: Arc<CommandRunner>,
    available_cache: Mutex<Option<Vec<AvailableUpdate>>>,
}

impl DnfManager {
    pub fn new(runner: Arc<CommandRunner>) -> Self {
        Self { runner, available_cache: Mutex::new(None) }
    }

    fn invoke(&self, args: &[&str]) -> AdapterResult<(i32, String)> {
        let output = self
            .runner
            .run("dnf", args)
            .map_err(|e| AdapterError::fatal(format!("Failed to run dnf: {}", e)))?;
        let combined = output.combined();

        if FATAL_MARKERS.iter().any(|m| combined.contains(m)) {
            return Err(AdapterError::fatal(format!(
                "dnf package database is unhealthy (exit {})",
                output.exit_code
            )));
        }
        if output.terminated {
            return Err(AdapterError::failed("dnf was terminated by the deadline"));
        }
        if TRANSIENT_MARKERS.iter().any(|m| combined.contains(m)) {
            return Err(AdapterError::transient(format!(
                "dnf transient failure (exit {})",
                output.exit_code
            )));
        }
        Ok((output.exit_code, combined))
    }

    fn available_updates_cached(&self) -> AdapterResult<Vec<AvailableUpdate>> {
        if let Some(cached) = self.available_cache.lock().unwrap().as_ref() {
            return Ok(cached.clone());
        }

        let updates = with_retries(MAX_ASSESSMENT_RETRIES, "dnf check-update", || {
            let (code, out) = self.invoke(&["-q", "check-update"])?;
            if code != EXIT_OK && code != EXIT_UPDATES_AVAILABLE {
                return Err(AdapterError::failed(format!(
                    "dnf check-update exited {}",
                    code
                )));
            }
            Ok(parse_check_update(&out))
        })?;

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
        match self.invoke(&["-q", "updateinfo", "list", "--updates"]) {
            Ok((code, out)) if code == EXIT_OK || code == EXIT_UPDATES_AVAILABLE => {
                for (name, classification) in parse_updateinfo_list(&out) {
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
                warn!("dnf updateinfo exited {}; classifications will be Unknown", code)
            }
            Err(e) => warn!("dnf updateinfo unavailable: {}", e),
        }
        map
    }

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
            Ok((code, out)) if code == EXIT_OK => {
                parse_check_update(&out).iter().any(|(n, v)| {
                    split_arch(n).0 == product
                        && version
                            .map(|want| v == want || strip_epoch(v) == strip_epoch(want))
                            .unwrap_or(true)
                })
            }
            _ => false,
        }
    }
}

impl PackageManager for DnfManager {
    fn family(&self) -> DistroFamily {
        DistroFamily::Dnf
    }

    fn list_available_updates(&self) -> AdapterResult<Vec<AvailableUpdate>> {
        self.available_updates_cached()
    }

    fn list_installed(&self) -> AdapterResult<Vec<InstalledPackage>> {
        let (code, out) = self.invoke(&["-q", "list", "installed"])?;
        if code != EXIT_OK {
            return Err(AdapterError::failed(format!(
                "dnf list installed exited {}",
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

        // --assumeno declines the transaction, exiting 1 after printing it
        let (code, out) = self.invoke(&args)?;
        if code != EXIT_OK && code != EXIT_TOOL_ERROR {
            return Err(AdapterError::failed(format!(
                "dnf install --assumeno exited {}",
                code
            )));
        }

        let table = parse_transaction_table(&out);
        let additional_dependencies = table
            .touched
            .into_iter()
            .filter(|n| !names.iter().any(|r| split_arch(r).0 == n))
            .collect();

        Ok(Simulation {
            requested: names.to_vec(),
            additional_dependencies,
            conflicts: table.removed,
        })
    }

    fn install_one(&self, name: &str, version: Option<&str>) -> InstallOutcome {
        let spec = match version {
            Some(v) => self.composite_identifier(name, v),
            None => name.to_string(),
        };

        let output = match self.runner.run("dnf", &["-y", "install", &spec]) {
            Ok(o) => o,
            Err(e) => return InstallOutcome::failure(-1, format!("Failed to run dnf: {}", e)),
        };

        let combined = output.combined();
        if FATAL_MARKERS.iter().any(|m| combined.contains(m)) {
            let mut outcome = InstallOutcome::failure(
                output.exit_code,
                format!("dnf package database is unhealthy (exit {})", output.exit_code),
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
        match self.runner.run("dnf", &["needs-restarting", "-r"]) {
            Ok(out) => out.exit_code == 1,
            Err(_) => false,
        }
    }
}

/// Parsed dnf transaction table.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct TransactionTable {
    /// Everything being installed/upgraded (product names, no arch)
    pub touched: Vec<String>,
    /// Packages the transaction would remove
    pub removed: Vec<String>,
}

/// Parse dnf's columnar transaction preview.
///
/// ```text
/// Dependencies resolved.
/// ================================================================
///  Package                  Arch     Version            Repo  Size
/// ================================================================
/// Upgrading:
///  selinux-policy           noarch   38.1.23-1.el9      base  48 k
/// Installing dependencies:
///  selinux-policy-targeted  noarch   38.1.23-1.el9      base  6.9 M
/// Removing:
///  old-kmod                 x86_64   1.0-1.el9          @base 120 k
///
/// Transaction Summary
/// ```
pub(crate) fn parse_transaction_table(output: &str) -> TransactionTable {
    #[derive(PartialEq, Clone, Copy)]
    enum Section {
        None,
        Touched,
        Removed,
    }

    let mut table = TransactionTable::default();
    let mut section = Section::None;

    for line in output.lines() {
        let trimmed = line.trim_end();
        match trimmed.trim() {
            "Installing:" | "Upgrading:" | "Downgrading:" | "Installing dependencies:"
            | "Installing weak dependencies:" => {
                section = Section::Touched;
                continue;
            }
            "Removing:" | "Removing dependent packages:" => {
                section = Section::Removed;
                continue;
            }
            "" | "Transaction Summary" => {
                section = Section::None;
                continue;
            }
            _ => {}
        }
        if section == Section::None {
            continue;
        }
        // Data rows are indented: " name  arch  version  repo  size"
        if !trimmed.starts_with(' ') {
            section = Section::None;
            continue;
        }
        let tokens: Vec<&str> = trimmed.split_whitespace().collect();
        if tokens.len() < 4 {
            continue;
        }
        let name = tokens[0].to_string();
        let target = match section {
            Section::Touched => &mut table.touched,
            Section::Removed => &mut table.removed,
            Section::None => unreachable!(),
        };
        if !target.contains(&name) {
            target.push(name);
        }
    }

    table
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
Last metadata expiration check: 0:21:41 ago.\n\
Dependencies resolved.\n\
========================================================================\n\
 Package                  Architecture  Version           Repository Size\n\
========================================================================\n\
Upgrading:\n\
 selinux-policy           noarch        38.1.23-1.el9     baseos    48 k\n\
Installing dependencies:\n\
 selinux-policy-targeted  noarch        38.1.23-1.el9     baseos   6.9 M\n\
Removing:\n\
 old-kmod                 x86_64        1.0-1.el9         @baseos  120 k\n\
\n\
Transaction Summary\n\
========================================================================\n\
Upgrade  1 Package\n\
Operation aborted.\n";

    #[test]
    fn test_parse_transaction_table() {
        let table = parse_transaction_table(SAMPLE);
        assert_eq!(
            table.touched,
            vec!["selinux-policy".to_string(), "selinux-policy-targeted".to_string()]
        );
        assert_eq!(table.removed, vec!["old-kmod".to_string()]);
    }

    #[test]
    fn test_parse_transaction_table_empty_output() {
        let table = parse_transaction_table("Nothing to do.\nComplete!\n");
        assert_eq!(table, TransactionTable::default());
    }

    #[test]
    fn test_parse_transaction_table_stops_at_summary() {
        let table = parse_transaction_table(SAMPLE);
        // 'Upgrade  1 Package' under Transaction Summary must not be a row
        assert!(!table.touched.contains(&"Upgrade".to_string()));
    }
}
