// src/environment/distro.rs

//! Distribution detection from OS-release metadata
//!
//! Primary source is `/etc/os-release` (ID and ID_LIKE); fallbacks are the
//! legacy release files (`/etc/redhat-release`, `/etc/SuSE-release`). The
//! result decides which package manager adapter drives the run.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

/// Package manager family backing a distribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistroFamily {
    /// Debian, Ubuntu
    Apt,
    /// RHEL/CentOS 7 era
    Yum,
    /// Fedora, RHEL 8+, CentOS Stream
    Dnf,
    /// SUSE, openSUSE
    Zypper,
}

impl std::fmt::Display for DistroFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Apt => write!(f, "apt"),
            Self::Yum => write!(f, "yum"),
            Self::Dnf => write!(f, "dnf"),
            Self::Zypper => write!(f, "zypper"),
        }
    }
}

/// Detected distribution identity.
#[derive(Debug, Clone)]
pub struct DistroInfo {
    pub name: String,
    pub version: String,
    pub family: DistroFamily,
}

/// Detect the distribution rooted at `root` (always `/` outside of tests).
pub fn detect_distro(root: &Path) -> Result<DistroInfo> {
    let os_release = root.join("etc/os-release");
    if let Ok(content) = std::fs::read_to_string(&os_release) {
        if let Some(info) = parse_os_release(&content) {
            debug!("Detected distro from os-release: {} {}", info.name, info.version);
            return Ok(info);
        }
    }

    // Legacy fallbacks for systems predating os-release
    if root.join("etc/redhat-release").exists() {
        let content = std::fs::read_to_string(root.join("etc/redhat-release"))?;
        return Ok(DistroInfo {
            name: content.split_whitespace().next().unwrap_or("redhat").to_string(),
            version: extract_release_version(&content),
            family: DistroFamily::Yum,
        });
    }
    if root.join("etc/SuSE-release").exists() {
        return Ok(DistroInfo {
            name: "suse".to_string(),
            version: "unknown".to_string(),
            family: DistroFamily::Zypper,
        });
    }

    Err(Error::UnsupportedDistro(
        "No os-release metadata and no known release file found".to_string(),
    ))
}

/// Parse `/etc/os-release` key=value content into a distro identity.
///
/// Exposed for table-driven testing.
pub fn parse_os_release(content: &str) -> Option<DistroInfo> {
    let mut fields = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            fields.insert(key.trim().to_string(), value.trim().trim_matches('"').to_string());
        }
    }

    let id = fields.get("ID")?.to_lowercase();
    let id_like = fields.get("ID_LIKE").map(|s| s.to_lowercase()).unwrap_or_default();
    let version = fields
        .get("VERSION_ID")
        .cloned()
        .unwrap_or_else(|| "unknown".to_string());
    let name = fields.get("NAME").cloned().unwrap_or_else(|| id.clone());

    let family = family_for(&id, &id_like, &version)?;
    Some(DistroInfo { name, version, family })
}

fn family_for(id: &str, id_like: &str, version: &str) -> Option<DistroFamily> {
    match id {
        "ubuntu" | "debian" => Some(DistroFamily::Apt),
        "fedora" => Some(DistroFamily::Dnf),
        "rhel" | "centos" | "rocky" | "almalinux" | "ol" => {
            // RHEL 8 moved to dnf; 7 and earlier use yum
            let major: u32 = version.split('.').next().and_then(|v| v.parse().ok()).unwrap_or(0);
            if major >= 8 {
                Some(DistroFamily::Dnf)
            } else {
                Some(DistroFamily::Yum)
            }
        }
        "sles" | "opensuse" | "opensuse-leap" | "opensuse-tumbleweed" => Some(DistroFamily::Zypper),
        _ => {
            if id_like.contains("debian") || id_like.contains("ubuntu") {
                Some(DistroFamily::Apt)
            } else if id_like.contains("fedora") || id_like.contains("rhel") {
                Some(DistroFamily::Dnf)
            } else if id_like.contains("suse") {
                Some(DistroFamily::Zypper)
            } else {
                None
            }
        }
    }
}

fn extract_release_version(content: &str) -> String {
    content
        .split_whitespace()
        .find(|tok| tok.chars().next().is_some_and(|c| c.is_ascii_digit()))
        .unwrap_or("unknown")
        .to_string()
}
