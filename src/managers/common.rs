// src/managers/common.rs

//! Parsing helpers shared by the RPM-family adapters (yum, dnf)
//!
//! Both tools emit the same check-update table, the same transaction
//! resolution prose, and the same updateinfo listing, so the parsers live
//! here and the adapters stay thin. Every function is pure (stdout in,
//! records out) so the edge cases (wrapped columns, Unicode names, stray
//! footers) are covered by table tests below.

use crate::model::Classification;

/// Architecture suffixes rpm-family tools append to package names
pub const RPM_ARCH_SUFFIXES: &[&str] = &[".x86_64", ".noarch", ".i686", ".aarch64", ".i586"];

/// Split `name.arch` into the product name and its arch suffix.
pub fn split_arch(package: &str) -> (&str, Option<&str>) {
    for suffix in RPM_ARCH_SUFFIXES {
        if let Some(stripped) = package.strip_suffix(suffix) {
            return (stripped, Some(&suffix[1..]));
        }
    }
    (package, None)
}

/// Strip the epoch (`1:2.3-4` -> `2.3-4`) from an rpm version string.
pub fn strip_epoch(version: &str) -> &str {
    match version.split_once(':') {
        Some((epoch, rest)) if epoch.chars().all(|c| c.is_ascii_digit()) => rest,
        _ => version,
    }
}

fn is_package_token(token: &str) -> bool {
    RPM_ARCH_SUFFIXES.iter().any(|s| token.contains(s))
}

/// Parse `check-update` table output into `(name, version)` pairs.
///
/// The table is three whitespace-separated columns (package, version,
/// repository), but a long package name pushes the remaining columns onto
/// the next line, so rows must be reassembled across line breaks:
///
/// ```text
/// NetworkManager.x86_64            1:1.18.8-2.el7_9    updates
/// python-perf.x86_64
///                                  3.10.0-1160.90.1.el7 updates
/// ```
pub fn parse_check_update(output: &str) -> Vec<(String, String)> {
    let mut results = Vec::new();
    let lines: Vec<&str> = output.lines().collect();
    let mut index = 0;

    while index < lines.len() {
        let tokens: Vec<&str> = lines[index].split_whitespace().collect();
        let next_tokens: Vec<&str> = lines
            .get(index + 1)
            .map(|l| l.split_whitespace().collect())
            .unwrap_or_default();

        if tokens.len() == 3 && is_package_token(tokens[0]) {
            results.push((tokens[0].to_string(), tokens[1].to_string()));
        } else if tokens.len() == 1 && next_tokens.len() == 2 && is_package_token(tokens[0]) {
            // Name alone on its line; version and repo wrapped onto the next
            results.push((tokens[0].to_string(), next_tokens[0].to_string()));
            index += 1;
        } else if tokens.len() == 2 && next_tokens.len() == 1 && is_package_token(tokens[0]) {
            // Repo wrapped onto the next line
            results.push((tokens[0].to_string(), tokens[1].to_string()));
            index += 1;
        }
        // Anything else (headers, 'Obsoleting Packages', blank lines) is noise
        index += 1;
    }

    dedupe(results)
}

fn dedupe(pairs: Vec<(String, String)>) -> Vec<(String, String)> {
    let mut seen = std::collections::HashSet::new();
    pairs
        .into_iter()
        .filter(|(name, version)| seen.insert((name.clone(), version.clone())))
        .collect()
}

/// Parse dry-run transaction output into the set of packages the
/// transaction would touch beyond those requested.
///
/// Relevant lines look like:
///
/// ```text
/// ---> Package selinux-policy-targeted.noarch 0:3.13.1-102.el7_3.16 will be an update
/// ---> Package kernel-core.x86_64 0:5.14.0-362.8.1.el9 will be installed
/// ```
pub fn parse_transaction_dependencies(output: &str, requested: &[String]) -> Vec<String> {
    let mut dependencies = Vec::new();

    for line in output.lines() {
        if !line.contains(" will be updated")
            && !line.contains(" will be an update")
            && !line.contains(" will be installed")
        {
            continue;
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        // ---> Package <name.arch> <epoch:version> will be ...
        if tokens.len() != 7 || tokens[1] != "Package" {
            continue;
        }
        let (name, _) = split_arch(tokens[2]);
        let name = name.to_string();
        if name.is_empty() || requested.iter().any(|r| split_arch(r).0 == name) {
            continue;
        }
        if !dependencies.contains(&name) {
            dependencies.push(name);
        }
    }

    dependencies
}

/// Parse packages a dry-run transaction would remove.
pub fn parse_transaction_removals(output: &str) -> Vec<String> {
    let mut removals = Vec::new();
    for line in output.lines() {
        if !line.contains(" will be erased") && !line.contains(" will be removed") {
            continue;
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 3 || tokens[1] != "Package" {
            continue;
        }
        let (name, _) = split_arch(tokens[2]);
        if !name.is_empty() && !removals.contains(&name.to_string()) {
            removals.push(name.to_string());
        }
    }
    removals
}

/// Parse `updateinfo list` output into per-package classifications.
///
/// ```text
/// RHSA-2021:1234 Critical/Sec.  openssl-libs-1:1.1.1k-7.el8.x86_64
/// RHSA-2021:5678 Important/Sec. kernel-4.18.0-348.el8.x86_64
/// RHBA-2021:9012 bugfix         vim-minimal-2:8.0.1763-16.el8.x86_64
/// ```
pub fn parse_updateinfo_list(output: &str) -> Vec<(String, Classification)> {
    let mut results = Vec::new();

    for line in output.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() != 3 {
            continue;
        }
        let advisory_type = tokens[1];
        let classification = if advisory_type.contains("Sec.") || advisory_type.contains("security")
        {
            if advisory_type.starts_with("Critical") {
                Classification::Critical
            } else {
                Classification::Security
            }
        } else if advisory_type.contains("bugfix") || advisory_type.contains("enhancement") {
            Classification::Other
        } else {
            continue; // header or summary line
        };

        if let Some(name) = product_name_from_nevra(tokens[2]) {
            results.push((name, classification));
        }
    }

    results
}

/// Extract the product name from a `name-[epoch:]version-release.arch` blob.
fn product_name_from_nevra(nevra: &str) -> Option<String> {
    let (without_arch, _) = split_arch(nevra);
    // The version starts at the first '-' followed by a digit or epoch digit
    let bytes = without_arch.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if *b == b'-' {
            if let Some(next) = bytes.get(i + 1) {
                if next.is_ascii_digit() {
                    return Some(without_arch[..i].to_string());
                }
            }
        }
    }
    Some(without_arch.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    // ====================
    // check-update parsing
    // ====================

    #[test]
    fn test_parse_check_update_simple_rows() {
        let output = "\
Loaded plugins: product-id\n\
\n\
NetworkManager.x86_64            1:1.18.8-2.el7_9     updates\n\
openssl-libs.x86_64              1:1.0.2k-26.el7_9    updates\n";
        let rows = parse_check_update(output);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, "NetworkManager.x86_64");
        assert_eq!(rows[0].1, "1:1.18.8-2.el7_9");
    }

    #[test]
    fn test_parse_check_update_wrapped_name_line() {
        // Long name pushes version+repo onto the following line
        let output = "\
java-11-openjdk-headless-slowdebug.x86_64\n\
                                 1:11.0.20.0.8-2.el7  updates\n\
vim-common.x86_64                2:7.4.629-8.el7_9    updates\n";
        let rows = parse_check_update(output);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, "java-11-openjdk-headless-slowdebug.x86_64");
        assert_eq!(rows[0].1, "1:11.0.20.0.8-2.el7");
        assert_eq!(rows[1].0, "vim-common.x86_64");
    }

    #[test]
    fn test_parse_check_update_wrapped_repo_line() {
        let output = "\
kernel.x86_64                    3.10.0-1160.90.1.el7\n\
                                 updates\n";
        let rows = parse_check_update(output);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1, "3.10.0-1160.90.1.el7");
    }

    #[test]
    fn test_parse_check_update_ignores_noise_and_dedupes() {
        let output = "\
Obsoleting Packages\n\
grub2.x86_64                     1:2.02-0.87.el7      updates\n\
grub2.x86_64                     1:2.02-0.87.el7      updates\n\
Operation aborted.\n";
        let rows = parse_check_update(output);
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn test_parse_check_update_unicode_name() {
        let output = "libréoffice-core.x86_64          6.4.7-6.el8          appstream\n";
        let rows = parse_check_update(output);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, "libréoffice-core.x86_64");
    }

    // ====================
    // transaction parsing
    // ====================

    #[test]
    fn test_parse_transaction_dependencies() {
        let output = "\
Resolving Dependencies\n\
--> Running transaction check\n\
---> Package selinux-policy.noarch 0:3.13.1-102.el7_3.15 will be updated\n\
--> Processing Dependency: selinux-policy = 3.13.1-102.el7_3.15 for package: selinux-policy-targeted\n\
---> Package selinux-policy.noarch 0:3.13.1-102.el7_3.16 will be an update\n\
---> Package selinux-policy-targeted.noarch 0:3.13.1-102.el7_3.16 will be an update\n\
--> Finished Dependency Resolution\n\
Operation aborted.\n";
        let deps =
            parse_transaction_dependencies(output, &["selinux-policy".to_string()]);
        assert_eq!(deps, vec!["selinux-policy-targeted".to_string()]);
    }

    #[test]
    fn test_parse_transaction_removals() {
        let output = "---> Package old-kmod.x86_64 0:1.0-1.el7 will be erased\n";
        assert_eq!(parse_transaction_removals(output), vec!["old-kmod".to_string()]);
    }

    // ====================
    // updateinfo parsing
    // ====================

    #[test]
    fn test_parse_updateinfo_list() {
        let output = "\
Updating Subscription Management repositories.\n\
RHSA-2021:1234 Critical/Sec.  openssl-libs-1:1.1.1k-7.el8.x86_64\n\
RHSA-2021:5678 Important/Sec. kernel-4.18.0-348.el8.x86_64\n\
RHBA-2021:9012 bugfix         vim-minimal-2:8.0.1763-16.el8.x86_64\n";
        let rows = parse_updateinfo_list(output);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], ("openssl-libs".to_string(), Classification::Critical));
        assert_eq!(rows[1], ("kernel".to_string(), Classification::Security));
        assert_eq!(rows[2], ("vim-minimal".to_string(), Classification::Other));
    }

    // ====================
    // helpers
    // ====================

    #[test]
    fn test_split_arch() {
        assert_eq!(split_arch("kernel.x86_64"), ("kernel", Some("x86_64")));
        assert_eq!(split_arch("tzdata.noarch"), ("tzdata", Some("noarch")));
        assert_eq!(split_arch("plain-name"), ("plain-name", None));
    }

    #[test]
    fn test_strip_epoch() {
        assert_eq!(strip_epoch("1:2.02-0.87.el7"), "2.02-0.87.el7");
        assert_eq!(strip_epoch("2.02-0.87.el7"), "2.02-0.87.el7");
        assert_eq!(strip_epoch("git:abc"), "git:abc");
    }

    #[test]
    fn test_product_name_from_nevra() {
        assert_eq!(
            product_name_from_nevra("openssl-libs-1:1.1.1k-7.el8.x86_64").unwrap(),
            "openssl-libs"
        );
        assert_eq!(
            product_name_from_nevra("kernel-4.18.0-348.el8.x86_64").unwrap(),
            "kernel"
        );
    }
}
