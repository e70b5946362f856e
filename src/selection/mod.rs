// src/selection/mod.rs

//! Filter engine: classification and wildcard selection
//!
//! Takes the candidate set an adapter discovered and a request, and
//! produces the ordered patch rows for the run: which candidates are
//! selected, which are excluded (explicitly or through a dependency), and
//! which simply were not asked for. Dependency closure comes from the
//! adapter's dry-run simulation, one transaction per selected package so an
//! excluded dependency can poison exactly the transaction that needs it.
//!
//! Glob semantics: `*` matches any run of characters, `?` exactly one.
//! Names match case-insensitively, versions case-sensitively, and a
//! pattern containing `=` matches against `name=version`.

use crate::config::Request;
use crate::managers::{AdapterResult, AvailableUpdate, PackageManager};
use crate::model::{Classification, InstallState, Patch, SelectedState};
use tracing::{debug, info};

/// Reason recorded on rows excluded because a dependency was excluded
pub const REASON_EXCLUDED_DEP: &str = "excluded-dep";

/// A single include/exclude pattern, split into its name and optional
/// version halves.
#[derive(Debug, Clone)]
struct PatchPattern {
    name: String,
    version: Option<String>,
}

impl PatchPattern {
    fn parse(raw: &str) -> Self {
        match raw.split_once('=') {
            Some((name, version)) => Self {
                name: name.trim().to_string(),
                version: Some(version.trim().to_string()),
            },
            None => Self { name: raw.trim().to_string(), version: None },
        }
    }

    /// Match a candidate. Name comparison folds case; version comparison
    /// does not.
    fn matches(&self, name: &str, version: &str) -> bool {
        if !glob_match_ci(&self.name, name) {
            return false;
        }
        match &self.version {
            Some(pattern) => glob_match(pattern, version),
            None => true,
        }
    }
}

/// Compiled filter for one request.
pub struct PackageFilter {
    includes: Vec<PatchPattern>,
    excludes: Vec<PatchPattern>,
    classifications: Vec<Classification>,
}

impl PackageFilter {
    pub fn from_request(request: &Request) -> Self {
        Self {
            includes: request.patches_to_include.iter().map(|p| PatchPattern::parse(p)).collect(),
            excludes: request.patches_to_exclude.iter().map(|p| PatchPattern::parse(p)).collect(),
            classifications: request.classifications_to_include.clone(),
        }
    }

    /// Classification gate. Unknown is admitted when the filter is empty or
    /// includes Other; every named classification must be listed.
    pub fn classification_admits(&self, classification: Classification) -> bool {
        if self.classifications.is_empty() {
            return true;
        }
        match classification {
            Classification::Unknown => self.classifications.contains(&Classification::Other),
            c => self.classifications.contains(&c),
        }
    }

    /// Include gate: an empty include list admits everything.
    pub fn is_included(&self, name: &str, version: &str) -> bool {
        self.includes.is_empty() || self.includes.iter().any(|p| p.matches(name, version))
    }

    /// Exclude gate; wins over include on conflict.
    pub fn is_excluded(&self, name: &str, version: &str) -> bool {
        self.excludes.iter().any(|p| p.matches(name, version))
    }
}

/// Build the full patch-row set for an installation run.
///
/// Every candidate gets a row (Selected, Excluded, or NotSelected);
/// dependencies discovered by simulation get rows of their own. The result
/// is ordered by `(classification rank, name, version)`.
pub fn build_installation_selection(
    adapter: &dyn PackageManager,
    request: &Request,
    os_tag: &str,
) -> AdapterResult<Vec<Patch>> {
    let candidates = adapter.list_available_updates()?;
    let filter = PackageFilter::from_request(request);

    let mut patches: Vec<Patch> = Vec::new();
    let mut selected_names: Vec<String> = Vec::new();

    for candidate in &candidates {
        let mut patch = Patch::new(
            candidate.name.clone(),
            candidate.version.clone(),
            candidate.classification,
            os_tag,
        );

        if filter.is_excluded(&candidate.name, &candidate.version) {
            patch.mark_excluded("Matched an exclusion pattern");
        } else if !filter.classification_admits(candidate.classification)
            || !filter.is_included(&candidate.name, &candidate.version)
        {
            patch.mark_not_selected();
        } else {
            patch.selected_state = SelectedState::Selected;
            patch.install_state = InstallState::Pending;
            selected_names.push(candidate.name.clone());
        }
        patches.push(patch);
    }

    debug!(
        "Filter selected {} of {} candidates",
        selected_names.len(),
        candidates.len()
    );

    // Dependency closure, one transaction per selected package
    for name in selected_names {
        expand_transaction(adapter, &filter, &candidates, &name, os_tag, &mut patches)?;
    }

    sort_selection(&mut patches);
    Ok(patches)
}

/// Simulate installing `name` and fold its dependency closure into the
/// row set. An excluded dependency poisons the whole transaction.
fn expand_transaction(
    adapter: &dyn PackageManager,
    filter: &PackageFilter,
    candidates: &[AvailableUpdate],
    name: &str,
    os_tag: &str,
    patches: &mut Vec<Patch>,
) -> AdapterResult<()> {
    let simulation = adapter.simulate_install(&[name.to_string()])?;
    if simulation.additional_dependencies.is_empty() {
        return Ok(());
    }

    let excluded_dep = simulation
        .additional_dependencies
        .iter()
        .find(|dep| filter.is_excluded(dep, &version_of(candidates, dep)));

    if let Some(excluded) = excluded_dep {
        info!(
            "Transaction for {} requires excluded package {}; excluding the transaction",
            name, excluded
        );
        // Poison the requesting package and every member of its closure
        if let Some(row) = patches.iter_mut().find(|p| p.name == name) {
            row.mark_excluded(REASON_EXCLUDED_DEP);
        }
        for dep in &simulation.additional_dependencies {
            upsert_row(patches, candidates, dep, os_tag, |row| {
                row.mark_excluded(REASON_EXCLUDED_DEP)
            });
        }
        return Ok(());
    }

    for dep in &simulation.additional_dependencies {
        upsert_row(patches, candidates, dep, os_tag, |row| {
            // A dependency already excluded or selected keeps its state;
            // only untouched rows are pulled into the selection
            if row.selected_state == SelectedState::NotSelected
                || row.selected_state == SelectedState::Pending
            {
                row.selected_state = SelectedState::Selected;
                row.install_state = InstallState::Pending;
            }
        });
    }
    Ok(())
}

fn upsert_row(
    patches: &mut Vec<Patch>,
    candidates: &[AvailableUpdate],
    name: &str,
    os_tag: &str,
    apply: impl FnOnce(&mut Patch),
) {
    if let Some(row) = patches.iter_mut().find(|p| p.name == name) {
        apply(row);
        return;
    }
    let classification = candidates
        .iter()
        .find(|c| c.name == name)
        .map(|c| c.classification)
        .unwrap_or(Classification::Unknown);
    let mut row = Patch::new(name, version_of(candidates, name), classification, os_tag);
    row.selected_state = SelectedState::Selected;
    row.install_state = InstallState::Pending;
    apply(&mut row);
    patches.push(row);
}

fn version_of(candidates: &[AvailableUpdate], name: &str) -> String {
    candidates
        .iter()
        .find(|c| c.name == name)
        .map(|c| c.version.clone())
        .unwrap_or_default()
}

/// Assessment keeps every candidate, ordered like an installation set.
pub fn build_assessment_rows(candidates: &[AvailableUpdate], os_tag: &str) -> Vec<Patch> {
    let mut patches: Vec<Patch> = candidates
        .iter()
        .map(|c| {
            let mut patch =
                Patch::new(c.name.clone(), c.version.clone(), c.classification, os_tag);
            patch.selected_state = SelectedState::Selected;
            patch.install_state = InstallState::NotStarted;
            patch
        })
        .collect();
    sort_selection(&mut patches);
    patches
}

fn sort_selection(patches: &mut [Patch]) {
    patches.sort_by(|a, b| {
        a.classification
            .rank()
            .cmp(&b.classification.rank())
            .then_with(|| a.name.cmp(&b.name))
            .then_with(|| a.version.cmp(&b.version))
    });
}

/// Glob match with `*` (any run) and `?` (exactly one character).
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    glob_match_chars(&pattern, &text)
}

/// Case-insensitive variant, used for package names.
pub fn glob_match_ci(pattern: &str, text: &str) -> bool {
    glob_match(&pattern.to_lowercase(), &text.to_lowercase())
}

fn glob_match_chars(pattern: &[char], text: &[char]) -> bool {
    let mut p = 0;
    let mut t = 0;
    let mut star_p = usize::MAX;
    let mut star_t = 0;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star_p = p;
            star_t = t;
            p += 1;
        } else if star_p != usize::MAX {
            // Backtrack: extend the last * by one character
            p = star_p + 1;
            star_t += 1;
            t = star_t;
        } else {
            return false;
        }
    }

    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}
