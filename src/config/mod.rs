// src/config/mod.rs

//! Request model and validation
//!
//! A `Request` is the typed, validated form of one `.settings` file. It is
//! immutable after ingest; the orchestrator consumes it exactly once.
//! Validation happens here at the boundary so nothing downstream has to
//! re-check field presence or legality.

mod ingest;

pub use ingest::{latest_settings, read_raw, read_request, SettingsFile};

use crate::error::{Error, Result};
use crate::model::Classification;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// Hard ceiling on `maximumDuration`, enforced regardless of the request.
pub const MAXIMUM_DURATION_CEILING: Duration = Duration::from_secs(4 * 3600);

/// Default window when a request omits or under-specifies the duration.
pub const DEFAULT_MAXIMUM_DURATION: Duration = Duration::from_secs(2 * 3600);

/// How stale a non-installation start time may be before the run aborts.
pub fn max_start_time_age() -> ChronoDuration {
    ChronoDuration::hours(24)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Assessment,
    Installation,
    ConfigurePatching,
    NoOperation,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Assessment => "Assessment",
            Self::Installation => "Installation",
            Self::ConfigurePatching => "ConfigurePatching",
            Self::NoOperation => "NoOperation",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RebootSetting {
    IfRequired,
    Never,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatchMode {
    ImageDefault,
    AutomaticByPlatform,
}

/// Raw wire form of a `.settings` file. Field names follow the host
/// contract; unrecognized fields are preserved and echoed back in status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawSettings {
    pub operation: String,
    #[serde(rename = "activityId")]
    pub activity_id: String,
    #[serde(rename = "startTime")]
    pub start_time: String,
    #[serde(rename = "maximumDuration", default)]
    pub maximum_duration: Option<String>,
    #[serde(rename = "rebootSetting", default)]
    pub reboot_setting: Option<String>,
    #[serde(rename = "classificationsToInclude", default)]
    pub classifications_to_include: Vec<String>,
    #[serde(rename = "patchesToInclude", default)]
    pub patches_to_include: Vec<String>,
    #[serde(rename = "patchesToExclude", default)]
    pub patches_to_exclude: Vec<String>,
    #[serde(rename = "patchMode", default)]
    pub patch_mode: Option<String>,
    #[serde(rename = "assessmentMode", default)]
    pub assessment_mode: Option<String>,
    #[serde(rename = "maximumAssessmentInterval", default)]
    pub maximum_assessment_interval: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Validated request, immutable after ingest.
#[derive(Debug, Clone)]
pub struct Request {
    pub sequence: u64,
    pub operation: Operation,
    pub activity_id: String,
    pub start_time: DateTime<Utc>,
    /// Present iff `operation == Installation` (capped at the ceiling)
    pub maximum_duration: Option<Duration>,
    pub reboot_setting: RebootSetting,
    /// Empty means "all classifications"
    pub classifications_to_include: Vec<Classification>,
    pub patches_to_include: Vec<String>,
    pub patches_to_exclude: Vec<String>,
    pub patch_mode: Option<PatchMode>,
    pub assessment_mode: Option<PatchMode>,
    pub maximum_assessment_interval: Option<Duration>,
    /// Fields this version does not recognize, preserved verbatim
    pub extra: BTreeMap<String, Value>,
}

impl Request {
    /// Validate a raw settings payload into a `Request`.
    pub fn from_raw(sequence: u64, raw: RawSettings) -> Result<Self> {
        let operation = match raw.operation.as_str() {
            "Assessment" => Operation::Assessment,
            "Installation" => Operation::Installation,
            "ConfigurePatching" => Operation::ConfigurePatching,
            "NoOperation" => Operation::NoOperation,
            other => {
                return Err(Error::Configuration(format!(
                    "Unknown operation '{}'",
                    other
                )))
            }
        };

        if raw.activity_id.trim().is_empty() {
            return Err(Error::Configuration("activityId is required".to_string()));
        }

        let start_time = DateTime::parse_from_rfc3339(&raw.start_time)
            .map_err(|e| Error::Configuration(format!("Bad startTime '{}': {}", raw.start_time, e)))?
            .with_timezone(&Utc);

        let maximum_duration = match (&operation, &raw.maximum_duration) {
            (Operation::Installation, Some(d)) => {
                let parsed = parse_iso8601_duration(d)?;
                if parsed > MAXIMUM_DURATION_CEILING {
                    debug!(
                        "maximumDuration {} exceeds ceiling, capping at {:?}",
                        d, MAXIMUM_DURATION_CEILING
                    );
                    Some(MAXIMUM_DURATION_CEILING)
                } else {
                    Some(parsed)
                }
            }
            (Operation::Installation, None) => {
                return Err(Error::Configuration(
                    "maximumDuration is required for Installation".to_string(),
                ))
            }
            // Ignored for every other operation
            _ => None,
        };

        let reboot_setting = match (&operation, raw.reboot_setting.as_deref()) {
            (_, Some("IfRequired")) => RebootSetting::IfRequired,
            (_, Some("Never")) => RebootSetting::Never,
            (_, Some("Always")) => RebootSetting::Always,
            (Operation::Installation, Some(other)) => {
                return Err(Error::Configuration(format!(
                    "Unknown rebootSetting '{}'",
                    other
                )))
            }
            (Operation::Installation, None) => {
                return Err(Error::Configuration(
                    "rebootSetting is required for Installation".to_string(),
                ))
            }
            // Safe default outside installation
            _ => RebootSetting::Never,
        };

        let classifications_to_include =
            normalize_classifications(&raw.classifications_to_include)?;

        validate_start_time(&operation, start_time, maximum_duration)?;

        let patch_mode = parse_patch_mode(raw.patch_mode.as_deref(), "patchMode")?;
        let assessment_mode = parse_patch_mode(raw.assessment_mode.as_deref(), "assessmentMode")?;
        let maximum_assessment_interval = raw
            .maximum_assessment_interval
            .as_deref()
            .map(parse_iso8601_duration)
            .transpose()?;

        Ok(Self {
            sequence,
            operation,
            activity_id: raw.activity_id,
            start_time,
            maximum_duration,
            reboot_setting,
            classifications_to_include,
            patches_to_include: raw.patches_to_include,
            patches_to_exclude: raw.patches_to_exclude,
            patch_mode,
            assessment_mode,
            maximum_assessment_interval,
            extra: raw.extra,
        })
    }

    /// True when the classification filter admits everything.
    pub fn includes_all_classifications(&self) -> bool {
        self.classifications_to_include.is_empty()
    }
}

/// Normalize the classification list per the host contract: Critical and
/// Security travel together. A request naming Security without Critical is
/// corrected (higher layers are known to send that shape); Other combined
/// with exactly one of the pair is rejected.
fn normalize_classifications(raw: &[String]) -> Result<Vec<Classification>> {
    let mut parsed = Vec::new();
    for entry in raw {
        let c = Classification::parse(entry).ok_or_else(|| {
            Error::Configuration(format!("Unknown classification '{}'", entry))
        })?;
        if c == Classification::Unknown {
            return Err(Error::Configuration(
                "'Unknown' is not a selectable classification".to_string(),
            ));
        }
        if !parsed.contains(&c) {
            parsed.push(c);
        }
    }

    let has_critical = parsed.contains(&Classification::Critical);
    let has_security = parsed.contains(&Classification::Security);
    let has_other = parsed.contains(&Classification::Other);

    if has_other && (has_critical ^ has_security) {
        return Err(Error::Configuration(
            "Critical and Security must be selected together".to_string(),
        ));
    }
    if has_security && !has_critical {
        debug!("Correcting classification list: adding Critical alongside Security");
        parsed.insert(0, Classification::Critical);
    } else if has_critical && !has_security {
        debug!("Correcting classification list: adding Security alongside Critical");
        parsed.insert(1.min(parsed.len()), Classification::Security);
    }

    Ok(parsed)
}

fn validate_start_time(
    operation: &Operation,
    start_time: DateTime<Utc>,
    maximum_duration: Option<Duration>,
) -> Result<()> {
    let now = Utc::now();
    // Future start times mean "run immediately"; only staleness aborts.
    if start_time >= now {
        return Ok(());
    }
    match operation {
        Operation::Installation => {
            let window = maximum_duration.unwrap_or(DEFAULT_MAXIMUM_DURATION);
            let window = ChronoDuration::from_std(window).unwrap_or_else(|_| max_start_time_age());
            if start_time + window < now {
                return Err(Error::Configuration(format!(
                    "startTime {} plus maximumDuration has already elapsed; the maintenance window is over",
                    start_time.to_rfc3339()
                )));
            }
        }
        _ => {
            if now - start_time > max_start_time_age() {
                return Err(Error::Configuration(format!(
                    "startTime {} is too far in the past",
                    start_time.to_rfc3339()
                )));
            }
        }
    }
    Ok(())
}

fn parse_patch_mode(value: Option<&str>, field: &str) -> Result<Option<PatchMode>> {
    match value {
        None => Ok(None),
        Some("ImageDefault") => Ok(Some(PatchMode::ImageDefault)),
        Some("AutomaticByPlatform") => Ok(Some(PatchMode::AutomaticByPlatform)),
        Some(other) => Err(Error::Configuration(format!(
            "Unknown {} '{}'",
            field, other
        ))),
    }
}

/// Parse an ISO-8601 duration of the `PnDTnHnMnS` family into a `Duration`.
///
/// Only the units the host contract uses are supported; week and month
/// designators are rejected.
pub fn parse_iso8601_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let rest = s
        .strip_prefix('P')
        .ok_or_else(|| Error::Configuration(format!("Invalid ISO-8601 duration '{}'", s)))?;

    let mut total_secs: u64 = 0;
    let mut in_time = false;
    let mut digits = String::new();
    let mut saw_component = false;

    for ch in rest.chars() {
        match ch {
            'T' => {
                if in_time || !digits.is_empty() {
                    return Err(Error::Configuration(format!(
                        "Invalid ISO-8601 duration '{}'",
                        s
                    )));
                }
                in_time = true;
            }
            '0'..='9' => digits.push(ch),
            'D' | 'H' | 'M' | 'S' => {
                let value: u64 = digits.parse().map_err(|_| {
                    Error::Configuration(format!("Invalid ISO-8601 duration '{}'", s))
                })?;
                digits.clear();
                saw_component = true;
                let multiplier = match (ch, in_time) {
                    ('D', false) => 86_400,
                    ('H', true) => 3_600,
                    ('M', true) => 60,
                    ('S', true) => 1,
                    _ => {
                        return Err(Error::Configuration(format!(
                            "Invalid ISO-8601 duration '{}'",
                            s
                        )))
                    }
                };
                total_secs = total_secs.saturating_add(value * multiplier);
            }
            _ => {
                return Err(Error::Configuration(format!(
                    "Invalid ISO-8601 duration '{}'",
                    s
                )))
            }
        }
    }

    if !digits.is_empty() || !saw_component {
        return Err(Error::Configuration(format!(
            "Invalid ISO-8601 duration '{}'",
            s
        )));
    }

    Ok(Duration::from_secs(total_secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(operation: &str) -> RawSettings {
        RawSettings {
            operation: operation.to_string(),
            activity_id: "a1".to_string(),
            start_time: Utc::now().to_rfc3339(),
            maximum_duration: Some("PT30M".to_string()),
            reboot_setting: Some("IfRequired".to_string()),
            classifications_to_include: vec![],
            patches_to_include: vec![],
            patches_to_exclude: vec![],
            patch_mode: None,
            assessment_mode: None,
            maximum_assessment_interval: None,
            extra: BTreeMap::new(),
        }
    }

    // ====================
    // Duration parsing
    // ====================

    #[test]
    fn test_parse_iso8601_duration() {
        assert_eq!(
            parse_iso8601_duration("PT30M").unwrap(),
            Duration::from_secs(1800)
        );
        assert_eq!(
            parse_iso8601_duration("PT1H30M").unwrap(),
            Duration::from_secs(5400)
        );
        assert_eq!(
            parse_iso8601_duration("P1DT2H").unwrap(),
            Duration::from_secs(93600)
        );
        assert_eq!(
            parse_iso8601_duration("PT90S").unwrap(),
            Duration::from_secs(90)
        );
    }

    #[test]
    fn test_parse_iso8601_duration_rejects_garbage() {
        assert!(parse_iso8601_duration("30M").is_err());
        assert!(parse_iso8601_duration("P").is_err());
        assert!(parse_iso8601_duration("PT").is_err());
        assert!(parse_iso8601_duration("PT30X").is_err());
        assert!(parse_iso8601_duration("P1M").is_err()); // month designator
    }

    // ====================
    // Validation
    // ====================

    #[test]
    fn test_installation_requires_duration() {
        let mut r = raw("Installation");
        r.maximum_duration = None;
        assert!(matches!(
            Request::from_raw(1, r).unwrap_err(),
            Error::Configuration(_)
        ));
    }

    #[test]
    fn test_installation_duration_capped_at_ceiling() {
        let mut r = raw("Installation");
        r.maximum_duration = Some("PT12H".to_string());
        let req = Request::from_raw(1, r).unwrap();
        assert_eq!(req.maximum_duration, Some(MAXIMUM_DURATION_CEILING));
    }

    #[test]
    fn test_assessment_ignores_duration_and_reboot() {
        let mut r = raw("Assessment");
        r.maximum_duration = None;
        r.reboot_setting = None;
        let req = Request::from_raw(1, r).unwrap();
        assert_eq!(req.maximum_duration, None);
        assert_eq!(req.reboot_setting, RebootSetting::Never);
    }

    #[test]
    fn test_security_pulls_in_critical() {
        let mut r = raw("Installation");
        r.classifications_to_include = vec!["Security".to_string()];
        let req = Request::from_raw(1, r).unwrap();
        assert_eq!(
            req.classifications_to_include,
            vec![Classification::Critical, Classification::Security]
        );
    }

    #[test]
    fn test_other_with_only_security_is_rejected() {
        let mut r = raw("Installation");
        r.classifications_to_include = vec!["Other".to_string(), "Security".to_string()];
        assert!(Request::from_raw(1, r).is_err());
    }

    #[test]
    fn test_empty_classifications_means_all() {
        let req = Request::from_raw(1, raw("Installation")).unwrap();
        assert!(req.includes_all_classifications());
    }

    #[test]
    fn test_future_start_time_runs_immediately() {
        let mut r = raw("Installation");
        r.start_time = (Utc::now() + ChronoDuration::hours(2)).to_rfc3339();
        assert!(Request::from_raw(1, r).is_ok());
    }

    #[test]
    fn test_elapsed_window_is_rejected() {
        let mut r = raw("Installation");
        r.start_time = (Utc::now() - ChronoDuration::hours(3)).to_rfc3339();
        r.maximum_duration = Some("PT30M".to_string());
        let err = Request::from_raw(1, r).unwrap_err();
        assert!(err.to_string().contains("maintenance window"));
    }

    #[test]
    fn test_unknown_fields_preserved() {
        let json = r#"{
            "operation": "Assessment",
            "activityId": "a1",
            "startTime": "2024-01-01T00:00:00Z",
            "futureKnob": {"enabled": true}
        }"#;
        let raw: RawSettings = serde_json::from_str(json).unwrap();
        assert!(raw.extra.contains_key("futureKnob"));
    }
}
