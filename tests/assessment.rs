// tests/assessment.rs

//! Assessment runs: enumeration without mutation.

mod common;

use common::*;
use guestpatch::model::Classification;
use guestpatch::RunStatus;

#[test]
fn assessment_reports_all_candidates_without_installing() {
    // Ubuntu box with a security update and a regular one
    let env = setup_env(
        MockAdapter::new()
            .with_update("openssl", "1.1.1k", Classification::Security)
            .with_update("vim", "8.2", Classification::Other),
    );

    let run = run_orchestrator(&env, assessment_request(1));
    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.patches.len(), 2);
    assert_eq!(env.adapter.install_count(), 0);

    let (envelope, inner) = read_status(&env, 1);
    assert_eq!(envelope["status"]["status"], "success");
    assert_eq!(envelope["status"]["operation"], "Assessment");
    assert_eq!(envelope["status"]["substatus"][0]["name"], "PatchAssessmentSummary");

    let patches = inner["patches"].as_array().unwrap();
    assert_eq!(patches.len(), 2);
    // Security sorts ahead of Other
    assert_eq!(patches[0]["name"], "openssl");
    assert_eq!(patches[0]["classifications"][0], "Security");
    assert_eq!(patches[1]["name"], "vim");
    assert_eq!(patches[1]["classifications"][0], "Other");
    assert_eq!(inner["criticalAndSecurityPatchCount"], 1);
    assert_eq!(inner["otherPatchCount"], 1);
}

#[test]
fn assessment_with_no_updates_succeeds_empty() {
    let env = setup_env(MockAdapter::new());
    let run = run_orchestrator(&env, assessment_request(1));
    assert_eq!(run.status, RunStatus::Succeeded);

    let (_, inner) = read_status(&env, 1);
    assert_eq!(inner["patches"].as_array().unwrap().len(), 0);
}

#[test]
fn assessment_failure_surfaces_in_status() {
    let mut adapter = MockAdapter::new();
    adapter.fail_listing = true;
    let env = setup_env(adapter);

    let run = run_orchestrator(&env, assessment_request(2));
    assert_eq!(run.status, RunStatus::Failed);

    let (envelope, inner) = read_status(&env, 2);
    assert_eq!(envelope["status"]["status"], "error");
    assert_eq!(inner["errors"]["code"], 1);
}

#[test]
fn repeated_assessment_is_idempotent() {
    let env = setup_env(
        MockAdapter::new()
            .with_update("openssl", "1.1.1k", Classification::Security)
            .with_update("vim", "8.2", Classification::Other),
    );

    let first = run_orchestrator(&env, assessment_request(1));
    let second = run_orchestrator(&env, assessment_request(2));

    let first_rows: Vec<(String, String)> = first
        .patches
        .iter()
        .map(|p| (p.name.clone(), p.version.clone()))
        .collect();
    let second_rows: Vec<(String, String)> = second
        .patches
        .iter()
        .map(|p| (p.name.clone(), p.version.clone()))
        .collect();
    assert_eq!(first_rows, second_rows);
    assert_eq!(env.adapter.install_count(), 0);
}

#[test]
fn assessment_notes_pending_reboot() {
    let mut adapter = MockAdapter::new().with_update("kernel", "5.4.0", Classification::Security);
    adapter.reboot_required = true;
    let env = setup_env(adapter);

    run_orchestrator(&env, assessment_request(1));
    let (_, inner) = read_status(&env, 1);
    assert_eq!(inner["rebootPending"], true);
}
