// tests/reboot_resume.rs

//! The full reboot round trip: install, persist the marker, flush
//! `rebootStatus=Started`, invoke the (mock) OS reboot, and have the next
//! invocation seal the run as Completed.
//!
//! This test raises a real SIGTERM against the process to stand in for
//! the host tearing us down while the machine goes down. The SIGTERM flag
//! is process-global, which is why this lives in its own test binary.

mod common;

use common::*;
use guestpatch::model::Classification;
use guestpatch::orchestrator;
use guestpatch::{RebootStatus, RunStatus};
use std::time::Duration;

#[test]
fn reboot_always_persists_marker_and_next_invocation_finalizes() {
    let env = setup_env(
        MockAdapter::new().with_update("openssl", "1.1.1k", Classification::Security),
    );

    guestpatch::signals::install_sigterm_handler().unwrap();
    let killer = std::thread::spawn(|| {
        std::thread::sleep(Duration::from_millis(150));
        nix::sys::signal::kill(nix::unistd::Pid::this(), nix::sys::signal::Signal::SIGTERM)
            .unwrap();
    });

    let request = installation_request(7, "PT30M", "Always", &[], &[], &[]);
    let run = run_orchestrator_with(
        &env,
        request,
        Some((vec!["true".to_string()], Duration::from_secs(10))),
    );
    killer.join().unwrap();

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.reboot_status, RebootStatus::Started);

    // Marker is on disk and the status file shows Started
    let marker_path = env.environment.paths().reboot_marker();
    assert!(marker_path.exists());
    let (_, inner) = read_status(&env, 7);
    assert_eq!(inner["rebootStatus"], "Started");
    assert_eq!(inner["installedPatchCount"], 1);

    // "After reboot": a fresh invocation seals the previous run
    orchestrator::finalize_previous_run(&env.environment).unwrap();
    assert!(!marker_path.exists());

    let (envelope, inner) = read_status(&env, 7);
    assert_eq!(envelope["status"]["status"], "success");
    assert_eq!(inner["rebootStatus"], "Completed");
}
