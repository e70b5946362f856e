// tests/installation.rs

//! Installation runs: filtering, dependency closure, deadline and
//! cancellation behavior.

mod common;

use common::*;
use guestpatch::model::Classification;
use guestpatch::{InstallState, RunStatus, SelectedState};
use std::time::Duration;

#[test]
fn wildcard_include_pulls_dependency_closure() {
    // selinux-* selected; simulation discovers a dependency that also
    // gets installed
    let env = setup_env(
        MockAdapter::new()
            .with_update("selinux-policy", "3.13.1-102", Classification::Security)
            .with_update("selinux-policy-targeted", "3.13.1-102", Classification::Security)
            .with_update("cowsay", "3.03", Classification::Other)
            .with_dependency("selinux-policy", "selinux-policy-targeted"),
    );

    let request = installation_request(
        1,
        "PT30M",
        "Never",
        &["selinux-*"],
        &[],
        &["Critical", "Security"],
    );
    let run = run_orchestrator(&env, request);

    assert_eq!(run.status, RunStatus::Succeeded);
    let installed = env.adapter.installed_names();
    assert!(installed.contains(&"selinux-policy".to_string()));
    assert!(installed.contains(&"selinux-policy-targeted".to_string()));
    assert!(!installed.contains(&"cowsay".to_string()));

    let (envelope, inner) = read_status(&env, 1);
    assert_eq!(envelope["status"]["status"], "success");
    let states = patch_states(&inner);
    assert_eq!(states["selinux-policy"], "Installed");
    assert_eq!(states["selinux-policy-targeted"], "Installed");
    assert_eq!(states["cowsay"], "NotSelected");
}

#[test]
fn exclude_overrides_include_and_poisons_transaction() {
    // kernel-modules needs kernel-core, which is excluded: the whole
    // transaction is excluded and nothing installs
    let env = setup_env(
        MockAdapter::new()
            .with_update("kernel-modules", "5.14.0", Classification::Security)
            .with_update("kernel-core", "5.14.0", Classification::Security)
            .with_dependency("kernel-modules", "kernel-core"),
    );

    let request =
        installation_request(1, "PT30M", "Never", &["kernel*"], &["kernel-core"], &[]);
    let run = run_orchestrator(&env, request);

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(env.adapter.install_count(), 0);

    for name in ["kernel-modules", "kernel-core"] {
        let patch = run.patches.iter().find(|p| p.name == name).unwrap();
        assert_eq!(patch.selected_state, SelectedState::Excluded);
        assert_eq!(patch.install_state, InstallState::Excluded);
    }
    let poisoned = run
        .patches
        .iter()
        .find(|p| p.name == "kernel-modules")
        .unwrap();
    assert_eq!(poisoned.error_message.as_deref(), Some("excluded-dep"));
}

#[test]
fn classification_filter_limits_selection() {
    let env = setup_env(
        MockAdapter::new()
            .with_update("openssl", "1.1.1k", Classification::Security)
            .with_update("kernel", "5.4.0", Classification::Critical)
            .with_update("vim", "8.2", Classification::Other)
            .with_update("mystery", "1.0", Classification::Unknown),
    );

    let request =
        installation_request(1, "PT30M", "Never", &[], &[], &["Critical", "Security"]);
    let run = run_orchestrator(&env, request);

    assert_eq!(run.status, RunStatus::Succeeded);
    let installed = env.adapter.installed_names();
    assert!(installed.contains(&"openssl".to_string()));
    assert!(installed.contains(&"kernel".to_string()));
    // Other is filtered out; Unknown is too, because Other is not included
    assert!(!installed.contains(&"vim".to_string()));
    assert!(!installed.contains(&"mystery".to_string()));
}

#[test]
fn unknown_classification_installs_when_filter_is_empty() {
    let env = setup_env(
        MockAdapter::new().with_update("mystery", "1.0", Classification::Unknown),
    );

    let request = installation_request(1, "PT30M", "Never", &[], &[], &[]);
    let run = run_orchestrator(&env, request);

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(env.adapter.installed_names(), vec!["mystery".to_string()]);
}

#[test]
fn per_patch_failure_continues_the_loop() {
    let env = setup_env(
        MockAdapter::new()
            .with_update("good-one", "1.0", Classification::Other)
            .with_update("flaky", "2.0", Classification::Other)
            .with_update("good-two", "3.0", Classification::Other)
            .with_failing("flaky"),
    );

    let request = installation_request(1, "PT30M", "Never", &[], &[], &[]);
    let run = run_orchestrator(&env, request);

    assert_eq!(run.status, RunStatus::CompletedWithErrors);
    assert_eq!(env.adapter.install_count(), 3);

    let (envelope, inner) = read_status(&env, 1);
    assert_eq!(envelope["status"]["status"], "warning");
    let states = patch_states(&inner);
    assert_eq!(states["good-one"], "Installed");
    assert_eq!(states["flaky"], "Failed");
    assert_eq!(states["good-two"], "Installed");
    assert_eq!(inner["failedPatchCount"], 1);
    assert_eq!(inner["installedPatchCount"], 2);

    let flaky = run.patches.iter().find(|p| p.name == "flaky").unwrap();
    assert!(flaky.error_message.is_some());
}

#[test]
fn adapter_fatal_aborts_the_loop() {
    let mut adapter = MockAdapter::new()
        .with_update("alpha", "1.0", Classification::Critical)
        .with_update("broken", "1.0", Classification::Security)
        .with_update("omega", "1.0", Classification::Other);
    adapter.fatal_package = Some("broken".to_string());
    let env = setup_env(adapter);

    let request = installation_request(1, "PT30M", "Never", &[], &[], &[]);
    let run = run_orchestrator(&env, request);

    // alpha installed before the tool died, so this is a partial outcome
    assert_eq!(run.status, RunStatus::CompletedWithErrors);
    let states: Vec<(String, InstallState)> = run
        .patches
        .iter()
        .map(|p| (p.name.clone(), p.install_state))
        .collect();
    assert!(states.contains(&("alpha".to_string(), InstallState::Installed)));
    assert!(states.contains(&("broken".to_string(), InstallState::Failed)));
    assert!(states.contains(&("omega".to_string(), InstallState::NotStarted)));
}

#[test]
fn deadline_stops_the_loop_with_partial_result() {
    // 20 slow patches against a 2-second window: a few land, the rest
    // stay NotStarted, and no reboot is attempted
    let mut adapter = MockAdapter::new().with_install_delay(Duration::from_millis(400));
    for i in 0..20 {
        adapter.updates.push(guestpatch::AvailableUpdate {
            name: format!("pkg-{:02}", i),
            version: "1.0".to_string(),
            classification: Classification::Other,
        });
    }
    let env = setup_env(adapter);

    let request = installation_request(1, "PT2S", "Always", &[], &[], &[]);
    let run = run_orchestrator(&env, request);

    assert_eq!(run.status, RunStatus::CompletedWithErrors);
    assert!(run.maintenance_window_exceeded);
    assert!(env.adapter.install_count() >= 1);
    assert!(env.adapter.install_count() < 20);

    let not_started = run
        .patches
        .iter()
        .filter(|p| p.install_state == InstallState::NotStarted)
        .count();
    assert!(not_started >= 1);

    // Window exhausted: no reboot even though the setting was Always
    assert_ne!(run.reboot_status, guestpatch::RebootStatus::Started);
    assert!(!env.environment.paths().reboot_marker().exists());
}

#[test]
fn cancellation_stops_between_patches() {
    let env = setup_env(
        MockAdapter::new()
            .with_update("one", "1.0", Classification::Other)
            .with_update("two", "1.0", Classification::Other)
            .with_update("three", "1.0", Classification::Other)
            .with_update("four", "1.0", Classification::Other)
            .with_install_delay(Duration::from_millis(200)),
    );

    let control = env.environment.control();
    let canceller = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(300));
        control.request_cancel("host asked us to stop");
    });

    let request = installation_request(1, "PT30M", "Always", &[], &[], &[]);
    let run = run_orchestrator(&env, request);
    canceller.join().unwrap();

    assert_eq!(run.status, RunStatus::Aborted);
    // The in-flight patch finished; later ones were never attempted
    assert!(env.adapter.install_count() >= 1);
    assert!(env.adapter.install_count() < 4);
    let not_started = run
        .patches
        .iter()
        .filter(|p| p.install_state == InstallState::NotStarted)
        .count();
    assert!(not_started >= 1);

    // Aborted runs never reboot, even with rebootSetting=Always
    assert!(!env.environment.paths().reboot_marker().exists());

    let (envelope, _) = read_status(&env, 1);
    assert_eq!(envelope["status"]["status"], "error");
}

#[test]
fn empty_selection_succeeds_without_installs() {
    let env = setup_env(
        MockAdapter::new().with_update("vim", "8.2", Classification::Other),
    );

    let request = installation_request(1, "PT30M", "Never", &["no-such-*"], &[], &[]);
    let run = run_orchestrator(&env, request);

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(env.adapter.install_count(), 0);
    let vim = run.patches.iter().find(|p| p.name == "vim").unwrap();
    assert_eq!(vim.selected_state, SelectedState::NotSelected);
    assert_eq!(vim.install_state, InstallState::NotStarted);
}

#[test]
fn no_operation_emits_succeeded_without_touching_packages() {
    let env = setup_env(
        MockAdapter::new().with_update("vim", "8.2", Classification::Other),
    );

    let request =
        guestpatch::Request::from_raw(2, raw_settings("NoOperation", "a1")).unwrap();
    let run = run_orchestrator(&env, request);

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(env.adapter.install_count(), 0);

    let (envelope, _) = read_status(&env, 2);
    assert_eq!(envelope["status"]["status"], "success");
}
