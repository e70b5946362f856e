// src/orchestrator/watcher.rs

//! Config-folder watcher for supersession
//!
//! Polls the config folder at 1 Hz. A newer sequence carrying
//! `operation=NoOperation` for the same activity cancels the in-flight
//! run cooperatively; the current package install is allowed to finish.

use crate::config::{self, Operation};
use crate::window::RunControl;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info};

const POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct WatcherGuard {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl WatcherGuard {
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for WatcherGuard {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Watch for a newer NoOperation sequence superseding `current_sequence`.
pub fn spawn_config_watcher(
    config_folder: PathBuf,
    current_sequence: u64,
    activity_id: String,
    control: Arc<RunControl>,
) -> WatcherGuard {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = Arc::clone(&stop);

    let thread = std::thread::Builder::new()
        .name("config-watcher".to_string())
        .spawn(move || {
            while !stop_flag.load(Ordering::SeqCst) {
                check_once(&config_folder, current_sequence, &activity_id, &control);
                if control.is_cancelled() {
                    return;
                }
                std::thread::sleep(POLL_INTERVAL);
            }
        })
        .expect("spawn config watcher thread");

    WatcherGuard { stop, thread: Some(thread) }
}

fn check_once(
    config_folder: &std::path::Path,
    current_sequence: u64,
    activity_id: &str,
    control: &RunControl,
) {
    let Ok(Some(newest)) = config::latest_settings(config_folder) else {
        return;
    };
    if newest.sequence <= current_sequence {
        return;
    }

    match config::read_request(&newest) {
        Ok(request) if request.operation == Operation::NoOperation => {
            if request.activity_id == activity_id {
                info!(
                    "Sequence {} supersedes {} with NoOperation; cancelling",
                    newest.sequence, current_sequence
                );
                control.request_cancel(format!(
                    "Superseded by NoOperation sequence {}",
                    newest.sequence
                ));
            } else {
                debug!(
                    "Newer NoOperation sequence {} has a different activity; ignoring",
                    newest.sequence
                );
            }
        }
        Ok(_) => debug!(
            "Newer sequence {} is not a NoOperation; the next invocation will handle it",
            newest.sequence
        ),
        Err(e) => debug!("Cannot read superseding sequence {}: {}", newest.sequence, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::fs;
    use tempfile::TempDir;

    fn write_settings(dir: &std::path::Path, sequence: u64, operation: &str, activity: &str) {
        fs::write(
            dir.join(format!("{}.settings", sequence)),
            format!(
                r#"{{"operation": "{}", "activityId": "{}", "startTime": "{}"}}"#,
                operation,
                activity,
                Utc::now().to_rfc3339()
            ),
        )
        .unwrap();
    }

    #[test]
    fn test_noop_supersession_cancels() {
        let temp = TempDir::new().unwrap();
        write_settings(temp.path(), 1, "Installation", "a1");
        write_settings(temp.path(), 2, "NoOperation", "a1");

        let control = RunControl::new();
        check_once(temp.path(), 1, "a1", &control);
        assert!(control.is_cancelled());
        assert!(control.cancel_reason().unwrap().contains("sequence 2"));
    }

    #[test]
    fn test_other_activity_is_ignored() {
        let temp = TempDir::new().unwrap();
        write_settings(temp.path(), 2, "NoOperation", "different");

        let control = RunControl::new();
        check_once(temp.path(), 1, "a1", &control);
        assert!(!control.is_cancelled());
    }

    #[test]
    fn test_newer_non_noop_is_ignored() {
        let temp = TempDir::new().unwrap();
        write_settings(temp.path(), 2, "Assessment", "a1");

        let control = RunControl::new();
        check_once(temp.path(), 1, "a1", &control);
        assert!(!control.is_cancelled());
    }

    #[test]
    fn test_older_sequence_is_ignored() {
        let temp = TempDir::new().unwrap();
        write_settings(temp.path(), 1, "NoOperation", "a1");

        let control = RunControl::new();
        check_once(temp.path(), 5, "a1", &control);
        assert!(!control.is_cancelled());
    }
}
