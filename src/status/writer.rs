// src/status/writer.rs

//! Serialized, coalescing status file writer
//!
//! A single writer thread owns the status file; everything else enqueues
//! documents over a bounded channel. Progress updates are best-effort (a
//! full queue drops the intermediate snapshot, never the newest state) and
//! coalesced to at most one write per 500 ms. Terminal updates block the
//! sender until accepted and are flushed immediately. Every write goes to
//! `<path>.tmp` first and is renamed into place, so an external reader
//! always sees a complete document.

use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Bounded queue depth between producers and the writer thread
const QUEUE_CAPACITY: usize = 64;

/// Minimum spacing between steady-progress writes
const COALESCE_INTERVAL: Duration = Duration::from_millis(500);

/// Attempts for a single document before giving up on this snapshot
const WRITE_RETRIES: u32 = 4;

enum Update {
    Progress(Value),
    Terminal(Value),
    Shutdown,
}

/// Producer-side handle; clone freely.
#[derive(Clone)]
pub struct StatusWriter {
    tx: SyncSender<Update>,
}

impl StatusWriter {
    /// Queue a progress snapshot. Dropped (with a debug note) if the
    /// writer is saturated; the next snapshot supersedes it anyway.
    pub fn queue_progress(&self, document: Value) {
        match self.tx.try_send(Update::Progress(document)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!("Status queue full; dropping an intermediate snapshot")
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!("Status writer is gone; progress update lost")
            }
        }
    }

    /// Queue a terminal snapshot, blocking until the writer accepts it.
    pub fn write_terminal(&self, document: Value) {
        if self.tx.send(Update::Terminal(document)).is_err() {
            warn!("Status writer is gone; terminal update lost");
        }
    }
}

/// Owner-side handle; joins the thread on shutdown.
pub struct WriterHandle {
    tx: SyncSender<Update>,
    thread: Option<JoinHandle<()>>,
}

impl WriterHandle {
    /// Spawn the writer thread for one status file.
    pub fn spawn(status_path: PathBuf) -> (StatusWriter, WriterHandle) {
        let (tx, rx) = sync_channel(QUEUE_CAPACITY);
        let thread = std::thread::Builder::new()
            .name("status-writer".to_string())
            .spawn(move || writer_loop(rx, &status_path))
            .expect("spawn status writer thread");
        (
            StatusWriter { tx: tx.clone() },
            WriterHandle { tx, thread: Some(thread) },
        )
    }

    /// Flush anything pending and stop the thread.
    pub fn shutdown(mut self) {
        let _ = self.tx.send(Update::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for WriterHandle {
    fn drop(&mut self) {
        let _ = self.tx.send(Update::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn writer_loop(rx: Receiver<Update>, path: &Path) {
    let mut pending: Option<Value> = None;
    let mut last_write = Instant::now()
        .checked_sub(COALESCE_INTERVAL)
        .unwrap_or_else(Instant::now);

    loop {
        match rx.recv_timeout(Duration::from_millis(50)) {
            Ok(Update::Progress(document)) => pending = Some(document),
            Ok(Update::Terminal(document)) => {
                pending = None;
                write_with_retry(path, &document);
                last_write = Instant::now();
            }
            Ok(Update::Shutdown) => break,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if pending.is_some() && last_write.elapsed() >= COALESCE_INTERVAL {
            if let Some(document) = pending.take() {
                write_with_retry(path, &document);
                last_write = Instant::now();
            }
        }
    }

    // Final flush of whatever progress was still coalescing
    if let Some(document) = pending {
        write_with_retry(path, &document);
    }
}

/// Atomic replace: serialize to `<path>.tmp`, then rename over the target.
/// A failed write is retried with backoff; repeated failure is logged and
/// the snapshot is abandoned (a later snapshot will try again). A status
/// write failure never aborts the run.
fn write_with_retry(path: &Path, document: &Value) {
    for attempt in 0..WRITE_RETRIES {
        match write_atomic(path, document) {
            Ok(()) => return,
            Err(e) if attempt + 1 < WRITE_RETRIES => {
                let backoff = Duration::from_millis(100 * 2u64.pow(attempt));
                warn!(
                    "Status write to {} failed (attempt {}): {}; retrying in {:?}",
                    path.display(),
                    attempt + 1,
                    e,
                    backoff
                );
                std::thread::sleep(backoff);
            }
            Err(e) => {
                warn!(
                    "Status write to {} failed after {} attempts: {}",
                    path.display(),
                    WRITE_RETRIES,
                    e
                );
            }
        }
    }
}

fn write_atomic(path: &Path, document: &Value) -> std::io::Result<()> {
    let tmp = path.with_extension("status.tmp");
    let serialized = serde_json::to_string(document)?;
    std::fs::write(&tmp, serialized)?;
    std::fs::rename(&tmp, path)
}
