// src/signals.rs

//! SIGTERM observation
//!
//! The host agent cancels an extension by sending SIGTERM. The handler
//! only flips a flag; the orchestrator polls it at patch boundaries and
//! turns it into a cooperative cancellation (a running package install is
//! allowed to finish).

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

static SIGTERM_RECEIVED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigterm(_signal: i32) {
    SIGTERM_RECEIVED.store(true, Ordering::SeqCst);
}

/// Install the SIGTERM handler. Call once at startup.
pub fn install_sigterm_handler() -> nix::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_sigterm),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    // Safety: on_sigterm is async-signal-safe (a single atomic store)
    unsafe { sigaction(Signal::SIGTERM, &action) }?;
    debug!("SIGTERM handler installed");
    Ok(())
}

/// Whether SIGTERM has arrived since startup.
pub fn sigterm_received() -> bool {
    SIGTERM_RECEIVED.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::raise;

    #[test]
    fn test_sigterm_sets_flag() {
        install_sigterm_handler().unwrap();
        assert!(!sigterm_received());
        // raise() delivers to the calling thread before returning
        raise(Signal::SIGTERM).unwrap();
        assert!(sigterm_received());
    }
}
