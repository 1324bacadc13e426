//! Process-wide stop flag, raised by SIGINT/SIGTERM.
//!
//! The handler only stores to a static atomic, which is async-signal-safe.
//! Workers observe the flag when their rings drain; the capture loop polls
//! it between packets.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{bail, Result};

static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_sig: libc::c_int) {
    STOP.store(true, Ordering::Relaxed);
}

/// Installs the SIGINT/SIGTERM handlers.
pub fn install() -> Result<()> {
    // SAFETY: the handler is a plain atomic store; sigaction is given a
    // zeroed, properly initialized struct.
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        let handler: extern "C" fn(libc::c_int) = handle_signal;
        sa.sa_sigaction = handler as usize;
        sa.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut sa.sa_mask);

        for sig in [libc::SIGINT, libc::SIGTERM] {
            if libc::sigaction(sig, &sa, std::ptr::null_mut()) != 0 {
                bail!(
                    "sigaction({sig}) failed: {}",
                    std::io::Error::last_os_error()
                );
            }
        }
    }
    Ok(())
}

/// Whether a stop signal has been received (or injected).
pub fn stop_requested() -> bool {
    STOP.load(Ordering::Relaxed)
}

/// Raises the stop flag from inside the process (duration expiry).
pub fn request_stop() {
    STOP.store(true, Ordering::Relaxed);
}
