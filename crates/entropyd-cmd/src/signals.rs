//! Shutdown signal handling for the serve loop.
//!
//! Uses `sigaction` without `SA_RESTART` so a pending `poll` returns `EINTR`
//! and the loop notices the flag promptly.

use std::sync::atomic::{AtomicBool, Ordering};

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Check if shutdown was requested via SIGTERM or SIGINT.
pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

fn set_handler(sig: libc::c_int, handler: libc::sighandler_t) {
    // SAFETY: zeroed sigaction is valid; we fill sa_sigaction and leave sa_flags empty.
    let mut sa: libc::sigaction = unsafe { std::mem::zeroed() };
    sa.sa_sigaction = handler;
    // SAFETY: sa is properly initialized, sig is a valid signal number.
    unsafe {
        libc::sigaction(sig, &sa, std::ptr::null_mut());
    }
}

/// - SIGTERM/SIGINT: set the shutdown flag
/// - SIGPIPE: ignore; replies to departed peers must not kill the daemon
pub fn install() {
    set_handler(
        libc::SIGTERM,
        handle_shutdown_signal as *const () as libc::sighandler_t,
    );
    set_handler(
        libc::SIGINT,
        handle_shutdown_signal as *const () as libc::sighandler_t,
    );
    set_handler(libc::SIGPIPE, libc::SIG_IGN);
}

extern "C" fn handle_shutdown_signal(_sig: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}
