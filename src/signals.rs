//! Signal handling.
//!
//! Two handler generations cover the session lifetime. During setup the
//! async-signal-safe cleanup handler closes the control descriptor and sets
//! the signaled flag, which unwinds whatever AT transaction is in flight.
//! Once pppd is running, the catch handler replaces it and merely records
//! the first signal number; the supervise loop observes the cell at its
//! iteration boundaries and tears the session down cooperatively.
//!
//! The three cells below are the only state shared with signal context.
//! They are plain atomics accessed with relaxed ordering; the handlers call
//! nothing but `close`.

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

/// Control descriptor the cleanup handler may close, -1 when unpublished.
static CONTROL_FD: AtomicI32 = AtomicI32::new(-1);

/// Set by the cleanup handler; never cleared once set.
static SIGNALED: AtomicBool = AtomicBool::new(false);

/// First signal number seen by the catch handler, 0 if none.
static CAUGHT: AtomicI32 = AtomicI32::new(0);

extern "C" fn cleanup_handler(_signum: libc::c_int) {
    let fd = CONTROL_FD.swap(-1, Ordering::Relaxed);
    if fd >= 0 {
        unsafe { libc::close(fd) };
    }
    SIGNALED.store(true, Ordering::Relaxed);
}

extern "C" fn catch_handler(signum: libc::c_int) {
    let _ = CAUGHT.compare_exchange(0, signum, Ordering::Relaxed, Ordering::Relaxed);
}

/// Ignore SIGPIPE and install the cleanup handler for termination signals.
pub fn init() -> nix::Result<()> {
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    unsafe { sigaction(Signal::SIGPIPE, &ignore)? };

    let cleanup = SigAction::new(
        SigHandler::Handler(cleanup_handler),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for signal in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP] {
        unsafe { sigaction(signal, &cleanup)? };
    }
    Ok(())
}

/// Swap in the catch handler. Called right before pppd starts; from here on
/// signals no longer touch the control descriptor.
pub fn arm_catch() -> nix::Result<()> {
    let catch = SigAction::new(
        SigHandler::Handler(catch_handler),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for signal in [
        Signal::SIGINT,
        Signal::SIGTERM,
        Signal::SIGHUP,
        Signal::SIGCHLD,
    ] {
        unsafe { sigaction(signal, &catch)? };
    }
    Ok(())
}

/// Expose the control descriptor to the cleanup handler.
pub fn publish_control_fd(fd: RawFd) {
    CONTROL_FD.store(fd, Ordering::Relaxed);
}

/// Withdraw the control descriptor from the cleanup handler.
///
/// Returns the descriptor if the handler has not closed it, so ownership of
/// the close is unambiguous: exactly one of the handler and the caller wins
/// the swap.
pub fn take_control_fd() -> Option<RawFd> {
    let fd = CONTROL_FD.swap(-1, Ordering::Relaxed);
    (fd >= 0).then_some(fd)
}

/// Whether the cleanup handler ran due to a signal.
pub fn signaled() -> bool {
    SIGNALED.load(Ordering::Relaxed)
}

/// First signal recorded by the catch handler, 0 if none.
pub fn caught() -> i32 {
    CAUGHT.load(Ordering::Relaxed)
}
