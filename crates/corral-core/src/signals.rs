//! Process-wide signal flags.
//!
//! Handlers only store into atomics; the master loop and the worker loop poll
//! them between blocking calls. Handlers are installed without `SA_RESTART` so
//! a blocking read returns `EINTR` and the loop gets a chance to look.

use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};

use crate::error::Result;

static STOP: AtomicBool = AtomicBool::new(false);
static RELOAD: AtomicBool = AtomicBool::new(false);

extern "C" fn on_stop(_: libc::c_int) {
    STOP.store(true, Ordering::SeqCst);
}

extern "C" fn on_reload(_: libc::c_int) {
    RELOAD.store(true, Ordering::SeqCst);
}

fn install(signal: Signal, handler: SigHandler) -> Result<()> {
    let action = SigAction::new(handler, SaFlags::empty(), SigSet::empty());
    // SAFETY: the handlers only touch atomics, which is async-signal-safe.
    unsafe { sigaction(signal, &action) }?;
    Ok(())
}

/// Master: SIGTERM and SIGINT request shutdown, SIGUSR1 requests a reload.
pub fn install_master_handlers() -> Result<()> {
    // Writes to a dead peer surface as EPIPE instead.
    install(Signal::SIGPIPE, SigHandler::SigIgn)?;
    install(Signal::SIGTERM, SigHandler::Handler(on_stop))?;
    install(Signal::SIGINT, SigHandler::Handler(on_stop))?;
    install(Signal::SIGUSR1, SigHandler::Handler(on_reload))?;
    Ok(())
}

/// Worker: SIGTERM finishes the current task and leaves the loop.
///
/// SIGINT is ignored so a terminal Ctrl-C reaches the master only; the master
/// then stops its workers in order.
pub fn install_worker_handlers() -> Result<()> {
    clear();
    install(Signal::SIGTERM, SigHandler::Handler(on_stop))?;
    install(Signal::SIGINT, SigHandler::SigIgn)?;
    install(Signal::SIGUSR1, SigHandler::SigIgn)?;
    install(Signal::SIGPIPE, SigHandler::SigIgn)?;
    Ok(())
}

/// Whether a stop signal has arrived.
pub fn stop_requested() -> bool {
    STOP.load(Ordering::SeqCst)
}

/// Consume a pending reload request.
pub fn take_reload_request() -> bool {
    RELOAD.swap(false, Ordering::SeqCst)
}

/// Flag a stop request from code rather than a signal.
pub fn request_stop() {
    STOP.store(true, Ordering::SeqCst);
}

/// Forget pending requests inherited across `fork`.
pub fn clear() {
    STOP.store(false, Ordering::SeqCst);
    RELOAD.store(false, Ordering::SeqCst);
}
