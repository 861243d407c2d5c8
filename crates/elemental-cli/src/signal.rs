//! SIGINT wiring for cooperative cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use elemental_hal::CancelToken;
use nix::sys::signal::{self, SigHandler, Signal};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_interrupt(_: i32) {
    // Only flip a flag in signal context; the watcher thread does the rest.
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Cancels the given token when SIGINT arrives.
pub fn cancel_on_interrupt(token: CancelToken) {
    let result = unsafe { signal::signal(Signal::SIGINT, SigHandler::Handler(on_interrupt)) };
    if let Err(err) = result {
        log::warn!("failed installing SIGINT handler: {err}");
        return;
    }

    std::thread::spawn(move || loop {
        if INTERRUPTED.swap(false, Ordering::SeqCst) {
            log::warn!("cancellation requested, rolling back");
            token.cancel();
        }
        std::thread::sleep(Duration::from_millis(100));
    });
}
