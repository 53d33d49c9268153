//! Scoped signal listeners that restore the previous disposition
//!
//! `tokio::signal` installs a process-wide handler the first time a signal is
//! listened for and never removes it. [`SignalListener`] records the
//! disposition in place before the first listener appears and puts it back
//! when the last listener for that signal is dropped. Listeners are counted
//! per signal, so overlapping users in one process share one installation.

use std::collections::HashMap;
use std::sync::{LazyLock, Mutex, MutexGuard};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tokio::signal::unix::{signal, SignalKind};

use sandbus_core::prelude::*;

#[derive(Default)]
struct Installation {
    listeners: usize,
    /// Disposition before the first listener, restored after the last
    previous: Option<SigAction>,
    /// The runtime's own handler, reinstated when listening starts again
    runtime_handler: Option<SigAction>,
}

static INSTALLATIONS: LazyLock<Mutex<HashMap<Signal, Installation>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn installations() -> MutexGuard<'static, HashMap<Signal, Installation>> {
    INSTALLATIONS.lock().unwrap_or_else(|e| e.into_inner())
}

/// Replace the action for `sig`, returning the old one
fn swap_action(sig: Signal, action: &SigAction) -> Result<SigAction> {
    // SAFETY: every action installed here is either one read back from the
    // kernel for this signal or SIG_IGN; no new handler function is introduced.
    unsafe { sigaction(sig, action) }
        .map_err(|e| Error::process(format!("sigaction({}) failed: {}", sig, e)))
}

/// Read the current action for `sig` without changing it
fn current_action(sig: Signal) -> Result<SigAction> {
    // Ignoring is the only probe value that cannot terminate the process if
    // the signal lands in between.
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    let current = swap_action(sig, &ignore)?;
    swap_action(sig, &current)?;
    Ok(current)
}

/// Current handler for `sig`
pub fn disposition(sig: Signal) -> Result<SigHandler> {
    let _guard = installations();
    Ok(current_action(sig)?.handler())
}

/// A stream of deliveries of one signal
///
/// While any listener for a signal exists the runtime's handler is
/// installed; dropping the last one restores what was there before.
pub struct SignalListener {
    sig: Signal,
    stream: tokio::signal::unix::Signal,
}

impl SignalListener {
    /// Start listening for `sig`. Must be called inside a tokio runtime.
    pub fn install(sig: Signal) -> Result<Self> {
        let mut installs = installations();
        let entry = installs.entry(sig).or_default();

        if entry.listeners == 0 {
            entry.previous = Some(current_action(sig)?);
        }

        let stream = signal(SignalKind::from_raw(sig as i32))?;

        if entry.listeners == 0 {
            // The runtime only installs its handler once per process.
            if let Some(handler) = entry.runtime_handler.as_ref() {
                swap_action(sig, handler)?;
            } else {
                entry.runtime_handler = Some(current_action(sig)?);
            }
        }

        entry.listeners += 1;
        trace!("Listening for {} ({} listeners)", sig, entry.listeners);
        Ok(Self { sig, stream })
    }

    pub fn signal(&self) -> Signal {
        self.sig
    }

    /// Wait for the next delivery; `None` once the runtime shuts down
    pub async fn recv(&mut self) -> Option<()> {
        self.stream.recv().await
    }
}

impl Drop for SignalListener {
    fn drop(&mut self) {
        let mut installs = installations();
        let Some(entry) = installs.get_mut(&self.sig) else {
            return;
        };

        entry.listeners = entry.listeners.saturating_sub(1);
        if entry.listeners > 0 {
            return;
        }

        if let Some(previous) = entry.previous.take() {
            match swap_action(self.sig, &previous) {
                Ok(_) => trace!("Restored previous {} disposition", self.sig),
                Err(e) => warn!("{}", e),
            }
        }
    }
}
