//! Process-wide cancellation flag and the interruptible wait built on it.

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use signal_hook::{
    consts::{SIGABRT, SIGINT, SIGTERM},
    flag,
};
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

/// Longest stretch an interruptible wait sleeps before re-checking the flag.
pub const POLL_SLICE: Duration = Duration::from_millis(500);

const TERM_SIGNALS: &[i32] = &[SIGINT, SIGTERM, SIGABRT];

/// How an interruptible wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    Elapsed,
    Cancelled,
}

/// Cancellation shared by the event loop and its consumer tasks.
///
/// Two sources raise it: the signal handler, which only stores `true` into
/// the shared atomic, and [`CancellationFlag::raise`], which cancels this
/// flag's token and every child token.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag {
    signalled: Arc<AtomicBool>,
    token: CancellationToken,
}

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// A flag that observes the same signals but can be raised on its own.
    pub fn child(&self) -> Self {
        Self {
            signalled: Arc::clone(&self.signalled),
            token: self.token.child_token(),
        }
    }

    /// Installs SIGINT/SIGTERM/SIGABRT handlers.
    ///
    /// The first delivery sets the flag; a second one of the same kind
    /// terminates the process with the default disposition.
    pub fn install_signal_handlers(&self) -> io::Result<()> {
        for &sig in TERM_SIGNALS {
            flag::register_conditional_default(sig, Arc::clone(&self.signalled))?;
            flag::register(sig, Arc::clone(&self.signalled))?;
        }
        Ok(())
    }

    pub fn raise(&self) {
        self.token.cancel();
    }

    pub fn is_raised(&self) -> bool {
        self.signalled.load(Ordering::Acquire) || self.token.is_cancelled()
    }

    /// True when the flag was set by a termination signal.
    pub fn by_signal(&self) -> bool {
        self.signalled.load(Ordering::Acquire)
    }

    /// Sleeps for `duration` unless the flag is raised first.
    ///
    /// Token cancellation wakes the wait at once; a signal is noticed
    /// within [`POLL_SLICE`].
    pub async fn wait(&self, duration: Duration) -> Wait {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_raised() {
                return Wait::Cancelled;
            }
            let now = Instant::now();
            if now >= deadline {
                return Wait::Elapsed;
            }
            let slice = (deadline - now).min(POLL_SLICE);
            tokio::select! {
                () = self.token.cancelled() => return Wait::Cancelled,
                () = sleep(slice) => {}
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn signal_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.signalled)
    }
}
