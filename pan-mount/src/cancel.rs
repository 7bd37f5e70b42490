//! Cancellation for background loops.
//!
//! A [`CancelSource`] and its [`CancelToken`]s share a flag plus a channel
//! that never carries messages. Cancelling sets the flag and drops the sender,
//! which disconnects the channel and wakes any token blocked in
//! [`CancelToken::sleep`] immediately instead of at the end of its timeout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

/// Owner side. Dropping it cancels.
#[derive(Debug)]
pub struct CancelSource {
    cancelled: Arc<AtomicBool>,
    wake: Option<Sender<()>>,
}

/// Observer side, cheap to clone into worker threads.
#[derive(Debug, Clone)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    wake: Receiver<()>,
}

/// Create a connected source and token.
pub fn cancel_pair() -> (CancelSource, CancelToken) {
    let cancelled = Arc::new(AtomicBool::new(false));
    let (tx, rx) = crossbeam_channel::bounded(0);
    (
        CancelSource {
            cancelled: Arc::clone(&cancelled),
            wake: Some(tx),
        },
        CancelToken {
            cancelled,
            wake: rx,
        },
    )
}

impl CancelSource {
    pub fn cancel(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.wake.take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl Drop for CancelSource {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` unless cancelled first.
    ///
    /// Returns `true` if the full duration elapsed, `false` if cancelled
    /// (before or during the sleep).
    pub fn sleep(&self, duration: Duration) -> bool {
        if self.is_cancelled() {
            return false;
        }
        match self.wake.recv_timeout(duration) {
            Err(RecvTimeoutError::Timeout) => !self.is_cancelled(),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }
}
