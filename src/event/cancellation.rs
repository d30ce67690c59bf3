use super::channel::EventConsumer;
use crossbeam::channel::RecvTimeoutError;
use std::time::Duration;

pub type CancellationMessage = ();

impl EventConsumer<CancellationMessage> {
    /// Returns true if a cancellation is already pending, without blocking.
    pub fn is_cancelled(&self) -> bool {
        self.is_cancelled_with_timeout(Duration::ZERO)
    }

    /// Waits up to `timeout` for a cancellation.
    ///
    /// A dropped publisher counts as a cancellation, so orphaned threads wind down on their own.
    /// Returns false only when the whole timeout elapsed with nothing received, which makes this
    /// usable as a cancellable sleep.
    pub fn is_cancelled_with_timeout(&self, timeout: Duration) -> bool {
        match self.recv_timeout(timeout) {
            Ok(_) | Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => false,
        }
    }
}
