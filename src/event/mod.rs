//! Messages flowing into the supervisor's decision loop.
//!
//! Every input source (OS signals, operator requests, child exits and restart timers) is turned
//! into a [SupervisorEvent] and pushed into a single queue. The loop consuming that queue is the
//! only place where the process lifecycle changes.
pub mod cancellation;
pub mod channel;

use channel::EventPublisher;
use nix::sys::signal::Signal;
use std::fmt;
use std::time::Instant;

/// Requests an operator can issue against the supervised program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    Start,
    Restart,
}

impl fmt::Display for ControlRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlRequest::Start => write!(f, "start"),
            ControlRequest::Restart => write!(f, "restart"),
        }
    }
}

#[derive(Debug)]
pub enum SupervisorEvent {
    /// Operator request. The loop answers through `reply` whether it was accepted. Requests
    /// still queued past `deadline` are dropped without acting, as their caller got `false`.
    Request {
        request: ControlRequest,
        reply: Option<EventPublisher<bool>>,
        deadline: Instant,
    },
    /// OS signal received by the supervisor process.
    Signal(Signal),
    /// The child identified by `pid` has exited. It stays unreaped, and its pid reserved, until
    /// the loop handles this event.
    ChildExited { pid: u32 },
    /// The graceful restart of `pid` did not complete in time.
    RestartTimeout { pid: u32 },
}

impl SupervisorEvent {
    pub fn request(
        request: ControlRequest,
        reply: EventPublisher<bool>,
        deadline: Instant,
    ) -> Self {
        Self::Request {
            request,
            reply: Some(reply),
            deadline,
        }
    }
}
