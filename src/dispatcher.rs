//! Inbound surface of the supervisor: everything outside the decision loop talks to it from here.
use crate::event::cancellation::CancellationMessage;
use crate::event::channel::{pub_sub, EventConsumer, EventPublisher};
use crate::event::{ControlRequest, SupervisorEvent};
use crate::state::snapshot::StateSnapshot;
use crate::state::{StateStore, Subscription};
use crate::utils::thread_context::{
    spawn_named_thread, NotStartedThreadContext, StartedThreadContext,
};
use nix::sys::signal::Signal;
use signal_hook::consts::signal::{SIGALRM, SIGHUP, SIGINT, SIGQUIT, SIGTERM, SIGUSR1, SIGUSR2, SIGWINCH};
use signal_hook::iterator::{Handle, Signals};
use std::io;
use std::os::raw::c_int;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// How long a control request waits for the decision loop to answer.
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Signals relayed to the supervised program.
pub const FORWARDED_SIGNALS: [c_int; 8] = [
    SIGHUP, SIGINT, SIGQUIT, SIGTERM, SIGUSR1, SIGUSR2, SIGWINCH, SIGALRM,
];

/// Routes signals and operator requests into the supervisor's event queue. It never decides.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    publisher: EventPublisher<SupervisorEvent>,
    reply_timeout: Duration,
}

impl Dispatcher {
    pub(crate) fn new(publisher: EventPublisher<SupervisorEvent>) -> Self {
        Self {
            publisher,
            reply_timeout: REPLY_TIMEOUT,
        }
    }

    pub fn with_reply_timeout(self, reply_timeout: Duration) -> Self {
        Self {
            reply_timeout,
            ..self
        }
    }

    /// Enqueues `signal` without waiting. Returns false when the supervisor is gone.
    pub fn forward_signal(&self, signal: Signal) -> bool {
        self.publisher
            .publish(SupervisorEvent::Signal(signal))
            .map_err(|err| debug!(?signal, "signal not forwarded: {err}"))
            .is_ok()
    }

    /// Enqueues `request` and waits for the decision loop to accept or reject it. A request left
    /// unanswered past the reply timeout is reported as rejected and is never acted upon.
    pub fn request(&self, request: ControlRequest) -> bool {
        let (reply, replies) = pub_sub();
        let deadline = Instant::now() + self.reply_timeout;
        let event = SupervisorEvent::request(request, reply, deadline);
        if let Err(err) = self.publisher.publish(event) {
            warn!(%request, "request not delivered: {err}");
            return false;
        }
        match replies.as_ref().recv_deadline(deadline) {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(%request, timeout = ?self.reply_timeout, "no answer to request: {err}");
                false
            }
        }
    }

    pub fn start(&self) -> bool {
        self.request(ControlRequest::Start)
    }

    pub fn restart(&self) -> bool {
        self.request(ControlRequest::Restart)
    }
}

/// What an outer layer (e.g. an HTTP API) needs to drive and observe the supervisor.
#[derive(Clone)]
pub struct ControlHandle {
    dispatcher: Dispatcher,
    store: StateStore,
    files: Arc<[PathBuf]>,
}

impl ControlHandle {
    pub fn new(dispatcher: Dispatcher, store: StateStore, files: Vec<PathBuf>) -> Self {
        Self {
            dispatcher,
            store,
            files: files.into(),
        }
    }

    pub fn start(&self) -> bool {
        self.dispatcher.start()
    }

    pub fn restart(&self) -> bool {
        self.dispatcher.restart()
    }

    /// Re-reads the watched files. False when any of them could not be read.
    pub fn refresh_files(&self) -> bool {
        self.store.refresh_files(&self.files).is_complete()
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.store.snapshot()
    }

    pub fn subscribe(&self) -> Subscription {
        self.store.subscribe()
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        self.store.unsubscribe(id)
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }
}

/// Refreshes the watched files every `interval` until stopped.
pub fn spawn_files_refresher(handle: ControlHandle, interval: Duration) -> StartedThreadContext {
    let refresh = move |cancel: EventConsumer<CancellationMessage>| {
        while !cancel.is_cancelled_with_timeout(interval) {
            handle.refresh_files();
        }
        debug!("files refresher stopped");
    };
    NotStartedThreadContext::new("files-refresher", refresh).start()
}

/// Catches [FORWARDED_SIGNALS] sent to the supervisor and hands them to the dispatcher.
pub struct SignalRelay {
    handle: Handle,
    join_handle: JoinHandle<()>,
}

impl SignalRelay {
    pub fn start(dispatcher: Dispatcher) -> io::Result<Self> {
        let mut signals = Signals::new(FORWARDED_SIGNALS)?;
        let handle = signals.handle();
        let join_handle = spawn_named_thread("signal-relay", move || {
            for raw in signals.forever() {
                match Signal::try_from(raw) {
                    Ok(signal) => {
                        debug!(?signal, "signal received");
                        if !dispatcher.forward_signal(signal) {
                            break;
                        }
                    }
                    Err(err) => error!(raw, "unexpected signal number: {err}"),
                }
            }
        });
        Ok(Self {
            handle,
            join_handle,
        })
    }

    pub fn stop(self) {
        self.handle.close();
        if self.join_handle.join().is_err() {
            error!("signal relay thread panicked");
        }
    }
}
