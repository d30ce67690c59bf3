//! Lifecycle owner of the supervised program.
//!
//! [Supervisor::run] is a single-threaded decision loop. Signals, operator requests, child exits
//! and restart timers all arrive as [SupervisorEvent]s on one queue, so every lifecycle change
//! is applied in the order it was received and published to the [StateStore] from here only.
pub mod backoff;
pub mod command;
pub mod error;
mod pipe;
pub mod policy;

use crate::dispatcher::Dispatcher;
use crate::event::cancellation::CancellationMessage;
use crate::event::channel::{pub_sub, EventConsumer, EventPublisher};
use crate::event::{ControlRequest, SupervisorEvent};
use crate::state::snapshot::ProcessState;
use crate::state::StateStore;
use crate::utils::thread_context::{spawn_named_thread, NotStartedThreadContext, StartedThreadContext};
use backoff::Backoff;
use command::{exit_code, send_signal, CommandOSNotStarted, CommandOSStarted, LogOutput};
use crossbeam::channel::RecvTimeoutError;
use error::SupervisorError;
use nix::sys::signal::Signal;
use policy::{ExitAction, RestartPolicy};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// The running program instance. A waiter thread reports its exit, the loop reaps it, so the
/// pid cannot be recycled while the loop may still signal it.
#[derive(Debug)]
struct ChildHandle {
    pid: u32,
    command: CommandOSStarted,
    started_at: Instant,
}

impl ChildHandle {
    /// Collects the exit status of an exited program, returning its exit code and uptime.
    fn reap(self) -> (i32, Duration) {
        let (pid, uptime) = (self.pid, self.started_at.elapsed());
        let exit_code = match self.command.wait() {
            Ok(status) => exit_code(&status),
            Err(err) => {
                warn!(pid, "could not get program exit status: {err}");
                1
            }
        };
        (exit_code, uptime)
    }
}

/// A graceful restart in flight: the restart signal was sent to `pid` and the timer is armed.
#[derive(Debug)]
struct Handshake {
    pid: u32,
    timer: Option<StartedThreadContext>,
}

#[derive(Debug, PartialEq)]
enum Next {
    Spawn,
    Backoff(Instant),
    AwaitManualStart,
    Exit(i32),
}

#[derive(Debug)]
pub struct Supervisor {
    program: String,
    args: Vec<String>,
    policy: RestartPolicy,
    backoff: Backoff,
    log_output: LogOutput,
    store: StateStore,
    publisher: EventPublisher<SupervisorEvent>,
    consumer: EventConsumer<SupervisorEvent>,
    child: Option<ChildHandle>,
    handshake: Option<Handshake>,
}

impl Supervisor {
    /// Builds a supervisor for `program` (executable followed by its arguments) together with the
    /// [Dispatcher] feeding its decision loop.
    pub fn new(
        program: Vec<String>,
        policy: RestartPolicy,
        store: StateStore,
    ) -> Result<(Self, Dispatcher), SupervisorError> {
        let (executable, args) = program.split_first().ok_or(SupervisorError::EmptyProgram)?;
        store.mutate(|s| {
            s.program = program.clone();
            s.manual = policy.is_manual();
        });
        let (publisher, consumer) = pub_sub();

        let supervisor = Self {
            program: executable.clone(),
            args: args.to_vec(),
            policy,
            backoff: Backoff::default(),
            log_output: LogOutput::default(),
            store,
            publisher: publisher.clone(),
            consumer,
            child: None,
            handshake: None,
        };
        Ok((supervisor, Dispatcher::new(publisher)))
    }

    pub fn with_log_output(self, log_output: LogOutput) -> Self {
        Self { log_output, ..self }
    }

    pub fn with_backoff(self, backoff: Backoff) -> Self {
        Self { backoff, ..self }
    }

    /// Runs the program until the supervisor has to exit and returns the exit code to use.
    ///
    /// Under [policy::OnExit::Proxy] that is the program's own code. Under any policy an
    /// interrupt received while no program is running exits with 0.
    pub fn run(mut self) -> Result<i32, SupervisorError> {
        info!(
            program = %self.program,
            on_exit = %self.policy.on_exit,
            "starting supervision"
        );
        let mut next = Next::Spawn;
        loop {
            next = match next {
                Next::Spawn => {
                    let executable = self.resolve()?;
                    self.spawn(&executable)?;
                    self.monitor()?
                }
                Next::Backoff(until) => self.wait_backoff(until)?,
                Next::AwaitManualStart => self.await_manual_start()?,
                Next::Exit(exit_code) => {
                    info!(exit_code, "supervisor exiting");
                    return Ok(exit_code);
                }
            };
        }
    }

    fn resolve(&self) -> Result<PathBuf, SupervisorError> {
        which::which(&self.program).map_err(|err| {
            SupervisorError::ExecutableNotFound(self.program.clone(), err)
        })
    }

    fn spawn(&mut self, executable: &Path) -> Result<(), SupervisorError> {
        self.store.set_state(ProcessState::Starting);
        let mut started = CommandOSNotStarted::new(executable, &self.args, self.log_output)
            .start()
            .and_then(|command| command.stream(&self.store))
            .map_err(|err| SupervisorError::Spawn(self.program.clone(), err))?;

        let pid = started.get_pid();
        let watcher = started.exit_watcher();
        let publisher = self.publisher.clone();
        spawn_named_thread(format!("child-waiter-{pid}"), move || {
            if let Err(err) = watcher.wait() {
                warn!(pid, "{err}");
            }
            let _ = publisher.publish(SupervisorEvent::ChildExited { pid });
        });

        self.child = Some(ChildHandle {
            pid,
            command: started,
            started_at: Instant::now(),
        });
        self.store.set_running(pid);
        info!(pid, executable = %executable.display(), "program started");
        Ok(())
    }

    /// Serves events while the program runs. Returns once its exit has been handled.
    fn monitor(&mut self) -> Result<Next, SupervisorError> {
        loop {
            match self.next_event()? {
                SupervisorEvent::Signal(signal) => self.forward_signal(signal),
                SupervisorEvent::Request {
                    request, deadline, ..
                } if is_expired(deadline) => drop_expired(request),
                SupervisorEvent::Request { request, reply, .. } => {
                    let accepted = match request {
                        ControlRequest::Restart => self.begin_restart(),
                        ControlRequest::Start => {
                            warn!(%request, "request rejected, program is already running");
                            false
                        }
                    };
                    reply_to(reply, accepted);
                }
                SupervisorEvent::RestartTimeout { pid } => self.force_kill(pid),
                SupervisorEvent::ChildExited { pid } => {
                    if self.child.as_ref().is_some_and(|child| child.pid == pid) {
                        return Ok(self.handle_exit());
                    }
                    debug!(pid, "ignoring exit of a previous program instance");
                }
            }
        }
    }

    fn next_event(&self) -> Result<SupervisorEvent, SupervisorError> {
        self.consumer
            .as_ref()
            .recv()
            .map_err(|_| SupervisorError::EventQueueClosed)
    }

    fn forward_signal(&self, signal: Signal) {
        let Some(child) = &self.child else {
            return;
        };
        match send_signal(child.pid, signal) {
            Ok(()) => debug!(pid = child.pid, ?signal, "signal forwarded"),
            Err(err) => warn!(pid = child.pid, ?signal, "could not forward signal: {err}"),
        }
    }

    /// Starts the graceful restart handshake. Only one can be in flight per program instance.
    fn begin_restart(&mut self) -> bool {
        let Some(pid) = self.child.as_ref().map(|child| child.pid) else {
            return false;
        };
        if self.handshake.is_some() {
            warn!(pid, "restart rejected, a restart is already in progress");
            return false;
        }
        let signal = self.policy.restart_signal;
        if let Err(err) = send_signal(pid, signal) {
            warn!(pid, ?signal, "restart failed, could not signal program: {err}");
            return false;
        }

        let publisher = self.publisher.clone();
        let timeout = self.policy.restart_timeout;
        let timer_name = format!("restart-timer-{pid}");
        let timer = NotStartedThreadContext::new(
            timer_name,
            move |cancel: EventConsumer<CancellationMessage>| {
                if !cancel.is_cancelled_with_timeout(timeout) {
                    let _ = publisher.publish(SupervisorEvent::RestartTimeout { pid });
                }
            },
        )
        .start();

        self.handshake = Some(Handshake {
            pid,
            timer: Some(timer),
        });
        self.store.set_state(ProcessState::Restarting);
        info!(pid, ?signal, ?timeout, "restarting program");
        true
    }

    /// Kills the program once when its restart timer fired before it exited.
    fn force_kill(&mut self, pid: u32) {
        let Some(timer) = self
            .handshake
            .as_mut()
            .filter(|handshake| handshake.pid == pid)
            .and_then(|handshake| handshake.timer.take())
        else {
            debug!(pid, "ignoring stale restart timeout");
            return;
        };
        stop_timer(timer);

        match send_signal(pid, Signal::SIGKILL) {
            Ok(()) => warn!(
                pid,
                timeout = ?self.policy.restart_timeout,
                "program did not exit in time, force killed process"
            ),
            Err(err) => warn!(pid, "could not force kill program: {err}"),
        }
    }

    fn handle_exit(&mut self) -> Next {
        let (exit_code, uptime) = self
            .child
            .take()
            .map(ChildHandle::reap)
            .unwrap_or((1, Duration::ZERO));
        let requested = match self.handshake.take() {
            Some(handshake) => {
                if let Some(timer) = handshake.timer {
                    stop_timer(timer);
                }
                true
            }
            None => false,
        };
        self.store.set_exited(exit_code);
        info!(exit_code, ?uptime, "program exited");

        match self.policy.decide(exit_code, requested, &mut self.backoff) {
            ExitAction::Relaunch(delay) if delay.is_zero() => Next::Spawn,
            ExitAction::Relaunch(delay) => {
                self.store.set_state(ProcessState::Restarting);
                info!(?delay, tries = self.backoff.tries(), "relaunching program after backoff");
                Next::Backoff(Instant::now() + delay)
            }
            ExitAction::AwaitManualStart => {
                self.store.set_state(ProcessState::AwaitingManualRestart);
                info!("waiting for a manual start");
                Next::AwaitManualStart
            }
            ExitAction::Terminate(exit_code) => Next::Exit(exit_code),
        }
    }

    fn wait_backoff(&mut self, until: Instant) -> Result<Next, SupervisorError> {
        loop {
            let event = match self.consumer.as_ref().recv_deadline(until) {
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) => return Ok(Next::Spawn),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(SupervisorError::EventQueueClosed)
                }
            };
            if let Some(next) = self.handle_idle(event, false) {
                return Ok(next);
            }
        }
    }

    fn await_manual_start(&mut self) -> Result<Next, SupervisorError> {
        loop {
            let event = self.next_event()?;
            if let Some(next) = self.handle_idle(event, true) {
                return Ok(next);
            }
        }
    }

    /// Handles an event while no program is running.
    fn handle_idle(&mut self, event: SupervisorEvent, awaiting_start: bool) -> Option<Next> {
        match event {
            SupervisorEvent::Signal(Signal::SIGINT) => {
                info!("interrupt received with no running program");
                Some(Next::Exit(0))
            }
            SupervisorEvent::Signal(signal) => {
                info!(?signal, "no running program, signal dropped");
                None
            }
            SupervisorEvent::Request {
                request, deadline, ..
            } if is_expired(deadline) => {
                drop_expired(request);
                None
            }
            SupervisorEvent::Request { request, reply, .. } if awaiting_start => {
                reply_to(reply, true);
                self.backoff.reset();
                info!(%request, "launching program on request");
                Some(Next::Spawn)
            }
            SupervisorEvent::Request { request, reply, .. } => {
                warn!(%request, "request rejected, program is waiting to be relaunched");
                reply_to(reply, false);
                None
            }
            SupervisorEvent::ChildExited { pid, .. } | SupervisorEvent::RestartTimeout { pid } => {
                debug!(pid, "ignoring event of a previous program instance");
                None
            }
        }
    }
}

fn reply_to(reply: Option<EventPublisher<bool>>, accepted: bool) {
    // The requester may have given up waiting.
    if let Some(reply) = reply {
        let _ = reply.publish(accepted);
    }
}

fn is_expired(deadline: Instant) -> bool {
    deadline <= Instant::now()
}

fn drop_expired(request: ControlRequest) {
    warn!(%request, "request expired before it was handled, dropping it");
}

fn stop_timer(timer: StartedThreadContext) {
    if let Err(err) = timer.stop_blocking() {
        warn!("{err}");
    }
}
