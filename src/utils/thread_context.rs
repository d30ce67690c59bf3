use crate::event::{
    cancellation::CancellationMessage,
    channel::{pub_sub, EventConsumer, EventPublisher},
};
use std::thread::{self, sleep, JoinHandle};
use std::time::Duration;

const GRACEFUL_STOP_RETRY: u16 = 10;
const GRACEFUL_STOP_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Spawns a thread carrying `name`, so it shows up in panics and in debuggers.
pub fn spawn_named_thread<F, T, S>(name: S, f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
    S: ToString,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .expect("thread config should be valid")
}

/// A background routine that has not been spawned yet. The callback receives the consumer
/// side of its own cancellation channel.
pub struct NotStartedThreadContext<F>
where
    F: FnOnce(EventConsumer<CancellationMessage>) + Send + 'static,
{
    thread_name: String,
    callback: F,
}

impl<F> NotStartedThreadContext<F>
where
    F: FnOnce(EventConsumer<CancellationMessage>) + Send + 'static,
{
    pub fn new<S: Into<String>>(thread_name: S, callback: F) -> Self {
        Self {
            thread_name: thread_name.into(),
            callback,
        }
    }

    pub fn start(self) -> StartedThreadContext {
        let (stop_publisher, stop_consumer) = pub_sub::<CancellationMessage>();
        let callback = self.callback;
        let join_handle = spawn_named_thread(&self.thread_name, move || callback(stop_consumer));

        StartedThreadContext {
            thread_name: self.thread_name,
            stop_publisher,
            join_handle,
        }
    }
}

#[derive(Debug)]
pub struct StartedThreadContext {
    thread_name: String,
    stop_publisher: EventPublisher<CancellationMessage>,
    join_handle: JoinHandle<()>,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ThreadContextStopperError {
    #[error("error joining '{0}' thread: {1}")]
    JoinError(String, String),

    #[error("timeout waiting for '{0}' thread to finish")]
    StopTimeout(String),
}

impl StartedThreadContext {
    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }

    pub fn is_finished(&self) -> bool {
        self.join_handle.is_finished()
    }

    /// Signals cancellation and polls the thread for up to one second.
    pub fn stop(self) -> Result<(), ThreadContextStopperError> {
        self.cancel();
        for _ in 0..GRACEFUL_STOP_RETRY {
            if self.join_handle.is_finished() {
                return self.join();
            }
            sleep(GRACEFUL_STOP_RETRY_INTERVAL);
        }

        Err(ThreadContextStopperError::StopTimeout(self.thread_name))
    }

    /// Signals cancellation and waits for the thread to be joined.
    pub fn stop_blocking(self) -> Result<(), ThreadContextStopperError> {
        self.cancel();
        self.join()
    }

    fn cancel(&self) {
        // The consumer is gone once the routine returned on its own, nothing left to cancel then.
        let _ = self.stop_publisher.publish(());
    }

    fn join(self) -> Result<(), ThreadContextStopperError> {
        self.join_handle.join().map_err(|err| {
            ThreadContextStopperError::JoinError(
                self.thread_name,
                err.downcast_ref::<&str>()
                    .unwrap_or(&"unknown error")
                    .to_string(),
            )
        })
    }
}
