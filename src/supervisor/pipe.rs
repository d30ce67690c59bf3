use crate::state::{log_ring::LogStream, StateStore};
use crate::utils::thread_context::spawn_named_thread;
use std::io::{ErrorKind, Read, Write};
use std::thread::JoinHandle;
use tracing::{debug, warn};

const RELAY_CHUNK_SIZE: usize = 8 * 1024;

/// Copies `reader` into the log record and, when given, into `passthrough` as soon as bytes
/// arrive. Unterminated output such as prompts is recorded without waiting for a newline.
/// The thread ends when the pipe closes.
pub(crate) fn spawn_pipe_relay<R, W>(
    thread_name: String,
    mut reader: R,
    stream: LogStream,
    store: StateStore,
    mut passthrough: Option<W>,
) -> JoinHandle<()>
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    spawn_named_thread(thread_name, move || {
        let mut chunk = [0u8; RELAY_CHUNK_SIZE];
        loop {
            let read = match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(read) => read,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(%stream, "stopped reading program output: {err}");
                    break;
                }
            };
            let bytes = &chunk[..read];
            if let Some(out) = passthrough.as_mut() {
                if let Err(err) = out.write_all(bytes).and_then(|_| out.flush()) {
                    debug!(%stream, "passthrough write failed, disabling it: {err}");
                    passthrough = None;
                }
            }
            store.append(stream, bytes);
        }
    })
}
