use crate::state::{log_ring::LogStream, StateStore};
use std::io;
use tracing_subscriber::fmt::MakeWriter;

/// Routes formatted supervisor log lines into the log record under the `internal` stream.
///
/// Events must never be emitted while the store lock is held, the writer takes that same lock.
#[derive(Clone)]
pub struct StoreWriter {
    store: StateStore,
}

impl StoreWriter {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }
}

impl io::Write for StoreWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.store.append(LogStream::Internal, buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for StoreWriter {
    type Writer = StoreWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
