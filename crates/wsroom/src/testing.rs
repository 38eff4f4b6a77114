//! In-memory duplex stream for unit tests.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::connection::Transport;

#[derive(Default)]
struct Pipe {
    buf: VecDeque<u8>,
    closed: bool,
}

#[derive(Default)]
struct Channel {
    pipe: Mutex<Pipe>,
    ready: Condvar,
}

impl Channel {
    fn close(&self) {
        self.pipe.lock().closed = true;
        self.ready.notify_all();
    }
}

/// One end of an in-memory byte pipe pair. Clones share the same end.
#[derive(Clone)]
pub(crate) struct MemoryStream {
    incoming: Arc<Channel>,
    outgoing: Arc<Channel>,
    read_timeout: Arc<Mutex<Option<Duration>>>,
}

impl MemoryStream {
    pub(crate) fn pair() -> (MemoryStream, MemoryStream) {
        let a_to_b = Arc::new(Channel::default());
        let b_to_a = Arc::new(Channel::default());
        let a = MemoryStream {
            incoming: Arc::clone(&b_to_a),
            outgoing: Arc::clone(&a_to_b),
            read_timeout: Arc::new(Mutex::new(None)),
        };
        let b = MemoryStream {
            incoming: a_to_b,
            outgoing: b_to_a,
            read_timeout: Arc::new(Mutex::new(None)),
        };
        (a, b)
    }
}

impl Read for MemoryStream {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let deadline = self.read_timeout.lock().map(|t| Instant::now() + t);
        let mut pipe = self.incoming.pipe.lock();
        while pipe.buf.is_empty() && !pipe.closed {
            match deadline {
                Some(deadline) => {
                    if self.incoming.ready.wait_until(&mut pipe, deadline).timed_out()
                        && pipe.buf.is_empty()
                        && !pipe.closed
                    {
                        return Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out"));
                    }
                }
                None => self.incoming.ready.wait(&mut pipe),
            }
        }
        let n = out.len().min(pipe.buf.len());
        for (slot, byte) in out.iter_mut().zip(pipe.buf.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for MemoryStream {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut pipe = self.outgoing.pipe.lock();
        if pipe.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"));
        }
        pipe.buf.extend(data);
        self.outgoing.ready.notify_all();
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for MemoryStream {
    fn try_clone(&self) -> io::Result<Self> {
        Ok(self.clone())
    }

    fn shutdown(&self) -> io::Result<()> {
        self.incoming.close();
        self.outgoing.close();
        Ok(())
    }

    fn set_read_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        *self.read_timeout.lock() = dur;
        Ok(())
    }

    fn set_write_timeout(&self, _dur: Option<Duration>) -> io::Result<()> {
        Ok(())
    }
}
