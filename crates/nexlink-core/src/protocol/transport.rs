//! Transport abstraction
//!
//! Wraps the physical byte stream behind a small trait so the connection
//! layer, discovery, and the tests can all run against the same interface.

use serialport::SerialPort;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Abstraction over a byte-serial link to a device
pub trait Channel: Read + Write + Send {
    /// Set timeout for read operations
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()>;

    /// Discard any buffered input
    fn clear_input(&mut self) -> io::Result<()>;

    /// Discard any buffered output
    fn clear_output(&mut self) -> io::Result<()>;

    /// Clone the channel; clones share the underlying link
    fn try_clone(&self) -> io::Result<Box<dyn Channel>>;

    /// Number of bytes available to read without blocking
    fn bytes_to_read(&mut self) -> io::Result<u32>;
}

/// Serial port wrapper implementing [`Channel`]
pub struct SerialChannel {
    port: Box<dyn SerialPort>,
}

impl SerialChannel {
    /// Wrap an already-opened serial port
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self { port }
    }
}

impl Read for SerialChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for SerialChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl Channel for SerialChannel {
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.port
            .set_timeout(timeout)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    fn clear_output(&mut self) -> io::Result<()> {
        self.port
            .clear(serialport::ClearBuffer::Output)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    fn try_clone(&self) -> io::Result<Box<dyn Channel>> {
        let port_clone = self
            .port
            .try_clone()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(Box::new(SerialChannel::new(port_clone)))
    }

    fn bytes_to_read(&mut self) -> io::Result<u32> {
        self.port
            .bytes_to_read()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }
}

/// Write observer installed on a [`LoopbackChannel`]; whatever it returns is
/// queued as the device's reply to that write.
pub type WriteObserver = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;

struct LoopbackInner {
    rx: VecDeque<u8>,
    tx: Vec<u8>,
    writes: Vec<Vec<u8>>,
    closed: bool,
    on_write: Option<WriteObserver>,
}

/// In-memory [`Channel`] standing in for a device.
///
/// The test (or simulator) side feeds bytes the "device" sends and inspects
/// bytes the client wrote. Clones share state, mirroring a cloned port
/// handle.
#[derive(Clone)]
pub struct LoopbackChannel {
    inner: Arc<Mutex<LoopbackInner>>,
}

impl LoopbackChannel {
    fn lock(&self) -> std::sync::MutexGuard<'_, LoopbackInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Fresh channel with empty buffers and no observer
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(LoopbackInner {
                rx: VecDeque::new(),
                tx: Vec::new(),
                writes: Vec::new(),
                closed: false,
                on_write: None,
            })),
        }
    }

    /// Queue bytes as if the device had sent them
    pub fn feed(&self, bytes: &[u8]) {
        let mut inner = self.lock();
        inner.rx.extend(bytes.iter().copied());
    }

    /// Everything the client has written so far, flattened
    pub fn written(&self) -> Vec<u8> {
        self.lock().tx.clone()
    }

    /// Individual write calls in order, one entry per atomic write
    pub fn write_calls(&self) -> Vec<Vec<u8>> {
        self.lock().writes.clone()
    }

    /// Install a hook run on every write; its return value is fed back as
    /// the device reply
    pub fn on_write(&self, observer: WriteObserver) {
        self.lock().on_write = Some(observer);
    }

    /// Simulate the link going away; further I/O fails
    pub fn close(&self) {
        self.lock().closed = true;
    }
}

impl Default for LoopbackChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl Read for LoopbackChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "channel closed"));
        }
        if inner.rx.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        let n = buf.len().min(inner.rx.len());
        for slot in buf.iter_mut().take(n) {
            *slot = inner.rx.pop_front().unwrap_or(0);
        }
        Ok(n)
    }
}

impl Write for LoopbackChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "channel closed"));
        }
        inner.tx.extend_from_slice(buf);
        inner.writes.push(buf.to_vec());
        if let Some(observer) = inner.on_write.as_mut() {
            let reply = observer(buf);
            inner.rx.extend(reply);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Channel for LoopbackChannel {
    fn set_timeout(&mut self, _timeout: Duration) -> io::Result<()> {
        Ok(())
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.lock().rx.clear();
        Ok(())
    }

    fn clear_output(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn try_clone(&self) -> io::Result<Box<dyn Channel>> {
        Ok(Box::new(self.clone()))
    }

    fn bytes_to_read(&mut self) -> io::Result<u32> {
        let inner = self.lock();
        if inner.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "channel closed"));
        }
        Ok(inner.rx.len() as u32)
    }
}
