//! Connection management
//!
//! Owns the single physical session to a device and multiplexes it across
//! any number of logical subscribers. The physical port is opened when the
//! first subscriber attaches and torn down after the last one detaches; a
//! dedicated background worker reads bytes, feeds the framing parser, and
//! publishes every parsed frame to all subscribers in order. New
//! subscribers immediately receive the most recently published frame so
//! they can pick up the write-back handle without waiting for device
//! traffic.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use super::codec;
use super::commands::{self, ResponseLevel};
use super::framing::{FrameAccumulator, ParseMode};
use super::response::{ResponseCode, ResponseFrame};
use super::serial::open_port;
use super::transport::{Channel, SerialChannel};
use super::{ProtocolError, DEFAULT_BAUD_RATE, DEFAULT_TIMEOUT_MS};

/// Poll interval of the background read loop
const READ_POLL: Duration = Duration::from_millis(5);

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No physical session
    Disconnected,
    /// Physical session open, read loop running
    Connected,
}

/// Connection configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Serial port name
    pub port_name: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Default response timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

/// Handle for writing commands to a live connection.
///
/// All writes go through one mutex per physical port, so a batch write from
/// one caller can never interleave with another caller's single write.
#[derive(Clone)]
pub struct CommandSink {
    writer: Arc<Mutex<Box<dyn Channel>>>,
    upload_mode: Arc<AtomicBool>,
}

impl CommandSink {
    /// Sink writing to the given channel, initially in standard mode
    pub fn new(channel: Box<dyn Channel>) -> Self {
        Self {
            writer: Arc::new(Mutex::new(channel)),
            upload_mode: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Encode and send one command
    pub fn send(&self, command: &str) -> Result<(), ProtocolError> {
        trace!(command, "send");
        self.write(&codec::encode(command))
    }

    /// Encode and send one command with the broadcast prefix
    pub fn send_broadcast(&self, command: &str) -> Result<(), ProtocolError> {
        trace!(command, "send broadcast");
        self.write(&codec::encode_broadcast(command))
    }

    /// Encode and send a batch as one atomic write
    pub fn send_batch(&self, commands: &[&str]) -> Result<(), ProtocolError> {
        let bytes = codec::encode_batch(commands)?;
        trace!(commands = commands.len(), bytes = bytes.len(), "send batch");
        self.write(&bytes)
    }

    /// Send pre-encoded bytes as one atomic write (firmware blocks)
    pub fn send_raw(&self, bytes: &[u8]) -> Result<(), ProtocolError> {
        self.write(bytes)
    }

    fn write(&self, bytes: &[u8]) -> Result<(), ProtocolError> {
        let mut writer = match self.writer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        writer
            .write_all(bytes)
            .and_then(|_| writer.flush())
            .map_err(|e| ProtocolError::Transport(e.to_string()))
    }

    /// Ask the read loop to parse flow-control bytes instead of frames
    pub(crate) fn enter_upload_mode(&self) {
        self.upload_mode.store(true, Ordering::SeqCst);
    }

    pub(crate) fn clear_upload_mode(&self) {
        self.upload_mode.store(false, Ordering::SeqCst);
    }

    pub(crate) fn upload_mode_requested(&self) -> bool {
        self.upload_mode.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for CommandSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSink")
            .field("upload_mode", &self.upload_mode_requested())
            .finish()
    }
}

/// What a subscriber observes on the connection
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A parsed response frame, in arrival order
    Frame(ResponseFrame),
    /// Completion signal: the session is gone and no more frames will come
    Closed,
}

/// Factory for the physical channel; substituted by tests
pub type ChannelOpener =
    dyn Fn(&str, u32) -> Result<Box<dyn Channel>, ProtocolError> + Send + Sync;

struct SubscriberSlot {
    id: u64,
    tx: Sender<ConnectionEvent>,
}

struct Running {
    sink: CommandSink,
    shutdown: Arc<AtomicBool>,
}

struct Shared {
    running: Option<Running>,
    subscribers: Vec<SubscriberSlot>,
    last_frame: Option<ResponseFrame>,
    next_id: u64,
}

struct ManagerInner {
    config: ConnectionConfig,
    simulator: bool,
    opener: Box<ChannelOpener>,
    shared: Mutex<Shared>,
    teardown: Condvar,
}

fn lock_shared(inner: &ManagerInner) -> MutexGuard<'_, Shared> {
    match inner.shared.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Multiplexes one physical device session across N logical subscribers
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    /// Manager opening real serial ports
    pub fn new(config: ConnectionConfig, simulator: bool) -> Self {
        Self::with_opener(
            config,
            simulator,
            Box::new(|name, baud| {
                let port = open_port(name, baud)?;
                Ok(Box::new(SerialChannel::new(port)) as Box<dyn Channel>)
            }),
        )
    }

    /// Manager with a caller-supplied channel factory
    pub fn with_opener(
        config: ConnectionConfig,
        simulator: bool,
        opener: Box<ChannelOpener>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                simulator,
                opener,
                shared: Mutex::new(Shared {
                    running: None,
                    subscribers: Vec::new(),
                    last_frame: None,
                    next_id: 0,
                }),
                teardown: Condvar::new(),
            }),
        }
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        if lock_shared(&self.inner).running.is_some() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    /// Write-back handle of the live session, if any
    pub fn sink(&self) -> Option<CommandSink> {
        lock_shared(&self.inner)
            .running
            .as_ref()
            .map(|r| r.sink.clone())
    }

    /// Attach a logical subscriber, opening the physical session if this is
    /// the first one. Idempotent with respect to concurrent callers: exactly
    /// one physical open happens.
    pub fn subscribe(&self) -> Result<Subscription, ProtocolError> {
        let mut shared = lock_shared(&self.inner);
        if shared.running.is_none() {
            self.open_session(&mut shared)?;
        }

        let (tx, rx) = mpsc::channel();
        let id = shared.next_id;
        shared.next_id += 1;

        // Replay-of-one: hand the newcomer the current device snapshot
        if let Some(frame) = shared.last_frame.clone() {
            let _ = tx.send(ConnectionEvent::Frame(frame));
        }
        shared.subscribers.push(SubscriberSlot { id, tx });
        debug!(id, subscribers = shared.subscribers.len(), "subscriber attached");

        Ok(Subscription {
            id,
            rx,
            inner: Arc::clone(&self.inner),
        })
    }

    /// Cancel every subscriber and block until the physical session is torn
    /// down, or fail with [`ProtocolError::Timeout`].
    pub fn disconnect(&self, timeout: Duration) -> Result<(), ProtocolError> {
        {
            let shared = lock_shared(&self.inner);
            match &shared.running {
                None => return Ok(()),
                Some(running) => {
                    info!("forced disconnect requested");
                    running.shutdown.store(true, Ordering::SeqCst);
                }
            }
        }
        if self.wait_until_disconnected(timeout) {
            Ok(())
        } else {
            Err(ProtocolError::Timeout)
        }
    }

    /// Best-effort wait for teardown; returns whether the session is gone
    pub fn wait_until_disconnected(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut shared = lock_shared(&self.inner);
        while shared.running.is_some() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let wait = self.inner.teardown.wait_timeout(shared, deadline - now);
            shared = match wait {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }

    fn open_session(&self, shared: &mut Shared) -> Result<(), ProtocolError> {
        let inner = &self.inner;
        info!(
            port = %inner.config.port_name,
            baud = inner.config.baud_rate,
            "opening device session"
        );

        let mut channel = (inner.opener)(&inner.config.port_name, inner.config.baud_rate)?;
        let _ = channel.clear_input();
        let _ = channel.clear_output();

        let writer = channel
            .try_clone()
            .map_err(|e| ProtocolError::Transport(e.to_string()))?;
        let sink = CommandSink::new(writer);

        if !inner.simulator {
            initialize_device(&sink)?;
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        shared.running = Some(Running {
            sink: sink.clone(),
            shutdown: Arc::clone(&shutdown),
        });
        // Synthetic connection-established frame; its sink is how late
        // subscribers learn where to write
        shared.last_frame = Some(ResponseFrame::new(
            ResponseCode::Ready.byte(),
            Vec::new(),
            sink.clone(),
        ));

        let worker_inner = Arc::clone(inner);
        thread::Builder::new()
            .name(format!("nexlink-read-{}", inner.config.port_name))
            .spawn(move || read_loop(worker_inner, channel, sink, shutdown))
            .map_err(|e| ProtocolError::Transport(e.to_string()))?;

        Ok(())
    }
}

/// Device initialization issued on first attach (skipped for simulators):
/// leave two-byte addressing, disable both auto-sleep timers, enable
/// wake-on-touch, report errors only, exit sleep.
fn initialize_device(sink: &CommandSink) -> Result<(), ProtocolError> {
    sink.send_raw(&codec::encode_broadcast(&commands::set_address(0)?))?;
    let thsp = commands::touch_sleep_timer(0);
    let ussp = commands::serial_sleep_timer(0);
    let thup = commands::wake_on_touch(true);
    let bkcmd = commands::response_level(ResponseLevel::OnFailure);
    let sleep = commands::sleep(false);
    sink.send_batch(&[
        thsp.as_str(),
        ussp.as_str(),
        thup.as_str(),
        bkcmd.as_str(),
        sleep.as_str(),
    ])
}

fn read_loop(
    inner: Arc<ManagerInner>,
    mut channel: Box<dyn Channel>,
    sink: CommandSink,
    shutdown: Arc<AtomicBool>,
) {
    let mut acc = FrameAccumulator::new();
    let mut buf = [0u8; 512];
    let mut outcome: Result<(), ProtocolError> = Ok(());

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        let available = match channel.bytes_to_read() {
            Ok(n) => n as usize,
            Err(e) => {
                outcome = Err(ProtocolError::Transport(e.to_string()));
                break;
            }
        };
        if available == 0 {
            thread::sleep(READ_POLL);
            continue;
        }

        let to_read = available.min(buf.len());
        match channel.read(&mut buf[..to_read]) {
            Ok(0) => thread::sleep(READ_POLL),
            Ok(n) => {
                trace!(bytes = n, "device data");
                // Sync the parser with upload-mode requests from session
                // scripts. Done here, after the read, so a flow-control
                // byte arriving in the same chunk as the mode switch is
                // parsed in the mode the script asked for.
                let want_upload = sink.upload_mode_requested();
                match (want_upload, acc.mode()) {
                    (true, ParseMode::Standard) => acc.enter_upload_mode(),
                    (false, ParseMode::FirmwareUpload) => acc.exit_upload_mode(),
                    _ => {}
                }
                let frames = acc.push(&buf[..n]);
                if want_upload && acc.mode() == ParseMode::Standard {
                    // The device sent a non-flow-control byte: it left
                    // upload mode on its own
                    sink.clear_upload_mode();
                }
                for raw in frames {
                    let frame = ResponseFrame::new(raw.code, raw.payload, sink.clone());
                    publish(&inner, frame);
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::TimedOut
                        | std::io::ErrorKind::WouldBlock
                        | std::io::ErrorKind::Interrupted
                ) => {}
            Err(e) => {
                outcome = Err(ProtocolError::Transport(e.to_string()));
                break;
            }
        }
    }

    if let Err(e) = &outcome {
        warn!(error = %e, "read loop terminated by transport error");
    }
    finish(&inner, channel);
}

fn publish(inner: &ManagerInner, frame: ResponseFrame) {
    let mut shared = lock_shared(inner);
    shared.last_frame = Some(frame.clone());
    shared
        .subscribers
        .retain(|slot| slot.tx.send(ConnectionEvent::Frame(frame.clone())).is_ok());
}

/// Completion signal to every subscriber, then teardown. Reached both from
/// forced disconnect and from transport errors; idempotent either way.
fn finish(inner: &ManagerInner, channel: Box<dyn Channel>) {
    let mut shared = lock_shared(inner);
    for slot in shared.subscribers.drain(..) {
        let _ = slot.tx.send(ConnectionEvent::Closed);
    }
    shared.running = None;
    shared.last_frame = None;
    drop(shared);
    inner.teardown.notify_all();
    drop(channel);
    info!("device session closed");
}

/// A live logical handle onto the shared physical connection
pub struct Subscription {
    id: u64,
    rx: Receiver<ConnectionEvent>,
    inner: Arc<ManagerInner>,
}

impl Subscription {
    /// Block for the next event; `None` once the session is fully gone
    pub fn recv(&self) -> Option<ConnectionEvent> {
        self.rx.recv().ok()
    }

    /// Next event within `timeout`
    pub fn recv_timeout(&self, timeout: Duration) -> Result<ConnectionEvent, ProtocolError> {
        self.rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => ProtocolError::Timeout,
            RecvTimeoutError::Disconnected => ProtocolError::NotConnected,
        })
    }

    /// Next already-queued event, if any
    pub fn try_recv(&self) -> Option<ConnectionEvent> {
        self.rx.try_recv().ok()
    }

    /// Write-back handle of the live session, if it is still up
    pub fn sink(&self) -> Option<CommandSink> {
        lock_shared(&self.inner)
            .running
            .as_ref()
            .map(|r| r.sink.clone())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut shared = lock_shared(&self.inner);
        shared.subscribers.retain(|slot| slot.id != self.id);
        if shared.subscribers.is_empty() {
            if let Some(running) = &shared.running {
                debug!("last subscriber detached, closing session");
                running.shutdown.store(true, Ordering::SeqCst);
            }
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::transport::LoopbackChannel;

    #[test]
    fn test_connection_config_default() {
        let config = ConnectionConfig::default();
        assert_eq!(config.baud_rate, DEFAULT_BAUD_RATE);
        assert_eq!(config.timeout_ms, DEFAULT_TIMEOUT_MS);
    }

    #[test]
    fn test_manager_starts_disconnected() {
        let manager = ConnectionManager::new(ConnectionConfig::default(), false);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.sink().is_none());
    }

    #[test]
    fn test_sink_writes_are_terminated() {
        let chan = LoopbackChannel::new();
        let sink = CommandSink::new(Box::new(chan.clone()));
        sink.send("page 0").unwrap();
        assert_eq!(chan.written(), b"page 0\xFF\xFF\xFF");
    }

    #[test]
    fn test_sink_batch_is_one_write() {
        let chan = LoopbackChannel::new();
        let sink = CommandSink::new(Box::new(chan.clone()));
        sink.send_batch(&["page 1", "dim=50"]).unwrap();
        assert_eq!(chan.write_calls().len(), 1);
    }

    #[test]
    fn test_disconnect_when_idle_is_ok() {
        let manager = ConnectionManager::new(ConnectionConfig::default(), false);
        assert!(manager.disconnect(Duration::from_millis(10)).is_ok());
        assert!(manager.wait_until_disconnected(Duration::from_millis(1)));
    }
}
