//! Device discovery
//!
//! Walks candidate ports and baud rates looking for exactly one responding
//! device. Probing is deliberately sequential: opening many serial ports at
//! once invites driver contention and false handshakes. Only one discovery
//! run may be active process-wide; a concurrent call is rejected with
//! [`ProtocolError::Busy`] rather than queued.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

use super::codec::{encode, encode_broadcast};
use super::device::DiscoveryResult;
use super::serial::{list_ports, open_port};
use super::transport::{Channel, SerialChannel};
use super::{
    ProtocolError, DECOY_COMMAND, DEFAULT_BAUD_RATES, HANDSHAKE_MARKER, SIMULATOR_HANDSHAKE,
    SIMULATOR_HANDSHAKE_BYTE,
};

/// Floor of the per-attempt response window
const MIN_ATTEMPT_WINDOW_MS: u64 = 300;

/// Generous size of a handshake reply in wire bits, for deriving the
/// response window at slow baud rates (128 bytes at 10 bits each)
const PROBE_REPLY_BITS: u64 = 1280;

/// Poll interval while waiting for probe replies
const PROBE_POLL: Duration = Duration::from_millis(5);

static DISCOVERY_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Channel factory used by a discovery run
pub type ProbeOpener<'a> =
    dyn FnMut(&str, u32) -> Result<Box<dyn Channel>, ProtocolError> + 'a;

/// Discovery configuration
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// Candidate port names; `None` means every port visible to the host
    pub ports: Option<Vec<String>>,
    /// Port names never probed
    pub exclude: Vec<String>,
    /// Baud rates per port, tried in order
    pub baud_rates: Vec<u32>,
    /// Override of the per-attempt response window
    pub attempt_timeout: Option<Duration>,
    /// Backoff before the single per-pair retry
    pub retry_backoff: Duration,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            ports: None,
            exclude: Vec::new(),
            baud_rates: DEFAULT_BAUD_RATES.to_vec(),
            attempt_timeout: None,
            retry_backoff: Duration::from_secs(1),
        }
    }
}

struct ScanGuard;

impl ScanGuard {
    fn acquire() -> Result<Self, ProtocolError> {
        if DISCOVERY_ACTIVE
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ProtocolError::Busy);
        }
        Ok(ScanGuard)
    }
}

impl Drop for ScanGuard {
    fn drop(&mut self) {
        DISCOVERY_ACTIVE.store(false, Ordering::SeqCst);
    }
}

/// Scan the host's serial ports for a device.
///
/// Returns `Ok(None)` when every candidate was exhausted without a
/// handshake; that is a normal outcome, not an error.
pub fn find(options: &DiscoveryOptions) -> Result<Option<DiscoveryResult>, ProtocolError> {
    let candidates: Vec<String> = match &options.ports {
        Some(ports) => ports.clone(),
        None => list_ports().into_iter().map(|p| p.name).collect(),
    };
    let mut opener = |name: &str, baud: u32| {
        let port = open_port(name, baud)?;
        Ok(Box::new(SerialChannel::new(port)) as Box<dyn Channel>)
    };
    find_with_opener(options, &mut opener, &candidates)
}

/// Scan with a caller-supplied channel factory and candidate list
pub fn find_with_opener(
    options: &DiscoveryOptions,
    opener: &mut ProbeOpener<'_>,
    candidates: &[String],
) -> Result<Option<DiscoveryResult>, ProtocolError> {
    let _guard = ScanGuard::acquire()?;

    let mut ports: Vec<&String> = candidates
        .iter()
        .filter(|name| !options.exclude.contains(name))
        .collect();
    ports.sort();

    info!(ports = ports.len(), bauds = options.baud_rates.len(), "discovery started");

    for port in ports {
        for &baud in &options.baud_rates {
            let window = options
                .attempt_timeout
                .unwrap_or_else(|| attempt_window(baud));

            // Retry once after any failure; transient open errors and noisy
            // lines settle within the backoff.
            for attempt in 0..2 {
                match probe(opener, port, baud, window) {
                    Ok(Some(handshake)) => {
                        info!(port = %port, baud, "device found");
                        return Ok(Some(DiscoveryResult {
                            port_name: port.clone(),
                            baud_rate: baud,
                            handshake,
                        }));
                    }
                    Ok(None) => {
                        trace!(port = %port, baud, attempt, "no handshake");
                    }
                    Err(e) => {
                        debug!(port = %port, baud, attempt, error = %e, "probe failed");
                    }
                }
                if attempt == 0 {
                    thread::sleep(options.retry_backoff);
                }
            }
        }
    }

    info!("discovery exhausted all candidates");
    Ok(None)
}

/// Response window: at least [`MIN_ATTEMPT_WINDOW_MS`], stretched at slow
/// baud rates so the reply has time to arrive on the wire
fn attempt_window(baud: u32) -> Duration {
    let wire_ms = PROBE_REPLY_BITS * 1000 / u64::from(baud.max(1));
    Duration::from_millis(wire_ms.max(MIN_ATTEMPT_WINDOW_MS))
}

/// One open/probe/wait attempt against a (port, baud) pair.
///
/// `Ok(Some(handshake))` on success, `Ok(None)` on a silent timeout, `Err`
/// on transport failure. The channel is always disposed off this path since
/// some driver stacks block on close.
fn probe(
    opener: &mut ProbeOpener<'_>,
    port: &str,
    baud: u32,
    window: Duration,
) -> Result<Option<String>, ProtocolError> {
    let mut channel = opener(port, baud)?;
    let outcome = probe_open_channel(channel.as_mut(), window);
    dispose(channel);
    outcome
}

fn probe_open_channel(
    channel: &mut dyn Channel,
    window: Duration,
) -> Result<Option<String>, ProtocolError> {
    let _ = channel.clear_input();
    let _ = channel.clear_output();

    // Three probes back-to-back in one write: a benign wake-up, connect,
    // and broadcast connect for devices stuck in two-byte addressing mode
    let mut probes = encode(DECOY_COMMAND);
    probes.extend_from_slice(&encode("connect"));
    probes.extend_from_slice(&encode_broadcast("connect"));
    channel
        .write_all(&probes)
        .and_then(|_| channel.flush())
        .map_err(|e| ProtocolError::Transport(e.to_string()))?;

    let deadline = Instant::now() + window;
    let mut reply: Vec<u8> = Vec::new();
    let mut buf = [0u8; 256];

    while Instant::now() < deadline {
        let available = channel
            .bytes_to_read()
            .map_err(|e| ProtocolError::Transport(e.to_string()))? as usize;
        if available == 0 {
            thread::sleep(PROBE_POLL);
            continue;
        }
        let to_read = available.min(buf.len());
        match channel.read(&mut buf[..to_read]) {
            Ok(n) => reply.extend_from_slice(&buf[..n]),
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
                ) => {}
            Err(e) => return Err(ProtocolError::Transport(e.to_string())),
        }

        if let Some(handshake) = extract_handshake(&reply, true) {
            return Ok(Some(handshake));
        }
    }

    Ok(extract_handshake(&reply, false))
}

/// Pull the handshake string out of a probe reply.
///
/// While the window is still open (`need_complete`), the `comok` reply is
/// only accepted once its terminator started, so a reply split across reads
/// is not truncated. A lone simulator byte is mapped to the canonical
/// simulator handshake.
fn extract_handshake(reply: &[u8], need_complete: bool) -> Option<String> {
    let marker = HANDSHAKE_MARKER.as_bytes();
    if let Some(start) = reply
        .windows(marker.len())
        .position(|window| window == marker)
    {
        let tail = &reply[start..];
        match tail.iter().position(|&b| b == 0xFF) {
            Some(end) => {
                return Some(String::from_utf8_lossy(&tail[..end]).into_owned());
            }
            None if !need_complete => {
                return Some(String::from_utf8_lossy(tail).into_owned());
            }
            None => return None,
        }
    }

    if reply.contains(&SIMULATOR_HANDSHAKE_BYTE) {
        return Some(SIMULATOR_HANDSHAKE.to_string());
    }
    None
}

/// Drop the channel on a detached thread; close can block in some serial
/// driver stacks and discovery must not hang on cleanup.
fn dispose(channel: Box<dyn Channel>) {
    let _ = thread::Builder::new()
        .name("nexlink-dispose".to_string())
        .spawn(move || drop(channel));
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_attempt_window_floor() {
        assert_eq!(attempt_window(115_200), Duration::from_millis(300));
        assert_eq!(attempt_window(921_600), Duration::from_millis(300));
    }

    #[test]
    fn test_attempt_window_slow_baud() {
        // 1280 bits at 2400 baud take longer than the floor
        assert_eq!(attempt_window(2400), Duration::from_millis(533));
    }

    #[test]
    fn test_extract_handshake_complete() {
        let mut reply = b"garbage".to_vec();
        reply.extend_from_slice(b"comok 1,0,model,0,mcu,serial,1024");
        reply.extend_from_slice(&[0xFF, 0xFF, 0xFF]);
        assert_eq!(
            extract_handshake(&reply, true).as_deref(),
            Some("comok 1,0,model,0,mcu,serial,1024")
        );
    }

    #[test]
    fn test_extract_handshake_waits_for_terminator() {
        let reply = b"comok 1,0,model".to_vec();
        assert_eq!(extract_handshake(&reply, true), None);
        assert_eq!(
            extract_handshake(&reply, false).as_deref(),
            Some("comok 1,0,model")
        );
    }

    #[test]
    fn test_extract_simulator_byte() {
        assert_eq!(
            extract_handshake(&[SIMULATOR_HANDSHAKE_BYTE], true).as_deref(),
            Some(SIMULATOR_HANDSHAKE)
        );
    }

    #[test]
    fn test_default_options() {
        let options = DiscoveryOptions::default();
        assert_eq!(options.baud_rates, DEFAULT_BAUD_RATES.to_vec());
        assert_eq!(options.retry_backoff, Duration::from_secs(1));
        assert!(options.ports.is_none());
    }
}
