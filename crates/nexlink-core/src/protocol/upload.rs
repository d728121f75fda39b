//! Firmware upload
//!
//! Streams a TFT firmware image over an open connection. The exchange is a
//! fixed script: quiesce the device, announce the image with `whmi-wri`,
//! then write one block per flow-control ack until the image is exhausted,
//! and wait for the post-flash reboot. Any framed response arriving in the
//! middle means the device aborted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

use super::commands;
use super::connection::Subscription;
use super::session::{Session, SessionState, Transition};
use super::{ProtocolError, FLOW_CONTROL_BYTE, UPLOAD_BLOCK_SIZE};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn abort(slot: &Mutex<Option<ProtocolError>>, error: ProtocolError) -> Transition {
    *lock(slot) = Some(error);
    Transition::End
}

/// Stream `image` to the device behind `subscription`.
///
/// `baud` is advertised in the announce command and must match the rate the
/// connection already runs at. Blocks until the upload completes, the
/// device aborts, or `timeout` elapses.
pub fn upload_firmware(
    subscription: &Subscription,
    baud: u32,
    image: &[u8],
    timeout: Duration,
) -> Result<(), ProtocolError> {
    if image.is_empty() {
        return Err(ProtocolError::Usage(
            "firmware image is empty".to_string(),
        ));
    }
    let sink = subscription.sink().ok_or(ProtocolError::NotConnected)?;

    info!(bytes = image.len(), baud, "firmware upload starting");

    let image: Arc<Vec<u8>> = Arc::new(image.to_vec());
    let cursor = Arc::new(Mutex::new(0usize));
    let failure: Arc<Mutex<Option<ProtocolError>>> = Arc::new(Mutex::new(None));
    let done = Arc::new(AtomicBool::new(false));

    let mut session = Session::new();

    // Quiesce and announce. Runs on the first frame the subscription
    // delivers, which at minimum is the replayed connection snapshot.
    {
        let sink = sink.clone();
        let failure = Arc::clone(&failure);
        let length = image.len();
        session.add_state(SessionState::named("start").on_any(move |_| {
            let quiesce = [
                commands::sleep(false),
                commands::touch_sleep_timer(0),
                commands::serial_sleep_timer(0),
            ];
            let quiesce: Vec<&str> = quiesce.iter().map(String::as_str).collect();
            if let Err(e) = sink.send_batch(&quiesce) {
                return abort(&failure, e);
            }
            // From here the device answers with bare flow-control bytes
            sink.enter_upload_mode();
            match sink.send(&format!("whmi-wri {length},{baud},a")) {
                Ok(()) => Transition::goto("await-ready"),
                Err(e) => abort(&failure, e),
            }
        }));
    }

    // One block per ack
    {
        let sink = sink.clone();
        let image = Arc::clone(&image);
        let cursor = Arc::clone(&cursor);
        let failure = Arc::clone(&failure);
        let failure_other = Arc::clone(&failure);
        session.add_state(
            SessionState::named("await-ready")
                .on(FLOW_CONTROL_BYTE, move |_| {
                    let mut cursor = lock(&cursor);
                    let start = *cursor;
                    let end = (start + UPLOAD_BLOCK_SIZE).min(image.len());
                    debug!(start, end, total = image.len(), "writing firmware block");
                    match sink.send_raw(&image[start..end]) {
                        Ok(()) => {
                            *cursor = end;
                            if end == image.len() {
                                Transition::goto("await-last")
                            } else {
                                Transition::Stay
                            }
                        }
                        Err(e) => abort(&failure, e),
                    }
                })
                .on_any(move |frame| {
                    abort(
                        &failure_other,
                        ProtocolError::Protocol(format!(
                            "device aborted upload with code 0x{}",
                            frame.code_hex()
                        )),
                    )
                }),
        );
    }

    // Ack of the final block
    {
        let failure = Arc::clone(&failure);
        session.add_state(
            SessionState::named("await-last")
                .on(FLOW_CONTROL_BYTE, |_| Transition::goto("await-power-on"))
                .on_any(move |frame| {
                    abort(
                        &failure,
                        ProtocolError::Protocol(format!(
                            "device aborted upload with code 0x{}",
                            frame.code_hex()
                        )),
                    )
                }),
        );
    }

    // The device flashes and reboots; its first framed byte ends the script
    {
        let done = Arc::clone(&done);
        session.add_state(SessionState::named("await-power-on").on_any(move |_| {
            done.store(true, Ordering::SeqCst);
            Transition::End
        }));
    }

    let result = session.run(subscription, timeout);
    sink.clear_upload_mode();
    result?;

    if let Some(error) = lock(&failure).take() {
        return Err(error);
    }
    if !done.load(Ordering::SeqCst) {
        return Err(ProtocolError::Protocol(
            "connection closed before upload completed".to_string(),
        ));
    }
    info!("firmware upload complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::connection::{ConnectionConfig, ConnectionManager};
    use crate::protocol::transport::{Channel, LoopbackChannel};
    use pretty_assertions::assert_eq;

    fn loopback_manager() -> (ConnectionManager, LoopbackChannel) {
        let chan = LoopbackChannel::new();
        let opener_chan = chan.clone();
        let manager = ConnectionManager::with_opener(
            ConnectionConfig {
                port_name: "loop0".to_string(),
                ..Default::default()
            },
            true,
            Box::new(move |_, _| Ok(Box::new(opener_chan.clone()) as Box<dyn Channel>)),
        );
        (manager, chan)
    }

    fn is_command(bytes: &[u8]) -> bool {
        bytes.starts_with(b"com_stop") || bytes.windows(8).any(|w| w == b"whmi-wri")
    }

    #[test]
    fn test_empty_image_is_usage_error() {
        let (manager, _chan) = loopback_manager();
        let sub = manager.subscribe().unwrap();
        assert!(matches!(
            upload_firmware(&sub, 115_200, &[], Duration::from_millis(100)),
            Err(ProtocolError::Usage(_))
        ));
    }

    #[test]
    fn test_full_upload_block_sizes_and_completion() {
        let (manager, chan) = loopback_manager();

        let image: Vec<u8> = (0..4196u32).map(|i| i as u8).collect();
        let total = image.len();
        let sizes = Arc::new(Mutex::new(Vec::new()));
        let observed = Arc::clone(&sizes);
        let mut received = 0usize;
        chan.on_write(Box::new(move |bytes| {
            if bytes.starts_with(b"com_stop") {
                return Vec::new();
            }
            if bytes.windows(8).any(|w| w == b"whmi-wri") {
                return vec![FLOW_CONTROL_BYTE];
            }
            observed.lock().unwrap().push(bytes.len());
            received += bytes.len();
            if received == total {
                // Final ack followed by the post-reboot ready frame
                vec![FLOW_CONTROL_BYTE, 0x88, 0xFF, 0xFF, 0xFF]
            } else {
                vec![FLOW_CONTROL_BYTE]
            }
        }));

        let sub = manager.subscribe().unwrap();
        upload_firmware(&sub, 115_200, &image, Duration::from_secs(5)).unwrap();
        assert_eq!(sizes.lock().unwrap().clone(), vec![4096, 100]);
    }

    #[test]
    fn test_exact_block_multiple_image() {
        let (manager, chan) = loopback_manager();

        let image = vec![0xAAu8; UPLOAD_BLOCK_SIZE * 2];
        let total = image.len();
        let sizes = Arc::new(Mutex::new(Vec::new()));
        let observed = Arc::clone(&sizes);
        let mut received = 0usize;
        chan.on_write(Box::new(move |bytes| {
            if is_command(bytes) {
                return if bytes.starts_with(b"com_stop") {
                    Vec::new()
                } else {
                    vec![FLOW_CONTROL_BYTE]
                };
            }
            observed.lock().unwrap().push(bytes.len());
            received += bytes.len();
            if received == total {
                vec![FLOW_CONTROL_BYTE, 0x88, 0xFF, 0xFF, 0xFF]
            } else {
                vec![FLOW_CONTROL_BYTE]
            }
        }));

        let sub = manager.subscribe().unwrap();
        upload_firmware(&sub, 921_600, &image, Duration::from_secs(5)).unwrap();
        assert_eq!(sizes.lock().unwrap().clone(), vec![4096, 4096]);
    }

    #[test]
    fn test_device_abort_surfaces_protocol_error() {
        let (manager, chan) = loopback_manager();

        chan.on_write(Box::new(move |bytes| {
            if bytes.starts_with(b"com_stop") {
                return Vec::new();
            }
            if bytes.windows(8).any(|w| w == b"whmi-wri") {
                // Refuse the upload
                return vec![0x1A];
            }
            Vec::new()
        }));

        let sub = manager.subscribe().unwrap();
        let image = vec![0u8; 100];
        match upload_firmware(&sub, 115_200, &image, Duration::from_secs(5)) {
            Err(ProtocolError::Protocol(msg)) => assert!(msg.contains("0x1A"), "{msg}"),
            other => panic!("expected protocol error, got {:?}", other.err()),
        }
    }
}
