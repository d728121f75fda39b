//! Connection manager behavior over in-memory channels: session lifecycle,
//! frame fan-out, and teardown convergence.

use nexlink_core::protocol::{
    encode_batch, encode_broadcast, Channel, ConnectionConfig, ConnectionEvent, ConnectionManager,
    ConnectionState, LoopbackChannel, ResponseCode, Subscription,
};
use pretty_assertions::assert_eq;
use std::time::Duration;

fn loopback_manager(simulator: bool) -> (ConnectionManager, LoopbackChannel) {
    let chan = LoopbackChannel::new();
    let opener_chan = chan.clone();
    let manager = ConnectionManager::with_opener(
        ConnectionConfig {
            port_name: "loop0".to_string(),
            ..Default::default()
        },
        simulator,
        Box::new(move |_, _| Ok(Box::new(opener_chan.clone()) as Box<dyn Channel>)),
    );
    (manager, chan)
}

fn next_frame_code(sub: &Subscription) -> u8 {
    match sub.recv_timeout(Duration::from_secs(2)).unwrap() {
        ConnectionEvent::Frame(frame) => frame.code(),
        ConnectionEvent::Closed => panic!("unexpected teardown"),
    }
}

#[test]
fn test_first_subscriber_gets_connection_snapshot() {
    let (manager, chan) = loopback_manager(true);
    assert_eq!(manager.state(), ConnectionState::Disconnected);

    let sub = manager.subscribe().unwrap();
    assert_eq!(manager.state(), ConnectionState::Connected);

    let frame = match sub.recv_timeout(Duration::from_secs(1)).unwrap() {
        ConnectionEvent::Frame(frame) => frame,
        ConnectionEvent::Closed => panic!("unexpected teardown"),
    };
    assert_eq!(frame.response_code(), Some(ResponseCode::Ready));
    assert!(frame.payload().is_empty());

    // The snapshot's sink writes to the live port
    frame.sink().send("page 0").unwrap();
    assert_eq!(chan.written(), b"page 0\xFF\xFF\xFF");
}

#[test]
fn test_initialization_burst_on_first_attach() {
    let (manager, chan) = loopback_manager(false);
    let _sub = manager.subscribe().unwrap();

    // Leave two-byte addressing, then the quiesce batch as one atomic write
    let mut expected = encode_broadcast("addr=0");
    expected.extend_from_slice(
        &encode_batch(&["thsp=0", "ussp=0", "thup=1", "bkcmd=2", "sleep=0"]).unwrap(),
    );
    assert_eq!(chan.written(), expected);
    assert_eq!(chan.write_calls().len(), 2);
}

#[test]
fn test_frames_fan_out_in_order() {
    let (manager, chan) = loopback_manager(true);
    let sub1 = manager.subscribe().unwrap();
    let sub2 = manager.subscribe().unwrap();

    // Both start from the snapshot
    assert_eq!(next_frame_code(&sub1), 0x88);
    assert_eq!(next_frame_code(&sub2), 0x88);

    chan.feed(&[0x66, 0x01, 0xFF, 0xFF, 0xFF]);
    chan.feed(&[0x65, 0x01, 0x02, 0x01, 0xFF, 0xFF, 0xFF]);
    chan.feed(&[0x70, b'o', b'k', 0xFF, 0xFF, 0xFF]);

    for sub in [&sub1, &sub2] {
        assert_eq!(next_frame_code(sub), 0x66);
        assert_eq!(next_frame_code(sub), 0x65);
        assert_eq!(next_frame_code(sub), 0x70);
    }
}

#[test]
fn test_late_subscriber_replays_latest_frame() {
    let (manager, chan) = loopback_manager(true);
    let sub1 = manager.subscribe().unwrap();
    assert_eq!(next_frame_code(&sub1), 0x88);

    chan.feed(&[0x66, 0x05, 0xFF, 0xFF, 0xFF]);
    assert_eq!(next_frame_code(&sub1), 0x66);

    // The newcomer sees the page frame, not the stale snapshot
    let sub2 = manager.subscribe().unwrap();
    let frame = match sub2.recv_timeout(Duration::from_secs(1)).unwrap() {
        ConnectionEvent::Frame(frame) => frame,
        ConnectionEvent::Closed => panic!("unexpected teardown"),
    };
    assert_eq!(frame.code(), 0x66);
    assert_eq!(frame.page().unwrap(), 5);
}

#[test]
fn test_forced_disconnect_converges_all_subscribers() {
    let (manager, _chan) = loopback_manager(true);
    let subs: Vec<_> = (0..3).map(|_| manager.subscribe().unwrap()).collect();

    manager.disconnect(Duration::from_secs(2)).unwrap();
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(manager.wait_until_disconnected(Duration::from_millis(10)));

    // Every subscriber's stream ends with the completion signal
    for sub in &subs {
        loop {
            match sub.recv_timeout(Duration::from_secs(1)).unwrap() {
                ConnectionEvent::Frame(_) => continue,
                ConnectionEvent::Closed => break,
            }
        }
        assert!(sub.sink().is_none());
    }
}

#[test]
fn test_last_subscriber_drop_closes_session() {
    let (manager, _chan) = loopback_manager(true);
    let sub = manager.subscribe().unwrap();
    assert_eq!(manager.state(), ConnectionState::Connected);

    drop(sub);
    assert!(manager.wait_until_disconnected(Duration::from_secs(2)));
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[test]
fn test_reconnect_after_teardown() {
    let (manager, _chan) = loopback_manager(true);

    let sub = manager.subscribe().unwrap();
    drop(sub);
    assert!(manager.wait_until_disconnected(Duration::from_secs(2)));

    // A fresh subscriber opens a fresh session with a fresh snapshot
    let sub = manager.subscribe().unwrap();
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(next_frame_code(&sub), 0x88);
}

#[test]
fn test_transport_loss_tears_the_session_down() {
    let (manager, chan) = loopback_manager(true);
    let sub = manager.subscribe().unwrap();
    assert_eq!(next_frame_code(&sub), 0x88);

    chan.close();
    loop {
        match sub.recv_timeout(Duration::from_secs(2)).unwrap() {
            ConnectionEvent::Frame(_) => continue,
            ConnectionEvent::Closed => break,
        }
    }
    assert!(manager.wait_until_disconnected(Duration::from_secs(2)));
}
