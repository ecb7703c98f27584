//! End-to-end DCC relay scenarios once a transfer is already underway:
//! a mid-transfer cancel and a mid-transfer reset, both of which must
//! converge on exactly one `TransferClosed` event.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use ircd::dcc::events::DccEvent;
use ircd::dcc::{DccLimits, DccRelayEngine, Token};

fn test_limits() -> DccLimits {
    DccLimits {
        port_range: (52_000, 52_200),
        pairing_timeout: Duration::from_secs(3 * 60),
        idle_ceiling: Duration::from_secs(10 * 60),
        shutdown_deadline: Duration::from_secs(5),
    }
}

async fn count_transfer_closed(events: &mut tokio::sync::broadcast::Receiver<DccEvent>, window: Duration) -> usize {
    let mut closed = 0;
    while let Ok(Ok(event)) = timeout(window, events.recv()).await {
        if let DccEvent::TransferClosed { .. } = event {
            closed += 1;
        }
    }
    closed
}

/// S4: cancel mid-transfer. After pairing and some bytes flow, both
/// accepted sockets close within 2s and exactly one `TransferClosed` is
/// observed, even though `cancel` is invoked twice.
#[tokio::test]
async fn cancel_mid_transfer_closes_both_sides_exactly_once() {
    let engine = DccRelayEngine::start("127.0.0.1".to_string(), test_limits());
    let mut events = engine.subscribe();
    let token = Token(101);

    let receiver_port = engine.open_for_receiver(token).await.unwrap();
    let sender_port = engine.open_for_sender(token).await.unwrap();

    let mut sender_sock = TcpStream::connect(("127.0.0.1", sender_port)).await.unwrap();
    let mut receiver_sock = TcpStream::connect(("127.0.0.1", receiver_port)).await.unwrap();

    sender_sock.write_all(b"partial-chunk").await.unwrap();
    // Give the pump loop a moment to relay before cutting it off.
    tokio::time::sleep(Duration::from_millis(50)).await;

    engine.cancel(token).await;
    engine.cancel(token).await;

    let sender_eof = timeout(Duration::from_secs(2), async {
        let mut buf = [0u8; 8];
        loop {
            if sender_sock.read(&mut buf).await.unwrap() == 0 {
                break;
            }
        }
    });
    let receiver_eof = timeout(Duration::from_secs(2), async {
        let mut buf = [0u8; 8];
        loop {
            if receiver_sock.read(&mut buf).await.unwrap() == 0 {
                break;
            }
        }
    });
    assert!(sender_eof.await.is_ok(), "sender-side socket did not close within 2s");
    assert!(receiver_eof.await.is_ok(), "receiver-side socket did not close within 2s");

    assert_eq!(count_transfer_closed(&mut events, Duration::from_millis(200)).await, 1);
}

/// S5: an abrupt reset (SO_LINGER(0) then close) on the sender's side of
/// the pair still finalizes the pipe and emits `TransferClosed` within
/// the deadline.
#[tokio::test]
async fn reset_mid_transfer_still_finalizes() {
    let engine = DccRelayEngine::start("127.0.0.1".to_string(), test_limits());
    let mut events = engine.subscribe();
    let token = Token(102);

    let receiver_port = engine.open_for_receiver(token).await.unwrap();
    let sender_port = engine.open_for_sender(token).await.unwrap();

    let sender_sock = TcpStream::connect(("127.0.0.1", sender_port)).await.unwrap();
    let mut receiver_sock = TcpStream::connect(("127.0.0.1", receiver_port)).await.unwrap();

    sender_sock.set_linger(Some(Duration::from_secs(0))).unwrap();
    drop(sender_sock);

    let drained = timeout(Duration::from_secs(5), async {
        let mut buf = Vec::new();
        let _ = receiver_sock.read_to_end(&mut buf).await;
    })
    .await;
    assert!(drained.is_ok(), "receiver side did not observe the reset within 5s");

    assert_eq!(count_transfer_closed(&mut events, Duration::from_secs(5)).await, 1);
}
