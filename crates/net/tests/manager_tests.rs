//! End-to-end tests for the connection manager over real localhost TLS.

use gridbot_net::{ConnectionManager, NetworkError, RetryPolicy, TlsConnectionProvider};
use gridbot_types::{Federation, FederationEntry, KeyPair, PeerAddress};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        initial: Duration::from_millis(10),
        factor: 2,
        max: Duration::from_millis(100),
    }
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn federation_of(members: &[(&KeyPair, u16)]) -> Federation {
    Federation::new(
        members
            .iter()
            .map(|(pair, port)| FederationEntry {
                key: pair.peer_key(),
                address: PeerAddress::new("127.0.0.1", *port),
            })
            .collect(),
    )
}

async fn start_node(
    keypair: &KeyPair,
    port: u16,
    federation: Federation,
) -> Arc<ConnectionManager> {
    let provider =
        TlsConnectionProvider::bind(keypair, PeerAddress::new("127.0.0.1", port))
            .await
            .expect("bind provider");
    ConnectionManager::start(provider, federation, fast_retry())
}

/// Poll until `cond` holds or the test timeout elapses.
async fn wait_until(mut cond: impl FnMut() -> bool) {
    timeout(TEST_TIMEOUT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("condition not reached before timeout");
}

/// Send, retrying while the register is still settling (a race loser may
/// be torn down between the register check and the write).
async fn send_with_retry(manager: &ConnectionManager, to: &gridbot_types::PeerKey, payload: &[u8]) {
    timeout(TEST_TIMEOUT, async {
        while manager.send_to(to, payload).await.is_err() {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("send did not succeed before timeout");
}

#[tokio::test]
async fn glare_race_settles_to_single_connection() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let a_keys = KeyPair::generate();
    let b_keys = KeyPair::generate();
    let (a_port, b_port) = (free_port(), free_port());
    let federation = federation_of(&[(&a_keys, a_port), (&b_keys, b_port)]);

    // Both nodes start simultaneously, each with the other in its dial
    // queue, so dial and accept race on both sides.
    let a = start_node(&a_keys, a_port, federation.clone()).await;
    let b = start_node(&b_keys, b_port, federation).await;

    wait_until(|| {
        a.connected_peers() == vec![b_keys.peer_key()]
            && b.connected_peers() == vec![a_keys.peer_key()]
    })
    .await;

    // Exactly one registered connection per side, and message flow works
    // in both directions regardless of which candidate won the race.
    assert_eq!(a.connected_peers().len(), 1);
    assert_eq!(b.connected_peers().len(), 1);

    send_with_retry(&a, &b_keys.peer_key(), b"from a").await;
    send_with_retry(&b, &a_keys.peer_key(), b"from b").await;

    let (from, frame) = timeout(TEST_TIMEOUT, b.next_message()).await.unwrap().unwrap();
    assert_eq!(from, a_keys.peer_key());
    assert_eq!(frame, b"from a");

    let (from, frame) = timeout(TEST_TIMEOUT, a.next_message()).await.unwrap().unwrap();
    assert_eq!(from, b_keys.peer_key());
    assert_eq!(frame, b"from b");

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn messages_from_one_peer_preserve_order() {
    let a_keys = KeyPair::generate();
    let b_keys = KeyPair::generate();
    let (a_port, b_port) = (free_port(), free_port());
    let federation = federation_of(&[(&a_keys, a_port), (&b_keys, b_port)]);

    let a = start_node(&a_keys, a_port, federation.clone()).await;
    let b = start_node(&b_keys, b_port, federation).await;
    wait_until(|| !a.connected_peers().is_empty() && !b.connected_peers().is_empty()).await;

    send_with_retry(&a, &b_keys.peer_key(), &[0]).await;
    for i in 1..50u8 {
        a.send_to(&b_keys.peer_key(), &[i]).await.unwrap();
    }
    for i in 0..50u8 {
        let (from, frame) = timeout(TEST_TIMEOUT, b.next_message()).await.unwrap().unwrap();
        assert_eq!(from, a_keys.peer_key());
        assert_eq!(frame, vec![i]);
    }

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn dial_retries_until_peer_appears() {
    let a_keys = KeyPair::generate();
    let b_keys = KeyPair::generate();
    let (a_port, b_port) = (free_port(), free_port());
    let federation = federation_of(&[(&a_keys, a_port), (&b_keys, b_port)]);

    // A starts alone; B's port is dark, so every dial fails and backs off.
    let a = start_node(&a_keys, a_port, federation.clone()).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(a.connected_peers().is_empty());

    // Once B comes up, A's next retry lands.
    let b = start_node(&b_keys, b_port, federation).await;
    wait_until(|| a.connected_peers() == vec![b_keys.peer_key()]).await;

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn redials_after_peer_restart() {
    let a_keys = KeyPair::generate();
    let b_keys = KeyPair::generate();
    let (a_port, b_port) = (free_port(), free_port());
    let federation = federation_of(&[(&a_keys, a_port), (&b_keys, b_port)]);

    let a = start_node(&a_keys, a_port, federation.clone()).await;
    let b = start_node(&b_keys, b_port, federation.clone()).await;
    wait_until(|| !a.connected_peers().is_empty() && !b.connected_peers().is_empty()).await;

    // B goes away; A notices the close, deregisters, and re-queues a dial.
    b.shutdown().await;
    drop(b);
    wait_until(|| a.connected_peers().is_empty()).await;

    // B restarts on the same address; A reconnects on its retry schedule.
    let b = start_node(&b_keys, b_port, federation).await;
    wait_until(|| a.connected_peers() == vec![b_keys.peer_key()]).await;

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn stranger_is_rejected() {
    let a_keys = KeyPair::generate();
    let stranger_keys = KeyPair::generate();
    let a_port = free_port();
    // The federation knows only A; the stranger's key appears nowhere.
    let federation = federation_of(&[(&a_keys, a_port)]);

    let a = start_node(&a_keys, a_port, federation).await;

    // The stranger completes the TLS handshake (possession of *a* key is
    // proven, just not a federation one)...
    let stranger_provider =
        TlsConnectionProvider::bind(&stranger_keys, PeerAddress::new("127.0.0.1", 0))
            .await
            .unwrap();
    let conn = stranger_provider
        .connect_to(a_keys.peer_key(), &PeerAddress::new("127.0.0.1", a_port))
        .await
        .unwrap();

    // ...but the acceptor drops it: no register entry appears and the
    // stranger observes the close.
    assert!(timeout(TEST_TIMEOUT, conn.incoming_message())
        .await
        .unwrap()
        .is_none());
    assert!(a.connected_peers().is_empty());

    a.shutdown().await;
}

#[tokio::test]
async fn send_to_disconnected_peer_is_a_typed_error() {
    let a_keys = KeyPair::generate();
    let b_keys = KeyPair::generate();
    let (a_port, b_port) = (free_port(), free_port());
    let federation = federation_of(&[(&a_keys, a_port), (&b_keys, b_port)]);

    let a = start_node(&a_keys, a_port, federation).await;

    let err = a
        .send_to(&b_keys.peer_key(), b"nobody home")
        .await
        .unwrap_err();
    assert!(matches!(err, NetworkError::SendOnClosedConnection(_)));

    a.shutdown().await;
}
