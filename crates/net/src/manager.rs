//! The connection manager: dialer, acceptor, and read-multiplexer loops.

use crate::provider::{Connection, TlsConnectionProvider};
use crate::register::ConnectionsRegister;
use crate::NetworkError;
use gridbot_types::{Federation, PeerAddress, PeerKey};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Exponential backoff policy for dial retries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub factor: u32,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            initial: Duration::from_millis(500),
            factor: 2,
            max: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt after `failures` consecutive failures:
    /// `min(initial · factor^(failures + 1), max)`.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let mut delay = self.initial;
        for _ in 0..=failures {
            if delay >= self.max {
                return self.max;
            }
            delay *= self.factor;
        }
        delay.min(self.max)
    }
}

/// A queued request to establish a connection to one peer.
#[derive(Debug, Clone)]
pub struct ConnectionRequest {
    pub key: PeerKey,
    pub address: PeerAddress,
    pub failures: u32,
}

impl ConnectionRequest {
    pub fn fresh(key: PeerKey, address: PeerAddress) -> Self {
        ConnectionRequest {
            key,
            address,
            failures: 0,
        }
    }
}

/// Maintains at most one live connection per federation peer and funnels
/// all inbound frames into a single `(sender, frame)` stream.
///
/// Owns three background loops (dialer, acceptor, multiplexer intake)
/// plus one reader task per live connection. All of them race the
/// manager's shutdown token; [`shutdown`](Self::shutdown) cancels and
/// awaits them.
pub struct ConnectionManager {
    local_key: PeerKey,
    local_address: PeerAddress,
    register: Arc<ConnectionsRegister>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<(PeerKey, Vec<u8>)>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Start the manager over a bound provider, seeding the dial queue with
    /// every federation member except the local node.
    pub fn start(
        provider: TlsConnectionProvider,
        federation: Federation,
        retry: RetryPolicy,
    ) -> Arc<Self> {
        let provider = Arc::new(provider);
        let (local_key, local_address) = provider.local_info();
        let register = Arc::new(ConnectionsRegister::new());
        let cancel = CancellationToken::new();

        let (dial_tx, dial_rx) = mpsc::unbounded_channel();
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        for entry in federation.others(&local_key) {
            let _ = dial_tx.send(ConnectionRequest::fresh(entry.key, entry.address.clone()));
        }

        let dialer = tokio::spawn(run_dialer(
            provider.clone(),
            register.clone(),
            dial_rx,
            dial_tx.clone(),
            conn_tx.clone(),
            retry,
            cancel.clone(),
        ));
        let acceptor = tokio::spawn(run_acceptor(
            provider.clone(),
            federation,
            register.clone(),
            conn_tx,
            cancel.clone(),
        ));
        let intake = tokio::spawn(run_multiplexer(
            conn_rx,
            register.clone(),
            inbound_tx,
            dial_tx,
            cancel.clone(),
        ));

        info!(local = %local_key, address = %local_address, "connection manager started");

        Arc::new(ConnectionManager {
            local_key,
            local_address,
            register,
            inbound_rx: Mutex::new(inbound_rx),
            cancel,
            tasks: Mutex::new(vec![dialer, acceptor, intake]),
        })
    }

    pub fn local_info(&self) -> (PeerKey, PeerAddress) {
        (self.local_key, self.local_address.clone())
    }

    /// Peers with a currently registered live connection.
    pub fn connected_peers(&self) -> Vec<PeerKey> {
        self.register.keys()
    }

    /// Await the next inbound message, tagged with the sender's key.
    ///
    /// Messages from a single peer arrive in the order that peer sent
    /// them; messages across peers interleave arbitrarily. Returns `None`
    /// after shutdown once the queue drains.
    pub async fn next_message(&self) -> Option<(PeerKey, Vec<u8>)> {
        self.inbound_rx.lock().await.recv().await
    }

    /// Send one frame to a peer.
    ///
    /// Fails with [`NetworkError::SendOnClosedConnection`] if no live
    /// connection is registered or the registered one has terminated; in
    /// the latter case the register entry is removed and a re-dial follows
    /// from the reader's termination path.
    pub async fn send_to(&self, key: &PeerKey, payload: &[u8]) -> Result<(), NetworkError> {
        let conn = self
            .register
            .get(key)
            .ok_or(NetworkError::SendOnClosedConnection(*key))?;
        match conn.send(payload).await {
            Ok(()) => Ok(()),
            Err(NetworkError::SendOnClosedConnection(k)) => {
                self.register.deregister(&conn);
                Err(NetworkError::SendOnClosedConnection(k))
            }
            Err(e) => Err(e),
        }
    }

    /// Send a frame to every currently connected peer. Per-peer failures
    /// are logged and skipped.
    pub async fn broadcast(&self, payload: &[u8]) {
        for key in self.register.keys() {
            if let Err(e) = self.send_to(&key, payload).await {
                debug!(peer = %key, error = %e, "broadcast send failed");
            }
        }
    }

    /// Cancel all background loops and readers and await the loops.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        info!(local = %self.local_key, "connection manager stopped");
    }
}

/// Dialer loop: consumes connection requests one at a time. Dial attempts
/// are serialized; retry timers run as detached sleeps so one unreachable
/// peer never delays another's schedule.
async fn run_dialer(
    provider: Arc<TlsConnectionProvider>,
    register: Arc<ConnectionsRegister>,
    mut dial_rx: mpsc::UnboundedReceiver<ConnectionRequest>,
    dial_tx: mpsc::UnboundedSender<ConnectionRequest>,
    conn_tx: mpsc::UnboundedSender<Arc<Connection>>,
    retry: RetryPolicy,
    cancel: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            _ = cancel.cancelled() => return,
            request = dial_rx.recv() => match request {
                Some(request) => request,
                None => return,
            },
        };

        if register.get(&request.key).is_some() {
            trace!(peer = %request.key, "already connected, dropping dial request");
            continue;
        }

        match provider.connect_to(request.key, &request.address).await {
            Ok(conn) => {
                if register.register_if_absent(conn.clone()).is_some() {
                    // Lost the race against an accepted connection; the
                    // incumbent wins.
                    debug!(peer = %request.key, "dialed connection lost register race");
                    conn.close().await;
                } else {
                    debug!(peer = %request.key, "outbound connection registered");
                    let _ = conn_tx.send(conn);
                }
            }
            Err(e) => {
                let delay = retry.delay_for(request.failures);
                debug!(
                    peer = %request.key,
                    failures = request.failures,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "dial failed, scheduling retry"
                );
                let dial_tx = dial_tx.clone();
                let cancel = cancel.clone();
                let retry_request = ConnectionRequest {
                    failures: request.failures + 1,
                    ..request
                };
                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {
                            let _ = dial_tx.send(retry_request);
                        }
                    }
                });
            }
        }
    }
}

/// Acceptor loop: admits only federation members, keying each admitted
/// connection by the member's configured server address.
async fn run_acceptor(
    provider: Arc<TlsConnectionProvider>,
    federation: Federation,
    register: Arc<ConnectionsRegister>,
    conn_tx: mpsc::UnboundedSender<Arc<Connection>>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = provider.next_incoming() => match accepted {
                Some(accepted) => accepted,
                None => return,
            },
        };

        let accepted = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                trace!(error = %e, "dropped failed inbound handshake");
                continue;
            }
        };

        let key = *accepted.remote_key();
        let Some(address) = federation.address_of(&key).cloned() else {
            debug!(peer = %key, "rejected connection from unknown peer");
            continue;
        };

        let conn = accepted.into_connection(address, provider.queue_capacity());
        if register.register_if_absent(conn.clone()).is_some() {
            debug!(peer = %key, "accepted connection lost register race");
            conn.close().await;
        } else {
            debug!(peer = %key, "inbound connection registered");
            let _ = conn_tx.send(conn);
        }
    }
}

/// Multiplexer intake: spawns one reader task per registered connection.
async fn run_multiplexer(
    mut conn_rx: mpsc::UnboundedReceiver<Arc<Connection>>,
    register: Arc<ConnectionsRegister>,
    inbound_tx: mpsc::UnboundedSender<(PeerKey, Vec<u8>)>,
    dial_tx: mpsc::UnboundedSender<ConnectionRequest>,
    cancel: CancellationToken,
) {
    loop {
        let conn = tokio::select! {
            _ = cancel.cancelled() => return,
            conn = conn_rx.recv() => match conn {
                Some(conn) => conn,
                None => return,
            },
        };
        tokio::spawn(run_reader(
            conn,
            register.clone(),
            inbound_tx.clone(),
            dial_tx.clone(),
            cancel.clone(),
        ));
    }
}

/// Reader task for one connection: pumps frames into the shared inbound
/// queue; on termination closes, deregisters, and requests a fresh dial.
async fn run_reader(
    conn: Arc<Connection>,
    register: Arc<ConnectionsRegister>,
    inbound_tx: mpsc::UnboundedSender<(PeerKey, Vec<u8>)>,
    dial_tx: mpsc::UnboundedSender<ConnectionRequest>,
    cancel: CancellationToken,
) {
    let key = *conn.remote_key();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                conn.close().await;
                register.deregister(&conn);
                return;
            }
            message = conn.incoming_message() => match message {
                Some(Ok(frame)) => {
                    if inbound_tx.send((key, frame)).is_err() {
                        // Consumer gone; treat like shutdown.
                        conn.close().await;
                        register.deregister(&conn);
                        return;
                    }
                }
                Some(Err(e)) => {
                    warn!(peer = %key, error = %e, "connection failed, re-dialing");
                    break;
                }
                None => {
                    debug!(peer = %key, "connection closed by remote, re-dialing");
                    break;
                }
            }
        }
    }

    conn.close().await;
    register.deregister(&conn);
    let _ = dial_tx.send(ConnectionRequest::fresh(
        key,
        conn.remote_server_address().clone(),
    ));
}
