//! The encrypted connection provider and live connection handles.

use crate::codec::{read_frame, write_frame};
use crate::tls::{dial_server_name, peer_key_from_cert, TlsIdentity};
use crate::{NetworkError, DEFAULT_INBOUND_QUEUE};
use gridbot_types::{KeyPair, PeerAddress, PeerKey};
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Upper bound on a single TLS handshake, inbound or outbound.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Which side initiated the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// A live, mutually authenticated, framed channel to one federation peer.
///
/// Frames from the remote are pumped by an internal reader task into a
/// bounded queue (backpressure applies once it fills). The connection is
/// terminal after the first of: remote close, local [`close`](Self::close),
/// or read/write error.
pub struct Connection {
    remote_key: PeerKey,
    remote_server_address: PeerAddress,
    direction: Direction,
    writer: Mutex<WriteHalf<TlsStream<TcpStream>>>,
    inbound: Mutex<mpsc::Receiver<Result<Vec<u8>, NetworkError>>>,
    closed: AtomicBool,
    reader_cancel: CancellationToken,
}

impl Connection {
    fn spawn(
        stream: TlsStream<TcpStream>,
        remote_key: PeerKey,
        remote_server_address: PeerAddress,
        direction: Direction,
        queue_capacity: usize,
    ) -> Arc<Self> {
        let (mut read_half, write_half) = tokio::io::split(stream);
        let (frame_tx, frame_rx) = mpsc::channel(queue_capacity);
        let reader_cancel = CancellationToken::new();

        let cancel = reader_cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = read_frame(&mut read_half) => match frame {
                        Ok(frame) => {
                            if frame_tx.send(Ok(frame)).await.is_err() {
                                break;
                            }
                        }
                        Err(NetworkError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                            // Remote closed cleanly; dropping the sender
                            // surfaces `None` to the consumer.
                            break;
                        }
                        Err(e) => {
                            let _ = frame_tx.send(Err(e)).await;
                            break;
                        }
                    }
                }
            }
        });

        Arc::new(Connection {
            remote_key,
            remote_server_address,
            direction,
            writer: Mutex::new(write_half),
            inbound: Mutex::new(frame_rx),
            closed: AtomicBool::new(false),
            reader_cancel,
        })
    }

    pub fn remote_key(&self) -> &PeerKey {
        &self.remote_key
    }

    /// The peer's server endpoint: the dialed address for outgoing
    /// connections, the federation table's address for incoming ones.
    pub fn remote_server_address(&self) -> &PeerAddress {
        &self.remote_server_address
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Send one frame to the peer.
    pub async fn send(&self, payload: &[u8]) -> Result<(), NetworkError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NetworkError::SendOnClosedConnection(self.remote_key));
        }
        if payload.len() > crate::MAX_FRAME_LEN {
            return Err(NetworkError::FrameTooLarge(payload.len()));
        }

        let mut writer = self.writer.lock().await;
        match write_frame(&mut *writer, payload).await {
            Ok(()) => Ok(()),
            Err(_) => {
                drop(writer);
                self.close().await;
                Err(NetworkError::SendOnClosedConnection(self.remote_key))
            }
        }
    }

    /// Await the next inbound frame. `Some(Err(_))` reports a terminal
    /// decoding or read error; `None` means the remote closed.
    pub async fn incoming_message(&self) -> Option<Result<Vec<u8>, NetworkError>> {
        self.inbound.lock().await.recv().await
    }

    /// Tear the connection down. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.reader_cancel.cancel();
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
        trace!(peer = %self.remote_key, "connection closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader_cancel.cancel();
    }
}

/// A server-side connection that passed the TLS handshake but has not been
/// admitted yet. The acceptor either promotes it with the federation's
/// address for the peer or drops it.
pub struct AcceptedConnection {
    remote_key: PeerKey,
    stream: TlsStream<TcpStream>,
}

impl AcceptedConnection {
    pub fn remote_key(&self) -> &PeerKey {
        &self.remote_key
    }

    /// Promote to a live [`Connection`] keyed by the peer's configured
    /// server address.
    pub fn into_connection(
        self,
        server_address: PeerAddress,
        queue_capacity: usize,
    ) -> Arc<Connection> {
        Connection::spawn(
            self.stream,
            self.remote_key,
            server_address,
            Direction::Incoming,
            queue_capacity,
        )
    }
}

/// Dials and accepts mutually authenticated framed channels.
pub struct TlsConnectionProvider {
    identity: TlsIdentity,
    local_key: PeerKey,
    local_address: PeerAddress,
    listener: TcpListener,
    acceptor: TlsAcceptor,
    queue_capacity: usize,
}

impl TlsConnectionProvider {
    /// Bind the listener and prepare the node's ephemeral TLS identity.
    ///
    /// Port 0 binds an arbitrary free port; `local_info` reports the port
    /// actually bound.
    pub async fn bind(keypair: &KeyPair, address: PeerAddress) -> Result<Self, NetworkError> {
        let identity = TlsIdentity::generate(keypair)?;
        let acceptor = TlsAcceptor::from(Arc::new(identity.server_config()?));

        let listener = TcpListener::bind((address.host.as_str(), address.port)).await?;
        let bound_port = listener.local_addr()?.port();

        Ok(TlsConnectionProvider {
            identity,
            local_key: keypair.peer_key(),
            local_address: PeerAddress::new(address.host, bound_port),
            listener,
            acceptor,
            queue_capacity: DEFAULT_INBOUND_QUEUE,
        })
    }

    pub fn local_info(&self) -> (PeerKey, PeerAddress) {
        (self.local_key, self.local_address.clone())
    }

    /// Establish a fresh outbound channel to `key` at `address`.
    ///
    /// The handshake fails unless the remote proves possession of the
    /// private key matching `key`.
    pub async fn connect_to(
        &self,
        key: PeerKey,
        address: &PeerAddress,
    ) -> Result<Arc<Connection>, NetworkError> {
        let tcp = TcpStream::connect((address.host.as_str(), address.port))
            .await
            .map_err(|e| NetworkError::Dial(e.to_string()))?;

        let connector = TlsConnector::from(Arc::new(self.identity.client_config(key)?));
        let handshake = connector.connect(dial_server_name(), tcp);
        let stream = tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake)
            .await
            .map_err(|_| NetworkError::Handshake("handshake timed out".into()))?
            .map_err(|e| NetworkError::Handshake(e.to_string()))?;

        Ok(Connection::spawn(
            stream.into(),
            key,
            address.clone(),
            Direction::Outgoing,
            self.queue_capacity,
        ))
    }

    /// Await the next accepted server-side connection.
    ///
    /// `Some(Err(_))` reports a failed handshake (the acceptor drops these
    /// silently); `None` is yielded once the listener is gone.
    pub async fn next_incoming(&self) -> Option<Result<AcceptedConnection, NetworkError>> {
        let (tcp, remote) = match self.listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => return Some(Err(NetworkError::Io(e))),
        };
        trace!(remote = %remote, "inbound tcp connection");

        let handshake = self.acceptor.accept(tcp);
        let stream = match tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Some(Err(NetworkError::Handshake(e.to_string()))),
            Err(_) => {
                return Some(Err(NetworkError::Handshake("handshake timed out".into())))
            }
        };

        let remote_key = {
            let (_, session) = stream.get_ref();
            match session.peer_certificates().and_then(|certs| certs.first()) {
                Some(cert) => match peer_key_from_cert(cert) {
                    Ok(key) => key,
                    Err(e) => return Some(Err(e)),
                },
                None => {
                    return Some(Err(NetworkError::InvalidPeerCertificate(
                        "no client certificate presented".into(),
                    )))
                }
            }
        };

        Some(Ok(AcceptedConnection {
            remote_key,
            stream: stream.into(),
        }))
    }

    /// Queue capacity applied to connections admitted by the acceptor.
    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }
}
