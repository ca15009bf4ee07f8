//! Background I/O driver.
//!
//! The driver owns a multi-threaded tokio runtime that runs every QUIC task. The
//! simulation thread never awaits: it reads [`TransportEvent`]s from a bounded
//! queue and pushes [`TransportCommand`]s into an unbounded one.

use crate::channel::{
    decode_datagram, read_stream_channel, read_stream_frame, ChannelWriter, SequenceFilter,
};
use crate::packet::{decode_frame, Packet};
use crate::session::DisconnectReason;
use crate::transport::{ClientEndpoint, ServerEndpoint, TransportConfig};
use anyhow::{Context, Result};
use quinn::{Connection, ConnectionError};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Transport-level connection handle, unique per driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Notifications from the I/O pool to the simulation thread.
#[derive(Debug)]
pub enum TransportEvent {
    /// A handshake started.
    Connecting {
        /// New connection.
        conn: ConnectionId,
        /// Remote address.
        addr: SocketAddr,
    },
    /// The handshake finished; packets may flow.
    Connected {
        /// Connection.
        conn: ConnectionId,
    },
    /// A packet arrived.
    Received {
        /// Source connection.
        conn: ConnectionId,
        /// Decoded packet.
        packet: Packet,
    },
    /// The connection is gone. Always the last event for `conn`.
    Closed {
        /// Connection.
        conn: ConnectionId,
        /// Why it closed.
        reason: DisconnectReason,
    },
    /// Something went wrong on a live connection; a `Closed` follows.
    Fault {
        /// Connection.
        conn: ConnectionId,
        /// Diagnostic.
        error: String,
    },
}

/// Requests from the simulation thread to the I/O pool.
#[derive(Debug)]
pub enum TransportCommand {
    /// Send a packet.
    Send {
        /// Target connection.
        conn: ConnectionId,
        /// Packet to send.
        packet: Packet,
    },
    /// Close the connection.
    Close {
        /// Target connection.
        conn: ConnectionId,
        /// Reason sent to the peer.
        reason: String,
    },
}

#[derive(Debug, PartialEq)]
enum WriterCommand {
    Send(Packet),
    Close(String),
}

/// Connection lifecycle as seen by the command router.
enum Lifecycle {
    /// Announced before the `Connecting` event is emitted.
    Opened(ConnectionId),
    /// Handshake done; the writer task is listening.
    Ready(ConnectionId, mpsc::UnboundedSender<WriterCommand>),
    /// The connection is gone; no further commands apply.
    Retired(ConnectionId),
}

enum Route {
    Handshaking { close: Option<String> },
    Ready(mpsc::UnboundedSender<WriterCommand>),
}

/// Maps connection ids to writer tasks.
///
/// A close requested during the handshake is held until the writer registers.
#[derive(Default)]
struct Router {
    routes: HashMap<ConnectionId, Route>,
}

impl Router {
    fn lifecycle(&mut self, message: Lifecycle) {
        match message {
            Lifecycle::Opened(conn) => {
                self.routes.insert(conn, Route::Handshaking { close: None });
            }
            Lifecycle::Ready(conn, writer) => {
                if let Some(Route::Handshaking {
                    close: Some(reason),
                }) = self.routes.get_mut(&conn)
                {
                    debug!(%conn, "applying close requested during handshake");
                    let _ = writer.send(WriterCommand::Close(std::mem::take(reason)));
                }
                self.routes.insert(conn, Route::Ready(writer));
            }
            Lifecycle::Retired(conn) => {
                self.routes.remove(&conn);
            }
        }
    }

    fn command(&mut self, command: TransportCommand) {
        match command {
            TransportCommand::Send { conn, packet } => match self.routes.get(&conn) {
                Some(Route::Ready(writer)) => {
                    if writer.send(WriterCommand::Send(packet)).is_err() {
                        trace!(%conn, "dropping packet for closed connection");
                    }
                }
                _ => trace!(%conn, "dropping packet for connection without a writer"),
            },
            TransportCommand::Close { conn, reason } => match self.routes.get_mut(&conn) {
                Some(Route::Ready(writer)) => {
                    let _ = writer.send(WriterCommand::Close(reason));
                }
                Some(Route::Handshaking { close }) => {
                    close.get_or_insert(reason);
                }
                None => trace!(%conn, "close for retired connection"),
            },
        }
    }

    fn len(&self) -> usize {
        self.routes.len()
    }
}

#[derive(Clone)]
struct Shared {
    events: mpsc::Sender<TransportEvent>,
    lifecycle: mpsc::UnboundedSender<Lifecycle>,
    next_id: Arc<AtomicU64>,
}

impl Shared {
    /// Allocate an id and register it with the router.
    fn open(&self) -> ConnectionId {
        let conn = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let _ = self.lifecycle.send(Lifecycle::Opened(conn));
        conn
    }

    fn retire(&self, conn: ConnectionId) {
        let _ = self.lifecycle.send(Lifecycle::Retired(conn));
    }

    async fn emit(&self, event: TransportEvent) -> bool {
        self.events.send(event).await.is_ok()
    }
}

/// Owns the I/O runtime and the queues that connect it to the simulation thread.
pub struct NetworkDriver {
    runtime: Option<Runtime>,
    events: mpsc::Receiver<TransportEvent>,
    commands: mpsc::UnboundedSender<TransportCommand>,
    local_addr: SocketAddr,
}

impl NetworkDriver {
    /// Bind a server endpoint and start accepting connections.
    pub fn listen(addr: SocketAddr, config: &TransportConfig) -> Result<Self> {
        let runtime = build_runtime(config)?;
        let server = {
            let _guard = runtime.enter();
            ServerEndpoint::bind(addr, config)?
        };
        let local_addr = server.local_addr();

        let (shared, events, commands) = Self::spawn_router(&runtime, config);
        runtime.spawn(accept_loop(server, shared));

        info!(%local_addr, "Network driver listening");
        Ok(Self {
            runtime: Some(runtime),
            events,
            commands,
            local_addr,
        })
    }

    /// Dial a server. The outcome arrives as events.
    pub fn connect(server_addr: SocketAddr, config: &TransportConfig) -> Result<Self> {
        let runtime = build_runtime(config)?;
        let client = {
            let _guard = runtime.enter();
            ClientEndpoint::new(config)?
        };
        let local_addr = client.local_addr()?;

        let (shared, events, commands) = Self::spawn_router(&runtime, config);
        runtime.spawn(async move {
            let conn = shared.open();
            if !shared
                .emit(TransportEvent::Connecting {
                    conn,
                    addr: server_addr,
                })
                .await
            {
                shared.retire(conn);
                return;
            }
            match client.begin_connect(server_addr) {
                Ok(connecting) => run_connection(conn, connecting, shared).await,
                Err(err) => {
                    let error = format!("{err:#}");
                    shared
                        .emit(TransportEvent::Fault {
                            conn,
                            error: error.clone(),
                        })
                        .await;
                    shared
                        .emit(TransportEvent::Closed {
                            conn,
                            reason: DisconnectReason::Fault(error),
                        })
                        .await;
                    shared.retire(conn);
                }
            }
            // Keep the endpoint alive for the lifetime of the connection.
            drop(client);
        });

        info!(%server_addr, "Network driver connecting");
        Ok(Self {
            runtime: Some(runtime),
            events,
            commands,
            local_addr,
        })
    }

    fn spawn_router(
        runtime: &Runtime,
        config: &TransportConfig,
    ) -> (
        Shared,
        mpsc::Receiver<TransportEvent>,
        mpsc::UnboundedSender<TransportCommand>,
    ) {
        let (event_tx, event_rx) = mpsc::channel(config.event_queue_capacity.max(1));
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel();

        runtime.spawn(route_commands(command_rx, lifecycle_rx));

        let shared = Shared {
            events: event_tx,
            lifecycle: lifecycle_tx,
            next_id: Arc::new(AtomicU64::new(1)),
        };
        (shared, event_rx, command_tx)
    }

    /// Local socket address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Sender for transport commands; cloned into each network bridge.
    pub fn command_sender(&self) -> mpsc::UnboundedSender<TransportCommand> {
        self.commands.clone()
    }

    /// Events currently waiting in the queue.
    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    /// Take the next event without waiting.
    pub fn try_next_event(&mut self) -> Result<TransportEvent, mpsc::error::TryRecvError> {
        self.events.try_recv()
    }
}

impl Drop for NetworkDriver {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

fn build_runtime(config: &TransportConfig) -> Result<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.io_threads.max(1))
        .thread_name("skirmish-io")
        .enable_all()
        .build()
        .context("Failed to build I/O runtime")
}

async fn accept_loop(server: ServerEndpoint, shared: Shared) {
    while let Some(incoming) = server.accept().await {
        let conn = shared.open();
        let addr = incoming.remote_address();
        if !shared.emit(TransportEvent::Connecting { conn, addr }).await {
            shared.retire(conn);
            break;
        }
        let shared = shared.clone();
        tokio::spawn(async move {
            run_connection(conn, async move { incoming.await }, shared).await;
        });
    }
    debug!("Accept loop finished");
}

async fn route_commands(
    mut commands: mpsc::UnboundedReceiver<TransportCommand>,
    mut lifecycle: mpsc::UnboundedReceiver<Lifecycle>,
) {
    let mut router = Router::default();

    loop {
        tokio::select! {
            biased;
            Some(message) = lifecycle.recv() => router.lifecycle(message),
            command = commands.recv() => {
                let Some(command) = command else { break };
                router.command(command);
            }
        }
    }
    debug!(routes = router.len(), "Command router finished");
}

async fn run_connection<F>(conn: ConnectionId, handshake: F, shared: Shared)
where
    F: Future<Output = Result<Connection, ConnectionError>>,
{
    serve_connection(conn, handshake, &shared).await;
    // Dropping the route ends the write loop.
    shared.retire(conn);
}

async fn serve_connection<F>(conn: ConnectionId, handshake: F, shared: &Shared)
where
    F: Future<Output = Result<Connection, ConnectionError>>,
{
    let connection = match handshake.await {
        Ok(connection) => connection,
        Err(err) => {
            warn!(%conn, error = %err, "Handshake failed");
            shared
                .emit(TransportEvent::Fault {
                    conn,
                    error: err.to_string(),
                })
                .await;
            shared
                .emit(TransportEvent::Closed {
                    conn,
                    reason: close_reason(&err),
                })
                .await;
            return;
        }
    };

    let (writer_tx, writer_rx) = mpsc::unbounded_channel();
    if shared.lifecycle.send(Lifecycle::Ready(conn, writer_tx)).is_err() {
        connection.close(0u32.into(), b"driver shutting down");
        return;
    }
    if !shared.emit(TransportEvent::Connected { conn }).await {
        connection.close(0u32.into(), b"driver shutting down");
        return;
    }
    info!(%conn, remote = %connection.remote_address(), "Connection established");

    tokio::spawn(write_loop(conn, connection.clone(), writer_rx, shared.clone()));
    tokio::spawn(read_streams(conn, connection.clone(), shared.clone()));
    tokio::spawn(read_datagrams(conn, connection.clone(), shared.clone()));

    let err = connection.closed().await;
    debug!(%conn, reason = %err, "Connection closed");
    shared
        .emit(TransportEvent::Closed {
            conn,
            reason: close_reason(&err),
        })
        .await;
}

fn close_reason(err: &ConnectionError) -> DisconnectReason {
    match err {
        ConnectionError::ApplicationClosed(close) => {
            DisconnectReason::PeerClosed(String::from_utf8_lossy(&close.reason).into_owned())
        }
        ConnectionError::LocallyClosed => DisconnectReason::Requested("closed locally".to_string()),
        ConnectionError::ConnectionClosed(close) => {
            DisconnectReason::PeerClosed(String::from_utf8_lossy(&close.reason).into_owned())
        }
        ConnectionError::TimedOut => DisconnectReason::TimedOut,
        other => DisconnectReason::Fault(other.to_string()),
    }
}

async fn report_fault(
    conn: ConnectionId,
    connection: &Connection,
    shared: &Shared,
    err: anyhow::Error,
) {
    // Errors after the connection closed are teardown noise.
    if connection.close_reason().is_some() {
        return;
    }
    let error = format!("{err:#}");
    warn!(%conn, %error, "Transport fault");
    shared.emit(TransportEvent::Fault { conn, error }).await;
}

async fn write_loop(
    conn: ConnectionId,
    connection: Connection,
    mut commands: mpsc::UnboundedReceiver<WriterCommand>,
    shared: Shared,
) {
    let mut writer = ChannelWriter::new(connection.clone());
    while let Some(command) = commands.recv().await {
        match command {
            WriterCommand::Send(packet) => {
                if let Err(err) = writer.send(&packet).await {
                    report_fault(conn, &connection, &shared, err).await;
                    break;
                }
            }
            WriterCommand::Close(reason) => {
                writer.finish();
                connection.close(0u32.into(), reason.as_bytes());
                break;
            }
        }
    }
}

async fn read_streams(conn: ConnectionId, connection: Connection, shared: Shared) {
    loop {
        let mut recv = match connection.accept_uni().await {
            Ok(recv) => recv,
            Err(_) => break,
        };
        let connection = connection.clone();
        let shared = shared.clone();
        tokio::spawn(async move {
            let result: Result<()> = async {
                let channel = read_stream_channel(&mut recv).await?;
                while let Some(packet) = read_stream_frame(&mut recv).await? {
                    if packet.channel != channel {
                        anyhow::bail!(
                            "frame for {} on stream for {}",
                            packet.channel,
                            channel
                        );
                    }
                    if !shared.emit(TransportEvent::Received { conn, packet }).await {
                        break;
                    }
                }
                Ok(())
            }
            .await;
            if let Err(err) = result {
                report_fault(conn, &connection, &shared, err).await;
            }
        });
    }
}

async fn read_datagrams(conn: ConnectionId, connection: Connection, shared: Shared) {
    let mut filter = SequenceFilter::default();
    loop {
        let datagram = match connection.read_datagram().await {
            Ok(datagram) => datagram,
            Err(_) => break,
        };
        let decoded = decode_datagram(&datagram).and_then(|(channel, seq, frame)| {
            decode_frame(frame).map(|packet| (channel, seq, packet))
        });
        let (channel, seq, packet) = match decoded {
            Ok(parts) => parts,
            Err(err) => {
                report_fault(conn, &connection, &shared, err.into()).await;
                continue;
            }
        };
        if packet.channel != channel || packet.is_reliable() {
            report_fault(
                conn,
                &connection,
                &shared,
                anyhow::anyhow!("datagram header disagrees with frame on {channel}"),
            )
            .await;
            continue;
        }
        if packet.flags.is_ordered() && !filter.accept(channel, seq) {
            trace!(%conn, %channel, seq, "dropping stale datagram");
            continue;
        }
        if !shared.emit(TransportEvent::Received { conn, packet }).await {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelId;
    use crate::packet::PacketFlags;

    fn packet() -> Packet {
        Packet::new(7, ChannelId::CONTROL, PacketFlags::RELIABLE, vec![1, 2, 3])
    }

    #[test]
    fn close_during_handshake_is_applied_on_registration() {
        let mut router = Router::default();
        let conn = ConnectionId(1);
        router.lifecycle(Lifecycle::Opened(conn));
        router.command(TransportCommand::Close {
            conn,
            reason: "server full".into(),
        });
        router.command(TransportCommand::Send { conn, packet: packet() });

        let (tx, mut rx) = mpsc::unbounded_channel();
        router.lifecycle(Lifecycle::Ready(conn, tx));
        assert_eq!(rx.try_recv().unwrap(), WriterCommand::Close("server full".into()));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn first_close_reason_wins_during_handshake() {
        let mut router = Router::default();
        let conn = ConnectionId(2);
        router.lifecycle(Lifecycle::Opened(conn));
        for reason in ["first", "second"] {
            router.command(TransportCommand::Close {
                conn,
                reason: reason.into(),
            });
        }
        let (tx, mut rx) = mpsc::unbounded_channel();
        router.lifecycle(Lifecycle::Ready(conn, tx));
        assert_eq!(rx.try_recv().unwrap(), WriterCommand::Close("first".into()));
    }

    #[test]
    fn ready_routes_forward_packets() {
        let mut router = Router::default();
        let conn = ConnectionId(3);
        let (tx, mut rx) = mpsc::unbounded_channel();
        router.lifecycle(Lifecycle::Opened(conn));
        router.lifecycle(Lifecycle::Ready(conn, tx));
        router.command(TransportCommand::Send { conn, packet: packet() });
        assert_eq!(rx.try_recv().unwrap(), WriterCommand::Send(packet()));
    }

    #[test]
    fn retiring_drops_the_writer() {
        let mut router = Router::default();
        let conn = ConnectionId(4);
        let (tx, mut rx) = mpsc::unbounded_channel();
        router.lifecycle(Lifecycle::Opened(conn));
        router.lifecycle(Lifecycle::Ready(conn, tx));
        router.lifecycle(Lifecycle::Retired(conn));

        assert_eq!(router.len(), 0);
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn commands_for_retired_connections_leave_no_route() {
        let mut router = Router::default();
        let conn = ConnectionId(5);
        router.lifecycle(Lifecycle::Opened(conn));
        router.lifecycle(Lifecycle::Retired(conn));
        router.command(TransportCommand::Close {
            conn,
            reason: "late".into(),
        });
        router.command(TransportCommand::Send { conn, packet: packet() });
        assert_eq!(router.len(), 0);
    }
}
