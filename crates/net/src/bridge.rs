//! Session bridges: one interface over remote and in-process peers.
//!
//! The session manager owns one boxed [`SessionBridge`] per session. The bridge only
//! knows how to move packets and close the link; lifecycle notifications reach the
//! manager through the transport event queue (network) or the loopback inboxes
//! (local), so both variants feed the same dispatch path.

use crate::driver::{ConnectionId, TransportCommand};
use crate::error::SendError;
use crate::packet::Packet;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::debug;

/// Which transport a bridge uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BridgeKind {
    /// Remote peer over QUIC.
    Network,
    /// Co-located peer in the same process.
    Local,
}

/// Capability interface for one session's transport.
pub trait SessionBridge: Send {
    /// Queue a packet without blocking.
    ///
    /// Ordering holds only among packets sharing the same channel and reliability.
    fn send_packet(&mut self, packet: Packet) -> Result<(), SendError>;

    /// Ask the transport to close. Calling it again has no effect.
    fn disconnect(&mut self, reason: &str);

    /// Whether the link is still usable. Checked fresh on every call.
    fn is_connected(&self) -> bool;

    /// Transport variant.
    fn kind(&self) -> BridgeKind;

    /// Remote socket address, if any.
    fn remote_addr(&self) -> Option<SocketAddr>;
}

/// Bridge to a remote peer; hands packets to the I/O driver.
pub struct NetworkSessionBridge {
    conn: ConnectionId,
    remote: SocketAddr,
    commands: mpsc::UnboundedSender<TransportCommand>,
    closing: bool,
}

impl NetworkSessionBridge {
    /// Wrap a transport connection.
    pub fn new(
        conn: ConnectionId,
        remote: SocketAddr,
        commands: mpsc::UnboundedSender<TransportCommand>,
    ) -> Self {
        Self {
            conn,
            remote,
            commands,
            closing: false,
        }
    }

    /// Transport connection handle.
    pub fn connection_id(&self) -> ConnectionId {
        self.conn
    }
}

impl SessionBridge for NetworkSessionBridge {
    fn send_packet(&mut self, packet: Packet) -> Result<(), SendError> {
        if self.closing {
            return Err(SendError::Closed);
        }
        packet.check_limits()?;
        self.commands
            .send(TransportCommand::Send {
                conn: self.conn,
                packet,
            })
            .map_err(|_| SendError::TransportGone)
    }

    fn disconnect(&mut self, reason: &str) {
        if self.closing {
            return;
        }
        self.closing = true;
        debug!(conn = %self.conn, reason, "requesting transport close");
        let _ = self.commands.send(TransportCommand::Close {
            conn: self.conn,
            reason: reason.to_string(),
        });
    }

    fn is_connected(&self) -> bool {
        !self.closing && !self.commands.is_closed()
    }

    fn kind(&self) -> BridgeKind {
        BridgeKind::Network
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.remote)
    }
}

/// End of a loopback link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoopbackSide {
    /// The hosting (authoritative) side.
    Host,
    /// The joining side.
    Guest,
}

impl LoopbackSide {
    /// The opposite end.
    pub fn peer(self) -> Self {
        match self {
            LoopbackSide::Host => LoopbackSide::Guest,
            LoopbackSide::Guest => LoopbackSide::Host,
        }
    }
}

/// Identifies one loopback link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u64);

static NEXT_LINK: AtomicU64 = AtomicU64::new(1);

/// What a loopback inbox can hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopbackEvent {
    /// The link is up.
    Connected,
    /// A packet from the other side.
    Packet(Packet),
    /// The link was closed by `by`.
    Disconnected {
        /// Side that initiated the close.
        by: LoopbackSide,
        /// Reason given.
        reason: String,
    },
}

/// Shared state of one in-process link.
#[derive(Debug)]
pub struct LoopbackHub {
    link: LinkId,
    open: bool,
    host_inbox: VecDeque<LoopbackEvent>,
    guest_inbox: VecDeque<LoopbackEvent>,
}

impl LoopbackHub {
    /// Create a connected link and return its two ends `(host, guest)`.
    pub fn pair() -> (LoopbackEndpoint, LoopbackEndpoint) {
        let link = LinkId(NEXT_LINK.fetch_add(1, Ordering::Relaxed));
        let hub = Arc::new(Mutex::new(LoopbackHub {
            link,
            open: true,
            host_inbox: VecDeque::from([LoopbackEvent::Connected]),
            guest_inbox: VecDeque::from([LoopbackEvent::Connected]),
        }));
        (
            LoopbackEndpoint {
                side: LoopbackSide::Host,
                link,
                hub: Arc::clone(&hub),
            },
            LoopbackEndpoint {
                side: LoopbackSide::Guest,
                link,
                hub,
            },
        )
    }

    fn inbox_mut(&mut self, side: LoopbackSide) -> &mut VecDeque<LoopbackEvent> {
        match side {
            LoopbackSide::Host => &mut self.host_inbox,
            LoopbackSide::Guest => &mut self.guest_inbox,
        }
    }

    /// Close the link for both sides at once.
    fn close(&mut self, by: LoopbackSide, reason: &str) -> bool {
        if !self.open {
            return false;
        }
        self.open = false;
        for side in [LoopbackSide::Host, LoopbackSide::Guest] {
            self.inbox_mut(side).push_back(LoopbackEvent::Disconnected {
                by,
                reason: reason.to_string(),
            });
        }
        true
    }
}

/// One end of a loopback link, ready to be attached to a session manager.
#[derive(Debug, Clone)]
pub struct LoopbackEndpoint {
    side: LoopbackSide,
    link: LinkId,
    hub: Arc<Mutex<LoopbackHub>>,
}

impl LoopbackEndpoint {
    /// Which end this is.
    pub fn side(&self) -> LoopbackSide {
        self.side
    }

    /// Link identifier shared by both ends.
    pub fn link(&self) -> LinkId {
        self.link
    }

    fn lock(&self) -> MutexGuard<'_, LoopbackHub> {
        self.hub.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of events waiting in this end's inbox.
    pub fn pending(&self) -> usize {
        let side = self.side;
        self.lock().inbox_mut(side).len()
    }

    /// Take at most `limit` events from this end's inbox.
    pub fn drain(&self, limit: usize) -> Vec<LoopbackEvent> {
        let side = self.side;
        let mut hub = self.lock();
        let inbox = hub.inbox_mut(side);
        let take = limit.min(inbox.len());
        inbox.drain(..take).collect()
    }

    /// Whether the link is still open.
    pub fn is_open(&self) -> bool {
        self.lock().open
    }
}

/// Bridge to a co-located peer; packets go straight into the other end's inbox.
pub struct LocalSessionBridge {
    endpoint: LoopbackEndpoint,
}

impl LocalSessionBridge {
    /// Wrap one end of a loopback link.
    pub fn new(endpoint: LoopbackEndpoint) -> Self {
        Self { endpoint }
    }

    /// Underlying endpoint.
    pub fn endpoint(&self) -> &LoopbackEndpoint {
        &self.endpoint
    }
}

impl SessionBridge for LocalSessionBridge {
    fn send_packet(&mut self, packet: Packet) -> Result<(), SendError> {
        packet.check_limits()?;
        let target = self.endpoint.side.peer();
        let mut hub = self.endpoint.lock();
        if !hub.open {
            return Err(SendError::Closed);
        }
        hub.inbox_mut(target).push_back(LoopbackEvent::Packet(packet));
        Ok(())
    }

    fn disconnect(&mut self, reason: &str) {
        let side = self.endpoint.side;
        if self.endpoint.lock().close(side, reason) {
            debug!(link = self.endpoint.link.0, ?side, reason, "loopback link closed");
        }
    }

    fn is_connected(&self) -> bool {
        self.endpoint.is_open()
    }

    fn kind(&self) -> BridgeKind {
        BridgeKind::Local
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }
}
