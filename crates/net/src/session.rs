//! Session ownership and the once-per-iteration event pump.

use crate::bridge::{
    BridgeKind, LinkId, LocalSessionBridge, LoopbackEndpoint, LoopbackEvent, NetworkSessionBridge,
    SessionBridge,
};
use crate::driver::{ConnectionId, NetworkDriver, TransportEvent};
use crate::error::SessionError;
use crate::packet::Packet;
use serde::{Deserialize, Serialize};
use skirmish_core::{PeerId, SimTick};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::SocketAddr;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, info, trace, warn};

/// Which end of the protocol this manager serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionRole {
    /// Authoritative host.
    Server,
    /// Joining client.
    Client,
}

/// Session lifecycle. `Disconnected` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake in progress.
    Connecting,
    /// Packets flow both ways.
    Connected,
    /// Torn down or being torn down; no further dispatch.
    Disconnected,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// This side asked for the disconnect.
    Requested(String),
    /// The remote side closed the link.
    PeerClosed(String),
    /// No traffic within the transport's idle timeout.
    TimedOut,
    /// Evicted by the manager for inactivity.
    Evicted,
    /// Transport or protocol fault.
    Fault(String),
}

impl DisconnectReason {
    /// Whether this is an expected, orderly teardown.
    pub fn is_graceful(&self) -> bool {
        matches!(
            self,
            DisconnectReason::Requested(_) | DisconnectReason::PeerClosed(_)
        )
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Requested(reason) => write!(f, "requested: {reason}"),
            DisconnectReason::PeerClosed(reason) => write!(f, "closed by peer: {reason}"),
            DisconnectReason::TimedOut => write!(f, "timed out"),
            DisconnectReason::Evicted => write!(f, "evicted for inactivity"),
            DisconnectReason::Fault(reason) => write!(f, "fault: {reason}"),
        }
    }
}

/// Session manager tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Ticks without inbound traffic before `evict_idle` drops a session.
    /// Zero disables eviction.
    pub idle_eviction_ticks: u64,
    /// Maximum number of simultaneous sessions; extra connections are refused.
    pub max_sessions: usize,
    /// Apply idle eviction to in-process sessions as well.
    pub evict_local_sessions: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_eviction_ticks: 20 * 60,
            max_sessions: 64,
            evict_local_sessions: false,
        }
    }
}

/// Public view of a session, handed to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// Stable session handle.
    pub id: PeerId,
    /// Transport variant.
    pub kind: BridgeKind,
    /// Remote address for network sessions.
    pub remote_addr: Option<SocketAddr>,
}

/// Receives session notifications during [`SessionManager::poll`].
pub trait SessionObserver {
    /// A session finished connecting.
    fn on_connected(&mut self, peer: &PeerInfo);
    /// A session ended. Sent once, after which the id is never reused.
    fn on_disconnected(&mut self, peer: &PeerInfo, reason: &DisconnectReason);
    /// A packet arrived from a connected session.
    fn on_incoming_packet(&mut self, peer: PeerId, packet: Packet);
}

/// Counts of what one poll delivered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollStats {
    /// `on_connected` calls.
    pub connected: usize,
    /// `on_disconnected` calls.
    pub disconnected: usize,
    /// `on_incoming_packet` calls.
    pub packets: usize,
    /// Packets discarded because their session was not connected.
    pub dropped: usize,
}

impl PollStats {
    /// True when nothing was delivered or dropped.
    pub fn is_empty(&self) -> bool {
        *self == PollStats::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TransportKey {
    Network(ConnectionId),
    Local(LinkId),
}

struct Session {
    info: PeerInfo,
    key: TransportKey,
    bridge: Box<dyn SessionBridge>,
    state: ConnectionState,
    last_activity: SimTick,
    /// Reason recorded when this side initiated the teardown.
    pending_reason: Option<DisconnectReason>,
    local: Option<LoopbackEndpoint>,
}

/// Owns every live session and pumps transport events into an observer.
pub struct SessionManager {
    role: SessionRole,
    config: SessionConfig,
    sessions: BTreeMap<PeerId, Session>,
    by_transport: HashMap<TransportKey, PeerId>,
    network: Option<NetworkDriver>,
    next_peer: u64,
}

impl SessionManager {
    /// Create a manager with no transports attached.
    pub fn new(role: SessionRole, config: SessionConfig) -> Self {
        Self {
            role,
            config,
            sessions: BTreeMap::new(),
            by_transport: HashMap::new(),
            network: None,
            next_peer: 1,
        }
    }

    /// Role this manager serves.
    pub fn role(&self) -> SessionRole {
        self.role
    }

    /// Take ownership of a network driver. Its events are pumped by [`poll`](Self::poll).
    pub fn attach_network(&mut self, driver: NetworkDriver) {
        info!(role = ?self.role, addr = %driver.local_addr(), "Network transport attached");
        self.network = Some(driver);
    }

    /// Local address of the attached network driver.
    pub fn network_addr(&self) -> Option<SocketAddr> {
        self.network.as_ref().map(NetworkDriver::local_addr)
    }

    /// Adopt one end of a loopback link as a new session.
    ///
    /// The session starts `Connecting`; `on_connected` fires on the next poll.
    pub fn attach_local(&mut self, endpoint: LoopbackEndpoint) -> PeerId {
        let key = TransportKey::Local(endpoint.link());
        let id = self.allocate_peer();
        let info = PeerInfo {
            id,
            kind: BridgeKind::Local,
            remote_addr: None,
        };
        debug!(peer = %id, side = ?endpoint.side(), "Local session attached");
        self.insert_session(
            key,
            Session {
                info,
                key,
                bridge: Box::new(LocalSessionBridge::new(endpoint.clone())),
                state: ConnectionState::Connecting,
                last_activity: SimTick::ZERO,
                pending_reason: None,
                local: Some(endpoint),
            },
        );
        id
    }

    fn allocate_peer(&mut self) -> PeerId {
        let id = PeerId(self.next_peer);
        self.next_peer += 1;
        id
    }

    fn insert_session(&mut self, key: TransportKey, session: Session) {
        self.by_transport.insert(key, session.info.id);
        self.sessions.insert(session.info.id, session);
    }

    /// Deliver every event that is available right now, without blocking.
    ///
    /// Events that arrive while the poll runs wait for the next call.
    pub fn poll(&mut self, now: SimTick, observer: &mut impl SessionObserver) -> PollStats {
        let mut stats = PollStats::default();

        let local_batches: Vec<(PeerId, Vec<LoopbackEvent>)> = self
            .sessions
            .values()
            .filter_map(|session| {
                let endpoint = session.local.as_ref()?;
                let pending = endpoint.pending();
                (pending > 0).then(|| (session.info.id, endpoint.drain(pending)))
            })
            .collect();

        let network_budget = self.network.as_ref().map_or(0, NetworkDriver::pending_events);
        for _ in 0..network_budget {
            let Some(driver) = self.network.as_mut() else { break };
            match driver.try_next_event() {
                Ok(event) => self.handle_transport_event(event, now, observer, &mut stats),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.network_lost(observer, &mut stats);
                    break;
                }
            }
        }

        for (peer, events) in local_batches {
            for event in events {
                self.handle_local_event(peer, event, now, observer, &mut stats);
            }
        }

        if !stats.is_empty() {
            trace!(?stats, "session poll");
        }
        stats
    }

    fn handle_transport_event(
        &mut self,
        event: TransportEvent,
        now: SimTick,
        observer: &mut impl SessionObserver,
        stats: &mut PollStats,
    ) {
        match event {
            TransportEvent::Connecting { conn, addr } => {
                let Some(driver) = self.network.as_ref() else { return };
                let mut bridge = NetworkSessionBridge::new(conn, addr, driver.command_sender());
                if self.sessions.len() >= self.config.max_sessions {
                    warn!(%conn, %addr, "Session limit reached, refusing connection");
                    bridge.disconnect("server full");
                    return;
                }
                let key = TransportKey::Network(conn);
                let id = self.allocate_peer();
                debug!(peer = %id, %conn, %addr, "Session connecting");
                self.insert_session(
                    key,
                    Session {
                        info: PeerInfo {
                            id,
                            kind: BridgeKind::Network,
                            remote_addr: Some(addr),
                        },
                        key,
                        bridge: Box::new(bridge),
                        state: ConnectionState::Connecting,
                        last_activity: now,
                        pending_reason: None,
                        local: None,
                    },
                );
            }
            TransportEvent::Connected { conn } => {
                if let Some(peer) = self.by_transport.get(&TransportKey::Network(conn)).copied() {
                    self.mark_connected(peer, now, observer, stats);
                }
            }
            TransportEvent::Received { conn, packet } => {
                match self.by_transport.get(&TransportKey::Network(conn)).copied() {
                    Some(peer) => self.deliver(peer, packet, now, observer, stats),
                    None => stats.dropped += 1,
                }
            }
            TransportEvent::Fault { conn, error } => {
                if let Some(peer) = self.by_transport.get(&TransportKey::Network(conn)).copied() {
                    warn!(%peer, %conn, %error, "Transport fault, tearing down session");
                    self.begin_disconnect(peer, DisconnectReason::Fault(error));
                }
            }
            TransportEvent::Closed { conn, reason } => {
                if let Some(peer) = self.by_transport.get(&TransportKey::Network(conn)).copied() {
                    self.finish_disconnect(peer, reason, observer, stats);
                }
            }
        }
    }

    fn handle_local_event(
        &mut self,
        peer: PeerId,
        event: LoopbackEvent,
        now: SimTick,
        observer: &mut impl SessionObserver,
        stats: &mut PollStats,
    ) {
        match event {
            LoopbackEvent::Connected => self.mark_connected(peer, now, observer, stats),
            LoopbackEvent::Packet(packet) => self.deliver(peer, packet, now, observer, stats),
            LoopbackEvent::Disconnected { by, reason } => {
                let Some(session) = self.sessions.get(&peer) else { return };
                let side = session.local.as_ref().map(LoopbackEndpoint::side);
                let reason = if side == Some(by) {
                    DisconnectReason::Requested(reason)
                } else {
                    DisconnectReason::PeerClosed(reason)
                };
                self.finish_disconnect(peer, reason, observer, stats);
            }
        }
    }

    fn mark_connected(
        &mut self,
        peer: PeerId,
        now: SimTick,
        observer: &mut impl SessionObserver,
        stats: &mut PollStats,
    ) {
        let Some(session) = self.sessions.get_mut(&peer) else { return };
        if session.state != ConnectionState::Connecting {
            return;
        }
        session.state = ConnectionState::Connected;
        session.last_activity = now;
        info!(%peer, kind = ?session.info.kind, "Session connected");
        stats.connected += 1;
        observer.on_connected(&session.info);
    }

    fn deliver(
        &mut self,
        peer: PeerId,
        packet: Packet,
        now: SimTick,
        observer: &mut impl SessionObserver,
        stats: &mut PollStats,
    ) {
        let Some(session) = self.sessions.get_mut(&peer) else {
            stats.dropped += 1;
            return;
        };
        if session.state != ConnectionState::Connected || !session.bridge.is_connected() {
            trace!(%peer, opcode = packet.opcode, "dropping packet for inactive session");
            stats.dropped += 1;
            return;
        }
        session.last_activity = now;
        stats.packets += 1;
        observer.on_incoming_packet(peer, packet);
    }

    /// Flip the session to `Disconnected` and ask the bridge to close.
    fn begin_disconnect(&mut self, peer: PeerId, reason: DisconnectReason) -> bool {
        let Some(session) = self.sessions.get_mut(&peer) else { return false };
        if session.state == ConnectionState::Disconnected {
            return false;
        }
        session.state = ConnectionState::Disconnected;
        session.bridge.disconnect(&reason.to_string());
        session.pending_reason = Some(reason);
        true
    }

    fn finish_disconnect(
        &mut self,
        peer: PeerId,
        reason: DisconnectReason,
        observer: &mut impl SessionObserver,
        stats: &mut PollStats,
    ) {
        let Some(session) = self.sessions.remove(&peer) else { return };
        self.by_transport.remove(&session.key);
        let reason = session.pending_reason.unwrap_or(reason);
        info!(%peer, %reason, "Session disconnected");
        stats.disconnected += 1;
        observer.on_disconnected(&session.info, &reason);
    }

    fn network_lost(&mut self, observer: &mut impl SessionObserver, stats: &mut PollStats) {
        warn!("Network driver stopped; closing network sessions");
        self.network = None;
        let peers: Vec<PeerId> = self
            .sessions
            .values()
            .filter(|s| matches!(s.key, TransportKey::Network(_)))
            .map(|s| s.info.id)
            .collect();
        for peer in peers {
            self.finish_disconnect(
                peer,
                DisconnectReason::Fault("transport shut down".to_string()),
                observer,
                stats,
            );
        }
    }

    /// Send to one connected session.
    pub fn send_packet(&mut self, peer: PeerId, packet: Packet) -> Result<(), SessionError> {
        let session = self
            .sessions
            .get_mut(&peer)
            .ok_or(SessionError::UnknownPeer(peer))?;
        if session.state != ConnectionState::Connected {
            return Err(SessionError::NotConnected(peer));
        }
        session
            .bridge
            .send_packet(packet)
            .map_err(|source| SessionError::Send { peer, source })
    }

    /// Send to every connected session. Returns how many accepted the packet.
    pub fn broadcast(&mut self, packet: &Packet) -> usize {
        let mut sent = 0;
        for session in self.sessions.values_mut() {
            if session.state != ConnectionState::Connected {
                continue;
            }
            match session.bridge.send_packet(packet.clone()) {
                Ok(()) => sent += 1,
                Err(err) => debug!(peer = %session.info.id, %err, "broadcast skipped peer"),
            }
        }
        sent
    }

    /// Disconnect a session. Repeated calls have no further effect.
    ///
    /// Dispatch stops immediately; `on_disconnected` fires once the transport
    /// confirms (next poll for local sessions).
    pub fn disconnect_peer(&mut self, peer: PeerId, reason: DisconnectReason) {
        if self.begin_disconnect(peer, reason) {
            debug!(%peer, "Disconnect requested");
        }
    }

    /// Disconnect every session.
    pub fn disconnect_all(&mut self, reason: &str) {
        let peers: Vec<PeerId> = self.sessions.keys().copied().collect();
        for peer in peers {
            self.disconnect_peer(peer, DisconnectReason::Requested(reason.to_string()));
        }
    }

    /// Whether `peer` is connected right now.
    pub fn is_connected(&self, peer: PeerId) -> bool {
        self.sessions.get(&peer).is_some_and(|s| {
            s.state == ConnectionState::Connected && s.bridge.is_connected()
        })
    }

    /// Lifecycle state of `peer`, if it still exists.
    pub fn connection_state(&self, peer: PeerId) -> Option<ConnectionState> {
        self.sessions.get(&peer).map(|s| s.state)
    }

    /// Info for `peer`.
    pub fn peer_info(&self, peer: PeerId) -> Option<&PeerInfo> {
        self.sessions.get(&peer).map(|s| &s.info)
    }

    /// Every session, in id order.
    pub fn peers(&self) -> impl Iterator<Item = &PeerInfo> + '_ {
        self.sessions.values().map(|s| &s.info)
    }

    /// Ids of connected sessions, in id order.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.sessions
            .values()
            .filter(|s| s.state == ConnectionState::Connected && s.bridge.is_connected())
            .map(|s| s.info.id)
            .collect()
    }

    /// Number of sessions in any state.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// True when there are no sessions.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Disconnect sessions with no inbound traffic for the configured number of ticks.
    ///
    /// In-process sessions are skipped unless `evict_local_sessions` is set.
    pub fn evict_idle(&mut self, now: SimTick) -> Vec<PeerId> {
        let limit = self.config.idle_eviction_ticks;
        if limit == 0 {
            return Vec::new();
        }
        let evict_local = self.config.evict_local_sessions;
        let idle: Vec<PeerId> = self
            .sessions
            .values()
            .filter(|s| {
                s.state == ConnectionState::Connected && now.since(s.last_activity) >= limit
            })
            .filter(|s| evict_local || s.info.kind == BridgeKind::Network)
            .map(|s| s.info.id)
            .collect();
        for peer in &idle {
            info!(%peer, %now, "Evicting idle session");
            self.begin_disconnect(*peer, DisconnectReason::Evicted);
        }
        idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::LoopbackHub;
    use crate::channel::ChannelId;
    use crate::packet::PacketFlags;

    #[derive(Default)]
    struct Recorder {
        connected: Vec<PeerId>,
        disconnected: Vec<(PeerId, DisconnectReason)>,
        packets: Vec<(PeerId, Packet)>,
    }

    impl SessionObserver for Recorder {
        fn on_connected(&mut self, peer: &PeerInfo) {
            self.connected.push(peer.id);
        }

        fn on_disconnected(&mut self, peer: &PeerInfo, reason: &DisconnectReason) {
            self.disconnected.push((peer.id, reason.clone()));
        }

        fn on_incoming_packet(&mut self, peer: PeerId, packet: Packet) {
            self.packets.push((peer, packet));
        }
    }

    fn packet(byte: u8) -> Packet {
        Packet::new(1, ChannelId::INPUT, PacketFlags::RELIABLE_ORDERED, vec![byte])
    }

    fn linked() -> (SessionManager, PeerId, SessionManager, PeerId) {
        let (host_end, guest_end) = LoopbackHub::pair();
        let mut host = SessionManager::new(SessionRole::Server, SessionConfig::default());
        let mut guest = SessionManager::new(SessionRole::Client, SessionConfig::default());
        let guest_id = host.attach_local(host_end);
        let host_id = guest.attach_local(guest_end);
        (host, guest_id, guest, host_id)
    }

    #[test]
    fn poll_with_nothing_pending_changes_nothing() {
        let mut manager = SessionManager::new(SessionRole::Server, SessionConfig::default());
        let mut recorder = Recorder::default();
        assert!(manager.poll(SimTick(1), &mut recorder).is_empty());
        assert!(manager.is_empty());
        assert!(recorder.connected.is_empty());
    }

    #[test]
    fn local_sessions_connect_on_first_poll() {
        let (mut host, guest_id, _guest, _) = linked();
        assert_eq!(host.connection_state(guest_id), Some(ConnectionState::Connecting));
        assert!(!host.is_connected(guest_id));

        let mut recorder = Recorder::default();
        let stats = host.poll(SimTick(1), &mut recorder);
        assert_eq!(stats.connected, 1);
        assert_eq!(recorder.connected, vec![guest_id]);
        assert!(host.is_connected(guest_id));
    }

    #[test]
    fn local_packet_arrives_exactly_once_by_next_poll() {
        let (mut host, guest_id, mut guest, host_id) = linked();
        let mut host_rec = Recorder::default();
        let mut guest_rec = Recorder::default();
        host.poll(SimTick(1), &mut host_rec);
        guest.poll(SimTick(1), &mut guest_rec);

        guest.send_packet(host_id, packet(42)).unwrap();
        host.poll(SimTick(2), &mut host_rec);
        host.poll(SimTick(3), &mut host_rec);

        assert_eq!(host_rec.packets, vec![(guest_id, packet(42))]);
    }

    #[test]
    fn send_before_connected_is_refused() {
        let (mut host, guest_id, _guest, _) = linked();
        assert_eq!(
            host.send_packet(guest_id, packet(1)),
            Err(SessionError::NotConnected(guest_id))
        );
        assert_eq!(
            host.send_packet(PeerId(99), packet(1)),
            Err(SessionError::UnknownPeer(PeerId(99)))
        );
    }

    #[test]
    fn double_disconnect_matches_single() {
        let (mut host, guest_id, mut guest, host_id) = linked();
        let mut host_rec = Recorder::default();
        let mut guest_rec = Recorder::default();
        host.poll(SimTick(1), &mut host_rec);
        guest.poll(SimTick(1), &mut guest_rec);

        host.disconnect_peer(guest_id, DisconnectReason::Requested("kick".into()));
        assert!(!host.is_connected(guest_id));
        assert!(!guest.is_connected(host_id));
        host.disconnect_peer(guest_id, DisconnectReason::Requested("kick again".into()));

        host.poll(SimTick(2), &mut host_rec);
        guest.poll(SimTick(2), &mut guest_rec);
        host.poll(SimTick(3), &mut host_rec);

        assert_eq!(
            host_rec.disconnected,
            vec![(guest_id, DisconnectReason::Requested("kick".into()))]
        );
        assert_eq!(
            guest_rec.disconnected,
            vec![(host_id, DisconnectReason::PeerClosed("requested: kick".into()))]
        );
        assert!(host.is_empty());
        assert!(guest.is_empty());
    }

    #[test]
    fn packets_after_disconnect_are_not_dispatched() {
        let (mut host, guest_id, mut guest, host_id) = linked();
        let mut host_rec = Recorder::default();
        let mut guest_rec = Recorder::default();
        host.poll(SimTick(1), &mut host_rec);
        guest.poll(SimTick(1), &mut guest_rec);

        guest.send_packet(host_id, packet(1)).unwrap();
        host.disconnect_peer(guest_id, DisconnectReason::Requested("bye".into()));
        let stats = host.poll(SimTick(2), &mut host_rec);

        assert!(host_rec.packets.is_empty());
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.disconnected, 1);
    }

    #[test]
    fn idle_sessions_are_evicted() {
        let (host_end, _guest_end) = LoopbackHub::pair();
        let config = SessionConfig {
            idle_eviction_ticks: 10,
            evict_local_sessions: true,
            ..SessionConfig::default()
        };
        let mut host = SessionManager::new(SessionRole::Server, config);
        let peer = host.attach_local(host_end);
        let mut rec = Recorder::default();
        host.poll(SimTick(5), &mut rec);

        assert!(host.evict_idle(SimTick(14)).is_empty());
        assert_eq!(host.evict_idle(SimTick(15)), vec![peer]);
        assert!(!host.is_connected(peer));

        host.poll(SimTick(16), &mut rec);
        assert_eq!(rec.disconnected, vec![(peer, DisconnectReason::Evicted)]);
    }

    #[test]
    fn quiet_local_sessions_stay_by_default() {
        let (host_end, _guest_end) = LoopbackHub::pair();
        let config = SessionConfig {
            idle_eviction_ticks: 10,
            ..SessionConfig::default()
        };
        let mut host = SessionManager::new(SessionRole::Server, config);
        let peer = host.attach_local(host_end);
        let mut rec = Recorder::default();
        host.poll(SimTick(0), &mut rec);

        assert!(host.evict_idle(SimTick(1_000)).is_empty());
        assert!(host.is_connected(peer));
    }

    #[test]
    fn peer_ids_are_never_reused() {
        let mut host = SessionManager::new(SessionRole::Server, SessionConfig::default());
        let (a, _) = LoopbackHub::pair();
        let first = host.attach_local(a);
        host.disconnect_peer(first, DisconnectReason::Requested("x".into()));
        host.poll(SimTick(1), &mut Recorder::default());
        let (b, _) = LoopbackHub::pair();
        let second = host.attach_local(b);
        assert!(second > first);
    }
}
