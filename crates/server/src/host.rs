//! Match host: pumps sessions into the fixed-step match.

use crate::commands::{editor_store, server_store};
use crate::shared_match::{MatchConfig, Outgoing, SharedMatch, StepHooks};
use crate::snapshot::SnapshotSchedule;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use skirmish_core::{PeerId, SimTick};
use skirmish_net::protocol::{Notice, Welcome, MAX_REASON_LEN};
use skirmish_net::{
    BridgeKind, CommandStore, ConnectionState, DispatchError, DisconnectReason, LoopbackEndpoint,
    NetworkDriver, Packet, PacketFlags, PeerInfo, PollStats, SessionConfig, SessionManager,
    SessionObserver, SessionRole, TransportConfig,
};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Everything needed to start a host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSettings {
    /// Simulation parameters.
    #[serde(rename = "match")]
    pub match_config: MatchConfig,
    /// Session limits.
    pub session: SessionConfig,
    /// QUIC tuning.
    pub transport: TransportConfig,
}

/// What one [`MatchHost::update`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostFrame {
    /// Simulation steps run.
    pub steps: u32,
    /// Session events delivered.
    pub poll: PollStats,
    /// Commands that ran to completion.
    pub dispatched: usize,
    /// Commands rejected by their handler or by decoding.
    pub rejected: usize,
    /// Snapshots broadcast.
    pub snapshots: usize,
    /// Sessions evicted for inactivity.
    pub evicted: usize,
}

#[derive(Debug)]
struct Inbound {
    peer: PeerId,
    kind: BridgeKind,
    packet: Packet,
}

#[derive(Debug)]
enum Lifecycle {
    Joined(PeerInfo),
    Left(PeerInfo, DisconnectReason),
}

#[derive(Default)]
struct Inbox {
    lifecycle: Vec<Lifecycle>,
    packets: Vec<(PeerId, Packet)>,
}

impl SessionObserver for Inbox {
    fn on_connected(&mut self, peer: &PeerInfo) {
        self.lifecycle.push(Lifecycle::Joined(peer.clone()));
    }

    fn on_disconnected(&mut self, peer: &PeerInfo, reason: &DisconnectReason) {
        self.lifecycle.push(Lifecycle::Left(peer.clone(), reason.clone()));
    }

    fn on_incoming_packet(&mut self, peer: PeerId, packet: Packet) {
        self.packets.push((peer, packet));
    }
}

/// Authoritative host for one match.
///
/// Received commands wait until the next step boundary; handlers never run
/// outside [`SharedMatch::step`].
pub struct MatchHost {
    world: SharedMatch,
    sessions: SessionManager,
    server_commands: CommandStore<SharedMatch>,
    editor_commands: CommandStore<SharedMatch>,
    snapshots: SnapshotSchedule,
    inbound: VecDeque<Inbound>,
    transport: TransportConfig,
}

impl MatchHost {
    /// Build the match and its command tables. No transport is attached yet.
    pub fn new(settings: HostSettings) -> Result<Self> {
        let snapshots = SnapshotSchedule::new(settings.match_config.snapshot_interval);
        let world = SharedMatch::new(settings.match_config)?;
        let server_commands = server_store().context("Failed to build server command table")?;
        let editor_commands = editor_store().context("Failed to build editor command table")?;
        info!(
            tick_rate = world.config().tick_rate,
            layers = world.terrain().len(),
            schema = format_args!("{:016x}", server_commands.schema_hash()),
            "Match created"
        );
        Ok(Self {
            world,
            sessions: SessionManager::new(SessionRole::Server, settings.session),
            server_commands,
            editor_commands,
            snapshots,
            inbound: VecDeque::new(),
            transport: settings.transport,
        })
    }

    /// Accept remote players on `addr`. Returns the bound address.
    pub fn listen(&mut self, addr: SocketAddr) -> Result<SocketAddr> {
        let driver = NetworkDriver::listen(addr, &self.transport)
            .with_context(|| format!("Failed to listen on {addr}"))?;
        let bound = driver.local_addr();
        self.attach_network(driver);
        info!(%bound, "Accepting remote players");
        Ok(bound)
    }

    /// Take over an already listening driver.
    pub fn attach_network(&mut self, driver: NetworkDriver) {
        self.sessions.attach_network(driver);
    }

    /// Adopt the host end of a loopback link. The session joins on the next update.
    pub fn attach_local(&mut self, endpoint: LoopbackEndpoint) -> PeerId {
        self.sessions.attach_local(endpoint)
    }

    /// Address remote players connect to.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.sessions.network_addr()
    }

    /// Next tick to be simulated.
    pub fn tick(&self) -> SimTick {
        self.world.tick()
    }

    /// Match state.
    pub fn world(&self) -> &SharedMatch {
        &self.world
    }

    /// Mutable match state, for scheduling timers from outside a step.
    pub fn world_mut(&mut self) -> &mut SharedMatch {
        &mut self.world
    }

    /// Session table.
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Commands received but not yet applied.
    pub fn queued_commands(&self) -> usize {
        self.inbound.len()
    }

    /// One loop iteration: drain sessions, then advance the match by `elapsed`.
    #[instrument(skip(self), fields(tick = self.world.tick().0))]
    pub fn update(&mut self, elapsed: Duration) -> HostFrame {
        let mut frame = HostFrame::default();

        let mut inbox = Inbox::default();
        frame.poll = self.sessions.poll(self.world.tick(), &mut inbox);
        for event in inbox.lifecycle {
            match event {
                Lifecycle::Joined(peer) => self.on_joined(&peer),
                Lifecycle::Left(peer, reason) => self.on_left(&peer, &reason),
            }
        }
        for (peer, packet) in inbox.packets {
            let kind = self
                .sessions
                .peer_info(peer)
                .map_or(BridgeKind::Network, |info| info.kind);
            self.inbound.push_back(Inbound { peer, kind, packet });
        }

        frame.evicted = self.sessions.evict_idle(self.world.tick()).len();
        flush_outbox(&mut self.world, &mut self.sessions);

        let mut driver = StepDriver {
            sessions: &mut self.sessions,
            server_commands: &self.server_commands,
            editor_commands: &self.editor_commands,
            snapshots: &mut self.snapshots,
            inbound: &mut self.inbound,
            frame: &mut frame,
        };
        let steps = self.world.update(elapsed, &mut driver);
        frame.steps = steps;
        frame
    }

    /// Disconnect every session.
    pub fn shutdown(&mut self, reason: &str) {
        info!(reason, sessions = self.sessions.len(), "Shutting down match");
        self.sessions.disconnect_all(reason);
    }

    fn on_joined(&mut self, peer: &PeerInfo) {
        match self.world.spawn_avatar(peer.id, 0) {
            Ok(at) => {
                info!(
                    peer = %peer.id,
                    kind = ?peer.kind,
                    remote = ?peer.remote_addr,
                    x = at.x,
                    y = at.y,
                    "Player joined"
                );
                let welcome = Welcome {
                    peer: peer.id,
                    tick: self.world.tick(),
                    tick_rate: self.world.config().tick_rate,
                    layer_count: u8::try_from(self.world.terrain().len()).unwrap_or(u8::MAX),
                    schema_hash: self.server_commands.schema_hash(),
                };
                if let Err(err) = self.world.send_command(peer.id, &welcome) {
                    warn!(peer = %peer.id, %err, "Failed to encode welcome");
                }
                self.snapshots.force_next();
            }
            Err(err) => {
                let error = format!("{err:#}");
                warn!(peer = %peer.id, %error, "Cannot place player");
                self.sessions
                    .disconnect_peer(peer.id, DisconnectReason::Fault(error));
            }
        }
    }

    fn on_left(&mut self, peer: &PeerInfo, reason: &DisconnectReason) {
        self.world.despawn_avatar(peer.id);
        self.inbound.retain(|cmd| cmd.peer != peer.id);
        if reason.is_graceful() {
            info!(peer = %peer.id, %reason, "Player left");
        } else {
            warn!(peer = %peer.id, %reason, "Player dropped");
        }
    }
}

/// Step hooks borrowing the host's session side while the match is stepped.
struct StepDriver<'a> {
    sessions: &'a mut SessionManager,
    server_commands: &'a CommandStore<SharedMatch>,
    editor_commands: &'a CommandStore<SharedMatch>,
    snapshots: &'a mut SnapshotSchedule,
    inbound: &'a mut VecDeque<Inbound>,
    frame: &'a mut HostFrame,
}

impl StepDriver<'_> {
    fn store_for(&self, cmd: &Inbound) -> &CommandStore<SharedMatch> {
        if cmd.kind == BridgeKind::Local && self.editor_commands.contains(cmd.packet.opcode) {
            self.editor_commands
        } else {
            self.server_commands
        }
    }

    fn reject(&mut self, world: &mut SharedMatch, peer: PeerId, err: DispatchError) {
        self.frame.rejected += 1;
        let text = clip(&err.to_string(), MAX_REASON_LEN);
        if err.is_session_fatal() {
            warn!(%peer, opcode = err.opcode(), %err, "Dropping misbehaving session");
            self.sessions.disconnect_peer(peer, DisconnectReason::Fault(text));
            return;
        }
        debug!(%peer, opcode = err.opcode(), %err, "Command rejected");
        if let Err(err) = world.send_command(peer, &Notice { text }) {
            warn!(%peer, %err, "Failed to encode notice");
        }
    }
}

impl StepHooks for StepDriver<'_> {
    fn before_step(&mut self, world: &mut SharedMatch) {
        while let Some(cmd) = self.inbound.pop_front() {
            if self.sessions.connection_state(cmd.peer) != Some(ConnectionState::Connected) {
                continue;
            }
            let store = self.store_for(&cmd);
            match store.dispatch(world, cmd.peer, &cmd.packet) {
                Ok(()) => self.frame.dispatched += 1,
                Err(err) => self.reject(world, cmd.peer, err),
            }
        }
        flush_outbox(world, self.sessions);
    }

    fn after_step(&mut self, world: &mut SharedMatch) {
        if !self.sessions.is_empty() && self.snapshots.should_send(world.tick()) {
            match snapshot_packet(world) {
                Ok(packet) => {
                    world.broadcast(packet);
                    self.frame.snapshots += 1;
                }
                Err(err) => warn!(%err, "Failed to encode snapshot"),
            }
        }
        flush_outbox(world, self.sessions);
    }
}

/// Snapshots go out unreliably; ones too large for a datagram fall back to a stream.
fn snapshot_packet(world: &SharedMatch) -> Result<Packet, skirmish_net::CommandError> {
    let snapshot = world.snapshot();
    let packet = Packet::from_command(&snapshot)?;
    if packet.check_limits().is_ok() {
        return Ok(packet);
    }
    debug!(entities = snapshot.entities.len(), "Snapshot exceeds datagram size");
    Packet::from_command_with_flags(&snapshot, PacketFlags::RELIABLE_ORDERED)
}

fn flush_outbox(world: &mut SharedMatch, sessions: &mut SessionManager) {
    for out in world.drain_outbox() {
        match out {
            Outgoing::To { peer, packet } => {
                if let Err(err) = sessions.send_packet(peer, packet) {
                    debug!(%peer, %err, "Dropped outgoing packet");
                }
            }
            Outgoing::Broadcast(packet) => {
                sessions.broadcast(&packet);
            }
            Outgoing::Disconnect { peer, reason } => sessions.disconnect_peer(peer, reason),
        }
    }
}

fn clip(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip_respects_char_boundaries() {
        assert_eq!(clip("abc", 8), "abc");
        assert_eq!(clip("héllo", 2), "h");
        assert_eq!(clip("héllo", 3), "hé");
    }

    #[test]
    fn settings_parse_with_defaults() {
        let settings: HostSettings =
            serde_json::from_str(r#"{"match": {"tick_rate": 30}}"#).unwrap();
        assert_eq!(settings.match_config.tick_rate, 30);
        assert_eq!(settings.session, SessionConfig::default());
    }

    #[test]
    fn host_without_sessions_still_steps() {
        let mut host = MatchHost::new(HostSettings::default()).unwrap();
        let step = host.world().step_duration();
        let frame = host.update(step * 2);
        assert_eq!(frame.steps, 2);
        assert_eq!(frame.snapshots, 0);
        assert_eq!(host.tick(), SimTick(2));
    }
}
