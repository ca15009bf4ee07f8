#![warn(missing_docs)]
//! Match client: a client-role session manager plus the client-bound command table.

mod view;

use anyhow::{bail, Context, Result};
use skirmish_core::PeerId;
use skirmish_net::{
    Command, CommandStore, DisconnectReason, LoopbackEndpoint, LoopbackHub, NetworkDriver, Packet,
    PeerInfo, PollStats, SessionConfig, SessionManager, SessionObserver, SessionRole,
    TransportConfig,
};
use skirmish_server::{HostFrame, HostSettings, MatchHost};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, info, warn};

pub use view::{client_store, ClientView, CHAT_HISTORY, NOTICE_HISTORY, PONG_HISTORY};

#[derive(Default)]
struct Events {
    connected: Option<PeerId>,
    disconnected: Option<DisconnectReason>,
    packets: Vec<(PeerId, Packet)>,
}

impl SessionObserver for Events {
    fn on_connected(&mut self, peer: &PeerInfo) {
        self.connected = Some(peer.id);
    }

    fn on_disconnected(&mut self, _peer: &PeerInfo, reason: &DisconnectReason) {
        self.disconnected = Some(reason.clone());
    }

    fn on_incoming_packet(&mut self, peer: PeerId, packet: Packet) {
        self.packets.push((peer, packet));
    }
}

/// One connection to a match host, remote or in-process.
pub struct MatchClient {
    sessions: SessionManager,
    server: Option<PeerId>,
    commands: CommandStore<ClientView>,
    view: ClientView,
    closed: Option<DisconnectReason>,
    polls: u64,
}

impl MatchClient {
    fn with_sessions(sessions: SessionManager) -> Result<Self> {
        Ok(Self {
            sessions,
            server: None,
            commands: client_store().context("Failed to build client command table")?,
            view: ClientView::default(),
            closed: None,
            polls: 0,
        })
    }

    /// Connect to a remote host. The handshake completes in the background.
    pub fn network(server_addr: SocketAddr, config: &TransportConfig) -> Result<Self> {
        let driver = NetworkDriver::connect(server_addr, config)
            .with_context(|| format!("Failed to connect to {server_addr}"))?;
        let mut sessions = SessionManager::new(SessionRole::Client, SessionConfig::default());
        sessions.attach_network(driver);
        info!(%server_addr, "Connecting to host");
        Self::with_sessions(sessions)
    }

    /// Join through the guest end of a loopback link.
    pub fn local(endpoint: LoopbackEndpoint) -> Result<Self> {
        let mut sessions = SessionManager::new(SessionRole::Client, SessionConfig::default());
        sessions.attach_local(endpoint);
        Self::with_sessions(sessions)
    }

    /// Send a server-bound command.
    pub fn send<C: Command>(&mut self, cmd: &C) -> Result<()> {
        let Some(server) = self.server else {
            bail!("not connected to a host");
        };
        let packet = Packet::from_command(cmd)?;
        self.sessions.send_packet(server, packet)?;
        Ok(())
    }

    /// Drain session events and apply host commands to the view.
    pub fn update(&mut self) -> PollStats {
        self.polls += 1;
        let mut events = Events::default();
        let stats = self
            .sessions
            .poll(skirmish_core::SimTick(self.polls), &mut events);

        if let Some(peer) = events.connected {
            debug!(%peer, "Host session up");
            self.server = Some(peer);
        }
        for (peer, packet) in events.packets {
            if let Err(err) = self.commands.dispatch(&mut self.view, peer, &packet) {
                if err.is_session_fatal() {
                    warn!(%peer, %err, "Host sent an undecodable command");
                    self.sessions
                        .disconnect_peer(peer, DisconnectReason::Fault(err.to_string()));
                } else {
                    debug!(%peer, %err, "Command rejected");
                }
            }
        }
        if self.view.schema_mismatch() {
            if let Some(server) = self.server {
                if self.sessions.is_connected(server) {
                    self.sessions.disconnect_peer(
                        server,
                        DisconnectReason::Requested("command schema mismatch".to_string()),
                    );
                }
            }
        }
        if let Some(reason) = events.disconnected {
            info!(%reason, "Disconnected from host");
            self.server = None;
            self.closed = Some(reason);
        }
        stats
    }

    /// Leave the match.
    pub fn disconnect(&mut self, reason: &str) {
        if let Some(server) = self.server {
            self.sessions
                .disconnect_peer(server, DisconnectReason::Requested(reason.to_string()));
        }
    }

    /// What the client knows about the match.
    pub fn view(&self) -> &ClientView {
        &self.view
    }

    /// Whether the host session is up.
    pub fn is_connected(&self) -> bool {
        self.server.is_some_and(|peer| self.sessions.is_connected(peer))
    }

    /// Why the host session ended, once it has.
    pub fn disconnect_reason(&self) -> Option<&DisconnectReason> {
        self.closed.as_ref()
    }
}

/// A host and a client sharing one process over a loopback link.
pub struct Client {
    host: MatchHost,
    client: MatchClient,
}

impl Client {
    /// Start an in-process match with default settings.
    pub fn singleplayer() -> Result<Self> {
        Self::with_settings(HostSettings::default())
    }

    /// Start an in-process match.
    pub fn with_settings(settings: HostSettings) -> Result<Self> {
        let mut host = MatchHost::new(settings)?;
        let (host_end, guest_end) = LoopbackHub::pair();
        host.attach_local(host_end);
        let client = MatchClient::local(guest_end)?;
        Ok(Self { host, client })
    }

    /// Advance the host by `elapsed`, then let the client catch up.
    pub fn frame(&mut self, elapsed: Duration) -> HostFrame {
        let frame = self.host.update(elapsed);
        self.client.update();
        frame
    }

    /// Embedded host.
    pub fn host(&self) -> &MatchHost {
        &self.host
    }

    /// Embedded host, mutable.
    pub fn host_mut(&mut self) -> &mut MatchHost {
        &mut self.host
    }

    /// Client half.
    pub fn client(&self) -> &MatchClient {
        &self.client
    }

    /// Client half, mutable.
    pub fn client_mut(&mut self) -> &mut MatchClient {
        &mut self.client
    }
}
