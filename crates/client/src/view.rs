//! Client-side view of the match, filled in by client-bound command handlers.

use anyhow::ensure;
use skirmish_core::{PeerId, SimTick};
use skirmish_net::protocol::{
    ChatBroadcast, EntityState, Notice, Pong, StateSnapshot, Welcome, SERVER_BOUND,
};
use skirmish_net::{compute_schema_hash, CommandStore, RegistrationError};
use tracing::{debug, info, warn};

/// Most chat lines kept in the view.
pub const CHAT_HISTORY: usize = 64;

/// Most pongs kept in the view.
pub const PONG_HISTORY: usize = 32;

/// Most host notices kept in the view.
pub const NOTICE_HISTORY: usize = 32;

fn push_bounded<T>(items: &mut Vec<T>, item: T, limit: usize) {
    if items.len() >= limit {
        items.drain(..=items.len() - limit);
    }
    items.push(item);
}

/// What the client knows about the match.
#[derive(Debug, Default, Clone)]
pub struct ClientView {
    welcome: Option<Welcome>,
    snapshot: Option<StateSnapshot>,
    chat: Vec<ChatBroadcast>,
    pongs: Vec<Pong>,
    notices: Vec<String>,
    schema_mismatch: bool,
}

impl ClientView {
    /// Welcome received from the host.
    pub fn welcome(&self) -> Option<&Welcome> {
        self.welcome.as_ref()
    }

    /// Id the host assigned to this client.
    pub fn local_peer(&self) -> Option<PeerId> {
        self.welcome.map(|w| w.peer)
    }

    /// Newest snapshot.
    pub fn snapshot(&self) -> Option<&StateSnapshot> {
        self.snapshot.as_ref()
    }

    /// Host tick of the newest snapshot.
    pub fn server_tick(&self) -> Option<SimTick> {
        self.snapshot.as_ref().map(|s| s.tick)
    }

    /// This client's own avatar in the newest snapshot.
    pub fn own_avatar(&self) -> Option<&EntityState> {
        let me = self.local_peer()?;
        self.snapshot.as_ref()?.entities.iter().find(|e| e.owner == me)
    }

    /// Chat history, oldest first.
    pub fn chat(&self) -> &[ChatBroadcast] {
        &self.chat
    }

    /// Most recent pongs, in arrival order.
    pub fn pongs(&self) -> &[Pong] {
        &self.pongs
    }

    /// Most recent notices from the host.
    pub fn notices(&self) -> &[String] {
        &self.notices
    }

    /// Whether the host speaks a different command schema.
    pub fn schema_mismatch(&self) -> bool {
        self.schema_mismatch
    }
}

/// Commands a client accepts from its host.
pub fn client_store() -> Result<CommandStore<ClientView>, RegistrationError> {
    Ok(CommandStore::builder("client")
        .register(|view: &mut ClientView, _peer: PeerId, cmd: Welcome| {
            let expected = compute_schema_hash(SERVER_BOUND.iter().copied());
            view.schema_mismatch = cmd.schema_hash != expected;
            if view.schema_mismatch {
                warn!(
                    host = format_args!("{:016x}", cmd.schema_hash),
                    local = format_args!("{expected:016x}"),
                    "Host command schema differs"
                );
            }
            info!(
                peer = %cmd.peer,
                tick = cmd.tick.0,
                tick_rate = cmd.tick_rate,
                "Welcomed by host"
            );
            view.welcome = Some(cmd);
            Ok(())
        })?
        .register(|view: &mut ClientView, _peer: PeerId, cmd: StateSnapshot| {
            if view.server_tick().is_some_and(|tick| tick >= cmd.tick) {
                debug!(tick = cmd.tick.0, "Ignoring stale snapshot");
                return Ok(());
            }
            view.snapshot = Some(cmd);
            Ok(())
        })?
        .register(|view: &mut ClientView, _peer: PeerId, cmd: ChatBroadcast| {
            ensure!(!cmd.text.is_empty(), "empty chat broadcast");
            push_bounded(&mut view.chat, cmd, CHAT_HISTORY);
            Ok(())
        })?
        .register(|view: &mut ClientView, _peer: PeerId, cmd: Pong| {
            push_bounded(&mut view.pongs, cmd, PONG_HISTORY);
            Ok(())
        })?
        .register(|view: &mut ClientView, _peer: PeerId, cmd: Notice| {
            info!(text = %cmd.text, "Host notice");
            push_bounded(&mut view.notices, cmd.text, NOTICE_HISTORY);
            Ok(())
        })?
        .build())
}
