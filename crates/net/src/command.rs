//! Typed command tables.
//!
//! A [`CommandStore`] maps opcodes to a decoder plus handler for one direction of
//! traffic. Stores are assembled once through [`CommandStoreBuilder`] and are
//! immutable afterwards, so a built store can be shared freely across threads.

use crate::channel::ChannelId;
use crate::error::{CommandError, DispatchError, RegistrationError};
use crate::packet::{compute_schema_hash, Opcode, Packet, PacketFlags};
use serde::de::DeserializeOwned;
use serde::Serialize;
use skirmish_core::PeerId;
use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use tracing::trace;

/// A message type with a fixed opcode and delivery policy.
pub trait Command: Serialize + DeserializeOwned + Send + 'static {
    /// Opcode on the wire; unique within every store the command joins.
    const OPCODE: Opcode;
    /// Human readable name used in logs and the schema hash.
    const NAME: &'static str;
    /// Channel the command is sent on.
    const CHANNEL: ChannelId = ChannelId::CONTROL;
    /// Delivery guarantees.
    const FLAGS: PacketFlags = PacketFlags::RELIABLE_ORDERED;

    /// Reject decoded values that are structurally valid but out of bounds.
    fn verify(&self) -> Result<(), &'static str> {
        Ok(())
    }
}

impl Packet {
    /// Encode a command into a packet without consulting a store.
    pub fn from_command<C: Command>(cmd: &C) -> Result<Packet, CommandError> {
        Self::from_command_with_flags(cmd, C::FLAGS)
    }

    /// Encode a command, overriding its default delivery flags.
    pub fn from_command_with_flags<C: Command>(
        cmd: &C,
        flags: PacketFlags,
    ) -> Result<Packet, CommandError> {
        let payload = postcard::to_allocvec(cmd).map_err(|err| CommandError::Encode {
            name: C::NAME,
            reason: err.to_string(),
        })?;
        let packet = Packet::new(C::OPCODE, C::CHANNEL, flags, payload);
        packet.check_limits()?;
        Ok(packet)
    }
}

/// Decode a command payload, rejecting trailing bytes and failed verification.
pub fn decode_command<C: Command>(payload: &[u8]) -> Result<C, DispatchError> {
    let malformed = |reason: String| DispatchError::MalformedPayload {
        opcode: C::OPCODE,
        name: C::NAME,
        reason,
    };

    let (cmd, rest) =
        postcard::take_from_bytes::<C>(payload).map_err(|err| malformed(err.to_string()))?;
    if !rest.is_empty() {
        return Err(malformed(format!("{} trailing bytes", rest.len())));
    }
    cmd.verify().map_err(|reason| malformed(reason.to_string()))?;
    Ok(cmd)
}

type ErasedHandler<Ctx> =
    Box<dyn Fn(&mut Ctx, PeerId, &[u8]) -> Result<(), DispatchError> + Send + Sync>;

struct Entry<Ctx> {
    name: &'static str,
    handler: ErasedHandler<Ctx>,
}

/// Collects command registrations for one store.
pub struct CommandStoreBuilder<Ctx> {
    label: &'static str,
    entries: BTreeMap<Opcode, Entry<Ctx>>,
    types: HashMap<TypeId, Opcode>,
}

impl<Ctx: 'static> CommandStoreBuilder<Ctx> {
    /// Start an empty table. `label` appears in errors and logs.
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            entries: BTreeMap::new(),
            types: HashMap::new(),
        }
    }

    /// Register `C` with its handler.
    ///
    /// Fails if the opcode is already taken or `C` is already registered.
    pub fn register<C, H>(mut self, handler: H) -> Result<Self, RegistrationError>
    where
        C: Command,
        H: Fn(&mut Ctx, PeerId, C) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        if self.types.contains_key(&TypeId::of::<C>()) {
            return Err(RegistrationError::DuplicateType {
                store: self.label,
                name: C::NAME,
            });
        }
        if let Some(existing) = self.entries.get(&C::OPCODE) {
            return Err(RegistrationError::DuplicateOpcode {
                store: self.label,
                opcode: C::OPCODE,
                existing: existing.name,
                attempted: C::NAME,
            });
        }

        let erased: ErasedHandler<Ctx> =
            Box::new(move |ctx: &mut Ctx, peer: PeerId, payload: &[u8]| {
                let cmd = decode_command::<C>(payload)?;
                match panic::catch_unwind(AssertUnwindSafe(|| handler(ctx, peer, cmd))) {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(source)) => Err(DispatchError::HandlerFailure {
                        opcode: C::OPCODE,
                        name: C::NAME,
                        source,
                    }),
                    Err(panic) => Err(DispatchError::HandlerFailure {
                        opcode: C::OPCODE,
                        name: C::NAME,
                        source: anyhow::anyhow!("handler panicked: {}", panic_message(&*panic)),
                    }),
                }
            });

        self.types.insert(TypeId::of::<C>(), C::OPCODE);
        self.entries.insert(
            C::OPCODE,
            Entry {
                name: C::NAME,
                handler: erased,
            },
        );
        Ok(self)
    }

    /// Freeze the table.
    pub fn build(self) -> CommandStore<Ctx> {
        let schema_hash = compute_schema_hash(self.entries.iter().map(|(op, e)| (*op, e.name)));
        CommandStore {
            label: self.label,
            entries: self.entries,
            types: self.types,
            schema_hash,
        }
    }
}

/// Immutable opcode table for one direction of traffic.
pub struct CommandStore<Ctx> {
    label: &'static str,
    entries: BTreeMap<Opcode, Entry<Ctx>>,
    types: HashMap<TypeId, Opcode>,
    schema_hash: u64,
}

impl<Ctx: 'static> CommandStore<Ctx> {
    /// Shorthand for [`CommandStoreBuilder::new`].
    pub fn builder(label: &'static str) -> CommandStoreBuilder<Ctx> {
        CommandStoreBuilder::new(label)
    }

    /// Encode `cmd` into a packet. The command must be part of this store.
    pub fn build_packet<C: Command>(&self, cmd: &C) -> Result<Packet, CommandError> {
        if !self.types.contains_key(&TypeId::of::<C>()) {
            return Err(CommandError::Unregistered {
                store: self.label,
                name: C::NAME,
            });
        }
        Packet::from_command(cmd)
    }

    /// Decode `packet` and run its handler against `ctx`.
    ///
    /// Handler errors and panics come back as [`DispatchError::HandlerFailure`];
    /// nothing escapes to the caller's stack.
    pub fn dispatch(
        &self,
        ctx: &mut Ctx,
        peer: PeerId,
        packet: &Packet,
    ) -> Result<(), DispatchError> {
        let entry = self
            .entries
            .get(&packet.opcode)
            .ok_or(DispatchError::UnknownCommand {
                store: self.label,
                opcode: packet.opcode,
            })?;

        trace!(store = self.label, %peer, command = entry.name, "dispatch");
        (entry.handler)(ctx, peer, &packet.payload)
    }
}

impl<Ctx> CommandStore<Ctx> {
    /// Whether `opcode` is registered.
    pub fn contains(&self, opcode: Opcode) -> bool {
        self.entries.contains_key(&opcode)
    }

    /// Name registered for `opcode`.
    pub fn name_of(&self, opcode: Opcode) -> Option<&'static str> {
        self.entries.get(&opcode).map(|e| e.name)
    }

    /// Store label.
    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Number of registered commands.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no commands are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered opcodes in ascending order.
    pub fn opcodes(&self) -> impl Iterator<Item = Opcode> + '_ {
        self.entries.keys().copied()
    }

    /// Hash of the opcode table, for compatibility checks between builds.
    pub fn schema_hash(&self) -> u64 {
        self.schema_hash
    }
}

impl<Ctx> fmt::Debug for CommandStore<Ctx> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandStore")
            .field("label", &self.label)
            .field(
                "commands",
                &self.entries.iter().map(|(op, e)| (*op, e.name)).collect::<Vec<_>>(),
            )
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Nudge {
        dx: i32,
    }

    impl Command for Nudge {
        const OPCODE: Opcode = 10;
        const NAME: &'static str = "Nudge";
        const CHANNEL: ChannelId = ChannelId::INPUT;

        fn verify(&self) -> Result<(), &'static str> {
            if self.dx.abs() > 100 {
                return Err("nudge too large");
            }
            Ok(())
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Shout(String);

    impl Command for Shout {
        const OPCODE: Opcode = 11;
        const NAME: &'static str = "Shout";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Impostor;

    impl Command for Impostor {
        const OPCODE: Opcode = 10;
        const NAME: &'static str = "Impostor";
    }

    #[derive(Default)]
    struct Log {
        seen: Vec<(PeerId, i32)>,
    }

    fn store() -> CommandStore<Log> {
        CommandStore::builder("test")
            .register(|log: &mut Log, peer, cmd: Nudge| {
                log.seen.push((peer, cmd.dx));
                Ok(())
            })
            .unwrap()
            .register(|_: &mut Log, _, cmd: Shout| {
                if cmd.0.is_empty() {
                    anyhow::bail!("empty shout");
                }
                if cmd.0 == "boom" {
                    panic!("shout exploded");
                }
                Ok(())
            })
            .unwrap()
            .build()
    }

    #[test]
    fn dispatch_invokes_registered_handler_once() {
        let store = store();
        let mut log = Log::default();
        let packet = store.build_packet(&Nudge { dx: -4 }).unwrap();
        assert_eq!(packet.channel, ChannelId::INPUT);

        store.dispatch(&mut log, PeerId(7), &packet).unwrap();
        assert_eq!(log.seen, vec![(PeerId(7), -4)]);
    }

    #[test]
    fn duplicate_opcode_is_rejected_at_registration() {
        let err = CommandStore::<Log>::builder("test")
            .register(|_: &mut Log, _, _: Nudge| Ok(()))
            .unwrap()
            .register(|_: &mut Log, _, _: Impostor| Ok(()))
            .err()
            .unwrap();
        assert_eq!(
            err,
            RegistrationError::DuplicateOpcode {
                store: "test",
                opcode: 10,
                existing: "Nudge",
                attempted: "Impostor",
            }
        );
    }

    #[test]
    fn duplicate_type_is_rejected_at_registration() {
        let err = CommandStore::<Log>::builder("test")
            .register(|_: &mut Log, _, _: Nudge| Ok(()))
            .unwrap()
            .register(|_: &mut Log, _, _: Nudge| Ok(()))
            .err()
            .unwrap();
        assert!(matches!(err, RegistrationError::DuplicateType { name: "Nudge", .. }));
    }

    #[test]
    fn unknown_opcode_fails_closed() {
        let store = store();
        let mut log = Log::default();
        let packet = Packet::new(99, ChannelId::INPUT, PacketFlags::RELIABLE_ORDERED, vec![]);
        let err = store.dispatch(&mut log, PeerId(1), &packet).unwrap_err();
        assert!(matches!(err, DispatchError::UnknownCommand { opcode: 99, .. }));
        assert!(err.is_session_fatal());
        assert!(log.seen.is_empty());
    }

    #[test]
    fn truncated_and_padded_payloads_are_malformed() {
        let store = store();
        let mut log = Log::default();
        let mut packet = store.build_packet(&Shout("hello".into())).unwrap();
        packet.payload.truncate(2);
        let err = store.dispatch(&mut log, PeerId(1), &packet).unwrap_err();
        assert!(matches!(err, DispatchError::MalformedPayload { name: "Shout", .. }));
        assert!(err.is_session_fatal());

        let mut padded = store.build_packet(&Nudge { dx: 1 }).unwrap();
        padded.payload.push(0);
        let err = store.dispatch(&mut log, PeerId(1), &padded).unwrap_err();
        assert!(matches!(err, DispatchError::MalformedPayload { .. }));
        assert!(log.seen.is_empty());
    }

    #[test]
    fn failed_verification_is_malformed() {
        let store = store();
        let mut log = Log::default();
        let packet = Packet::from_command(&Nudge { dx: 500 }).unwrap();
        let err = store.dispatch(&mut log, PeerId(1), &packet).unwrap_err();
        assert!(matches!(err, DispatchError::MalformedPayload { .. }));
        assert!(log.seen.is_empty());
    }

    #[test]
    fn handler_errors_and_panics_are_contained() {
        let store = store();
        let mut log = Log::default();

        let err = store
            .dispatch(&mut log, PeerId(1), &store.build_packet(&Shout(String::new())).unwrap())
            .unwrap_err();
        assert!(matches!(err, DispatchError::HandlerFailure { name: "Shout", .. }));
        assert!(!err.is_session_fatal());

        let err = store
            .dispatch(&mut log, PeerId(1), &store.build_packet(&Shout("boom".into())).unwrap())
            .unwrap_err();
        assert!(err.to_string().contains("shout exploded"));
    }

    #[test]
    fn build_packet_requires_registration() {
        let store = store();
        let err = store.build_packet(&Impostor).unwrap_err();
        assert!(matches!(err, CommandError::Unregistered { name: "Impostor", .. }));
    }

    #[test]
    fn introspection_reports_table() {
        let store = store();
        assert_eq!(store.len(), 2);
        assert!(store.contains(10));
        assert_eq!(store.name_of(11), Some("Shout"));
        assert_eq!(store.opcodes().collect::<Vec<_>>(), vec![10, 11]);
        assert_eq!(
            store.schema_hash(),
            compute_schema_hash([(10, "Nudge"), (11, "Shout")])
        );
    }
}
