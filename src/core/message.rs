//! The closed message protocol between hub, relay and module processes.
//!
//! Every message is a fixed-capacity record with a leading type discriminant
//! and the sender's id, rank and per-sender sequence number. The fixed
//! encoding carries no internal length prefix so a co-located receiver can
//! read it in place; the stream transport adds an external length frame
//! (see [`crate::core::codec`]). Bulk bytes travel out of band as a
//! [`Payload`] referenced by a 64-bit id in the triggering message.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::object::ObjectId;
use crate::core::parameter::{ParameterType, ParameterValue};
use crate::{Error, Result};

/// Fixed capacity of an encoded message record.
pub const MESSAGE_SIZE: usize = 1024;

/// Module/peer identifier with the reserved control ids of the session.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ModuleId(pub i32);

impl ModuleId {
    pub const INVALID: ModuleId = ModuleId(0);
    /// Session-wide parameters and state.
    pub const SESSION: ModuleId = ModuleId(-1);
    /// Master is broadcasting to all modules and hubs.
    pub const BROADCAST: ModuleId = ModuleId(-2);
    /// Send to master for re-broadcasting.
    pub const FOR_BROADCAST: ModuleId = ModuleId(-3);
    pub const UI: ModuleId = ModuleId(-5);
    pub const LOCAL_MANAGER: ModuleId = ModuleId(-6);
    pub const LOCAL_HUB: ModuleId = ModuleId(-7);
    /// Ids below this denote slave hubs.
    pub const MASTER_HUB: ModuleId = ModuleId(-8);
    /// First id handed out to spawned modules.
    pub const MODULE_BASE: ModuleId = ModuleId(1);

    pub fn is_module(&self) -> bool {
        self.0 >= Self::MODULE_BASE.0
    }

    pub fn is_hub(&self) -> bool {
        self.0 <= Self::MASTER_HUB.0
    }
}

impl std::fmt::Display for ModuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// What kind of peer is identifying itself on a fresh connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerKind {
    Hub,
    Manager,
    Module,
    Ui,
}

/// Direction of a module port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortKind {
    Input,
    Output,
}

/// Severity of diagnostic text forwarded to the controlling UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TextKind {
    Info,
    Warning,
    Error,
    Cerr,
}

/// Progress marker of a module's execution generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecStage {
    Start,
    Iteration,
    Finish,
}

/// Outcome the coordinator broadcasts when it releases a barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BarrierStatus {
    Ok,
    ParticipantLost,
}

/// Remote file query commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileCommand {
    Stat,
    ReadDirectory,
    ReadFile,
}

/// The closed set of protocol messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MessageKind {
    // session / topology
    Identify { kind: PeerKind, session: String },
    AddHub { hub: ModuleId, name: String, address: String, port: u16 },
    RemoveHub { hub: ModuleId },
    SetId { id: ModuleId },

    // lifecycle
    Spawn { hub: ModuleId, name: String, spawn_id: ModuleId },
    Kill { module: ModuleId },
    Quit,
    Started { name: String },
    ModuleExit { module: ModuleId, crashed: bool },
    Busy { module: ModuleId },
    Idle { module: ModuleId },

    // pipeline topology
    AddPort { name: String, kind: PortKind },
    RemovePort { name: String },
    Connect { from_id: ModuleId, from_port: String, to_id: ModuleId, to_port: String },
    Disconnect { from_id: ModuleId, from_port: String, to_id: ModuleId, to_port: String },

    // parameters
    AddParameter { name: String, description: String, param_type: ParameterType },
    SetParameter { module: ModuleId, name: String, value: ParameterValue },
    SetParameterChoices { name: String, choices: Vec<String> },

    // execution
    Execute { module: ModuleId, generation: i32 },
    CancelExecute { module: ModuleId },
    ExecutionProgress { module: ModuleId, stage: ExecStage },

    // data flow; bulk object records travel as the out-of-band payload
    AddObject { sender_port: String, dest_port: String, object_id: ObjectId, timestep: i32, block: i32 },
    AddObjectCompleted { object_id: ObjectId, orig_sender: ModuleId },
    RequestObject { object_id: ObjectId },
    SendObject { object_id: ObjectId },
    DataTransferState { transferring: u32 },

    // synchronization
    Barrier { uuid: Uuid, reason: String },
    BarrierReached { uuid: Uuid, status: BarrierStatus },

    // diagnostics
    SendText { kind: TextKind, text: String },
    Ping { character: char },
    Pong { character: char, module: ModuleId },

    // remote I/O
    RequestTunnel { listen_port: u16, dest_host: String, dest_port: u16 },
    FileQuery { id: u32, module: ModuleId, path: String, command: FileCommand },
    FileQueryResult { id: u32, ok: bool },
}

/// A message plus its routing envelope. Every sender stamps its id, rank and
/// a monotonically increasing sequence so receivers can detect reordering
/// and duplication across unreliable hops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub sender: ModuleId,
    pub rank: i32,
    pub seq: u64,
    pub dest: ModuleId,
    /// Out-of-band payload referenced by this message, if any.
    pub payload: Option<u64>,
    pub kind: MessageKind,
}

impl Envelope {
    pub fn new(sender: ModuleId, rank: i32, kind: MessageKind) -> Self {
        Self {
            sender,
            rank,
            seq: 0,
            dest: ModuleId::BROADCAST,
            payload: None,
            kind,
        }
    }

    pub fn to(mut self, dest: ModuleId) -> Self {
        self.dest = dest;
        self
    }

    pub fn with_payload(mut self, payload_id: u64) -> Self {
        self.payload = Some(payload_id);
        self
    }
}

/// Fixed-layout encoded message record.
#[derive(Clone)]
pub struct Buffer {
    bytes: [u8; MESSAGE_SIZE],
}

impl Buffer {
    /// Encode an envelope; fails when the body exceeds the fixed capacity.
    pub fn encode(envelope: &Envelope) -> Result<Self> {
        let body = bincode::serialize(envelope)?;
        if body.len() > MESSAGE_SIZE {
            return Err(Error::Protocol(format!(
                "message too large: {} > {} bytes",
                body.len(),
                MESSAGE_SIZE
            )));
        }
        let mut bytes = [0u8; MESSAGE_SIZE];
        bytes[..body.len()].copy_from_slice(&body);
        Ok(Self { bytes })
    }

    /// Decode the record back into an envelope; trailing padding is ignored.
    pub fn decode(&self) -> Result<Envelope> {
        Ok(bincode::deserialize(&self.bytes)?)
    }

    pub fn as_bytes(&self) -> &[u8; MESSAGE_SIZE] {
        &self.bytes
    }

    pub fn from_bytes(bytes: [u8; MESSAGE_SIZE]) -> Self {
        Self { bytes }
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.decode() {
            Ok(env) => write!(f, "Buffer({:?})", env.kind),
            Err(_) => write!(f, "Buffer(<malformed>)"),
        }
    }
}

/// Out-of-band bulk bytes referenced from a message by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub id: u64,
    pub bytes: Vec<u8>,
}

impl Payload {
    pub fn new(bytes: Vec<u8>) -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            bytes,
        }
    }
}

/// Stamps outgoing envelopes with this sender's sequence numbers.
#[derive(Debug, Default)]
pub struct Sequencer {
    next: AtomicU64,
}

impl Sequencer {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn stamp(&self, mut envelope: Envelope) -> Envelope {
        envelope.seq = self.next.fetch_add(1, Ordering::Relaxed);
        envelope
    }
}

/// Receiver-side per-sender sequence bookkeeping.
///
/// Duplicated or reordered delivery is a protocol error; a gap is tolerated
/// (the transport may legitimately drop diagnostics) but logged.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    last: HashMap<(ModuleId, i32), u64>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, envelope: &Envelope) -> Result<()> {
        let key = (envelope.sender, envelope.rank);
        let last = self.last.entry(key).or_insert(0);
        if envelope.seq <= *last {
            return Err(Error::Protocol(format!(
                "duplicate or reordered message from {} rank {}: seq {} after {}",
                envelope.sender, envelope.rank, envelope.seq, last
            )));
        }
        if envelope.seq > *last + 1 {
            tracing::debug!(
                "gap in sequence from {} rank {}: {} -> {}",
                envelope.sender,
                envelope.rank,
                last,
                envelope.seq
            );
        }
        *last = envelope.seq;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_kinds() -> Vec<MessageKind> {
        vec![
            MessageKind::Identify { kind: PeerKind::Module, session: "s0".into() },
            MessageKind::AddHub {
                hub: ModuleId::MASTER_HUB,
                name: "master".into(),
                address: "10.0.0.1".into(),
                port: 31093,
            },
            MessageKind::RemoveHub { hub: ModuleId(-9) },
            MessageKind::SetId { id: ModuleId(4) },
            MessageKind::Spawn { hub: ModuleId::MASTER_HUB, name: "IsoSurface".into(), spawn_id: ModuleId(4) },
            MessageKind::Kill { module: ModuleId(4) },
            MessageKind::Quit,
            MessageKind::Started { name: "IsoSurface".into() },
            MessageKind::ModuleExit { module: ModuleId(4), crashed: false },
            MessageKind::Busy { module: ModuleId(4) },
            MessageKind::Idle { module: ModuleId(4) },
            MessageKind::AddPort { name: "data_out".into(), kind: PortKind::Output },
            MessageKind::RemovePort { name: "data_out".into() },
            MessageKind::Connect {
                from_id: ModuleId(1),
                from_port: "data_out".into(),
                to_id: ModuleId(2),
                to_port: "data_in".into(),
            },
            MessageKind::Disconnect {
                from_id: ModuleId(1),
                from_port: "data_out".into(),
                to_id: ModuleId(2),
                to_port: "data_in".into(),
            },
            MessageKind::AddParameter {
                name: "isovalue".into(),
                description: "surface level".into(),
                param_type: ParameterType::Float { min: Some(0.0), max: Some(1.0) },
            },
            MessageKind::SetParameter {
                module: ModuleId(4),
                name: "isovalue".into(),
                value: ParameterValue::Float(0.25),
            },
            MessageKind::SetParameterChoices {
                name: "mapping".into(),
                choices: vec!["rainbow".into(), "viridis".into()],
            },
            MessageKind::Execute { module: ModuleId(4), generation: 3 },
            MessageKind::CancelExecute { module: ModuleId(4) },
            MessageKind::ExecutionProgress { module: ModuleId(4), stage: ExecStage::Finish },
            MessageKind::AddObject {
                sender_port: "data_out".into(),
                dest_port: "data_in".into(),
                object_id: ObjectId::new(),
                timestep: 2,
                block: 0,
            },
            MessageKind::AddObjectCompleted { object_id: ObjectId::new(), orig_sender: ModuleId(1) },
            MessageKind::RequestObject { object_id: ObjectId::new() },
            MessageKind::SendObject { object_id: ObjectId::new() },
            MessageKind::DataTransferState { transferring: 2 },
            MessageKind::Barrier { uuid: Uuid::new_v4(), reason: "quit".into() },
            MessageKind::BarrierReached { uuid: Uuid::new_v4(), status: BarrierStatus::Ok },
            MessageKind::SendText { kind: TextKind::Error, text: "domain decomposition failed".into() },
            MessageKind::Ping { character: 'p' },
            MessageKind::Pong { character: 'p', module: ModuleId(4) },
            MessageKind::RequestTunnel { listen_port: 31500, dest_host: "node12".into(), dest_port: 22 },
            MessageKind::FileQuery {
                id: 9,
                module: ModuleId(4),
                path: "/data/case0".into(),
                command: FileCommand::ReadDirectory,
            },
            MessageKind::FileQueryResult { id: 9, ok: true },
        ]
    }

    #[test]
    fn every_kind_roundtrips_bit_for_bit() {
        for (i, kind) in sample_kinds().into_iter().enumerate() {
            let mut env = Envelope::new(ModuleId(7), 2, kind);
            env.seq = 41 + i as u64;
            let buffer = Buffer::encode(&env).unwrap();
            let decoded = buffer.decode().unwrap();
            assert_eq!(decoded, env);

            // Re-encoding the decoded envelope must reproduce the record.
            let again = Buffer::encode(&decoded).unwrap();
            assert_eq!(again.as_bytes()[..], buffer.as_bytes()[..]);
        }
    }

    #[test]
    fn oversized_message_is_rejected() {
        let env = Envelope::new(
            ModuleId(1),
            0,
            MessageKind::SendText {
                kind: TextKind::Info,
                text: "x".repeat(2 * MESSAGE_SIZE),
            },
        );
        assert!(matches!(Buffer::encode(&env), Err(Error::Protocol(_))));
    }

    #[test]
    fn sequencer_and_tracker_agree() {
        let sequencer = Sequencer::new();
        let mut tracker = SequenceTracker::new();

        for _ in 0..3 {
            let env = sequencer.stamp(Envelope::new(ModuleId(3), 0, MessageKind::Quit));
            tracker.observe(&env).unwrap();
        }

        // Replaying an old sequence number is flagged.
        let mut stale = Envelope::new(ModuleId(3), 0, MessageKind::Quit);
        stale.seq = 2;
        assert!(matches!(tracker.observe(&stale), Err(Error::Protocol(_))));

        // A different rank of the same module has its own sequence space.
        let mut other_rank = Envelope::new(ModuleId(3), 1, MessageKind::Quit);
        other_rank.seq = 1;
        tracker.observe(&other_rank).unwrap();
    }

    #[test]
    fn reserved_id_classification() {
        assert!(ModuleId(1).is_module());
        assert!(ModuleId(250).is_module());
        assert!(!ModuleId::BROADCAST.is_module());
        assert!(ModuleId::MASTER_HUB.is_hub());
        assert!(ModuleId(-12).is_hub());
        assert!(!ModuleId(3).is_hub());
    }
}
