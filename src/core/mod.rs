//! Core data plane: shared memory, dataset objects, messages and queues.

pub mod codec;
pub mod message;
pub mod meta;
pub mod object;
pub mod parameter;
pub mod queue;
pub mod shm;
pub mod shmvec;

pub use codec::{Frame, MessageCodec};
pub use message::{
    BarrierStatus, Buffer, Envelope, ExecStage, MessageKind, ModuleId, Payload, PeerKind,
    PortKind, Sequencer, SequenceTracker, TextKind, MESSAGE_SIZE,
};
pub use meta::{AvailableModule, Meta};
pub use object::{
    AttributeMap, Coords, FieldData, FieldValues, Geometry, GridTopology, Interface, Object,
    ObjectId, ObjectRecord, ObjectType, Shape, TransferMode,
};
pub use parameter::{Parameter, ParameterSet, ParameterType, ParameterValue};
pub use queue::{MessageQueue, QueueSender};
pub use shm::{Arena, ArenaConfig, ArenaStats, BackingKind, BlockRef};
pub use shmvec::{ShmPod, ShmVector};
