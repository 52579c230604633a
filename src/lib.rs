//! # Parvis - Distributed Scientific Visualization Substrate
//!
//! The execution substrate beneath a distributed visualization pipeline:
//! a shared-memory arena with reference-counted dataset handles, a closed
//! versioned message protocol over interprocess queues and framed TCP, the
//! module lifecycle state machine with cluster-wide barriers, and a
//! single-flight result cache.

pub mod comm;
pub mod core;
pub mod exec;
pub mod mpi;
pub mod util;

pub use crate::core::{
    Arena, ArenaConfig, Buffer, Envelope, MessageKind, MessageQueue, Meta, ModuleId, Object,
    ObjectId, Payload, Shape, ShmVector,
};
pub use comm::Communicator;
pub use exec::{Compute, ModuleRuntime, ResultCache, SchedulingPolicy};

/// Initialize the Parvis process: logging and diagnostics.
pub fn init() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    tracing::info!("initializing parvis v{}", env!("CARGO_PKG_VERSION"));
}

/// Main error type for Parvis operations.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Arena create/attach/grow failure. Fatal to the requesting process only.
    #[error("allocation error: {0}")]
    Allocation(String),

    /// Malformed or unexpected message. Logged and dropped, sender unaffected.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Barrier timeout or unexpected module exit.
    #[error("participant lost: {0}")]
    ParticipantLost(String),

    /// A module signalled failure from prepare/compute/reduce. Isolated to
    /// that generation and module.
    #[error("compute error: {0}")]
    Compute(String),

    /// A compute hook panicked. The module rank shuts down.
    #[error("module panicked: {0}")]
    Panicked(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("module error: {0}")]
    Module(String),
}

pub type Result<T> = std::result::Result<T, Error>;
