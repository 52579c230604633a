//! Execution layer: module lifecycle, generation scheduling and the result
//! cache.

pub mod cache;
pub mod module;
mod scheduler;

pub use cache::{CacheHandle, ResultCache};
pub use module::{
    BlockTask, Compute, ComputeContext, ModuleRuntime, ModuleState, ObjectReceivePolicy, Port,
    ReducePolicy, SchedulingPolicy,
};
