//! Metadata attached to dataset objects and module directory entries.

use nalgebra::Matrix4;
use serde::{Deserialize, Serialize};

/// Metadata carried by every object. `-1` means unset / applies to all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    pub block: i32,
    pub num_blocks: i32,
    pub timestep: i32,
    pub num_timesteps: i32,
    pub iteration: i32,
    /// Monotonically increasing per execution of the pipeline.
    pub generation: i32,
    /// Id of the module that created the object.
    pub creator: i32,
    pub real_time: f64,
    pub transform: Matrix4<f64>,
}

impl Default for Meta {
    fn default() -> Self {
        Self {
            block: -1,
            num_blocks: -1,
            timestep: -1,
            num_timesteps: -1,
            iteration: -1,
            generation: -1,
            creator: -1,
            real_time: 0.0,
            transform: Matrix4::identity(),
        }
    }
}

impl Meta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_block(mut self, block: i32, num_blocks: i32) -> Self {
        self.block = block;
        self.num_blocks = num_blocks;
        self
    }

    pub fn with_timestep(mut self, timestep: i32, num_timesteps: i32) -> Self {
        self.timestep = timestep;
        self.num_timesteps = num_timesteps;
        self
    }

    pub fn with_iteration(mut self, iteration: i32) -> Self {
        self.iteration = iteration;
        self
    }

    pub fn with_generation(mut self, generation: i32) -> Self {
        self.generation = generation;
        self
    }

    pub fn with_creator(mut self, creator: i32) -> Self {
        self.creator = creator;
        self
    }
}

/// A module a hub can spawn, discovered from its manifest at startup and
/// dropped again when the hub disconnects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailableModule {
    pub hub: i32,
    pub name: String,
    pub path: String,
    pub description: String,
    pub category: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_unset() {
        let meta = Meta::default();
        assert_eq!(meta.block, -1);
        assert_eq!(meta.timestep, -1);
        assert_eq!(meta.generation, -1);
        assert_eq!(meta.creator, -1);
    }

    #[test]
    fn builder_chain() {
        let meta = Meta::new()
            .with_block(2, 8)
            .with_timestep(1, 3)
            .with_generation(5)
            .with_creator(42);
        assert_eq!(meta.block, 2);
        assert_eq!(meta.num_blocks, 8);
        assert_eq!(meta.timestep, 1);
        assert_eq!(meta.generation, 5);
        assert_eq!(meta.creator, 42);
    }
}
