//! Optimization machinery around the core math: configuration records,
//! the clash index builder, latent trajectories, loss assembly, the stage
//! state machine, and weight checkpoints.

pub mod checkpoint;
pub mod clash_index;
pub mod config;
pub mod error;
pub mod latent;
pub mod loss;
pub mod progress;
pub mod stage;
