//! Table and binary file formats: the CSV table set the model is assembled
//! from (and snapshots are written back to), the particle-stack container,
//! and decoder weight checkpoints.

pub mod stack;
pub mod tables;
pub mod weights;
