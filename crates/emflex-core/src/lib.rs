//! # emflex Core Library
//!
//! A library for Gaussian-mixture flexible fitting of atomic models against
//! cryo-EM particle data: a differentiable point-cloud projection model, a
//! Fourier-ring-correlation image loss, stereochemical restraints, steric
//! clash detection, and a staged decoder-training loop driving them.
//!
//! ## Architectural Philosophy
//!
//! The library is designed with a strict three-layer architecture to ensure a
//! clear separation of concerns, making it modular, testable, and extensible.
//!
//! - **[`core`]: The Foundation.** Stateless domain math and data: the point
//!   model and its topology (`model`), Fourier-space machinery (`fourier`),
//!   the projection operator (`project`), restraint terms (`restraints`),
//!   dense decoder networks with hand-written backward passes (`nn`), and
//!   table/stack I/O (`io`).
//!
//! - **[`engine`]: The Logic Core.** The stateful optimization machinery:
//!   configuration records and validation, the clash index builder, latent
//!   trajectory sampling, the loss assembly that stitches the core terms
//!   into per-stage objectives with gradients, and the stage runner.
//!
//! - **[`workflows`]: The Public API.** The highest-level, user-facing layer
//!   tying `engine` and `core` together into complete procedures: staged
//!   refinement ([`workflows::refine`]) and trajectory-frame export
//!   ([`workflows::evaluate`]).

pub mod core;
pub mod engine;
pub mod workflows;
