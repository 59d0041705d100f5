//! Stereochemical restraint terms evaluated on batched atom positions in
//! ångströms, shape (batch, n_atoms, 3). Every term exposes a forward pass
//! returning raw per-row values and a backward pass that accumulates a
//! weighted cotangent into a position gradient buffer of the same shape.
//! Stage weighting lives with the loss assembly, not here.

pub mod angles;
pub mod bonds;
pub mod clash;
pub mod dihedrals;
pub mod planes;
pub mod rama;
pub mod rotamers;

#[inline]
pub(crate) fn relu(x: f64) -> f64 {
    x.max(0.0)
}
