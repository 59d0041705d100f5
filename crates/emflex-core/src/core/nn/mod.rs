//! Small dense networks with hand-written reverse-mode passes: the layer
//! primitive, the displacement decoders built from it, and the Adam
//! optimizer that updates them.

pub mod adam;
pub mod decoder;
pub mod dense;
