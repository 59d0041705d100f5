pub mod fourier;
pub mod io;
pub mod model;
pub mod nn;
pub mod project;
pub mod restraints;
