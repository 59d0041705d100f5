use thiserror::Error;

use super::config::ConfigError;
use crate::core::io::stack::StackError;
use crate::core::io::tables::TableLoadError;
use crate::core::io::weights::WeightsError;
use crate::core::model::ModelError;
use crate::core::project::SymmetryParseError;

/// Everything that can abort a refinement or evaluation run. All variants
/// are fatal; degenerate numeric cases that degrade to zero terms never
/// surface here.
#[derive(Debug, Error)]
pub enum RefineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Table(#[from] TableLoadError),

    #[error(transparent)]
    Stack(#[from] StackError),

    #[error(transparent)]
    Weights(#[from] WeightsError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Symmetry(#[from] SymmetryParseError),

    #[error("Loss became non-finite in stage '{stage}' at iteration {iteration}")]
    NonFiniteLoss { stage: &'static str, iteration: u64 },
}
