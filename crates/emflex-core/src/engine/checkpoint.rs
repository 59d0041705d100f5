use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use super::stage::Stage;
use crate::core::io::weights::{self, WeightsError};
use crate::core::nn::dense::Dense;

pub fn weight_path(dir: &Path, stage: Stage) -> PathBuf {
    dir.join(format!("weights_{}.emfw", stage.token()))
}

pub fn exists(dir: &Path, stage: Stage) -> bool {
    weight_path(dir, stage).is_file()
}

/// Saves one stage checkpoint, replacing any existing file.
pub fn save(dir: &Path, stage: Stage, layers: &[Dense]) -> Result<(), WeightsError> {
    let path = weight_path(dir, stage);
    if path.exists() {
        fs::remove_file(&path).map_err(|e| WeightsError::Io {
            path: path.to_string_lossy().to_string(),
            source: e,
        })?;
    }
    weights::save_weights(&path, layers)?;
    info!(stage = stage.token(), path = %path.display(), "checkpoint saved");
    Ok(())
}

pub fn load(dir: &Path, stage: Stage, layers: &mut [Dense]) -> Result<(), WeightsError> {
    weights::load_weights(&weight_path(dir, stage), layers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::nn::dense::Activation;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use tempfile::tempdir;

    #[test]
    fn save_replaces_and_load_restores() {
        let dir = tempdir().unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let first = vec![Dense::glorot(2, 3, Activation::Relu, &mut rng)];
        let second = vec![Dense::glorot(2, 3, Activation::Relu, &mut rng)];
        assert!(!exists(dir.path(), Stage::Morph));

        save(dir.path(), Stage::Morph, &first).unwrap();
        save(dir.path(), Stage::Morph, &second).unwrap();
        assert!(exists(dir.path(), Stage::Morph));

        let mut loaded = vec![Dense::glorot(2, 3, Activation::Relu, &mut rng)];
        load(dir.path(), Stage::Morph, &mut loaded).unwrap();
        assert_eq!(loaded[0].weights, second[0].weights);
        // stages do not collide
        assert!(!exists(dir.path(), Stage::Full));
    }
}
