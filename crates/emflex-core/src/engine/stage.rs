use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;

use super::error::RefineError;

/// The three training stages, in strict sequence. Each owns one decoder,
/// one optimizer, and one weight checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Morph,
    CarbonAlpha,
    Full,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Morph, Stage::CarbonAlpha, Stage::Full];

    /// Short token used for checkpoint and snapshot file names.
    pub fn token(self) -> &'static str {
        match self {
            Self::Morph => "morph",
            Self::CarbonAlpha => "ca",
            Self::Full => "full",
        }
    }
}

/// Resolution-ladder divisors of the morph stage: the FRC window widens
/// from boxsize/4 to boxsize/2 over three rungs.
pub const MORPH_LADDER_DIVISORS: [usize; 3] = [4, 3, 2];

/// The full stage runs this many steps per scheduled round.
pub const FULL_STEPS_PER_ROUND: u64 = 5000;

/// Full-stage steps at which the clash index is rebuilt from the current
/// snapshot-frame geometry.
pub const FULL_REBUILD_STEPS: [u64; 4] = [0, 500, 2000, 8000];

/// Shuffled mini-batches over one epoch. A size-1 remainder is skipped:
/// the batch normalizations degenerate on a single item.
pub fn shuffled_batches(
    n_items: usize,
    batch_size: usize,
    rng: &mut ChaCha8Rng,
) -> Vec<Vec<usize>> {
    let mut order: Vec<usize> = (0..n_items).collect();
    order.shuffle(rng);
    order
        .chunks(batch_size)
        .filter(|chunk| chunk.len() > 1 || n_items == 1)
        .map(<[usize]>::to_vec)
        .collect()
}

/// The fatal divergence check, run every step before the parameter update.
pub fn guard_finite(stage: Stage, iteration: u64, loss: f64) -> Result<(), RefineError> {
    if loss.is_finite() {
        Ok(())
    } else {
        Err(RefineError::NonFiniteLoss {
            stage: stage.token(),
            iteration,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn batches_cover_every_item_once() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let batches = shuffled_batches(10, 4, &mut rng);
        assert_eq!(batches.len(), 3);
        let mut seen: Vec<usize> = batches.iter().flatten().copied().collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn size_one_remainder_is_skipped() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let batches = shuffled_batches(9, 4, &mut rng);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches.iter().map(Vec::len).sum::<usize>(), 8);
    }

    #[test]
    fn non_finite_loss_aborts() {
        assert!(guard_finite(Stage::Full, 12, -0.5).is_ok());
        let err = guard_finite(Stage::Full, 12, f64::NAN).unwrap_err();
        assert!(matches!(err, RefineError::NonFiniteLoss { iteration: 12, .. }));
    }
}
