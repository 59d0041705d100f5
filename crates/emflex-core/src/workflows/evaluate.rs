//! Trajectory export from a finished run. Frames along the latent path
//! move at wildly different speeds; the export re-spaces them so each
//! consecutive pair shows about the same maximum atomic displacement.

use ndarray::{Array3, Axis};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{info, instrument};

use super::refine::DecoderSet;
use super::Session;
use crate::core::io::tables;
use crate::engine::checkpoint;
use crate::engine::config::{ConfigError, RefineConfig};
use crate::engine::error::RefineError;
use crate::engine::progress::{Progress, ProgressReporter};
use crate::engine::stage::Stage;

/// Rounds of displacement-based re-spacing of the frame positions.
pub const RESPACING_ROUNDS: usize = 7;

/// Floor on the per-interval displacement, so a motionless stretch does
/// not blow up the re-spacing weights.
const DISPLACEMENT_FLOOR: f64 = 1e-9;

/// Largest per-atom positional change between consecutive frames, in box
/// coordinates.
fn interval_displacements(cloud: &Array3<f64>) -> Vec<f64> {
    let n_frames = cloud.dim().0;
    let mut out = Vec::with_capacity(n_frames - 1);
    for k in 1..n_frames {
        let prev = cloud.index_axis(Axis(0), k - 1);
        let next = cloud.index_axis(Axis(0), k);
        let mut worst = 0.0f64;
        for (a, b) in prev.outer_iter().zip(next.outer_iter()) {
            let d2 = (0..3).map(|c| (b[c] - a[c]).powi(2)).sum::<f64>();
            worst = worst.max(d2);
        }
        out.push(worst.sqrt().max(DISPLACEMENT_FLOOR));
    }
    out
}

/// Decodes the trained trajectory and exports evenly moving frames, with
/// hydrogens placed. Requires the checkpoints of all three stages.
#[instrument(skip_all)]
pub fn evaluate(config: RefineConfig, reporter: &ProgressReporter<'_>) -> Result<(), RefineError> {
    for stage in Stage::ALL {
        if !checkpoint::exists(&config.paths.output_dir, stage) {
            return Err(ConfigError::MissingCheckpoint {
                stage: stage.token(),
                path: checkpoint::weight_path(&config.paths.output_dir, stage),
            }
            .into());
        }
    }

    let session = Session::load(config)?;
    let mut rng = ChaCha8Rng::seed_from_u64(session.config.schedule.seed);
    let mut decoders = DecoderSet::build(&session, &mut rng);
    let dir = &session.config.paths.output_dir;
    for stage in Stage::ALL {
        checkpoint::load(dir, stage, decoders.decoder_mut(stage).layers_mut())?;
    }

    let n_frames = session.trajectory.n_frames();
    let gate = session.gate();
    let mut positions: Vec<f64> = (0..n_frames)
        .map(|f| session.trajectory.frame_position(f))
        .collect();

    let mut cloud = decoders.compose(
        &session,
        &gate,
        session.trajectory.batch_at(&positions).view(),
        Stage::Full,
        &mut rng,
    );
    for round in 0..RESPACING_ROUNDS {
        if round > 0 {
            cloud = decoders.compose(
                &session,
                &gate,
                session.trajectory.batch_at(&positions).view(),
                Stage::Full,
                &mut rng,
            );
        }
        let displacements = interval_displacements(&cloud);
        let mut respaced = Vec::with_capacity(n_frames);
        respaced.push(0.0);
        for (k, df) in displacements.iter().enumerate() {
            let dt = positions[k + 1] - positions[k];
            respaced.push(respaced[k] + dt / df);
        }
        let span = respaced[n_frames - 1];
        for t in &mut respaced {
            *t /= span;
        }
        positions = respaced;
        reporter.report(Progress::Message(format!(
            "re-spacing round {} done",
            round + 1
        )));
    }

    for (idx, frame_cloud) in cloud.axis_iter(Axis(0)).enumerate() {
        let path = dir.join(format!("trajectory_{idx:02}.csv"));
        tables::write_snapshot(
            &path,
            &session.model,
            &session.frame,
            frame_cloud,
            Some(&session.hydrogens),
        )?;
    }
    info!(n_frames, "trajectory exported");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displacements_track_the_fastest_atom() {
        let mut cloud = Array3::zeros((3, 2, 4));
        // atom 1 jumps 3.0 in frame 1, atom 0 drifts 0.5 in frame 2
        cloud[[1, 1, 0]] = 3.0;
        cloud[[2, 1, 0]] = 3.0;
        cloud[[2, 0, 1]] = 0.5;
        let d = interval_displacements(&cloud);
        assert_eq!(d.len(), 2);
        assert!((d[0] - 3.0).abs() < 1e-12);
        assert!((d[1] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn motionless_intervals_stay_finite() {
        let cloud = Array3::zeros((4, 3, 4));
        for d in interval_displacements(&cloud) {
            assert!(d > 0.0 && d.is_finite());
        }
    }
}
