use ndarray::Array2;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use serde::Deserialize;

/// Latent-space conformer coordinates.
pub const LATENT_DIM: usize = 4;

/// The one-parameter family the decoders are trained along. Linear sweeps
/// an open path; circular closes it, for motions that return to the start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrajectoryShape {
    Linear,
    Circular,
}

/// Maps trajectory positions t in [0, 1] to latent vectors and frames.
#[derive(Debug, Clone)]
pub struct Trajectory {
    shape: TrajectoryShape,
    n_frames: usize,
}

impl Trajectory {
    pub fn new(shape: TrajectoryShape, n_frames: usize) -> Self {
        Self { shape, n_frames }
    }

    pub fn n_frames(&self) -> usize {
        self.n_frames
    }

    pub fn shape(&self) -> TrajectoryShape {
        self.shape
    }

    /// The latent vector at position t.
    pub fn latent_at(&self, t: f64) -> [f64; LATENT_DIM] {
        match self.shape {
            TrajectoryShape::Linear => [2.0 * t - 1.0; LATENT_DIM],
            TrajectoryShape::Circular => {
                let a = 2.0 * std::f64::consts::PI * t;
                [a.cos(), a.cos(), a.sin(), a.sin()]
            }
        }
    }

    /// Position of a snapshot frame; frames tile [0, 1] inclusively.
    pub fn frame_position(&self, frame: usize) -> f64 {
        frame as f64 / (self.n_frames - 1) as f64
    }

    /// Frame a particle is pinned to under the uniform particle-to-frame
    /// assignment.
    pub fn particle_frame(&self, particle: usize, n_particles: usize) -> usize {
        (particle * self.n_frames / n_particles).min(self.n_frames - 1)
    }

    /// Frames exported as snapshots. A circular trajectory revisits its
    /// geometry on the way back, so only every second frame is kept.
    pub fn snapshot_frames(&self) -> Vec<usize> {
        match self.shape {
            TrajectoryShape::Linear => (0..self.n_frames).collect(),
            TrajectoryShape::Circular => (0..self.n_frames).step_by(2).collect(),
        }
    }

    /// Latent batch for a set of trajectory positions.
    pub fn batch_at(&self, positions: &[f64]) -> Array2<f64> {
        let mut out = Array2::zeros((positions.len(), LATENT_DIM));
        for (mut row, &t) in out.rows_mut().into_iter().zip(positions) {
            let v = self.latent_at(t);
            for (dst, src) in row.iter_mut().zip(v) {
                *dst = src;
            }
        }
        out
    }

    /// Latent batch for the frames the given particles are pinned to.
    pub fn batch_for_particles(&self, particles: &[usize], n_particles: usize) -> Array2<f64> {
        let positions: Vec<f64> = particles
            .iter()
            .map(|&p| self.frame_position(self.particle_frame(p, n_particles)))
            .collect();
        self.batch_at(&positions)
    }

    /// Uniformly random positions, for restraint-only training batches.
    pub fn random_positions(&self, n: usize, rng: &mut ChaCha8Rng) -> Vec<f64> {
        (0..n).map(|_| rng.gen_range(0.0..1.0)).collect()
    }
}

/// Adds isotropic Gaussian noise to a latent batch, in place.
pub fn perturb(latent: &mut Array2<f64>, sigma: f64, rng: &mut ChaCha8Rng) {
    if sigma == 0.0 {
        return;
    }
    for v in latent.iter_mut() {
        let n: f64 = rng.sample(StandardNormal);
        *v += sigma * n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn linear_latent_spans_minus_one_to_one() {
        let traj = Trajectory::new(TrajectoryShape::Linear, 5);
        assert_eq!(traj.latent_at(0.0), [-1.0; 4]);
        assert_eq!(traj.latent_at(1.0), [1.0; 4]);
        assert_eq!(traj.latent_at(0.5), [0.0; 4]);
    }

    #[test]
    fn circular_latent_closes() {
        let traj = Trajectory::new(TrajectoryShape::Circular, 8);
        let start = traj.latent_at(0.0);
        let end = traj.latent_at(1.0);
        for (a, b) in start.iter().zip(&end) {
            assert!((a - b).abs() < 1e-12);
        }
        // quarter turn moves the sine channels
        let quarter = traj.latent_at(0.25);
        assert!(quarter[0].abs() < 1e-12);
        assert!((quarter[2] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn particles_tile_frames_uniformly() {
        let traj = Trajectory::new(TrajectoryShape::Linear, 4);
        let frames: Vec<usize> = (0..8).map(|p| traj.particle_frame(p, 8)).collect();
        assert_eq!(frames, vec![0, 0, 1, 1, 2, 2, 3, 3]);
        // last particle never overflows
        assert_eq!(traj.particle_frame(7, 7), 3);
    }

    #[test]
    fn circular_snapshots_skip_the_return_leg() {
        let traj = Trajectory::new(TrajectoryShape::Circular, 8);
        assert_eq!(traj.snapshot_frames(), vec![0, 2, 4, 6]);
        let lin = Trajectory::new(TrajectoryShape::Linear, 4);
        assert_eq!(lin.snapshot_frames(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn perturb_preserves_shape_and_scale() {
        let traj = Trajectory::new(TrajectoryShape::Linear, 4);
        let mut batch = traj.batch_at(&[0.0, 0.5, 1.0]);
        let clean = batch.clone();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        perturb(&mut batch, 0.02, &mut rng);
        let max_shift = (&batch - &clean)
            .iter()
            .fold(0.0f64, |m, v| m.max(v.abs()));
        assert!(max_shift > 0.0 && max_shift < 0.2);
    }
}
