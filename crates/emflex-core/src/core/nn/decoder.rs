use ndarray::{Array2, Array3, ArrayView2, ArrayView3};
use rand_chacha::ChaCha8Rng;

use super::dense::{Activation, Dense, DenseGrad, Mlp, MlpTape};
use crate::core::model::points::POINT_CHANNELS;

const LATENT_DIM: usize = 4;
const ANCHOR_INIT_SIGMA: f64 = 1e-5;
const FULL_INIT_SIGMA: f64 = 1e-7;
const FULL_DROPOUT: f64 = 0.1;

/// How the network output spreads over the point cloud.
#[derive(Debug, Clone)]
enum Scope {
    /// One displacement row per class, gathered to atoms by assignment;
    /// the class rows are recentered to zero mean and the amplitude
    /// channel may be frozen.
    Classes {
        assignment: Vec<usize>,
        n_classes: usize,
        freeze_amp: bool,
    },
    /// One displacement row per atom.
    Atoms { n_points: usize },
}

/// A latent → displacement decoder. Fresh decoders are a no-op thanks to the
/// near-zero output-layer init; training bends them away from identity.
#[derive(Debug, Clone)]
pub struct Decoder {
    net: Mlp,
    scope: Scope,
}

#[derive(Debug, Clone)]
pub struct DecoderTape {
    mlp: MlpTape,
}

impl Decoder {
    /// Coarse patch decoder: one displacement per anchor patch (or residue),
    /// mean-zero across patches so the net motion has no global drift.
    pub fn anchor(assignment: &[usize], n_classes: usize, freeze_amp: bool, rng: &mut ChaCha8Rng) -> Self {
        let out = n_classes * POINT_CHANNELS;
        let net = Mlp::new(
            vec![
                Dense::glorot(LATENT_DIM, 128, Activation::Relu, rng),
                Dense::glorot(128, 256, Activation::Relu, rng),
                Dense::near_zero(256, out, ANCHOR_INIT_SIGMA, rng),
            ],
            None,
        );
        Self {
            net,
            scope: Scope::Classes {
                assignment: assignment.to_vec(),
                n_classes,
                freeze_amp,
            },
        }
    }

    /// Full-atom decoder: every atom free, dropout regularized.
    pub fn full(n_points: usize, rng: &mut ChaCha8Rng) -> Self {
        let out = n_points * POINT_CHANNELS;
        let net = Mlp::new(
            vec![
                Dense::glorot(LATENT_DIM, 128, Activation::Relu, rng),
                Dense::glorot(128, 256, Activation::Relu, rng),
                Dense::glorot(256, 512, Activation::Relu, rng),
                Dense::near_zero(512, out, FULL_INIT_SIGMA, rng),
            ],
            Some(FULL_DROPOUT),
        );
        Self {
            net,
            scope: Scope::Atoms { n_points },
        }
    }

    pub fn n_points(&self) -> usize {
        match &self.scope {
            Scope::Classes { assignment, .. } => assignment.len(),
            Scope::Atoms { n_points } => *n_points,
        }
    }

    pub fn layers(&self) -> &[Dense] {
        &self.net.layers
    }

    pub fn layers_mut(&mut self) -> &mut [Dense] {
        &mut self.net.layers
    }

    /// Maps a latent batch (B, 4) to displacements (B, N, 4). `training`
    /// activates dropout where the decoder carries one.
    pub fn decode(
        &self,
        latent: ArrayView2<'_, f64>,
        training: bool,
        rng: &mut ChaCha8Rng,
    ) -> (Array3<f64>, DecoderTape) {
        let (raw, mlp) = self.net.forward(latent, training, rng);
        let batch = raw.nrows();
        let out = match &self.scope {
            Scope::Atoms { n_points } => {
                let mut disp = Array3::zeros((batch, *n_points, POINT_CHANNELS));
                for b in 0..batch {
                    for p in 0..*n_points {
                        for c in 0..POINT_CHANNELS {
                            disp[[b, p, c]] = raw[[b, p * POINT_CHANNELS + c]];
                        }
                    }
                }
                disp
            }
            Scope::Classes {
                assignment,
                n_classes,
                freeze_amp,
            } => {
                let mut classes = Array3::zeros((batch, *n_classes, POINT_CHANNELS));
                for b in 0..batch {
                    for k in 0..*n_classes {
                        for c in 0..POINT_CHANNELS {
                            classes[[b, k, c]] = raw[[b, k * POINT_CHANNELS + c]];
                        }
                    }
                    for c in 0..POINT_CHANNELS {
                        let mean = (0..*n_classes).map(|k| classes[[b, k, c]]).sum::<f64>()
                            / *n_classes as f64;
                        for k in 0..*n_classes {
                            classes[[b, k, c]] -= mean;
                        }
                    }
                    if *freeze_amp {
                        for k in 0..*n_classes {
                            classes[[b, k, POINT_CHANNELS - 1]] = 0.0;
                        }
                    }
                }
                let mut disp = Array3::zeros((batch, assignment.len(), POINT_CHANNELS));
                for b in 0..batch {
                    for (atom, &class) in assignment.iter().enumerate() {
                        for c in 0..POINT_CHANNELS {
                            disp[[b, atom, c]] = classes[[b, class, c]];
                        }
                    }
                }
                disp
            }
        };
        (out, DecoderTape { mlp })
    }

    /// Pulls a displacement cotangent (B, N, 4) back to parameter gradients.
    /// Latents receive no gradient; they are never trained.
    pub fn backward(&self, tape: &DecoderTape, cotangent: ArrayView3<'_, f64>) -> Vec<DenseGrad> {
        let (batch, _, _) = cotangent.dim();
        let flat = match &self.scope {
            Scope::Atoms { n_points } => {
                let mut flat = Array2::zeros((batch, n_points * POINT_CHANNELS));
                for b in 0..batch {
                    for p in 0..*n_points {
                        for c in 0..POINT_CHANNELS {
                            flat[[b, p * POINT_CHANNELS + c]] = cotangent[[b, p, c]];
                        }
                    }
                }
                flat
            }
            Scope::Classes {
                assignment,
                n_classes,
                freeze_amp,
            } => {
                let mut classes = Array3::zeros((batch, *n_classes, POINT_CHANNELS));
                for b in 0..batch {
                    for (atom, &class) in assignment.iter().enumerate() {
                        for c in 0..POINT_CHANNELS {
                            classes[[b, class, c]] += cotangent[[b, atom, c]];
                        }
                    }
                    if *freeze_amp {
                        for k in 0..*n_classes {
                            classes[[b, k, POINT_CHANNELS - 1]] = 0.0;
                        }
                    }
                    // adjoint of the mean-zero recentering
                    for c in 0..POINT_CHANNELS {
                        let mean = (0..*n_classes).map(|k| classes[[b, k, c]]).sum::<f64>()
                            / *n_classes as f64;
                        for k in 0..*n_classes {
                            classes[[b, k, c]] -= mean;
                        }
                    }
                }
                let mut flat = Array2::zeros((batch, n_classes * POINT_CHANNELS));
                for b in 0..batch {
                    for k in 0..*n_classes {
                        for c in 0..POINT_CHANNELS {
                            flat[[b, k * POINT_CHANNELS + c]] = classes[[b, k, c]];
                        }
                    }
                }
                flat
            }
        };
        self.net.backward(&tape.mlp, flat.view())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;
    use rand::SeedableRng;

    #[test]
    fn fresh_decoders_are_near_identity() {
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let anchor = Decoder::anchor(&[0, 0, 1, 1, 2], 3, false, &mut rng);
        let full = Decoder::full(5, &mut rng);
        let latent = arr2(&[[1.0, 1.0, 1.0, 1.0], [-0.3, 0.8, 0.1, -0.9]]);

        let (da, _) = anchor.decode(latent.view(), false, &mut rng);
        let (df, _) = full.decode(latent.view(), false, &mut rng);
        assert!(da.iter().all(|v| v.abs() < 1e-3));
        assert!(df.iter().all(|v| v.abs() < 1e-5));
    }

    #[test]
    fn class_displacements_are_mean_zero_and_shared_within_a_patch() {
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let mut decoder = Decoder::anchor(&[0, 1, 1], 2, false, &mut rng);
        // make the output layer loud so the structure is visible
        for w in decoder.layers_mut()[2].weights.iter_mut() {
            *w *= 1e5;
        }
        let latent = arr2(&[[0.5, -0.5, 0.2, 0.9]]);
        let (disp, _) = decoder.decode(latent.view(), false, &mut rng);

        // atoms 1 and 2 share class 1
        for c in 0..POINT_CHANNELS {
            assert_eq!(disp[[0, 1, c]], disp[[0, 2, c]]);
            // class rows sum to zero per channel
            let sum = disp[[0, 0, c]] + disp[[0, 1, c]];
            assert!(sum.abs() < 1e-9, "channel {c} sum {sum}");
        }
    }

    #[test]
    fn frozen_amplitude_channel_stays_zero() {
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let mut decoder = Decoder::anchor(&[0, 1], 2, true, &mut rng);
        for w in decoder.layers_mut()[2].weights.iter_mut() {
            *w *= 1e6;
        }
        let latent = arr2(&[[0.4, 0.4, -0.1, 0.7]]);
        let (disp, _) = decoder.decode(latent.view(), false, &mut rng);
        assert!(disp[[0, 0, 0]].abs() > 0.0);
        assert_eq!(disp[[0, 0, 3]], 0.0);
        assert_eq!(disp[[0, 1, 3]], 0.0);
    }

    #[test]
    fn backward_matches_finite_differences() {
        let mut rng = ChaCha8Rng::seed_from_u64(17);
        let mut decoder = Decoder::anchor(&[0, 1, 0], 2, true, &mut rng);
        for w in decoder.layers_mut()[2].weights.iter_mut() {
            *w *= 1e4;
        }
        let latent = arr2(&[[0.3, -0.2, 0.6, 0.1], [0.9, 0.2, -0.5, 0.4]]);
        let mut cot = Array3::zeros((2, 3, 4));
        for (i, v) in cot.iter_mut().enumerate() {
            *v = (i as f64 * 0.23).sin();
        }

        let (_, tape) = decoder.decode(latent.view(), false, &mut rng);
        let grads = decoder.backward(&tape, cot.view());

        let loss = |d: &Decoder| -> f64 {
            let mut rng = ChaCha8Rng::seed_from_u64(0);
            let (out, _) = d.decode(latent.view(), false, &mut rng);
            out.iter().zip(cot.iter()).map(|(a, b)| a * b).sum()
        };
        let eps = 1e-6;
        for l in 0..3 {
            let (rows, cols) = decoder.layers()[l].weights.dim();
            for &(r, c) in &[(0, 0), (rows - 1, cols - 1)] {
                let mut plus = decoder.clone();
                plus.layers_mut()[l].weights[[r, c]] += eps;
                let mut minus = decoder.clone();
                minus.layers_mut()[l].weights[[r, c]] -= eps;
                let numeric = (loss(&plus) - loss(&minus)) / (2.0 * eps);
                assert!(
                    (grads[l].weights[[r, c]] - numeric).abs() < 1e-5,
                    "layer {l} ({r},{c}): analytic {} vs numeric {numeric}",
                    grads[l].weights[[r, c]]
                );
            }
        }
    }
}
