use ndarray::{Array1, Array2};

use super::dense::{Dense, DenseGrad};

const BETA1: f64 = 0.9;
const BETA2: f64 = 0.999;
const EPSILON: f64 = 1e-7;

/// Adam over the layers of one decoder. Moment buffers are allocated lazily
/// from the first gradient, so one optimizer always belongs to one network.
#[derive(Debug, Clone)]
pub struct Adam {
    learn_rate: f64,
    step: u64,
    moments: Vec<LayerMoments>,
}

#[derive(Debug, Clone)]
struct LayerMoments {
    m_weights: Array2<f64>,
    v_weights: Array2<f64>,
    m_bias: Array1<f64>,
    v_bias: Array1<f64>,
}

impl Adam {
    pub fn new(learn_rate: f64) -> Self {
        Self {
            learn_rate,
            step: 0,
            moments: Vec::new(),
        }
    }

    pub fn learn_rate(&self) -> f64 {
        self.learn_rate
    }

    /// Applies one update to `layers` in place.
    pub fn apply(&mut self, layers: &mut [Dense], grads: &[DenseGrad]) {
        debug_assert_eq!(layers.len(), grads.len());
        if self.moments.is_empty() {
            self.moments = layers
                .iter()
                .map(|l| LayerMoments {
                    m_weights: Array2::zeros(l.weights.dim()),
                    v_weights: Array2::zeros(l.weights.dim()),
                    m_bias: Array1::zeros(l.bias.dim()),
                    v_bias: Array1::zeros(l.bias.dim()),
                })
                .collect();
        }
        self.step += 1;
        let t = self.step as i32;
        let correction1 = 1.0 - BETA1.powi(t);
        let correction2 = 1.0 - BETA2.powi(t);
        let rate = self.learn_rate * correction2.sqrt() / correction1;

        for ((layer, grad), state) in layers.iter_mut().zip(grads).zip(&mut self.moments) {
            update(
                &mut layer.weights,
                &grad.weights,
                &mut state.m_weights,
                &mut state.v_weights,
                rate,
            );
            update_bias(
                &mut layer.bias,
                &grad.bias,
                &mut state.m_bias,
                &mut state.v_bias,
                rate,
            );
        }
    }
}

fn update(
    param: &mut Array2<f64>,
    grad: &Array2<f64>,
    m: &mut Array2<f64>,
    v: &mut Array2<f64>,
    rate: f64,
) {
    m.zip_mut_with(grad, |m, &g| *m = BETA1 * *m + (1.0 - BETA1) * g);
    v.zip_mut_with(grad, |v, &g| *v = BETA2 * *v + (1.0 - BETA2) * g * g);
    param
        .iter_mut()
        .zip(m.iter().zip(v.iter()))
        .for_each(|(p, (&m, &v))| *p -= rate * m / (v.sqrt() + EPSILON));
}

fn update_bias(
    param: &mut Array1<f64>,
    grad: &Array1<f64>,
    m: &mut Array1<f64>,
    v: &mut Array1<f64>,
    rate: f64,
) {
    m.zip_mut_with(grad, |m, &g| *m = BETA1 * *m + (1.0 - BETA1) * g);
    v.zip_mut_with(grad, |v, &g| *v = BETA2 * *v + (1.0 - BETA2) * g * g);
    param
        .iter_mut()
        .zip(m.iter().zip(v.iter()))
        .for_each(|(p, (&m, &v))| *p -= rate * m / (v.sqrt() + EPSILON));
}
