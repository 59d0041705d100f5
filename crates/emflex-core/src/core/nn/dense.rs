use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Relu,
    Linear,
}

/// One fully connected layer, `y = act(x·W + b)` with `W` shaped
/// (input, output).
#[derive(Debug, Clone)]
pub struct Dense {
    pub weights: Array2<f64>,
    pub bias: Array1<f64>,
    activation: Activation,
}

/// Parameter cotangents of one layer, same shapes as the layer itself.
#[derive(Debug, Clone)]
pub struct DenseGrad {
    pub weights: Array2<f64>,
    pub bias: Array1<f64>,
}

impl Dense {
    /// Glorot-uniform initialized hidden layer.
    pub fn glorot(
        input: usize,
        output: usize,
        activation: Activation,
        rng: &mut ChaCha8Rng,
    ) -> Self {
        let limit = (6.0 / (input + output) as f64).sqrt();
        let weights = Array2::from_shape_fn((input, output), |_| rng.gen_range(-limit..limit));
        Self {
            weights,
            bias: Array1::zeros(output),
            activation,
        }
    }

    /// Linear output layer with N(0, sigma) weights and zero bias. A tiny
    /// sigma makes the whole network start as a no-op.
    pub fn near_zero(input: usize, output: usize, sigma: f64, rng: &mut ChaCha8Rng) -> Self {
        let weights = Array2::from_shape_fn((input, output), |_| {
            let z: f64 = rng.sample(StandardNormal);
            z * sigma
        });
        Self {
            weights,
            bias: Array1::zeros(output),
            activation: Activation::Linear,
        }
    }

    pub fn input_dim(&self) -> usize {
        self.weights.nrows()
    }

    pub fn output_dim(&self) -> usize {
        self.weights.ncols()
    }

    pub fn forward(&self, x: ArrayView2<'_, f64>) -> Array2<f64> {
        let mut y = x.dot(&self.weights) + &self.bias;
        if self.activation == Activation::Relu {
            y.mapv_inplace(|v| v.max(0.0));
        }
        y
    }

    /// Reverse pass given the forward input, the forward output, and the
    /// output cotangent; returns the input cotangent and the parameter
    /// gradients. The relu gate reads the stored output: gradient flows
    /// exactly where the output stayed positive.
    pub fn backward(
        &self,
        x: ArrayView2<'_, f64>,
        y: ArrayView2<'_, f64>,
        grad_y: ArrayView2<'_, f64>,
    ) -> (Array2<f64>, DenseGrad) {
        let dz = match self.activation {
            Activation::Linear => grad_y.to_owned(),
            Activation::Relu => {
                let mut dz = grad_y.to_owned();
                dz.zip_mut_with(&y, |g, &out| {
                    if out <= 0.0 {
                        *g = 0.0;
                    }
                });
                dz
            }
        };
        let grad = DenseGrad {
            weights: x.t().dot(&dz),
            bias: dz.sum_axis(Axis(0)),
        };
        (dz.dot(&self.weights.t()), grad)
    }
}

/// A feed-forward stack with an optional inverted-dropout slot between the
/// last hidden layer and the output layer, active only in training mode.
#[derive(Debug, Clone)]
pub struct Mlp {
    pub layers: Vec<Dense>,
    dropout: Option<f64>,
}

/// Forward activations kept for the reverse pass. `activations[i]` is the
/// input of layer `i` (post-dropout where the slot applies), so each layer's
/// backward sees exactly what its forward saw.
#[derive(Debug, Clone)]
pub struct MlpTape {
    activations: Vec<Array2<f64>>,
    dropout_mask: Option<Array2<f64>>,
}

impl Mlp {
    pub fn new(layers: Vec<Dense>, dropout: Option<f64>) -> Self {
        Self { layers, dropout }
    }

    pub fn output_dim(&self) -> usize {
        self.layers.last().map_or(0, Dense::output_dim)
    }

    /// `rng` is only consulted when `training` is set and a dropout rate is
    /// configured.
    pub fn forward(
        &self,
        x: ArrayView2<'_, f64>,
        training: bool,
        rng: &mut ChaCha8Rng,
    ) -> (Array2<f64>, MlpTape) {
        let n_layers = self.layers.len();
        let mut activations = Vec::with_capacity(n_layers + 1);
        activations.push(x.to_owned());
        let mut dropout_mask = None;

        for (index, layer) in self.layers.iter().enumerate() {
            let mut y = layer.forward(activations[index].view());
            if index + 2 == n_layers
                && training
                && let Some(rate) = self.dropout
            {
                let keep = 1.0 - rate;
                let mask = Array2::from_shape_fn(y.dim(), |_| {
                    if rng.r#gen::<f64>() < rate { 0.0 } else { 1.0 / keep }
                });
                y *= &mask;
                dropout_mask = Some(mask);
            }
            activations.push(y);
        }
        let out = activations[n_layers].clone();
        (
            out,
            MlpTape {
                activations,
                dropout_mask,
            },
        )
    }

    /// Parameter gradients in layer order. Positions dropped in the forward
    /// pass carry a zero upstream cotangent, so the post-dropout activation
    /// doubles as the relu gate without error.
    pub fn backward(&self, tape: &MlpTape, grad_out: ArrayView2<'_, f64>) -> Vec<DenseGrad> {
        let n_layers = self.layers.len();
        let mut grads: Vec<Option<DenseGrad>> = (0..n_layers).map(|_| None).collect();
        let mut upstream = grad_out.to_owned();
        for index in (0..n_layers).rev() {
            let (grad_in, param_grad) = self.layers[index].backward(
                tape.activations[index].view(),
                tape.activations[index + 1].view(),
                upstream.view(),
            );
            grads[index] = Some(param_grad);
            upstream = grad_in;
            if index + 1 == n_layers
                && let Some(mask) = &tape.dropout_mask
            {
                upstream *= mask;
            }
        }
        grads.into_iter().flatten().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;
    use rand::SeedableRng;

    fn create_test_net(dropout: Option<f64>) -> Mlp {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        Mlp::new(
            vec![
                Dense::glorot(3, 5, Activation::Relu, &mut rng),
                Dense::glorot(5, 4, Activation::Relu, &mut rng),
                Dense::near_zero(4, 2, 0.3, &mut rng),
            ],
            dropout,
        )
    }

    #[test]
    fn near_zero_layer_starts_as_a_no_op() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let layer = Dense::near_zero(4, 6, 1e-7, &mut rng);
        let x = arr2(&[[1.0, -2.0, 3.0, 0.5]]);
        let y = layer.forward(x.view());
        assert!(y.iter().all(|v| v.abs() < 1e-5));
    }

    #[test]
    fn inference_ignores_dropout() {
        let net = create_test_net(Some(0.5));
        let x = arr2(&[[0.4, -0.8, 1.2], [0.1, 0.9, -0.3]]);
        let mut rng_a = ChaCha8Rng::seed_from_u64(1);
        let mut rng_b = ChaCha8Rng::seed_from_u64(999);
        let (a, _) = net.forward(x.view(), false, &mut rng_a);
        let (b, _) = net.forward(x.view(), false, &mut rng_b);
        assert_eq!(a, b);
    }

    #[test]
    fn backward_matches_finite_differences() {
        let net = create_test_net(None);
        let x = arr2(&[[0.4, -0.8, 1.2], [0.1, 0.9, -0.3]]);
        let cot = arr2(&[[1.0, -0.5], [0.3, 0.8]]);
        let mut rng = ChaCha8Rng::seed_from_u64(2);

        let (_, tape) = net.forward(x.view(), false, &mut rng);
        let grads = net.backward(&tape, cot.view());

        let loss = |net: &Mlp| -> f64 {
            let mut rng = ChaCha8Rng::seed_from_u64(2);
            let (y, _) = net.forward(x.view(), false, &mut rng);
            y.iter().zip(cot.iter()).map(|(a, b)| a * b).sum()
        };
        let eps = 1e-6;
        for l in 0..3 {
            let (rows, cols) = net.layers[l].weights.dim();
            for &(r, c) in &[(0, 0), (rows - 1, cols - 1), (rows / 2, cols / 2)] {
                let mut plus = net.clone();
                plus.layers[l].weights[[r, c]] += eps;
                let mut minus = net.clone();
                minus.layers[l].weights[[r, c]] -= eps;
                let numeric = (loss(&plus) - loss(&minus)) / (2.0 * eps);
                assert!(
                    (grads[l].weights[[r, c]] - numeric).abs() < 1e-6,
                    "layer {l} weight ({r},{c}): analytic {} vs numeric {numeric}",
                    grads[l].weights[[r, c]]
                );
            }
            let mut plus = net.clone();
            plus.layers[l].bias[0] += eps;
            let mut minus = net.clone();
            minus.layers[l].bias[0] -= eps;
            let numeric = (loss(&plus) - loss(&minus)) / (2.0 * eps);
            assert!((grads[l].bias[0] - numeric).abs() < 1e-6);
        }
    }

    #[test]
    fn dropout_backward_respects_the_sampled_mask() {
        let net = create_test_net(Some(0.4));
        let x = arr2(&[[0.4, -0.8, 1.2]]);
        let cot = arr2(&[[1.0, -0.5]]);

        // same seed reproduces the same mask, so finite differences through
        // the trained forward stay consistent
        let forward_loss = |net: &Mlp| -> f64 {
            let mut rng = ChaCha8Rng::seed_from_u64(5);
            let (y, _) = net.forward(x.view(), true, &mut rng);
            y.iter().zip(cot.iter()).map(|(a, b)| a * b).sum()
        };

        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let (_, tape) = net.forward(x.view(), true, &mut rng);
        let grads = net.backward(&tape, cot.view());

        let eps = 1e-6;
        let mut plus = net.clone();
        plus.layers[0].weights[[0, 0]] += eps;
        let mut minus = net.clone();
        minus.layers[0].weights[[0, 0]] -= eps;
        let numeric = (forward_loss(&plus) - forward_loss(&minus)) / (2.0 * eps);
        assert!((grads[0].weights[[0, 0]] - numeric).abs() < 1e-6);
    }
}
