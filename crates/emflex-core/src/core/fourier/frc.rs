use ndarray::{Array2, ArrayView2};
use num_complex::Complex64;

use super::rings::RingTable;

/// Rings whose power product falls below this floor get a fixed denominator
/// instead, so empty or near-empty rings cannot blow up the correlation.
pub const DENOMINATOR_FLOOR: f64 = 1e-4;

/// Half-open ring window [min_px, max_px) the loss averages over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrcWindow {
    pub min_px: usize,
    pub max_px: usize,
}

/// Per-ring sums kept from the forward pass for the backward pass.
#[derive(Debug, Clone)]
pub struct RingSums {
    cross: Vec<f64>,
    power_a: Vec<f64>,
    power_b: Vec<f64>,
}

/// Mean Fourier ring correlation between a projected model spectrum and one
/// particle spectrum over the window, plus the ring sums for `backward`.
pub fn frc_mean(
    proj: ArrayView2<Complex64>,
    data: ArrayView2<Complex64>,
    rings: &RingTable,
    window: FrcWindow,
) -> (f64, RingSums) {
    debug_assert_eq!(proj.dim(), data.dim());
    let nr = rings.n_rings();
    let mut sums = RingSums {
        cross: vec![0.0; nr],
        power_a: vec![0.0; nr],
        power_b: vec![0.0; nr],
    };
    for ((r, c), a) in proj.indexed_iter() {
        let ring = rings.ring_at(r, c);
        let b = data[[r, c]];
        sums.cross[ring] += a.re * b.re + a.im * b.im;
        sums.power_a[ring] += a.norm_sqr();
        sums.power_b[ring] += b.norm_sqr();
    }

    let hi = window.max_px.min(nr);
    let lo = window.min_px.min(hi);
    let count = (hi - lo).max(1) as f64;
    let mut total = 0.0;
    for i in lo..hi {
        let den = (sums.power_a[i] * sums.power_b[i])
            .sqrt()
            .max(DENOMINATOR_FLOOR);
        total += sums.cross[i] / den;
    }
    (total / count, sums)
}

/// Cotangent of the mean FRC with respect to the projected spectrum. The
/// particle side is data and receives no gradient. Floored rings only see
/// the cross-term direction.
pub fn frc_backward(
    proj: ArrayView2<Complex64>,
    data: ArrayView2<Complex64>,
    rings: &RingTable,
    sums: &RingSums,
    window: FrcWindow,
    cotangent: f64,
) -> Array2<Complex64> {
    let nr = rings.n_rings();
    let hi = window.max_px.min(nr);
    let lo = window.min_px.min(hi);
    let scale = cotangent / (hi - lo).max(1) as f64;

    let mut coef_data = vec![0.0; nr];
    let mut coef_self = vec![0.0; nr];
    for i in lo..hi {
        let raw = (sums.power_a[i] * sums.power_b[i]).sqrt();
        let den = raw.max(DENOMINATOR_FLOOR);
        coef_data[i] = scale / den;
        if raw > DENOMINATOR_FLOOR {
            coef_self[i] = scale * sums.cross[i] * sums.power_b[i] / (den * den * den);
        }
    }

    let (rows, cols) = proj.dim();
    let mut grad = Array2::from_elem((rows, cols), Complex64::new(0.0, 0.0));
    for ((r, c), a) in proj.indexed_iter() {
        let ring = rings.ring_at(r, c);
        if coef_data[ring] != 0.0 || coef_self[ring] != 0.0 {
            grad[[r, c]] = coef_data[ring] * data[[r, c]] - coef_self[ring] * a;
        }
    }
    grad
}
