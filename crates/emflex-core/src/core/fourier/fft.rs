use std::sync::Arc;

use ndarray::{Array2, ArrayView2};
use num_complex::Complex64;
use rustfft::{Fft, FftPlanner};

/// Planned forward/inverse transforms for one square box size. The spectrum
/// convention matches centered-origin images: a real n×n image maps to the
/// unnormalized half-plane DFT of shape (n, n/2 + 1), with every pixel
/// multiplied by (-1)^(row+col) so that an impulse at the box center gives
/// a flat spectrum of ones.
pub struct FourierGrid {
    size: usize,
    forward: Arc<dyn Fft<f64>>,
    inverse: Arc<dyn Fft<f64>>,
}

impl std::fmt::Debug for FourierGrid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FourierGrid").field("size", &self.size).finish()
    }
}

impl FourierGrid {
    pub fn new(size: usize) -> Self {
        let mut planner = FftPlanner::new();
        Self {
            size,
            forward: planner.plan_fft_forward(size),
            inverse: planner.plan_fft_inverse(size),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn half_width(&self) -> usize {
        self.size / 2 + 1
    }

    /// Real image to origin-phased half-plane spectrum.
    pub fn rfft2_centered(&self, img: ArrayView2<f64>) -> Array2<Complex64> {
        let n = self.size;
        let half = self.half_width();
        debug_assert_eq!(img.dim(), (n, n));

        let mut out = Array2::zeros((n, half));
        let mut buf = vec![Complex64::new(0.0, 0.0); n];
        for r in 0..n {
            for c in 0..n {
                buf[c] = Complex64::new(img[[r, c]], 0.0);
            }
            self.forward.process(&mut buf);
            for c in 0..half {
                out[[r, c]] = buf[c];
            }
        }
        for c in 0..half {
            for (r, slot) in buf.iter_mut().enumerate() {
                *slot = out[[r, c]];
            }
            self.forward.process(&mut buf);
            for r in 0..n {
                out[[r, c]] = buf[r];
            }
        }
        for ((r, c), v) in out.indexed_iter_mut() {
            if (r + c) % 2 == 1 {
                *v = -*v;
            }
        }
        out
    }

    /// Adjoint of [`Self::rfft2_centered`] as a real-linear map: pulls a
    /// half-plane cotangent back to image space. The half-plane entries are
    /// treated as independent outputs, so no conjugate mirror is added.
    pub fn rfft2_adjoint(&self, cotangent: ArrayView2<Complex64>) -> Array2<f64> {
        let n = self.size;
        let half = self.half_width();
        debug_assert_eq!(cotangent.dim(), (n, half));

        let mut full = Array2::from_elem((n, n), Complex64::new(0.0, 0.0));
        for ((r, c), &v) in cotangent.indexed_iter() {
            full[[r, c]] = if (r + c) % 2 == 1 { -v } else { v };
        }
        let mut buf = vec![Complex64::new(0.0, 0.0); n];
        for c in 0..n {
            for (r, slot) in buf.iter_mut().enumerate() {
                *slot = full[[r, c]];
            }
            self.inverse.process(&mut buf);
            for r in 0..n {
                full[[r, c]] = buf[r];
            }
        }
        let mut out = Array2::zeros((n, n));
        for r in 0..n {
            for c in 0..n {
                buf[c] = full[[r, c]];
            }
            self.inverse.process(&mut buf);
            for c in 0..n {
                out[[r, c]] = buf[c].re;
            }
        }
        out
    }
}

/// Crops a half-plane spectrum to a smaller even box by keeping the lowest
/// row frequencies from both ends and the leading columns. Commutes with
/// the origin phase because both box sizes are even.
pub fn fourier_crop(src: ArrayView2<Complex64>, new_size: usize) -> Array2<Complex64> {
    let (rows, _) = src.dim();
    let half = new_size / 2 + 1;
    let mut out = Array2::from_elem((new_size, half), Complex64::new(0.0, 0.0));
    for r in 0..new_size {
        let src_r = if r < new_size / 2 {
            r
        } else {
            rows - new_size + r
        };
        for c in 0..half {
            out[[r, c]] = src[[src_r, c]];
        }
    }
    out
}
