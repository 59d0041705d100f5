//! Differentiable rendering of point clouds into Fourier-space projection
//! images. Points rotate by ZXZ Euler angles, project to the image plane,
//! scatter bilinearly onto a real grid per symmetry replica, and the grid
//! transforms through the centered rfft2. The per-image loop is the
//! parallelism boundary.

use std::str::FromStr;

use nalgebra::{Matrix3, Vector3};
use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis, s};
use num_complex::Complex64;
use thiserror::Error;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::core::fourier::fft::FourierGrid;

#[derive(Debug, Error)]
#[error("Unrecognized symmetry '{0}', expected c<n> or d<n>")]
pub struct SymmetryParseError(String);

/// Cyclic or dihedral point-group symmetry applied during rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Symmetry {
    Cyclic(u32),
    Dihedral(u32),
}

impl Default for Symmetry {
    fn default() -> Self {
        Self::Cyclic(1)
    }
}

impl FromStr for Symmetry {
    type Err = SymmetryParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        let (kind, order) = lower.split_at(1.min(lower.len()));
        let n: u32 = order
            .parse()
            .map_err(|_| SymmetryParseError(s.to_string()))?;
        if n == 0 {
            return Err(SymmetryParseError(s.to_string()));
        }
        match kind {
            "c" => Ok(Self::Cyclic(n)),
            "d" => Ok(Self::Dihedral(n)),
            _ => Err(SymmetryParseError(s.to_string())),
        }
    }
}

impl Symmetry {
    pub fn n_ops(&self) -> usize {
        match *self {
            Self::Cyclic(n) => n as usize,
            Self::Dihedral(n) => 2 * n as usize,
        }
    }

    /// Rotation matrices of the group, identity first.
    pub fn operators(&self) -> Vec<Matrix3<f64>> {
        let (n, flip) = match *self {
            Self::Cyclic(n) => (n, false),
            Self::Dihedral(n) => (n, true),
        };
        let mut ops = Vec::with_capacity(self.n_ops());
        for k in 0..n {
            let theta = 2.0 * std::f64::consts::PI * k as f64 / n as f64;
            let (sin, cos) = theta.sin_cos();
            let rz = Matrix3::new(cos, -sin, 0.0, sin, cos, 0.0, 0.0, 0.0, 1.0);
            ops.push(rz);
            if flip {
                // two-fold axis along x
                ops.push(rz * Matrix3::from_diagonal(&Vector3::new(1.0, -1.0, -1.0)));
            }
        }
        ops
    }
}

/// Particle orientation: ZXZ Euler angles in radians plus in-plane
/// translation in box-fraction units.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Orientation {
    pub az: f64,
    pub alt: f64,
    pub phi: f64,
    pub tx: f64,
    pub ty: f64,
}

/// Rotation applied to points for an orientation. The projection direction
/// convention negates az and phi relative to the reconstruction transform.
pub fn rotation_matrix(az: f64, alt: f64, phi: f64) -> Matrix3<f64> {
    let azp = -az;
    let altp = alt;
    let phip = -phi;
    let (saz, caz) = azp.sin_cos();
    let (salt, calt) = altp.sin_cos();
    let (sphi, cphi) = phip.sin_cos();
    Matrix3::new(
        cphi * caz - calt * saz * sphi,
        cphi * saz + calt * caz * sphi,
        salt * sphi,
        -sphi * caz - calt * saz * cphi,
        -sphi * saz + calt * caz * cphi,
        salt * cphi,
        salt * saz,
        -salt * caz,
        calt,
    )
}

/// Renders point clouds to half-plane projection spectra and pulls spectrum
/// cotangents back to point cotangents. One instance serves one working box
/// size.
#[derive(Debug)]
pub struct Projector {
    grid: FourierGrid,
    symmetry: Symmetry,
}

impl Projector {
    pub fn new(size: usize, symmetry: Symmetry) -> Self {
        Self {
            grid: FourierGrid::new(size),
            symmetry,
        }
    }

    pub fn size(&self) -> usize {
        self.grid.size()
    }

    /// Forward render: points (batch, N, 4) in box coordinates with the
    /// amplitude channel last, one orientation per image. Output shape is
    /// (batch, size, size/2 + 1).
    pub fn render(
        &self,
        points: ArrayView3<'_, f64>,
        orientations: &[Orientation],
    ) -> Array3<Complex64> {
        let (batch, _, _) = points.dim();
        debug_assert_eq!(batch, orientations.len());
        let jobs: Vec<(ArrayView2<'_, f64>, &Orientation)> = points
            .axis_iter(Axis(0))
            .zip(orientations)
            .collect();

        #[cfg(not(feature = "parallel"))]
        let iterator = jobs.iter();

        #[cfg(feature = "parallel")]
        let iterator = jobs.par_iter();

        let images: Vec<Array2<Complex64>> = iterator
            .map(|(pts, o)| self.render_one(*pts, o))
            .collect();

        let half = self.grid.half_width();
        let mut out = Array3::from_elem((batch, self.size(), half), Complex64::new(0.0, 0.0));
        for (b, image) in images.into_iter().enumerate() {
            out.slice_mut(s![b, .., ..]).assign(&image);
        }
        out
    }

    /// Pulls a spectrum cotangent batch back onto the points, shape
    /// (batch, N, 4). Footprints are recomputed from the inputs, so the
    /// same points and orientations must be passed as in the forward call.
    pub fn backward(
        &self,
        points: ArrayView3<'_, f64>,
        orientations: &[Orientation],
        cotangent: ArrayView3<'_, Complex64>,
    ) -> Array3<f64> {
        let (batch, n_points, _) = points.dim();
        debug_assert_eq!(batch, orientations.len());
        let jobs: Vec<(ArrayView2<'_, f64>, &Orientation, ArrayView2<'_, Complex64>)> = points
            .axis_iter(Axis(0))
            .zip(orientations)
            .zip(cotangent.axis_iter(Axis(0)))
            .map(|((p, o), c)| (p, o, c))
            .collect();

        #[cfg(not(feature = "parallel"))]
        let iterator = jobs.iter();

        #[cfg(feature = "parallel")]
        let iterator = jobs.par_iter();

        let grads: Vec<Array2<f64>> = iterator
            .map(|(pts, o, cot)| self.backward_one(*pts, o, *cot))
            .collect();

        let mut out = Array3::zeros((batch, n_points, 4));
        for (b, grad) in grads.into_iter().enumerate() {
            out.slice_mut(s![b, .., ..]).assign(&grad);
        }
        out
    }

    fn render_one(&self, points: ArrayView2<'_, f64>, o: &Orientation) -> Array2<Complex64> {
        let n = self.size();
        let scale = n as f64;
        let center = scale / 2.0;
        let m = rotation_matrix(o.az, o.alt, o.phi);

        let mut img = Array2::<f64>::zeros((n, n));
        for op in self.symmetry.operators() {
            let t = m * op;
            for i in 0..points.nrows() {
                let p = Vector3::new(points[[i, 0]], points[[i, 1]], points[[i, 2]]);
                let amp = points[[i, 3]];
                let v = t * p;
                let pr = (-v.y + o.ty) * scale + center;
                let pc = (v.x + o.tx) * scale + center;
                let r0 = pr.floor();
                let c0 = pc.floor();
                if r0 < 0.0 || c0 < 0.0 || r0 + 1.0 >= scale || c0 + 1.0 >= scale {
                    continue;
                }
                let (fr, fc) = (pr - r0, pc - c0);
                let (r, c) = (r0 as usize, c0 as usize);
                img[[r, c]] += amp * (1.0 - fr) * (1.0 - fc);
                img[[r + 1, c]] += amp * fr * (1.0 - fc);
                img[[r + 1, c + 1]] += amp * fr * fc;
                img[[r, c + 1]] += amp * (1.0 - fr) * fc;
            }
        }
        self.grid.rfft2_centered(img.view())
    }

    fn backward_one(
        &self,
        points: ArrayView2<'_, f64>,
        o: &Orientation,
        cotangent: ArrayView2<'_, Complex64>,
    ) -> Array2<f64> {
        let n = self.size();
        let scale = n as f64;
        let center = scale / 2.0;
        let m = rotation_matrix(o.az, o.alt, o.phi);
        let grid_cot = self.grid.rfft2_adjoint(cotangent);

        let mut grad = Array2::zeros((points.nrows(), 4));
        for op in self.symmetry.operators() {
            let t = m * op;
            let t_t = t.transpose();
            for i in 0..points.nrows() {
                let p = Vector3::new(points[[i, 0]], points[[i, 1]], points[[i, 2]]);
                let amp = points[[i, 3]];
                let v = t * p;
                let pr = (-v.y + o.ty) * scale + center;
                let pc = (v.x + o.tx) * scale + center;
                let r0 = pr.floor();
                let c0 = pc.floor();
                if r0 < 0.0 || c0 < 0.0 || r0 + 1.0 >= scale || c0 + 1.0 >= scale {
                    continue;
                }
                let (fr, fc) = (pr - r0, pc - c0);
                let (r, c) = (r0 as usize, c0 as usize);
                let g00 = grid_cot[[r, c]];
                let g10 = grid_cot[[r + 1, c]];
                let g11 = grid_cot[[r + 1, c + 1]];
                let g01 = grid_cot[[r, c + 1]];

                grad[[i, 3]] += (1.0 - fr) * (1.0 - fc) * g00
                    + fr * (1.0 - fc) * g10
                    + fr * fc * g11
                    + (1.0 - fr) * fc * g01;

                let d_fr = amp * ((1.0 - fc) * (g10 - g00) + fc * (g11 - g01));
                let d_fc = amp * ((1.0 - fr) * (g01 - g00) + fr * (g11 - g10));
                // row coordinate is -y_rot + ty, column is x_rot + tx
                let rot_bar = Vector3::new(d_fc * scale, -d_fr * scale, 0.0);
                let p_bar = t_t * rot_bar;
                for ch in 0..3 {
                    grad[[i, ch]] += p_bar[ch];
                }
            }
        }
        grad
    }
}
