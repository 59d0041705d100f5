use nalgebra::Vector3;
use ndarray::{Array3, ArrayView3, s};

use super::ModelError;

const DEGENERATE_FRAME: f64 = 1e-9;

/// One riding hydrogen: rebuilt every step from its parent heavy atom and
/// two reference heavy atoms. `offset` is expressed in the local orthonormal
/// frame spanned by parent → ref_a (e1), the ref_b direction orthogonalized
/// against e1 (e2), and their cross product (e3).
#[derive(Debug, Clone, PartialEq)]
pub struct HydrogenRow {
    pub name: String,
    pub parent: usize,
    pub ref_a: usize,
    pub ref_b: usize,
    pub offset: [f64; 3],
    pub radius: f64,
}

/// The full hydrogen reconstruction table. Placement is a differentiable
/// function of the heavy-atom positions; `backward` pushes cotangents from
/// hydrogen slots onto the three defining heavy atoms.
#[derive(Debug, Clone)]
pub struct HydrogenSet {
    rows: Vec<HydrogenRow>,
    n_heavy: usize,
}

struct Frame {
    p0: Vector3<f64>,
    u: Vector3<f64>,
    v: Vector3<f64>,
    e1: Vector3<f64>,
    w: Vector3<f64>,
    e2: Vector3<f64>,
    degenerate: bool,
}

fn vec_at(pos: &ArrayView3<f64>, b: usize, i: usize) -> Vector3<f64> {
    Vector3::new(pos[[b, i, 0]], pos[[b, i, 1]], pos[[b, i, 2]])
}

impl HydrogenSet {
    pub fn new(rows: Vec<HydrogenRow>, n_heavy: usize) -> Result<Self, ModelError> {
        for row in &rows {
            for index in [row.parent, row.ref_a, row.ref_b] {
                if index >= n_heavy {
                    return Err(ModelError::IndexOutOfRange {
                        table: "hydrogens",
                        index,
                        n_atoms: n_heavy,
                    });
                }
            }
        }
        Ok(Self { rows, n_heavy })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn n_heavy(&self) -> usize {
        self.n_heavy
    }

    pub fn rows(&self) -> &[HydrogenRow] {
        &self.rows
    }

    fn frame(&self, pos: &ArrayView3<f64>, b: usize, row: &HydrogenRow) -> Frame {
        let p0 = vec_at(pos, b, row.parent);
        let u = vec_at(pos, b, row.ref_a) - p0;
        let v = vec_at(pos, b, row.ref_b) - p0;
        let nu = u.norm();
        if nu < DEGENERATE_FRAME {
            return Frame {
                p0,
                u,
                v,
                e1: Vector3::zeros(),
                w: Vector3::zeros(),
                e2: Vector3::zeros(),
                degenerate: true,
            };
        }
        let e1 = u / nu;
        let w = v - v.dot(&e1) * e1;
        let nw = w.norm();
        if nw < DEGENERATE_FRAME {
            return Frame {
                p0,
                u,
                v,
                e1,
                w,
                e2: Vector3::zeros(),
                degenerate: true,
            };
        }
        let e2 = w / nw;
        Frame {
            p0,
            u,
            v,
            e1,
            w,
            e2,
            degenerate: false,
        }
    }

    /// Places all hydrogens from heavy-atom positions in ångströms, shape
    /// (B, n_heavy, 3), returning the widened (B, n_heavy + n_h, 3) array
    /// with the heavy block copied through. A degenerate frame (collinear
    /// references) drops the hydrogen onto its parent.
    pub fn place(&self, heavy: ArrayView3<f64>) -> Array3<f64> {
        let (batch, n_heavy, _) = heavy.dim();
        debug_assert_eq!(n_heavy, self.n_heavy);
        let mut out = Array3::zeros((batch, n_heavy + self.rows.len(), 3));
        out.slice_mut(s![.., ..n_heavy, ..]).assign(&heavy);
        for b in 0..batch {
            for (k, row) in self.rows.iter().enumerate() {
                let f = self.frame(&heavy, b, row);
                let h = if f.degenerate {
                    f.p0
                } else {
                    let e3 = f.e1.cross(&f.e2);
                    f.p0 + row.offset[0] * f.e1 + row.offset[1] * f.e2 + row.offset[2] * e3
                };
                for c in 0..3 {
                    out[[b, n_heavy + k, c]] = h[c];
                }
            }
        }
        out
    }

    /// Pulls cotangents on the widened array back onto heavy atoms. The
    /// heavy block passes through unchanged; each hydrogen slot distributes
    /// its cotangent over parent, ref_a, and ref_b through the frame.
    pub fn backward(&self, heavy: ArrayView3<f64>, grad_full: ArrayView3<f64>) -> Array3<f64> {
        let (batch, n_heavy, _) = heavy.dim();
        debug_assert_eq!(n_heavy, self.n_heavy);
        debug_assert_eq!(grad_full.dim().1, n_heavy + self.rows.len());
        let mut grad = grad_full.slice(s![.., ..n_heavy, ..]).to_owned();
        for b in 0..batch {
            for (k, row) in self.rows.iter().enumerate() {
                let hbar = vec_at(&grad_full, b, n_heavy + k);
                let f = self.frame(&heavy, b, row);
                if f.degenerate {
                    for c in 0..3 {
                        grad[[b, row.parent, c]] += hbar[c];
                    }
                    continue;
                }
                let [a, bb, cc] = row.offset;
                let mut e1_bar = a * hbar + f.e2.cross(&(cc * hbar));
                let e2_bar = bb * hbar + (cc * hbar).cross(&f.e1);

                // e2 = w / |w|
                let nw = f.w.norm();
                let w_bar = (e2_bar - e2_bar.dot(&f.e2) * f.e2) / nw;
                // w = v - (v . e1) e1
                let v_bar = w_bar - w_bar.dot(&f.e1) * f.e1;
                e1_bar += -w_bar.dot(&f.e1) * f.v - f.v.dot(&f.e1) * w_bar;
                // e1 = u / |u|
                let nu = f.u.norm();
                let u_bar = (e1_bar - e1_bar.dot(&f.e1) * f.e1) / nu;

                let p0_bar = hbar - u_bar - v_bar;
                for c in 0..3 {
                    grad[[b, row.parent, c]] += p0_bar[c];
                    grad[[b, row.ref_a, c]] += u_bar[c];
                    grad[[b, row.ref_b, c]] += v_bar[c];
                }
            }
        }
        grad
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn create_test_set() -> HydrogenSet {
        HydrogenSet::new(
            vec![HydrogenRow {
                name: "H".to_string(),
                parent: 0,
                ref_a: 1,
                ref_b: 2,
                offset: [0.3, 0.4, 0.5],
                radius: 1.1,
            }],
            3,
        )
        .unwrap()
    }

    fn create_test_positions() -> Array3<f64> {
        let mut pos = Array3::zeros((1, 3, 3));
        pos[[0, 0, 0]] = 0.2;
        pos[[0, 0, 1]] = -0.1;
        pos[[0, 0, 2]] = 0.4;
        pos[[0, 1, 0]] = 1.5;
        pos[[0, 1, 1]] = 0.3;
        pos[[0, 1, 2]] = 0.1;
        pos[[0, 2, 0]] = 0.5;
        pos[[0, 2, 1]] = 1.4;
        pos[[0, 2, 2]] = -0.3;
        pos
    }

    #[test]
    fn axis_aligned_frame_reproduces_the_offset() {
        let set = create_test_set();
        let mut pos = Array3::zeros((1, 3, 3));
        pos[[0, 1, 0]] = 2.0; // ref_a on +x
        pos[[0, 2, 1]] = 3.0; // ref_b on +y
        let out = set.place(pos.view());
        assert_eq!(out.dim(), (1, 4, 3));
        assert!((out[[0, 3, 0]] - 0.3).abs() < 1e-12);
        assert!((out[[0, 3, 1]] - 0.4).abs() < 1e-12);
        assert!((out[[0, 3, 2]] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn placement_is_rigid_under_translation() {
        let set = create_test_set();
        let pos = create_test_positions();
        let out = set.place(pos.view());
        let shifted = &pos + 2.5;
        let out_shifted = set.place(shifted.view());
        for c in 0..3 {
            assert!((out_shifted[[0, 3, c]] - out[[0, 3, c]] - 2.5).abs() < 1e-10);
        }
    }

    #[test]
    fn backward_matches_finite_differences() {
        let set = create_test_set();
        let pos = create_test_positions();
        // fixed cotangent on the hydrogen slot only
        let cot = [0.7, -0.2, 1.1];
        let mut grad_full = Array3::zeros((1, 4, 3));
        for c in 0..3 {
            grad_full[[0, 3, c]] = cot[c];
        }
        let grad = set.backward(pos.view(), grad_full.view());

        let loss = |p: &Array3<f64>| -> f64 {
            let out = set.place(p.view());
            (0..3).map(|c| cot[c] * out[[0, 3, c]]).sum()
        };
        let eps = 1e-6;
        for i in 0..3 {
            for c in 0..3 {
                let mut plus = pos.clone();
                plus[[0, i, c]] += eps;
                let mut minus = pos.clone();
                minus[[0, i, c]] -= eps;
                let numeric = (loss(&plus) - loss(&minus)) / (2.0 * eps);
                assert!(
                    (grad[[0, i, c]] - numeric).abs() < 1e-6,
                    "atom {i} coord {c}: analytic {} vs numeric {}",
                    grad[[0, i, c]],
                    numeric
                );
            }
        }
    }

    #[test]
    fn reference_past_heavy_count_is_rejected() {
        let result = HydrogenSet::new(
            vec![HydrogenRow {
                name: "H".to_string(),
                parent: 0,
                ref_a: 7,
                ref_b: 2,
                offset: [0.0; 3],
                radius: 1.1,
            }],
            3,
        );
        assert!(matches!(result, Err(ModelError::IndexOutOfRange { .. })));
    }
}
