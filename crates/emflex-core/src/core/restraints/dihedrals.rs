use nalgebra::Vector3;
use ndarray::ArrayView3;

/// Fetches one atom position from a batched (batch, n, 3) array.
#[inline]
pub(crate) fn atom(pos: &ArrayView3<f64>, b: usize, i: usize) -> Vector3<f64> {
    Vector3::new(pos[[b, i, 0]], pos[[b, i, 1]], pos[[b, i, 2]])
}

/// Signed dihedral in radians, in (−π, π]: zero for cis, ±π for trans.
pub fn dihedral(p0: Vector3<f64>, p1: Vector3<f64>, p2: Vector3<f64>, p3: Vector3<f64>) -> f64 {
    let b1 = p1 - p0;
    let b2 = p2 - p1;
    let b3 = p3 - p2;
    let n1 = b1.cross(&b2);
    let n2 = b2.cross(&b3);
    let m1 = n1.cross(&(b2 / b2.norm().max(1e-12)));
    m1.dot(&n2).atan2(n1.dot(&n2))
}

/// Dihedral plus its gradient with respect to the four atoms, in radians.
/// Degenerate (collinear) geometry yields a zero gradient.
pub fn dihedral_grad(
    p0: Vector3<f64>,
    p1: Vector3<f64>,
    p2: Vector3<f64>,
    p3: Vector3<f64>,
) -> (f64, [Vector3<f64>; 4]) {
    let b1 = p1 - p0;
    let b2 = p2 - p1;
    let b3 = p3 - p2;
    let n1 = b1.cross(&b2);
    let n2 = b2.cross(&b3);
    let lb2 = b2.norm();
    let (ln1, ln2) = (n1.norm_squared(), n2.norm_squared());

    let m1 = n1.cross(&(b2 / lb2.max(1e-12)));
    let phi = m1.dot(&n2).atan2(n1.dot(&n2));

    if ln1 < 1e-12 || ln2 < 1e-12 || lb2 < 1e-12 {
        return (phi, [Vector3::zeros(); 4]);
    }

    let t = (lb2 / ln1) * n1;
    let u = -(lb2 / ln2) * n2;
    let s = (b1.dot(&b2) * t - b3.dot(&b2) * u) / (lb2 * lb2);
    (phi, [t, -t + s, -u - s, u])
}
