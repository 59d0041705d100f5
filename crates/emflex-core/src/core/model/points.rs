use ndarray::{Array2, Array3, ArrayView3, ArrayViewMut3};

use super::ModelError;

/// Channel layout of a point row: x, y, z in normalized box coordinates
/// (approx [-0.5, 0.5]), then amplitude.
pub const POINT_CHANNELS: usize = 4;

/// The canonical point-cloud representation: a plain (N, 4) array owned by
/// the model. Differentiable stages read it and produce fresh displaced
/// arrays; nothing mutates it in place after load.
#[derive(Debug, Clone)]
pub struct PointCloud {
    data: Array2<f64>,
}

impl PointCloud {
    pub fn new(data: Array2<f64>) -> Result<Self, ModelError> {
        if data.ncols() != POINT_CHANNELS {
            return Err(ModelError::LengthMismatch {
                table: "point cloud columns",
                expected: POINT_CHANNELS,
                found: data.ncols(),
            });
        }
        Ok(Self { data })
    }

    pub fn len(&self) -> usize {
        self.data.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.data.nrows() == 0
    }

    pub fn array(&self) -> &Array2<f64> {
        &self.data
    }

    /// The neutral cloud broadcast to a batch of `n` copies.
    pub fn repeat(&self, n: usize) -> Array3<f64> {
        let (rows, cols) = self.data.dim();
        let mut out = Array3::zeros((n, rows, cols));
        for mut frame in out.outer_iter_mut() {
            frame.assign(&self.data);
        }
        out
    }
}

/// The working pixel grid: box size in pixels and pixel size in Ångströms.
///
/// Derived from the raw data box so that the physical extent is preserved:
/// `working_apix · working_size == raw_apix · raw_size`. The box/physical
/// conversion negates the y and z axes between the two frames.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridFrame {
    pub size: usize,
    pub apix: f64,
}

impl GridFrame {
    /// Working grid targeting `resolution` Å from a raw box. The working box
    /// is the even floor of `⌈2 · raw_size · raw_apix / resolution⌉` and may
    /// not exceed the raw box.
    pub fn from_raw(raw_size: usize, raw_apix: f64, resolution: f64) -> Result<Self, ModelError> {
        let target = (raw_size as f64 * raw_apix / resolution * 2.0).ceil() as usize;
        let size = target / 2 * 2;
        if size > raw_size {
            return Err(ModelError::BoxTooLarge {
                working: size,
                raw: raw_size,
            });
        }
        let apix = raw_apix * raw_size as f64 / size as f64;
        Ok(Self { size, apix })
    }

    /// Physical box extent in Ångströms.
    pub fn extent(&self) -> f64 {
        self.apix * self.size as f64
    }

    /// One physical coordinate into the normalized box frame.
    pub fn box_from_physical(&self, xyz: [f64; 3]) -> [f64; 3] {
        let e = self.extent();
        [
            xyz[0] / e - 0.5,
            -(xyz[1] / e - 0.5),
            -(xyz[2] / e - 0.5),
        ]
    }

    /// One box coordinate back to Ångströms.
    pub fn physical_from_box(&self, xyz: [f64; 3]) -> [f64; 3] {
        let e = self.extent();
        [
            (xyz[0] + 0.5) * e,
            (-xyz[1] + 0.5) * e,
            (-xyz[2] + 0.5) * e,
        ]
    }

    /// Batched box → physical conversion of the first three channels.
    pub fn to_physical(&self, cloud: ArrayView3<'_, f64>) -> Array3<f64> {
        let (b, n, _) = cloud.dim();
        let e = self.extent();
        let mut out = Array3::zeros((b, n, 3));
        for bi in 0..b {
            for ni in 0..n {
                out[[bi, ni, 0]] = (cloud[[bi, ni, 0]] + 0.5) * e;
                out[[bi, ni, 1]] = (-cloud[[bi, ni, 1]] + 0.5) * e;
                out[[bi, ni, 2]] = (-cloud[[bi, ni, 2]] + 0.5) * e;
            }
        }
        out
    }

    /// Accumulates a physical-frame cotangent into a box-frame cotangent
    /// (first three channels of `grad_box`).
    pub fn add_physical_gradient(
        &self,
        grad_physical: ArrayView3<'_, f64>,
        mut grad_box: ArrayViewMut3<'_, f64>,
    ) {
        let (b, n, _) = grad_physical.dim();
        let e = self.extent();
        for bi in 0..b {
            for ni in 0..n {
                grad_box[[bi, ni, 0]] += grad_physical[[bi, ni, 0]] * e;
                grad_box[[bi, ni, 1]] -= grad_physical[[bi, ni, 1]] * e;
                grad_box[[bi, ni, 2]] -= grad_physical[[bi, ni, 2]] * e;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn working_grid_from_raw_box() {
        let frame = GridFrame::from_raw(256, 1.0, 8.0).unwrap();
        assert_eq!(frame.size, 64);
        assert!((frame.apix - 4.0).abs() < 1e-12);
        assert!((frame.extent() - 256.0).abs() < 1e-12);
    }

    #[test]
    fn too_fine_resolution_is_rejected() {
        let result = GridFrame::from_raw(64, 1.0, 1.0);
        assert!(matches!(result, Err(ModelError::BoxTooLarge { .. })));
    }

    #[test]
    fn physical_round_trip_negates_y_and_z() {
        let frame = GridFrame { size: 100, apix: 2.0 };
        let p = [12.0, 150.0, 37.5];
        let b = frame.box_from_physical(p);
        let back = frame.physical_from_box(b);
        for k in 0..3 {
            assert!((back[k] - p[k]).abs() < 1e-9);
        }
        // y above center maps to a negative box coordinate
        assert!(b[1] < 0.0);
    }

    #[test]
    fn batched_conversion_matches_scalar() {
        let frame = GridFrame { size: 64, apix: 1.5 };
        let cloud = arr2(&[[0.1, -0.2, 0.3, 1.0]]).insert_axis(ndarray::Axis(0));
        let phys = frame.to_physical(cloud.view());
        let scalar = frame.physical_from_box([0.1, -0.2, 0.3]);
        for k in 0..3 {
            assert!((phys[[0, 0, k]] - scalar[k]).abs() < 1e-12);
        }
    }

    #[test]
    fn cloud_repeat_broadcasts_rows() {
        let cloud = PointCloud::new(arr2(&[[0.0, 0.1, 0.2, 1.0], [0.3, 0.4, 0.5, 2.0]])).unwrap();
        let batch = cloud.repeat(3);
        assert_eq!(batch.dim(), (3, 2, 4));
        assert_eq!(batch[[2, 1, 3]], 2.0);
    }
}
