use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use ndarray::Array2;
use num_complex::Complex64;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::core::fourier::fft::{FourierGrid, fourier_crop};
use crate::core::project::Orientation;

const MAGIC: &[u8; 4] = b"EMFP";
const VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StackError {
    #[error("File I/O error for '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("CSV parsing error for '{path}': {source}")]
    Csv { path: String, source: csv::Error },

    #[error("Malformed particle stack '{path}': {message}")]
    Format { path: String, message: String },

    #[error("{images} stack images but {orientations} orientation rows")]
    CountMismatch { images: usize, orientations: usize },

    #[error("Working box of {working} px exceeds the particle box of {raw} px")]
    BoxTooSmall { working: usize, raw: usize },
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

/// One experimental particle: origin-phased half-plane spectrum at the
/// working box size plus its orientation. Read-only input to the loss.
#[derive(Debug, Clone)]
pub struct ParticleImage {
    pub spectrum: Array2<Complex64>,
    pub orientation: Orientation,
}

/// Writes a real-space square image stack: magic, version, image count,
/// box size, then row-major little-endian f64 data.
pub fn write_stack(path: &Path, images: &[Array2<f64>]) -> Result<(), StackError> {
    let io_err = |e| StackError::Io {
        path: path_str(path),
        source: e,
    };
    let size = images.first().map_or(0, |img| img.nrows());
    for img in images {
        if img.dim() != (size, size) {
            return Err(StackError::Format {
                path: path_str(path),
                message: format!("image of shape {:?} in a {size} px stack", img.dim()),
            });
        }
    }
    let mut out = BufWriter::new(File::create(path).map_err(io_err)?);
    out.write_all(MAGIC).map_err(io_err)?;
    out.write_all(&VERSION.to_le_bytes()).map_err(io_err)?;
    out.write_all(&(images.len() as u64).to_le_bytes())
        .map_err(io_err)?;
    out.write_all(&(size as u64).to_le_bytes()).map_err(io_err)?;
    for img in images {
        for v in img.iter() {
            out.write_all(&v.to_le_bytes()).map_err(io_err)?;
        }
    }
    out.flush().map_err(io_err)
}

pub fn load_stack(path: &Path) -> Result<Vec<Array2<f64>>, StackError> {
    let io_err = |e| StackError::Io {
        path: path_str(path),
        source: e,
    };
    let format_err = |message: String| StackError::Format {
        path: path_str(path),
        message,
    };
    let mut input = BufReader::new(File::open(path).map_err(io_err)?);

    let mut magic = [0u8; 4];
    input.read_exact(&mut magic).map_err(io_err)?;
    if &magic != MAGIC {
        return Err(format_err(format!("bad magic {magic:?}")));
    }
    let mut word = [0u8; 4];
    input.read_exact(&mut word).map_err(io_err)?;
    let version = u32::from_le_bytes(word);
    if version != VERSION {
        return Err(format_err(format!("unsupported version {version}")));
    }
    let mut long = [0u8; 8];
    input.read_exact(&mut long).map_err(io_err)?;
    let n_images = u64::from_le_bytes(long) as usize;
    input.read_exact(&mut long).map_err(io_err)?;
    let size = u64::from_le_bytes(long) as usize;
    if size == 0 || size % 2 != 0 {
        return Err(format_err(format!("box size {size} is not a positive even number")));
    }

    let mut images = Vec::with_capacity(n_images);
    let mut value = [0u8; 8];
    for _ in 0..n_images {
        let mut img = Array2::zeros((size, size));
        for v in img.iter_mut() {
            input
                .read_exact(&mut value)
                .map_err(|_| format_err("truncated image data".to_string()))?;
            *v = f64::from_le_bytes(value);
        }
        images.push(img);
    }
    debug!(n_images, size, path = %path.display(), "particle stack loaded");
    Ok(images)
}

#[derive(Debug, Deserialize)]
struct OrientationRecord {
    az: f64,
    alt: f64,
    phi: f64,
    tx: f64,
    ty: f64,
}

/// Orientation table: Euler angles in degrees, translations in box
/// fractions. Angles convert to radians on load.
pub fn load_orientations(path: &Path) -> Result<Vec<Orientation>, StackError> {
    let csv_err = |e| StackError::Csv {
        path: path_str(path),
        source: e,
    };
    let mut reader = csv::Reader::from_path(path).map_err(csv_err)?;
    let mut orientations = Vec::new();
    for result in reader.deserialize::<OrientationRecord>() {
        let r = result.map_err(csv_err)?;
        orientations.push(Orientation {
            az: r.az.to_radians(),
            alt: r.alt.to_radians(),
            phi: r.phi.to_radians(),
            tx: r.tx,
            ty: r.ty,
        });
    }
    Ok(orientations)
}

/// Transforms a raw real-space stack into working-size particle spectra:
/// centered rfft2 at the raw box, then Fourier crop down to the working box.
pub fn prepare_particles(
    images: &[Array2<f64>],
    orientations: &[Orientation],
    working_size: usize,
) -> Result<Vec<ParticleImage>, StackError> {
    if images.len() != orientations.len() {
        return Err(StackError::CountMismatch {
            images: images.len(),
            orientations: orientations.len(),
        });
    }
    let Some(first) = images.first() else {
        return Ok(Vec::new());
    };
    let raw = first.nrows();
    if working_size > raw {
        return Err(StackError::BoxTooSmall {
            working: working_size,
            raw,
        });
    }
    let grid = FourierGrid::new(raw);
    let particles = images
        .iter()
        .zip(orientations)
        .map(|(img, &orientation)| {
            let full = grid.rfft2_centered(img.view());
            let spectrum = if working_size < raw {
                fourier_crop(full.view(), working_size)
            } else {
                full
            };
            ParticleImage {
                spectrum,
                orientation,
            }
        })
        .collect();
    Ok(particles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn create_test_images(n: usize, size: usize) -> Vec<Array2<f64>> {
        (0..n)
            .map(|k| {
                Array2::from_shape_fn((size, size), |(r, c)| {
                    ((k + 1) as f64 * 0.3 + r as f64 * 0.7 + c as f64 * 0.1).sin()
                })
            })
            .collect()
    }

    #[test]
    fn stack_round_trips_through_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("particles.emfp");
        let images = create_test_images(3, 8);
        write_stack(&path, &images).unwrap();
        let reloaded = load_stack(&path).unwrap();
        assert_eq!(reloaded.len(), 3);
        for (a, b) in reloaded.iter().zip(&images) {
            assert_eq!(a, b);
        }
    }

    #[test]
    fn bad_magic_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.emfp");
        fs::write(&path, b"NOPE\x01\x00\x00\x00").unwrap();
        assert!(matches!(
            load_stack(&path),
            Err(StackError::Format { .. })
        ));
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("short.emfp");
        let images = create_test_images(1, 4);
        write_stack(&path, &images).unwrap();
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 8]).unwrap();
        assert!(matches!(
            load_stack(&path),
            Err(StackError::Format { .. })
        ));
    }

    #[test]
    fn orientations_convert_degrees_to_radians() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("orients.csv");
        fs::write(
            &path,
            "az,alt,phi,tx,ty\n90.0,45.0,-30.0,0.01,-0.02\n",
        )
        .unwrap();
        let orients = load_orientations(&path).unwrap();
        assert_eq!(orients.len(), 1);
        assert!((orients[0].az - std::f64::consts::FRAC_PI_2).abs() < 1e-12);
        assert!((orients[0].alt - std::f64::consts::FRAC_PI_4).abs() < 1e-12);
        assert!((orients[0].tx - 0.01).abs() < 1e-12);
    }

    #[test]
    fn preparation_crops_to_the_working_box() {
        let images = create_test_images(2, 8);
        let orients = vec![Orientation::default(); 2];
        let particles = prepare_particles(&images, &orients, 4).unwrap();
        assert_eq!(particles.len(), 2);
        assert_eq!(particles[0].spectrum.dim(), (4, 3));

        // the cropped spectrum keeps the low-frequency block
        let full = FourierGrid::new(8).rfft2_centered(images[0].view());
        assert_eq!(particles[0].spectrum[[1, 1]], full[[1, 1]]);
    }

    #[test]
    fn orientation_count_mismatch_is_rejected() {
        let images = create_test_images(2, 8);
        let orients = vec![Orientation::default(); 3];
        assert!(matches!(
            prepare_particles(&images, &orients, 8),
            Err(StackError::CountMismatch { .. })
        ));
    }
}
