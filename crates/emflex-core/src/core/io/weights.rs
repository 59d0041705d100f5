use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use thiserror::Error;
use tracing::debug;

use crate::core::nn::dense::Dense;

const MAGIC: &[u8; 4] = b"EMFW";
const VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum WeightsError {
    #[error("File I/O error for '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Malformed weights file '{path}': {message}")]
    Format { path: String, message: String },

    #[error(
        "Weights file '{path}' layer {layer} is {found_in}×{found_out}, \
         the decoder expects {expected_in}×{expected_out}"
    )]
    Shape {
        path: String,
        layer: usize,
        expected_in: usize,
        expected_out: usize,
        found_in: usize,
        found_out: usize,
    },
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

/// Saves decoder layers in composition order: magic, version, layer count,
/// then per layer the input/output dims, the weight matrix row-major, and
/// the bias, all little-endian f64.
pub fn save_weights(path: &Path, layers: &[Dense]) -> Result<(), WeightsError> {
    let io_err = |e| WeightsError::Io {
        path: path_str(path),
        source: e,
    };
    let mut out = BufWriter::new(File::create(path).map_err(io_err)?);
    out.write_all(MAGIC).map_err(io_err)?;
    out.write_all(&VERSION.to_le_bytes()).map_err(io_err)?;
    out.write_all(&(layers.len() as u64).to_le_bytes())
        .map_err(io_err)?;
    for layer in layers {
        out.write_all(&(layer.input_dim() as u64).to_le_bytes())
            .map_err(io_err)?;
        out.write_all(&(layer.output_dim() as u64).to_le_bytes())
            .map_err(io_err)?;
        for v in layer.weights.iter() {
            out.write_all(&v.to_le_bytes()).map_err(io_err)?;
        }
        for v in layer.bias.iter() {
            out.write_all(&v.to_le_bytes()).map_err(io_err)?;
        }
    }
    out.flush().map_err(io_err)
}

/// Loads a checkpoint into existing layers, verifying every shape against
/// the decoder the caller built. Activations stay with the layers; only the
/// parameters move.
pub fn load_weights(path: &Path, layers: &mut [Dense]) -> Result<(), WeightsError> {
    let io_err = |e| WeightsError::Io {
        path: path_str(path),
        source: e,
    };
    let format_err = |message: String| WeightsError::Format {
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
    let n_layers = u64::from_le_bytes(long) as usize;
    if n_layers != layers.len() {
        return Err(format_err(format!(
            "{n_layers} layers on disk, the decoder has {}",
            layers.len()
        )));
    }

    let mut value = [0u8; 8];
    for (index, layer) in layers.iter_mut().enumerate() {
        input.read_exact(&mut long).map_err(io_err)?;
        let found_in = u64::from_le_bytes(long) as usize;
        input.read_exact(&mut long).map_err(io_err)?;
        let found_out = u64::from_le_bytes(long) as usize;
        if (found_in, found_out) != (layer.input_dim(), layer.output_dim()) {
            return Err(WeightsError::Shape {
                path: path_str(path),
                layer: index,
                expected_in: layer.input_dim(),
                expected_out: layer.output_dim(),
                found_in,
                found_out,
            });
        }
        for v in layer.weights.iter_mut() {
            input
                .read_exact(&mut value)
                .map_err(|_| format_err("truncated weight data".to_string()))?;
            *v = f64::from_le_bytes(value);
        }
        for v in layer.bias.iter_mut() {
            input
                .read_exact(&mut value)
                .map_err(|_| format_err("truncated bias data".to_string()))?;
            *v = f64::from_le_bytes(value);
        }
    }
    debug!(n_layers, path = %path.display(), "decoder weights loaded");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::nn::dense::Activation;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use tempfile::tempdir;

    fn create_test_layers(seed: u64) -> Vec<Dense> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        vec![
            Dense::glorot(4, 6, Activation::Relu, &mut rng),
            Dense::near_zero(6, 8, 0.1, &mut rng),
        ]
    }

    #[test]
    fn checkpoint_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("morph.emfw");
        let saved = create_test_layers(1);
        save_weights(&path, &saved).unwrap();

        let mut loaded = create_test_layers(2);
        assert_ne!(loaded[0].weights, saved[0].weights);
        load_weights(&path, &mut loaded).unwrap();
        for (a, b) in loaded.iter().zip(&saved) {
            assert_eq!(a.weights, b.weights);
            assert_eq!(a.bias, b.bias);
        }
    }

    #[test]
    fn shape_mismatch_is_rejected_with_layer_context() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("morph.emfw");
        save_weights(&path, &create_test_layers(1)).unwrap();

        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut other = vec![
            Dense::glorot(4, 6, Activation::Relu, &mut rng),
            Dense::near_zero(6, 9, 0.1, &mut rng),
        ];
        let err = load_weights(&path, &mut other).unwrap_err();
        match err {
            WeightsError::Shape { layer, found_out, expected_out, .. } => {
                assert_eq!(layer, 1);
                assert_eq!(found_out, 8);
                assert_eq!(expected_out, 9);
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn layer_count_mismatch_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("morph.emfw");
        save_weights(&path, &create_test_layers(1)).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let mut single = vec![Dense::glorot(4, 6, Activation::Relu, &mut rng)];
        assert!(matches!(
            load_weights(&path, &mut single),
            Err(WeightsError::Format { .. })
        ));
    }
}
