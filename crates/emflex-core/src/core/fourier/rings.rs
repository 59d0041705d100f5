use std::collections::HashMap;
use std::sync::Arc;

use ndarray::Array2;

/// Radial ring index for every half-plane Fourier pixel of one box size.
/// Row frequencies fold at the Nyquist row, so ring 1 collects both the
/// lowest positive and lowest negative row frequency.
#[derive(Debug, Clone)]
pub struct RingTable {
    size: usize,
    n_rings: usize,
    index: Array2<usize>,
}

impl RingTable {
    pub fn build(size: usize) -> Self {
        let n_rings = (size as f64 * 0.70711) as usize + 1;
        let half = size / 2 + 1;
        let mut index = Array2::zeros((size, half));
        for r in 0..size {
            let fr = r.min(size - r) as f64;
            for c in 0..half {
                index[[r, c]] = (c as f64).hypot(fr) as usize;
            }
        }
        Self {
            size,
            n_rings,
            index,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn n_rings(&self) -> usize {
        self.n_rings
    }

    #[inline]
    pub fn ring_at(&self, row: usize, col: usize) -> usize {
        self.index[[row, col]]
    }
}

/// Ring tables keyed by box size. The morph stage walks through three
/// resolution windows on one box, and evaluation may revisit sizes, so
/// tables are built once and shared.
#[derive(Debug, Default)]
pub struct RingCache {
    tables: HashMap<usize, Arc<RingTable>>,
}

impl RingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_build(&mut self, size: usize) -> Arc<RingTable> {
        self.tables
            .entry(size)
            .or_insert_with(|| Arc::new(RingTable::build(size)))
            .clone()
    }
}
