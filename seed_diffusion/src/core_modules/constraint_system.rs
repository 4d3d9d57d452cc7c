// THEORY:
// The `ConstraintSystemAssembler` turns the affinity windows and the seed masks
// into one sparse (H·W)×(H·W) linear system, A·x = b, shared by every class.
//
// Row p of A describes pixel p:
//   - Unseeded interior pixel: a diffusion row. Diagonal 1, and for every
//     neighbor q in its window the (negative) normalized weight. Solving makes
//     x[p] the weighted average of its similar neighbors.
//   - Seeded pixel or border pixel (no window): an identity row. x[p] = b[p],
//     i.e. the pixel keeps its seed value.
//
// Assembly is additive coordinate assembly. Off-diagonal triplets are emitted
// for unseeded interior pixels only, and only where the weight is non-zero;
// window centers are never read. Then a (p, p, 1) triplet is emitted for every
// pixel of the grid. Triplets sharing a coordinate are summed when the
// coordinate list is compressed into column-major storage.
//
// Every row carries a unit diagonal and its off-diagonal entries sum to -1 or
// 0, so the system is (weakly) diagonally dominant and well posed.

use sprs::{CsMat, TriMat};
use tracing::debug;

use crate::core_modules::affinity::AffinityField;
use crate::core_modules::error::{PropagationError, Result};
use crate::core_modules::grid::SeedMask;
use crate::core_modules::neighborhood::{NeighborhoodExtractor, WindowSize};

/// The assembled sparse system matrix, stored compressed by column.
#[derive(Debug, Clone, PartialEq)]
pub struct ConstraintMatrix {
    matrix: CsMat<f64>,
}

impl ConstraintMatrix {
    /// Number of rows (and columns), H·W.
    pub fn dim(&self) -> usize {
        self.matrix.rows()
    }

    /// Number of stored entries.
    pub fn nnz(&self) -> usize {
        self.matrix.nnz()
    }

    /// Entry at `(row, col)`, 0 when not stored.
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.matrix.get(row, col).copied().unwrap_or(0.0)
    }

    /// Stored entries of one row as `(col, value)`, by increasing column.
    /// Scans every column, so meant for inspection rather than hot loops.
    pub fn row(&self, row: usize) -> Vec<(usize, f64)> {
        self.matrix
            .outer_iterator()
            .enumerate()
            .filter_map(|(col, column)| column.get(row).map(|v| (col, *v)))
            .collect()
    }

    /// Every stored entry as `(row, col, value)`, column by column.
    pub fn triplets(&self) -> Vec<(usize, usize, f64)> {
        let mut out = Vec::with_capacity(self.nnz());
        for (col, column) in self.matrix.outer_iterator().enumerate() {
            for (row, value) in column.iter() {
                out.push((row, col, *value));
            }
        }
        out
    }

    pub fn as_csc(&self) -> &CsMat<f64> {
        &self.matrix
    }
}

/// Marks every pixel that belongs to at least one seed mask.
pub fn seeded_pixels(seeds: &[SeedMask]) -> Vec<bool> {
    let len = seeds.first().map_or(0, |s| s.len());
    let mut seeded = vec![false; len];
    for mask in seeds {
        for (flag, &value) in seeded.iter_mut().zip(mask.as_slice()) {
            *flag |= value != 0.0;
        }
    }
    seeded
}

/// Builds the sparse constraint matrix from affinity windows and seed masks.
#[derive(Debug, Clone, Copy)]
pub struct ConstraintSystemAssembler {
    extractor: NeighborhoodExtractor,
}

impl ConstraintSystemAssembler {
    pub fn new(window: WindowSize) -> Self {
        Self {
            extractor: NeighborhoodExtractor::new(window),
        }
    }

    pub fn assemble(&self, affinity: &AffinityField, seeds: &[SeedMask]) -> Result<ConstraintMatrix> {
        let window = self.extractor.window();
        if affinity.window() != window {
            return Err(PropagationError::count_mismatch(
                "affinity window size",
                window.get(),
                affinity.window().get(),
            ));
        }
        let (height, width) = affinity.shape();
        let first = seeds.first().ok_or(PropagationError::EmptySeeds)?;
        for mask in seeds {
            if mask.shape() != (height, width) {
                return Err(PropagationError::shape_mismatch(
                    "seed mask",
                    (height, width),
                    mask.shape(),
                ));
            }
        }
        debug_assert_eq!(first.len(), height * width);

        let size = height * width;
        let seeded = seeded_pixels(seeds);
        let center = window.center();
        let index_windows = self.extractor.index_windows(height, width);

        let mut triplets =
            TriMat::with_capacity((size, size), affinity.interior_count() * (window.area() - 1) + size);
        let mut seeded_interior = 0usize;
        for (weights, indices) in affinity.windows().zip(&index_windows) {
            let row = indices[center];
            if seeded[row] {
                seeded_interior += 1;
                continue;
            }
            for (entry, (&weight, &col)) in weights.iter().zip(indices).enumerate() {
                if entry == center || weight == 0.0 {
                    continue;
                }
                triplets.add_triplet(row, col, weight);
            }
        }
        for pixel in 0..size {
            triplets.add_triplet(pixel, pixel, 1.0);
        }

        let matrix: CsMat<f64> = triplets.to_csc();
        debug!(
            dim = size,
            nnz = matrix.nnz(),
            seeded_interior,
            "assembled constraint matrix"
        );
        Ok(ConstraintMatrix { matrix })
    }
}
