// THEORY:
// The `SharedFactorization` is the two-phase solver of the engine:
//   1. `factorize` computes a sparse LU decomposition of the constraint matrix
//      once. This is the expensive step.
//   2. `solve` is then called once per seed channel, each time with that
//      channel's flattened mask as the right-hand side, reusing the same factors.
//
// Every class shares one matrix (only the right-hand side differs), so K
// classes cost one factorization plus K cheap triangular solves. The factors are
// immutable after construction and safe to share between threads, which is what
// the parallel pipeline relies on.
//
// A factorization failure, or a solve that produces non-finite values, means
// the assembled matrix was singular. That can only come from an assembly bug,
// so it is reported as fatal and never retried.

use std::time::Instant;

use faer::prelude::SpSolver;
use faer::sparse::linalg::solvers::Lu;
use faer::sparse::{SparseColMat, SymbolicSparseColMat};
use faer::Mat;
use tracing::{debug, trace};

use crate::core_modules::constraint_system::ConstraintMatrix;
use crate::core_modules::error::{PropagationError, Result};
use crate::core_modules::grid::{Grid, LabelField, SeedMask};

/// A sparse LU factorization of the constraint matrix, reusable across right-hand sides.
pub struct SharedFactorization {
    dim: usize,
    lu: Lu<usize, f64>,
}

impl std::fmt::Debug for SharedFactorization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedFactorization")
            .field("dim", &self.dim)
            .finish_non_exhaustive()
    }
}

impl SharedFactorization {
    /// Factorizes `matrix`. Fails with `SingularSystem` if the decomposition fails.
    pub fn factorize(matrix: &ConstraintMatrix) -> Result<Self> {
        let started = Instant::now();
        let dim = matrix.dim();
        let csc = matrix.as_csc();
        // sprs keeps row indices sorted and unique within each column, which is
        // the layout faer's symbolic structure expects.
        let symbolic = SymbolicSparseColMat::<usize>::new_checked(
            dim,
            dim,
            csc.indptr().to_proper().into_owned(),
            None,
            csc.indices().to_vec(),
        );
        let sparse = SparseColMat::<usize, f64>::new(symbolic, csc.data().to_vec());
        let lu = sparse
            .as_ref()
            .sp_lu()
            .map_err(|err| PropagationError::SingularSystem {
                reason: format!("sparse LU failed: {err:?}"),
            })?;
        debug!(
            dim,
            nnz = matrix.nnz(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "factorized constraint matrix"
        );
        Ok(Self { dim, lu })
    }

    /// Size of the factorized system, H·W.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Solves `A·x = rhs` for a flattened right-hand side.
    pub fn solve_flat(&self, rhs: &[f64]) -> Result<Vec<f64>> {
        if rhs.len() != self.dim {
            return Err(PropagationError::count_mismatch(
                "right-hand side length",
                self.dim,
                rhs.len(),
            ));
        }
        let mut x = Mat::<f64>::from_fn(self.dim, 1, |i, _| rhs[i]);
        self.lu.solve_in_place(x.as_mut());

        let solution: Vec<f64> = (0..self.dim).map(|i| x.read(i, 0)).collect();
        if let Some(bad) = solution.iter().position(|v| !v.is_finite()) {
            return Err(PropagationError::SingularSystem {
                reason: format!("non-finite solution at pixel {bad}"),
            });
        }
        Ok(solution)
    }

    /// Solves for one seed channel and reshapes the result to the mask's H×W.
    pub fn solve(&self, seed: &SeedMask) -> Result<LabelField> {
        let solution = self.solve_flat(seed.as_slice())?;
        trace!(pixels = solution.len(), "solved seed channel");
        Grid::from_vec(seed.height(), seed.width(), solution)
    }

    /// Solves every seed channel against the shared factors, in channel order.
    pub fn solve_all(&self, seeds: &[SeedMask]) -> Result<Vec<LabelField>> {
        seeds.iter().map(|seed| self.solve(seed)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::affinity::AffinityBuilder;
    use crate::core_modules::constraint_system::ConstraintSystemAssembler;
    use crate::core_modules::grid::Image;
    use crate::core_modules::neighborhood::WindowSize;
    use approx::assert_abs_diff_eq;

    fn system(field: &Grid<f64>, seeds: &[SeedMask]) -> ConstraintMatrix {
        let window = WindowSize::new(3).unwrap();
        let affinity = AffinityBuilder::new(window)
            .build(&Image::replicated(field, 3).unwrap())
            .unwrap();
        ConstraintSystemAssembler::new(window)
            .assemble(&affinity, seeds)
            .unwrap()
    }

    #[test]
    fn identity_system_returns_rhs() {
        let flat = Grid::filled(4, 4, 0.3);
        let mut seed = Grid::filled(4, 4, 0.0);
        seed.set(1, 2, 1.0);
        let factors = SharedFactorization::factorize(&system(&flat, &[seed.clone()])).unwrap();
        let field = factors.solve(&seed).unwrap();
        assert_eq!(field, seed);
    }

    #[test]
    fn solution_satisfies_the_system() {
        let image = Grid::from_fn(6, 6, |r, c| ((r * 2 + c) % 5) as f64 / 4.0);
        let mut seed = Grid::filled(6, 6, 0.0);
        seed.set(2, 2, 1.0);
        let matrix = system(&image, &[seed.clone()]);
        let factors = SharedFactorization::factorize(&matrix).unwrap();
        let x = factors.solve(&seed).unwrap();

        let mut residual = seed.as_slice().to_vec();
        for (row, col, value) in matrix.triplets() {
            residual[row] -= value * x.as_slice()[col];
        }
        for r in residual {
            assert_abs_diff_eq!(r, 0.0, epsilon = 1e-10);
        }
    }

    #[test]
    fn wide_window_system_is_solved_from_compressed_columns() {
        let window = WindowSize::new(5).unwrap();
        let image = Grid::from_fn(7, 8, |r, c| ((r * 5 + c * 3) % 9) as f64 / 8.0);
        let mut seed = Grid::filled(7, 8, 0.0);
        seed.set(3, 0, 1.0);
        let affinity = AffinityBuilder::new(window)
            .build(&Image::replicated(&image, 3).unwrap())
            .unwrap();
        let matrix = ConstraintSystemAssembler::new(window)
            .assemble(&affinity, &[seed.clone()])
            .unwrap();
        let factors = SharedFactorization::factorize(&matrix).unwrap();
        assert_eq!(factors.dim(), 56);
        let x = factors.solve(&seed).unwrap();

        let csc = matrix.as_csc();
        let mut residual = seed.as_slice().to_vec();
        for (col, column) in csc.outer_iterator().enumerate() {
            for (row, value) in column.iter() {
                residual[row] -= value * x.as_slice()[col];
            }
        }
        for r in residual {
            assert_abs_diff_eq!(r, 0.0, epsilon = 1e-10);
        }
    }

    #[test]
    fn solve_all_keeps_channel_order() {
        let image = Grid::from_fn(5, 5, |r, c| (r * c) as f64 / 16.0);
        let mut a = Grid::filled(5, 5, 0.0);
        let mut b = Grid::filled(5, 5, 0.0);
        a.set(0, 0, 1.0);
        b.set(4, 4, 1.0);
        let seeds = vec![a, b];
        let factors = SharedFactorization::factorize(&system(&image, &seeds)).unwrap();
        let fields = factors.solve_all(&seeds).unwrap();
        assert_eq!(fields.len(), 2);
        assert_abs_diff_eq!(*fields[0].get(0, 0), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(*fields[1].get(4, 4), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(*fields[0].get(4, 4), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn rejects_wrong_rhs_length() {
        let flat = Grid::filled(3, 3, 0.0);
        let factors =
            SharedFactorization::factorize(&system(&flat, &[Grid::filled(3, 3, 0.0)])).unwrap();
        assert!(matches!(
            factors.solve_flat(&[0.0; 4]),
            Err(PropagationError::DimensionMismatch { .. })
        ));
    }
}
