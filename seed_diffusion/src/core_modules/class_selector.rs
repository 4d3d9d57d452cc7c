// THEORY:
// The `ClassSelector` is the last stage: it turns K continuous label fields into
// K mutually exclusive binary masks.
//
// For every pixel it picks the channel with the largest solved value. Ties go to
// the lowest channel index, so a pixel whose channels are all equal always
// resolves to class 0. There is no "no-confidence" winner: some class always
// wins the arg-max.
//
// Emission into the masks keeps one extra rule: the winner's bit is set only if
// its score is strictly positive. A pixel no seed reached (every channel 0, e.g.
// on a flat image) therefore stays unassigned instead of being painted class 0.
// The winner itself is still recorded in the `ClassMap`.

use crate::core_modules::error::{PropagationError, Result};
use crate::core_modules::grid::{Grid, LabelField, ResultMask};

/// The arg-max winner and its score at every pixel.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassMap {
    class_count: usize,
    winners: Grid<usize>,
    scores: Grid<f64>,
}

impl ClassMap {
    pub fn class_count(&self) -> usize {
        self.class_count
    }

    /// Winning class index per pixel.
    pub fn winners(&self) -> &Grid<usize> {
        &self.winners
    }

    /// Winning score per pixel.
    pub fn scores(&self) -> &Grid<f64> {
        &self.scores
    }

    /// Whether the winner at `pixel` carries positive evidence.
    pub fn is_assigned(&self, pixel: usize) -> bool {
        self.scores.as_slice()[pixel] > 0.0
    }

    /// One binary mask per class, mutually exclusive per pixel.
    pub fn masks(&self) -> Vec<ResultMask> {
        let (height, width) = self.winners.shape();
        let mut masks = vec![Grid::filled(height, width, 0u8); self.class_count];
        for (pixel, &winner) in self.winners.as_slice().iter().enumerate() {
            if self.is_assigned(pixel) {
                let (row, col) = (pixel / width, pixel % width);
                masks[winner].set(row, col, 1);
            }
        }
        masks
    }

    /// Pixels assigned to each class.
    pub fn class_pixel_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.class_count];
        for (pixel, &winner) in self.winners.as_slice().iter().enumerate() {
            if self.is_assigned(pixel) {
                counts[winner] += 1;
            }
        }
        counts
    }
}

/// Arg-max class selection over solved label fields.
pub struct ClassSelector;

impl ClassSelector {
    /// Index of the first maximum of `values`.
    pub fn argmax(values: &[f64]) -> usize {
        let mut best = 0;
        for (k, &v) in values.iter().enumerate().skip(1) {
            if v > values[best] {
                best = k;
            }
        }
        best
    }

    /// One-hot selection for a single pixel's channel values.
    pub fn one_hot(values: &[f64]) -> Vec<u8> {
        let mut out = vec![0u8; values.len()];
        if values.is_empty() {
            return out;
        }
        let winner = Self::argmax(values);
        if values[winner] > 0.0 {
            out[winner] = 1;
        }
        out
    }

    /// Picks the winning class at every pixel.
    pub fn select(fields: &[LabelField]) -> Result<ClassMap> {
        let first = fields.first().ok_or(PropagationError::EmptySeeds)?;
        let shape = first.shape();
        for field in fields {
            if field.shape() != shape {
                return Err(PropagationError::shape_mismatch("label field", shape, field.shape()));
            }
        }

        let mut scratch = vec![0.0; fields.len()];
        let mut winners = Vec::with_capacity(first.len());
        let mut scores = Vec::with_capacity(first.len());
        for pixel in 0..first.len() {
            for (slot, field) in scratch.iter_mut().zip(fields) {
                *slot = field.as_slice()[pixel];
            }
            let winner = Self::argmax(&scratch);
            winners.push(winner);
            scores.push(scratch[winner]);
        }

        Ok(ClassMap {
            class_count: fields.len(),
            winners: Grid::from_vec(shape.0, shape.1, winners)?,
            scores: Grid::from_vec(shape.0, shape.1, scores)?,
        })
    }

    /// `select` followed by mask emission.
    pub fn select_masks(fields: &[LabelField]) -> Result<Vec<ResultMask>> {
        Ok(Self::select(fields)?.masks())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ties_go_to_the_lowest_index() {
        assert_eq!(ClassSelector::one_hot(&[0.5, 0.5]), vec![1, 0]);
        assert_eq!(ClassSelector::argmax(&[0.2, 0.7, 0.7]), 1);
    }

    #[test]
    fn largest_value_wins() {
        assert_eq!(ClassSelector::one_hot(&[0.6, 0.3, 0.1]), vec![1, 0, 0]);
        assert_eq!(ClassSelector::one_hot(&[0.1, 0.3, 0.6]), vec![0, 0, 1]);
    }

    #[test]
    fn non_positive_winner_is_recorded_but_not_emitted() {
        assert_eq!(ClassSelector::argmax(&[0.0, 0.0]), 0);
        assert_eq!(ClassSelector::argmax(&[-0.2, -0.1]), 1);
        assert_eq!(ClassSelector::one_hot(&[-0.2, -0.1]), vec![0, 0]);
    }

    #[test]
    fn masks_are_mutually_exclusive() {
        let a = Grid::from_vec(2, 2, vec![0.9, 0.1, 0.5, 0.0]).unwrap();
        let b = Grid::from_vec(2, 2, vec![0.1, 0.8, 0.5, 0.0]).unwrap();
        let map = ClassSelector::select(&[a, b]).unwrap();
        let masks = map.masks();

        assert_eq!(map.winners().as_slice(), &[0, 1, 0, 0]);
        assert_eq!(masks[0].as_slice(), &[1, 0, 1, 0]);
        assert_eq!(masks[1].as_slice(), &[0, 1, 0, 0]);
        assert_eq!(map.class_pixel_counts(), vec![2, 1]);
        for pixel in 0..4 {
            let total: u8 = masks.iter().map(|m| m.as_slice()[pixel]).sum();
            assert!(total <= 1);
        }
    }

    #[test]
    fn rejects_empty_and_mismatched_fields() {
        assert_eq!(ClassSelector::select(&[]), Err(PropagationError::EmptySeeds));
        let a = Grid::filled(2, 2, 0.0);
        let b = Grid::filled(2, 3, 0.0);
        assert!(ClassSelector::select(&[a, b]).is_err());
    }
}
