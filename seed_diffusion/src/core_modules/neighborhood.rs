// THEORY:
// The `NeighborhoodExtractor` is the first stage of the engine. It slides a
// square window over a scalar field and, for every pixel far enough from the
// edges to host a full window, hands back two aligned patches:
//   - the field values under the window, and
//   - the linear index of each of those pixels in the flattened H×W grid.
//
// The index patch is what lets later stages turn a per-pixel weight window into
// sparse matrix coordinates without any further geometry.
//
// No padding is used. Pixels within `margin = window / 2` of any edge never act
// as window centers ("border pixels"); they still appear inside the windows of
// their interior neighbors. Windows are produced by plain index arithmetic, one
// pixel at a time, in row-major order of their centers.

use crate::core_modules::error::{PropagationError, Result};
use crate::core_modules::grid::Grid;

/// A validated window size: odd and at least 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowSize(usize);

impl WindowSize {
    pub fn new(size: usize) -> Result<Self> {
        if size < 3 || size % 2 == 0 {
            return Err(PropagationError::InvalidWindowSize { size });
        }
        Ok(Self(size))
    }

    /// Side length of the window.
    pub fn get(self) -> usize {
        self.0
    }

    /// Distance from the center to the window edge, `size / 2`.
    pub fn margin(self) -> usize {
        self.0 / 2
    }

    /// Number of entries in one window, `size²`.
    pub fn area(self) -> usize {
        self.0 * self.0
    }

    /// Flat position of the center entry inside a window.
    pub fn center(self) -> usize {
        self.margin() * self.0 + self.margin()
    }

    /// Number of pixels that host a full window in a `height × width` grid.
    pub fn interior_count(self, height: usize, width: usize) -> usize {
        let (rows, cols) = self.interior_shape(height, width);
        rows * cols
    }

    /// `(rows, cols)` of the interior region of a `height × width` grid.
    pub fn interior_shape(self, height: usize, width: usize) -> (usize, usize) {
        let span = self.0 - 1;
        (height.saturating_sub(span), width.saturating_sub(span))
    }
}

impl TryFrom<usize> for WindowSize {
    type Error = PropagationError;

    fn try_from(size: usize) -> Result<Self> {
        Self::new(size)
    }
}

/// The window around one interior pixel.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighborhood {
    /// Row of the center pixel.
    pub row: usize,
    /// Column of the center pixel.
    pub col: usize,
    /// `values[a * size + b] = field[row + a - margin][col + b - margin]`.
    pub values: Vec<f64>,
    /// Linear index of each window entry in the flattened grid, aligned with `values`.
    pub indices: Vec<usize>,
}

impl Neighborhood {
    /// Value at the center of the window.
    pub fn center_value(&self, window: WindowSize) -> f64 {
        self.values[window.center()]
    }

    /// Linear index of the center pixel.
    pub fn center_index(&self, window: WindowSize) -> usize {
        self.indices[window.center()]
    }
}

/// Produces the window of every interior pixel of a field.
#[derive(Debug, Clone, Copy)]
pub struct NeighborhoodExtractor {
    window: WindowSize,
}

impl NeighborhoodExtractor {
    pub fn new(window: WindowSize) -> Self {
        Self { window }
    }

    /// Convenience constructor that validates a raw size first.
    pub fn with_size(size: usize) -> Result<Self> {
        Ok(Self::new(WindowSize::new(size)?))
    }

    pub fn window(&self) -> WindowSize {
        self.window
    }

    /// Lazily yields the window of every interior pixel in row-major order.
    pub fn windows<'a>(&self, field: &'a Grid<f64>) -> impl Iterator<Item = Neighborhood> + use<'a> {
        let window = self.window;
        let margin = window.margin();
        let (rows, cols) = window.interior_shape(field.height(), field.width());
        (0..rows).flat_map(move |r| {
            (0..cols).map(move |c| Self::window_at(field, window, r + margin, c + margin))
        })
    }

    /// Collects every interior window of `field`.
    pub fn extract(&self, field: &Grid<f64>) -> Vec<Neighborhood> {
        self.windows(field).collect()
    }

    /// Index patches only, for callers that already have the values.
    pub fn index_windows(&self, height: usize, width: usize) -> Vec<Vec<usize>> {
        let margin = self.window.margin();
        let size = self.window.get();
        let (rows, cols) = self.window.interior_shape(height, width);
        let mut out = Vec::with_capacity(rows * cols);
        for r in 0..rows {
            for c in 0..cols {
                let (row, col) = (r + margin, c + margin);
                let mut indices = Vec::with_capacity(self.window.area());
                for a in 0..size {
                    for b in 0..size {
                        indices.push((row + a - margin) * width + (col + b - margin));
                    }
                }
                out.push(indices);
            }
        }
        out
    }

    fn window_at(field: &Grid<f64>, window: WindowSize, row: usize, col: usize) -> Neighborhood {
        let size = window.get();
        let margin = window.margin();
        let mut values = Vec::with_capacity(window.area());
        let mut indices = Vec::with_capacity(window.area());
        for a in 0..size {
            let r = row + a - margin;
            for b in 0..size {
                let c = col + b - margin;
                values.push(*field.get(r, c));
                indices.push(field.linear_index(r, c));
            }
        }
        Neighborhood {
            row,
            col,
            values,
            indices,
        }
    }
}
