// THEORY:
// The `grid` module holds the "dumb" data containers of the engine. Every
// quantity the pipeline passes around (an image channel, a seed mask, a solved
// label field, a result mask) is an H×W field stored row-major in a flat `Vec`,
// so pixel (row, col) lives at linear index `row * width + col`. That linear
// index is also the row/column index of the pixel in the sparse constraint
// matrix, which is why the layout is fixed here and nowhere else.
//
// An `Image` is planar: one `Grid<f64>` per channel. The affinity stage works on
// one channel at a time, so planar storage hands each channel over without copies.

use crate::core_modules::error::{PropagationError, Result};

/// A row-major H×W field.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid<T> {
    height: usize,
    width: usize,
    data: Vec<T>,
}

/// H×W binary field marking the pixels committed to one class (values 0/1).
pub type SeedMask = Grid<f64>;
/// H×W continuous solution for one seed channel.
pub type LabelField = Grid<f64>;
/// H×W binary output field for one class (values 0/1).
pub type ResultMask = Grid<u8>;

impl<T: Clone> Grid<T> {
    /// Creates a field filled with `value`.
    pub fn filled(height: usize, width: usize, value: T) -> Self {
        Self {
            height,
            width,
            data: vec![value; height * width],
        }
    }
}

impl<T> Grid<T> {
    /// Wraps row-major `data`. Fails if its length is not `height * width`.
    pub fn from_vec(height: usize, width: usize, data: Vec<T>) -> Result<Self> {
        if data.len() != height * width {
            return Err(PropagationError::count_mismatch(
                "grid data length",
                height * width,
                data.len(),
            ));
        }
        Ok(Self {
            height,
            width,
            data,
        })
    }

    /// Builds a field by evaluating `f(row, col)` for every pixel.
    pub fn from_fn(height: usize, width: usize, mut f: impl FnMut(usize, usize) -> T) -> Self {
        let mut data = Vec::with_capacity(height * width);
        for row in 0..height {
            for col in 0..width {
                data.push(f(row, col));
            }
        }
        Self {
            height,
            width,
            data,
        }
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// `(height, width)`.
    pub fn shape(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    /// Number of pixels, H·W.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Linear index of `(row, col)` in the flattened field.
    #[inline]
    pub fn linear_index(&self, row: usize, col: usize) -> usize {
        row * self.width + col
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> &T {
        &self.data[row * self.width + col]
    }

    #[inline]
    pub fn set(&mut self, row: usize, col: usize, value: T) {
        let idx = self.linear_index(row, col);
        self.data[idx] = value;
    }

    /// The flattened, row-major values.
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<T> {
        self.data
    }

    /// Applies `f` to every value, keeping the shape.
    pub fn map<U>(&self, f: impl FnMut(&T) -> U) -> Grid<U> {
        Grid {
            height: self.height,
            width: self.width,
            data: self.data.iter().map(f).collect(),
        }
    }
}

/// A multi-channel image with values normalized to [0, 1], stored planar.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    height: usize,
    width: usize,
    channels: Vec<Grid<f64>>,
}

impl Image {
    /// Builds an image from per-channel fields, which must all share one shape.
    pub fn from_channels(channels: Vec<Grid<f64>>) -> Result<Self> {
        let first = channels.first().ok_or_else(|| {
            PropagationError::count_mismatch("image channel count", 1, 0)
        })?;
        let shape = first.shape();
        for channel in &channels {
            if channel.shape() != shape {
                return Err(PropagationError::shape_mismatch(
                    "image channel",
                    shape,
                    channel.shape(),
                ));
            }
        }
        Ok(Self {
            height: shape.0,
            width: shape.1,
            channels,
        })
    }

    /// Builds an image from pixel-interleaved data (`[r, g, b, r, g, b, ...]`).
    pub fn from_interleaved(
        height: usize,
        width: usize,
        channel_count: usize,
        data: &[f64],
    ) -> Result<Self> {
        if data.len() != height * width * channel_count {
            return Err(PropagationError::count_mismatch(
                "interleaved image length",
                height * width * channel_count,
                data.len(),
            ));
        }
        let channels = (0..channel_count)
            .map(|c| {
                let plane = data.iter().skip(c).step_by(channel_count).copied().collect();
                Grid::from_vec(height, width, plane)
            })
            .collect::<Result<Vec<_>>>()?;
        Self::from_channels(channels)
    }

    /// A single-channel field replicated into `channel_count` identical channels.
    pub fn replicated(field: &Grid<f64>, channel_count: usize) -> Result<Self> {
        Self::from_channels(vec![field.clone(); channel_count])
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn channels(&self) -> &[Grid<f64>] {
        &self.channels
    }

    pub fn channel(&self, index: usize) -> &Grid<f64> {
        &self.channels[index]
    }
}
