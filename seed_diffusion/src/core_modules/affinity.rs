// THEORY:
// The `AffinityBuilder` turns raw pixel values into the edge weights of the
// diffusion graph. It is the numerical heart of the engine.
//
// Per channel, for every interior window:
//   1. Compute the window's mean and population standard deviation.
//   2. Weight each neighbor by a Gaussian of its difference to the center,
//      scaled by the local variance: exp(-(center - v)² / (2·std²)).
//      A flat window (std = 0) gets weight 0 everywhere. The ratio would be 0/0,
//      and a flat patch carries no evidence about where a boundary lies.
//   3. Zero the center entry; self-similarity is not an edge.
//
// Across channels:
//   4. Average the channel windows element-wise.
//   5. Divide each window by its sum so the off-center entries sum to 1. A window
//      whose sum is exactly 0 is left at 0 instead of being divided.
//   6. Negate (off-diagonal sign of the diffusion system) and put the 1.0
//      placeholder back in the center. The assembler never reads that entry.
//
// Weights are direction-dependent: pixel p's weight towards q uses p's local
// statistics, so the resulting graph is not symmetric.

use tracing::debug;

use crate::core_modules::error::{PropagationError, Result};
use crate::core_modules::grid::{Grid, Image};
use crate::core_modules::neighborhood::{NeighborhoodExtractor, WindowSize};

/// Mean and population standard deviation of one window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowStats {
    pub mean: f64,
    pub std: f64,
}

impl WindowStats {
    /// Population statistics (no Bessel correction).
    ///
    /// A window whose values are all equal reports `std == 0.0` exactly. The
    /// two-pass formula alone leaves a residue of a few ulps for values such as
    /// 0.4 that have no exact binary form.
    pub fn of(values: &[f64]) -> Self {
        let Some(&first) = values.first() else {
            return Self { mean: 0.0, std: 0.0 };
        };
        if values.iter().all(|&v| v == first) {
            return Self { mean: first, std: 0.0 };
        }
        let count = values.len() as f64;
        let mean = values.iter().sum::<f64>() / count;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count;
        Self {
            mean,
            std: variance.sqrt(),
        }
    }
}

/// Raw similarity windows for a single channel, before averaging.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelWeights {
    /// `interior_count × window.area()` weights, one window after the other.
    pub weights: Vec<f64>,
    /// Windows whose standard deviation was 0.
    pub flat_windows: usize,
}

/// The signed, normalized weight window of every interior pixel.
#[derive(Debug, Clone, PartialEq)]
pub struct AffinityField {
    window: WindowSize,
    height: usize,
    width: usize,
    weights: Vec<f64>,
}

impl AffinityField {
    pub fn window(&self) -> WindowSize {
        self.window
    }

    /// Shape of the image the field was built from.
    pub fn shape(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    /// Number of interior windows.
    pub fn interior_count(&self) -> usize {
        self.weights.len() / self.window.area()
    }

    /// Weight window of the `k`-th interior pixel (row-major order of centers).
    pub fn window_weights(&self, k: usize) -> &[f64] {
        let area = self.window.area();
        &self.weights[k * area..(k + 1) * area]
    }

    /// Weight window of the interior pixel at `(row, col)`, if it has one.
    pub fn weights_at(&self, row: usize, col: usize) -> Option<&[f64]> {
        let margin = self.window.margin();
        let (rows, cols) = self.window.interior_shape(self.height, self.width);
        if row < margin || col < margin || row - margin >= rows || col - margin >= cols {
            return None;
        }
        Some(self.window_weights((row - margin) * cols + (col - margin)))
    }

    /// All windows, one after the other.
    pub fn windows(&self) -> impl Iterator<Item = &[f64]> {
        self.weights.chunks_exact(self.window.area())
    }
}

/// Builds affinity windows from image channels.
#[derive(Debug, Clone, Copy)]
pub struct AffinityBuilder {
    extractor: NeighborhoodExtractor,
}

impl AffinityBuilder {
    pub fn new(window: WindowSize) -> Self {
        Self {
            extractor: NeighborhoodExtractor::new(window),
        }
    }

    pub fn window(&self) -> WindowSize {
        self.extractor.window()
    }

    /// Gaussian similarity of every window entry to its center for one channel,
    /// with the center entry zeroed.
    pub fn channel_weights(&self, field: &Grid<f64>) -> ChannelWeights {
        let window = self.window();
        let center = window.center();
        let mut weights =
            Vec::with_capacity(window.interior_count(field.height(), field.width()) * window.area());
        let mut flat_windows = 0;

        for neighborhood in self.extractor.windows(field) {
            let stats = WindowStats::of(&neighborhood.values);
            let center_value = neighborhood.values[center];
            if stats.std == 0.0 {
                flat_windows += 1;
                weights.extend(std::iter::repeat_n(0.0, window.area()));
                continue;
            }
            let denom = 2.0 * stats.std * stats.std;
            for (entry, value) in neighborhood.values.iter().enumerate() {
                if entry == center {
                    weights.push(0.0);
                } else {
                    let diff = center_value - value;
                    weights.push((-(diff * diff) / denom).exp());
                }
            }
        }

        ChannelWeights {
            weights,
            flat_windows,
        }
    }

    /// Averages per-channel windows, normalizes each window to unit sum, negates
    /// and restores the center placeholder.
    pub fn combine(
        &self,
        height: usize,
        width: usize,
        channels: &[ChannelWeights],
    ) -> Result<AffinityField> {
        let window = self.window();
        let expected = window.interior_count(height, width) * window.area();
        if channels.is_empty() {
            return Err(PropagationError::count_mismatch("image channel count", 1, 0));
        }
        for channel in channels {
            if channel.weights.len() != expected {
                return Err(PropagationError::count_mismatch(
                    "channel weight count",
                    expected,
                    channel.weights.len(),
                ));
            }
        }

        let mut weights = vec![0.0; expected];
        for channel in channels {
            for (acc, w) in weights.iter_mut().zip(&channel.weights) {
                *acc += w;
            }
        }
        let count = channels.len() as f64;

        let center = window.center();
        let mut empty_windows = 0;
        for win in weights.chunks_exact_mut(window.area()) {
            win.iter_mut().for_each(|w| *w /= count);
            let sum: f64 = win.iter().sum();
            if sum == 0.0 {
                empty_windows += 1;
                win.fill(0.0);
            } else {
                win.iter_mut().for_each(|w| *w = -(*w / sum));
            }
            win[center] = 1.0;
        }
        debug!(
            windows = weights.len() / window.area(),
            empty_windows, "combined channel affinities"
        );

        Ok(AffinityField {
            window,
            height,
            width,
            weights,
        })
    }

    /// Full affinity computation for an image, one channel after another.
    pub fn build(&self, image: &Image) -> Result<AffinityField> {
        let channels: Vec<ChannelWeights> = image
            .channels()
            .iter()
            .map(|channel| self.channel_weights(channel))
            .collect();
        let flat: usize = channels.iter().map(|c| c.flat_windows).sum();
        debug!(channels = channels.len(), flat_windows = flat, "channel affinities built");
        self.combine(image.height(), image.width(), &channels)
    }
}
