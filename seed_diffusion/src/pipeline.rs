// THEORY:
// The `pipeline` module is the top-level API of the engine. It wires the core
// stages into one call:
//
//   Image + seed masks
//     -> AffinityBuilder            (per-channel similarity, averaged, normalized)
//     -> ConstraintSystemAssembler  (sparse system, seeds and border held fixed)
//     -> SharedFactorization        (factorize once, solve once per class)
//     -> ClassSelector              (arg-max into exclusive masks)
//
// Every call is a pure function of its inputs: nothing is cached between
// invocations, and either all K masks come back or an error does.

use tracing::{debug, info, instrument};

use crate::core_modules::affinity::AffinityBuilder;
use crate::core_modules::class_selector::ClassSelector;
use crate::core_modules::constraint_system::ConstraintSystemAssembler;
use crate::core_modules::solver::SharedFactorization;

// Re-export key data structures for the public API.
pub use crate::core_modules::class_selector::ClassMap;
pub use crate::core_modules::error::PropagationError;
pub use crate::core_modules::grid::{Grid, Image, LabelField, ResultMask, SeedMask};
pub use crate::core_modules::neighborhood::WindowSize;

/// Default neighborhood window, 3×3.
pub const DEFAULT_WINDOW_SIZE: usize = 3;

/// Configuration for seed propagation.
#[derive(Debug, Clone, PartialEq)]
pub struct PropagationConfig {
    /// Side of the square neighborhood window. Must be odd and >= 3.
    pub window_size: usize,
    /// Upper bound on concurrently running channel tasks in the parallel pipeline.
    pub max_parallel_tasks: usize,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            max_parallel_tasks: num_cpus::get().max(1),
        }
    }
}

impl PropagationConfig {
    pub fn with_window_size(mut self, window_size: usize) -> Self {
        self.window_size = window_size;
        self
    }

    pub fn with_max_parallel_tasks(mut self, tasks: usize) -> Self {
        self.max_parallel_tasks = tasks.max(1);
        self
    }

    /// Checks the window size before any work is done.
    pub fn validate(&self) -> Result<WindowSize, PropagationError> {
        WindowSize::new(self.window_size)
    }
}

/// Everything one propagation run produces.
#[derive(Debug, Clone, PartialEq)]
pub struct Expansion {
    /// Continuous solution per seed channel.
    pub label_fields: Vec<LabelField>,
    /// Arg-max winner per pixel.
    pub class_map: ClassMap,
    /// Binary, mutually exclusive output mask per class.
    pub masks: Vec<ResultMask>,
}

impl Expansion {
    pub(crate) fn from_fields(label_fields: Vec<LabelField>) -> Result<Self, PropagationError> {
        let class_map = ClassSelector::select(&label_fields)?;
        let masks = class_map.masks();
        Ok(Self {
            label_fields,
            class_map,
            masks,
        })
    }

    /// Number of pixels each class received.
    pub fn class_pixel_counts(&self) -> Vec<usize> {
        self.class_map.class_pixel_counts()
    }
}

/// Checks that the image and every seed mask agree before any work starts.
pub(crate) fn check_inputs(image: &Image, seeds: &[SeedMask]) -> Result<(), PropagationError> {
    if seeds.is_empty() {
        return Err(PropagationError::EmptySeeds);
    }
    for seed in seeds {
        if seed.shape() != image.shape() {
            return Err(PropagationError::shape_mismatch(
                "seed mask",
                image.shape(),
                seed.shape(),
            ));
        }
    }
    Ok(())
}

/// The sequential seed propagation engine.
#[derive(Debug, Clone)]
pub struct SeedPropagator {
    config: PropagationConfig,
    window: WindowSize,
}

impl SeedPropagator {
    pub fn new(config: PropagationConfig) -> Result<Self, PropagationError> {
        let window = config.validate()?;
        Ok(Self { config, window })
    }

    pub fn config(&self) -> &PropagationConfig {
        &self.config
    }

    /// Runs the full pipeline and returns fields, winners and masks.
    #[instrument(skip_all, fields(height = image.height(), width = image.width(), classes = seeds.len()))]
    pub fn expand(&self, image: &Image, seeds: &[SeedMask]) -> Result<Expansion, PropagationError> {
        check_inputs(image, seeds)?;

        let affinity = AffinityBuilder::new(self.window).build(image)?;
        let matrix = ConstraintSystemAssembler::new(self.window).assemble(&affinity, seeds)?;
        let factors = SharedFactorization::factorize(&matrix)?;
        let label_fields = factors.solve_all(seeds)?;
        debug!(fields = label_fields.len(), "solved all seed channels");

        let expansion = Expansion::from_fields(label_fields)?;
        info!(counts = ?expansion.class_pixel_counts(), "expanded annotations");
        Ok(expansion)
    }

    /// Runs the full pipeline and returns only the masks.
    pub fn expand_masks(&self, image: &Image, seeds: &[SeedMask]) -> Result<Vec<ResultMask>, PropagationError> {
        Ok(self.expand(image, seeds)?.masks)
    }
}

/// One-shot convenience: expand `seeds` over `image` with the given window size.
pub fn expand_annotations(
    image: &Image,
    seeds: &[SeedMask],
    window_size: usize,
) -> Result<Vec<ResultMask>, PropagationError> {
    let config = PropagationConfig::default().with_window_size(window_size);
    SeedPropagator::new(config)?.expand_masks(image, seeds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = PropagationConfig::default();
        assert_eq!(config.window_size, 3);
        assert!(config.max_parallel_tasks >= 1);
        assert!(SeedPropagator::new(config).is_ok());
    }

    #[test]
    fn invalid_window_fails_before_any_work() {
        let config = PropagationConfig::default().with_window_size(4);
        assert_eq!(
            SeedPropagator::new(config).unwrap_err(),
            PropagationError::InvalidWindowSize { size: 4 }
        );
    }

    #[test]
    fn mismatched_seed_shape_is_rejected() {
        let image = Image::replicated(&Grid::filled(4, 4, 0.5), 3).unwrap();
        let seeds = vec![Grid::filled(4, 5, 0.0)];
        let result = expand_annotations(&image, &seeds, 3);
        assert!(matches!(result, Err(PropagationError::DimensionMismatch { .. })));
    }

    #[test]
    fn no_seeds_is_rejected() {
        let image = Image::replicated(&Grid::filled(4, 4, 0.5), 3).unwrap();
        assert_eq!(expand_annotations(&image, &[], 3), Err(PropagationError::EmptySeeds));
    }
}
