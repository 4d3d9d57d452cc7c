// THEORY:
// `ParallelPropagator` runs the same stages as `SeedPropagator`, but exploits the
// two places where the work is independent:
//   - per-channel affinity: channels do not interact until they are averaged;
//   - per-class solves: every solve only reads the shared factorization.
//
// Both are CPU-bound, so each unit of work goes to tokio's blocking pool, and a
// semaphore caps how many run at once. Results are gathered in submission order
// and the channel average is taken only after every channel task finished, so
// the output is bit-identical to the sequential pipeline.

use std::sync::Arc;
use std::time::Instant;

use futures::future::try_join_all;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument};

use crate::core_modules::affinity::{AffinityBuilder, ChannelWeights};
use crate::core_modules::constraint_system::ConstraintSystemAssembler;
use crate::core_modules::error::{PropagationError, Result};
use crate::core_modules::grid::{Image, LabelField, ResultMask, SeedMask};
use crate::core_modules::neighborhood::WindowSize;
use crate::core_modules::solver::SharedFactorization;
use crate::pipeline::{check_inputs, Expansion, PropagationConfig};

/// Seed propagation with channel-level parallelism on the tokio blocking pool.
#[derive(Debug, Clone)]
pub struct ParallelPropagator {
    config: PropagationConfig,
    window: WindowSize,
    permits: Arc<Semaphore>,
}

impl ParallelPropagator {
    pub fn new(config: PropagationConfig) -> Result<Self> {
        let window = config.validate()?;
        let permits = Arc::new(Semaphore::new(config.max_parallel_tasks.max(1)));
        Ok(Self {
            config,
            window,
            permits,
        })
    }

    pub fn config(&self) -> &PropagationConfig {
        &self.config
    }

    /// Runs `job` on the blocking pool once a permit is free.
    async fn run_blocking<T, F>(&self, job: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|err| PropagationError::WorkerFailed {
                reason: err.to_string(),
            })?;
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job()
        })
        .await
        .map_err(|err| PropagationError::WorkerFailed {
            reason: err.to_string(),
        })?
    }

    /// Runs the full pipeline and returns fields, winners and masks.
    #[instrument(skip_all, fields(height = image.height(), width = image.width(), classes = seeds.len()))]
    pub async fn expand(&self, image: &Image, seeds: &[SeedMask]) -> Result<Expansion> {
        check_inputs(image, seeds)?;
        let started = Instant::now();
        let builder = AffinityBuilder::new(self.window);

        let channel_jobs = image.channels().iter().cloned().map(|channel| {
            self.run_blocking(move || Ok(builder.channel_weights(&channel)))
        });
        let channels: Vec<ChannelWeights> = try_join_all(channel_jobs).await?;
        debug!(channels = channels.len(), "channel affinities built in parallel");

        let (height, width) = image.shape();
        let window = self.window;
        let owned_seeds = seeds.to_vec();
        let factors = self
            .run_blocking(move || {
                let affinity = builder.combine(height, width, &channels)?;
                let matrix = ConstraintSystemAssembler::new(window).assemble(&affinity, &owned_seeds)?;
                SharedFactorization::factorize(&matrix)
            })
            .await?;
        let factors = Arc::new(factors);

        let solve_jobs = seeds.iter().cloned().map(|seed| {
            let factors = Arc::clone(&factors);
            self.run_blocking(move || factors.solve(&seed))
        });
        let label_fields: Vec<LabelField> = try_join_all(solve_jobs).await?;

        let expansion = Expansion::from_fields(label_fields)?;
        info!(
            counts = ?expansion.class_pixel_counts(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "expanded annotations in parallel"
        );
        Ok(expansion)
    }

    /// Runs the full pipeline and returns only the masks.
    pub async fn expand_masks(&self, image: &Image, seeds: &[SeedMask]) -> Result<Vec<ResultMask>> {
        Ok(self.expand(image, seeds).await?.masks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::grid::Grid;
    use crate::pipeline::SeedPropagator;

    fn scene() -> (Image, Vec<SeedMask>) {
        let red = Grid::from_fn(9, 9, |r, c| (if c < 4 { 0.1 } else { 0.9 }) + r as f64 * 0.01);
        let green = Grid::from_fn(9, 9, |r, c| ((r + c) % 3) as f64 / 10.0);
        let blue = Grid::filled(9, 9, 0.5);
        let image = Image::from_channels(vec![red, green, blue]).unwrap();
        let mut left = Grid::filled(9, 9, 0.0);
        let mut right = Grid::filled(9, 9, 0.0);
        left.set(4, 1, 1.0);
        right.set(4, 7, 1.0);
        (image, vec![left, right])
    }

    #[tokio::test]
    async fn matches_sequential_pipeline_exactly() {
        let (image, seeds) = scene();
        let config = PropagationConfig::default().with_max_parallel_tasks(2);
        let parallel = ParallelPropagator::new(config.clone())
            .unwrap()
            .expand(&image, &seeds)
            .await
            .unwrap();
        let sequential = SeedPropagator::new(config).unwrap().expand(&image, &seeds).unwrap();
        assert_eq!(parallel, sequential);
    }

    #[tokio::test]
    async fn single_permit_still_completes() {
        let (image, seeds) = scene();
        let config = PropagationConfig::default().with_max_parallel_tasks(1);
        let masks = ParallelPropagator::new(config)
            .unwrap()
            .expand_masks(&image, &seeds)
            .await
            .unwrap();
        assert_eq!(masks.len(), 2);
        assert_eq!(*masks[0].get(4, 1), 1);
        assert_eq!(*masks[1].get(4, 7), 1);
    }

    #[tokio::test]
    async fn rejects_invalid_inputs() {
        assert!(ParallelPropagator::new(PropagationConfig::default().with_window_size(2)).is_err());
        let (image, _) = scene();
        let propagator = ParallelPropagator::new(PropagationConfig::default()).unwrap();
        assert_eq!(
            propagator.expand(&image, &[]).await.unwrap_err(),
            PropagationError::EmptySeeds
        );
    }
}
