// THEORY:
// `seed_diffusion` grows a handful of hand-placed seed pixels into a dense
// partition of an image. Seeds and the image border are hard constraints, and
// every other pixel is pulled towards the neighbours it resembles.
//
// The primary goal is to export `SeedPropagator`, `ParallelPropagator` and their
// associated data structures (`PropagationConfig`, `Expansion`, the grid types)
// as the high-level interface of the engine. The individual stages live under
// `core_modules` and stay usable on their own for callers that want to inspect
// affinities or the assembled system.

pub mod core_modules;
pub mod parallel_pipeline;
pub mod pipeline;

pub use core_modules::utils::image_helper::{load_and_expand, AnnotationIoError, LoadOptions};
pub use parallel_pipeline::ParallelPropagator;
pub use pipeline::{
    expand_annotations, Expansion, Grid, Image, PropagationConfig, PropagationError, ResultMask,
    SeedMask, SeedPropagator,
};
