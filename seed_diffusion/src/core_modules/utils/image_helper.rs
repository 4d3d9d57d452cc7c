// THEORY:
// File-level collaborators of the engine. The core only ever sees normalized
// in-memory fields; this module is where those fields come from and go back to.
//
//   - Images are decoded with the `image` crate and converted to 3-channel
//     floats in [0, 1]. Alpha and any extra channels are dropped, grayscale is
//     replicated.
//   - Annotation scans are noisy (anti-aliased strokes, compression halos), so
//     each one is summed over its colour channels and binarised against a
//     fraction of its own maximum.
//   - Expanded masks are written as 8-bit grayscale (0 / 255) next to the
//     annotation they came from, as `<stem>_expanded.<ext>`.

use std::path::{Path, PathBuf};

use image::{DynamicImage, GrayImage, Luma};
use thiserror::Error;
use tracing::{debug, info};

use crate::core_modules::error::PropagationError;
use crate::core_modules::grid::{Grid, Image, ResultMask, SeedMask};
use crate::pipeline::{PropagationConfig, SeedPropagator};

/// Suffix appended to the file stem of every written mask.
pub const EXPANDED_SUFFIX: &str = "_expanded";

/// Errors from loading or saving images and annotations.
#[derive(Error, Debug)]
pub enum AnnotationIoError {
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error(transparent)]
    Propagation(#[from] PropagationError),
    #[error("at least one annotation path is required")]
    NoAnnotations,
    #[error("down-scaling factor must be >= 1, got {0}")]
    InvalidDownScaling(usize),
    #[error("{} is {found:?} (h, w) but the image is {expected:?}", path.display())]
    SizeMismatch {
        path: PathBuf,
        expected: (usize, usize),
        found: (usize, usize),
    },
}

pub type Result<T> = std::result::Result<T, AnnotationIoError>;

/// Options for reading images and annotation scans.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadOptions {
    /// Keep every n-th row and column. 1 keeps the full resolution.
    pub down_scaling: usize,
    /// A pixel is seeded when its channel sum exceeds `max_sum / threshold_divisor`.
    pub threshold_divisor: f64,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            down_scaling: 1,
            threshold_divisor: 20.0,
        }
    }
}

/// Per-pixel RGB values of `img` after down-scaling, as `(height, width, rgb)`.
fn sampled_rgb(img: &DynamicImage, down_scaling: usize) -> Result<(usize, usize, Vec<[f64; 3]>)> {
    if down_scaling == 0 {
        return Err(AnnotationIoError::InvalidDownScaling(down_scaling));
    }
    let rgb = img.to_rgb32f();
    let (w, h) = (rgb.width() as usize, rgb.height() as usize);
    let height = h.div_ceil(down_scaling);
    let width = w.div_ceil(down_scaling);
    let mut out = Vec::with_capacity(height * width);
    for y in (0..h).step_by(down_scaling) {
        for x in (0..w).step_by(down_scaling) {
            let p = rgb.get_pixel(x as u32, y as u32).0;
            out.push([p[0] as f64, p[1] as f64, p[2] as f64]);
        }
    }
    Ok((height, width, out))
}

/// Converts a decoded image into the engine's normalized 3-channel `Image`.
pub fn image_from_dynamic(img: &DynamicImage, down_scaling: usize) -> Result<Image> {
    let (height, width, pixels) = sampled_rgb(img, down_scaling)?;
    let flat: Vec<f64> = pixels.iter().flat_map(|p| p.iter().copied()).collect();
    Ok(Image::from_interleaved(height, width, 3, &flat)?)
}

/// Binarises a field of channel sums: 1 where the value is strictly above
/// `max / divisor`, 0 elsewhere. An all-zero field stays all zero.
///
/// A sum that lands exactly on the threshold becomes 0, so the mask is always
/// strictly binary.
pub fn binarize(sums: &Grid<f64>, divisor: f64) -> SeedMask {
    let max = sums.as_slice().iter().copied().fold(0.0_f64, f64::max);
    let threshold = max / divisor;
    sums.map(|&v| if max > 0.0 && v > threshold { 1.0 } else { 0.0 })
}

/// Converts a decoded annotation scan into a binary seed mask.
pub fn seed_mask_from_dynamic(img: &DynamicImage, options: &LoadOptions) -> Result<SeedMask> {
    let (height, width, pixels) = sampled_rgb(img, options.down_scaling)?;
    let sums: Vec<f64> = pixels.iter().map(|p| p.iter().sum::<f64>()).collect();
    Ok(binarize(&Grid::from_vec(height, width, sums)?, options.threshold_divisor))
}

pub fn load_image(path: impl AsRef<Path>, options: &LoadOptions) -> Result<Image> {
    let img = image::open(path.as_ref())?;
    image_from_dynamic(&img, options.down_scaling)
}

pub fn load_annotation(path: impl AsRef<Path>, options: &LoadOptions) -> Result<SeedMask> {
    let img = image::open(path.as_ref())?;
    seed_mask_from_dynamic(&img, options)
}

/// Loads the image and one seed mask per annotation path, checking sizes agree.
pub fn load_image_with_annotations<P: AsRef<Path>>(
    image_path: impl AsRef<Path>,
    annotation_paths: &[P],
    options: &LoadOptions,
) -> Result<(Image, Vec<SeedMask>)> {
    if annotation_paths.is_empty() {
        return Err(AnnotationIoError::NoAnnotations);
    }
    let image = load_image(&image_path, options)?;
    let mut seeds = Vec::with_capacity(annotation_paths.len());
    for path in annotation_paths {
        let mask = load_annotation(path, options)?;
        if mask.shape() != image.shape() {
            return Err(AnnotationIoError::SizeMismatch {
                path: path.as_ref().to_path_buf(),
                expected: image.shape(),
                found: mask.shape(),
            });
        }
        seeds.push(mask);
    }
    debug!(
        height = image.height(),
        width = image.width(),
        annotations = seeds.len(),
        "loaded image and annotations"
    );
    Ok((image, seeds))
}

/// `dir/name.png` becomes `dir/name_expanded.png`.
pub fn expanded_path(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    let stem = path.file_stem().map(|s| s.to_string_lossy()).unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}{EXPANDED_SUFFIX}.{}", ext.to_string_lossy()),
        None => format!("{stem}{EXPANDED_SUFFIX}"),
    };
    path.with_file_name(name)
}

/// Scales a 0/1 mask to a 0/255 grayscale image.
pub fn mask_to_image(mask: &ResultMask) -> GrayImage {
    GrayImage::from_fn(mask.width() as u32, mask.height() as u32, |x, y| {
        Luma([mask.get(y as usize, x as usize).saturating_mul(255)])
    })
}

pub fn save_mask(path: impl AsRef<Path>, mask: &ResultMask) -> Result<()> {
    mask_to_image(mask).save(path.as_ref())?;
    Ok(())
}

/// Writes `masks[i]` to `out_paths[i]`.
pub fn save_masks<P: AsRef<Path>>(out_paths: &[P], masks: &[ResultMask]) -> Result<()> {
    if out_paths.len() != masks.len() {
        return Err(PropagationError::count_mismatch("output path count", masks.len(), out_paths.len()).into());
    }
    for (path, mask) in out_paths.iter().zip(masks) {
        save_mask(path, mask)?;
    }
    Ok(())
}

/// Writes each mask next to the annotation it was expanded from.
pub fn save_adjacent<P: AsRef<Path>>(annotation_paths: &[P], masks: &[ResultMask]) -> Result<Vec<PathBuf>> {
    let out_paths: Vec<PathBuf> = annotation_paths.iter().map(expanded_path).collect();
    save_masks(&out_paths, masks)?;
    Ok(out_paths)
}

/// Loads, expands and saves in one go. Returns the written paths.
pub fn load_and_expand<P: AsRef<Path>>(
    image_path: impl AsRef<Path>,
    annotation_paths: &[P],
    config: PropagationConfig,
    options: &LoadOptions,
) -> Result<Vec<PathBuf>> {
    let propagator = SeedPropagator::new(config)?;
    let (image, seeds) = load_image_with_annotations(image_path, annotation_paths, options)?;
    let masks = propagator.expand_masks(&image, &seeds)?;
    let written = save_adjacent(annotation_paths, &masks)?;
    info!(files = written.len(), "saved expanded annotations");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage, Rgba, RgbaImage};

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("seed_diffusion_{name}_{}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("Error creating scratch dir.");
        dir
    }

    #[test]
    fn expanded_path_keeps_directory_and_extension() {
        assert_eq!(
            expanded_path("shots/cat_fg.png"),
            PathBuf::from("shots/cat_fg_expanded.png")
        );
        assert_eq!(expanded_path("mask"), PathBuf::from("mask_expanded"));
    }

    #[test]
    fn binarize_uses_fraction_of_max() {
        let sums = Grid::from_vec(1, 4, vec![0.0, 0.1, 0.2, 3.0]).unwrap();
        // threshold = 3.0 / 20 = 0.15
        assert_eq!(binarize(&sums, 20.0).as_slice(), &[0.0, 0.0, 1.0, 1.0]);
        let blank = Grid::filled(2, 2, 0.0);
        assert!(binarize(&blank, 20.0).as_slice().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn sum_on_the_threshold_is_not_seeded() {
        // threshold = 4.0 / 4 = 1.0, hit exactly by the second pixel.
        let sums = Grid::from_vec(1, 4, vec![0.0, 1.0, 4.0, 2.0]).unwrap();
        assert_eq!(binarize(&sums, 4.0).as_slice(), &[0.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn image_conversion_drops_alpha_and_normalizes() {
        let rgba = RgbaImage::from_fn(3, 2, |x, _| Rgba([255, (x * 100) as u8, 0, 10]));
        let image = image_from_dynamic(&DynamicImage::ImageRgba8(rgba), 1).unwrap();
        assert_eq!(image.channel_count(), 3);
        assert_eq!(image.shape(), (2, 3));
        assert_eq!(*image.channel(0).get(1, 2), 1.0);
        assert!((image.channel(1).get(0, 1) - 100.0 / 255.0).abs() < 1e-6);
        assert_eq!(*image.channel(2).get(0, 0), 0.0);
    }

    #[test]
    fn down_scaling_keeps_every_nth_pixel() {
        let rgb = RgbImage::from_fn(5, 4, |x, y| Rgb([(x * 10) as u8, (y * 10) as u8, 0]));
        let image = image_from_dynamic(&DynamicImage::ImageRgb8(rgb.clone()), 2).unwrap();
        assert_eq!(image.shape(), (2, 3));
        assert!((image.channel(0).get(0, 2) - 40.0 / 255.0).abs() < 1e-6);
        assert!((image.channel(1).get(1, 0) - 20.0 / 255.0).abs() < 1e-6);
        assert!(matches!(
            image_from_dynamic(&DynamicImage::ImageRgb8(rgb), 0),
            Err(AnnotationIoError::InvalidDownScaling(0))
        ));
    }

    #[test]
    fn mask_round_trips_through_png() {
        let dir = scratch_dir("mask_round_trip");
        let mask = Grid::from_fn(3, 4, |r, c| ((r + c) % 2) as u8);
        let path = dir.join("mask.png");
        save_mask(&path, &mask).expect("Error Saving File.");

        let loaded = image::open(&path).unwrap().to_luma8();
        assert_eq!(loaded.dimensions(), (4, 3));
        assert_eq!(loaded.get_pixel(1, 0).0, [255]);
        assert_eq!(loaded.get_pixel(0, 0).0, [0]);
        let reloaded = load_annotation(&path, &LoadOptions::default()).unwrap();
        assert_eq!(reloaded.map(|&v| v as u8), mask);
    }

    #[test]
    fn annotations_must_match_image_size() {
        let dir = scratch_dir("size_mismatch");
        let image_path = dir.join("image.png");
        let ann_path = dir.join("ann.png");
        RgbImage::new(4, 4).save(&image_path).unwrap();
        RgbImage::new(5, 4).save(&ann_path).unwrap();

        let err = load_image_with_annotations(&image_path, &[&ann_path], &LoadOptions::default())
            .unwrap_err();
        assert!(matches!(err, AnnotationIoError::SizeMismatch { .. }));
        let none: [&Path; 0] = [];
        assert!(matches!(
            load_image_with_annotations(&image_path, &none, &LoadOptions::default()),
            Err(AnnotationIoError::NoAnnotations)
        ));
    }

    #[test]
    fn save_masks_requires_one_path_per_mask() {
        let mask = Grid::filled(2, 2, 0u8);
        let err = save_masks(&[PathBuf::from("a.png")], &[mask.clone(), mask]).unwrap_err();
        assert!(matches!(
            err,
            AnnotationIoError::Propagation(PropagationError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn load_and_expand_writes_adjacent_files() {
        let dir = scratch_dir("load_and_expand");
        let image_path = dir.join("scene.png");
        let left_path = dir.join("left.png");
        let right_path = dir.join("right.png");

        RgbImage::from_fn(8, 6, |x, _| if x < 4 { Rgb([20, 20, 20]) } else { Rgb([230, 230, 230]) })
            .save(&image_path)
            .unwrap();
        RgbImage::from_fn(8, 6, |x, y| if (x, y) == (1, 3) { Rgb([255, 0, 0]) } else { Rgb([0, 0, 0]) })
            .save(&left_path)
            .unwrap();
        RgbImage::from_fn(8, 6, |x, y| if (x, y) == (6, 3) { Rgb([0, 0, 255]) } else { Rgb([0, 0, 0]) })
            .save(&right_path)
            .unwrap();

        let written = load_and_expand(
            &image_path,
            &[&left_path, &right_path],
            PropagationConfig::default(),
            &LoadOptions::default(),
        )
        .unwrap();
        assert_eq!(written, vec![dir.join("left_expanded.png"), dir.join("right_expanded.png")]);

        let left = image::open(&written[0]).unwrap().to_luma8();
        let right = image::open(&written[1]).unwrap().to_luma8();
        assert_eq!(left.get_pixel(1, 3).0, [255]);
        assert_eq!(right.get_pixel(6, 3).0, [255]);
        assert_eq!(right.get_pixel(1, 3).0, [0]);
    }
}
