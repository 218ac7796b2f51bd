use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, info};
use tempfile::NamedTempFile;

pub mod pixel;

/// Per-pixel colour sensitivity handed to the pixel comparison.
pub const PIXEL_SENSITIVITY: f64 = 0.1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl std::fmt::Display for Dimensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MismatchedDimensions {
    pub current: Dimensions,
    pub baseline: Dimensions,
}

/// A fresh capture compared against its stored baseline.
#[derive(Clone, Debug, PartialEq)]
pub struct VisualComparison {
    pub matched: bool,
    /// `-1` when the dimensions differ and no pixels were compared.
    pub diff_pixels: i64,
    pub total_pixels: u64,
    pub diff_percent: f64,
    pub diff_path: Option<PathBuf>,
    pub mismatch: Option<MismatchedDimensions>,
}

impl VisualComparison {
    pub fn dimension_mismatch(
        current: Dimensions,
        baseline: Dimensions,
    ) -> Self {
        VisualComparison {
            matched: false,
            diff_pixels: -1,
            total_pixels: current.width as u64 * current.height as u64,
            diff_percent: 100.0,
            diff_path: None,
            mismatch: Some(MismatchedDimensions { current, baseline }),
        }
    }

    /// `diff_path` is kept only when the comparison fails.
    pub fn from_counts(
        diff_pixels: u64,
        total_pixels: u64,
        threshold: f64,
        diff_path: &Path,
    ) -> Self {
        let diff_percent = if total_pixels == 0 {
            0.0
        } else {
            diff_pixels as f64 / total_pixels as f64 * 100.0
        };
        let matched = diff_percent <= threshold;
        VisualComparison {
            matched,
            diff_pixels: diff_pixels as i64,
            total_pixels,
            diff_percent,
            diff_path: (!matched).then(|| diff_path.to_path_buf()),
            mismatch: None,
        }
    }

    pub fn is_dimension_mismatch(&self) -> bool {
        self.mismatch.is_some()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ScreenshotOutcome {
    BaselineCreated,
    BaselineUpdated,
    Compared(VisualComparison),
}

impl ScreenshotOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, ScreenshotOutcome::Compared(c) if !c.matched)
    }
}

#[derive(Clone, Debug)]
pub struct VisualOptions {
    pub enabled: bool,
    pub update_baselines: bool,
    /// Allowed share of differing pixels, in percent.
    pub threshold: f64,
    pub baselines_dir: PathBuf,
    pub diffs_dir: PathBuf,
}

/// `<route-slug>--<width>.png`, with `index` standing in for `/`.
pub fn screenshot_filename(route: &str, width: u32) -> String {
    let slug = match route.trim_start_matches('/') {
        "" => "index".to_string(),
        rest => rest.replace('/', "-"),
    };
    format!("{}--{}.png", slug, width)
}

/// Owns the baseline directory and decides the outcome of each capture.
pub struct VisualEngine {
    options: VisualOptions,
}

impl VisualEngine {
    pub fn new(options: VisualOptions) -> Self {
        VisualEngine { options }
    }

    pub fn options(&self) -> &VisualOptions {
        &self.options
    }

    pub fn baseline_path(&self, filename: &str) -> PathBuf {
        self.options.baselines_dir.join(filename)
    }

    pub fn diff_path(&self, filename: &str) -> PathBuf {
        self.options.diffs_dir.join(filename)
    }

    /// Applies the baseline policy to a capture at `current`. `None` means
    /// visual regression is disabled.
    pub fn resolve(
        &self,
        current: &Path,
        filename: &str,
    ) -> Result<Option<ScreenshotOutcome>> {
        let baseline = self.baseline_path(filename);
        if self.options.update_baselines {
            install_baseline(current, &baseline)?;
            info!("updated baseline {}", baseline.display());
            return Ok(Some(ScreenshotOutcome::BaselineUpdated));
        }
        if !self.options.enabled {
            return Ok(None);
        }
        if !baseline.exists() {
            install_baseline(current, &baseline)?;
            info!("created baseline {}", baseline.display());
            return Ok(Some(ScreenshotOutcome::BaselineCreated));
        }
        let comparison = compare(
            current,
            &baseline,
            &self.diff_path(filename),
            self.options.threshold,
        )?;
        Ok(Some(ScreenshotOutcome::Compared(comparison)))
    }
}

fn dimensions(image: &image::RgbaImage) -> Dimensions {
    Dimensions {
        width: image.width(),
        height: image.height(),
    }
}

fn load(path: &Path) -> Result<image::RgbaImage> {
    Ok(image::open(path)
        .with_context(|| format!("decode {}", path.display()))?
        .into_rgba8())
}

/// Compares two PNG files. The diff visualisation is only written when the
/// comparison fails.
pub fn compare(
    current_path: &Path,
    baseline_path: &Path,
    diff_path: &Path,
    threshold: f64,
) -> Result<VisualComparison> {
    let current = load(current_path)?;
    let baseline = load(baseline_path)?;

    let Some(result) = pixel::diff(&current, &baseline, PIXEL_SENSITIVITY)
    else {
        return Ok(VisualComparison::dimension_mismatch(
            dimensions(&current),
            dimensions(&baseline),
        ));
    };

    let total_pixels = current.width() as u64 * current.height() as u64;
    let comparison = VisualComparison::from_counts(
        result.diff_pixels,
        total_pixels,
        threshold,
        diff_path,
    );
    debug!(
        "{}: {} of {} pixels differ",
        current_path.display(),
        result.diff_pixels,
        total_pixels
    );

    if let Some(path) = &comparison.diff_path {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        result
            .image
            .save(path)
            .with_context(|| format!("write diff {}", path.display()))?;
    }
    Ok(comparison)
}

// Copies through a temp file in the baseline directory and renames it into
// place so readers never observe a partial baseline.
fn install_baseline(current: &Path, baseline: &Path) -> Result<()> {
    let dir = baseline
        .parent()
        .context("baseline path has no parent directory")?;
    fs::create_dir_all(dir)
        .with_context(|| format!("create {}", dir.display()))?;
    let mut temporary = NamedTempFile::new_in(dir)?;
    let mut source = fs::File::open(current)
        .with_context(|| format!("open {}", current.display()))?;
    std::io::copy(&mut source, temporary.as_file_mut())?;
    temporary.as_file().sync_all()?;
    temporary
        .persist(baseline)
        .with_context(|| format!("install baseline {}", baseline.display()))?;
    Ok(())
}
