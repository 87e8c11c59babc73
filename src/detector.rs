//! Multi-scale detection front end.

use std::path::Path;

use log::{debug, warn};
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};

use crate::description::load_description;
use crate::error::{Error, Result};
use crate::evaluator::{CandidateBuffer, CascadeEvaluator};
use crate::grouping::{group_candidates, Detection};
use crate::image::{resize_bilinear, GrayImage, ImageAccess, PackedIntegral};
use crate::model::FlattenedModel;
use crate::pyramid::PyramidScheduler;
use crate::types::{Rect, Size};

/// Tuning knobs for [`CascadeClassifier::detect`].
///
/// Deserializes with defaults for missing fields, so a params file only needs
/// the values it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorParams {
    /// Ratio between consecutive pyramid scales; must exceed 1.
    pub scale_factor: f32,
    /// Minimum cluster size kept by grouping. Zero or less disables grouping.
    pub group_threshold: i32,
    /// Relative tolerance of the rectangle similarity test.
    pub grouping_eps: f64,
    /// Largest object to look for. `None` or an empty size means the frame.
    pub max_object_size: Option<Size>,
    /// Width of the packed integral buffer in units of `frame.width + 1`.
    pub integral_factor: usize,
    /// Candidate buffer capacity. Defaults to half the frame width.
    pub candidate_capacity: Option<usize>,
    /// Keep only the largest grouped object.
    pub find_largest_object: bool,
    /// Run the window scan in a dedicated pool of this many threads instead
    /// of the global rayon pool.
    pub num_threads: Option<usize>,
}

impl Default for DetectorParams {
    fn default() -> Self {
        Self {
            scale_factor: 1.2,
            group_threshold: 4,
            grouping_eps: 0.2,
            max_object_size: None,
            integral_factor: 4,
            candidate_capacity: None,
            find_largest_object: false,
            num_threads: None,
        }
    }
}

impl DetectorParams {
    pub fn validate(&self) -> Result<()> {
        if !(self.scale_factor.is_finite() && self.scale_factor > 1.0) {
            return Err(Error::config(format!(
                "scale_factor must be greater than 1, got {}",
                self.scale_factor
            )));
        }
        if !(self.grouping_eps.is_finite() && self.grouping_eps >= 0.0) {
            return Err(Error::config(format!(
                "grouping_eps must be finite and non-negative, got {}",
                self.grouping_eps
            )));
        }
        if self.integral_factor == 0 {
            return Err(Error::config("integral_factor must be at least 1"));
        }
        if self.num_threads == Some(0) {
            return Err(Error::config("num_threads must be at least 1"));
        }
        Ok(())
    }

    fn capacity_for(&self, frame: Size) -> usize {
        self.candidate_capacity
            .unwrap_or((frame.width >> 1).max(0) as usize)
    }
}

/// Buffers reused across detection calls, grown when a larger frame arrives.
#[derive(Debug)]
struct Workspace {
    resized: GrayImage,
    integral: PackedIntegral,
}

impl Workspace {
    fn new() -> Self {
        Self {
            resized: GrayImage::filled(0, 0, 0),
            integral: PackedIntegral::new(Size::zero(), 1),
        }
    }

    fn ensure(&mut self, frame: Size, integral_factor: usize) {
        if !self.integral.fits(frame, integral_factor) {
            debug!(
                "allocating integral buffer for {}x{} frame, factor {}",
                frame.width, frame.height, integral_factor
            );
            self.integral = PackedIntegral::new(frame, integral_factor);
        }
    }
}

/// LBP cascade detector.
///
/// Starts empty; detection on an empty classifier fails with
/// [`Error::EmptyClassifier`]. Loading replaces the model as a whole, and a
/// failed load leaves the classifier empty.
///
/// # Usage
///
/// ```ignore
/// let mut classifier = CascadeClassifier::from_file("lbpcascade_frontalface.json.bz2")?;
/// let faces = classifier.detect(&image, &DetectorParams::default())?;
/// ```
#[derive(Debug)]
pub struct CascadeClassifier {
    model: Option<FlattenedModel>,
    workspace: Workspace,
    pool: Option<(usize, ThreadPool)>,
}

impl Default for CascadeClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl CascadeClassifier {
    /// An empty classifier.
    pub fn new() -> Self {
        Self {
            model: None,
            workspace: Workspace::new(),
            pool: None,
        }
    }

    pub fn from_model(model: FlattenedModel) -> Self {
        let mut classifier = Self::new();
        classifier.set_model(model);
        classifier
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut classifier = Self::new();
        classifier.load(path)?;
        Ok(classifier)
    }

    /// Load a cascade, replacing the current one. `.bin` files are bincode
    /// flattened models; anything else is read as a cascade description
    /// (JSON, optionally bzip2-compressed).
    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.model = None;

        let loaded = if path.extension().is_some_and(|ext| ext == "bin") {
            FlattenedModel::load(path)
        } else {
            load_description(path).and_then(|desc| FlattenedModel::from_description(&desc))
        };

        match loaded {
            Ok(model) => {
                self.set_model(model);
                Ok(())
            }
            Err(e) => {
                warn!("failed to load cascade {:?}: {}", path, e);
                Err(e)
            }
        }
    }

    pub fn set_model(&mut self, model: FlattenedModel) {
        debug!(
            "cascade ready: window {}x{}, {} stages, {} stumps",
            model.window_size().width,
            model.window_size().height,
            model.num_stages(),
            model.num_trees()
        );
        self.model = Some(model);
    }

    /// Drop the model, returning the classifier to the empty state.
    pub fn clear(&mut self) {
        self.model = None;
    }

    pub fn is_empty(&self) -> bool {
        self.model.is_none()
    }

    pub fn model(&self) -> Option<&FlattenedModel> {
        self.model.as_ref()
    }

    pub fn window_size(&self) -> Option<Size> {
        self.model.as_ref().map(FlattenedModel::window_size)
    }

    /// Detect objects and return the grouped detections.
    pub fn detect<I: ImageAccess + ?Sized>(
        &mut self,
        image: &I,
        params: &DetectorParams,
    ) -> Result<Vec<Detection>> {
        let mut out = Vec::new();
        self.detect_into(image, params, &mut out)?;
        Ok(out)
    }

    /// Detect into a caller-provided vector, which is cleared first and grown
    /// as needed. Returns the number of detections.
    pub fn detect_into<I: ImageAccess + ?Sized>(
        &mut self,
        image: &I,
        params: &DetectorParams,
        out: &mut Vec<Detection>,
    ) -> Result<usize> {
        let candidates = self.detect_candidates(image, params)?;
        let grouped = group_candidates(
            &candidates,
            params.group_threshold,
            params.grouping_eps,
            params.find_largest_object,
        );
        debug!(
            "{} candidates grouped into {} detections",
            candidates.len(),
            grouped.len()
        );

        out.clear();
        out.extend(grouped);
        Ok(out.len())
    }

    /// Raw accepted windows in frame coordinates, before grouping.
    pub fn detect_candidates<I: ImageAccess + ?Sized>(
        &mut self,
        image: &I,
        params: &DetectorParams,
    ) -> Result<Vec<Rect>> {
        let model = self.model.as_ref().ok_or(Error::EmptyClassifier)?;
        params.validate()?;

        let frame = image.size();
        let scheduler = PyramidScheduler::new(
            frame,
            model.window_size(),
            params.scale_factor,
            params.max_object_size,
            params.integral_factor,
        )?;
        let passes = scheduler.plan();
        let pool = dedicated_pool(&mut self.pool, params.num_threads)?;

        let workspace = &mut self.workspace;
        workspace.ensure(frame, params.integral_factor);

        let candidates = CandidateBuffer::new(params.capacity_for(frame));
        let evaluator = CascadeEvaluator::new(model);

        for pass in &passes {
            for level in &pass.levels {
                let size = level.level.scaled_frame;
                workspace.resized.reshape(size.width as u32, size.height as u32);
                resize_bilinear(image, &mut workspace.resized);
                workspace
                    .integral
                    .integrate(&workspace.resized, level.offset)?;
            }

            match pool {
                Some(pool) => {
                    pool.install(|| evaluator.scan_pass(pass, &workspace.integral, &candidates))
                }
                None => evaluator.scan_pass(pass, &workspace.integral, &candidates),
            }
        }

        debug!(
            "{} passes over {} levels, {} candidates (capacity {})",
            passes.len(),
            passes.iter().map(|p| p.levels.len()).sum::<usize>(),
            candidates.count(),
            candidates.capacity()
        );
        candidates.into_candidates()
    }
}

/// Return the dedicated scan pool, rebuilding it when the thread count changes.
fn dedicated_pool(
    slot: &mut Option<(usize, ThreadPool)>,
    threads: Option<usize>,
) -> Result<Option<&ThreadPool>> {
    let Some(threads) = threads else {
        return Ok(None);
    };
    if !matches!(slot, Some((n, _)) if *n == threads) {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("lbp-scan-{}", i))
            .build()
            .map_err(|e| Error::Accelerator(e.to_string()))?;
        *slot = Some((threads, pool));
    }
    Ok(slot.as_ref().map(|(_, pool)| pool))
}
