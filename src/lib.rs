//! # lbp-cascade
//!
//! Pure Rust multi-scale object detection with boosted local-binary-pattern
//! cascades, plus a chamfer distance transform.
//!
//! This crate provides:
//! - **Cascade models**: loading of boosted LBP stump cascades into a flat,
//!   index-linked [`FlattenedModel`], with bincode persistence
//! - **Detection**: a scale pyramid packed into shared integral buffers,
//!   scanned in parallel with early stage rejection, then grouped into
//!   [`Detection`]s
//! - **Distance transform**: 3x3 and 5x5 chamfer propagation over binary
//!   masks, optionally labeling every pixel with its nearest zero region
//! - **Legacy conversion**: flattening of tree-linked Haar cascades
//!
//! ## Detection Overview
//!
//! 1. Plan pyramid levels at `scale_factor^k` until the window no longer fits
//! 2. Pack consecutive levels side by side into one integral buffer
//! 3. For every window of every packed level, walk the stages; a stage whose
//!    stump sum falls below its threshold rejects the window at once
//! 4. Surviving windows are mapped back to frame coordinates and clustered
//!
//! ## Quick Start
//!
//! ```rust
//! use lbp_cascade::{
//!     CascadeBuilder, CascadeClassifier, DetectorParams, GrayImage, LbpFeature, Size, Stump,
//! };
//!
//! // Load a trained cascade
//! // let mut classifier = CascadeClassifier::from_file("lbpcascade_frontalface.json.bz2").unwrap();
//!
//! // Or assemble one in code
//! let model = CascadeBuilder::new(Size::new(24, 24))
//!     .feature(LbpFeature::new(0, 0, 8, 8))
//!     .stage(0.0, vec![Stump::categorical(0, &[0], 1.0, -1.0)])
//!     .build()
//!     .unwrap();
//! let mut classifier = CascadeClassifier::from_model(model);
//!
//! let image = GrayImage::from_fn(96, 96, |x, y| ((x * 3 + y) % 256) as u8);
//! let params = DetectorParams {
//!     candidate_capacity: Some(100_000),
//!     ..Default::default()
//! };
//! let detections = classifier.detect(&image, &params).unwrap();
//! println!("Found {} objects", detections.len());
//! ```
//!
//! ## Distance Transform
//!
//! ```rust
//! use lbp_cascade::distance::{distance_transform, DistanceMetric, DistanceParams, MaskSize};
//! use lbp_cascade::GrayImage;
//!
//! let mask = GrayImage::from_fn(9, 9, |x, y| if (x, y) == (4, 4) { 0 } else { 255 });
//! let params = DistanceParams {
//!     metric: DistanceMetric::Chebyshev,
//!     mask_size: MaskSize::Mask3x3,
//!     labels: false,
//! };
//! let out = distance_transform(&mask, &params).unwrap();
//! assert_eq!(out.distances.get(0, 0), 4.0);
//! ```
//!
//! ## Custom Image Types
//!
//! Detection reads frames through the [`ImageAccess`] trait:
//!
//! ```rust
//! use lbp_cascade::ImageAccess;
//!
//! struct MyImage { /* ... */ }
//!
//! impl ImageAccess for MyImage {
//!     fn get_pixel(&self, x: i32, y: i32) -> u8 {
//!         // Return grayscale intensity at (x, y)
//!         // Return 0 for out-of-bounds
//!         0
//!     }
//!     fn width(&self) -> u32 { 640 }
//!     fn height(&self) -> u32 { 480 }
//! }
//! ```

pub mod description;
mod detector;
pub mod distance;
mod error;
mod evaluator;
mod features;
mod grouping;
mod image;
pub mod legacy;
mod model;
mod pyramid;
mod types;

pub use detector::{CascadeClassifier, DetectorParams};
pub use error::{Error, Result};
pub use evaluator::{CandidateBuffer, CascadeEvaluator, WindowOutcome};
pub use features::LbpFeature;
pub use grouping::{group_candidates, group_rectangles, largest, partition, similar, Detection};
pub use image::{
    resize_bilinear, FloatImage, GrayImage, Image, ImageAccess, IntegralView, LabelImage,
    PackedIntegral,
};
pub use model::{
    CascadeBuilder, FlattenedModel, Node, Stage, Stump, StumpSplit, STAGE_THRESHOLD_EPS,
};
pub use pyramid::{PackingPass, PassLevel, PyramidLevel, PyramidScheduler};
pub use types::{Rect, Size};
