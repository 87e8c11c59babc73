//! Cascade evaluation over the windows of a packing pass.
//!
//! Every window is independent: the stage walk reads only the shared integral
//! buffer and the read-only model. Accepted windows claim a slot in a
//! [`CandidateBuffer`] with a single atomic fetch-add, so the scan needs no
//! locks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

use log::trace;
use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::image::{IntegralView, PackedIntegral};
use crate::model::FlattenedModel;
use crate::pyramid::PackingPass;
use crate::types::Rect;

/// Result of walking the cascade for one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowOutcome {
    Accepted,
    /// The window failed `stage`; later stages were not evaluated.
    Rejected { stage: usize },
}

impl WindowOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

/// Fixed-capacity, append-only candidate sink shared by all scan workers.
///
/// The counter keeps counting past capacity so the caller learns how large
/// the buffer would have had to be.
#[derive(Debug)]
pub struct CandidateBuffer {
    slots: Vec<OnceLock<Rect>>,
    count: AtomicUsize,
}

impl CandidateBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| OnceLock::new()).collect(),
            count: AtomicUsize::new(0),
        }
    }

    /// Claim the next slot. Returns false when the buffer is already full;
    /// the candidate is still counted.
    pub fn push(&self, rect: Rect) -> bool {
        let idx = self.count.fetch_add(1, Ordering::Relaxed);
        match self.slots.get(idx) {
            Some(slot) => slot.set(rect).is_ok(),
            None => false,
        }
    }

    /// Total candidates pushed, including any that did not fit.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn overflowed(&self) -> bool {
        self.count() > self.capacity()
    }

    /// Stored candidates, or [`Error::CapacityExceeded`] with the full count.
    pub fn into_candidates(self) -> Result<Vec<Rect>> {
        let found = self.count.into_inner();
        let capacity = self.slots.len();
        if found > capacity {
            return Err(Error::CapacityExceeded { found, capacity });
        }
        Ok(self
            .slots
            .into_iter()
            .take(found)
            .filter_map(OnceLock::into_inner)
            .collect())
    }
}

/// Evaluates a [`FlattenedModel`] against windows of an integral image.
#[derive(Debug, Clone, Copy)]
pub struct CascadeEvaluator<'m> {
    model: &'m FlattenedModel,
}

impl<'m> CascadeEvaluator<'m> {
    pub fn new(model: &'m FlattenedModel) -> Self {
        Self { model }
    }

    pub fn model(&self) -> &'m FlattenedModel {
        self.model
    }

    /// Sum of the leaf values of every stump in `stage` for the window at
    /// (`x`, `y`).
    #[inline]
    pub fn stage_sum(&self, stage: usize, integral: &IntegralView<'_>, x: usize, y: usize) -> f32 {
        let stage = &self.model.stages()[stage];
        let nodes = self.model.nodes();
        let features = self.model.features();

        (stage.first_tree..stage.first_tree + stage.tree_count)
            .map(|tree| {
                let code = features[nodes[tree].feature_index].code(integral, x, y);
                self.model.stump_value(tree, code)
            })
            .sum()
    }

    /// Walk the stages in order, stopping at the first one whose sum falls
    /// below its threshold.
    #[inline]
    pub fn classify_window(&self, integral: &IntegralView<'_>, x: usize, y: usize) -> WindowOutcome {
        self.classify_window_with(integral, x, y, |_| {})
    }

    /// Like [`classify_window`](Self::classify_window), calling `on_stage`
    /// with the index of each stage before it is evaluated.
    pub fn classify_window_with<F>(
        &self,
        integral: &IntegralView<'_>,
        x: usize,
        y: usize,
        mut on_stage: F,
    ) -> WindowOutcome
    where
        F: FnMut(usize),
    {
        for (idx, stage) in self.model.stages().iter().enumerate() {
            on_stage(idx);
            if self.stage_sum(idx, integral, x, y) < stage.threshold {
                return WindowOutcome::Rejected { stage: idx };
            }
        }
        WindowOutcome::Accepted
    }

    /// Scan every window of `pass` in parallel and push the frame-space
    /// rectangle of each accepted window into `candidates`.
    ///
    /// Runs on the current rayon pool; returns once every window is done.
    pub fn scan_pass(
        &self,
        pass: &PackingPass,
        integral: &PackedIntegral,
        candidates: &CandidateBuffer,
    ) {
        let before = candidates.count();
        (0..pass.total_windows).into_par_iter().for_each(|window| {
            let Some((level, local)) = pass.locate(window) else {
                return;
            };
            let (x, y) = level.window_origin(local);
            let view = integral.view(level.offset);
            if self.classify_window(&view, x, y).is_accepted() {
                candidates.push(level.level.candidate(x, y));
            }
        });
        trace!(
            "scanned {} windows, {} accepted",
            pass.total_windows,
            candidates.count() - before
        );
    }
}
