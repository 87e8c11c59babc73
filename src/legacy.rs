//! Conversion of legacy Haar cascades into flattened node arrays.
//!
//! The legacy format is a pointer-linked tree per weak classifier. Here it is
//! represented as a tagged tree ([`LegacyNode`]) and flattened depth-first:
//! all tree roots come first, in stage order, followed by every non-root
//! node. Child links to split nodes are remapped into the merged array.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::Size;

/// One weighted rectangle of a Haar feature.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightedRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub weight: f32,
}

impl WeightedRect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32, weight: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            weight,
        }
    }
}

/// A Haar feature: up to a handful of weighted rectangles. A zero weight ends
/// the list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HaarFeature {
    pub rects: Vec<WeightedRect>,
    pub tilted: bool,
}

/// A node of a legacy weak-classifier tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LegacyNode {
    Leaf(f32),
    Split {
        feature: HaarFeature,
        threshold: f32,
        left: Box<LegacyNode>,
        right: Box<LegacyNode>,
    },
}

impl LegacyNode {
    pub fn stump(feature: HaarFeature, threshold: f32, left: f32, right: f32) -> Self {
        Self::Split {
            feature,
            threshold,
            left: Box::new(Self::Leaf(left)),
            right: Box::new(Self::Leaf(right)),
        }
    }

    /// Number of split levels on the deepest path.
    pub fn depth(&self) -> usize {
        match self {
            Self::Leaf(_) => 0,
            Self::Split { left, right, .. } => 1 + left.depth().max(right.depth()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyStage {
    pub threshold: f32,
    pub trees: Vec<LegacyNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyCascade {
    pub window: Size,
    pub stages: Vec<LegacyStage>,
}

/// Where a flattened node's branch leads.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum HaarNodeLink {
    Leaf(f32),
    Node(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HaarNode {
    pub threshold: f32,
    pub left: HaarNodeLink,
    pub right: HaarNodeLink,
    pub first_rect: usize,
    pub rect_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HaarStage {
    pub first_root: usize,
    pub root_count: usize,
    pub threshold: f32,
}

/// Flattened Haar cascade: stage table, root-first node array, rect table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HaarCascade {
    pub window: Size,
    pub stages: Vec<HaarStage>,
    pub nodes: Vec<HaarNode>,
    pub rects: Vec<WeightedRect>,
    pub stumps_only: bool,
    pub needs_tilted: bool,
}

impl HaarCascade {
    pub fn num_roots(&self) -> usize {
        self.stages.iter().map(|s| s.root_count).sum()
    }

    /// Walk the tree rooted at `root`, going left when the node's feature
    /// value is below its threshold, and return the reached leaf value.
    pub fn tree_value<F>(&self, root: usize, feature_value: F) -> f32
    where
        F: Fn(&HaarNode, &[WeightedRect]) -> f32,
    {
        let mut idx = root;
        loop {
            let node = &self.nodes[idx];
            let rects = &self.rects[node.first_rect..node.first_rect + node.rect_count];
            let link = if feature_value(node, rects) < node.threshold {
                node.left
            } else {
                node.right
            };
            match link {
                HaarNodeLink::Leaf(v) => return v,
                HaarNodeLink::Node(next) => idx = next,
            }
        }
    }
}

struct Flattener {
    window: Size,
    rects: Vec<WeightedRect>,
    extra: Vec<HaarNode>,
    needs_tilted: bool,
    stumps_only: bool,
}

impl Flattener {
    fn push_feature(&mut self, feature: &HaarFeature) -> Result<(usize, usize)> {
        let first = self.rects.len();
        for r in feature.rects.iter().take_while(|r| r.weight != 0.0) {
            let fits = r.x as i64 + r.width as i64 <= self.window.width as i64
                && r.y as i64 + r.height as i64 <= self.window.height as i64;
            if !fits {
                return Err(Error::model(format!(
                    "feature rect {:?} exceeds window {:?}",
                    r, self.window
                )));
            }
            self.rects.push(*r);
        }
        self.needs_tilted |= feature.tilted;
        Ok((first, self.rects.len() - first))
    }

    /// Emit a split node. Child split nodes go to the non-root array; their
    /// indices are local to it until the final remap.
    fn split_node(&mut self, node: &LegacyNode) -> Result<HaarNode> {
        let LegacyNode::Split {
            feature,
            threshold,
            left,
            right,
        } = node
        else {
            return Err(Error::model("tree root must be a split node"));
        };

        let (first_rect, rect_count) = self.push_feature(feature)?;
        let left = self.link(left)?;
        let right = self.link(right)?;
        Ok(HaarNode {
            threshold: *threshold,
            left,
            right,
            first_rect,
            rect_count,
        })
    }

    fn link(&mut self, child: &LegacyNode) -> Result<HaarNodeLink> {
        match child {
            LegacyNode::Leaf(v) => Ok(HaarNodeLink::Leaf(*v)),
            LegacyNode::Split { .. } => {
                self.stumps_only = false;
                let slot = self.extra.len();
                // Reserve the slot so the parent's link is known before the
                // subtree is emitted.
                self.extra.push(HaarNode {
                    threshold: 0.0,
                    left: HaarNodeLink::Leaf(0.0),
                    right: HaarNodeLink::Leaf(0.0),
                    first_rect: 0,
                    rect_count: 0,
                });
                let node = self.split_node(child)?;
                self.extra[slot] = node;
                Ok(HaarNodeLink::Node(slot))
            }
        }
    }
}

fn remap(link: HaarNodeLink, offset: usize) -> HaarNodeLink {
    match link {
        HaarNodeLink::Node(i) => HaarNodeLink::Node(i + offset),
        leaf => leaf,
    }
}

/// Flatten a legacy cascade into root-first node arrays.
pub fn flatten_legacy(cascade: &LegacyCascade) -> Result<HaarCascade> {
    if cascade.window.is_empty() {
        return Err(Error::model(format!(
            "invalid window size {:?}",
            cascade.window
        )));
    }

    let mut flattener = Flattener {
        window: cascade.window,
        rects: Vec::new(),
        extra: Vec::new(),
        needs_tilted: false,
        stumps_only: true,
    };
    let mut roots = Vec::new();
    let mut stages = Vec::with_capacity(cascade.stages.len());

    for stage in &cascade.stages {
        stages.push(HaarStage {
            first_root: roots.len(),
            root_count: stage.trees.len(),
            threshold: stage.threshold,
        });
        for tree in &stage.trees {
            roots.push(flattener.split_node(tree)?);
        }
    }

    let offset = roots.len();
    let mut nodes = roots;
    nodes.extend(flattener.extra);
    for node in &mut nodes {
        node.left = remap(node.left, offset);
        node.right = remap(node.right, offset);
    }

    Ok(HaarCascade {
        window: cascade.window,
        stages,
        nodes,
        rects: flattener.rects,
        stumps_only: flattener.stumps_only,
        needs_tilted: flattener.needs_tilted,
    })
}
