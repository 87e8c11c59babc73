use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::description::{
    CascadeDescription, FeatureDescription, FeatureParams, StageDescription, StageParams,
    WeakClassifierDescription, FEATURE_TYPE_LBP, STAGE_TYPE_BOOST,
};
use crate::error::{Error, Result};
use crate::features::LbpFeature;
use crate::types::Size;

/// Subtracted from every declared stage threshold at load time so that the
/// survival test stays stable at float-precision boundaries.
pub const STAGE_THRESHOLD_EPS: f32 = 1e-5;

/// One cascade stage: a contiguous run of trees and its acceptance threshold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub first_tree: usize,
    pub tree_count: usize,
    /// Declared threshold minus [`STAGE_THRESHOLD_EPS`].
    pub threshold: f32,
}

/// A decision node. Children `<= 0` are leaves, `-child` being the leaf's
/// index within its tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub feature_index: usize,
    pub left: i32,
    pub right: i32,
}

/// The boosted stump cascade in flattened, index-linked form.
///
/// Built once from a [`CascadeDescription`] (or a saved bincode file) and
/// read-only afterwards. Stage `s` owns trees
/// `first_tree..first_tree + tree_count`; every tree is a stump, so tree `t`
/// owns node `t` and leaves `2t` and `2t + 1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlattenedModel {
    window: Size,
    stages: Vec<Stage>,
    tree_node_counts: Vec<usize>,
    nodes: Vec<Node>,
    leaves: Vec<f32>,
    /// Categorical membership bitsets, `subset_width` words per node.
    subsets: Vec<i32>,
    /// Ordinal thresholds, one per node, when the model is not categorical.
    thresholds: Vec<f32>,
    features: Vec<LbpFeature>,
    category_count: usize,
}

impl FlattenedModel {
    /// Flatten and validate a structured cascade description.
    pub fn from_description(desc: &CascadeDescription) -> Result<Self> {
        if desc.stage_type != STAGE_TYPE_BOOST {
            return Err(Error::model(format!(
                "unsupported stage type {:?}, expected {:?}",
                desc.stage_type, STAGE_TYPE_BOOST
            )));
        }
        if desc.feature_type != FEATURE_TYPE_LBP {
            return Err(Error::model(format!(
                "unsupported feature type {:?}, expected {:?}",
                desc.feature_type, FEATURE_TYPE_LBP
            )));
        }
        if desc.width <= 0 || desc.height <= 0 {
            return Err(Error::model(format!(
                "invalid window size {}x{}",
                desc.width, desc.height
            )));
        }
        let window = Size::new(desc.width, desc.height);

        let max_depth = desc
            .stage_params
            .as_ref()
            .map(|p| p.max_depth)
            .ok_or_else(|| Error::model("missing stageParams"))?;
        if max_depth != 1 {
            return Err(Error::model(format!(
                "only stump trees are supported, maxDepth is {}",
                max_depth
            )));
        }

        let feature_params = desc
            .feature_params
            .as_ref()
            .ok_or_else(|| Error::model("missing featureParams"))?;
        if feature_params.max_cat_count < 0 {
            return Err(Error::model(format!(
                "negative maxCatCount {}",
                feature_params.max_cat_count
            )));
        }
        let category_count = feature_params.max_cat_count as usize;
        let subset_width = subset_width_for(category_count);
        let node_step = node_step_for(category_count);

        let stage_descs = desc
            .stages
            .as_ref()
            .ok_or_else(|| Error::model("missing stages"))?;
        if stage_descs.is_empty() {
            return Err(Error::model("cascade has no stages"));
        }

        let mut stages = Vec::with_capacity(stage_descs.len());
        let mut tree_node_counts = Vec::new();
        let mut nodes = Vec::new();
        let mut leaves = Vec::new();
        let mut subsets = Vec::new();
        let mut thresholds = Vec::new();

        for (si, stage_desc) in stage_descs.iter().enumerate() {
            let weak = stage_desc
                .weak_classifiers
                .as_ref()
                .ok_or_else(|| Error::model(format!("stage {} has no weakClassifiers", si)))?;

            stages.push(Stage {
                first_tree: tree_node_counts.len(),
                tree_count: weak.len(),
                threshold: stage_desc.stage_threshold - STAGE_THRESHOLD_EPS,
            });

            for (ti, tree) in weak.iter().enumerate() {
                let (internal, leaf_values) = match (&tree.internal_nodes, &tree.leaf_values) {
                    (Some(n), Some(l)) if !n.is_empty() && !l.is_empty() => (n, l),
                    _ => {
                        return Err(Error::model(format!(
                            "stage {} tree {} is missing internalNodes or leafValues",
                            si, ti
                        )))
                    }
                };

                if internal.len() % node_step != 0 {
                    return Err(Error::model(format!(
                        "stage {} tree {}: {} internal node values is not a multiple of node width {}",
                        si,
                        ti,
                        internal.len(),
                        node_step
                    )));
                }
                let node_count = internal.len() / node_step;
                if node_count != 1 || leaf_values.len() != 2 {
                    return Err(Error::model(format!(
                        "stage {} tree {} is not a stump ({} nodes, {} leaves)",
                        si,
                        ti,
                        node_count,
                        leaf_values.len()
                    )));
                }
                tree_node_counts.push(node_count);

                let node = Node {
                    left: internal[0] as i32,
                    right: internal[1] as i32,
                    feature_index: internal[2] as i64 as usize,
                };
                for child in [node.left, node.right] {
                    if child > 0 || child.unsigned_abs() as usize >= leaf_values.len() {
                        return Err(Error::model(format!(
                            "stage {} tree {}: child {} does not reference a leaf",
                            si, ti, child
                        )));
                    }
                }
                if internal[2] < 0.0 {
                    return Err(Error::model(format!(
                        "stage {} tree {}: negative feature index",
                        si, ti
                    )));
                }
                nodes.push(node);

                if category_count > 0 {
                    subsets.extend(internal[3..3 + subset_width].iter().map(|&v| v as i64 as i32));
                } else {
                    thresholds.push(internal[3] as f32);
                }
                leaves.extend_from_slice(leaf_values);
            }
        }

        let feature_descs = desc
            .features
            .as_ref()
            .ok_or_else(|| Error::model("missing features"))?;
        let mut features = Vec::with_capacity(feature_descs.len());
        for (fi, f) in feature_descs.iter().enumerate() {
            if f.rect.len() < 4 {
                return Err(Error::model(format!(
                    "feature {} rect has {} components",
                    fi,
                    f.rect.len()
                )));
            }
            let feature = LbpFeature::from_rect(f.rect[0], f.rect[1], f.rect[2], f.rect[3]);
            if !feature.extent().fits_within(window) {
                return Err(Error::model(format!(
                    "feature {} grid {:?} exceeds window {:?}",
                    fi,
                    feature.extent(),
                    window
                )));
            }
            features.push(feature);
        }

        if let Some(bad) = nodes.iter().find(|n| n.feature_index >= features.len()) {
            return Err(Error::model(format!(
                "feature index {} out of bounds ({} features)",
                bad.feature_index,
                features.len()
            )));
        }

        debug!(
            "flattened cascade: window {}x{}, {} stages, {} trees, {} features, {} categories",
            window.width,
            window.height,
            stages.len(),
            nodes.len(),
            features.len(),
            category_count
        );

        Ok(Self {
            window,
            stages,
            tree_node_counts,
            nodes,
            leaves,
            subsets,
            thresholds,
            features,
            category_count,
        })
    }

    /// Load a flattened model from a binary file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        let model: Self = bincode::deserialize(&bytes)?;
        model.check_consistency()?;
        Ok(model)
    }

    /// Save the model to a binary file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        let bytes = bincode::serialize(self)?;
        writer.write_all(&bytes)?;
        Ok(())
    }

    /// Cross-array invariants a deserialized model must satisfy before the
    /// evaluator may index into it unchecked.
    fn check_consistency(&self) -> Result<()> {
        let trees = self.nodes.len();
        let ok = !self.window.is_empty()
            && !self.stages.is_empty()
            && self.tree_node_counts.len() == trees
            && self.tree_node_counts.iter().all(|&c| c == 1)
            && self.leaves.len() == 2 * trees
            && (self.category_count == 0 || self.subsets.len() == trees * self.subset_width())
            && (self.category_count > 0 || self.thresholds.len() == trees)
            && self.stages.iter().all(|s| {
                s.first_tree
                    .checked_add(s.tree_count)
                    .is_some_and(|end| end <= trees)
            })
            && self.nodes.iter().all(|n| {
                n.feature_index < self.features.len()
                    && matches!(n.left, -1..=0)
                    && matches!(n.right, -1..=0)
            })
            && self
                .features
                .iter()
                .all(|f| f.extent().fits_within(self.window));
        if ok {
            Ok(())
        } else {
            Err(Error::model("flattened model arrays are inconsistent"))
        }
    }

    /// Detection window size.
    pub fn window_size(&self) -> Size {
        self.window
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn tree_node_counts(&self) -> &[usize] {
        &self.tree_node_counts
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn leaves(&self) -> &[f32] {
        &self.leaves
    }

    pub fn subsets(&self) -> &[i32] {
        &self.subsets
    }

    pub fn features(&self) -> &[LbpFeature] {
        &self.features
    }

    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }

    pub fn num_trees(&self) -> usize {
        self.nodes.len()
    }

    pub fn category_count(&self) -> usize {
        self.category_count
    }

    pub fn is_categorical(&self) -> bool {
        self.category_count > 0
    }

    /// Bitset words per node: `ceil(category_count / 32)`.
    pub fn subset_width(&self) -> usize {
        subset_width_for(self.category_count)
    }

    /// Values per node in the serialized layout.
    pub fn node_step(&self) -> usize {
        node_step_for(self.category_count)
    }

    /// Leaf value selected by the stump `tree` for the feature value `code`.
    #[inline]
    pub fn stump_value(&self, tree: usize, code: u8) -> f32 {
        let node = &self.nodes[tree];
        let go_left = if self.category_count > 0 {
            let width = self.subset_width();
            let subset = &self.subsets[tree * width..(tree + 1) * width];
            let c = code as usize;
            subset
                .get(c >> 5)
                .is_some_and(|word| (*word as u32) & (1u32 << (c & 31)) != 0)
        } else {
            (code as f32) < self.thresholds[tree]
        };
        let child = if go_left { node.left } else { node.right };
        self.leaves[2 * tree + child.unsigned_abs() as usize]
    }
}

fn subset_width_for(category_count: usize) -> usize {
    category_count.div_ceil(32)
}

fn node_step_for(category_count: usize) -> usize {
    3 + if category_count > 0 {
        subset_width_for(category_count)
    } else {
        1
    }
}

/// How a stump splits on the feature value.
#[derive(Debug, Clone, PartialEq)]
pub enum StumpSplit {
    /// Codes in the set take the left leaf.
    Categories(Vec<u8>),
    /// Codes below the threshold take the left leaf.
    Threshold(f32),
}

/// A stump as written by hand: feature, split rule and the two leaf values.
#[derive(Debug, Clone, PartialEq)]
pub struct Stump {
    pub feature: usize,
    pub split: StumpSplit,
    pub left: f32,
    pub right: f32,
}

impl Stump {
    pub fn categorical(feature: usize, left_codes: &[u8], left: f32, right: f32) -> Self {
        Self {
            feature,
            split: StumpSplit::Categories(left_codes.to_vec()),
            left,
            right,
        }
    }

    pub fn ordinal(feature: usize, threshold: f32, left: f32, right: f32) -> Self {
        Self {
            feature,
            split: StumpSplit::Threshold(threshold),
            left,
            right,
        }
    }
}

/// Builder for assembling a cascade in code.
///
/// Produces a [`CascadeDescription`] and runs it through the regular loader,
/// so hand-built models obey the same validation as files.
pub struct CascadeBuilder {
    window: Size,
    category_count: usize,
    features: Vec<LbpFeature>,
    stages: Vec<(f32, Vec<Stump>)>,
}

impl CascadeBuilder {
    /// A categorical LBP cascade (256 categories) with the given window.
    pub fn new(window: Size) -> Self {
        Self {
            window,
            category_count: 256,
            features: Vec::new(),
            stages: Vec::new(),
        }
    }

    /// Use ordinal stumps with scalar thresholds instead of category bitsets.
    pub fn ordinal(mut self) -> Self {
        self.category_count = 0;
        self
    }

    pub fn feature(mut self, feature: LbpFeature) -> Self {
        self.features.push(feature);
        self
    }

    /// Append a stage with its declared (unadjusted) threshold.
    pub fn stage(mut self, threshold: f32, stumps: Vec<Stump>) -> Self {
        self.stages.push((threshold, stumps));
        self
    }

    pub fn description(&self) -> Result<CascadeDescription> {
        let subset_width = subset_width_for(self.category_count);
        let mut stages = Vec::with_capacity(self.stages.len());
        for (threshold, stumps) in &self.stages {
            let mut weak = Vec::with_capacity(stumps.len());
            for stump in stumps {
                let mut internal = vec![0.0, -1.0, stump.feature as f64];
                match (&stump.split, self.category_count) {
                    (StumpSplit::Categories(codes), n) if n > 0 => {
                        let mut words = vec![0u32; subset_width];
                        for &c in codes {
                            words[c as usize >> 5] |= 1 << (c as usize & 31);
                        }
                        internal.extend(words.iter().map(|&w| w as i32 as f64));
                    }
                    (StumpSplit::Threshold(t), 0) => internal.push(*t as f64),
                    _ => {
                        return Err(Error::config(
                            "stump split kind does not match the cascade's category mode",
                        ))
                    }
                }
                weak.push(WeakClassifierDescription {
                    internal_nodes: Some(internal),
                    leaf_values: Some(vec![stump.left, stump.right]),
                });
            }
            stages.push(StageDescription {
                stage_threshold: *threshold,
                weak_classifiers: Some(weak),
            });
        }

        Ok(CascadeDescription {
            stage_type: STAGE_TYPE_BOOST.to_string(),
            feature_type: FEATURE_TYPE_LBP.to_string(),
            width: self.window.width,
            height: self.window.height,
            stage_params: Some(StageParams {
                max_depth: 1,
                max_weak_count: None,
            }),
            feature_params: Some(FeatureParams {
                max_cat_count: self.category_count as i32,
            }),
            stages: Some(stages),
            features: Some(
                self.features
                    .iter()
                    .map(|f| FeatureDescription {
                        rect: vec![f.x as i32, f.y as i32, f.width as i32, f.height as i32],
                    })
                    .collect(),
            ),
        })
    }

    pub fn build(self) -> Result<FlattenedModel> {
        FlattenedModel::from_description(&self.description()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_stage_model() -> FlattenedModel {
        CascadeBuilder::new(Size::new(24, 24))
            .feature(LbpFeature::new(0, 0, 8, 8))
            .feature(LbpFeature::new(3, 3, 6, 6))
            .stage(
                0.5,
                vec![
                    Stump::categorical(0, &[0, 255], 1.0, -1.0),
                    Stump::categorical(1, &[40], 0.25, -0.25),
                ],
            )
            .stage(-1.0, vec![Stump::categorical(1, &[7, 200], 0.5, -2.0)])
            .build()
            .unwrap()
    }

    #[test]
    fn flattened_layout() {
        let model = two_stage_model();
        assert_eq!(model.window_size(), Size::new(24, 24));
        assert_eq!(model.num_stages(), 2);
        assert_eq!(model.num_trees(), 3);
        assert_eq!(model.tree_node_counts(), &[1, 1, 1]);
        assert_eq!(model.subset_width(), 8);
        assert_eq!(model.node_step(), 11);
        assert_eq!(model.subsets().len(), 3 * 8);
        assert_eq!(model.leaves().len(), 6);

        let stages = model.stages();
        assert_eq!(stages[0].first_tree, 0);
        assert_eq!(stages[0].tree_count, 2);
        assert_eq!(stages[1].first_tree, 2);
        assert_eq!(stages[1].tree_count, 1);
    }

    #[test]
    fn thresholds_are_epsilon_adjusted() {
        let model = two_stage_model();
        assert_eq!(model.stages()[0].threshold, 0.5 - STAGE_THRESHOLD_EPS);
        assert_eq!(model.stages()[1].threshold, -1.0 - STAGE_THRESHOLD_EPS);
    }

    #[test]
    fn categorical_stump_lookup() {
        let model = two_stage_model();
        assert_eq!(model.stump_value(0, 0), 1.0);
        assert_eq!(model.stump_value(0, 255), 1.0);
        assert_eq!(model.stump_value(0, 1), -1.0);
        assert_eq!(model.stump_value(1, 40), 0.25);
        assert_eq!(model.stump_value(1, 41), -0.25);
        // Bit 31 of a word is stored as a negative i32.
        let model = CascadeBuilder::new(Size::new(24, 24))
            .feature(LbpFeature::new(0, 0, 8, 8))
            .stage(0.0, vec![Stump::categorical(0, &[31, 63], 1.0, -1.0)])
            .build()
            .unwrap();
        assert!(model.subsets()[0] < 0);
        assert_eq!(model.stump_value(0, 31), 1.0);
        assert_eq!(model.stump_value(0, 63), 1.0);
        assert_eq!(model.stump_value(0, 62), -1.0);
    }

    #[test]
    fn ordinal_stump_lookup() {
        let model = CascadeBuilder::new(Size::new(24, 24))
            .ordinal()
            .feature(LbpFeature::new(0, 0, 8, 8))
            .stage(0.0, vec![Stump::ordinal(0, 128.0, 2.0, -2.0)])
            .build()
            .unwrap();
        assert!(!model.is_categorical());
        assert_eq!(model.node_step(), 4);
        assert!(model.subsets().is_empty());
        assert_eq!(model.stump_value(0, 127), 2.0);
        assert_eq!(model.stump_value(0, 128), -2.0);
    }

    fn valid_description() -> CascadeDescription {
        CascadeBuilder::new(Size::new(20, 20))
            .feature(LbpFeature::new(1, 1, 5, 5))
            .stage(0.0, vec![Stump::categorical(0, &[3], 1.0, -1.0)])
            .description()
            .unwrap()
    }

    fn assert_load_error(desc: &CascadeDescription) {
        let err = FlattenedModel::from_description(desc).unwrap_err();
        assert!(matches!(err, Error::ModelLoad(_)), "unexpected error {:?}", err);
    }

    #[test]
    fn rejects_wrong_type_tags() {
        let mut desc = valid_description();
        desc.stage_type = "GAB".into();
        assert_load_error(&desc);

        let mut desc = valid_description();
        desc.feature_type = "HAAR".into();
        assert_load_error(&desc);
    }

    #[test]
    fn rejects_bad_window_and_depth() {
        let mut desc = valid_description();
        desc.width = 0;
        assert_load_error(&desc);

        let mut desc = valid_description();
        desc.stage_params.as_mut().unwrap().max_depth = 2;
        assert_load_error(&desc);
    }

    #[test]
    fn rejects_missing_sections() {
        let mut desc = valid_description();
        desc.feature_params = None;
        assert_load_error(&desc);

        let mut desc = valid_description();
        desc.stages = None;
        assert_load_error(&desc);

        let mut desc = valid_description();
        desc.features = None;
        assert_load_error(&desc);

        let mut desc = valid_description();
        desc.stages.as_mut().unwrap()[0].weak_classifiers = None;
        assert_load_error(&desc);

        let mut desc = valid_description();
        desc.stages.as_mut().unwrap()[0]
            .weak_classifiers
            .as_mut()
            .unwrap()[0]
            .leaf_values = None;
        assert_load_error(&desc);
    }

    #[test]
    fn rejects_non_stump_trees() {
        let mut desc = valid_description();
        let weak = &mut desc.stages.as_mut().unwrap()[0]
            .weak_classifiers
            .as_mut()
            .unwrap()[0];
        let nodes = weak.internal_nodes.clone().unwrap();
        let mut doubled = nodes.clone();
        doubled.extend(nodes);
        weak.internal_nodes = Some(doubled);
        weak.leaf_values = Some(vec![1.0, -1.0, 0.5]);
        assert_load_error(&desc);
    }

    #[test]
    fn rejects_out_of_range_features() {
        let mut desc = valid_description();
        desc.features.as_mut().unwrap()[0].rect = vec![10, 10, 5, 5];
        assert_load_error(&desc);

        let mut desc = valid_description();
        desc.stages.as_mut().unwrap()[0]
            .weak_classifiers
            .as_mut()
            .unwrap()[0]
            .internal_nodes
            .as_mut()
            .unwrap()[2] = 4.0;
        assert_load_error(&desc);
    }

    #[test]
    fn save_and_load_model() {
        let model = two_stage_model();

        let temp_path = std::env::temp_dir().join("lbp_cascade_model_roundtrip.bin");
        model.save(&temp_path).unwrap();

        let loaded = FlattenedModel::load(&temp_path).unwrap();
        assert_eq!(loaded, model);

        std::fs::remove_file(temp_path).ok();
    }

    #[test]
    fn load_rejects_inconsistent_binaries() {
        let temp_path = std::env::temp_dir().join("lbp_cascade_model_inconsistent.bin");

        let mut no_stages = two_stage_model();
        no_stages.stages.clear();
        no_stages.save(&temp_path).unwrap();
        assert!(matches!(
            FlattenedModel::load(&temp_path),
            Err(Error::ModelLoad(_))
        ));

        let mut wrapping = two_stage_model();
        wrapping.stages[1].first_tree = usize::MAX;
        wrapping.save(&temp_path).unwrap();
        assert!(matches!(
            FlattenedModel::load(&temp_path),
            Err(Error::ModelLoad(_))
        ));

        std::fs::remove_file(temp_path).ok();
    }
}
