//! Structured cascade description, as produced by the boosted-cascade trainer.
//!
//! The schema mirrors the trainer's output document: a header with stage and
//! feature type tags and the window size, followed by the stage list, each
//! stage holding its weak classifiers as flat `internalNodes` / `leafValues`
//! arrays, and finally the feature rectangles.
//!
//! # Example
//!
//! ```ignore
//! use lbp_cascade::description::load_description;
//!
//! // Plain JSON or bzip2-compressed JSON
//! let desc = load_description("lbpcascade_frontalface.json.bz2")?;
//! ```
//!
//! Sections are optional at the serde level so that a missing section is
//! reported by the model loader as a load error rather than a parse error.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use bzip2::read::BzDecoder;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Stage type tag of a boosted ensemble cascade.
pub const STAGE_TYPE_BOOST: &str = "BOOST";
/// Feature type tag of local-binary-pattern features.
pub const FEATURE_TYPE_LBP: &str = "LBP";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CascadeDescription {
    pub stage_type: String,
    pub feature_type: String,
    pub width: i32,
    pub height: i32,
    #[serde(default)]
    pub stage_params: Option<StageParams>,
    #[serde(default)]
    pub feature_params: Option<FeatureParams>,
    #[serde(default)]
    pub stages: Option<Vec<StageDescription>>,
    #[serde(default)]
    pub features: Option<Vec<FeatureDescription>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageParams {
    pub max_depth: i32,
    #[serde(default)]
    pub max_weak_count: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureParams {
    /// Number of categories a feature value can take (256 for LBP), or 0 for
    /// ordinal features compared against a scalar threshold.
    pub max_cat_count: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageDescription {
    pub stage_threshold: f32,
    #[serde(default)]
    pub weak_classifiers: Option<Vec<WeakClassifierDescription>>,
}

/// One weak tree. `internal_nodes` holds, per node, `left, right, featureIdx`
/// followed by the categorical bitset words or a single ordinal threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeakClassifierDescription {
    #[serde(default)]
    pub internal_nodes: Option<Vec<f64>>,
    #[serde(default)]
    pub leaf_values: Option<Vec<f32>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureDescription {
    pub rect: Vec<i32>,
}

/// Load a cascade description from a `.json` or `.json.bz2` file.
pub fn load_description<P: AsRef<Path>>(path: P) -> Result<CascadeDescription> {
    let path = path.as_ref();
    let file = File::open(path)?;
    let reader = BufReader::new(file);

    let is_bz2 = path.extension().is_some_and(|ext| ext == "bz2");
    debug!("reading cascade description {:?} (bzip2: {})", path, is_bz2);

    if is_bz2 {
        description_from_reader(BzDecoder::new(reader))
    } else {
        description_from_reader(reader)
    }
}

/// Parse a cascade description from an already-opened reader.
pub fn description_from_reader<R: Read>(reader: R) -> Result<CascadeDescription> {
    Ok(serde_json::from_reader(reader)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "stageType": "BOOST",
        "featureType": "LBP",
        "width": 24,
        "height": 24,
        "stageParams": { "maxDepth": 1, "maxWeakCount": 3 },
        "featureParams": { "maxCatCount": 256 },
        "stages": [
            {
                "stageThreshold": -0.75,
                "weakClassifiers": [
                    {
                        "internalNodes": [0, -1, 0, -1, -1, -1, -1, -1, -1, -1, -1],
                        "leafValues": [-0.9, 0.6]
                    }
                ]
            }
        ],
        "features": [ { "rect": [0, 0, 8, 8] } ]
    }"#;

    #[test]
    fn parses_trainer_schema() {
        let desc = description_from_reader(MINIMAL.as_bytes()).unwrap();
        assert_eq!(desc.stage_type, STAGE_TYPE_BOOST);
        assert_eq!(desc.feature_type, FEATURE_TYPE_LBP);
        assert_eq!((desc.width, desc.height), (24, 24));
        assert_eq!(desc.stage_params.as_ref().unwrap().max_depth, 1);
        assert_eq!(desc.feature_params.as_ref().unwrap().max_cat_count, 256);

        let stages = desc.stages.as_ref().unwrap();
        assert_eq!(stages.len(), 1);
        let weak = &stages[0].weak_classifiers.as_ref().unwrap()[0];
        assert_eq!(weak.internal_nodes.as_ref().unwrap().len(), 11);
        assert_eq!(weak.leaf_values.as_ref().unwrap(), &vec![-0.9, 0.6]);
        assert_eq!(desc.features.as_ref().unwrap()[0].rect, vec![0, 0, 8, 8]);
    }

    #[test]
    fn missing_sections_parse_as_none() {
        let json = r#"{ "stageType": "BOOST", "featureType": "LBP", "width": 20, "height": 20 }"#;
        let desc = description_from_reader(json.as_bytes()).unwrap();
        assert!(desc.stages.is_none());
        assert!(desc.features.is_none());
        assert!(desc.feature_params.is_none());
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(description_from_reader("{ not json".as_bytes()).is_err());
    }
}
