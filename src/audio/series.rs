use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;
use crate::features::index::{feature_key, ValueRange};

/// One scalar feature of one stem, sampled uniformly across the whole clip.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureSeries {
    pub stem_id: String,
    pub feature_name: String,
    pub samples: Vec<f32>,
    /// Normalization range for the packed texture. Defaults to 0..1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<ValueRange>,
}

impl FeatureSeries {
    pub fn new(stem_id: impl Into<String>, feature_name: impl Into<String>, samples: Vec<f32>) -> Self {
        Self {
            stem_id: stem_id.into(),
            feature_name: feature_name.into(),
            samples,
            range: None,
        }
    }

    pub fn with_range(mut self, min: f32, max: f32) -> Self {
        self.range = Some(ValueRange { min, max });
        self
    }

    /// Key used in frame records and shader constants: `stem-feature`.
    pub fn key(&self) -> String {
        feature_key(&self.stem_id, &self.feature_name)
    }
}

/// On-disk analysis dataset as produced by the (external) analysis step.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AnalysisFile {
    /// Clip duration in seconds, if the analysis step recorded it.
    #[serde(default)]
    pub duration: Option<f64>,
    pub series: Vec<FeatureSeries>,
}

pub fn load_analysis_file(path: &Path) -> Result<AnalysisFile> {
    let content = std::fs::read_to_string(path)?;
    let file: AnalysisFile = serde_json::from_str(&content)?;
    log::info!(
        "Loaded analysis: {} series from {}",
        file.series.len(),
        path.display()
    );
    Ok(file)
}

/// Groups series by stem, preserving first-appearance order of stems and of
/// feature names within each stem.
pub fn stem_layout(series: &[FeatureSeries]) -> Vec<(String, Vec<String>)> {
    let mut layout: Vec<(String, Vec<String>)> = Vec::new();
    for s in series {
        match layout.iter_mut().find(|(stem, _)| *stem == s.stem_id) {
            Some((_, features)) => features.push(s.feature_name.clone()),
            None => layout.push((s.stem_id.clone(), vec![s.feature_name.clone()])),
        }
    }
    layout
}
