use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::audio::series::{stem_layout, FeatureSeries};
use crate::error::{Error, Result};

/// Upper bound on addressable (stem, feature) pairs.
pub const MAX_FEATURES: usize = 256;
/// RGBA: four features share one texel.
pub const CHANNELS_PER_TEXEL: usize = 4;

/// Builds the `stem-feature` key shared by frame records and the index.
pub fn feature_key(stem_id: &str, feature_name: &str) -> String {
    format!("{}-{}", stem_id, feature_name)
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: f32,
    pub max: f32,
}

impl Default for ValueRange {
    fn default() -> Self {
        Self { min: 0.0, max: 1.0 }
    }
}

impl ValueRange {
    /// Maps `value` into 0..1, clamped. Degenerate ranges and non-finite
    /// values map to 0.
    pub fn normalize(&self, value: f32) -> f32 {
        let span = self.max - self.min;
        if !value.is_finite() || !(span > 0.0) || !span.is_finite() {
            return 0.0;
        }
        ((value - self.min) / span).clamp(0.0, 1.0)
    }
}

/// A feature name plus optional normalization range, as handed to the index.
#[derive(Clone, Debug, PartialEq)]
pub struct FeatureDecl {
    pub name: String,
    pub range: Option<ValueRange>,
}

impl From<&str> for FeatureDecl {
    fn from(name: &str) -> Self {
        Self { name: name.to_string(), range: None }
    }
}

impl From<String> for FeatureDecl {
    fn from(name: String) -> Self {
        Self { name, range: None }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureIndexEntry {
    pub index: usize,
    pub stem_id: String,
    pub feature_name: String,
    pub value_range: ValueRange,
}

impl FeatureIndexEntry {
    pub fn key(&self) -> String {
        feature_key(&self.stem_id, &self.feature_name)
    }

    /// Texture row holding this feature.
    pub fn row(&self) -> usize {
        self.index / CHANNELS_PER_TEXEL
    }

    /// RGBA channel within the row's texels.
    pub fn channel(&self) -> usize {
        self.index % CHANNELS_PER_TEXEL
    }
}

/// Assigns indices in one pass: stems in the given order, features in the
/// given order within each stem. Duplicate pairs keep their first index.
pub fn build_index<S, F>(
    stem_ids: &[S],
    features_per_stem: &[Vec<F>],
    capacity: usize,
) -> Result<Vec<FeatureIndexEntry>>
where
    S: AsRef<str>,
    F: Clone + Into<FeatureDecl>,
{
    if stem_ids.len() != features_per_stem.len() {
        return Err(Error::invalid(format!(
            "{} stems but {} feature lists",
            stem_ids.len(),
            features_per_stem.len()
        )));
    }

    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut keys: HashMap<String, (String, String)> = HashMap::new();
    let mut entries = Vec::new();

    for (stem, features) in stem_ids.iter().zip(features_per_stem) {
        for decl in features {
            let decl: FeatureDecl = decl.clone().into();
            let pair = (stem.as_ref().to_string(), decl.name.clone());
            let key = feature_key(stem.as_ref(), &decl.name);
            if !seen.insert(pair.clone()) {
                log::warn!("Duplicate feature {} ignored", key);
                continue;
            }
            // Frame records are keyed by the joined string, so it must stay unique
            if let Some((other_stem, other_feature)) = keys.insert(key.clone(), pair) {
                return Err(Error::invalid(format!(
                    "feature key '{}' is ambiguous: stem '{}' feature '{}' and stem '{}' feature '{}'",
                    key,
                    other_stem,
                    other_feature,
                    stem.as_ref(),
                    decl.name
                )));
            }
            entries.push(FeatureIndexEntry {
                index: entries.len(),
                stem_id: stem.as_ref().to_string(),
                feature_name: decl.name,
                value_range: decl.range.unwrap_or_default(),
            });
        }
    }

    if entries.len() > capacity {
        return Err(Error::CapacityExceeded {
            requested: entries.len(),
            max: capacity,
        });
    }

    Ok(entries)
}

/// Immutable index table with key lookup. Rebuilt wholesale per dataset.
#[derive(Clone, Debug, Default)]
pub struct FeatureIndex {
    entries: Vec<FeatureIndexEntry>,
    by_key: HashMap<String, usize>,
    by_pair: HashMap<(String, String), usize>,
    capacity: usize,
}

impl FeatureIndex {
    pub fn new(entries: Vec<FeatureIndexEntry>, capacity: usize) -> Self {
        let by_key = entries.iter().map(|e| (e.key(), e.index)).collect();
        let by_pair = entries
            .iter()
            .map(|e| ((e.stem_id.clone(), e.feature_name.clone()), e.index))
            .collect();
        Self {
            entries,
            by_key,
            by_pair,
            capacity,
        }
    }

    /// Index for a loaded dataset, in series order, carrying each series' range.
    pub fn from_series(series: &[FeatureSeries], capacity: usize) -> Result<Self> {
        let layout = stem_layout(series);
        let stems: Vec<&str> = layout.iter().map(|(stem, _)| stem.as_str()).collect();
        let decls: Vec<Vec<FeatureDecl>> = layout
            .iter()
            .map(|(stem, names)| {
                names
                    .iter()
                    .map(|name| FeatureDecl {
                        name: name.clone(),
                        range: series
                            .iter()
                            .find(|s| s.stem_id == *stem && s.feature_name == *name)
                            .and_then(|s| s.range),
                    })
                    .collect()
            })
            .collect();
        let entries = build_index(&stems, &decls, capacity)?;
        Ok(Self::new(entries, capacity))
    }

    pub fn entries(&self) -> &[FeatureIndexEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Texel rows needed to hold `capacity` features.
    pub fn rows(&self) -> usize {
        rows_for(self.capacity)
    }

    pub fn get(&self, key: &str) -> Option<&FeatureIndexEntry> {
        self.by_key.get(key).map(|&i| &self.entries[i])
    }

    pub fn lookup(&self, stem_id: &str, feature_name: &str) -> Option<&FeatureIndexEntry> {
        self.by_pair
            .get(&(stem_id.to_string(), feature_name.to_string()))
            .map(|&i| &self.entries[i])
    }

    /// Frame-record keys in index order.
    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(FeatureIndexEntry::key).collect()
    }

    /// WGSL constant names, one per entry, in index order.
    pub fn constant_names(&self) -> Vec<String> {
        let mut used = HashSet::new();
        self.entries
            .iter()
            .map(|entry| {
                let base = format!(
                    "{}_{}",
                    sanitize_ident(&entry.stem_id),
                    sanitize_ident(&entry.feature_name)
                );
                let name = if used.contains(&base) {
                    format!("{}_{}", base, entry.index)
                } else {
                    base
                };
                used.insert(name.clone());
                name
            })
            .collect()
    }

    /// Compile-time index constants for effect shaders.
    pub fn wgsl_constants(&self) -> String {
        let mut out = String::from("// Feature indices\n");
        out.push_str(&format!("const FEATURE_COUNT: u32 = {}u;\n", self.entries.len()));
        for (entry, name) in self.entries.iter().zip(self.constant_names()) {
            out.push_str(&format!("const {}: u32 = {}u;\n", name, entry.index));
        }
        out.push('\n');
        out
    }
}

pub fn rows_for(capacity: usize) -> usize {
    capacity.div_ceil(CHANNELS_PER_TEXEL).max(1)
}

fn sanitize_ident(raw: &str) -> String {
    let mut ident: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    if ident.is_empty() || ident.starts_with(|c: char| c.is_ascii_digit()) {
        ident.insert_str(0, "F_");
    }
    ident
}
