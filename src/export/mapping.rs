use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use super::precompute::MidiState;

/// Turns one frame's interpolated features and MIDI state into the effect
/// layer's visual parameters. Must be a pure function of its inputs: frames
/// are mapped in parallel and repeated exports must agree.
pub trait VisualMapping: Send + Sync {
    fn map(&self, features: &BTreeMap<String, f32>, midi: &MidiState) -> BTreeMap<String, Value>;
}

/// Emits no parameters.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoMapping;

impl VisualMapping for NoMapping {
    fn map(&self, _features: &BTreeMap<String, f32>, _midi: &MidiState) -> BTreeMap<String, Value> {
        BTreeMap::new()
    }
}

/// Routes a source value to a parameter as `base + gain * source`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MappingRule {
    /// A feature key (`drums-rms`), `midi.active_notes` or `midi.tempo`.
    pub source: String,
    /// Parameter name; dots nest (`particles.size`).
    pub target: String,
    #[serde(default)]
    pub base: f32,
    #[serde(default = "default_gain")]
    pub gain: f32,
}

fn default_gain() -> f32 {
    1.0
}

impl MappingRule {
    pub fn new(source: impl Into<String>, target: impl Into<String>, base: f32, gain: f32) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            base,
            gain,
        }
    }

    fn source_value(&self, features: &BTreeMap<String, f32>, midi: &MidiState) -> f32 {
        match self.source.as_str() {
            "midi.active_notes" => midi.active_notes.len() as f32,
            "midi.total_notes" => midi.total_notes as f32,
            "midi.tempo" => midi.tempo,
            key => features.get(key).copied().unwrap_or(0.0),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleMapping {
    pub rules: Vec<MappingRule>,
}

impl RuleMapping {
    pub fn new(rules: Vec<MappingRule>) -> Self {
        Self { rules }
    }
}

impl VisualMapping for RuleMapping {
    fn map(&self, features: &BTreeMap<String, f32>, midi: &MidiState) -> BTreeMap<String, Value> {
        let mut out = BTreeMap::new();
        for rule in &self.rules {
            let value = rule.base + rule.gain * rule.source_value(features, midi);
            let value = if value.is_finite() { value } else { 0.0 };
            insert_path(&mut out, &rule.target, Value::from(value));
        }
        out
    }
}

fn insert_path(out: &mut BTreeMap<String, Value>, target: &str, value: Value) {
    let parts: Vec<&str> = target.split('.').collect();
    let (head, rest) = match parts.split_first() {
        Some((head, rest)) => (*head, rest),
        None => return,
    };
    if rest.is_empty() {
        out.insert(head.to_string(), value);
        return;
    }
    let slot = out.entry(head.to_string()).or_insert(Value::Null);
    insert_nested(slot, rest, value);
}

fn insert_nested(node: &mut Value, path: &[&str], value: Value) {
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    let Value::Object(map) = node else { return };
    match path {
        [] => {}
        [last] => {
            map.insert(last.to_string(), value);
        }
        [first, rest @ ..] => {
            let child = map.entry(first.to_string()).or_insert(Value::Null);
            insert_nested(child, rest, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::midi::MidiNoteEvent;

    fn midi_with_notes(n: usize) -> MidiState {
        MidiState {
            active_notes: (0..n)
                .map(|i| MidiNoteEvent {
                    pitch: 60 + i as u8,
                    velocity: 0.8,
                    start_time: 0.0,
                    duration: 1.0,
                    track_id: "lead".into(),
                })
                .collect(),
            tempo: 128.0,
            track_activity: BTreeMap::new(),
            total_notes: n,
            current_time: 0.0,
        }
    }

    #[test]
    fn rules_scale_features_and_midi() {
        let mapping = RuleMapping::new(vec![
            MappingRule::new("drums-rms", "metaballs.base_radius", 0.3, 0.2),
            MappingRule::new("midi.active_notes", "particles.count", 0.0, 50.0),
            MappingRule::new("midi.tempo", "speed", 0.0, 0.01),
        ]);
        let features = BTreeMap::from([("drums-rms".to_string(), 0.5)]);
        let params = mapping.map(&features, &midi_with_notes(3));

        assert_eq!(params["metaballs"]["base_radius"].as_f64().unwrap() as f32, 0.4);
        assert_eq!(params["particles"]["count"].as_f64().unwrap(), 150.0);
        assert_eq!(params["speed"].as_f64().unwrap() as f32, 1.28);
    }

    #[test]
    fn unknown_feature_reads_as_zero() {
        let mapping = RuleMapping::new(vec![MappingRule::new("master-centroid", "noise", 0.2, 0.3)]);
        let params = mapping.map(&BTreeMap::new(), &midi_with_notes(0));
        assert_eq!(params["noise"].as_f64().unwrap() as f32, 0.2);
    }

    #[test]
    fn sibling_targets_share_an_object() {
        let mapping = RuleMapping::new(vec![
            MappingRule::new("a-x", "fx.glow.amount", 1.0, 0.0),
            MappingRule::new("a-x", "fx.glow.hue", 2.0, 0.0),
        ]);
        let params = mapping.map(&BTreeMap::new(), &midi_with_notes(0));
        let glow = params["fx"]["glow"].as_object().unwrap();
        assert_eq!(glow.len(), 2);
    }

    #[test]
    fn no_mapping_is_empty() {
        assert!(NoMapping.map(&BTreeMap::new(), &midi_with_notes(1)).is_empty());
    }
}
