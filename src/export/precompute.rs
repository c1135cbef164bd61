use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::config::ExportConfiguration;
use super::mapping::{NoMapping, VisualMapping};
use crate::audio::midi::{tempo_of, MidiNoteEvent, MidiTrack};
use crate::audio::series::FeatureSeries;
use crate::error::{Error, Result};
use crate::features::index::FeatureIndex;
use crate::features::sampler::interpolate;

/// Frames computed between progress reports and cancellation checks.
pub const PROGRESS_STRIDE: usize = 10;

/// A loaded analysis + MIDI dataset and the mapping applied to it. Never
/// mutated after construction; a new load or mapping produces a new
/// `Dataset` with a higher generation.
#[derive(Clone)]
pub struct Dataset {
    pub series: Vec<FeatureSeries>,
    pub midi: Vec<MidiTrack>,
    pub index: FeatureIndex,
    pub mapping: Arc<dyn VisualMapping>,
    pub generation: u64,
}

impl Default for Dataset {
    fn default() -> Self {
        Self {
            series: Vec::new(),
            midi: Vec::new(),
            index: FeatureIndex::default(),
            mapping: Arc::new(NoMapping),
            generation: 0,
        }
    }
}

impl std::fmt::Debug for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dataset")
            .field("series", &self.series.len())
            .field("midi", &self.midi.len())
            .field("features", &self.index.len())
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MidiState {
    pub active_notes: Vec<MidiNoteEvent>,
    pub tempo: f32,
    pub track_activity: BTreeMap<String, bool>,
    pub total_notes: usize,
    pub current_time: f64,
}

impl MidiState {
    pub fn at(tracks: &[MidiTrack], time: f64) -> Self {
        let mut active_notes = Vec::new();
        let mut track_activity = BTreeMap::new();
        for track in tracks {
            let before = active_notes.len();
            active_notes.extend(track.active_notes_at(time).cloned());
            track_activity.insert(track.id.clone(), active_notes.len() > before);
        }
        Self {
            active_notes,
            tempo: tempo_of(tracks),
            track_activity,
            total_notes: tracks.iter().map(|t| t.notes.len()).sum(),
            current_time: time,
        }
    }
}

/// Everything the offline renderer needs for one output frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrameRecord {
    pub frame_number: usize,
    pub timestamp: f64,
    /// Raw interpolated values keyed `stem-feature`.
    pub features: BTreeMap<String, f32>,
    pub midi_state: MidiState,
    pub visual_parameters: BTreeMap<String, Value>,
}

impl FrameRecord {
    /// Feature value by key; unknown features read as 0.
    pub fn feature(&self, key: &str) -> f32 {
        self.features.get(key).copied().unwrap_or(0.0)
    }
}

pub struct Precomputer<'a> {
    series: &'a [FeatureSeries],
    midi: &'a [MidiTrack],
    mapping: &'a dyn VisualMapping,
    /// Frame-record key per series; `None` for a repeated key.
    keys: Vec<Option<String>>,
    stride: usize,
}

impl<'a> Precomputer<'a> {
    pub fn new(series: &'a [FeatureSeries], midi: &'a [MidiTrack], mapping: &'a dyn VisualMapping) -> Self {
        let mut seen = HashSet::new();
        let keys = series
            .iter()
            .map(|s| {
                let key = s.key();
                seen.insert(key.clone()).then_some(key)
            })
            .collect();
        Self {
            series,
            midi,
            mapping,
            keys,
            stride: PROGRESS_STRIDE,
        }
    }

    pub fn with_stride(mut self, stride: usize) -> Self {
        self.stride = stride.max(1);
        self
    }

    /// Computes every frame of `config`. All-or-nothing: on cancellation or
    /// error no partial result is returned.
    pub fn run(
        &self,
        config: &ExportConfiguration,
        progress: &mut dyn FnMut(f32),
        cancel: &AtomicBool,
    ) -> Result<Vec<FrameRecord>> {
        config.validate()?;
        let total = config.total_frames();
        if total > 0 && self.series.is_empty() {
            return Err(Error::MissingData("no feature series loaded"));
        }
        if total > 0 && self.midi.is_empty() {
            return Err(Error::MissingData("no MIDI tracks loaded"));
        }
        // Rejects pairs whose joined keys collide
        FeatureIndex::from_series(self.series, self.series.len())?;

        log::info!(
            "Precomputing {} frames ({:.2}s @ {}fps, {} series, {} MIDI tracks)",
            total,
            config.duration_seconds,
            config.fps,
            self.series.len(),
            self.midi.len()
        );

        let mut frames = Vec::with_capacity(total);
        for start in (0..total).step_by(self.stride) {
            if cancel.load(Ordering::Acquire) {
                return Err(Error::Cancelled);
            }
            let end = (start + self.stride).min(total);
            let chunk: Result<Vec<FrameRecord>> = (start..end)
                .into_par_iter()
                .map(|n| {
                    if cancel.load(Ordering::Relaxed) {
                        return Err(Error::Cancelled);
                    }
                    Ok(self.frame(config, n))
                })
                .collect();
            frames.extend(chunk?);
            log::debug!("Precomputed frames {}..{}", start, end);
            progress(end as f32 / total as f32);
        }

        if total == 0 {
            progress(1.0);
        }
        Ok(frames)
    }

    /// One frame, computed from scratch. Pure in its inputs.
    pub fn frame(&self, config: &ExportConfiguration, frame_number: usize) -> FrameRecord {
        let timestamp = config.frame_time(frame_number);
        let features = self.features_at(timestamp, config.duration_seconds);
        let midi_state = MidiState::at(self.midi, timestamp);
        let visual_parameters = self.mapping.map(&features, &midi_state);
        FrameRecord {
            frame_number,
            timestamp,
            features,
            midi_state,
            visual_parameters,
        }
    }

    fn features_at(&self, timestamp: f64, duration: f64) -> BTreeMap<String, f32> {
        self.series
            .iter()
            .zip(&self.keys)
            .filter_map(|(s, key)| Some((key.clone()?, interpolate(&s.samples, timestamp, duration))))
            .collect()
    }
}

pub fn precompute(
    config: &ExportConfiguration,
    series: &[FeatureSeries],
    midi: &[MidiTrack],
    mapping: &dyn VisualMapping,
    progress: &mut dyn FnMut(f32),
    cancel: &AtomicBool,
) -> Result<Vec<FrameRecord>> {
    Precomputer::new(series, midi, mapping).run(config, progress, cancel)
}

struct CachedFrames {
    generation: u64,
    config: ExportConfiguration,
    frames: Arc<Vec<FrameRecord>>,
}

/// Holds the most recent precomputation, keyed by dataset generation and
/// export configuration.
#[derive(Default)]
pub struct FrameCache {
    entry: Mutex<Option<CachedFrames>>,
}

impl FrameCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, generation: u64, config: &ExportConfiguration) -> Option<Arc<Vec<FrameRecord>>> {
        let entry = self.entry.lock().ok()?;
        entry
            .as_ref()
            .filter(|c| c.generation == generation && c.config == *config)
            .map(|c| Arc::clone(&c.frames))
    }

    pub fn insert(
        &self,
        generation: u64,
        config: &ExportConfiguration,
        frames: Vec<FrameRecord>,
    ) -> Arc<Vec<FrameRecord>> {
        let frames = Arc::new(frames);
        if let Ok(mut entry) = self.entry.lock() {
            *entry = Some(CachedFrames {
                generation,
                config: config.clone(),
                frames: Arc::clone(&frames),
            });
        }
        frames
    }

    /// Looks up a precomputed frame by number.
    pub fn frame(&self, frame_number: usize) -> Option<FrameRecord> {
        let entry = self.entry.lock().ok()?;
        entry.as_ref()?.frames.get(frame_number).cloned()
    }

    pub fn clear(&self) {
        if let Ok(mut entry) = self.entry.lock() {
            *entry = None;
        }
    }
}
