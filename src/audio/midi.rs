use midly::{MetaMessage, MidiMessage, Smf, Timing, TrackEventKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::Result;

pub const DEFAULT_TEMPO_BPM: f32 = 120.0;
const DEFAULT_MICROS_PER_QUARTER: u32 = 500_000;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MidiNoteEvent {
    pub pitch: u8,
    /// Normalized velocity (0.0-1.0)
    pub velocity: f32,
    /// Seconds
    pub start_time: f64,
    /// Seconds
    pub duration: f64,
    #[serde(default)]
    pub track_id: String,
}

impl MidiNoteEvent {
    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration
    }

    /// Closed interval: a note starting or ending exactly at `time` is active.
    pub fn is_active_at(&self, time: f64) -> bool {
        self.start_time <= time && time <= self.end_time()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MidiTrack {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Tempo in BPM, when the source carried one
    #[serde(default)]
    pub tempo: Option<f32>,
    pub notes: Vec<MidiNoteEvent>,
}

impl MidiTrack {
    pub fn new(id: impl Into<String>, notes: Vec<MidiNoteEvent>) -> Self {
        let mut track = Self {
            id: id.into(),
            name: None,
            tempo: None,
            notes,
        };
        track.normalize();
        track
    }

    pub fn with_tempo(mut self, bpm: f32) -> Self {
        self.tempo = Some(bpm);
        self
    }

    /// Stamps every note with this track's id and orders notes by start time.
    pub fn normalize(&mut self) {
        for note in &mut self.notes {
            note.track_id.clone_from(&self.id);
        }
        self.notes
            .sort_by(|a, b| a.start_time.total_cmp(&b.start_time).then(a.pitch.cmp(&b.pitch)));
    }

    /// Notes sounding at `time`. Binary search on `normalize` ordering;
    /// tracks built field by field fall back to a linear scan.
    pub fn active_notes_at(&self, time: f64) -> impl Iterator<Item = &MidiNoteEvent> {
        let started = if self.is_sorted() {
            self.notes.partition_point(|n| n.start_time <= time)
        } else {
            self.notes.len()
        };
        self.notes[..started].iter().filter(move |n| n.is_active_at(time))
    }

    fn is_sorted(&self) -> bool {
        self.notes.windows(2).all(|w| w[0].start_time <= w[1].start_time)
    }

    pub fn is_active_at(&self, time: f64) -> bool {
        self.active_notes_at(time).next().is_some()
    }
}

/// First tempo found across tracks, or 120 BPM.
pub fn tempo_of(tracks: &[MidiTrack]) -> f32 {
    tracks
        .iter()
        .find_map(|t| t.tempo)
        .filter(|bpm| bpm.is_finite() && *bpm > 0.0)
        .unwrap_or(DEFAULT_TEMPO_BPM)
}

pub fn load_midi_json(path: &Path) -> Result<Vec<MidiTrack>> {
    let content = std::fs::read_to_string(path)?;
    let mut tracks: Vec<MidiTrack> = serde_json::from_str(&content)?;
    for track in &mut tracks {
        track.normalize();
    }
    log::info!("Loaded {} MIDI tracks from {}", tracks.len(), path.display());
    Ok(tracks)
}

pub fn load_midi_file(path: &Path) -> Result<Vec<MidiTrack>> {
    let bytes = std::fs::read(path)?;
    let tracks = parse_smf(&bytes)?;
    log::info!(
        "Imported {} MIDI tracks ({} notes) from {}",
        tracks.len(),
        tracks.iter().map(|t| t.notes.len()).sum::<usize>(),
        path.display()
    );
    Ok(tracks)
}

/// Converts a Standard MIDI File into tracks of absolute-time notes.
/// SMF tracks without notes (tempo tracks, meta-only tracks) are skipped.
pub fn parse_smf(bytes: &[u8]) -> Result<Vec<MidiTrack>> {
    let smf = Smf::parse(bytes)?;
    let tempo_map = TempoMap::from_smf(&smf);
    let initial_bpm = 60_000_000.0 / tempo_map.initial_micros_per_quarter() as f32;

    let mut tracks = Vec::new();
    for (track_idx, events) in smf.tracks.iter().enumerate() {
        let id = format!("track-{}", track_idx);
        let mut name = None;
        let mut pending: HashMap<(u8, u8), Vec<(u64, u8)>> = HashMap::new();
        let mut notes = Vec::new();
        let mut tick: u64 = 0;

        for event in events {
            tick += event.delta.as_int() as u64;
            match event.kind {
                TrackEventKind::Meta(MetaMessage::TrackName(raw)) => {
                    name = Some(String::from_utf8_lossy(raw).into_owned());
                }
                TrackEventKind::Midi { channel, message } => {
                    let (key, vel, on) = match message {
                        MidiMessage::NoteOn { key, vel } => (key.as_int(), vel.as_int(), vel.as_int() > 0),
                        MidiMessage::NoteOff { key, vel } => (key.as_int(), vel.as_int(), false),
                        _ => continue,
                    };
                    let slot = pending.entry((channel.as_int(), key)).or_default();
                    if on {
                        slot.push((tick, vel));
                    } else if !slot.is_empty() {
                        let (start_tick, start_vel) = slot.remove(0);
                        notes.push(make_note(&tempo_map, key, start_vel, start_tick, tick, &id));
                    }
                }
                _ => {}
            }
        }

        // Close hanging notes at the end of the track
        for ((_, key), starts) in pending {
            for (start_tick, vel) in starts {
                notes.push(make_note(&tempo_map, key, vel, start_tick, tick, &id));
            }
        }

        if notes.is_empty() {
            continue;
        }

        let mut track = MidiTrack::new(id, notes).with_tempo(initial_bpm);
        track.name = name;
        tracks.push(track);
    }

    Ok(tracks)
}

fn make_note(tempo_map: &TempoMap, key: u8, vel: u8, start_tick: u64, end_tick: u64, track_id: &str) -> MidiNoteEvent {
    let start_time = tempo_map.seconds_at(start_tick);
    let end_time = tempo_map.seconds_at(end_tick);
    MidiNoteEvent {
        pitch: key,
        velocity: vel as f32 / 127.0,
        start_time,
        duration: (end_time - start_time).max(0.0),
        track_id: track_id.to_string(),
    }
}

#[derive(Clone, Copy, Debug)]
struct TempoSegment {
    tick: u64,
    seconds: f64,
    seconds_per_tick: f64,
    micros_per_quarter: u32,
}

/// Piecewise-linear tick to seconds conversion.
struct TempoMap {
    segments: Vec<TempoSegment>,
}

impl TempoMap {
    fn from_smf(smf: &Smf) -> Self {
        let ticks_per_quarter = match smf.header.timing {
            Timing::Metrical(ppq) => ppq.as_int().max(1) as f64,
            Timing::Timecode(fps, subframe) => {
                // Absolute timing: tempo events do not apply
                let ticks_per_second = (fps.as_f32() as f64 * subframe.max(1) as f64).max(1.0);
                return Self {
                    segments: vec![TempoSegment {
                        tick: 0,
                        seconds: 0.0,
                        seconds_per_tick: 1.0 / ticks_per_second,
                        micros_per_quarter: DEFAULT_MICROS_PER_QUARTER,
                    }],
                };
            }
        };

        let mut changes: Vec<(u64, u32)> = Vec::new();
        for events in &smf.tracks {
            let mut tick = 0u64;
            for event in events {
                tick += event.delta.as_int() as u64;
                if let TrackEventKind::Meta(MetaMessage::Tempo(micros)) = event.kind {
                    changes.push((tick, micros.as_int().max(1)));
                }
            }
        }
        changes.sort_by_key(|(tick, _)| *tick);

        let spt = |micros: u32| micros as f64 / 1_000_000.0 / ticks_per_quarter;
        let mut map = Self {
            segments: vec![TempoSegment {
                tick: 0,
                seconds: 0.0,
                seconds_per_tick: spt(DEFAULT_MICROS_PER_QUARTER),
                micros_per_quarter: DEFAULT_MICROS_PER_QUARTER,
            }],
        };

        for (tick, micros) in changes {
            let seconds = map.seconds_at(tick);
            let segment = TempoSegment {
                tick,
                seconds,
                seconds_per_tick: spt(micros),
                micros_per_quarter: micros,
            };
            match map.segments.last_mut() {
                Some(last) if last.tick == tick => *last = segment,
                _ => map.segments.push(segment),
            }
        }

        map
    }

    fn seconds_at(&self, tick: u64) -> f64 {
        let idx = self.segments.partition_point(|s| s.tick <= tick).saturating_sub(1);
        let seg = &self.segments[idx];
        seg.seconds + (tick - seg.tick) as f64 * seg.seconds_per_tick
    }

    fn initial_micros_per_quarter(&self) -> u32 {
        self.segments[0].micros_per_quarter
    }
}
