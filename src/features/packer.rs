use bytemuck::{Pod, Zeroable};

use super::index::{rows_for, FeatureIndex, CHANNELS_PER_TEXEL, MAX_FEATURES};
use crate::audio::series::FeatureSeries;

/// Time-axis resolution of the packed buffer.
pub const DEFAULT_TIME_SAMPLES: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PackerConfig {
    pub time_samples: usize,
    pub max_features: usize,
}

impl Default for PackerConfig {
    fn default() -> Self {
        Self {
            time_samples: DEFAULT_TIME_SAMPLES,
            max_features: MAX_FEATURES,
        }
    }
}

/// 2-D grid of RGBA f32 texels: x = time column, y = feature row.
/// `data[(row * width + col) * 4 + channel]` holds the normalized value of
/// feature `row * 4 + channel` at time column `col`.
#[derive(Clone, Debug, PartialEq)]
pub struct PackedFeatureBuffer {
    width: usize,
    height: usize,
    data: Vec<f32>,
}

impl PackedFeatureBuffer {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![0.0; width * height * CHANNELS_PER_TEXEL],
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn texel(&self, row: usize, col: usize) -> [f32; 4] {
        let start = (row * self.width + col) * CHANNELS_PER_TEXEL;
        [
            self.data[start],
            self.data[start + 1],
            self.data[start + 2],
            self.data[start + 3],
        ]
    }

    pub fn value(&self, row: usize, col: usize, channel: usize) -> f32 {
        self.data[(row * self.width + col) * CHANNELS_PER_TEXEL + channel]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.data)
    }

    pub fn bytes_per_row(&self) -> usize {
        self.width * CHANNELS_PER_TEXEL * std::mem::size_of::<f32>()
    }

    fn set(&mut self, row: usize, col: usize, channel: usize, value: f32) {
        self.data[(row * self.width + col) * CHANNELS_PER_TEXEL + channel] = value;
    }
}

/// Sample index feeding time column `col`.
/// Shorter series: nearest sample in time. Longer series: truncated.
pub fn column_source(col: usize, len: usize, width: usize) -> usize {
    if len >= width {
        col
    } else {
        let pos = col as f64 * len as f64 / width as f64;
        (pos.round() as usize).min(len - 1)
    }
}

/// Full repack of every indexed series into a fresh buffer.
pub fn pack_all(series: &[FeatureSeries], index: &FeatureIndex, time_samples: usize) -> PackedFeatureBuffer {
    let mut buffer = PackedFeatureBuffer::new(time_samples, index.rows());

    for s in series {
        let Some(entry) = index.lookup(&s.stem_id, &s.feature_name) else {
            log::warn!("Series {} has no index entry, not packed", s.key());
            continue;
        };
        if s.samples.is_empty() {
            continue;
        }
        let (row, channel) = (entry.row(), entry.channel());
        for col in 0..time_samples {
            let raw = s.samples[column_source(col, s.samples.len(), time_samples)];
            buffer.set(row, col, channel, entry.value_range.normalize(raw));
        }
    }

    buffer
}

/// Playback position shared with the shader. Layout matches the WGSL
/// `TimeSync` struct.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct TimeSync {
    pub current_time: f32,
    pub duration: f32,
    pub normalized_time: f32,
    pub _padding: f32,
}

impl TimeSync {
    pub fn new(current_time: f32, duration: f32) -> Self {
        let normalized_time = if duration > 0.0 && duration.is_finite() {
            (current_time / duration).clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            current_time,
            duration,
            normalized_time: if normalized_time.is_finite() { normalized_time } else { 0.0 },
            _padding: 0.0,
        }
    }
}

/// Owns the live-preview buffer and time sync.
#[derive(Debug)]
pub struct FeaturePacker {
    config: PackerConfig,
    buffer: PackedFeatureBuffer,
    time: TimeSync,
}

impl FeaturePacker {
    pub fn new(config: PackerConfig) -> Self {
        Self {
            config,
            buffer: PackedFeatureBuffer::new(config.time_samples, rows_for(config.max_features)),
            time: TimeSync::default(),
        }
    }

    pub fn config(&self) -> PackerConfig {
        self.config
    }

    pub fn repack(&mut self, series: &[FeatureSeries], index: &FeatureIndex) -> &PackedFeatureBuffer {
        self.buffer = pack_all(series, index, self.config.time_samples);
        log::info!(
            "Packed {} features into {}x{} texels",
            index.len(),
            self.buffer.width(),
            self.buffer.height()
        );
        &self.buffer
    }

    /// Once per render tick, before the frame that reads it is submitted.
    pub fn update_time(&mut self, current_time: f32, duration: f32) -> TimeSync {
        self.time = TimeSync::new(current_time, duration);
        self.time
    }

    pub fn time(&self) -> TimeSync {
        self.time
    }

    pub fn buffer(&self) -> &PackedFeatureBuffer {
        &self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::index::MAX_FEATURES;

    fn index_for(series: &[FeatureSeries]) -> FeatureIndex {
        FeatureIndex::from_series(series, MAX_FEATURES).unwrap()
    }

    #[test]
    fn buffer_dimensions_follow_capacity() {
        let series = vec![FeatureSeries::new("drums", "rms", vec![0.5; 4])];
        let buffer = pack_all(&series, &index_for(&series), 256);
        assert_eq!(buffer.width(), 256);
        assert_eq!(buffer.height(), 64);
        assert_eq!(buffer.as_slice().len(), 256 * 64 * 4);
        assert_eq!(buffer.bytes_per_row(), 4096);
        assert_eq!(buffer.as_bytes().len(), 256 * 64 * 16);
    }

    #[test]
    fn features_land_in_row_and_channel() {
        let series: Vec<FeatureSeries> = (0..6)
            .map(|i| FeatureSeries::new("s", format!("f{}", i), vec![i as f32 / 10.0; 8]))
            .collect();
        let buffer = pack_all(&series, &index_for(&series), 8);
        // feature 5 -> row 1, channel 1
        assert_eq!(buffer.value(1, 3, 1), 0.5);
        assert_eq!(buffer.texel(0, 0), [0.0, 0.1, 0.2, 0.3]);
        // unused channels stay zero
        assert_eq!(buffer.value(1, 0, 2), 0.0);
    }

    #[test]
    fn values_are_normalized_by_range() {
        let series = vec![
            FeatureSeries::new("vocals", "centroid", vec![4000.0, 16000.0]).with_range(0.0, 8000.0),
            FeatureSeries::new("vocals", "rms", vec![-1.0, 2.0]),
        ];
        let buffer = pack_all(&series, &index_for(&series), 2);
        assert_eq!(buffer.value(0, 0, 0), 0.5);
        assert_eq!(buffer.value(0, 1, 0), 1.0);
        assert_eq!(buffer.value(0, 0, 1), 0.0);
        assert_eq!(buffer.value(0, 1, 1), 1.0);
    }

    #[test]
    fn longer_series_are_truncated() {
        let samples: Vec<f32> = (0..10).map(|i| i as f32 / 10.0).collect();
        let series = vec![FeatureSeries::new("s", "f", samples)];
        let buffer = pack_all(&series, &index_for(&series), 4);
        let row: Vec<f32> = (0..4).map(|c| buffer.value(0, c, 0)).collect();
        assert_eq!(row, vec![0.0, 0.1, 0.2, 0.3]);
    }

    #[test]
    fn shorter_series_use_nearest_sample() {
        let series = vec![FeatureSeries::new("s", "f", vec![0.0, 1.0])];
        let buffer = pack_all(&series, &index_for(&series), 8);
        let row: Vec<f32> = (0..8).map(|c| buffer.value(0, c, 0)).collect();
        // column c sits at time c/8; sample 1 starts at time 1/2
        assert_eq!(row, vec![0.0, 0.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0]);
        assert_eq!(column_source(1, 2, 8), 0);
        assert_eq!(column_source(4, 2, 8), 1);
    }

    #[test]
    fn empty_series_stays_zero() {
        let series = vec![FeatureSeries::new("s", "f", vec![])];
        let buffer = pack_all(&series, &index_for(&series), 4);
        assert!(buffer.as_slice().iter().all(|v| *v == 0.0));
    }

    #[test]
    fn zero_duration_yields_zero_normalized_time() {
        let sync = TimeSync::new(3.0, 0.0);
        assert_eq!(sync.normalized_time, 0.0);
        assert_eq!(TimeSync::new(5.0, 10.0).normalized_time, 0.5);
        assert_eq!(TimeSync::new(20.0, 10.0).normalized_time, 1.0);
        assert_eq!(std::mem::size_of::<TimeSync>(), 16);
    }

    #[test]
    fn packer_repack_replaces_buffer() {
        let series = vec![FeatureSeries::new("drums", "rms", vec![1.0])];
        let index = index_for(&series);
        let mut packer = FeaturePacker::new(PackerConfig::default());
        assert_eq!(packer.buffer().value(0, 255, 0), 0.0);
        packer.repack(&series, &index);
        assert_eq!(packer.buffer().value(0, 255, 0), 1.0);
        let sync = packer.update_time(1.0, 4.0);
        assert_eq!(sync.normalized_time, 0.25);
        assert_eq!(packer.time(), sync);
    }
}
