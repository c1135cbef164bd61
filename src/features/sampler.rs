use serde::{Deserialize, Serialize};

use super::index::FeatureIndexEntry;
use super::packer::{PackedFeatureBuffer, TimeSync};
use crate::audio::series::FeatureSeries;

/// Which sampling strategy an effect shader is compiled against. Both read
/// features through the same `sample_feature(index)` function and the same
/// index table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplerKind {
    /// Live preview: packed texture, interpolated on the GPU.
    Gpu,
    /// Export: exact values precomputed per frame on the CPU.
    Cpu,
}

impl SamplerKind {
    pub fn wgsl(self) -> &'static str {
        match self {
            SamplerKind::Gpu => include_str!("../../shaders/sample_texture.wgsl"),
            SamplerKind::Cpu => include_str!("../../shaders/sample_frame.wgsl"),
        }
    }
}

/// CPU-side view of both sampling strategies. Returns normalized (0-1)
/// values so either variant can stand in for the shader.
#[derive(Clone, Copy, Debug)]
pub enum FeatureSampler<'a> {
    /// Mirrors the shader's texture lookup against the packed buffer.
    Gpu {
        buffer: &'a PackedFeatureBuffer,
        duration: f32,
    },
    /// Exact scalar interpolation of the raw series.
    Cpu {
        series: &'a [FeatureSeries],
        duration: f64,
    },
}

impl FeatureSampler<'_> {
    pub fn kind(&self) -> SamplerKind {
        match self {
            FeatureSampler::Gpu { .. } => SamplerKind::Gpu,
            FeatureSampler::Cpu { .. } => SamplerKind::Cpu,
        }
    }

    pub fn sample(&self, entry: &FeatureIndexEntry, timestamp: f64) -> f32 {
        match *self {
            FeatureSampler::Gpu { buffer, duration } => {
                let sync = TimeSync::new(timestamp as f32, duration);
                sample_texture(buffer, entry, sync.normalized_time)
            }
            FeatureSampler::Cpu { series, duration } => series
                .iter()
                .find(|s| s.stem_id == entry.stem_id && s.feature_name == entry.feature_name)
                .map(|s| entry.value_range.normalize(interpolate(&s.samples, timestamp, duration)))
                .unwrap_or(0.0),
        }
    }
}

/// Same arithmetic as `sample_texture.wgsl`.
fn sample_texture(buffer: &PackedFeatureBuffer, entry: &FeatureIndexEntry, normalized_time: f32) -> f32 {
    let width = buffer.width();
    let row = entry.row();
    if width == 0 || row >= buffer.height() {
        return 0.0;
    }
    let x = normalized_time.clamp(0.0, 1.0) * width as f32;
    let col = x.floor().min((width - 1) as f32);
    let c0 = col as usize;
    let c1 = (c0 + 1).min(width - 1);
    let t = (x - col).clamp(0.0, 1.0);
    let a = buffer.value(row, c0, entry.channel());
    let b = buffer.value(row, c1, entry.channel());
    a + (b - a) * t
}

/// Exact linear interpolation of a series at `timestamp`. Sample `i` sits at
/// time `i * duration / len`; past the last sample the last value holds.
/// Non-finite samples read as 0. The result never leaves the range of the
/// two neighbouring samples.
pub fn interpolate(samples: &[f32], timestamp: f64, duration: f64) -> f32 {
    let finite = |v: f32| if v.is_finite() { v } else { 0.0 };
    let len = samples.len();
    if len == 0 {
        return 0.0;
    }
    if !(duration > 0.0) || !timestamp.is_finite() {
        return finite(samples[0]);
    }

    let raw = (timestamp / duration * len as f64).clamp(0.0, (len - 1) as f64);
    let lower = raw.floor() as usize;
    let upper = (lower + 1).min(len - 1);
    let fraction = raw - lower as f64;

    let a = finite(samples[lower]);
    let b = finite(samples[upper]);
    let value = (a as f64 + (b as f64 - a as f64) * fraction) as f32;
    value.clamp(a.min(b), a.max(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::index::{FeatureIndex, MAX_FEATURES};
    use crate::features::packer::pack_all;

    #[test]
    fn sample_boundaries_are_exact() {
        let samples = [0.0, 1.0];
        assert_eq!(interpolate(&samples, 0.0, 2.0), 0.0);
        assert_eq!(interpolate(&samples, 1.0, 2.0), 1.0);
        assert_eq!(interpolate(&samples, 0.5, 2.0), 0.5);
        // held past the last sample
        assert_eq!(interpolate(&samples, 1.9, 2.0), 1.0);
    }

    #[test]
    fn interpolation_stays_between_neighbours() {
        let samples = [0.1f32, 0.7, 0.3, 0.3, -2.0, 5.0];
        let duration = 3.0;
        for step in 0..600 {
            let t = step as f64 * 0.005;
            let raw = (t / duration * samples.len() as f64).min((samples.len() - 1) as f64);
            let lo = samples[raw.floor() as usize];
            let hi = samples[(raw.floor() as usize + 1).min(samples.len() - 1)];
            let v = interpolate(&samples, t, duration);
            assert!(v >= lo.min(hi) && v <= lo.max(hi), "t={} v={} not in [{}, {}]", t, v, lo, hi);
        }
    }

    #[test]
    fn degenerate_inputs_do_not_produce_nan() {
        assert_eq!(interpolate(&[], 1.0, 2.0), 0.0);
        assert_eq!(interpolate(&[f32::NAN, 1.0], 0.0, 2.0), 0.0);
        assert_eq!(interpolate(&[0.25], 10.0, 0.0), 0.25);
        assert!(!interpolate(&[1.0, f32::INFINITY], 0.75, 1.0).is_nan());
    }

    #[test]
    fn gpu_and_cpu_agree_on_column_times() {
        let samples: Vec<f32> = (0..16).map(|i| (i as f32 * 0.37).sin().abs()).collect();
        let series = vec![FeatureSeries::new("drums", "rms", samples)];
        let index = FeatureIndex::from_series(&series, MAX_FEATURES).unwrap();
        let buffer = pack_all(&series, &index, 16);
        let entry = &index.entries()[0];
        let gpu = FeatureSampler::Gpu { buffer: &buffer, duration: 4.0 };
        let cpu = FeatureSampler::Cpu { series: &series, duration: 4.0 };
        assert_eq!(gpu.kind(), SamplerKind::Gpu);
        assert_eq!(cpu.kind(), SamplerKind::Cpu);
        for col in 0..16 {
            let t = col as f64 * 4.0 / 16.0;
            let g = gpu.sample(entry, t);
            let c = cpu.sample(entry, t);
            assert!((g - c).abs() < 1e-5, "col {}: gpu {} cpu {}", col, g, c);
        }
    }

    #[test]
    fn cpu_sampler_normalizes_and_defaults_missing_series() {
        let series = vec![FeatureSeries::new("vocals", "centroid", vec![4000.0]).with_range(0.0, 8000.0)];
        let index = FeatureIndex::from_series(&series, MAX_FEATURES).unwrap();
        let cpu = FeatureSampler::Cpu { series: &series, duration: 1.0 };
        assert_eq!(cpu.sample(&index.entries()[0], 0.5), 0.5);
        let empty = FeatureSampler::Cpu { series: &[], duration: 1.0 };
        assert_eq!(empty.sample(&index.entries()[0], 0.5), 0.0);
    }

    #[test]
    fn both_shader_variants_define_sample_feature() {
        for kind in [SamplerKind::Gpu, SamplerKind::Cpu] {
            assert!(kind.wgsl().contains("fn sample_feature(index: u32) -> f32"));
            assert!(kind.wgsl().contains("@binding(2)"));
        }
    }
}
