use bytemuck::{Pod, Zeroable};
use std::collections::HashMap;
use std::time::Duration;

use super::loader::{compose_shader, LoadedEffect, ParamLayout};
use super::throttle::Throttle;
use crate::error::{Error, Result};
use crate::features::index::FeatureIndex;
use crate::features::sampler::SamplerKind;

pub const DEFAULT_PARAM_REFRESH_MS: u64 = 100;

/// Per-frame uniforms shared by every effect. Layout matches the WGSL
/// `EffectUniforms` struct.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct EffectUniforms {
    pub resolution: [f32; 2],
    pub time: f32,
    pub frame: u32,
    pub params: [[f32; 4]; 4],
}

/// A compiled-for-one-dataset effect. Audio variation lives entirely in the
/// shader; per frame this only accumulates time and, at a throttled rate,
/// applies pending parameter edits.
pub struct EffectInstance {
    effect: LoadedEffect,
    layout: ParamLayout,
    overrides: HashMap<String, String>,
    params: [[f32; 4]; 4],
    pending: Option<[[f32; 4]; 4]>,
    throttle: Throttle,
    resolution: [f32; 2],
    elapsed: Duration,
    frame: u32,
}

impl EffectInstance {
    pub fn new(effect: LoadedEffect, overrides: HashMap<String, String>, width: u32, height: u32) -> Result<Self> {
        let layout = ParamLayout::new(&effect.manifest)?;
        for key in overrides.keys() {
            if !layout.contains(key) {
                log::warn!("Effect {} has no parameter '{}'", effect.manifest.name, key);
            }
        }
        let params = layout.pack(&effect.manifest, &overrides);
        let refresh = effect.manifest.param_refresh_ms.unwrap_or(DEFAULT_PARAM_REFRESH_MS);
        Ok(Self {
            effect,
            layout,
            overrides,
            params,
            pending: None,
            throttle: Throttle::from_millis(refresh),
            resolution: [width as f32, height as f32],
            elapsed: Duration::ZERO,
            frame: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.effect.manifest.name
    }

    pub fn display_name(&self) -> &str {
        &self.effect.manifest.display_name
    }

    /// WGSL for this effect against `index`, for the given sampler variant.
    pub fn shader_source(&self, kind: SamplerKind, index: &FeatureIndex) -> String {
        compose_shader(kind, index, &self.effect, &self.layout, &self.overrides)
    }

    /// Queues a parameter edit. It reaches the shader on the next throttled
    /// refresh, not immediately. Feature parameters apply the next time the
    /// shader is composed.
    pub fn set_param(&mut self, name: &str, value: &str) -> Result<()> {
        if !self.layout.contains(name) {
            return Err(Error::invalid(format!(
                "effect {} has no parameter '{}'",
                self.effect.manifest.name, name
            )));
        }
        self.overrides.insert(name.to_string(), value.to_string());
        if self.layout.is_feature(name) {
            return Ok(());
        }
        self.pending = Some(self.layout.pack(&self.effect.manifest, &self.overrides));
        Ok(())
    }

    /// Live path: advance by the wall-clock delta since the last tick.
    pub fn tick(&mut self, delta: Duration) -> EffectUniforms {
        self.elapsed += delta;
        self.refresh();
        let uniforms = self.uniforms();
        self.frame = self.frame.wrapping_add(1);
        uniforms
    }

    /// Export path: uniforms for an exact frame time, independent of how
    /// long rendering takes.
    pub fn at_frame(&mut self, frame: u32, timestamp: f64) -> EffectUniforms {
        self.elapsed = Duration::from_secs_f64(timestamp.max(0.0));
        self.frame = frame;
        self.refresh();
        self.uniforms()
    }

    fn refresh(&mut self) {
        if self.pending.is_some() && self.throttle.ready(self.elapsed) {
            if let Some(params) = self.pending.take() {
                self.params = params;
            }
        }
    }

    fn uniforms(&self) -> EffectUniforms {
        EffectUniforms {
            resolution: self.resolution,
            time: self.elapsed.as_secs_f32(),
            frame: self.frame,
            params: self.params,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::loader::load_effect;

    fn instance() -> EffectInstance {
        EffectInstance::new(load_effect("feature_bars").unwrap(), HashMap::new(), 640, 360).unwrap()
    }

    #[test]
    fn uniform_layout_matches_wgsl() {
        assert_eq!(std::mem::size_of::<EffectUniforms>(), 80);
        assert_eq!(std::mem::align_of::<EffectUniforms>(), 4);
    }

    #[test]
    fn tick_accumulates_time_and_frames() {
        let mut fx = instance();
        let first = fx.tick(Duration::from_millis(16));
        let second = fx.tick(Duration::from_millis(16));
        assert_eq!(first.frame, 0);
        assert_eq!(second.frame, 1);
        assert!((second.time - 0.032).abs() < 1e-6);
        assert_eq!(second.resolution, [640.0, 360.0]);
    }

    #[test]
    fn parameter_edits_wait_for_the_throttle() {
        let mut fx = instance();
        let gap = fx.layout.get("gap").unwrap().slot;
        fx.tick(Duration::from_millis(10));

        fx.set_param("gap", "0.5").unwrap();
        // first refresh fires immediately
        assert_eq!(fx.tick(Duration::from_millis(10)).params[gap / 4][gap % 4], 0.5);

        fx.set_param("gap", "0.7").unwrap();
        let soon = fx.tick(Duration::from_millis(16));
        assert_eq!(soon.params[gap / 4][gap % 4], 0.5);
        let later = fx.tick(Duration::from_millis(100));
        assert_eq!(later.params[gap / 4][gap % 4], 0.7);

        assert!(fx.set_param("nope", "1").is_err());
    }

    #[test]
    fn export_uniforms_depend_only_on_frame() {
        let mut fx = instance();
        let a = fx.at_frame(45, 1.5);
        fx.tick(Duration::from_millis(3));
        let b = fx.at_frame(45, 1.5);
        assert_eq!(a, b);
        assert_eq!(a.time, 1.5);
        assert_eq!(fx.display_name(), "Feature Bars");
    }

    #[test]
    fn feature_parameter_edits_recompose_the_shader() {
        use crate::audio::series::FeatureSeries;
        use crate::features::index::MAX_FEATURES;

        let series = vec![
            FeatureSeries::new("drums", "rms", vec![0.0]),
            FeatureSeries::new("vocals", "rms", vec![0.0]),
        ];
        let index = FeatureIndex::from_series(&series, MAX_FEATURES).unwrap();
        let overrides = HashMap::from([("feature".to_string(), "vocals-rms".to_string())]);
        let mut fx = EffectInstance::new(load_effect("note_pulse").unwrap(), overrides, 64, 64).unwrap();
        let before = fx.tick(Duration::from_millis(10)).params;
        assert!(fx.shader_source(SamplerKind::Cpu, &index).contains("const PARAM_FEATURE: u32 = 1u;"));

        fx.set_param("feature", "drums-rms").unwrap();
        assert!(fx.shader_source(SamplerKind::Cpu, &index).contains("const PARAM_FEATURE: u32 = 0u;"));
        // uniforms untouched
        assert_eq!(fx.tick(Duration::from_millis(500)).params, before);
    }
}
