use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;

use super::embedded::{embedded_effects, embedded_shared_shader};
use super::manifest::EffectManifest;
use crate::error::Error;
use crate::features::index::FeatureIndex;
use crate::features::sampler::SamplerKind;

/// `array<vec4<f32>, 4>` in `EffectUniforms`.
pub const MAX_PARAM_SLOTS: usize = 16;

pub struct LoadedEffect {
    pub manifest: EffectManifest,
    pub fragment_shader: String,
}

pub fn list_effects() -> Vec<String> {
    let mut names: Vec<String> = embedded_effects().iter().map(|(name, _)| name.to_string()).collect();
    names.sort();
    names
}

/// Loads a built-in effect by name, or an effect package directory
/// (`manifest.json` + fragment shader) by path.
pub fn load_effect(name_or_path: &str) -> Result<LoadedEffect> {
    let dir = Path::new(name_or_path);
    if dir.join("manifest.json").is_file() {
        return load_effect_dir(dir);
    }

    let (_, embedded) = embedded_effects()
        .iter()
        .find(|(name, _)| *name == name_or_path)
        .with_context(|| {
            format!(
                "Effect '{}' not found. Built-in effects: {:?}",
                name_or_path,
                list_effects()
            )
        })?;
    let manifest: EffectManifest = serde_json::from_str(embedded.manifest_json)
        .with_context(|| format!("Failed to parse built-in manifest for {}", name_or_path))?;
    Ok(LoadedEffect {
        manifest,
        fragment_shader: embedded.fragment_wgsl.to_string(),
    })
}

fn load_effect_dir(dir: &Path) -> Result<LoadedEffect> {
    let manifest_path = dir.join("manifest.json");
    let manifest_str = std::fs::read_to_string(&manifest_path)
        .with_context(|| format!("Failed to read manifest: {}", manifest_path.display()))?;
    let manifest: EffectManifest = serde_json::from_str(&manifest_str)
        .with_context(|| format!("Failed to parse manifest: {}", manifest_path.display()))?;

    let fragment_path = dir.join(&manifest.fragment);
    let fragment_shader = std::fs::read_to_string(&fragment_path)
        .with_context(|| format!("Failed to read shader: {}", fragment_path.display()))?;

    Ok(LoadedEffect {
        manifest,
        fragment_shader,
    })
}

#[derive(Clone, Debug, PartialEq)]
pub struct ParamSlot {
    pub name: String,
    /// First uniform slot.
    pub slot: usize,
    /// Number of consecutive slots (3 for colors).
    pub width: usize,
}

/// Assignment of manifest parameters to uniform slots. Parameters are
/// uniforms rather than baked constants so they can be refreshed without
/// recompiling the pipeline. Feature parameters are the exception: they
/// select a row of the feature table and are baked as index constants.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParamLayout {
    slots: Vec<ParamSlot>,
    features: Vec<String>,
}

impl ParamLayout {
    pub fn new(manifest: &EffectManifest) -> crate::error::Result<Self> {
        let mut slots = Vec::new();
        let mut features = Vec::new();
        let mut next = 0;
        for (name, def) in &manifest.parameters {
            if def.is_feature() {
                features.push(name.clone());
                continue;
            }
            let Some(width) = def.width() else {
                log::warn!("Unknown parameter type '{}' for '{}'", def.param_type, name);
                continue;
            };
            slots.push(ParamSlot {
                name: name.clone(),
                slot: next,
                width,
            });
            next += width;
        }
        if next > MAX_PARAM_SLOTS {
            return Err(Error::invalid(format!(
                "effect {} needs {} parameter slots, at most {} available",
                manifest.name, next, MAX_PARAM_SLOTS
            )));
        }
        Ok(Self { slots, features })
    }

    pub fn slots(&self) -> &[ParamSlot] {
        &self.slots
    }

    pub fn get(&self, name: &str) -> Option<&ParamSlot> {
        self.slots.iter().find(|s| s.name == name)
    }

    pub fn is_feature(&self, name: &str) -> bool {
        self.features.iter().any(|f| f == name)
    }

    /// Uniform or feature parameter.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some() || self.is_feature(name)
    }

    /// One `PARAM_<NAME>` index constant per feature parameter. The value
    /// is an override or the manifest default, as a `stem-feature` key;
    /// empty or unknown keys select the first feature.
    pub fn feature_constants(
        &self,
        manifest: &EffectManifest,
        index: &FeatureIndex,
        overrides: &HashMap<String, String>,
    ) -> String {
        let mut out = String::from("// Feature parameters\n");
        for name in &self.features {
            let key = overrides
                .get(name)
                .map(String::as_str)
                .or_else(|| manifest.parameters.get(name).and_then(|d| d.default.as_str()))
                .unwrap_or_default();
            let slot = match index.get(key) {
                Some(entry) => entry.index,
                None => {
                    if !key.is_empty() {
                        log::warn!("Feature '{}' for parameter '{}' not loaded, using the first", key, name);
                    }
                    0
                }
            };
            out.push_str(&format!("const PARAM_{}: u32 = {}u;\n", name.to_uppercase(), slot));
        }
        out.push('\n');
        out
    }

    pub fn wgsl_constants(&self) -> String {
        let mut out = String::from("// Effect parameter slots\n");
        for slot in &self.slots {
            let upper = slot.name.to_uppercase();
            if slot.width == 3 {
                for (i, suffix) in ["R", "G", "B"].iter().enumerate() {
                    out.push_str(&format!("const PARAM_{}_{}: u32 = {}u;\n", upper, suffix, slot.slot + i));
                }
            } else {
                out.push_str(&format!("const PARAM_{}: u32 = {}u;\n", upper, slot.slot));
            }
        }
        out.push('\n');
        out
    }

    /// Packs resolved parameter values into the uniform layout.
    pub fn pack(&self, manifest: &EffectManifest, overrides: &HashMap<String, String>) -> [[f32; 4]; 4] {
        let mut packed = [[0.0f32; 4]; 4];
        for slot in &self.slots {
            let Some(def) = manifest.parameters.get(&slot.name) else {
                continue;
            };
            let values = def.resolve(overrides.get(&slot.name).map(String::as_str));
            for (i, value) in values.into_iter().take(slot.width).enumerate() {
                let s = slot.slot + i;
                packed[s / 4][s % 4] = value;
            }
        }
        packed
    }
}

/// Full WGSL module for one effect: shared bindings, the sampler variant,
/// feature index constants, parameter slots, then the effect body.
pub fn compose_shader(
    kind: SamplerKind,
    index: &FeatureIndex,
    effect: &LoadedEffect,
    layout: &ParamLayout,
    overrides: &HashMap<String, String>,
) -> String {
    let common = embedded_shared_shader("common.wgsl").unwrap_or_default();
    let mut src = String::with_capacity(common.len() + effect.fragment_shader.len() + 2048);
    src.push_str(common);
    src.push('\n');
    src.push_str(kind.wgsl());
    src.push('\n');
    src.push_str(&index.wgsl_constants());
    src.push_str(&layout.wgsl_constants());
    src.push_str(&layout.feature_constants(&effect.manifest, index, overrides));
    src.push_str(&effect.fragment_shader);
    src
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::series::FeatureSeries;
    use crate::features::index::MAX_FEATURES;

    #[test]
    fn built_in_effects_load() {
        for name in list_effects() {
            let effect = load_effect(&name).unwrap();
            assert_eq!(effect.manifest.name, name);
            assert!(effect.fragment_shader.contains("fn fs_main"));
            ParamLayout::new(&effect.manifest).unwrap();
        }
        assert!(load_effect("does_not_exist").is_err());
    }

    #[test]
    fn slots_follow_name_order() {
        let effect = load_effect("feature_bars").unwrap();
        let layout = ParamLayout::new(&effect.manifest).unwrap();
        // background_glow, color(3), gap, mirror, pulse_speed
        assert_eq!(layout.get("background_glow").unwrap().slot, 0);
        assert_eq!(layout.get("color").unwrap().slot, 1);
        assert_eq!(layout.get("gap").unwrap().slot, 4);
        assert_eq!(layout.get("pulse_speed").unwrap().slot, 6);

        let consts = layout.wgsl_constants();
        assert!(consts.contains("const PARAM_COLOR_B: u32 = 3u;"));
        assert!(consts.contains("const PARAM_GAP: u32 = 4u;"));

        let overrides = HashMap::from([("gap".to_string(), "0.5".to_string())]);
        let packed = layout.pack(&effect.manifest, &overrides);
        assert_eq!(packed[0][0], 0.15);
        assert_eq!(packed[0][1..4], [0.2, 0.8, 1.0]);
        assert_eq!(packed[1][0], 0.5);
    }

    #[test]
    fn too_many_slots_are_rejected() {
        let params: Vec<String> = (0..6)
            .map(|i| format!(r#""c{}": {{"type": "color", "default": [0, 0, 0]}}"#, i))
            .collect();
        let json = format!(
            r#"{{"name": "big", "display_name": "Big", "parameters": {{{}}}}}"#,
            params.join(",")
        );
        let manifest: EffectManifest = serde_json::from_str(&json).unwrap();
        assert!(matches!(ParamLayout::new(&manifest), Err(Error::ConfigurationInvalid(_))));
    }

    #[test]
    fn composed_shader_contains_every_part() {
        let series = vec![FeatureSeries::new("drums", "rms", vec![0.0])];
        let index = FeatureIndex::from_series(&series, MAX_FEATURES).unwrap();
        let effect = load_effect("feature_bars").unwrap();
        let layout = ParamLayout::new(&effect.manifest).unwrap();
        for kind in [SamplerKind::Gpu, SamplerKind::Cpu] {
            let src = compose_shader(kind, &index, &effect, &layout, &HashMap::new());
            assert!(src.contains("fn vs_main"));
            assert!(src.contains("fn sample_feature"));
            assert!(src.contains("const DRUMS_RMS: u32 = 0u;"));
            assert!(src.contains("const PARAM_PULSE_SPEED: u32"));
            assert!(src.find("const FEATURE_COUNT").unwrap() < src.find("fn fs_main").unwrap());
        }
    }

    #[test]
    fn feature_parameters_become_index_constants() {
        let series = vec![
            FeatureSeries::new("drums", "rms", vec![0.0]),
            FeatureSeries::new("bass", "rms", vec![0.0]),
        ];
        let index = FeatureIndex::from_series(&series, MAX_FEATURES).unwrap();
        let effect = load_effect("note_pulse").unwrap();
        let layout = ParamLayout::new(&effect.manifest).unwrap();
        assert!(layout.is_feature("feature"));
        assert!(layout.get("feature").is_none());
        assert!(layout.contains("feature") && layout.contains("rings"));

        let src = compose_shader(SamplerKind::Cpu, &index, &effect, &layout, &HashMap::new());
        assert!(src.contains("const PARAM_FEATURE: u32 = 0u;"));
        assert!(!src.contains("fx_param(PARAM_FEATURE)"));
        assert!(src.find("const PARAM_FEATURE").unwrap() < src.find("fn fs_main").unwrap());

        let overrides = HashMap::from([("feature".to_string(), "bass-rms".to_string())]);
        let src = compose_shader(SamplerKind::Gpu, &index, &effect, &layout, &overrides);
        assert!(src.contains("const PARAM_FEATURE: u32 = 1u;"));

        let unknown = HashMap::from([("feature".to_string(), "vocals-rms".to_string())]);
        let consts = layout.feature_constants(&effect.manifest, &index, &unknown);
        assert!(consts.contains("const PARAM_FEATURE: u32 = 0u;"));
    }

    #[test]
    fn loads_effect_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("manifest.json"),
            r#"{"name": "custom", "display_name": "Custom", "fragment": "fx.wgsl"}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("fx.wgsl"), "@fragment fn fs_main() {}").unwrap();
        let effect = load_effect(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(effect.manifest.name, "custom");
        assert_eq!(effect.manifest.parameters.len(), 0);
    }
}
