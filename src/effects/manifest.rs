use serde::Deserialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Deserialize)]
pub struct EffectManifest {
    pub name: String,
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_fragment")]
    pub fragment: String,
    /// Minimum interval between non-audio parameter refreshes.
    #[serde(default)]
    pub param_refresh_ms: Option<u64>,
    /// Ordered by name so parameter slots are stable.
    #[serde(default)]
    pub parameters: BTreeMap<String, ParamDef>,
}

fn default_fragment() -> String {
    "main.wgsl".into()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParamDef {
    #[serde(rename = "type")]
    pub param_type: String,
    pub default: serde_json::Value,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

impl ParamDef {
    /// Feature parameters name a `stem-feature` key and become an index
    /// constant when the shader is composed, not a uniform.
    pub fn is_feature(&self) -> bool {
        self.param_type == "feature"
    }

    /// Uniform slots this parameter occupies, or None for unknown types.
    pub fn width(&self) -> Option<usize> {
        match self.param_type.as_str() {
            "float" | "int" | "bool" => Some(1),
            "color" => Some(3),
            _ => None,
        }
    }

    /// Value from an override string (`--param key=value`) or the default.
    /// Colors accept `r:g:b` or `#rrggbb`.
    pub fn resolve(&self, value: Option<&str>) -> Vec<f32> {
        match self.param_type.as_str() {
            "int" => {
                let v = value
                    .and_then(|v| v.parse::<i64>().ok())
                    .unwrap_or_else(|| self.default.as_i64().unwrap_or(0));
                vec![self.clamp(v as f64)]
            }
            "float" => {
                let v = value
                    .and_then(|v| v.parse::<f64>().ok())
                    .unwrap_or_else(|| self.default.as_f64().unwrap_or(0.0));
                vec![self.clamp(v)]
            }
            "bool" => {
                let v = value
                    .map(|v| v == "true" || v == "1")
                    .unwrap_or_else(|| self.default.as_bool().unwrap_or(false));
                vec![if v { 1.0 } else { 0.0 }]
            }
            "color" => {
                let rgb = value.and_then(parse_color).unwrap_or_else(|| {
                    let arr = self.default.as_array();
                    let at = |i: usize| {
                        arr.and_then(|a| a.get(i)).and_then(|v| v.as_f64()).unwrap_or(0.0) as f32
                    };
                    [at(0), at(1), at(2)]
                });
                rgb.to_vec()
            }
            _ => Vec::new(),
        }
    }

    fn clamp(&self, v: f64) -> f32 {
        let v = self.min.map_or(v, |min| v.max(min));
        let v = self.max.map_or(v, |max| v.min(max));
        v as f32
    }
}

fn parse_color(raw: &str) -> Option<[f32; 3]> {
    if let Some(hex) = raw.strip_prefix('#') {
        if hex.len() != 6 {
            return None;
        }
        let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok().map(|c| c as f32 / 255.0);
        return Some([channel(0)?, channel(2)?, channel(4)?]);
    }
    let parts: Vec<f32> = raw.split(':').filter_map(|s| s.trim().parse().ok()).collect();
    match parts.as_slice() {
        [r, g, b] => Some([*r, *g, *b]),
        _ => None,
    }
}
