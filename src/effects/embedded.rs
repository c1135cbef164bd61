pub struct EmbeddedEffect {
    pub manifest_json: &'static str,
    pub fragment_wgsl: &'static str,
}

pub fn embedded_effects() -> &'static [(&'static str, EmbeddedEffect)] {
    &[
        (
            "feature_bars",
            EmbeddedEffect {
                manifest_json: include_str!("../../effects/feature_bars/manifest.json"),
                fragment_wgsl: include_str!("../../effects/feature_bars/main.wgsl"),
            },
        ),
        (
            "note_pulse",
            EmbeddedEffect {
                manifest_json: include_str!("../../effects/note_pulse/manifest.json"),
                fragment_wgsl: include_str!("../../effects/note_pulse/main.wgsl"),
            },
        ),
    ]
}

pub fn embedded_shared_shader(name: &str) -> Option<&'static str> {
    match name {
        "common.wgsl" => Some(include_str!("../../shaders/common.wgsl")),
        _ => None,
    }
}
