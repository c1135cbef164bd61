mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use cli::{Cli, RendererKind};
use stemlight::audio::midi::{load_midi_file, load_midi_json, MidiTrack};
use stemlight::audio::series::load_analysis_file;
use stemlight::config::{self, Config};
use stemlight::effects::instance::EffectInstance;
use stemlight::effects::loader::{self, LoadedEffect};
use stemlight::export::config::{preset, PRESETS};
use stemlight::export::mapping::RuleMapping;
use stemlight::export::orchestrator::OrchestratorConfig;
use stemlight::export::renderer::{FrameDumpRenderer, Renderer};
use stemlight::features::packer::PackerConfig;
use stemlight::render::export::GpuExportRenderer;
use stemlight::{ExportConfiguration, JobStatus, SamplerKind, Studio, StudioConfig};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let mut cli = Cli::parse();

    let mut cfg = Config::default();
    if let Some(path) = config::discover_config(cli.config.clone()) {
        if let Some(loaded) = config::load_config(&path) {
            log::info!("Loaded config from {}", path.display());
            cfg = loaded;
        } else {
            log::warn!("Failed to load config from {}", path.display());
        }
    }
    // Merge: config values apply only when CLI is at its default
    if cli.width == 1920 { cli.width = cfg.output.width; }
    if cli.height == 1080 { cli.height = cfg.output.height; }
    if cli.fps == 30 { cli.fps = cfg.output.fps; }
    if cli.effect == "feature_bars" { cli.effect = cfg.effect.name.clone(); }
    cli.quality = cli.quality.or(cfg.output.quality);
    cli.format = cli.format.or(cfg.output.format);
    cli.codec = cli.codec.or(cfg.output.codec);
    if cli.preset.is_none() { cli.preset = cfg.output.preset.clone(); }

    if cli.list_presets {
        println!("Available presets:");
        for p in PRESETS {
            println!(
                "  {:<14} {}x{} @ {}fps {:<5} {}",
                p.name,
                p.width,
                p.height,
                p.fps,
                p.format.extension(),
                p.description
            );
        }
        return Ok(());
    }

    if cli.list_effects {
        println!("Available effects:");
        for name in loader::list_effects() {
            match loader::load_effect(&name) {
                Ok(fx) => println!("  {:<14} {}", fx.manifest.name, fx.manifest.description),
                Err(_) => println!("  {}", name),
            }
        }
        return Ok(());
    }

    let analysis_path = cli.analysis.as_ref().context("Analysis file is required")?;
    let analysis = load_analysis_file(analysis_path)
        .with_context(|| format!("Failed to load analysis from {}", analysis_path.display()))?;
    let duration = cli
        .duration
        .or(analysis.duration)
        .context("Clip duration unknown: the analysis file has none, pass --duration")?;

    let studio = Studio::new(StudioConfig {
        packer: PackerConfig {
            time_samples: cfg.textures.time_samples,
            max_features: cfg.textures.max_features,
        },
        orchestrator: OrchestratorConfig {
            grace_period: Duration::from_secs(cfg.export.grace_period_secs),
            progress_stride: cfg.export.progress_stride,
        },
    })?;
    let index = studio.load_analysis(analysis.series)?;

    if cli.emit_constants {
        print!("{}", index.wgsl_constants());
        return Ok(());
    }

    let export_config = build_export_config(&cli, duration)?;
    let effect = EffectInstance::new(
        load_effect(&cli.effect, &cfg)?,
        param_overrides(&cfg.effect.params, &cli.params),
        export_config.width,
        export_config.height,
    )?;

    let kind = if cli.preview { SamplerKind::Gpu } else { SamplerKind::Cpu };
    if cli.emit_shader {
        print!("{}", effect.shader_source(kind, &index));
        return Ok(());
    }

    let midi_path = cli.midi.as_ref().context("MIDI input is required (--midi)")?;
    studio.load_midi(load_midi(midi_path)?);
    if !cfg.mapping.is_empty() {
        log::info!("Visual mapping: {} rules", cfg.mapping.len());
        studio.set_mapping(Arc::new(RuleMapping::new(cfg.mapping.clone())));
    }
    studio.configure(export_config.clone())?;

    let output = cli.output.clone().unwrap_or_else(|| {
        let file = match cli.renderer {
            RendererKind::Frames => format!("{}.jsonl", effect.name()),
            RendererKind::Gpu => format!("{}.{}", effect.name(), export_config.format.extension()),
        };
        cfg.export.output_dir.join(file)
    });

    log::info!("stemlight - audio-reactive export");
    log::info!("Analysis: {}", analysis_path.display());
    log::info!("Output: {}", output.display());
    log::info!("Effect: {}", effect.display_name());
    log::info!(
        "Resolution: {}x{} @ {}fps, {:.2}s ({} frames)",
        export_config.width,
        export_config.height,
        export_config.fps,
        export_config.duration_seconds,
        export_config.total_frames()
    );

    let label = format!("{} -> {}", effect.name(), output.display());
    let renderer: Box<dyn Renderer> = match cli.renderer {
        RendererKind::Frames => Box::new(FrameDumpRenderer::new(&output)),
        RendererKind::Gpu if cli.preview => {
            Box::new(GpuExportRenderer::new(&output, effect).with_texture(studio.packed_buffer()))
        }
        RendererKind::Gpu => Box::new(GpuExportRenderer::new(&output, effect)),
    };

    let events = studio.subscribe();
    let id = studio.enqueue_export(label, renderer)?;

    let pb = ProgressBar::new(export_config.total_frames() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
            .context("Invalid progress template")?
            .progress_chars("=>-"),
    );

    let mut phase = JobStatus::Queued;
    for event in events.iter().filter(|e| e.job_id == id) {
        if event.status != phase {
            phase = event.status;
            pb.set_position(0);
            log::debug!("{}: {}", id, phase);
        }
        match event.progress.current_frame {
            Some(frame) => pb.set_position(frame as u64),
            None => pb.set_position((event.progress.fraction * pb.length().unwrap_or(0) as f32) as u64),
        }
        pb.set_message(format!("{} {}", phase, event.progress.message));
        if event.status.is_terminal() {
            break;
        }
    }

    let job = studio.get_job_status(id).context("Export job disappeared")?;
    match job.status {
        JobStatus::Complete => {
            pb.finish_with_message("Export complete");
            let output = job.output_ref.map(|o| o.0).unwrap_or(output);
            log::info!("Done! Output: {}", output.display());
            Ok(())
        }
        _ => {
            pb.abandon_with_message("Export failed");
            anyhow::bail!("Export failed: {}", job.error.unwrap_or_else(|| "unknown error".into()))
        }
    }
}

fn build_export_config(cli: &Cli, duration: f64) -> Result<ExportConfiguration> {
    let mut config = ExportConfiguration {
        width: cli.width,
        height: cli.height,
        fps: cli.fps,
        duration_seconds: duration,
        audio_file: cli.audio.clone(),
        ..Default::default()
    };
    if let Some(name) = &cli.preset {
        let p = preset(name).with_context(|| format!("Unknown preset '{}', see --list-presets", name))?;
        log::info!("Preset: {} ({})", p.name, p.description);
        config.apply_preset(p);
    }
    if let Some(quality) = cli.quality { config.quality = quality; }
    if let Some(format) = cli.format { config.format = format; }
    if let Some(codec) = cli.codec { config.codec = codec; }
    config.validate()?;
    Ok(config)
}

fn load_effect(name: &str, cfg: &Config) -> Result<LoadedEffect> {
    let mut effect = loader::load_effect(name)?;
    if effect.manifest.param_refresh_ms.is_none() {
        effect.manifest.param_refresh_ms = Some(cfg.effect.param_refresh_ms);
    }
    Ok(effect)
}

/// Config params first, then `--param key=value` on top.
fn param_overrides(from_config: &HashMap<String, String>, from_cli: &[String]) -> HashMap<String, String> {
    let mut params = from_config.clone();
    for s in from_cli {
        let mut parts = s.splitn(2, '=');
        match (parts.next(), parts.next()) {
            (Some(key), Some(value)) => {
                params.insert(key.trim().to_string(), value.trim().to_string());
            }
            _ => log::warn!("Ignoring malformed --param '{}', expected key=value", s),
        }
    }
    params
}

fn load_midi(path: &Path) -> Result<Vec<MidiTrack>> {
    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));
    let tracks = if is_json {
        load_midi_json(path)
    } else {
        load_midi_file(path)
    };
    tracks.with_context(|| format!("Failed to load MIDI from {}", path.display()))
}
