use clap::{Parser, ValueEnum};
use std::path::PathBuf;

use stemlight::export::config::{Codec, Format, Quality};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum RendererKind {
    /// Render the effect on the GPU and encode with ffmpeg
    Gpu,
    /// Write every precomputed frame as one JSON line
    Frames,
}

#[derive(Parser, Debug)]
#[command(name = "stemlight", about = "Audio-reactive effect exporter for pre-analyzed stems and MIDI")]
pub struct Cli {
    /// Analysis JSON with per-stem feature series
    pub analysis: Option<PathBuf>,

    /// MIDI notes: a Standard MIDI File (.mid) or a JSON track list
    #[arg(short, long)]
    pub midi: Option<PathBuf>,

    /// Output file. Defaults to <output_dir>/<effect>.<ext>
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Effect name or effect package directory
    #[arg(short, long, default_value = "feature_bars")]
    pub effect: String,

    /// Effect parameter override (key=value), repeatable
    #[arg(short, long = "param")]
    pub params: Vec<String>,

    /// Video width in pixels
    #[arg(long, default_value_t = 1920)]
    pub width: u32,

    /// Video height in pixels
    #[arg(long, default_value_t = 1080)]
    pub height: u32,

    /// Frames per second
    #[arg(long, default_value_t = 30)]
    pub fps: u32,

    /// Clip length in seconds. Defaults to the duration stored in the analysis file.
    #[arg(short, long)]
    pub duration: Option<f64>,

    /// Encoding quality: draft, medium, high, ultra
    #[arg(long)]
    pub quality: Option<Quality>,

    /// Container: mp4, webm, mov, gif
    #[arg(long)]
    pub format: Option<Format>,

    /// Video codec: h264, h265, vp9, prores
    #[arg(long)]
    pub codec: Option<Codec>,

    /// Output preset (see --list-presets)
    #[arg(long)]
    pub preset: Option<String>,

    /// Audio file muxed into the video
    #[arg(short, long)]
    pub audio: Option<PathBuf>,

    /// Export backend
    #[arg(long, value_enum, default_value_t = RendererKind::Gpu)]
    pub renderer: RendererKind,

    /// Sample features from the packed texture, exactly as the live preview does
    #[arg(long)]
    pub preview: bool,

    /// Config file (default: stemlight.toml or ~/.config/stemlight/config.toml)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// List output presets and exit
    #[arg(long)]
    pub list_presets: bool,

    /// List built-in effects and exit
    #[arg(long)]
    pub list_effects: bool,

    /// Print the generated WGSL feature constants and exit
    #[arg(long)]
    pub emit_constants: bool,

    /// Print the composed effect shader and exit
    #[arg(long)]
    pub emit_shader: bool,
}
