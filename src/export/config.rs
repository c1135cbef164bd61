use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Draft,
    Medium,
    High,
    Ultra,
}

impl Quality {
    /// Constant rate factor handed to the encoder. Lower is better.
    pub fn crf(self) -> u32 {
        match self {
            Quality::Draft => 28,
            Quality::Medium => 23,
            Quality::High => 18,
            Quality::Ultra => 12,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Mp4,
    Webm,
    Mov,
    Gif,
}

impl Format {
    pub fn extension(self) -> &'static str {
        match self {
            Format::Mp4 => "mp4",
            Format::Webm => "webm",
            Format::Mov => "mov",
            Format::Gif => "gif",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    H264,
    H265,
    Vp9,
    Prores,
}

impl Codec {
    /// ffmpeg encoder name.
    pub fn ffmpeg_name(self) -> &'static str {
        match self {
            Codec::H264 => "libx264",
            Codec::H265 => "libx265",
            Codec::Vp9 => "libvpx-vp9",
            Codec::Prores => "prores_ks",
        }
    }

    pub fn pix_fmt(self) -> &'static str {
        match self {
            Codec::Prores => "yuv422p10le",
            _ => "yuv420p",
        }
    }

    fn supported_in(self, format: Format) -> bool {
        match format {
            Format::Mp4 => matches!(self, Codec::H264 | Codec::H265),
            Format::Webm => self == Codec::Vp9,
            Format::Mov => matches!(self, Codec::H264 | Codec::H265 | Codec::Prores),
            // gif has its own palette encoder; codec is ignored
            Format::Gif => true,
        }
    }
}

macro_rules! impl_from_str {
    ($ty:ty, $what:literal, [$($name:literal => $variant:expr),+ $(,)?]) => {
        impl FromStr for $ty {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                match s.to_ascii_lowercase().as_str() {
                    $($name => Ok($variant),)+
                    other => Err(Error::invalid(format!("unknown {} '{}'", $what, other))),
                }
            }
        }
    };
}

impl_from_str!(Quality, "quality", ["draft" => Quality::Draft, "medium" => Quality::Medium, "high" => Quality::High, "ultra" => Quality::Ultra]);
impl_from_str!(Format, "format", ["mp4" => Format::Mp4, "webm" => Format::Webm, "mov" => Format::Mov, "gif" => Format::Gif]);
impl_from_str!(Codec, "codec", ["h264" => Codec::H264, "h265" => Codec::H265, "vp9" => Codec::Vp9, "prores" => Codec::Prores]);

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Output settings for one export. Validated before any computation starts
/// and never changed while a job runs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExportConfiguration {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub duration_seconds: f64,
    pub quality: Quality,
    pub format: Format,
    pub codec: Codec,
    /// Audio muxed into the output by the encoder, if any.
    #[serde(default)]
    pub audio_file: Option<PathBuf>,
}

impl Default for ExportConfiguration {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            fps: 30,
            duration_seconds: 0.0,
            quality: Quality::High,
            format: Format::Mp4,
            codec: Codec::H264,
            audio_file: None,
        }
    }
}

impl ExportConfiguration {
    pub fn validate(&self) -> Result<()> {
        if self.fps == 0 {
            return Err(Error::invalid("fps must be positive"));
        }
        if !self.duration_seconds.is_finite() || self.duration_seconds <= 0.0 {
            return Err(Error::invalid(format!(
                "duration must be positive, got {}",
                self.duration_seconds
            )));
        }
        if self.width == 0 || self.height == 0 {
            return Err(Error::invalid(format!(
                "resolution must be non-zero, got {}x{}",
                self.width, self.height
            )));
        }
        if !self.codec.supported_in(self.format) {
            return Err(Error::invalid(format!(
                "codec {:?} cannot be stored in {}",
                self.codec, self.format
            )));
        }
        Ok(())
    }

    pub fn total_frames(&self) -> usize {
        if self.fps == 0 || !(self.duration_seconds > 0.0) {
            return 0;
        }
        (self.duration_seconds * self.fps as f64).ceil() as usize
    }

    /// Timestamp of `frame`, in seconds.
    pub fn frame_time(&self, frame: usize) -> f64 {
        frame as f64 / self.fps as f64
    }

    pub fn apply_preset(&mut self, preset: &Preset) {
        self.width = preset.width;
        self.height = preset.height;
        self.fps = preset.fps;
        self.format = preset.format;
        self.codec = preset.codec;
        if let Some(quality) = preset.quality {
            self.quality = quality;
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Preset {
    pub name: &'static str,
    pub description: &'static str,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: Format,
    pub codec: Codec,
    pub quality: Option<Quality>,
}

pub const PRESETS: &[Preset] = &[
    Preset {
        name: "youtube",
        description: "1080p landscape, H.264",
        width: 1920,
        height: 1080,
        fps: 30,
        format: Format::Mp4,
        codec: Codec::H264,
        quality: None,
    },
    Preset {
        name: "instagram",
        description: "square 1080, H.264",
        width: 1080,
        height: 1080,
        fps: 30,
        format: Format::Mp4,
        codec: Codec::H264,
        quality: None,
    },
    Preset {
        name: "tiktok",
        description: "1080 portrait, H.264",
        width: 1080,
        height: 1920,
        fps: 30,
        format: Format::Mp4,
        codec: Codec::H264,
        quality: None,
    },
    Preset {
        name: "twitter",
        description: "720p landscape, H.264",
        width: 1280,
        height: 720,
        fps: 30,
        format: Format::Mp4,
        codec: Codec::H264,
        quality: None,
    },
    Preset {
        name: "high-quality",
        description: "1080p60 ProRes master",
        width: 1920,
        height: 1080,
        fps: 60,
        format: Format::Mov,
        codec: Codec::Prores,
        quality: Some(Quality::Ultra),
    },
];

pub fn preset(name: &str) -> Option<&'static Preset> {
    PRESETS.iter().find(|p| p.name.eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(fps: u32, duration: f64) -> ExportConfiguration {
        ExportConfiguration {
            fps,
            duration_seconds: duration,
            ..Default::default()
        }
    }

    #[test]
    fn rejects_non_positive_fps_and_duration() {
        assert!(matches!(config(0, 2.0).validate(), Err(Error::ConfigurationInvalid(_))));
        assert!(matches!(config(30, 0.0).validate(), Err(Error::ConfigurationInvalid(_))));
        assert!(matches!(config(30, -1.0).validate(), Err(Error::ConfigurationInvalid(_))));
        assert!(matches!(config(30, f64::NAN).validate(), Err(Error::ConfigurationInvalid(_))));
        assert!(config(30, 2.0).validate().is_ok());
    }

    #[test]
    fn rejects_incompatible_containers() {
        let mut cfg = config(30, 1.0);
        cfg.codec = Codec::Prores;
        assert!(cfg.validate().is_err());
        cfg.format = Format::Mov;
        assert!(cfg.validate().is_ok());
        cfg.format = Format::Webm;
        cfg.codec = Codec::H264;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn total_frames_rounds_up() {
        assert_eq!(config(30, 1.0).total_frames(), 30);
        assert_eq!(config(30, 1.01).total_frames(), 31);
        assert_eq!(config(1, 2.0).total_frames(), 2);
        assert_eq!(config(24, 0.5).frame_time(6), 0.25);
    }

    #[test]
    fn presets_apply_dimensions() {
        let mut cfg = config(30, 1.0);
        cfg.apply_preset(preset("TikTok").unwrap());
        assert_eq!((cfg.width, cfg.height), (1080, 1920));
        assert_eq!(cfg.quality, Quality::High);

        cfg.apply_preset(preset("high-quality").unwrap());
        assert_eq!(cfg.fps, 60);
        assert_eq!(cfg.quality, Quality::Ultra);
        assert!(cfg.validate().is_ok());
        assert!(preset("vimeo").is_none());
    }

    #[test]
    fn parses_names_case_insensitively() {
        assert_eq!("ULTRA".parse::<Quality>().unwrap().crf(), 12);
        assert_eq!("webm".parse::<Format>().unwrap(), Format::Webm);
        assert_eq!("prores".parse::<Codec>().unwrap().ffmpeg_name(), "prores_ks");
        assert!("av1".parse::<Codec>().is_err());
    }
}
