use anyhow::{Context, Result};
use std::io::{Read, Write};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::Error;
use crate::export::config::{Codec, ExportConfiguration, Format};

const WAIT_POLL: Duration = Duration::from_millis(20);
/// Bytes of ffmpeg's stderr kept for error reports.
const STDERR_TAIL: usize = 4096;

fn path_arg(path: &Path) -> Result<String> {
    path.to_str()
        .map(str::to_string)
        .with_context(|| format!("Path is not valid UTF-8: {}", path.display()))
}

/// ffmpeg command line for raw RGBA frames on stdin.
pub fn build_args(output_path: &Path, config: &ExportConfiguration) -> Result<Vec<String>> {
    let mut args = vec![
        "-y".to_string(),
        "-loglevel".into(), "error".into(),
        "-f".into(), "rawvideo".into(),
        "-pixel_format".into(), "rgba".into(),
        "-video_size".into(), format!("{}x{}", config.width, config.height),
        "-framerate".into(), config.fps.to_string(),
        "-i".into(), "pipe:0".into(),
    ];

    let audio = match (&config.audio_file, config.format) {
        (Some(_), Format::Gif) => {
            log::warn!("GIF output has no audio track, ignoring audio file");
            None
        }
        (audio, _) => audio.as_deref(),
    };
    if let Some(audio) = audio {
        args.extend(["-i".to_string(), path_arg(audio)?]);
    }

    if config.format == Format::Gif {
        args.extend([
            "-vf".to_string(),
            "split[a][b];[a]palettegen[p];[b][p]paletteuse".to_string(),
        ]);
    } else {
        let crf = config.quality.crf().to_string();
        args.extend([
            "-c:v".to_string(), config.codec.ffmpeg_name().to_string(),
            "-pix_fmt".into(), config.codec.pix_fmt().to_string(),
        ]);
        match config.codec {
            Codec::H264 | Codec::H265 => {
                args.extend(["-crf".to_string(), crf, "-preset".into(), "medium".into()]);
            }
            Codec::Vp9 => {
                args.extend(["-crf".to_string(), crf, "-b:v".into(), "0".into()]);
            }
            Codec::Prores => {
                args.extend(["-profile:v".to_string(), "3".into()]);
            }
        }
    }

    if audio.is_some() {
        let audio_codec = if config.format == Format::Webm { "libopus" } else { "aac" };
        args.extend([
            "-c:a".to_string(), audio_codec.into(),
            "-b:a".into(), "192k".into(),
            "-shortest".into(),
        ]);
    }

    args.push(path_arg(output_path)?);
    Ok(args)
}

/// Reads `reader` to the end, keeping only its last `limit` bytes.
pub fn read_tail<R: Read>(mut reader: R, limit: usize) -> String {
    let mut tail = Vec::with_capacity(limit.min(8192));
    let mut chunk = [0u8; 1024];
    loop {
        match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                tail.extend_from_slice(&chunk[..n]);
                if tail.len() > limit {
                    tail.drain(..tail.len() - limit);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    String::from_utf8_lossy(&tail).into_owned()
}

pub struct FfmpegEncoder {
    child: Child,
    /// Drains stderr so a chatty ffmpeg never blocks on a full pipe.
    stderr: Option<JoinHandle<String>>,
}

impl FfmpegEncoder {
    pub fn new(output_path: &Path, config: &ExportConfiguration) -> Result<Self> {
        let args = build_args(output_path, config)?;
        let mut child = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .context("Failed to spawn ffmpeg. Is ffmpeg installed?")?;
        let stderr = match child.stderr.take() {
            Some(pipe) => Some(
                thread::Builder::new()
                    .name("ffmpeg-stderr".into())
                    .spawn(move || read_tail(pipe, STDERR_TAIL))
                    .context("Failed to start ffmpeg stderr reader")?,
            ),
            None => None,
        };

        log::info!(
            "FFmpeg encoder started: {}x{} @ {}fps, {} / {}",
            config.width,
            config.height,
            config.fps,
            config.format,
            config.codec.ffmpeg_name()
        );

        Ok(Self { child, stderr })
    }

    pub fn write_frame(&mut self, rgba_pixels: &[u8]) -> Result<()> {
        let stdin = self.child.stdin.as_mut().context("FFmpeg stdin not available")?;
        stdin.write_all(rgba_pixels).context("Failed to write frame to ffmpeg")?;
        Ok(())
    }

    /// Closes the frame stream and waits for ffmpeg, polling `cancel`.
    /// A cancelled encode kills the process.
    pub fn finish(mut self, cancel: &AtomicBool) -> Result<()> {
        drop(self.child.stdin.take());

        let status = loop {
            if cancel.load(Ordering::Acquire) {
                self.kill();
                return Err(Error::Cancelled.into());
            }
            match self.child.try_wait().context("Failed to wait for ffmpeg")? {
                Some(status) => break status,
                None => thread::sleep(WAIT_POLL),
            }
        };

        let stderr = self
            .stderr
            .take()
            .and_then(|reader| reader.join().ok())
            .unwrap_or_default();
        if !status.success() {
            anyhow::bail!("FFmpeg exited with error:\n{}", stderr);
        }

        log::info!("FFmpeg encoding complete");
        Ok(())
    }

    pub fn kill(&mut self) {
        drop(self.child.stdin.take());
        if let Err(err) = self.child.kill() {
            log::debug!("ffmpeg already exited: {}", err);
        }
        let _ = self.child.wait();
        if let Some(reader) = self.stderr.take() {
            let _ = reader.join();
        }
    }
}
