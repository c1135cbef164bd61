use anyhow::Context;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::config::ExportConfiguration;
use super::job::{JobId, OutputRef};
use super::precompute::FrameRecord;
use crate::error::{Error, Result};
use crate::features::index::FeatureIndex;

type Reporter = Box<dyn Fn(f32, &str, Option<(usize, usize)>) + Send + Sync>;

/// Link from a running collaborator back to the orchestrator: cancellation
/// checks and progress reports for the current phase.
pub struct JobControl {
    cancel: Arc<AtomicBool>,
    reporter: Reporter,
}

impl JobControl {
    pub fn new(
        cancel: Arc<AtomicBool>,
        reporter: impl Fn(f32, &str, Option<(usize, usize)>) + Send + Sync + 'static,
    ) -> Self {
        Self {
            cancel,
            reporter: Box::new(reporter),
        }
    }

    /// Not attached to any orchestrator; never cancelled, reports are dropped.
    pub fn detached() -> Self {
        Self::new(Arc::new(AtomicBool::new(false)), |_, _, _| {})
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    pub fn cancel_flag(&self) -> &AtomicBool {
        &self.cancel
    }

    /// Call at every frame boundary.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn report(&self, fraction: f32, message: &str) {
        (self.reporter)(fraction, message, None);
    }

    pub fn report_frame(&self, current: usize, total: usize) {
        let fraction = if total == 0 { 1.0 } else { current as f32 / total as f32 };
        (self.reporter)(fraction, &format!("frame {}/{}", current, total), Some((current, total)));
    }
}

/// Everything a renderer gets for one job. Frames are precomputed and
/// complete before `render` is called.
pub struct RenderJob {
    pub id: JobId,
    pub config: ExportConfiguration,
    pub frames: Arc<Vec<FrameRecord>>,
    pub index: FeatureIndex,
    pub control: JobControl,
}

/// The opaque render/encode collaborator. Implementations must poll
/// `job.control.checkpoint()` at least once per frame.
pub trait Renderer: Send {
    fn name(&self) -> &str;

    fn render(&mut self, job: &RenderJob) -> anyhow::Result<()>;

    fn encode(&mut self, job: &RenderJob) -> anyhow::Result<OutputRef>;

    /// Releases whatever the job held after cancellation or failure.
    fn abort(&mut self) {}
}

/// Writes one JSON object per frame. Output is a pure function of the
/// frames, so two exports of the same data diff clean.
pub struct FrameDumpRenderer {
    output: PathBuf,
    partial: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl FrameDumpRenderer {
    pub fn new(output: impl Into<PathBuf>) -> Self {
        let output = output.into();
        let partial = partial_path(&output);
        Self {
            output,
            partial,
            writer: None,
        }
    }
}

fn partial_path(output: &Path) -> PathBuf {
    let mut name = output.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".partial");
    output.with_file_name(name)
}

impl Renderer for FrameDumpRenderer {
    fn name(&self) -> &str {
        "frames"
    }

    fn render(&mut self, job: &RenderJob) -> anyhow::Result<()> {
        if let Some(parent) = self.output.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let file = File::create(&self.partial)
            .with_context(|| format!("Failed to create {}", self.partial.display()))?;
        let writer = self.writer.insert(BufWriter::new(file));

        let total = job.frames.len();
        for frame in job.frames.iter() {
            job.control.checkpoint()?;
            serde_json::to_writer(&mut *writer, frame)?;
            writer.write_all(b"\n")?;
            job.control.report_frame(frame.frame_number + 1, total);
        }
        Ok(())
    }

    fn encode(&mut self, job: &RenderJob) -> anyhow::Result<OutputRef> {
        job.control.checkpoint()?;
        let mut writer = self.writer.take().context("render did not run")?;
        writer.flush()?;
        drop(writer);
        std::fs::rename(&self.partial, &self.output)
            .with_context(|| format!("Failed to move output to {}", self.output.display()))?;
        job.control.report(1.0, "frames written");
        Ok(OutputRef(self.output.clone()))
    }

    fn abort(&mut self) {
        self.writer = None;
        if self.partial.exists() {
            if let Err(err) = std::fs::remove_file(&self.partial) {
                log::warn!("Failed to remove {}: {}", self.partial.display(), err);
            }
        }
    }
}
