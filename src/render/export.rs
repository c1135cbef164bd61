use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use wgpu;

use super::frame::{FrameRenderer, TEXTURE_FORMAT};
use super::gpu::GpuContext;
use super::pipeline::RenderPipeline;
use super::texture::{FeatureTexture, FramePacker};
use crate::effects::instance::{EffectInstance, EffectUniforms};
use crate::encode::ffmpeg::FfmpegEncoder;
use crate::export::job::OutputRef;
use crate::export::renderer::{RenderJob, Renderer};
use crate::features::index::rows_for;
use crate::features::packer::{PackedFeatureBuffer, TimeSync};
use crate::features::sampler::SamplerKind;

/// Where the effect reads its features from during an export.
pub enum FeatureSource {
    /// Exact per-frame values from the precomputed frame records.
    Frames,
    /// The packed live-preview texture, interpolated on the GPU.
    Texture(Arc<PackedFeatureBuffer>),
}

/// Renders every precomputed frame through one effect and pipes the pixels
/// to ffmpeg.
pub struct GpuExportRenderer {
    output: PathBuf,
    effect: EffectInstance,
    source: FeatureSource,
    encoder: Option<FfmpegEncoder>,
}

impl GpuExportRenderer {
    pub fn new(output: impl Into<PathBuf>, effect: EffectInstance) -> Self {
        Self {
            output: output.into(),
            effect,
            source: FeatureSource::Frames,
            encoder: None,
        }
    }

    /// Renders from the packed texture instead of exact frame values, so
    /// the export looks exactly like the live preview.
    pub fn with_texture(mut self, buffer: Arc<PackedFeatureBuffer>) -> Self {
        self.source = FeatureSource::Texture(buffer);
        self
    }

    pub fn kind(&self) -> SamplerKind {
        match self.source {
            FeatureSource::Frames => SamplerKind::Cpu,
            FeatureSource::Texture(_) => SamplerKind::Gpu,
        }
    }
}

impl Renderer for GpuExportRenderer {
    fn name(&self) -> &str {
        "gpu"
    }

    fn render(&mut self, job: &RenderJob) -> Result<()> {
        job.control.checkpoint()?;
        let config = &job.config;
        let kind = self.kind();

        log::info!("Initializing GPU...");
        let gpu = GpuContext::new()?;
        let frame_renderer = FrameRenderer::new(&gpu, config.width, config.height);

        let shader = self.effect.shader_source(kind, &job.index);
        let pipeline = RenderPipeline::new(&gpu.device, &shader, TEXTURE_FORMAT, kind)
            .with_context(|| format!("Failed to build pipeline for effect {}", self.effect.name()))?;

        let uniform_buffer = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("effect_uniforms"),
            size: std::mem::size_of::<EffectUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let time_buffer = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("time_sync"),
            size: std::mem::size_of::<TimeSync>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let frame_buffer = match self.source {
            FeatureSource::Frames => Some(gpu.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("frame_features"),
                size: (rows_for(job.index.capacity()) * std::mem::size_of::<[f32; 4]>()) as u64,
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })),
            FeatureSource::Texture(_) => None,
        };
        let feature_texture = match &self.source {
            FeatureSource::Texture(buffer) => Some(FeatureTexture::new(&gpu, buffer)),
            FeatureSource::Frames => None,
        };
        let features = match (&frame_buffer, &feature_texture) {
            (Some(buffer), _) => buffer.as_entire_binding(),
            (None, Some(texture)) => wgpu::BindingResource::TextureView(&texture.view),
            (None, None) => anyhow::bail!("no feature source to bind"),
        };
        let bind_group = pipeline.bind_group(&gpu.device, &uniform_buffer, &time_buffer, features);

        if let Some(parent) = self.output.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        log::info!("Starting FFmpeg encoder...");
        let encoder = self.encoder.insert(FfmpegEncoder::new(&self.output, config)?);

        let total = job.frames.len();
        log::info!(
            "Rendering {} frames of {} ({:?} sampler)",
            total,
            self.effect.display_name(),
            kind
        );
        let duration = config.duration_seconds as f32;
        let mut frame_packer = FramePacker::new(&job.index);

        for frame in job.frames.iter() {
            job.control.checkpoint()?;

            let uniforms = self.effect.at_frame(frame.frame_number as u32, frame.timestamp);
            let time_sync = TimeSync::new(frame.timestamp as f32, duration);
            gpu.queue.write_buffer(&uniform_buffer, 0, bytemuck::bytes_of(&uniforms));
            gpu.queue.write_buffer(&time_buffer, 0, bytemuck::bytes_of(&time_sync));
            if let Some(buffer) = &frame_buffer {
                let texels = frame_packer.pack(frame);
                gpu.queue.write_buffer(buffer, 0, bytemuck::cast_slice(texels));
            }

            let pixels = frame_renderer.render_and_readback(&gpu, &pipeline.pipeline, &bind_group)?;
            encoder.write_frame(&pixels)?;
            job.control.report_frame(frame.frame_number + 1, total);
        }

        Ok(())
    }

    fn encode(&mut self, job: &RenderJob) -> Result<OutputRef> {
        job.control.checkpoint()?;
        let encoder = self.encoder.take().context("render did not run")?;
        job.control.report(0.0, "finalizing video");
        encoder.finish(job.control.cancel_flag())?;
        job.control.report(1.0, "video written");
        Ok(OutputRef(self.output.clone()))
    }

    fn abort(&mut self) {
        if let Some(mut encoder) = self.encoder.take() {
            encoder.kill();
            if self.output.exists() {
                if let Err(err) = std::fs::remove_file(&self.output) {
                    log::warn!("Failed to remove {}: {}", self.output.display(), err);
                }
            }
        }
    }
}
