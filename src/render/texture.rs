use wgpu;

use super::gpu::GpuContext;
use crate::export::precompute::FrameRecord;
use crate::features::index::{rows_for, FeatureIndex, ValueRange};
use crate::features::packer::PackedFeatureBuffer;

pub const FEATURE_TEXTURE_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba32Float;

/// GPU copy of a `PackedFeatureBuffer`, bound at @binding(2) for the live
/// sampler. Recreated when the buffer changes size, otherwise rewritten in place.
pub struct FeatureTexture {
    pub texture: wgpu::Texture,
    pub view: wgpu::TextureView,
    width: u32,
    height: u32,
}

impl FeatureTexture {
    pub fn new(gpu: &GpuContext, buffer: &PackedFeatureBuffer) -> Self {
        let width = buffer.width().max(1) as u32;
        let height = buffer.height().max(1) as u32;
        let texture = gpu.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("feature_texture"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: FEATURE_TEXTURE_FORMAT,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let feature_texture = Self {
            texture,
            view,
            width,
            height,
        };
        feature_texture.upload(gpu, buffer);
        feature_texture
    }

    pub fn matches(&self, buffer: &PackedFeatureBuffer) -> bool {
        self.width == buffer.width() as u32 && self.height == buffer.height() as u32
    }

    pub fn upload(&self, gpu: &GpuContext, buffer: &PackedFeatureBuffer) {
        if buffer.width() == 0 || buffer.height() == 0 || !self.matches(buffer) {
            log::debug!("Skipping feature upload for {}x{} buffer", buffer.width(), buffer.height());
            return;
        }
        gpu.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &self.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            buffer.as_bytes(),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(buffer.bytes_per_row() as u32),
                rows_per_image: Some(self.height),
            },
            wgpu::Extent3d {
                width: self.width,
                height: self.height,
                depth_or_array_layers: 1,
            },
        );
    }
}

/// Storage-buffer contents for exported frames: normalized values laid out
/// by the index, four per texel, same as one time column of the texture.
/// Keys and slots are resolved once per job; the texel buffer is reused.
pub struct FramePacker {
    slots: Vec<(String, usize, usize, ValueRange)>,
    texels: Vec<[f32; 4]>,
}

impl FramePacker {
    pub fn new(index: &FeatureIndex) -> Self {
        let slots = index
            .entries()
            .iter()
            .map(|e| (e.key(), e.row(), e.channel(), e.value_range))
            .collect();
        Self {
            slots,
            texels: vec![[0.0f32; 4]; rows_for(index.capacity()).max(1)],
        }
    }

    pub fn pack(&mut self, frame: &FrameRecord) -> &[[f32; 4]] {
        self.texels.fill([0.0; 4]);
        for (key, row, channel, range) in &self.slots {
            if let Some(texel) = self.texels.get_mut(*row) {
                texel[*channel] = range.normalize(frame.feature(key));
            }
        }
        &self.texels
    }
}
