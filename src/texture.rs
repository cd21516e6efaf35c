//! Fixed-capacity texture array backing the tile residency pool.
//!
//! Layer bookkeeping (free pool, allocation count) lives CPU-side so the
//! residency logic runs headlessly; attach a GPU context to get real
//! uploads into a 2D array texture, one layer per resident tile.

use std::sync::Arc;

use wgpu::{
    Extent3d, ImageCopyTexture, ImageDataLayout, Origin3d, Sampler, SamplerDescriptor, Texture,
    TextureDescriptor, TextureDimension, TextureFormat, TextureUsages, TextureView,
    TextureViewDescriptor,
};

use crate::error::{PlanetError, PlanetResult};
use crate::tile::TileSample;

/// Shared handles to the device and queue the tile textures live on.
#[derive(Clone)]
pub struct GpuContext {
    pub device: Arc<wgpu::Device>,
    pub queue: Arc<wgpu::Queue>,
}

struct GpuBacking {
    ctx: GpuContext,
    texture: Texture,
    view: TextureView,
    sampler: Sampler,
}

/// One texture array per data channel. Layers form a free pool; a layer is
/// held by exactly one resident tile at a time.
pub struct TileTextureArray {
    capacity: u32,
    resolution: u32,
    format: TextureFormat,
    bytes_per_texel: u32,
    free_layers: Vec<u32>,
    gpu: Option<GpuBacking>,
}

impl TileTextureArray {
    pub fn new(capacity: u32, resolution: u32, format: TextureFormat, bytes_per_texel: u32) -> Self {
        assert!(capacity > 0, "texture array needs at least one layer");
        Self {
            capacity,
            resolution,
            format,
            bytes_per_texel,
            free_layers: (0..capacity).rev().collect(),
            gpu: None,
        }
    }

    /// Array sized for the sample type of one channel.
    pub fn for_samples<T: TileSample>(capacity: u32, resolution: u32) -> Self {
        Self::new(capacity, resolution, T::TEXTURE_FORMAT, T::BYTES_PER_TEXEL)
    }

    /// Create the GPU texture; uploads are no-ops until this is called.
    pub fn attach_gpu(&mut self, ctx: GpuContext) {
        let texture = ctx.device.create_texture(&TextureDescriptor {
            label: Some("planet-tile-array"),
            size: Extent3d {
                width: self.resolution,
                height: self.resolution,
                depth_or_array_layers: self.capacity,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: TextureDimension::D2,
            format: self.format,
            usage: TextureUsages::TEXTURE_BINDING | TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&TextureViewDescriptor::default());
        let sampler = ctx.device.create_sampler(&SamplerDescriptor {
            label: Some("planet-tile-array-sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Nearest,
            min_filter: wgpu::FilterMode::Nearest,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });
        self.gpu = Some(GpuBacking {
            ctx,
            texture,
            view,
            sampler,
        });
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn resolution(&self) -> u32 {
        self.resolution
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }

    /// Number of layers currently handed out.
    pub fn allocated_layers(&self) -> u32 {
        self.capacity - self.free_layers.len() as u32
    }

    /// Take a layer from the free pool, or `None` under pool pressure.
    pub fn allocate(&mut self) -> Option<u32> {
        self.free_layers.pop()
    }

    /// Return a layer to the free pool.
    pub fn release(&mut self, layer: u32) {
        debug_assert!(layer < self.capacity);
        debug_assert!(!self.free_layers.contains(&layer), "layer double free");
        self.free_layers.push(layer);
    }

    /// Upload encoded texels into `layer`. The caller must hold the layer.
    pub fn upload(&mut self, layer: u32, texels: &[u8]) -> PlanetResult<()> {
        let expected = (self.resolution * self.resolution * self.bytes_per_texel) as usize;
        if texels.len() != expected {
            return Err(PlanetError::upload(format!(
                "texel length mismatch: got {}, expected {}",
                texels.len(),
                expected
            )));
        }
        if layer >= self.capacity {
            return Err(PlanetError::upload(format!(
                "layer {} out of range (capacity {})",
                layer, self.capacity
            )));
        }

        if let Some(gpu) = &self.gpu {
            gpu.ctx.queue.write_texture(
                ImageCopyTexture {
                    texture: &gpu.texture,
                    mip_level: 0,
                    origin: Origin3d {
                        x: 0,
                        y: 0,
                        z: layer,
                    },
                    aspect: wgpu::TextureAspect::All,
                },
                texels,
                ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(self.resolution * self.bytes_per_texel),
                    rows_per_image: Some(self.resolution),
                },
                Extent3d {
                    width: self.resolution,
                    height: self.resolution,
                    depth_or_array_layers: 1,
                },
            );
        }
        Ok(())
    }

    pub fn view(&self) -> Option<&TextureView> {
        self.gpu.as_ref().map(|g| &g.view)
    }

    pub fn sampler(&self) -> Option<&Sampler> {
        self.gpu.as_ref().map(|g| &g.sampler)
    }
}
