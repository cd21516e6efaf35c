//! Tile payloads: square sample grids plus their min/max reduction pyramid.
//!
//! A tile stores either elevation samples (`f32`) or surface color samples
//! ([`Rgb8`]); the sample type decides the data channel and the texture
//! format at compile time.

use bytemuck::{Pod, Zeroable};
use crate::error::{PlanetError, PlanetResult};
use crate::healpix::TileId;

/// The two data channels a tile pyramid can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TileDataType {
    Elevation,
    Color,
}

/// Sample types storable in a [`Tile`].
///
/// Maps a sample type to its channel kind and texture encoding. Implemented
/// for `f32` (elevation) and [`Rgb8`] (color); adding a type means deciding
/// both how it reduces and how it uploads.
pub trait TileSample: Copy + Default + Send + Sync + 'static {
    const DATA_TYPE: TileDataType;
    const TEXTURE_FORMAT: wgpu::TextureFormat;
    /// Bytes per texel after [`TileSample::write_texels`] encoding.
    const BYTES_PER_TEXEL: u32;

    /// Scalar projection used by the reduction pyramid.
    fn scalar(self) -> f32;

    /// Append the texture encoding of `samples` to `out`.
    fn write_texels(samples: &[Self], out: &mut Vec<u8>);
}

impl TileSample for f32 {
    const DATA_TYPE: TileDataType = TileDataType::Elevation;
    const TEXTURE_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::R32Float;
    const BYTES_PER_TEXEL: u32 = 4;

    fn scalar(self) -> f32 {
        self
    }

    fn write_texels(samples: &[Self], out: &mut Vec<u8>) {
        out.extend_from_slice(bytemuck::cast_slice(samples));
    }
}

/// An 8-bit RGB color sample. Uploaded as RGBA8 with opaque alpha.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct Rgb8 {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb8 {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

impl TileSample for Rgb8 {
    const DATA_TYPE: TileDataType = TileDataType::Color;
    const TEXTURE_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;
    const BYTES_PER_TEXEL: u32 = 4;

    /// Rec. 709 luma, normalized to [0, 1].
    fn scalar(self) -> f32 {
        (0.2126 * self.r as f32 + 0.7152 * self.g as f32 + 0.0722 * self.b as f32) / 255.0
    }

    fn write_texels(samples: &[Self], out: &mut Vec<u8>) {
        out.reserve(samples.len() * 4);
        for s in samples {
            out.extend_from_slice(&[s.r, s.g, s.b, 255]);
        }
    }
}

/// Per-tile reduction hierarchy storing (min, max) at progressively coarser
/// scales, down to a single cell, plus the sample-weighted average computed
/// once at build time.
#[derive(Debug, Clone)]
pub struct MinMaxPyramid {
    /// Reduction levels, finest first; the last level is a single cell.
    levels: Vec<Vec<(f32, f32)>>,
    /// Side length of each reduction level.
    sizes: Vec<u32>,
    average: f32,
}

impl MinMaxPyramid {
    pub fn new<T: TileSample>(samples: &[T], resolution: u32) -> Self {
        debug_assert_eq!(samples.len(), (resolution * resolution) as usize);

        let mut sum = 0.0_f64;
        let mut base: Vec<(f32, f32)> = Vec::with_capacity(samples.len());
        for s in samples {
            let v = s.scalar();
            sum += v as f64;
            base.push((v, v));
        }
        let average = if samples.is_empty() {
            0.0
        } else {
            (sum / samples.len() as f64) as f32
        };

        let mut levels = Vec::new();
        let mut sizes = Vec::new();
        let mut current = base;
        let mut size = resolution;
        while size > 1 {
            let reduced_size = size.div_ceil(2);
            let mut reduced = vec![(f32::MAX, f32::MIN); (reduced_size * reduced_size) as usize];
            for y in 0..size {
                for x in 0..size {
                    let (lo, hi) = current[(y * size + x) as usize];
                    let cell = &mut reduced[((y / 2) * reduced_size + x / 2) as usize];
                    cell.0 = cell.0.min(lo);
                    cell.1 = cell.1.max(hi);
                }
            }
            levels.push(reduced.clone());
            sizes.push(reduced_size);
            current = reduced;
            size = reduced_size;
        }

        if levels.is_empty() {
            // 1x1 tile: the single sample is its own reduction
            levels.push(current);
            sizes.push(1);
        }

        Self {
            levels,
            sizes,
            average,
        }
    }

    /// Minimum sample value of the whole tile.
    pub fn min(&self) -> f32 {
        self.top().0
    }

    /// Maximum sample value of the whole tile.
    pub fn max(&self) -> f32 {
        self.top().1
    }

    /// Sample-weighted mean of the whole tile, fixed at build time.
    pub fn average(&self) -> f32 {
        self.average
    }

    /// Number of reduction levels (the base grid is not stored).
    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    /// (min, max) cells of reduction level `i` with its side length;
    /// level 0 is the finest reduction.
    pub fn level(&self, i: usize) -> (&[(f32, f32)], u32) {
        (&self.levels[i], self.sizes[i])
    }

    fn top(&self) -> (f32, f32) {
        *self
            .levels
            .last()
            .and_then(|l| l.first())
            .expect("pyramid always has a top cell")
    }
}

/// Immutable payload of one tile: a square grid of samples and its
/// reduction pyramid. Samples are set once when the source completes the
/// tile and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct Tile<T: TileSample> {
    id: TileId,
    resolution: u32,
    samples: Vec<T>,
    pyramid: MinMaxPyramid,
}

impl<T: TileSample> Tile<T> {
    pub fn new(id: TileId, resolution: u32, samples: Vec<T>) -> PlanetResult<Self> {
        let expected = (resolution * resolution) as usize;
        if samples.len() != expected {
            return Err(PlanetError::source(format!(
                "sample length mismatch for {:?}: got {}, expected {}",
                id,
                samples.len(),
                expected
            )));
        }
        let pyramid = MinMaxPyramid::new(&samples, resolution);
        Ok(Self {
            id,
            resolution,
            samples,
            pyramid,
        })
    }

    pub fn id(&self) -> TileId {
        self.id
    }

    pub fn level(&self) -> i32 {
        self.id.level
    }

    pub fn resolution(&self) -> u32 {
        self.resolution
    }

    pub fn samples(&self) -> &[T] {
        &self.samples
    }

    pub fn pyramid(&self) -> &MinMaxPyramid {
        &self.pyramid
    }

    pub fn data_type(&self) -> TileDataType {
        T::DATA_TYPE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pyramid_min_max_avg() {
        let samples: Vec<f32> = (0..16).map(|i| i as f32).collect();
        let pyramid = MinMaxPyramid::new(&samples, 4);

        assert_eq!(pyramid.min(), 0.0);
        assert_eq!(pyramid.max(), 15.0);
        assert!((pyramid.average() - 7.5).abs() < 1e-6);
        // 4 -> 2 -> 1
        assert_eq!(pyramid.level_count(), 2);
    }

    #[test]
    fn test_pyramid_odd_resolution() {
        let samples = vec![2.5_f32; 25];
        let pyramid = MinMaxPyramid::new(&samples, 5);

        assert_eq!(pyramid.min(), 2.5);
        assert_eq!(pyramid.max(), 2.5);
        // 5 -> 3 -> 2 -> 1
        assert_eq!(pyramid.level_count(), 3);
        let (top, size) = pyramid.level(2);
        assert_eq!(size, 1);
        assert_eq!(top.len(), 1);
    }

    #[test]
    fn test_pyramid_first_reduction_cells() {
        #[rustfmt::skip]
        let samples: Vec<f32> = vec![
            1.0, 2.0, 8.0, 9.0,
            3.0, 4.0, 6.0, 7.0,
            0.0, 0.0, 5.0, 5.0,
            0.0, 0.0, 5.0, 5.0,
        ];
        let pyramid = MinMaxPyramid::new(&samples, 4);
        let (cells, size) = pyramid.level(0);
        assert_eq!(size, 2);
        assert_eq!(cells[0], (1.0, 4.0));
        assert_eq!(cells[1], (6.0, 9.0));
        assert_eq!(cells[2], (0.0, 0.0));
        assert_eq!(cells[3], (5.0, 5.0));
    }

    #[test]
    fn test_tile_rejects_wrong_sample_count() {
        let r = Tile::<f32>::new(TileId::root_id(0), 4, vec![0.0; 15]);
        assert!(r.is_err());
    }

    #[test]
    fn test_color_scalar_is_luma() {
        assert_eq!(Rgb8::new(0, 0, 0).scalar(), 0.0);
        assert!((Rgb8::new(255, 255, 255).scalar() - 1.0).abs() < 1e-6);
        assert!(Rgb8::new(0, 255, 0).scalar() > Rgb8::new(255, 0, 0).scalar());
    }

    #[test]
    fn test_texel_encoding() {
        let mut out = Vec::new();
        f32::write_texels(&[1.0_f32], &mut out);
        assert_eq!(out, 1.0_f32.to_le_bytes());

        out.clear();
        Rgb8::write_texels(&[Rgb8::new(10, 20, 30)], &mut out);
        assert_eq!(out, [10, 20, 30, 255]);
    }
}
