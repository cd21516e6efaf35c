//! Per-frame orchestration of one planetary body.
//!
//! Sequences bounds recomputation, tree updates, the LOD traversal, load
//! request dispatch and rendering through an external [`TileRenderer`].
//! The core never blocks on tile IO; a frame always completes with
//! whatever data is resident.

use std::time::Instant;

use glam::{DMat3, DMat4, DVec3, IVec4};

use crate::config::PlanetParameters;
use crate::healpix::{to_cartesian, TileId};
use crate::manager::TreeManager;
use crate::source::TileSource;
use crate::tile::Rgb8;
use crate::visitor::{LodVisitor, RenderEntry};

/// Matrices and frame bookkeeping handed to the renderer.
#[derive(Debug, Clone, Copy)]
pub struct FrameContext {
    pub frame_count: i32,
    pub world: DMat4,
    pub view: DMat4,
    pub projection: DMat4,
    /// Inverse transpose of the model-view rotation.
    pub normal_matrix: DMat3,
    /// Set for the shadow-map pass, which reuses the last tile selection.
    pub shadow_pass: bool,
}

/// Consumer of the per-frame tile selection. The GPU draw pipeline lives
/// behind this seam; the core only guarantees that every entry it hands
/// over is resident (`texture_layer >= 0`) and carries valid bounds.
pub trait TileRenderer {
    fn render(
        &mut self,
        ctx: &FrameContext,
        dem: &TreeManager<f32>,
        img: Option<&TreeManager<Rgb8>>,
        render_dem: &[RenderEntry],
        render_img: &[RenderEntry],
    );
}

/// Per-tile uniforms the terrain shader needs to reconstruct vertex
/// positions: patch coordinates, projection factors and the ellipsoid
/// positions of the four tile corners.
#[derive(Debug, Clone)]
pub struct TileDrawInfo {
    pub tile_id: TileId,
    pub texture_layer: i32,
    pub root: u8,
    pub x: u64,
    pub y: u64,
    pub n_side: i64,
    pub f1: i32,
    pub f2: i32,
    /// Corner positions on the ellipsoid at zero elevation, in canonical
    /// north/west/south/east order.
    pub corners: [DVec3; 4],
}

/// Build the shader-facing description of one render-list entry.
pub fn draw_info(entry: &RenderEntry, radii: DVec3) -> TileDrawInfo {
    let id = entry.tile_id;
    let (root, x, y) = id.base_xy();
    let corners = id
        .corners_lng_lat()
        .map(|lng_lat| to_cartesian(lng_lat, radii, 0.0));
    TileDrawInfo {
        tile_id: id,
        texture_layer: entry.texture_layer,
        root,
        x,
        y,
        n_side: id.n_side(),
        f1: id.f1(),
        f2: id.f2(),
        corners,
    }
}

/// Reasons parts of the cached state must be rebuilt; each bit is cleared
/// by the frame phase that consumes it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct DirtyFlags(u32);

impl DirtyFlags {
    const TILE_BOUNDS: DirtyFlags = DirtyFlags(1 << 0);

    fn set(&mut self, flag: DirtyFlags) {
        self.0 |= flag.0;
    }

    fn take(&mut self, flag: DirtyFlags) -> bool {
        let set = self.0 & flag.0 != 0;
        self.0 &= !flag.0;
        set
    }
}

/// Running frame statistics, reported through the log every 60 frames.
struct FrameStatistics {
    last_instant: Option<Instant>,
    sum_frame_seconds: f64,
    sum_draw_tiles: usize,
    sum_load_tiles: usize,
    max_draw_tiles: usize,
    max_load_tiles: usize,
}

impl FrameStatistics {
    fn new() -> Self {
        Self {
            last_instant: None,
            sum_frame_seconds: 0.0,
            sum_draw_tiles: 0,
            sum_load_tiles: 0,
            max_draw_tiles: 0,
            max_load_tiles: 0,
        }
    }

    fn update(&mut self, frame_count: i32, draw_tiles: usize, load_tiles: usize) {
        let now = Instant::now();
        if let Some(last) = self.last_instant {
            self.sum_frame_seconds += now.duration_since(last).as_secs_f64();
        }
        self.last_instant = Some(now);

        self.max_draw_tiles = self.max_draw_tiles.max(draw_tiles);
        self.max_load_tiles = self.max_load_tiles.max(load_tiles);
        self.sum_draw_tiles += draw_tiles;
        self.sum_load_tiles += load_tiles;

        if frame_count % 60 == 0 {
            log::debug!(
                "frame {}: avg frame time {:.4}s, avg draw tiles {:.1}, avg load tiles {:.1}, max draw {}, max load {}",
                frame_count,
                self.sum_frame_seconds / 60.0,
                self.sum_draw_tiles as f64 / 60.0,
                self.sum_load_tiles as f64 / 60.0,
                self.max_draw_tiles,
                self.max_load_tiles,
            );
            self.sum_frame_seconds = 0.0;
            self.sum_draw_tiles = 0;
            self.sum_load_tiles = 0;
        }
    }
}

/// One planetary body: two tile pyramids, their residency managers and the
/// traversal that selects what to draw.
pub struct Planet {
    params: PlanetParameters,
    world_transform: DMat4,
    visitor: LodVisitor,
    mgr_dem: TreeManager<f32>,
    mgr_img: TreeManager<Rgb8>,
    frame_count: i32,
    enabled: bool,
    dirty: DirtyFlags,
    stats: FrameStatistics,
}

impl Planet {
    pub fn new(
        params: PlanetParameters,
        dem_resolution: u32,
        img_resolution: u32,
        pool_capacity: u32,
    ) -> Self {
        Self {
            params,
            world_transform: DMat4::IDENTITY,
            visitor: LodVisitor::new(),
            mgr_dem: TreeManager::new("DEM", dem_resolution, pool_capacity),
            mgr_img: TreeManager::new("IMG", img_resolution, pool_capacity),
            frame_count: 0,
            enabled: true,
            dirty: DirtyFlags::default(),
            stats: FrameStatistics::new(),
        }
    }

    /// Drive one frame: refresh bounds if invalidated, integrate and evict
    /// tiles, traverse, dispatch load requests, then hand the selection to
    /// the renderer.
    pub fn draw(
        &mut self,
        renderer: &mut dyn TileRenderer,
        view: DMat4,
        projection: DMat4,
        viewport: IVec4,
    ) {
        if !self.enabled {
            return;
        }

        self.frame_count += 1;
        let frame_count = self.frame_count;

        self.update_statistics(frame_count);
        self.update_tile_bounds();
        self.update_tile_trees(frame_count);
        self.traverse_tile_trees(frame_count, view, projection, viewport);
        self.process_load_requests();
        self.render_tiles(renderer, view, projection, false);
    }

    /// Re-traverse and render for a shadow map without touching bounds or
    /// tree state; tile updates stay with the main pass.
    pub fn draw_for_shadow_map(
        &mut self,
        renderer: &mut dyn TileRenderer,
        view: DMat4,
        projection: DMat4,
        viewport: IVec4,
    ) {
        if !self.enabled {
            return;
        }

        let frame_count = self.frame_count;
        self.traverse_tile_trees(frame_count, view, projection, viewport);
        self.render_tiles(renderer, view, projection, true);
    }

    pub fn set_dem_source(&mut self, source: Option<Box<dyn TileSource<f32>>>) {
        self.mgr_dem.set_source(source);
    }

    pub fn set_img_source(&mut self, source: Option<Box<dyn TileSource<Rgb8>>>) {
        self.mgr_img.set_source(source);
    }

    pub fn params(&self) -> &PlanetParameters {
        &self.params
    }

    pub fn set_radii(&mut self, radii: DVec3) {
        self.params.radii = radii;
        self.dirty.set(DirtyFlags::TILE_BOUNDS);
    }

    pub fn radii(&self) -> DVec3 {
        self.params.radii
    }

    pub fn set_height_scale(&mut self, scale: f64) {
        self.params.height_scale = scale;
        self.dirty.set(DirtyFlags::TILE_BOUNDS);
    }

    pub fn height_scale(&self) -> f64 {
        self.params.height_scale
    }

    pub fn set_lod_factor(&mut self, lod_factor: f64) {
        self.params.lod_factor = lod_factor;
    }

    pub fn lod_factor(&self) -> f64 {
        self.params.lod_factor
    }

    pub fn set_min_level(&mut self, min_level: i32) {
        self.params.min_level = min_level;
    }

    pub fn min_level(&self) -> i32 {
        self.params.min_level
    }

    pub fn set_max_level(&mut self, max_level: i32) {
        self.params.max_level = max_level;
    }

    pub fn max_level(&self) -> i32 {
        self.params.max_level
    }

    pub fn set_world_transform(&mut self, transform: DMat4) {
        self.world_transform = transform;
    }

    pub fn world_transform(&self) -> DMat4 {
        self.world_transform
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn frame_count(&self) -> i32 {
        self.frame_count
    }

    pub fn visitor(&self) -> &LodVisitor {
        &self.visitor
    }

    pub fn visitor_mut(&mut self) -> &mut LodVisitor {
        &mut self.visitor
    }

    pub fn dem_manager(&self) -> &TreeManager<f32> {
        &self.mgr_dem
    }

    pub fn dem_manager_mut(&mut self) -> &mut TreeManager<f32> {
        &mut self.mgr_dem
    }

    pub fn img_manager(&self) -> &TreeManager<Rgb8> {
        &self.mgr_img
    }

    pub fn img_manager_mut(&mut self) -> &mut TreeManager<Rgb8> {
        &mut self.mgr_img
    }

    fn update_statistics(&mut self, frame_count: i32) {
        // read the lists of the previous frame, before the traversal
        // overwrites them
        let draw_tiles = self
            .visitor
            .render_dem()
            .len()
            .max(self.visitor.render_img().len());
        let load_tiles = self.visitor.load_dem().len() + self.visitor.load_img().len();
        self.stats.update(frame_count, draw_tiles, load_tiles);
    }

    fn update_tile_bounds(&mut self) {
        if self.dirty.take(DirtyFlags::TILE_BOUNDS) {
            self.mgr_dem.recompute_bounds(&self.params);
            self.mgr_img.recompute_bounds(&self.params);
        }
    }

    fn update_tile_trees(&mut self, frame_count: i32) {
        if self.mgr_dem.has_source() {
            self.mgr_dem.set_frame_count(frame_count);
            self.mgr_dem.update(&self.params);
        }
        if self.mgr_img.has_source() {
            self.mgr_img.set_frame_count(frame_count);
            self.mgr_img.update(&self.params);
        }
    }

    fn traverse_tile_trees(
        &mut self,
        frame_count: i32,
        view: DMat4,
        projection: DMat4,
        viewport: IVec4,
    ) {
        let Planet {
            visitor,
            mgr_dem,
            mgr_img,
            params,
            world_transform,
            ..
        } = self;

        visitor.set_frame_count(frame_count);
        visitor.set_modelview(view * *world_transform);
        visitor.set_projection(projection);
        visitor.set_viewport(viewport);

        let img = if mgr_img.has_source() {
            Some(&mut *mgr_img)
        } else {
            None
        };
        visitor.visit(params, mgr_dem, img);
    }

    fn process_load_requests(&mut self) {
        let Planet {
            visitor,
            mgr_dem,
            mgr_img,
            ..
        } = self;

        if mgr_dem.has_source() {
            mgr_dem.request(visitor.load_dem());
        }
        if mgr_img.has_source() {
            mgr_img.request(visitor.load_img());
        }
    }

    fn render_tiles(
        &mut self,
        renderer: &mut dyn TileRenderer,
        view: DMat4,
        projection: DMat4,
        shadow_pass: bool,
    ) {
        let modelview = view * self.world_transform;
        let ctx = FrameContext {
            frame_count: self.frame_count,
            world: self.world_transform,
            view,
            projection,
            normal_matrix: DMat3::from_mat4(modelview).inverse().transpose(),
            shadow_pass,
        };

        let img = self
            .mgr_img
            .has_source()
            .then_some(&self.mgr_img);
        renderer.render(
            &ctx,
            &self.mgr_dem,
            img,
            self.visitor.render_dem(),
            self.visitor.render_img(),
        );
    }
}
