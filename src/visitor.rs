//! Joint LOD/culling traversal of the elevation and imagery quad trees.
//!
//! Walks both trees in lockstep each frame and produces four lists: tile
//! ids to load per channel and resident tiles to draw per channel. The
//! traversal uses a preallocated per-level state stack instead of
//! recursion; overflowing it means the addressing scheme was violated and
//! is a programmer error.

use glam::{DMat3, DMat4, DVec3, IVec4};

use crate::bounds::{box_front_facing, BoundingBox, Frustum};
use crate::config::PlanetParameters;
use crate::healpix::{TileId, MAX_TREE_DEPTH, NUM_ROOTS};
use crate::manager::TreeManager;
use crate::tile::{Rgb8, TileSample};
use crate::tree::{NodeId, RenderFlags};

/// A tile selected for drawing this frame. Entries in the DEM and IMG
/// render lists are positionally paired while both channels are active.
#[derive(Debug, Clone, Copy)]
pub struct RenderEntry {
    pub node: NodeId,
    pub tile_id: TileId,
    pub texture_layer: i32,
    pub bounds: BoundingBox,
}

/// Derived per-frame data for refinement decisions.
#[derive(Debug, Clone, Copy, Default)]
struct LodData {
    frustum_es: Frustum,
}

/// Derived per-frame data for visibility decisions.
#[derive(Debug, Clone, Copy, Default)]
struct CullData {
    frustum_ms: Frustum,
    mat_n: DMat3,
    cam_pos: DVec3,
}

/// Traversal state for one tree level. Render-data links fall back to the
/// parent's when a channel has no node at this level, so a shallower
/// channel keeps drawing its deepest available ancestor.
#[derive(Debug, Clone, Copy, Default)]
struct LodState {
    node_dem: Option<NodeId>,
    node_img: Option<NodeId>,
    rd_dem: Option<NodeId>,
    rd_img: Option<NodeId>,
}

struct WorkItem {
    dem: NodeId,
    img: Option<NodeId>,
    level: usize,
}

pub struct LodVisitor {
    viewport: IVec4,
    mat_vm: DMat4,
    mat_p: DMat4,
    lod_data: LodData,
    cull_data: CullData,
    stack: Vec<LodState>,
    load_dem: Vec<TileId>,
    load_img: Vec<TileId>,
    render_dem: Vec<RenderEntry>,
    render_img: Vec<RenderEntry>,
    frame_count: i32,
    update_lod: bool,
    update_culling: bool,
}

impl Default for LodVisitor {
    fn default() -> Self {
        Self::new()
    }
}

impl LodVisitor {
    /// Initial capacity of the load/render lists; they grow as needed but
    /// this keeps steady-state frames allocation-free.
    const PRE_ALLOC: usize = 200;

    pub fn new() -> Self {
        Self {
            viewport: IVec4::ZERO,
            mat_vm: DMat4::IDENTITY,
            mat_p: DMat4::IDENTITY,
            lod_data: LodData::default(),
            cull_data: CullData::default(),
            stack: vec![LodState::default(); MAX_TREE_DEPTH],
            load_dem: Vec::with_capacity(Self::PRE_ALLOC),
            load_img: Vec::with_capacity(Self::PRE_ALLOC),
            render_dem: Vec::with_capacity(Self::PRE_ALLOC),
            render_img: Vec::with_capacity(Self::PRE_ALLOC),
            frame_count: 0,
            update_lod: true,
            update_culling: true,
        }
    }

    pub fn frame_count(&self) -> i32 {
        self.frame_count
    }

    pub fn set_frame_count(&mut self, frame_count: i32) {
        self.frame_count = frame_count;
    }

    pub fn viewport(&self) -> IVec4 {
        self.viewport
    }

    pub fn set_viewport(&mut self, viewport: IVec4) {
        self.viewport = viewport;
    }

    pub fn modelview(&self) -> DMat4 {
        self.mat_vm
    }

    pub fn set_modelview(&mut self, m: DMat4) {
        self.mat_vm = m;
    }

    pub fn projection(&self) -> DMat4 {
        self.mat_p
    }

    pub fn set_projection(&mut self, m: DMat4) {
        self.mat_p = m;
    }

    /// Controls whether refinement decisions use fresh matrices. Must have
    /// been enabled for at least one completed frame before it may be
    /// cleared, otherwise the cached data is uninitialized.
    pub fn set_update_lod(&mut self, enable: bool) {
        self.update_lod = enable;
    }

    pub fn update_lod(&self) -> bool {
        self.update_lod
    }

    /// Controls whether culling decisions use fresh matrices; same
    /// precondition as [`LodVisitor::set_update_lod`].
    pub fn set_update_culling(&mut self, enable: bool) {
        self.update_culling = enable;
    }

    pub fn update_culling(&self) -> bool {
        self.update_culling
    }

    /// Elevation tiles whose parents lack the resolution for the current
    /// view and should be loaded.
    pub fn load_dem(&self) -> &[TileId] {
        &self.load_dem
    }

    /// Imagery tiles that should be loaded.
    pub fn load_img(&self) -> &[TileId] {
        &self.load_img
    }

    /// Elevation tiles selected for drawing this frame.
    pub fn render_dem(&self) -> &[RenderEntry] {
        &self.render_dem
    }

    /// Imagery tiles selected for drawing this frame.
    pub fn render_img(&self) -> &[RenderEntry] {
        &self.render_img
    }

    /// Camera position in model space as derived for the current culling
    /// data.
    pub fn camera_position(&self) -> DVec3 {
        self.cull_data.cam_pos
    }

    /// Normal matrix (inverse transpose of the model-view rotation) as
    /// derived for the current culling data.
    pub fn normal_matrix(&self) -> DMat3 {
        self.cull_data.mat_n
    }

    /// Traverse both trees and fill the load/render lists. Returns `false`
    /// without traversing when any root of an attached tree is missing; the
    /// missing roots are placed on the load lists instead.
    pub fn visit(
        &mut self,
        params: &PlanetParameters,
        dem: &mut TreeManager<f32>,
        mut img: Option<&mut TreeManager<Rgb8>>,
    ) -> bool {
        if !self.pre_traverse(dem, img.as_deref()) {
            return false;
        }

        // Proxy sphere for horizon culling: conservatively the smallest
        // radius lowered by the deepest elevation of any base patch.
        let mut min_height = f32::MAX;
        for i in 0..NUM_ROOTS {
            let root = dem.tree().root(i).expect("checked in pre_traverse");
            let node = dem.tree().node(root).expect("root links are valid");
            min_height = min_height.min(node.tile().pyramid().min());
        }
        let proxy_radius =
            params.radii.min_element() + min_height as f64 * params.height_scale;

        for i in 0..NUM_ROOTS {
            let root_dem = dem.tree().root(i).expect("checked in pre_traverse");
            let root_img = img.as_deref().and_then(|m| m.tree().root(i));
            self.visit_subtree(params, proxy_radius, dem, img.as_deref_mut(), root_dem, root_img);
        }

        true
    }

    /// Refresh derived frame data, clear the output lists and verify all
    /// twelve roots are present in each attached tree.
    fn pre_traverse(
        &mut self,
        dem: &TreeManager<f32>,
        img: Option<&TreeManager<Rgb8>>,
    ) -> bool {
        if self.update_lod {
            self.lod_data = LodData {
                frustum_es: Frustum::from_matrix(&self.mat_p),
            };
        }

        if self.update_culling {
            let cam_pos = self.mat_vm.inverse().col(3).truncate();
            self.cull_data = CullData {
                frustum_ms: Frustum::from_matrix(&(self.mat_p * self.mat_vm)),
                mat_n: DMat3::from_mat4(self.mat_vm).inverse().transpose(),
                cam_pos,
            };
        }

        self.load_dem.clear();
        self.load_img.clear();
        self.render_dem.clear();
        self.render_img.clear();

        let mut result = true;
        for i in 0..NUM_ROOTS {
            if dem.tree().root(i).is_none() {
                self.load_dem.push(TileId::root_id(i as u8));
                result = false;
            }
            if let Some(img) = img {
                if img.tree().root(i).is_none() {
                    self.load_img.push(TileId::root_id(i as u8));
                    result = false;
                }
            }
        }
        result
    }

    fn visit_subtree(
        &mut self,
        params: &PlanetParameters,
        proxy_radius: f64,
        dem: &mut TreeManager<f32>,
        mut img: Option<&mut TreeManager<Rgb8>>,
        root_dem: NodeId,
        root_img: Option<NodeId>,
    ) {
        let mut work: Vec<WorkItem> = Vec::with_capacity(MAX_TREE_DEPTH * 3 + 1);
        work.push(WorkItem {
            dem: root_dem,
            img: root_img,
            level: 0,
        });

        while let Some(item) = work.pop() {
            assert!(
                item.level < MAX_TREE_DEPTH,
                "tile tree deeper than the traversal stack"
            );

            // Fetch render data for this level and stamp it as used; the
            // stamp is the only signal that keeps the tile resident. A
            // channel without a node here inherits the parent's link.
            let rd_dem = {
                if let Some(rd) = dem.render_data_mut(item.dem) {
                    rd.touch(self.frame_count);
                    rd.flags.remove(RenderFlags::RENDER);
                    Some(item.dem)
                } else if item.level == 0 {
                    None
                } else {
                    self.stack[item.level - 1].rd_dem
                }
            };
            let rd_img = match (img.as_deref_mut(), item.img) {
                (Some(m), Some(node)) => {
                    if let Some(rd) = m.render_data_mut(node) {
                        rd.touch(self.frame_count);
                        Some(node)
                    } else {
                        None
                    }
                }
                (Some(_), None) if item.level > 0 => self.stack[item.level - 1].rd_img,
                _ => None,
            };
            self.stack[item.level] = LodState {
                node_dem: Some(item.dem),
                node_img: item.img,
                rd_dem,
                rd_img,
            };

            let tile_id = dem
                .tree()
                .node(item.dem)
                .expect("traversed node left the tree mid-frame")
                .id();
            let bounds = rd_dem
                .and_then(|n| dem.render_data(n))
                .expect("visited level has no elevation render data")
                .bounds;

            if !self.test_visible(proxy_radius, &bounds) {
                continue;
            }

            let descend = if self.test_need_refine(params, &bounds, tile_id) {
                self.handle_refine(params, dem, img.as_deref_mut(), item.level)
            } else {
                self.draw_level(dem, img.as_deref_mut(), item.level);
                false
            };

            if descend {
                let dem_children = dem
                    .tree()
                    .node(item.dem)
                    .expect("traversed node left the tree mid-frame")
                    .children();
                let img_children = match (img.as_deref(), item.img) {
                    (Some(m), Some(node)) => m
                        .tree()
                        .node(node)
                        .map(|n| n.children())
                        .unwrap_or([None; 4]),
                    _ => [None; 4],
                };
                for k in (0..4).rev() {
                    work.push(WorkItem {
                        dem: dem_children[k].expect("refinement requires resident children"),
                        img: img_children[k],
                        level: item.level + 1,
                    });
                }
            }
        }
    }

    /// Frustum test followed by the horizon test, both against the
    /// elevation bounds (imagery inherits them through the state stack).
    fn test_visible(&self, proxy_radius: f64, bounds: &BoundingBox) -> bool {
        self.cull_data.frustum_ms.contains_box(bounds)
            && box_front_facing(self.cull_data.cam_pos, proxy_radius, bounds)
    }

    /// Refine when the angle subtended by the tile's bounding box exceeds
    /// the threshold share of the field of view. The solid angle is
    /// estimated as the maximum angle between the view ray to the box
    /// center and the rays to its eight corners.
    fn test_need_refine(
        &self,
        params: &PlanetParameters,
        bounds: &BoundingBox,
        tile_id: TileId,
    ) -> bool {
        let cam = self.cull_data.cam_pos;
        let center_dir = (bounds.center() - cam).normalize();

        let mut max_angle = 0.0_f64;
        for corner in bounds.corners() {
            let dir = (corner - cam).normalize();
            let angle = dir.dot(center_dir).clamp(-1.0, 1.0).acos();
            max_angle = max_angle.max(angle);
        }

        let fov = self
            .lod_data
            .frustum_es
            .horizontal_fov()
            .max(self.lod_data.frustum_es.vertical_fov());
        let ratio = max_angle / fov * params.lod_factor;

        let mut result = ratio > 10.0;
        if params.min_level > tile_id.level {
            result = true;
        }
        result
    }

    /// Decide whether refinement is possible. Children of the active
    /// channels must all be resident on the GPU to descend; otherwise the
    /// missing ones are queued for loading and this level is drawn.
    fn handle_refine(
        &mut self,
        params: &PlanetParameters,
        dem: &mut TreeManager<f32>,
        img: Option<&mut TreeManager<Rgb8>>,
        level: usize,
    ) -> bool {
        let state = self.stack[level];
        let dem_ok = state
            .node_dem
            .map(|n| children_available(dem, n))
            .unwrap_or(false);

        match img {
            Some(img) => {
                let img_ok = state
                    .node_img
                    .map(|n| children_available(img, n))
                    .unwrap_or(false);

                if !dem_ok {
                    add_load_children(params, dem, state.node_dem, self.frame_count, &mut self.load_dem);
                }
                if !img_ok {
                    add_load_children(params, img, state.node_img, self.frame_count, &mut self.load_img);
                }

                if dem_ok && img_ok {
                    true
                } else {
                    // draw at the coarser level while the children load
                    self.draw_level(dem, Some(img), level);
                    false
                }
            }
            None => {
                if dem_ok {
                    true
                } else {
                    add_load_children(params, dem, state.node_dem, self.frame_count, &mut self.load_dem);
                    self.draw_level(dem, None, level);
                    false
                }
            }
        }
    }

    /// Emit the current level's render data to the output lists.
    fn draw_level(
        &mut self,
        dem: &mut TreeManager<f32>,
        img: Option<&mut TreeManager<Rgb8>>,
        level: usize,
    ) {
        let state = self.stack[level];

        let node_id = state.rd_dem.expect("drawn level lacks elevation data");
        {
            let rd = dem
                .render_data_mut(node_id)
                .expect("drawn node left the tree mid-frame");
            rd.flags.insert(RenderFlags::RENDER);
        }
        let node = dem.tree().node(node_id).expect("drawn node is resident");
        self.render_dem.push(RenderEntry {
            node: node_id,
            tile_id: node.id(),
            texture_layer: node.render_data().texture_layer,
            bounds: node.render_data().bounds,
        });

        if let Some(img) = img {
            let node_id = state.rd_img.expect("drawn level lacks imagery data");
            let node = img.tree().node(node_id).expect("drawn node is resident");
            self.render_img.push(RenderEntry {
                node: node_id,
                tile_id: node.id(),
                texture_layer: node.render_data().texture_layer,
                bounds: node.render_data().bounds,
            });
        }
    }
}

/// A node can be refined iff all four children exist and sit on the GPU.
fn children_available<T: TileSample>(mgr: &TreeManager<T>, node: NodeId) -> bool {
    let Some(node) = mgr.tree().node(node) else {
        return false;
    };
    (0..4).all(|k| {
        node.child(k)
            .and_then(|c| mgr.tree().node(c))
            .map(|c| c.render_data().texture_layer >= 0)
            .unwrap_or(false)
    })
}

/// Queue the missing children of `node` for loading. Children that are
/// already present get stamped so they survive while their siblings load.
fn add_load_children<T: TileSample>(
    params: &PlanetParameters,
    mgr: &mut TreeManager<T>,
    node: Option<NodeId>,
    frame: i32,
    out: &mut Vec<TileId>,
) {
    let Some(node_id) = node else { return };
    let Some(node) = mgr.tree().node(node_id) else {
        return;
    };
    if node.level() >= params.max_level {
        return;
    }
    let tile_id = node.id();
    let children = node.children();
    for (k, child) in children.iter().enumerate() {
        match child {
            None => out.push(tile_id.child(k)),
            Some(c) => mgr.touch(*c, frame),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{ImmediateTileSource, ProceduralElevation, ProceduralColor};
    use std::sync::Arc;

    fn dem_manager() -> TreeManager<f32> {
        let mut mgr = TreeManager::<f32>::new("DEM", 4, 64);
        mgr.set_source(Some(Box::new(ImmediateTileSource::new(
            Arc::new(ProceduralElevation::new(0.0)),
            4,
        ))));
        mgr
    }

    fn img_manager() -> TreeManager<Rgb8> {
        let mut mgr = TreeManager::<Rgb8>::new("IMG", 4, 64);
        mgr.set_source(Some(Box::new(ImmediateTileSource::new(Arc::new(ProceduralColor), 4))));
        mgr
    }

    fn camera(distance: f64) -> (DMat4, DMat4) {
        let view = DMat4::look_at_rh(DVec3::new(0.0, 0.0, distance), DVec3::ZERO, DVec3::Y);
        let proj = DMat4::perspective_rh(45.0_f64.to_radians(), 1.0, 0.01, 100.0);
        (view, proj)
    }

    fn frame(
        visitor: &mut LodVisitor,
        params: &PlanetParameters,
        dem: &mut TreeManager<f32>,
        img: Option<&mut TreeManager<Rgb8>>,
        frame_count: i32,
        view: DMat4,
        proj: DMat4,
    ) -> bool {
        dem.set_frame_count(frame_count);
        dem.update(params);
        let mut img = img;
        if let Some(img) = img.as_deref_mut() {
            img.set_frame_count(frame_count);
            img.update(params);
        }
        visitor.set_frame_count(frame_count);
        visitor.set_modelview(view);
        visitor.set_projection(proj);
        visitor.set_viewport(IVec4::new(0, 0, 1024, 1024));
        let ok = visitor.visit(params, dem, img.as_deref_mut());
        let load_dem: Vec<TileId> = visitor.load_dem().to_vec();
        let load_img: Vec<TileId> = visitor.load_img().to_vec();
        dem.request(&load_dem);
        if let Some(img) = img {
            img.request(&load_img);
        }
        ok
    }

    #[test]
    fn test_empty_trees_request_all_roots() {
        let params = PlanetParameters::default();
        let mut dem = dem_manager();
        let mut img = img_manager();
        let mut visitor = LodVisitor::new();
        let (view, proj) = camera(10.0);

        let ok = frame(&mut visitor, &params, &mut dem, Some(&mut img), 1, view, proj);
        assert!(!ok);
        assert_eq!(visitor.load_dem().len(), 12);
        assert_eq!(visitor.load_img().len(), 12);
        assert!(visitor.render_dem().is_empty());
        assert!(visitor.render_img().is_empty());
    }

    #[test]
    fn test_dem_only_traversal_keeps_img_lists_empty() {
        let params = PlanetParameters::default();
        let mut dem = dem_manager();
        let mut visitor = LodVisitor::new();
        let (view, proj) = camera(10.0);

        for f in 1..=3 {
            frame(&mut visitor, &params, &mut dem, None, f, view, proj);
        }
        assert!(!visitor.render_dem().is_empty());
        assert!(visitor.render_img().is_empty());
        assert!(visitor.load_img().is_empty());
    }

    #[test]
    fn test_render_lists_positionally_paired() {
        let params = PlanetParameters::default();
        let mut dem = dem_manager();
        let mut img = img_manager();
        let mut visitor = LodVisitor::new();
        let (view, proj) = camera(10.0);

        for f in 1..=3 {
            frame(&mut visitor, &params, &mut dem, Some(&mut img), f, view, proj);
        }
        assert!(!visitor.render_dem().is_empty());
        assert_eq!(visitor.render_dem().len(), visitor.render_img().len());
        for (d, i) in visitor.render_dem().iter().zip(visitor.render_img()) {
            assert_eq!(d.tile_id, i.tile_id);
            assert!(d.texture_layer >= 0);
            assert!(i.texture_layer >= 0);
        }
    }

    #[test]
    fn test_refinement_forced_below_min_level() {
        let params = PlanetParameters {
            min_level: 1,
            max_level: 1,
            ..Default::default()
        };
        let mut dem = dem_manager();
        let mut visitor = LodVisitor::new();
        let (view, proj) = camera(10.0);

        for f in 1..=4 {
            frame(&mut visitor, &params, &mut dem, None, f, view, proj);
        }
        assert!(!visitor.render_dem().is_empty());
        for entry in visitor.render_dem() {
            assert!(entry.tile_id.level >= 1, "coarse tile {:?} drawn", entry.tile_id);
        }
    }

    #[test]
    fn test_max_level_caps_load_requests() {
        let params = PlanetParameters {
            lod_factor: 1e4,
            max_level: 2,
            ..Default::default()
        };
        let mut dem = dem_manager();
        let mut visitor = LodVisitor::new();
        let (view, proj) = camera(10.0);

        for f in 1..=8 {
            frame(&mut visitor, &params, &mut dem, None, f, view, proj);
            for id in visitor.load_dem() {
                assert!(id.level <= 2);
            }
        }
        for entry in visitor.render_dem() {
            assert!(entry.tile_id.level <= 2);
        }
    }

    #[test]
    fn test_load_lists_only_name_absent_tiles() {
        let params = PlanetParameters {
            lod_factor: 1e4,
            max_level: 3,
            ..Default::default()
        };
        let mut dem = dem_manager();
        let mut visitor = LodVisitor::new();
        let (view, proj) = camera(10.0);

        for f in 1..=4 {
            frame(&mut visitor, &params, &mut dem, None, f, view, proj);
            for id in visitor.load_dem() {
                assert!(dem.tree().find_node(*id).is_none());
            }
        }
    }

    #[test]
    fn test_render_flag_set_on_drawn_nodes() {
        let params = PlanetParameters::default();
        let mut dem = dem_manager();
        let mut visitor = LodVisitor::new();
        let (view, proj) = camera(10.0);

        for f in 1..=2 {
            frame(&mut visitor, &params, &mut dem, None, f, view, proj);
        }
        for entry in visitor.render_dem() {
            let rd = dem.render_data(entry.node).unwrap();
            assert!(rd.flags.contains(RenderFlags::RENDER));
        }
    }
}
