//! Tile quad-tree residency manager.
//!
//! One instance per data channel. Bridges an asynchronous [`TileSource`] to
//! the channel's texture array, integrates completed tiles into the quad
//! tree and enforces the bounded residency budget with recency-based
//! eviction.

use std::collections::HashSet;

use crate::bounds::calc_tile_bounds;
use crate::config::PlanetParameters;
use crate::healpix::TileId;
use crate::source::{SourceError, TileSource};
use crate::texture::TileTextureArray;
use crate::tile::{Tile, TileSample};
use crate::tree::{NodeId, RenderData, TileNode, TileQuadTree};

/// Default eviction grace window: a tile untouched for this many frames
/// becomes evictable. Small enough to track the working set, large enough
/// to tolerate selection oscillation at refinement boundaries.
pub const DEFAULT_GRACE_FRAMES: i32 = 3;

pub struct TreeManager<T: TileSample> {
    name: &'static str,
    tree: TileQuadTree<T>,
    textures: TileTextureArray,
    source: Option<Box<dyn TileSource<T>>>,
    /// Ids forwarded to the source and not yet completed.
    pending: HashSet<TileId>,
    /// Ids the source failed permanently; never re-forwarded.
    failed: HashSet<TileId>,
    /// Completions that could not get a texture layer; retried next frame.
    deferred: Vec<Tile<T>>,
    texel_scratch: Vec<u8>,
    resolution: u32,
    frame_count: i32,
    grace_frames: i32,
}

impl<T: TileSample> TreeManager<T> {
    /// `name` labels log output ("DEM"/"IMG"); `pool_capacity` is the layer
    /// count of the channel's texture array.
    pub fn new(name: &'static str, resolution: u32, pool_capacity: u32) -> Self {
        Self {
            name,
            tree: TileQuadTree::new(),
            textures: TileTextureArray::for_samples::<T>(pool_capacity, resolution),
            source: None,
            pending: HashSet::new(),
            failed: HashSet::new(),
            deferred: Vec::new(),
            texel_scratch: Vec::new(),
            resolution,
            frame_count: 0,
            grace_frames: DEFAULT_GRACE_FRAMES,
        }
    }

    /// Attach or detach the tile producer. Detaching drains in-flight
    /// requests and tears down the tree.
    pub fn set_source(&mut self, mut source: Option<Box<dyn TileSource<T>>>) {
        if let Some(mut old) = self.source.take() {
            old.fini();
        }
        self.clear();
        if let Some(src) = source.as_mut() {
            assert_eq!(
                src.resolution(),
                self.resolution,
                "tile source resolution must match the manager"
            );
            src.init();
        }
        self.source = source;
    }

    pub fn has_source(&self) -> bool {
        self.source.is_some()
    }

    /// Timestamp used for `last_used_frame` stamps and eviction decisions.
    pub fn set_frame_count(&mut self, frame: i32) {
        self.frame_count = frame;
    }

    pub fn frame_count(&self) -> i32 {
        self.frame_count
    }

    /// Forward novel ids to the source. Ids already resident, in flight or
    /// permanently failed are ignored, making the call idempotent.
    pub fn request(&mut self, ids: &[TileId]) {
        let Some(source) = self.source.as_mut() else {
            return;
        };
        let mut novel = Vec::new();
        for &id in ids {
            if self.pending.contains(&id) || self.failed.contains(&id) {
                continue;
            }
            if self.tree.find_node(id).is_some() {
                continue;
            }
            self.pending.insert(id);
            novel.push(id);
        }
        if !novel.is_empty() {
            source.request(&novel);
        }
    }

    /// Poll the source, integrate completions into the tree and texture
    /// array, then run the eviction pass.
    pub fn update(&mut self, params: &PlanetParameters) {
        if self.source.is_none() {
            return;
        }

        // completions deferred under pool pressure get the first chance at
        // the layers freed since last frame
        let deferred = std::mem::take(&mut self.deferred);
        for tile in deferred {
            self.pending.remove(&tile.id());
            self.integrate(tile, params);
        }

        let loads = self.source.as_mut().unwrap().poll();
        for load in loads {
            self.pending.remove(&load.id);
            match load.result {
                Ok(tile) => self.integrate(tile, params),
                Err(SourceError::Permanent(msg)) => {
                    log::warn!("[{}] dropping tile {:?}: {}", self.name, load.id, msg);
                    self.failed.insert(load.id);
                }
            }
        }

        self.evict();
    }

    /// RenderData of a node, if the node is still in the tree.
    pub fn render_data(&self, node: NodeId) -> Option<&RenderData> {
        self.tree.node(node).map(|n| n.render_data())
    }

    pub fn render_data_mut(&mut self, node: NodeId) -> Option<&mut RenderData> {
        self.tree.node_mut(node).map(|n| n.render_data_mut())
    }

    /// Stamp a node as used this frame, protecting it from eviction.
    pub fn touch(&mut self, node: NodeId, frame: i32) {
        if let Some(rd) = self.render_data_mut(node) {
            rd.touch(frame);
        }
    }

    pub fn tree(&self) -> &TileQuadTree<T> {
        &self.tree
    }

    pub fn texture_array(&self) -> &TileTextureArray {
        &self.textures
    }

    pub fn texture_array_mut(&mut self) -> &mut TileTextureArray {
        &mut self.textures
    }

    pub fn resident_tile_count(&self) -> usize {
        self.tree.len()
    }

    pub fn resolution(&self) -> u32 {
        self.resolution
    }

    pub fn grace_frames(&self) -> i32 {
        self.grace_frames
    }

    pub fn set_grace_frames(&mut self, frames: i32) {
        self.grace_frames = frames.max(0);
    }

    pub fn is_pending(&self, id: TileId) -> bool {
        self.pending.contains(&id)
    }

    pub fn has_failed(&self, id: TileId) -> bool {
        self.failed.contains(&id)
    }

    /// Recompute every resident node's bounding box from its reduction
    /// pyramid and the current shape parameters.
    pub fn recompute_bounds(&mut self, params: &PlanetParameters) {
        let ids: Vec<NodeId> = self.tree.node_ids().collect();
        for node_id in ids {
            let (tile_id, lo, hi) = {
                let node = self.tree.node(node_id).expect("node vanished mid-pass");
                let pyramid = node.tile().pyramid();
                (node.id(), pyramid.min(), pyramid.max())
            };
            let bounds = calc_tile_bounds(tile_id, lo, hi, params.radii, params.height_scale);
            self.tree
                .node_mut(node_id)
                .expect("node vanished mid-pass")
                .render_data_mut()
                .bounds = bounds;
        }
    }

    fn integrate(&mut self, tile: Tile<T>, params: &PlanetParameters) {
        let id = tile.id();

        if tile.resolution() != self.resolution {
            log::warn!(
                "[{}] dropping tile {:?}: resolution {} does not match channel {}",
                self.name,
                id,
                tile.resolution(),
                self.resolution
            );
            return;
        }

        // duplicate completion of an already-resident tile
        if self.tree.find_node(id).is_some() {
            return;
        }

        // a completion whose parent was evicted while the tile was in
        // flight is discarded; the traversal will re-request it if needed
        let parent = match id.parent() {
            None => None,
            Some(pid) => match self.tree.find_node(pid) {
                Some(p) => Some(p),
                None => {
                    log::trace!("[{}] discarding orphaned tile {:?}", self.name, id);
                    return;
                }
            },
        };

        let layer = match self.textures.allocate() {
            Some(layer) => layer,
            None => {
                // pool pressure: force an eviction pass and retry once
                self.evict();
                match self.textures.allocate() {
                    Some(layer) => layer,
                    None => {
                        log::debug!(
                            "[{}] layer pool exhausted, deferring {:?} to next frame",
                            self.name,
                            id
                        );
                        // deferred tiles count as in flight so re-requests
                        // do not reach the source again
                        self.pending.insert(id);
                        self.deferred.push(tile);
                        return;
                    }
                }
            }
        };

        self.texel_scratch.clear();
        T::write_texels(tile.samples(), &mut self.texel_scratch);
        if let Err(err) = self.textures.upload(layer, &self.texel_scratch) {
            log::warn!("[{}] upload failed for {:?}: {}", self.name, id, err);
            self.textures.release(layer);
            return;
        }

        let bounds = calc_tile_bounds(
            id,
            tile.pyramid().min(),
            tile.pyramid().max(),
            params.radii,
            params.height_scale,
        );
        let mut render_data = RenderData::new(bounds, self.frame_count);
        render_data.texture_layer = layer as i32;
        let node = TileNode::new(tile, render_data);

        match parent {
            None => {
                self.tree.insert_root(node);
            }
            Some(p) => {
                self.tree.insert_child(p, id.child_index(), node);
            }
        }
    }

    /// Post-order eviction pass: a childless non-root node whose stamp has
    /// aged past the grace window releases its layer and is unlinked. An
    /// interior node only becomes evictable once a later pass has removed
    /// all of its children; roots are never evicted.
    fn evict(&mut self) {
        let cutoff = self.frame_count - self.grace_frames;
        let victims: Vec<NodeId> = self
            .tree
            .node_ids()
            .filter(|&node_id| {
                let node = self.tree.node(node_id).expect("node vanished mid-pass");
                node.level() > 0
                    && node.is_leaf()
                    && node.render_data().last_used_frame() < cutoff
            })
            .collect();

        if victims.is_empty() {
            return;
        }

        let count = victims.len();
        for node_id in victims {
            if let Some(node) = self.tree.remove_leaf(node_id) {
                let layer = node.render_data().texture_layer;
                if layer >= 0 {
                    self.textures.release(layer as u32);
                }
            }
        }
        log::trace!("[{}] evicted {} tiles", self.name, count);
    }

    fn clear(&mut self) {
        let ids: Vec<NodeId> = self.tree.node_ids().collect();
        for node_id in ids {
            if let Some(node) = self.tree.node(node_id) {
                let layer = node.render_data().texture_layer;
                if layer >= 0 {
                    self.textures.release(layer as u32);
                }
            }
        }
        self.tree = TileQuadTree::new();
        self.pending.clear();
        self.failed.clear();
        self.deferred.clear();
    }
}

impl<T: TileSample> Drop for TreeManager<T> {
    fn drop(&mut self) {
        if let Some(mut src) = self.source.take() {
            src.fini();
        }
    }
}
