//! Tile quad tree over an arena.
//!
//! Twelve independent roots, one per HEALPix base patch. Downward links are
//! the owning edges; the parent link is a plain arena index used for state
//! inheritance and for eviction's resident-descendant check, never for
//! ownership.

use crate::bounds::BoundingBox;
use crate::healpix::{TileId, NUM_ROOTS};
use crate::tile::{Tile, TileSample};

/// Index of a node in the tree arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

impl NodeId {
    pub(crate) fn from_index(index: usize) -> Self {
        Self(index as u32)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Flags a traversal can attach to a node for the duration of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RenderFlags(u32);

impl RenderFlags {
    /// The node was selected for drawing this frame.
    pub const RENDER: RenderFlags = RenderFlags(1 << 0);

    pub fn contains(self, other: RenderFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: RenderFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: RenderFlags) {
        self.0 &= !other.0;
    }
}

/// Residency metadata of a node.
///
/// `texture_layer >= 0` iff the tile's samples currently occupy that layer
/// of the channel's texture array.
#[derive(Debug, Clone)]
pub struct RenderData {
    pub bounds: BoundingBox,
    last_used_frame: i32,
    pub texture_layer: i32,
    pub flags: RenderFlags,
}

impl RenderData {
    pub fn new(bounds: BoundingBox, frame: i32) -> Self {
        Self {
            bounds,
            last_used_frame: frame,
            texture_layer: -1,
            flags: RenderFlags::default(),
        }
    }

    pub fn last_used_frame(&self) -> i32 {
        self.last_used_frame
    }

    /// Stamp the node as used. The stamp is monotone over the node's
    /// lifetime regardless of the caller's frame ordering.
    pub fn touch(&mut self, frame: i32) {
        self.last_used_frame = self.last_used_frame.max(frame);
    }
}

/// One node of the quad tree: the tile payload plus tree links and
/// residency metadata.
#[derive(Debug)]
pub struct TileNode<T: TileSample> {
    tile: Tile<T>,
    parent: Option<NodeId>,
    children: [Option<NodeId>; 4],
    render_data: RenderData,
}

impl<T: TileSample> TileNode<T> {
    pub fn new(tile: Tile<T>, render_data: RenderData) -> Self {
        Self {
            tile,
            parent: None,
            children: [None; 4],
            render_data,
        }
    }

    pub fn id(&self) -> TileId {
        self.tile.id()
    }

    pub fn level(&self) -> i32 {
        self.tile.level()
    }

    pub fn tile(&self) -> &Tile<T> {
        &self.tile
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn child(&self, k: usize) -> Option<NodeId> {
        self.children[k]
    }

    pub fn children(&self) -> [Option<NodeId>; 4] {
        self.children
    }

    pub fn is_leaf(&self) -> bool {
        self.children.iter().all(Option::is_none)
    }

    pub fn render_data(&self) -> &RenderData {
        &self.render_data
    }

    pub fn render_data_mut(&mut self) -> &mut RenderData {
        &mut self.render_data
    }
}

/// Arena-backed quad tree with the twelve base patches as roots.
#[derive(Debug)]
pub struct TileQuadTree<T: TileSample> {
    nodes: Vec<Option<TileNode<T>>>,
    free: Vec<u32>,
    roots: [Option<NodeId>; NUM_ROOTS],
    len: usize,
}

impl<T: TileSample> Default for TileQuadTree<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TileSample> TileQuadTree<T> {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            roots: [None; NUM_ROOTS],
            len: 0,
        }
    }

    /// Number of nodes currently linked into the tree.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn root(&self, i: usize) -> Option<NodeId> {
        self.roots[i]
    }

    pub fn node(&self, id: NodeId) -> Option<&TileNode<T>> {
        self.nodes.get(id.index()).and_then(Option::as_ref)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut TileNode<T>> {
        self.nodes.get_mut(id.index()).and_then(Option::as_mut)
    }

    /// Link a level-0 node into its root slot. The slot must be empty.
    pub fn insert_root(&mut self, node: TileNode<T>) -> NodeId {
        let tile_id = node.id();
        assert_eq!(tile_id.level, 0, "only level-0 tiles can be roots");
        let slot = tile_id.root as usize;
        assert!(self.roots[slot].is_none(), "root {} already present", slot);
        let id = self.alloc(node);
        self.roots[slot] = Some(id);
        id
    }

    /// Link `node` as child `k` of `parent`. The child slot must be empty
    /// and the node's TileId must match its position under the parent.
    pub fn insert_child(&mut self, parent: NodeId, k: usize, node: TileNode<T>) -> NodeId {
        let parent_tile = self
            .node(parent)
            .expect("insert_child: parent not in arena")
            .id();
        debug_assert_eq!(node.id(), parent_tile.child(k));

        let id = self.alloc(node);
        self.nodes[id.index()].as_mut().unwrap().parent = Some(parent);
        let pnode = self.nodes[parent.index()].as_mut().unwrap();
        assert!(pnode.children[k].is_none(), "child slot already occupied");
        pnode.children[k] = Some(id);
        id
    }

    /// Unlink a childless node from the tree and return its payload.
    pub fn remove_leaf(&mut self, id: NodeId) -> Option<TileNode<T>> {
        let node = self.nodes.get_mut(id.index())?.take()?;
        assert!(node.is_leaf(), "remove_leaf: node still has children");

        match node.parent {
            Some(p) => {
                let pnode = self.nodes[p.index()]
                    .as_mut()
                    .expect("parent vanished before child");
                let k = node.id().child_index();
                debug_assert_eq!(pnode.children[k], Some(id));
                pnode.children[k] = None;
            }
            None => {
                let slot = node.id().root as usize;
                debug_assert_eq!(self.roots[slot], Some(id));
                self.roots[slot] = None;
            }
        }

        self.free.push(id.0);
        self.len -= 1;
        Some(node)
    }

    /// Locate the node for `tile_id` by walking the Morton path down from
    /// its root.
    pub fn find_node(&self, tile_id: TileId) -> Option<NodeId> {
        let mut current = self.roots[tile_id.root as usize]?;
        for step in 0..tile_id.level {
            let k = ((tile_id.patch >> (2 * (tile_id.level - 1 - step))) & 3) as usize;
            current = self.node(current)?.child(k)?;
        }
        Some(current)
    }

    /// All node ids currently in the arena, in unspecified order.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(i, n)| n.as_ref().map(|_| NodeId(i as u32)))
    }

    fn alloc(&mut self, node: TileNode<T>) -> NodeId {
        self.len += 1;
        match self.free.pop() {
            Some(slot) => {
                self.nodes[slot as usize] = Some(node);
                NodeId(slot)
            }
            None => {
                self.nodes.push(Some(node));
                NodeId((self.nodes.len() - 1) as u32)
            }
        }
    }
}
