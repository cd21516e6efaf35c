//! Real-time, view-dependent level-of-detail rendering core for planetary
//! bodies.
//!
//! Two HEALPix-addressed tile pyramids (elevation and surface imagery)
//! feed a bounded GPU residency pool per channel. Each frame a joint
//! traversal of both quad trees applies frustum and horizon culling,
//! evaluates a screen-space refinement criterion and emits the minimal
//! tile selection to draw plus the tile ids to load next. Tile decoding
//! runs behind the asynchronous [`source::TileSource`] boundary; the
//! render thread polls and never blocks.

pub mod bounds;
pub mod config;
pub mod error;
pub mod healpix;
pub mod manager;
pub mod planet;
pub mod source;
pub mod texture;
pub mod tile;
pub mod tree;
pub mod visitor;

pub use config::PlanetParameters;
pub use error::{PlanetError, PlanetResult};
pub use healpix::{TileId, MAX_TREE_DEPTH, NUM_ROOTS};
pub use manager::TreeManager;
pub use planet::{draw_info, FrameContext, Planet, TileDrawInfo, TileRenderer};
pub use source::{
    AsyncTileSource, FileColorReader, FileElevationReader, ImmediateTileSource,
    ProceduralColor, ProceduralElevation, SourceError, TileLoad, TileReader, TileSource,
};
pub use texture::{GpuContext, TileTextureArray};
pub use tile::{MinMaxPyramid, Rgb8, Tile, TileDataType, TileSample};
pub use tree::{NodeId, RenderData, RenderFlags, TileNode, TileQuadTree};
pub use visitor::{LodVisitor, RenderEntry};
