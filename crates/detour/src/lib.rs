//! Tiled navigation mesh storage and path queries
//!
//! A [`NavMesh`] is an arena of tiles. Each tile holds convex polygons, the
//! links between them, a detail mesh for height queries, a bounding volume
//! tree and off-mesh connections. Polygons are addressed by [`PolyRef`]
//! handles that embed a salt, so a reference to a removed tile fails instead
//! of reaching stale data.
//!
//! [`NavMeshQuery`] runs searches against a mesh: A* (single call or sliced),
//! funnel straightening, raycasts, nearest and random point queries, and the
//! local neighbourhood walks used by crowd steering. [`PathQueue`] schedules
//! sliced searches across frames.
//!
//! Tile data is produced by [`NavMeshBuilder`] from already triangulated
//! polygons and installed with [`NavMesh::add_tile`].
//!
//! # Example
//!
//! ```rust,ignore
//! use detour::{NavMesh, NavMeshQuery, QueryFilter, PolyRef, TileFlags, TileRef};
//!
//! let mut nav_mesh = NavMesh::new(params)?;
//! nav_mesh.add_tile(tile_data, TileFlags::empty(), TileRef::NULL)?;
//!
//! let mut query = NavMeshQuery::new(&nav_mesh);
//! let filter = QueryFilter::default();
//! let (start_ref, start_pos) = query.find_nearest_poly(&start, &[2.0, 4.0, 2.0], &filter)?;
//! let (end_ref, end_pos) = query.find_nearest_poly(&end, &[2.0, 4.0, 2.0], &filter)?;
//!
//! let mut path = [PolyRef::NULL; 256];
//! let result = query.find_path(start_ref, end_ref, &start_pos, &end_pos, &filter, &mut path)?;
//! ```

pub mod binary_format;
pub mod dt_status;
pub mod nav_mesh;
pub mod nav_mesh_builder;
pub mod nav_mesh_query;
pub mod node_pool;
pub mod path_queue;
pub mod poly_query;
pub mod query_filter;
pub mod raycast_hit;
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_mesh_helpers;

pub use binary_format::*;
pub use dt_status::*;
pub use nav_mesh::*;
pub use nav_mesh_builder::*;
pub use nav_mesh_query::*;
pub use path_queue::*;
pub use poly_query::*;
pub use query_filter::*;
pub use raycast_hit::*;

#[cfg(test)]
mod detour_spatial_query_tests;
#[cfg(test)]
mod sliced_pathfinding_tests;

/// Maximum number of vertices per navigation polygon
pub const MAX_VERTS_PER_POLY: usize = 6;

/// Maximum number of area types
pub const MAX_AREAS: usize = 64;

/// Neighbour code flag marking a polygon edge as a tile portal
pub const EXT_LINK: u16 = 0x8000;

/// Null vertex index in polygon data handed to the builder
pub const MESH_NULL_IDX: u16 = 0xffff;

/// Off-mesh connection can be traversed in both directions
pub const OFFMESH_CON_BIDIR: u8 = 1;

/// Detail triangle edge lies on the polygon boundary
pub const DETAIL_EDGE_BOUNDARY: u8 = 0x01;

/// Bits used for the polygon index in a reference
pub const POLY_BITS: u32 = 16;
/// Bits used for the tile index in a reference
pub const TILE_BITS: u32 = 10;
/// Bits used for the salt in a reference
pub const SALT_BITS: u32 = 6;

pub(crate) const POLY_MASK: u32 = (1 << POLY_BITS) - 1;
pub(crate) const TILE_MASK: u32 = (1 << TILE_BITS) - 1;
pub(crate) const SALT_MASK: u32 = (1 << SALT_BITS) - 1;

/// Reference to a polygon: `salt | tile index | poly index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct PolyRef(u32);

impl PolyRef {
    pub const NULL: PolyRef = PolyRef(0);

    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Packs salt, tile index and polygon index.
    pub const fn encode(salt: u32, tile: u32, poly: u32) -> Self {
        Self(((salt & SALT_MASK) << (POLY_BITS + TILE_BITS)) | ((tile & TILE_MASK) << POLY_BITS) | (poly & POLY_MASK))
    }

    /// Splits the reference into `(salt, tile index, poly index)`.
    pub const fn decode(self) -> (u32, u32, u32) {
        (self.salt(), self.tile_index(), self.poly_index())
    }

    pub const fn id(self) -> u32 {
        self.0
    }

    pub const fn salt(self) -> u32 {
        (self.0 >> (POLY_BITS + TILE_BITS)) & SALT_MASK
    }

    pub const fn tile_index(self) -> u32 {
        (self.0 >> POLY_BITS) & TILE_MASK
    }

    pub const fn poly_index(self) -> u32 {
        self.0 & POLY_MASK
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Non-null. Whether the polygon still exists is answered by the mesh.
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl std::fmt::Display for PolyRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Reference to a tile; a polygon reference with a zero polygon index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct TileRef(u32);

impl TileRef {
    pub const NULL: TileRef = TileRef(0);

    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn id(self) -> u32 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    pub const fn salt(self) -> u32 {
        PolyRef(self.0).salt()
    }

    pub const fn tile_index(self) -> u32 {
        PolyRef(self.0).tile_index()
    }

    /// Reference base for polygons of this tile.
    pub const fn poly_base(self) -> PolyRef {
        PolyRef(self.0)
    }
}

bitflags::bitflags! {
    /// Polygon flags matched against the include/exclude masks of a [`QueryFilter`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
    pub struct PolyFlags: u16 {
        /// Ground walkable by agents
        const WALK = 0x01;
        /// Water
        const SWIM = 0x02;
        /// Door
        const DOOR = 0x04;
        /// Jump link
        const JUMP = 0x08;
        /// Disabled polygon
        const DISABLED = 0x10;
        const ALL = 0xffff;
    }
}

bitflags::bitflags! {
    /// Options for [`NavMesh::add_tile`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
    pub struct TileFlags: u8 {
        /// The mesh drops the tile blob; `remove_tile` hands nothing back.
        const FREE_DATA = 0x01;
    }
}

/// Type of a navigation polygon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum PolyType {
    /// Regular ground polygon
    #[default]
    Ground = 0,
    /// Two-vertex polygon representing an off-mesh connection
    OffMeshConnection = 1,
}

impl PolyType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PolyType::Ground),
            1 => Some(PolyType::OffMeshConnection),
            _ => None,
        }
    }
}

/// Parameters used to initialize a tiled navigation mesh
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct NavMeshParams {
    /// World space origin of the tile grid
    pub origin: [f32; 3],
    /// Width of each tile along the X axis
    pub tile_width: f32,
    /// Height of each tile along the Z axis
    pub tile_height: f32,
    /// Maximum number of tiles the mesh can hold
    pub max_tiles: u32,
    /// Maximum number of polygons per tile
    pub max_polys_per_tile: u32,
}

impl Default for NavMeshParams {
    fn default() -> Self {
        Self {
            origin: [0.0; 3],
            tile_width: 32.0,
            tile_height: 32.0,
            max_tiles: 64,
            max_polys_per_tile: 1024,
        }
    }
}
