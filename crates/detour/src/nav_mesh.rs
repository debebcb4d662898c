//! Navigation mesh implementation for Detour
//!
//! The navigation mesh is an arena of tiles. Each tile owns its polygons,
//! vertices, a pool of links, a detail mesh and a quantized BV tree. Links
//! connect polygons inside a tile, across tile borders and along off-mesh
//! connections. Adding or removing a tile patches the links of its
//! neighbours so every stored link points at a live polygon.

use std::collections::HashMap;

use detour_common::{
    closest_height_point_triangle, distance_pt_seg_sqr_2d, opposite_tile, overlap_bounds,
    overlap_quant_bounds, point_in_polygon, sqr, vdist_2d_sqr, vlen_sqr, vlerp, vsub, Error,
    Result,
};
use log::{debug, trace, warn};

use super::binary_format::{decode_tile, TileData};
use super::{
    NavMeshParams, PolyFlags, PolyRef, PolyType, TileFlags, TileRef, DETAIL_EDGE_BOUNDARY,
    EXT_LINK, MAX_VERTS_PER_POLY, OFFMESH_CON_BIDIR, POLY_BITS, SALT_MASK, TILE_BITS,
};

/// Side value of a link that stays inside its tile
pub const LINK_SIDE_INTERNAL: u8 = 0xff;

/// Link between two polygons
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Link {
    /// Polygon the link leads to
    pub poly_ref: PolyRef,
    /// Next link of the owning polygon
    pub next: Option<u32>,
    /// Edge of the owning polygon the link crosses
    pub edge: u8,
    /// Tile side of a portal link, `LINK_SIDE_INTERNAL` otherwise
    pub side: u8,
    /// Portal sub-range start along the edge (0..255)
    pub bmin: u8,
    /// Portal sub-range end along the edge (0..255)
    pub bmax: u8,
}

impl Link {
    pub fn is_internal(&self) -> bool {
        self.side == LINK_SIDE_INTERNAL
    }
}

/// Navigation polygon
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Poly {
    /// Head of the polygon's link list
    pub first_link: Option<u32>,
    /// Vertex indices into the tile vertex array
    pub verts: [u16; MAX_VERTS_PER_POLY],
    /// Neighbour code per edge: 0 solid, `i + 1` internal, `EXT_LINK | side` portal
    pub neis: [u16; MAX_VERTS_PER_POLY],
    pub flags: PolyFlags,
    pub vert_count: u8,
    /// Area type (0..63)
    pub area: u8,
    pub poly_type: PolyType,
}

impl Poly {
    #[inline]
    pub fn vert_count(&self) -> usize {
        self.vert_count as usize
    }

    #[inline]
    pub fn is_off_mesh_connection(&self) -> bool {
        self.poly_type == PolyType::OffMeshConnection
    }
}

/// Detail sub-mesh of a polygon
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PolyDetail {
    /// First vertex in the tile detail vertex array
    pub vert_base: u32,
    /// First triangle in the tile detail triangle array
    pub tri_base: u32,
    pub vert_count: u8,
    pub tri_count: u8,
}

/// Bounding volume node; leaves have `i >= 0` (polygon index), internal
/// nodes store the negative escape offset.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BVNode {
    pub bmin: [u16; 3],
    pub bmax: [u16; 3],
    pub i: i32,
}

/// Off-mesh connection stored in a tile
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OffMeshConnection {
    /// Start and end point \[sx, sy, sz, ex, ey, ez\]
    pub pos: [f32; 6],
    /// Snap radius of the end points
    pub rad: f32,
    /// Index of the connection polygon in the tile
    pub poly: u16,
    /// `OFFMESH_CON_BIDIR` when traversable both ways
    pub flags: u8,
    /// Tile side of the end point, 0xff when inside the tile
    pub side: u8,
    pub user_id: u32,
}

impl OffMeshConnection {
    pub fn start_pos(&self) -> [f32; 3] {
        [self.pos[0], self.pos[1], self.pos[2]]
    }

    pub fn end_pos(&self) -> [f32; 3] {
        [self.pos[3], self.pos[4], self.pos[5]]
    }

    pub fn is_bidirectional(&self) -> bool {
        self.flags & OFFMESH_CON_BIDIR != 0
    }
}

/// Tile header
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TileHeader {
    pub x: i32,
    pub y: i32,
    pub layer: i32,
    pub user_id: u32,
    pub poly_count: i32,
    pub vert_count: i32,
    pub max_link_count: i32,
    pub detail_mesh_count: i32,
    pub detail_vert_count: i32,
    pub detail_tri_count: i32,
    pub bv_node_count: i32,
    pub off_mesh_con_count: i32,
    /// Index of the first off-mesh connection polygon
    pub off_mesh_base: i32,
    pub walkable_height: f32,
    pub walkable_radius: f32,
    pub walkable_climb: f32,
    pub bmin: [f32; 3],
    pub bmax: [f32; 3],
    pub bv_quant_factor: f32,
}

/// Iterator over the links of one polygon
pub struct LinkIter<'a> {
    links: &'a [Link],
    next: Option<u32>,
}

impl<'a> Iterator for LinkIter<'a> {
    type Item = &'a Link;

    fn next(&mut self) -> Option<Self::Item> {
        let link = self.links.get(self.next? as usize)?;
        self.next = link.next;
        Some(link)
    }
}

/// A tile slot of the mesh arena
#[derive(Debug, Clone, Default)]
pub struct MeshTile {
    pub salt: u32,
    index: u32,
    pub header: Option<TileHeader>,
    pub polys: Vec<Poly>,
    pub verts: Vec<[f32; 3]>,
    pub links: Vec<Link>,
    links_free_list: Option<u32>,
    pub detail_meshes: Vec<PolyDetail>,
    pub detail_verts: Vec<[f32; 3]>,
    pub detail_tris: Vec<[u8; 4]>,
    pub bv_tree: Vec<BVNode>,
    pub off_mesh_cons: Vec<OffMeshConnection>,
    pub flags: TileFlags,
    data: Option<Vec<u8>>,
    next_free: Option<usize>,
}

impl MeshTile {
    fn empty(index: usize, salt: u32, next_free: Option<usize>) -> Self {
        Self {
            salt,
            index: index as u32,
            next_free,
            ..Default::default()
        }
    }

    /// Slot index in the tile table
    #[inline]
    pub fn index(&self) -> usize {
        self.index as usize
    }

    #[inline]
    pub fn is_loaded(&self) -> bool {
        self.header.is_some()
    }

    /// Reference of polygon `poly` of this tile
    #[inline]
    pub fn poly_ref(&self, poly: usize) -> PolyRef {
        PolyRef::encode(self.salt, self.index, poly as u32)
    }

    pub fn tile_ref(&self) -> TileRef {
        if self.is_loaded() {
            TileRef::new(PolyRef::encode(self.salt, self.index, 0).id())
        } else {
            TileRef::NULL
        }
    }

    pub fn walkable_climb(&self) -> f32 {
        self.header.as_ref().map_or(0.0, |h| h.walkable_climb)
    }

    pub fn links_of(&self, poly: &Poly) -> LinkIter<'_> {
        LinkIter {
            links: &self.links,
            next: poly.first_link,
        }
    }

    /// Copies the polygon vertices; returns the buffer and the vertex count.
    #[inline]
    pub fn poly_verts(&self, poly: &Poly) -> ([[f32; 3]; MAX_VERTS_PER_POLY], usize) {
        let mut out = [[0.0; 3]; MAX_VERTS_PER_POLY];
        let nv = poly.vert_count();
        for (dst, &vi) in out.iter_mut().zip(&poly.verts[..nv]) {
            *dst = self.verts[vi as usize];
        }
        (out, nv)
    }

    fn alloc_link(&mut self) -> Option<u32> {
        let idx = self.links_free_list?;
        self.links_free_list = self.links[idx as usize].next;
        Some(idx)
    }

    fn free_link(&mut self, idx: u32) {
        self.links[idx as usize].next = self.links_free_list;
        self.links_free_list = Some(idx);
    }

    /// Prepends a link to a polygon's list. False when the pool is exhausted.
    fn prepend_link(&mut self, poly: usize, mut link: Link) -> bool {
        let Some(idx) = self.alloc_link() else {
            return false;
        };
        link.next = self.polys[poly].first_link;
        self.links[idx as usize] = link;
        self.polys[poly].first_link = Some(idx);
        true
    }

    fn install(&mut self, data: TileData, blob: Vec<u8>, flags: TileFlags) {
        let link_count = data.header.max_link_count.max(0) as usize;
        self.links = (0..link_count)
            .map(|i| Link {
                next: (i + 1 < link_count).then_some(i as u32 + 1),
                ..Default::default()
            })
            .collect();
        self.links_free_list = (link_count > 0).then_some(0);
        self.header = Some(data.header);
        self.polys = data.polys;
        self.verts = data.verts;
        self.detail_meshes = data.detail_meshes;
        self.detail_verts = data.detail_verts;
        self.detail_tris = data.detail_tris;
        self.bv_tree = data.bv_tree;
        self.off_mesh_cons = data.off_mesh_cons;
        self.flags = flags;
        self.data = (!flags.contains(TileFlags::FREE_DATA)).then_some(blob);
        for poly in &mut self.polys {
            poly.first_link = None;
        }
    }

    /// Visits every ground polygon whose bounds overlap the query box.
    pub fn query_polygons(&self, qmin: &[f32; 3], qmax: &[f32; 3], mut visit: impl FnMut(usize)) {
        let Some(header) = self.header.as_ref() else {
            return;
        };

        if !self.bv_tree.is_empty() {
            let tbmin = &header.bmin;
            let tbmax = &header.bmax;
            let qfac = header.bv_quant_factor;

            let mut bmin = [0u16; 3];
            let mut bmax = [0u16; 3];
            for k in 0..3 {
                let lo = qmin[k].clamp(tbmin[k], tbmax[k]) - tbmin[k];
                let hi = qmax[k].clamp(tbmin[k], tbmax[k]) - tbmin[k];
                bmin[k] = ((qfac * lo) as u16) & 0xfffe;
                bmax[k] = ((qfac * hi + 1.0) as u16) | 1;
            }

            let mut node = 0usize;
            while node < self.bv_tree.len() {
                let n = &self.bv_tree[node];
                let overlap = overlap_quant_bounds(&bmin, &bmax, &n.bmin, &n.bmax);
                let is_leaf = n.i >= 0;
                if is_leaf && overlap {
                    visit(n.i as usize);
                }
                if overlap || is_leaf {
                    node += 1;
                } else {
                    node += (-n.i).max(1) as usize;
                }
            }
        } else {
            for (i, poly) in self.polys.iter().enumerate() {
                if poly.is_off_mesh_connection() {
                    continue;
                }
                let (verts, nv) = self.poly_verts(poly);
                let mut bmin = verts[0];
                let mut bmax = verts[0];
                for v in &verts[1..nv] {
                    for k in 0..3 {
                        bmin[k] = bmin[k].min(v[k]);
                        bmax[k] = bmax[k].max(v[k]);
                    }
                }
                if overlap_bounds(qmin, qmax, &bmin, &bmax) {
                    visit(i);
                }
            }
        }
    }

    fn detail_tri_verts(&self, poly: &Poly, pd: &PolyDetail, tri: &[u8; 4]) -> [[f32; 3]; 3] {
        let nv = poly.vert_count();
        let mut v = [[0.0; 3]; 3];
        for k in 0..3 {
            let idx = tri[k] as usize;
            v[k] = if idx < nv {
                self.verts[poly.verts[idx] as usize]
            } else {
                self.detail_verts[pd.vert_base as usize + (idx - nv)]
            };
        }
        v
    }

    /// Closest point on the detail triangle edges of a polygon.
    pub fn closest_point_on_detail_edges(
        &self,
        poly_idx: usize,
        pos: &[f32; 3],
        only_boundary: bool,
    ) -> [f32; 3] {
        const ANY_BOUNDARY_EDGE: u8 =
            DETAIL_EDGE_BOUNDARY | (DETAIL_EDGE_BOUNDARY << 2) | (DETAIL_EDGE_BOUNDARY << 4);

        let poly = &self.polys[poly_idx];
        let Some(pd) = self.detail_meshes.get(poly_idx) else {
            return *pos;
        };

        let mut dmin = f32::MAX;
        let mut tmin = 0.0;
        let mut pmin = *pos;
        let mut pmax = *pos;

        for i in 0..pd.tri_count as usize {
            let tri = &self.detail_tris[pd.tri_base as usize + i];
            if only_boundary && tri[3] & ANY_BOUNDARY_EDGE == 0 {
                continue;
            }
            let v = self.detail_tri_verts(poly, pd, tri);
            let mut j = 2;
            for k in 0..3 {
                let edge_flags = (tri[3] >> (j * 2)) & 0x3;
                if edge_flags & DETAIL_EDGE_BOUNDARY == 0 && (only_boundary || tri[j] < tri[k]) {
                    j = k;
                    continue;
                }
                let (d, t) = distance_pt_seg_sqr_2d(pos, &v[j], &v[k]);
                if d < dmin {
                    dmin = d;
                    tmin = t;
                    pmin = v[j];
                    pmax = v[k];
                }
                j = k;
            }
        }

        vlerp(&pmin, &pmax, tmin)
    }

    /// Height of the detail surface under `pos`, None when outside the polygon.
    pub fn get_poly_height(&self, poly_idx: usize, pos: &[f32; 3]) -> Option<f32> {
        let poly = self.polys.get(poly_idx)?;
        if poly.is_off_mesh_connection() {
            return None;
        }
        let pd = self.detail_meshes.get(poly_idx)?;

        let (verts, nv) = self.poly_verts(poly);
        if !point_in_polygon(pos, &verts[..nv]) {
            return None;
        }

        for i in 0..pd.tri_count as usize {
            let tri = &self.detail_tris[pd.tri_base as usize + i];
            let v = self.detail_tri_verts(poly, pd, tri);
            if let Some(h) = closest_height_point_triangle(pos, &v[0], &v[1], &v[2]) {
                return Some(h);
            }
        }

        // Point is inside the polygon but missed every triangle by a hair.
        Some(self.closest_point_on_detail_edges(poly_idx, pos, false)[1])
    }

    /// Closest point on the polygon and whether `pos` lies over it.
    pub fn closest_point_on_poly(&self, poly_idx: usize, pos: &[f32; 3]) -> ([f32; 3], bool) {
        if let Some(h) = self.get_poly_height(poly_idx, pos) {
            return ([pos[0], h, pos[2]], true);
        }

        let poly = &self.polys[poly_idx];
        if poly.is_off_mesh_connection() {
            let v0 = self.verts[poly.verts[0] as usize];
            let v1 = self.verts[poly.verts[1] as usize];
            let (_, t) = distance_pt_seg_sqr_2d(pos, &v0, &v1);
            return (vlerp(&v0, &v1, t), false);
        }

        (self.closest_point_on_detail_edges(poly_idx, pos, true), false)
    }

    /// Nearest ground polygon of this tile within the query box.
    pub fn find_nearest_poly(
        &self,
        center: &[f32; 3],
        half_extents: &[f32; 3],
    ) -> Option<(PolyRef, [f32; 3])> {
        let qmin = vsub(center, half_extents);
        let qmax = [
            center[0] + half_extents[0],
            center[1] + half_extents[1],
            center[2] + half_extents[2],
        ];
        let climb = self.walkable_climb();

        let mut nearest: Option<(PolyRef, [f32; 3])> = None;
        let mut nearest_dist = f32::MAX;
        self.query_polygons(&qmin, &qmax, |i| {
            let (closest, over) = self.closest_point_on_poly(i, center);
            let diff = vsub(center, &closest);
            // Over the polygon, the vertical gap up to climb height is free.
            let d = if over {
                let d = diff[1].abs() - climb;
                if d > 0.0 {
                    d * d
                } else {
                    0.0
                }
            } else {
                vlen_sqr(&diff)
            };
            if d < nearest_dist {
                nearest_dist = d;
                nearest = Some((self.poly_ref(i), closest));
            }
        });
        nearest
    }
}

fn slab_coord(v: &[f32; 3], side: i32) -> f32 {
    match side {
        0 | 4 => v[0],
        2 | 6 => v[2],
        _ => 0.0,
    }
}

fn slab_end_points(va: &[f32; 3], vb: &[f32; 3], side: i32) -> ([f32; 2], [f32; 2]) {
    let axis = match side {
        0 | 4 => 2,
        2 | 6 => 0,
        _ => return ([0.0; 2], [0.0; 2]),
    };
    if va[axis] < vb[axis] {
        ([va[axis], va[1]], [vb[axis], vb[1]])
    } else {
        ([vb[axis], vb[1]], [va[axis], va[1]])
    }
}

fn overlap_slabs(amin: &[f32; 2], amax: &[f32; 2], bmin: &[f32; 2], bmax: &[f32; 2], px: f32, py: f32) -> bool {
    // Shrink by px so segments touching only at an end point do not count.
    let minx = (amin[0] + px).max(bmin[0] + px);
    let maxx = (amax[0] - px).min(bmax[0] - px);
    if minx > maxx {
        return false;
    }

    let ad = (amax[1] - amin[1]) / (amax[0] - amin[0]);
    let ak = amin[1] - ad * amin[0];
    let bd = (bmax[1] - bmin[1]) / (bmax[0] - bmin[0]);
    let bk = bmin[1] - bd * bmin[0];
    let aminy = ad * minx + ak;
    let amaxy = ad * maxx + ak;
    let bminy = bd * minx + bk;
    let bmaxy = bd * maxx + bk;
    let dmin = bminy - aminy;
    let dmax = bmaxy - amaxy;

    // Crossing segments always overlap.
    if dmin * dmax < 0.0 {
        return true;
    }

    let thr = sqr(py * 2.0);
    dmin * dmin <= thr || dmax * dmax <= thr
}

/// Portal polygons of `tile` on `side` that overlap edge `va`-`vb`. Writes
/// `(ref, min, max)` where min/max bound the overlap along the edge axis.
fn find_connecting_polys(
    va: &[f32; 3],
    vb: &[f32; 3],
    tile: &MeshTile,
    side: i32,
    out: &mut [(PolyRef, f32, f32)],
) -> usize {
    let (amin, amax) = slab_end_points(va, vb, side);
    let apos = slab_coord(va, side);
    let marker = EXT_LINK | side as u16;
    let climb = tile.walkable_climb();

    let mut n = 0;
    for (i, poly) in tile.polys.iter().enumerate() {
        let nv = poly.vert_count();
        for j in 0..nv {
            if poly.neis[j] != marker {
                continue;
            }
            let vc = &tile.verts[poly.verts[j] as usize];
            let vd = &tile.verts[poly.verts[(j + 1) % nv] as usize];
            if (apos - slab_coord(vc, side)).abs() > 0.01 {
                continue;
            }
            let (bmin, bmax) = slab_end_points(vc, vd, side);
            if !overlap_slabs(&amin, &amax, &bmin, &bmax, 0.01, climb) {
                continue;
            }
            if n < out.len() {
                out[n] = (tile.poly_ref(i), amin[0].max(bmin[0]), amax[0].min(bmax[0]));
                n += 1;
            }
            break;
        }
    }
    n
}

/// Tiled navigation mesh
#[derive(Debug)]
pub struct NavMesh {
    params: NavMeshParams,
    tiles: Vec<MeshTile>,
    next_free: Option<usize>,
    /// (x, y) → tile indices of every layer in that column
    pos_lookup: HashMap<(i32, i32), Vec<usize>>,
}

impl NavMesh {
    /// Creates an empty mesh with a fixed tile table.
    pub fn new(params: NavMeshParams) -> Result<Self> {
        if !params.origin.iter().all(|v| v.is_finite()) {
            return Err(Error::invalid_param("origin must be finite"));
        }
        if !(params.tile_width > 0.0 && params.tile_height > 0.0) {
            return Err(Error::invalid_param("tile size must be positive"));
        }
        if params.max_tiles == 0 || params.max_tiles > (1 << TILE_BITS) {
            return Err(Error::invalid_param(format!(
                "max_tiles must be within 1..={}",
                1u32 << TILE_BITS
            )));
        }
        if params.max_polys_per_tile == 0 || params.max_polys_per_tile > (1 << POLY_BITS) {
            return Err(Error::invalid_param(format!(
                "max_polys_per_tile must be within 1..={}",
                1u32 << POLY_BITS
            )));
        }

        let max_tiles = params.max_tiles as usize;
        let tiles = (0..max_tiles)
            .map(|i| MeshTile::empty(i, 1, (i + 1 < max_tiles).then_some(i + 1)))
            .collect();

        Ok(Self {
            params,
            tiles,
            next_free: Some(0),
            pos_lookup: HashMap::new(),
        })
    }

    pub fn params(&self) -> &NavMeshParams {
        &self.params
    }

    pub fn max_tiles(&self) -> usize {
        self.tiles.len()
    }

    /// Adds a tile blob to the mesh and links it with its neighbours.
    ///
    /// `last_ref` restores a previously removed tile into its old slot and
    /// salt, keeping references handed out before the removal valid.
    pub fn add_tile(&mut self, data: Vec<u8>, flags: TileFlags, last_ref: TileRef) -> Result<TileRef> {
        let tile_data = decode_tile(&data)?;
        let header = &tile_data.header;

        if header.poly_count as u32 > self.params.max_polys_per_tile {
            return Err(Error::invalid_param(format!(
                "tile has {} polygons, mesh allows {}",
                header.poly_count, self.params.max_polys_per_tile
            )));
        }
        if self.get_tile_at(header.x, header.y, header.layer).is_some() {
            return Err(Error::AlreadyOccupied {
                x: header.x,
                y: header.y,
                layer: header.layer,
            });
        }

        let idx = if last_ref.is_null() {
            let idx = self
                .next_free
                .ok_or_else(|| Error::OutOfMemory("tile table is full".into()))?;
            self.next_free = self.tiles[idx].next_free;
            idx
        } else {
            let idx = last_ref.tile_index() as usize;
            if idx >= self.tiles.len() {
                return Err(Error::OutOfMemory(format!("tile index {idx} out of range").into()));
            }
            self.take_free_slot(idx)?;
            self.tiles[idx].salt = last_ref.salt();
            idx
        };

        let (x, y, layer) = (header.x, header.y, header.layer);
        let tile = &mut self.tiles[idx];
        tile.next_free = None;
        tile.install(tile_data, data, flags);
        self.pos_lookup.entry((x, y)).or_default().push(idx);

        self.connect_int_links(idx);
        self.base_off_mesh_links(idx);
        self.connect_ext_off_mesh_links(idx, idx, -1);

        for nei in self.tile_indices_at(x, y) {
            if nei == idx {
                continue;
            }
            self.connect_ext_links(idx, nei, -1);
            self.connect_ext_links(nei, idx, -1);
            self.connect_ext_off_mesh_links(idx, nei, -1);
            self.connect_ext_off_mesh_links(nei, idx, -1);
        }

        for side in 0..8 {
            for nei in self.neighbour_tile_indices(x, y, side) {
                let opposite = opposite_tile(side);
                self.connect_ext_links(idx, nei, side);
                self.connect_ext_links(nei, idx, opposite);
                self.connect_ext_off_mesh_links(idx, nei, side);
                self.connect_ext_off_mesh_links(nei, idx, opposite);
            }
        }

        let tile_ref = self.tiles[idx].tile_ref();
        debug!(
            "added tile ({x}, {y}, layer {layer}) as {:#x} with {} polygons",
            tile_ref.id(),
            self.tiles[idx].polys.len()
        );
        Ok(tile_ref)
    }

    fn take_free_slot(&mut self, idx: usize) -> Result<()> {
        let mut prev: Option<usize> = None;
        let mut cur = self.next_free;
        while let Some(i) = cur {
            if i == idx {
                let next = self.tiles[i].next_free;
                match prev {
                    None => self.next_free = next,
                    Some(p) => self.tiles[p].next_free = next,
                }
                return Ok(());
            }
            prev = cur;
            cur = self.tiles[i].next_free;
        }
        Err(Error::OutOfMemory(format!("tile slot {idx} is in use").into()))
    }

    /// Removes a tile, unlinking it from its neighbours.
    ///
    /// Returns the tile blob unless the tile was added with
    /// `TileFlags::FREE_DATA`.
    pub fn remove_tile(&mut self, tile_ref: TileRef) -> Result<Option<Vec<u8>>> {
        if tile_ref.is_null() {
            return Err(Error::invalid_param("null tile reference"));
        }
        let idx = tile_ref.tile_index() as usize;
        let Some(tile) = self.tiles.get(idx) else {
            return Err(Error::invalid_param(format!("tile index {idx} out of range")));
        };
        let Some(header) = tile.header.as_ref() else {
            return Err(Error::invalidated(format!("tile {:#x} is not loaded", tile_ref.id())));
        };
        if tile.salt != tile_ref.salt() {
            return Err(Error::invalidated(format!("stale tile reference {:#x}", tile_ref.id())));
        }
        let (x, y, layer) = (header.x, header.y, header.layer);

        if let Some(column) = self.pos_lookup.get_mut(&(x, y)) {
            column.retain(|&i| i != idx);
            if column.is_empty() {
                self.pos_lookup.remove(&(x, y));
            }
        }

        for nei in self.tile_indices_at(x, y) {
            self.unconnect_links(nei, idx);
        }
        for side in 0..8 {
            for nei in self.neighbour_tile_indices(x, y, side) {
                self.unconnect_links(nei, idx);
            }
        }

        let mut salt = (self.tiles[idx].salt + 1) & SALT_MASK;
        if salt == 0 {
            salt = 1;
        }
        let data = self.tiles[idx].data.take();
        self.tiles[idx] = MeshTile::empty(idx, salt, self.next_free);
        self.next_free = Some(idx);

        debug!("removed tile ({x}, {y}, layer {layer}) {:#x}", tile_ref.id());
        Ok(data)
    }

    fn tile_indices_at(&self, x: i32, y: i32) -> Vec<usize> {
        self.pos_lookup.get(&(x, y)).cloned().unwrap_or_default()
    }

    fn neighbour_tile_indices(&self, x: i32, y: i32, side: i32) -> Vec<usize> {
        let (nx, ny) = match side {
            0 => (x + 1, y),
            1 => (x + 1, y + 1),
            2 => (x, y + 1),
            3 => (x - 1, y + 1),
            4 => (x - 1, y),
            5 => (x - 1, y - 1),
            6 => (x, y - 1),
            7 => (x + 1, y - 1),
            _ => return Vec::new(),
        };
        self.tile_indices_at(nx, ny)
    }

    fn connect_int_links(&mut self, idx: usize) {
        let tile = &mut self.tiles[idx];
        for i in 0..tile.polys.len() {
            tile.polys[i].first_link = None;
            if tile.polys[i].is_off_mesh_connection() {
                continue;
            }
            // Reverse order so the list ends up in edge order.
            for j in (0..tile.polys[i].vert_count()).rev() {
                let nei = tile.polys[i].neis[j];
                if nei == 0 || nei & EXT_LINK != 0 {
                    continue;
                }
                let link = Link {
                    poly_ref: tile.poly_ref(nei as usize - 1),
                    next: None,
                    edge: j as u8,
                    side: LINK_SIDE_INTERNAL,
                    bmin: 0,
                    bmax: 0,
                };
                if !tile.prepend_link(i, link) {
                    warn!("link pool of tile {idx} exhausted");
                    return;
                }
            }
        }
    }

    fn base_off_mesh_links(&mut self, idx: usize) {
        let mut snaps = Vec::new();
        let mut links = Vec::new();
        {
            let tile = &self.tiles[idx];
            let climb = tile.walkable_climb();
            for con in &tile.off_mesh_cons {
                let poly_idx = con.poly as usize;
                let ext = [con.rad, climb, con.rad];
                let p = con.start_pos();
                let Some((land_ref, nearest)) = tile.find_nearest_poly(&p, &ext) else {
                    continue;
                };
                if vdist_2d_sqr(&nearest, &p) > sqr(con.rad) {
                    continue;
                }
                snaps.push((tile.polys[poly_idx].verts[0] as usize, nearest));
                links.push((
                    poly_idx,
                    Link {
                        poly_ref: land_ref,
                        edge: 0,
                        side: LINK_SIDE_INTERNAL,
                        ..Default::default()
                    },
                ));
                // Start end is always connected back to the connection.
                links.push((
                    land_ref.poly_index() as usize,
                    Link {
                        poly_ref: tile.poly_ref(poly_idx),
                        edge: 0xff,
                        side: LINK_SIDE_INTERNAL,
                        ..Default::default()
                    },
                ));
            }
        }

        let tile = &mut self.tiles[idx];
        for (vert, pos) in snaps {
            tile.verts[vert] = pos;
        }
        for (poly, link) in links {
            if !tile.prepend_link(poly, link) {
                warn!("link pool of tile {idx} exhausted");
                break;
            }
        }
    }

    /// Links off-mesh connections of `target` whose end lands in `tile_idx`.
    fn connect_ext_off_mesh_links(&mut self, tile_idx: usize, target_idx: usize, side: i32) {
        let opposite_side = if side == -1 {
            LINK_SIDE_INTERNAL
        } else {
            opposite_tile(side) as u8
        };

        let mut snaps = Vec::new();
        let mut target_links = Vec::new();
        let mut tile_links = Vec::new();
        {
            let tile = &self.tiles[tile_idx];
            let target = &self.tiles[target_idx];
            let climb = target.walkable_climb();
            for con in &target.off_mesh_cons {
                if con.side != opposite_side {
                    continue;
                }
                let target_poly = &target.polys[con.poly as usize];
                // Skip connections whose start could not be connected at all.
                if target_poly.first_link.is_none() {
                    continue;
                }
                let ext = [con.rad, climb, con.rad];
                let p = con.end_pos();
                let Some((land_ref, nearest)) = tile.find_nearest_poly(&p, &ext) else {
                    continue;
                };
                if vdist_2d_sqr(&nearest, &p) > sqr(con.rad) {
                    continue;
                }
                snaps.push((target_poly.verts[1] as usize, nearest));
                target_links.push((
                    con.poly as usize,
                    Link {
                        poly_ref: land_ref,
                        edge: 1,
                        side: opposite_side,
                        ..Default::default()
                    },
                ));
                if con.is_bidirectional() {
                    tile_links.push((
                        land_ref.poly_index() as usize,
                        Link {
                            poly_ref: target.poly_ref(con.poly as usize),
                            edge: 0xff,
                            side: if side == -1 {
                                LINK_SIDE_INTERNAL
                            } else {
                                side as u8
                            },
                            ..Default::default()
                        },
                    ));
                }
            }
        }

        let target = &mut self.tiles[target_idx];
        for (vert, pos) in snaps {
            target.verts[vert] = pos;
        }
        for (poly, link) in target_links {
            if !target.prepend_link(poly, link) {
                warn!("link pool of tile {target_idx} exhausted");
                break;
            }
        }
        let tile = &mut self.tiles[tile_idx];
        for (poly, link) in tile_links {
            if !tile.prepend_link(poly, link) {
                warn!("link pool of tile {tile_idx} exhausted");
                break;
            }
        }
    }

    /// Creates portal links from `tile_idx` to `target_idx`. `side` -1 links
    /// every portal edge (used between layers of one column).
    fn connect_ext_links(&mut self, tile_idx: usize, target_idx: usize, side: i32) {
        let mut pending = Vec::new();
        {
            let tile = &self.tiles[tile_idx];
            let target = &self.tiles[target_idx];
            for (i, poly) in tile.polys.iter().enumerate() {
                let nv = poly.vert_count();
                for j in 0..nv {
                    if poly.neis[j] & EXT_LINK == 0 {
                        continue;
                    }
                    let dir = (poly.neis[j] & 0xff) as i32;
                    if side != -1 && dir != side {
                        continue;
                    }

                    let va = &tile.verts[poly.verts[j] as usize];
                    let vb = &tile.verts[poly.verts[(j + 1) % nv] as usize];
                    let mut found = [(PolyRef::NULL, 0.0f32, 0.0f32); 4];
                    let n = find_connecting_polys(va, vb, target, opposite_tile(dir), &mut found);
                    for &(nei, amin, amax) in &found[..n] {
                        let (mut tmin, mut tmax) = match dir {
                            0 | 4 => ((amin - va[2]) / (vb[2] - va[2]), (amax - va[2]) / (vb[2] - va[2])),
                            2 | 6 => ((amin - va[0]) / (vb[0] - va[0]), (amax - va[0]) / (vb[0] - va[0])),
                            _ => (0.0, 1.0),
                        };
                        if tmin > tmax {
                            std::mem::swap(&mut tmin, &mut tmax);
                        }
                        pending.push((
                            i,
                            Link {
                                poly_ref: nei,
                                next: None,
                                edge: j as u8,
                                side: dir as u8,
                                bmin: (tmin.clamp(0.0, 1.0) * 255.0).round() as u8,
                                bmax: (tmax.clamp(0.0, 1.0) * 255.0).round() as u8,
                            },
                        ));
                    }
                }
            }
        }

        if !pending.is_empty() {
            trace!(
                "tile {tile_idx}: {} portal links to tile {target_idx} (side {side})",
                pending.len()
            );
        }
        let tile = &mut self.tiles[tile_idx];
        for (poly, link) in pending {
            if !tile.prepend_link(poly, link) {
                warn!("link pool of tile {tile_idx} exhausted");
                break;
            }
        }
    }

    /// Drops every link of `tile_idx` that points into `target_idx`.
    fn unconnect_links(&mut self, tile_idx: usize, target_idx: usize) {
        let tile = &mut self.tiles[tile_idx];
        for i in 0..tile.polys.len() {
            let mut prev: Option<u32> = None;
            let mut cur = tile.polys[i].first_link;
            while let Some(j) = cur {
                let link = tile.links[j as usize];
                if link.poly_ref.tile_index() as usize == target_idx {
                    match prev {
                        None => tile.polys[i].first_link = link.next,
                        Some(p) => tile.links[p as usize].next = link.next,
                    }
                    tile.free_link(j);
                } else {
                    prev = Some(j);
                }
                cur = link.next;
            }
        }
    }

    /// Tile grid location of a world position
    pub fn calc_tile_loc(&self, pos: &[f32; 3]) -> (i32, i32) {
        let tx = ((pos[0] - self.params.origin[0]) / self.params.tile_width).floor() as i32;
        let ty = ((pos[2] - self.params.origin[2]) / self.params.tile_height).floor() as i32;
        (tx, ty)
    }

    pub fn get_tile_at(&self, x: i32, y: i32, layer: i32) -> Option<&MeshTile> {
        self.pos_lookup.get(&(x, y))?.iter().map(|&i| &self.tiles[i]).find(|t| {
            t.header.as_ref().is_some_and(|h| h.layer == layer)
        })
    }

    /// Every layer stored at grid cell (x, y)
    pub fn get_tiles_at(&self, x: i32, y: i32) -> impl Iterator<Item = &MeshTile> + '_ {
        self.pos_lookup
            .get(&(x, y))
            .into_iter()
            .flatten()
            .map(|&i| &self.tiles[i])
    }

    pub fn get_tile_ref_at(&self, x: i32, y: i32, layer: i32) -> TileRef {
        self.get_tile_at(x, y, layer).map_or(TileRef::NULL, MeshTile::tile_ref)
    }

    pub fn get_tile_by_ref(&self, tile_ref: TileRef) -> Option<&MeshTile> {
        if tile_ref.is_null() {
            return None;
        }
        let tile = self.tiles.get(tile_ref.tile_index() as usize)?;
        (tile.is_loaded() && tile.salt == tile_ref.salt()).then_some(tile)
    }

    pub fn get_tile_ref(&self, tile: &MeshTile) -> TileRef {
        tile.tile_ref()
    }

    /// Reference of the tile's first polygon, used as the base of its refs
    pub fn get_poly_ref_base(&self, tile: &MeshTile) -> PolyRef {
        if tile.is_loaded() {
            tile.poly_ref(0)
        } else {
            PolyRef::NULL
        }
    }

    /// Tile by slot index, loaded or not
    pub fn tile_by_index(&self, index: usize) -> Option<&MeshTile> {
        self.tiles.get(index)
    }

    /// Loaded tiles in slot order
    pub fn tiles(&self) -> impl Iterator<Item = &MeshTile> + '_ {
        self.tiles.iter().filter(|t| t.is_loaded())
    }

    /// Resolves a reference without building an error.
    #[inline]
    pub fn try_tile_and_poly(&self, poly_ref: PolyRef) -> Option<(&MeshTile, &Poly)> {
        if poly_ref.is_null() {
            return None;
        }
        let (salt, tile_idx, poly_idx) = poly_ref.decode();
        let tile = self.tiles.get(tile_idx as usize)?;
        if tile.salt != salt || tile.header.is_none() {
            return None;
        }
        let poly = tile.polys.get(poly_idx as usize)?;
        Some((tile, poly))
    }

    pub fn get_tile_and_poly_by_ref(&self, poly_ref: PolyRef) -> Result<(&MeshTile, &Poly)> {
        if poly_ref.is_null() {
            return Err(Error::invalid_param("null polygon reference"));
        }
        let (_, tile_idx, _) = poly_ref.decode();
        if tile_idx as usize >= self.tiles.len() {
            return Err(Error::invalid_param("polygon reference out of range"));
        }
        self.try_tile_and_poly(poly_ref)
            .ok_or_else(|| Error::invalidated("stale polygon reference"))
    }

    fn poly_mut(&mut self, poly_ref: PolyRef) -> Result<&mut Poly> {
        self.get_tile_and_poly_by_ref(poly_ref)?;
        let (_, tile_idx, poly_idx) = poly_ref.decode();
        Ok(&mut self.tiles[tile_idx as usize].polys[poly_idx as usize])
    }

    pub fn is_valid_poly_ref(&self, poly_ref: PolyRef) -> bool {
        self.try_tile_and_poly(poly_ref).is_some()
    }

    pub fn get_poly_flags(&self, poly_ref: PolyRef) -> Result<PolyFlags> {
        Ok(self.get_tile_and_poly_by_ref(poly_ref)?.1.flags)
    }

    pub fn set_poly_flags(&mut self, poly_ref: PolyRef, flags: PolyFlags) -> Result<()> {
        self.poly_mut(poly_ref)?.flags = flags;
        Ok(())
    }

    pub fn get_poly_area(&self, poly_ref: PolyRef) -> Result<u8> {
        Ok(self.get_tile_and_poly_by_ref(poly_ref)?.1.area)
    }

    pub fn set_poly_area(&mut self, poly_ref: PolyRef, area: u8) -> Result<()> {
        if area as usize >= super::MAX_AREAS {
            return Err(Error::invalid_param(format!("area {area} out of range")));
        }
        self.poly_mut(poly_ref)?.area = area;
        Ok(())
    }

    pub fn get_off_mesh_connection_by_ref(&self, poly_ref: PolyRef) -> Result<&OffMeshConnection> {
        let (tile, poly) = self.get_tile_and_poly_by_ref(poly_ref)?;
        if !poly.is_off_mesh_connection() {
            return Err(Error::invalid_param("not an off-mesh connection"));
        }
        let base = tile.header.as_ref().map_or(0, |h| h.off_mesh_base.max(0) as usize);
        let idx = (poly_ref.poly_index() as usize)
            .checked_sub(base)
            .ok_or_else(|| Error::invalid_param("off-mesh polygon below off-mesh base"))?;
        tile.off_mesh_cons
            .get(idx)
            .ok_or_else(|| Error::invalid_param("polygon has no off-mesh connection"))
    }

    /// Entry and exit points of an off-mesh connection approached from `prev_ref`.
    pub fn get_off_mesh_connection_poly_end_points(
        &self,
        prev_ref: PolyRef,
        poly_ref: PolyRef,
    ) -> Result<([f32; 3], [f32; 3])> {
        let (tile, poly) = self.get_tile_and_poly_by_ref(poly_ref)?;
        if !poly.is_off_mesh_connection() {
            return Err(Error::invalid_param("not an off-mesh connection"));
        }

        let (mut idx0, mut idx1) = (0, 1);
        if let Some(link) = tile.links_of(poly).find(|l| l.edge == 0) {
            if link.poly_ref != prev_ref {
                idx0 = 1;
                idx1 = 0;
            }
        }

        Ok((
            tile.verts[poly.verts[idx0] as usize],
            tile.verts[poly.verts[idx1] as usize],
        ))
    }

    /// Closest point on a polygon and whether `pos` lies over it.
    pub fn closest_point_on_poly(&self, poly_ref: PolyRef, pos: &[f32; 3]) -> Result<([f32; 3], bool)> {
        let (tile, _) = self.get_tile_and_poly_by_ref(poly_ref)?;
        Ok(tile.closest_point_on_poly(poly_ref.poly_index() as usize, pos))
    }

    /// Detail mesh height under `pos`; `None` when `pos` is outside the polygon.
    pub fn get_poly_height(&self, poly_ref: PolyRef, pos: &[f32; 3]) -> Result<Option<f32>> {
        let (tile, _) = self.get_tile_and_poly_by_ref(poly_ref)?;
        Ok(tile.get_poly_height(poly_ref.poly_index() as usize, pos))
    }

    pub fn find_nearest_poly_in_tile(
        &self,
        tile: &MeshTile,
        center: &[f32; 3],
        half_extents: &[f32; 3],
    ) -> Option<(PolyRef, [f32; 3])> {
        tile.find_nearest_poly(center, half_extents)
    }
}
