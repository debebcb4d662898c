//! Navigation mesh builder for creating properly formatted tile data
//!
//! Converts already triangulated polygon data (the output of a voxel build
//! pipeline) into a tile blob that [`NavMesh::add_tile`](crate::NavMesh::add_tile)
//! accepts. Border edges are turned into portal codes, off-mesh connections
//! that start inside the tile become two-vertex polygons, a fan detail mesh
//! is generated when none is supplied and the BV tree is built on request.

use detour_common::{Error, Result};
use log::debug;

use super::binary_format::{encode_tile, TileData};
use super::nav_mesh::{BVNode, OffMeshConnection, Poly, PolyDetail, TileHeader};
use super::{PolyFlags, PolyType, EXT_LINK, MAX_VERTS_PER_POLY, MESH_NULL_IDX, OFFMESH_CON_BIDIR};

/// Polygon data for one tile.
///
/// `polys` holds `2 * nvp` entries per polygon: vertex indices padded with
/// `MESH_NULL_IDX`, then neighbour codes. A neighbour code is a polygon index,
/// `MESH_NULL_IDX` for a solid edge, or `0x8000 | dir` for a tile border edge
/// (dir 0 = -x, 1 = +z, 2 = +x, 3 = -z, 0xf = border without portal).
///
/// Detail meshes are `[vert_base, vert_count, tri_base, tri_count]`; the
/// first vertices of each detail mesh repeat the polygon vertices.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct NavMeshCreateParams {
    /// Polygon vertices in world space
    pub verts: Vec<[f32; 3]>,
    pub polys: Vec<u16>,
    pub poly_flags: Vec<PolyFlags>,
    pub poly_areas: Vec<u8>,
    /// Maximum vertices per polygon in `polys`
    pub nvp: usize,

    pub detail_meshes: Vec<[u32; 4]>,
    pub detail_verts: Vec<[f32; 3]>,
    pub detail_tris: Vec<[u8; 4]>,

    /// Off-mesh connection end points \[sx, sy, sz, ex, ey, ez\]
    pub off_mesh_con_verts: Vec<[f32; 6]>,
    pub off_mesh_con_rad: Vec<f32>,
    pub off_mesh_con_flags: Vec<PolyFlags>,
    pub off_mesh_con_areas: Vec<u8>,
    /// `OFFMESH_CON_BIDIR` for two-way connections, 0 for one-way
    pub off_mesh_con_dir: Vec<u8>,
    pub off_mesh_con_user_id: Vec<u32>,

    pub user_id: u32,
    pub tile_x: i32,
    pub tile_y: i32,
    pub tile_layer: i32,
    pub bmin: [f32; 3],
    pub bmax: [f32; 3],

    pub walkable_height: f32,
    pub walkable_radius: f32,
    pub walkable_climb: f32,
    /// Cell size; the BV tree quantizes with `1 / cs`
    pub cs: f32,
    pub ch: f32,
    pub build_bv_tree: bool,
}

impl Default for NavMeshCreateParams {
    fn default() -> Self {
        Self {
            verts: Vec::new(),
            polys: Vec::new(),
            poly_flags: Vec::new(),
            poly_areas: Vec::new(),
            nvp: MAX_VERTS_PER_POLY,
            detail_meshes: Vec::new(),
            detail_verts: Vec::new(),
            detail_tris: Vec::new(),
            off_mesh_con_verts: Vec::new(),
            off_mesh_con_rad: Vec::new(),
            off_mesh_con_flags: Vec::new(),
            off_mesh_con_areas: Vec::new(),
            off_mesh_con_dir: Vec::new(),
            off_mesh_con_user_id: Vec::new(),
            user_id: 0,
            tile_x: 0,
            tile_y: 0,
            tile_layer: 0,
            bmin: [0.0; 3],
            bmax: [0.0; 3],
            walkable_height: 2.0,
            walkable_radius: 0.6,
            walkable_climb: 0.9,
            cs: 0.3,
            ch: 0.2,
            build_bv_tree: true,
        }
    }
}

impl NavMeshCreateParams {
    pub fn poly_count(&self) -> usize {
        if self.nvp == 0 {
            0
        } else {
            self.polys.len() / (self.nvp * 2)
        }
    }

    pub fn off_mesh_con_count(&self) -> usize {
        self.off_mesh_con_verts.len()
    }
}

/// Where an off-mesh end point lies relative to the tile box
fn classify_off_mesh_point(pt: &[f32; 3], bmin: &[f32; 3], bmax: &[f32; 3]) -> u8 {
    const XP: u8 = 1 << 0;
    const ZP: u8 = 1 << 1;
    const XM: u8 = 1 << 2;
    const ZM: u8 = 1 << 3;

    let mut outcode = 0;
    if pt[0] >= bmax[0] {
        outcode |= XP;
    }
    if pt[2] >= bmax[2] {
        outcode |= ZP;
    }
    if pt[0] < bmin[0] {
        outcode |= XM;
    }
    if pt[2] < bmin[2] {
        outcode |= ZM;
    }

    match outcode {
        XP => 0,
        o if o == XP | ZP => 1,
        ZP => 2,
        o if o == XM | ZP => 3,
        XM => 4,
        o if o == XM | ZM => 5,
        ZM => 6,
        o if o == XP | ZM => 7,
        _ => 0xff,
    }
}

#[derive(Clone, Copy)]
struct BVItem {
    bmin: [u16; 3],
    bmax: [u16; 3],
    i: i32,
}

/// Builder for creating navigation mesh tiles from polygon mesh data
pub struct NavMeshBuilder;

impl NavMeshBuilder {
    /// Builds and serializes a tile.
    pub fn create_nav_mesh_data(params: &NavMeshCreateParams) -> Result<Vec<u8>> {
        let tile = Self::build_tile(params)?;
        debug!(
            "built tile ({}, {}, layer {}): {} polygons, {} off-mesh connections, {} BV nodes",
            params.tile_x,
            params.tile_y,
            params.tile_layer,
            tile.polys.len(),
            tile.off_mesh_cons.len(),
            tile.bv_tree.len()
        );
        encode_tile(&tile)
    }

    /// Builds the decoded form of a tile.
    pub fn build_tile(params: &NavMeshCreateParams) -> Result<TileData> {
        Self::validate_params(params)?;

        let nvp = params.nvp;
        let poly_count = params.poly_count();
        let con_count = params.off_mesh_con_count();

        // Height range of the tile, used to drop off-mesh starts far above or below it.
        let heights = if params.detail_meshes.is_empty() {
            params.verts.iter()
        } else {
            params.detail_verts.iter()
        };
        let (mut hmin, mut hmax) = heights.fold((f32::MAX, f32::MIN), |(lo, hi), v| (lo.min(v[1]), hi.max(v[1])));
        hmin -= params.walkable_climb;
        hmax += params.walkable_climb;
        let mut bmin = params.bmin;
        let mut bmax = params.bmax;
        bmin[1] = hmin;
        bmax[1] = hmax;

        let mut con_class = Vec::with_capacity(con_count);
        let mut stored_cons = 0usize;
        let mut off_mesh_link_count = 0usize;
        for pos in &params.off_mesh_con_verts {
            let start = [pos[0], pos[1], pos[2]];
            let end = [pos[3], pos[4], pos[5]];
            let mut start_class = classify_off_mesh_point(&start, &bmin, &bmax);
            let end_class = classify_off_mesh_point(&end, &bmin, &bmax);
            if start_class == 0xff && (start[1] < bmin[1] || start[1] > bmax[1]) {
                start_class = 0;
            }
            if start_class == 0xff {
                off_mesh_link_count += 1;
                stored_cons += 1;
            }
            if end_class == 0xff {
                off_mesh_link_count += 1;
            }
            con_class.push((start_class, end_class));
        }

        let mut edge_count = 0usize;
        let mut portal_count = 0usize;
        for p in params.polys.chunks_exact(nvp * 2) {
            for j in 0..nvp {
                if p[j] == MESH_NULL_IDX {
                    break;
                }
                edge_count += 1;
                if p[nvp + j] & 0x8000 != 0 && p[nvp + j] & 0xf != 0xf {
                    portal_count += 1;
                }
            }
        }
        let max_link_count = edge_count + portal_count * 2 + off_mesh_link_count * 2;

        let mut tile = TileData::default();

        // Vertices: ground polygons, then two per stored connection.
        tile.verts = params.verts.clone();
        let off_mesh_vert_base = tile.verts.len();
        for (pos, class) in params.off_mesh_con_verts.iter().zip(&con_class) {
            if class.0 == 0xff {
                tile.verts.push([pos[0], pos[1], pos[2]]);
                tile.verts.push([pos[3], pos[4], pos[5]]);
            }
        }

        for (i, p) in params.polys.chunks_exact(nvp * 2).enumerate() {
            let mut poly = Poly {
                flags: params.poly_flags[i],
                area: params.poly_areas[i] & 0x3f,
                poly_type: PolyType::Ground,
                ..Default::default()
            };
            for j in 0..nvp {
                if p[j] == MESH_NULL_IDX {
                    break;
                }
                poly.verts[j] = p[j];
                let nei = p[nvp + j];
                poly.neis[j] = if nei & 0x8000 != 0 {
                    match nei & 0xf {
                        0 => EXT_LINK | 4,
                        1 => EXT_LINK | 2,
                        2 => EXT_LINK,
                        3 => EXT_LINK | 6,
                        _ => 0,
                    }
                } else {
                    // MESH_NULL_IDX wraps to 0, a solid edge.
                    nei.wrapping_add(1)
                };
                poly.vert_count += 1;
            }
            tile.polys.push(poly);
        }

        let mut n = 0usize;
        for (c, class) in con_class.iter().enumerate() {
            if class.0 != 0xff {
                continue;
            }
            let poly_idx = poly_count + n;
            let v = (off_mesh_vert_base + n * 2) as u16;
            let mut poly = Poly {
                flags: params.off_mesh_con_flags[c],
                area: params.off_mesh_con_areas[c] & 0x3f,
                poly_type: PolyType::OffMeshConnection,
                vert_count: 2,
                ..Default::default()
            };
            poly.verts[0] = v;
            poly.verts[1] = v + 1;
            tile.polys.push(poly);

            tile.off_mesh_cons.push(OffMeshConnection {
                pos: params.off_mesh_con_verts[c],
                rad: params.off_mesh_con_rad[c],
                poly: poly_idx as u16,
                flags: params.off_mesh_con_dir[c] & OFFMESH_CON_BIDIR,
                side: class.1,
                user_id: params.off_mesh_con_user_id.get(c).copied().unwrap_or(0),
            });
            n += 1;
        }

        Self::build_detail(params, &mut tile)?;

        if params.build_bv_tree {
            tile.bv_tree = Self::build_bv_tree(params, &tile, poly_count);
        }

        tile.header = TileHeader {
            x: params.tile_x,
            y: params.tile_y,
            layer: params.tile_layer,
            user_id: params.user_id,
            poly_count: (poly_count + stored_cons) as i32,
            vert_count: tile.verts.len() as i32,
            max_link_count: max_link_count as i32,
            detail_mesh_count: tile.detail_meshes.len() as i32,
            detail_vert_count: tile.detail_verts.len() as i32,
            detail_tri_count: tile.detail_tris.len() as i32,
            bv_node_count: tile.bv_tree.len() as i32,
            off_mesh_con_count: stored_cons as i32,
            off_mesh_base: poly_count as i32,
            walkable_height: params.walkable_height,
            walkable_radius: params.walkable_radius,
            walkable_climb: params.walkable_climb,
            bmin: params.bmin,
            bmax: params.bmax,
            bv_quant_factor: 1.0 / params.cs,
        };

        Ok(tile)
    }

    fn validate_params(params: &NavMeshCreateParams) -> Result<()> {
        if !(3..=MAX_VERTS_PER_POLY).contains(&params.nvp) {
            return Err(Error::invalid_param(format!("nvp {} out of range", params.nvp)));
        }
        if params.verts.is_empty() || params.verts.len() >= MESH_NULL_IDX as usize {
            return Err(Error::invalid_param(format!("{} vertices", params.verts.len())));
        }
        let poly_count = params.poly_count();
        if poly_count == 0 || params.polys.len() != poly_count * params.nvp * 2 {
            return Err(Error::invalid_param("polygon array is empty or not a multiple of 2 * nvp"));
        }
        if params.poly_flags.len() != poly_count || params.poly_areas.len() != poly_count {
            return Err(Error::invalid_param("poly_flags and poly_areas must have one entry per polygon"));
        }
        if !params.detail_meshes.is_empty() && params.detail_meshes.len() != poly_count {
            return Err(Error::invalid_param("detail_meshes must have one entry per polygon"));
        }
        for p in params.polys.chunks_exact(params.nvp * 2) {
            let nv = p[..params.nvp].iter().take_while(|&&v| v != MESH_NULL_IDX).count();
            if nv < 3 || p[..nv].iter().any(|&v| v as usize >= params.verts.len()) {
                return Err(Error::invalid_param("polygon with fewer than 3 or dangling vertices"));
            }
        }
        let con_count = params.off_mesh_con_count();
        if params.off_mesh_con_rad.len() != con_count
            || params.off_mesh_con_flags.len() != con_count
            || params.off_mesh_con_areas.len() != con_count
            || params.off_mesh_con_dir.len() != con_count
        {
            return Err(Error::invalid_param("off-mesh connection arrays differ in length"));
        }
        if poly_count + con_count > 0xffff {
            return Err(Error::invalid_param("too many polygons for one tile"));
        }
        if !(params.cs > 0.0) {
            return Err(Error::invalid_param("cell size must be positive"));
        }
        Ok(())
    }

    fn build_detail(params: &NavMeshCreateParams, tile: &mut TileData) -> Result<()> {
        let ground = &tile.polys[..params.poly_count()];

        if params.detail_meshes.is_empty() {
            // Triangle fan per polygon; every vertex is a polygon vertex.
            for poly in ground {
                let nv = poly.vert_count();
                tile.detail_meshes.push(PolyDetail {
                    vert_base: 0,
                    tri_base: tile.detail_tris.len() as u32,
                    vert_count: 0,
                    tri_count: (nv - 2) as u8,
                });
                for j in 2..nv {
                    let mut flags = 1 << 2;
                    if j == 2 {
                        flags |= 1;
                    }
                    if j == nv - 1 {
                        flags |= 1 << 4;
                    }
                    tile.detail_tris.push([0, (j - 1) as u8, j as u8, flags]);
                }
            }
            return Ok(());
        }

        for (i, (dm, poly)) in params.detail_meshes.iter().zip(ground).enumerate() {
            let nv = poly.vert_count();
            let vb = dm[0] as usize;
            let ndv = dm[1] as usize;
            if ndv < nv || vb + ndv > params.detail_verts.len() {
                return Err(Error::invalid_param(format!("detail mesh {i} vertex range is invalid")));
            }
            tile.detail_meshes.push(PolyDetail {
                vert_base: tile.detail_verts.len() as u32,
                tri_base: dm[2],
                vert_count: (ndv - nv) as u8,
                tri_count: dm[3] as u8,
            });
            tile.detail_verts.extend_from_slice(&params.detail_verts[vb + nv..vb + ndv]);
        }
        tile.detail_tris = params.detail_tris.clone();
        Ok(())
    }

    fn build_bv_tree(params: &NavMeshCreateParams, tile: &TileData, poly_count: usize) -> Vec<BVNode> {
        let quant = 1.0 / params.cs;
        let quantize = |v: f32, k: usize| ((v - params.bmin[k]) * quant).clamp(0.0, 65535.0) as u16;

        let mut items: Vec<BVItem> = (0..poly_count)
            .map(|i| {
                let poly = &tile.polys[i];
                let mut lo = [f32::MAX; 3];
                let mut hi = [f32::MIN; 3];
                let mut grow = |v: &[f32; 3]| {
                    for k in 0..3 {
                        lo[k] = lo[k].min(v[k]);
                        hi[k] = hi[k].max(v[k]);
                    }
                };
                for &vi in &poly.verts[..poly.vert_count()] {
                    grow(&tile.verts[vi as usize]);
                }
                if let Some(pd) = tile.detail_meshes.get(i) {
                    let base = pd.vert_base as usize;
                    for v in &tile.detail_verts[base..base + pd.vert_count as usize] {
                        grow(v);
                    }
                }
                BVItem {
                    bmin: [quantize(lo[0], 0), quantize(lo[1], 1), quantize(lo[2], 2)],
                    bmax: [quantize(hi[0], 0), quantize(hi[1], 1), quantize(hi[2], 2)],
                    i: i as i32,
                }
            })
            .collect();

        let mut nodes = Vec::with_capacity(poly_count * 2);
        if !items.is_empty() {
            subdivide(&mut items, &mut nodes);
        }
        nodes
    }
}

fn subdivide(items: &mut [BVItem], nodes: &mut Vec<BVNode>) {
    let icur = nodes.len();
    if let [item] = items {
        nodes.push(BVNode {
            bmin: item.bmin,
            bmax: item.bmax,
            i: item.i,
        });
        return;
    }

    let mut node = BVNode {
        bmin: items[0].bmin,
        bmax: items[0].bmax,
        i: 0,
    };
    for it in &items[1..] {
        for k in 0..3 {
            node.bmin[k] = node.bmin[k].min(it.bmin[k]);
            node.bmax[k] = node.bmax[k].max(it.bmax[k]);
        }
    }
    nodes.push(node);

    let extent = [
        node.bmax[0] - node.bmin[0],
        node.bmax[1] - node.bmin[1],
        node.bmax[2] - node.bmin[2],
    ];
    let mut axis = 0;
    if extent[1] > extent[axis] {
        axis = 1;
    }
    if extent[2] > extent[axis] {
        axis = 2;
    }
    items.sort_by_key(|it| it.bmin[axis]);

    let split = items.len() / 2;
    let (left, right) = items.split_at_mut(split);
    subdivide(left, nodes);
    subdivide(right, nodes);

    // Negative escape index: skip this whole subtree.
    nodes[icur].i = -((nodes.len() - icur) as i32);
}
