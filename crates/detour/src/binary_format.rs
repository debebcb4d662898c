//! Tile blob layout
//!
//! A tile travels as a little-endian byte blob: header, vertices, polygons,
//! a zeroed link region sized for the link pool, detail meshes, detail
//! vertices, detail triangles, BV nodes and off-mesh connections. Every
//! section is 4-byte aligned. [`decode_tile`] validates sizes and indices
//! before anything touches a mesh.

use std::io::{Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use detour_common::{align4, Error, Result};

use super::nav_mesh::{BVNode, OffMeshConnection, Poly, PolyDetail, TileHeader};
use super::{PolyFlags, PolyType, EXT_LINK, MAX_VERTS_PER_POLY};

/// Magic number of a tile blob ('DNAV')
pub const NAVMESH_MAGIC: u32 =
    (b'D' as u32) << 24 | (b'N' as u32) << 16 | (b'A' as u32) << 8 | b'V' as u32;

/// Tile blob version
pub const NAVMESH_VERSION: i32 = 7;

const HEADER_SIZE: usize = 100;
const VERT_SIZE: usize = 12;
const POLY_SIZE: usize = 32;
const LINK_SIZE: usize = 12;
const DETAIL_MESH_SIZE: usize = 12;
const DETAIL_TRI_SIZE: usize = 4;
const BV_NODE_SIZE: usize = 16;
const OFF_MESH_CON_SIZE: usize = 36;

const NULL_LINK: u32 = 0xffff_ffff;

/// Decoded contents of a tile blob
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TileData {
    pub header: TileHeader,
    pub verts: Vec<[f32; 3]>,
    pub polys: Vec<Poly>,
    pub detail_meshes: Vec<PolyDetail>,
    pub detail_verts: Vec<[f32; 3]>,
    pub detail_tris: Vec<[u8; 4]>,
    pub bv_tree: Vec<BVNode>,
    pub off_mesh_cons: Vec<OffMeshConnection>,
}

impl TileHeader {
    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            x: reader.read_i32::<LittleEndian>()?,
            y: reader.read_i32::<LittleEndian>()?,
            layer: reader.read_i32::<LittleEndian>()?,
            user_id: reader.read_u32::<LittleEndian>()?,
            poly_count: reader.read_i32::<LittleEndian>()?,
            vert_count: reader.read_i32::<LittleEndian>()?,
            max_link_count: reader.read_i32::<LittleEndian>()?,
            detail_mesh_count: reader.read_i32::<LittleEndian>()?,
            detail_vert_count: reader.read_i32::<LittleEndian>()?,
            detail_tri_count: reader.read_i32::<LittleEndian>()?,
            bv_node_count: reader.read_i32::<LittleEndian>()?,
            off_mesh_con_count: reader.read_i32::<LittleEndian>()?,
            off_mesh_base: reader.read_i32::<LittleEndian>()?,
            walkable_height: reader.read_f32::<LittleEndian>()?,
            walkable_radius: reader.read_f32::<LittleEndian>()?,
            walkable_climb: reader.read_f32::<LittleEndian>()?,
            bmin: read_vec3(reader)?,
            bmax: read_vec3(reader)?,
            bv_quant_factor: reader.read_f32::<LittleEndian>()?,
        })
    }

    /// Writes the header including magic and version.
    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<LittleEndian>(NAVMESH_MAGIC)?;
        writer.write_i32::<LittleEndian>(NAVMESH_VERSION)?;
        writer.write_i32::<LittleEndian>(self.x)?;
        writer.write_i32::<LittleEndian>(self.y)?;
        writer.write_i32::<LittleEndian>(self.layer)?;
        writer.write_u32::<LittleEndian>(self.user_id)?;
        writer.write_i32::<LittleEndian>(self.poly_count)?;
        writer.write_i32::<LittleEndian>(self.vert_count)?;
        writer.write_i32::<LittleEndian>(self.max_link_count)?;
        writer.write_i32::<LittleEndian>(self.detail_mesh_count)?;
        writer.write_i32::<LittleEndian>(self.detail_vert_count)?;
        writer.write_i32::<LittleEndian>(self.detail_tri_count)?;
        writer.write_i32::<LittleEndian>(self.bv_node_count)?;
        writer.write_i32::<LittleEndian>(self.off_mesh_con_count)?;
        writer.write_i32::<LittleEndian>(self.off_mesh_base)?;
        writer.write_f32::<LittleEndian>(self.walkable_height)?;
        writer.write_f32::<LittleEndian>(self.walkable_radius)?;
        writer.write_f32::<LittleEndian>(self.walkable_climb)?;
        write_vec3(writer, &self.bmin)?;
        write_vec3(writer, &self.bmax)?;
        writer.write_f32::<LittleEndian>(self.bv_quant_factor)?;
        Ok(())
    }

    fn counts(&self) -> Result<SectionCounts> {
        let count = |value: i32, what: &str| {
            usize::try_from(value).map_err(|_| Error::invalid_param(format!("negative {what} count {value}")))
        };
        Ok(SectionCounts {
            verts: count(self.vert_count, "vertex")?,
            polys: count(self.poly_count, "polygon")?,
            links: count(self.max_link_count, "link")?,
            detail_meshes: count(self.detail_mesh_count, "detail mesh")?,
            detail_verts: count(self.detail_vert_count, "detail vertex")?,
            detail_tris: count(self.detail_tri_count, "detail triangle")?,
            bv_nodes: count(self.bv_node_count, "BV node")?,
            off_mesh_cons: count(self.off_mesh_con_count, "off-mesh connection")?,
        })
    }
}

struct SectionCounts {
    verts: usize,
    polys: usize,
    links: usize,
    detail_meshes: usize,
    detail_verts: usize,
    detail_tris: usize,
    bv_nodes: usize,
    off_mesh_cons: usize,
}

impl SectionCounts {
    fn blob_size(&self) -> usize {
        align4(HEADER_SIZE)
            + align4(self.verts * VERT_SIZE)
            + align4(self.polys * POLY_SIZE)
            + align4(self.links * LINK_SIZE)
            + align4(self.detail_meshes * DETAIL_MESH_SIZE)
            + align4(self.detail_verts * VERT_SIZE)
            + align4(self.detail_tris * DETAIL_TRI_SIZE)
            + align4(self.bv_nodes * BV_NODE_SIZE)
            + align4(self.off_mesh_cons * OFF_MESH_CON_SIZE)
    }
}

fn read_vec3<R: Read>(reader: &mut R) -> Result<[f32; 3]> {
    Ok([
        reader.read_f32::<LittleEndian>()?,
        reader.read_f32::<LittleEndian>()?,
        reader.read_f32::<LittleEndian>()?,
    ])
}

fn write_vec3<W: Write>(writer: &mut W, v: &[f32; 3]) -> Result<()> {
    for &c in v {
        writer.write_f32::<LittleEndian>(c)?;
    }
    Ok(())
}

fn read_poly<R: Read>(reader: &mut R) -> Result<Poly> {
    let _first_link = reader.read_u32::<LittleEndian>()?;
    let mut poly = Poly::default();
    for v in &mut poly.verts {
        *v = reader.read_u16::<LittleEndian>()?;
    }
    for n in &mut poly.neis {
        *n = reader.read_u16::<LittleEndian>()?;
    }
    poly.flags = PolyFlags::from_bits_retain(reader.read_u16::<LittleEndian>()?);
    poly.vert_count = reader.read_u8()?;
    let area_and_type = reader.read_u8()?;
    poly.area = area_and_type & 0x3f;
    poly.poly_type = PolyType::from_u8(area_and_type >> 6)
        .ok_or_else(|| Error::invalid_param(format!("unknown polygon type {}", area_and_type >> 6)))?;
    Ok(poly)
}

fn write_poly<W: Write>(writer: &mut W, poly: &Poly) -> Result<()> {
    writer.write_u32::<LittleEndian>(NULL_LINK)?;
    for &v in &poly.verts {
        writer.write_u16::<LittleEndian>(v)?;
    }
    for &n in &poly.neis {
        writer.write_u16::<LittleEndian>(n)?;
    }
    writer.write_u16::<LittleEndian>(poly.flags.bits())?;
    writer.write_u8(poly.vert_count)?;
    writer.write_u8((poly.area & 0x3f) | ((poly.poly_type as u8) << 6))?;
    Ok(())
}

fn read_off_mesh_con<R: Read>(reader: &mut R) -> Result<OffMeshConnection> {
    let mut con = OffMeshConnection::default();
    for p in &mut con.pos {
        *p = reader.read_f32::<LittleEndian>()?;
    }
    con.rad = reader.read_f32::<LittleEndian>()?;
    con.poly = reader.read_u16::<LittleEndian>()?;
    con.flags = reader.read_u8()?;
    con.side = reader.read_u8()?;
    con.user_id = reader.read_u32::<LittleEndian>()?;
    Ok(con)
}

fn write_off_mesh_con<W: Write>(writer: &mut W, con: &OffMeshConnection) -> Result<()> {
    for &p in &con.pos {
        writer.write_f32::<LittleEndian>(p)?;
    }
    writer.write_f32::<LittleEndian>(con.rad)?;
    writer.write_u16::<LittleEndian>(con.poly)?;
    writer.write_u8(con.flags)?;
    writer.write_u8(con.side)?;
    writer.write_u32::<LittleEndian>(con.user_id)?;
    Ok(())
}

fn skip_padding(cursor: &mut Cursor<&[u8]>) {
    let pos = align4(cursor.position() as usize);
    cursor.set_position(pos as u64);
}

fn write_padding(out: &mut Vec<u8>) {
    out.resize(align4(out.len()), 0);
}

/// Parses and validates a tile blob.
pub fn decode_tile(data: &[u8]) -> Result<TileData> {
    if data.len() < HEADER_SIZE {
        return Err(Error::invalid_param(format!(
            "tile blob of {} bytes is shorter than its header",
            data.len()
        )));
    }

    let mut cursor = Cursor::new(data);
    if cursor.read_u32::<LittleEndian>()? != NAVMESH_MAGIC {
        return Err(Error::WrongMagic);
    }
    let version = cursor.read_i32::<LittleEndian>()?;
    if version != NAVMESH_VERSION {
        return Err(Error::WrongVersion {
            found: version,
            expected: NAVMESH_VERSION,
        });
    }

    let header = TileHeader::read_from(&mut cursor)?;
    let counts = header.counts()?;
    let expected = counts.blob_size();
    if data.len() < expected {
        return Err(Error::invalid_param(format!(
            "tile blob truncated: {} bytes, header needs {expected}",
            data.len()
        )));
    }
    skip_padding(&mut cursor);

    let mut tile = TileData {
        header,
        ..Default::default()
    };

    tile.verts.reserve(counts.verts);
    for _ in 0..counts.verts {
        tile.verts.push(read_vec3(&mut cursor)?);
    }
    skip_padding(&mut cursor);

    tile.polys.reserve(counts.polys);
    for _ in 0..counts.polys {
        tile.polys.push(read_poly(&mut cursor)?);
    }
    skip_padding(&mut cursor);

    // Link pool is rebuilt on load.
    cursor.set_position(cursor.position() + align4(counts.links * LINK_SIZE) as u64);

    tile.detail_meshes.reserve(counts.detail_meshes);
    for _ in 0..counts.detail_meshes {
        let pd = PolyDetail {
            vert_base: cursor.read_u32::<LittleEndian>()?,
            tri_base: cursor.read_u32::<LittleEndian>()?,
            vert_count: cursor.read_u8()?,
            tri_count: cursor.read_u8()?,
        };
        cursor.read_u16::<LittleEndian>()?;
        tile.detail_meshes.push(pd);
    }
    skip_padding(&mut cursor);

    tile.detail_verts.reserve(counts.detail_verts);
    for _ in 0..counts.detail_verts {
        tile.detail_verts.push(read_vec3(&mut cursor)?);
    }
    skip_padding(&mut cursor);

    tile.detail_tris.reserve(counts.detail_tris);
    for _ in 0..counts.detail_tris {
        let mut tri = [0u8; 4];
        cursor.read_exact(&mut tri)?;
        tile.detail_tris.push(tri);
    }
    skip_padding(&mut cursor);

    tile.bv_tree.reserve(counts.bv_nodes);
    for _ in 0..counts.bv_nodes {
        let mut node = BVNode::default();
        for b in &mut node.bmin {
            *b = cursor.read_u16::<LittleEndian>()?;
        }
        for b in &mut node.bmax {
            *b = cursor.read_u16::<LittleEndian>()?;
        }
        node.i = cursor.read_i32::<LittleEndian>()?;
        tile.bv_tree.push(node);
    }
    skip_padding(&mut cursor);

    tile.off_mesh_cons.reserve(counts.off_mesh_cons);
    for _ in 0..counts.off_mesh_cons {
        tile.off_mesh_cons.push(read_off_mesh_con(&mut cursor)?);
    }

    validate(&tile)?;
    Ok(tile)
}

/// Rejects blobs whose indices point outside their own sections.
fn validate(tile: &TileData) -> Result<()> {
    let header = &tile.header;
    let poly_count = tile.polys.len();
    let off_mesh_base = usize::try_from(header.off_mesh_base)
        .map_err(|_| Error::invalid_param("negative off-mesh base"))?;
    if off_mesh_base + tile.off_mesh_cons.len() != poly_count {
        return Err(Error::invalid_param(format!(
            "off-mesh base {off_mesh_base} plus {} connections does not match {poly_count} polygons",
            tile.off_mesh_cons.len()
        )));
    }

    for (i, poly) in tile.polys.iter().enumerate() {
        let nv = poly.vert_count();
        let off_mesh = i >= off_mesh_base;
        if off_mesh != poly.is_off_mesh_connection() {
            return Err(Error::invalid_param(format!("polygon {i} has the wrong type")));
        }
        let valid_count = if off_mesh { nv == 2 } else { (3..=MAX_VERTS_PER_POLY).contains(&nv) };
        if !valid_count {
            return Err(Error::invalid_param(format!("polygon {i} has {nv} vertices")));
        }
        if poly.verts[..nv].iter().any(|&v| v as usize >= tile.verts.len()) {
            return Err(Error::invalid_param(format!("polygon {i} references a missing vertex")));
        }
        for &nei in &poly.neis[..nv] {
            if nei != 0 && nei & EXT_LINK == 0 && nei as usize > off_mesh_base {
                return Err(Error::invalid_param(format!("polygon {i} has neighbour {nei} out of range")));
            }
        }
    }

    for (i, pd) in tile.detail_meshes.iter().enumerate() {
        let vert_end = pd.vert_base as usize + pd.vert_count as usize;
        let tri_end = pd.tri_base as usize + pd.tri_count as usize;
        if vert_end > tile.detail_verts.len() || tri_end > tile.detail_tris.len() {
            return Err(Error::invalid_param(format!("detail mesh {i} out of range")));
        }
        let nv = tile.polys.get(i).map_or(0, Poly::vert_count);
        let limit = nv + pd.vert_count as usize;
        let tris = &tile.detail_tris[pd.tri_base as usize..tri_end];
        if tris.iter().any(|t| t[..3].iter().any(|&v| v as usize >= limit)) {
            return Err(Error::invalid_param(format!("detail mesh {i} references a missing vertex")));
        }
    }

    if tile.bv_tree.iter().any(|n| n.i >= 0 && n.i as usize >= poly_count) {
        return Err(Error::invalid_param("BV node references a missing polygon"));
    }

    for (i, con) in tile.off_mesh_cons.iter().enumerate() {
        let is_off_mesh_poly = tile
            .polys
            .get(con.poly as usize)
            .is_some_and(Poly::is_off_mesh_connection);
        if !is_off_mesh_poly {
            return Err(Error::invalid_param(format!(
                "off-mesh connection {i} points at polygon {}",
                con.poly
            )));
        }
    }

    Ok(())
}

/// Serializes tile data. Header counts are taken from the section lengths.
pub fn encode_tile(tile: &TileData) -> Result<Vec<u8>> {
    let count = |n: usize| {
        i32::try_from(n).map_err(|_| Error::invalid_param(format!("section of {n} entries is too large")))
    };
    let mut header = tile.header.clone();
    header.vert_count = count(tile.verts.len())?;
    header.poly_count = count(tile.polys.len())?;
    header.detail_mesh_count = count(tile.detail_meshes.len())?;
    header.detail_vert_count = count(tile.detail_verts.len())?;
    header.detail_tri_count = count(tile.detail_tris.len())?;
    header.bv_node_count = count(tile.bv_tree.len())?;
    header.off_mesh_con_count = count(tile.off_mesh_cons.len())?;
    let counts = header.counts()?;

    let mut out = Vec::with_capacity(counts.blob_size());
    header.write_to(&mut out)?;
    write_padding(&mut out);

    for v in &tile.verts {
        write_vec3(&mut out, v)?;
    }
    write_padding(&mut out);

    for poly in &tile.polys {
        write_poly(&mut out, poly)?;
    }
    write_padding(&mut out);

    out.resize(out.len() + align4(counts.links * LINK_SIZE), 0);

    for pd in &tile.detail_meshes {
        out.write_u32::<LittleEndian>(pd.vert_base)?;
        out.write_u32::<LittleEndian>(pd.tri_base)?;
        out.write_u8(pd.vert_count)?;
        out.write_u8(pd.tri_count)?;
        out.write_u16::<LittleEndian>(0)?;
    }
    write_padding(&mut out);

    for v in &tile.detail_verts {
        write_vec3(&mut out, v)?;
    }
    write_padding(&mut out);

    for tri in &tile.detail_tris {
        out.write_all(tri)?;
    }
    write_padding(&mut out);

    for node in &tile.bv_tree {
        for &b in node.bmin.iter().chain(&node.bmax) {
            out.write_u16::<LittleEndian>(b)?;
        }
        out.write_i32::<LittleEndian>(node.i)?;
    }
    write_padding(&mut out);

    for con in &tile.off_mesh_cons {
        write_off_mesh_con(&mut out, con)?;
    }

    Ok(out)
}
