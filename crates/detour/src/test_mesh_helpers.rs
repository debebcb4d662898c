//! Grid shaped test meshes
//!
//! A [`GridTile`] is a square tile split into `divisions × divisions` quad
//! cells lying flat at y = 0. Cells can be removed or given an area type and
//! off-mesh connections can be added, which covers what the query and crowd
//! tests need without a voxel build pipeline.
//!
//! Cell `(x, z)` spans `[x * cell, (x + 1) * cell]` along X and likewise along
//! Z, offset by the tile origin. With nothing blocked, the polygon index of a
//! cell is `z * divisions + x`.

use detour_common::{Error, Result};

use crate::{
    NavMesh, NavMeshBuilder, NavMeshCreateParams, NavMeshParams, PolyFlags, TileFlags, TileRef,
    MESH_NULL_IDX, OFFMESH_CON_BIDIR,
};

/// Mesh parameters for square tiles anchored at the world origin.
pub fn grid_params(tile_size: f32, max_tiles: u32) -> NavMeshParams {
    NavMeshParams {
        origin: [0.0; 3],
        tile_width: tile_size,
        tile_height: tile_size,
        max_tiles,
        max_polys_per_tile: 256,
    }
}

#[derive(Debug, Clone)]
struct GridOffMesh {
    start: [f32; 3],
    end: [f32; 3],
    rad: f32,
    bidir: bool,
}

/// Builder for one grid tile
#[derive(Debug, Clone)]
pub struct GridTile {
    tile_x: i32,
    tile_y: i32,
    tile_size: f32,
    divisions: usize,
    blocked: Vec<bool>,
    areas: Vec<u8>,
    off_mesh: Vec<GridOffMesh>,
}

impl GridTile {
    pub fn new(tile_x: i32, tile_y: i32, tile_size: f32, divisions: usize) -> Self {
        let cells = divisions * divisions;
        Self {
            tile_x,
            tile_y,
            tile_size,
            divisions,
            blocked: vec![false; cells],
            areas: vec![0; cells],
            off_mesh: Vec::new(),
        }
    }

    /// Removes cell `(x, z)`; its neighbours get a wall on that side.
    pub fn block(mut self, x: usize, z: usize) -> Self {
        if let Some(cell) = self.cell_index(x, z) {
            self.blocked[cell] = true;
        }
        self
    }

    pub fn area(mut self, x: usize, z: usize, area: u8) -> Self {
        if let Some(cell) = self.cell_index(x, z) {
            self.areas[cell] = area;
        }
        self
    }

    /// Adds an off-mesh connection. It is stored in this tile only when
    /// `start` lies inside it.
    pub fn off_mesh(mut self, start: [f32; 3], end: [f32; 3], rad: f32, bidir: bool) -> Self {
        self.off_mesh.push(GridOffMesh { start, end, rad, bidir });
        self
    }

    fn cell_index(&self, x: usize, z: usize) -> Option<usize> {
        (x < self.divisions && z < self.divisions).then_some(z * self.divisions + x)
    }

    fn is_open(&self, x: isize, z: isize) -> bool {
        x >= 0
            && z >= 0
            && self
                .cell_index(x as usize, z as usize)
                .is_some_and(|c| !self.blocked[c])
    }

    /// Tile blob ready for [`NavMesh::add_tile`].
    pub fn build(&self) -> Result<Vec<u8>> {
        NavMeshBuilder::create_nav_mesh_data(&self.create_params()?)
    }

    pub fn create_params(&self) -> Result<NavMeshCreateParams> {
        if self.divisions == 0 || !(self.tile_size > 0.0) {
            return Err(Error::invalid_param("grid needs at least one cell and a positive size"));
        }

        let div = self.divisions;
        let cell = self.tile_size / div as f32;
        let ox = self.tile_x as f32 * self.tile_size;
        let oz = self.tile_y as f32 * self.tile_size;
        let nvp = 6;

        let mut verts = Vec::with_capacity((div + 1) * (div + 1));
        for vz in 0..=div {
            for vx in 0..=div {
                verts.push([ox + vx as f32 * cell, 0.0, oz + vz as f32 * cell]);
            }
        }
        let vert = |x: usize, z: usize| (z * (div + 1) + x) as u16;

        // Polygon index of every open cell.
        let mut poly_of = vec![MESH_NULL_IDX; div * div];
        let mut count = 0u16;
        for (c, slot) in poly_of.iter_mut().enumerate() {
            if !self.blocked[c] {
                *slot = count;
                count += 1;
            }
        }

        let mut polys = Vec::new();
        let mut poly_flags = Vec::new();
        let mut poly_areas = Vec::new();
        for z in 0..div {
            for x in 0..div {
                let c = z * div + x;
                if self.blocked[c] {
                    continue;
                }

                polys.extend_from_slice(&[vert(x, z), vert(x, z + 1), vert(x + 1, z + 1), vert(x + 1, z)]);
                polys.extend_from_slice(&[MESH_NULL_IDX; 2]);

                // Edges: -x, +z, +x, -z.
                let (xi, zi) = (x as isize, z as isize);
                let sides = [(xi - 1, zi, 0u16), (xi, zi + 1, 1), (xi + 1, zi, 2), (xi, zi - 1, 3)];
                for (nx, nz, dir) in sides {
                    let outside = nx < 0 || nz < 0 || nx >= div as isize || nz >= div as isize;
                    let code = if outside {
                        0x8000 | dir
                    } else if self.is_open(nx, nz) {
                        poly_of[nz as usize * div + nx as usize]
                    } else {
                        MESH_NULL_IDX
                    };
                    polys.push(code);
                }
                polys.extend_from_slice(&[MESH_NULL_IDX; 2]);

                poly_flags.push(PolyFlags::WALK);
                poly_areas.push(self.areas[c]);
            }
        }

        let mut params = NavMeshCreateParams {
            verts,
            polys,
            poly_flags,
            poly_areas,
            nvp,
            tile_x: self.tile_x,
            tile_y: self.tile_y,
            bmin: [ox, -1.0, oz],
            bmax: [ox + self.tile_size, 1.0, oz + self.tile_size],
            cs: cell / 4.0,
            ch: 0.1,
            ..Default::default()
        };

        for (i, con) in self.off_mesh.iter().enumerate() {
            params.off_mesh_con_verts.push([
                con.start[0],
                con.start[1],
                con.start[2],
                con.end[0],
                con.end[1],
                con.end[2],
            ]);
            params.off_mesh_con_rad.push(con.rad);
            params.off_mesh_con_flags.push(PolyFlags::WALK | PolyFlags::JUMP);
            params.off_mesh_con_areas.push(0);
            params.off_mesh_con_dir.push(if con.bidir { OFFMESH_CON_BIDIR } else { 0 });
            params.off_mesh_con_user_id.push(1000 + i as u32);
        }

        Ok(params)
    }
}

/// `tiles_x × tiles_y` open grid tiles; blobs are kept by the mesh.
pub fn grid_nav_mesh(tiles_x: i32, tiles_y: i32, tile_size: f32, divisions: usize) -> Result<NavMesh> {
    let max_tiles = (tiles_x * tiles_y).max(1) as u32 * 2;
    let mut nav_mesh = NavMesh::new(grid_params(tile_size, max_tiles))?;
    for y in 0..tiles_y {
        for x in 0..tiles_x {
            let blob = GridTile::new(x, y, tile_size, divisions).build()?;
            nav_mesh.add_tile(blob, TileFlags::empty(), TileRef::NULL)?;
        }
    }
    Ok(nav_mesh)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocked_cells_become_walls() -> Result<()> {
        let params = GridTile::new(0, 0, 6.0, 3).block(1, 1).create_params()?;
        assert_eq!(params.poly_count(), 8);

        // Cell (1, 0) is polygon 1; its +z neighbour is the blocked centre.
        let p = &params.polys[12..24];
        assert_eq!(p[6 + 1], MESH_NULL_IDX);
        assert_eq!(p[6 + 3], 0x8000 | 3);
        assert_eq!(p[6], 0);
        Ok(())
    }

    #[test]
    fn test_off_mesh_arrays_line_up() -> Result<()> {
        let params = GridTile::new(0, 0, 6.0, 3)
            .off_mesh([1.0, 0.0, 1.0], [5.0, 0.0, 5.0], 0.5, true)
            .create_params()?;
        assert_eq!(params.off_mesh_con_count(), 1);
        assert_eq!(params.off_mesh_con_dir, vec![OFFMESH_CON_BIDIR]);
        Ok(())
    }
}
