//! Wall segments around an agent
//!
//! The boundary caches the closest walls found by a local neighbourhood walk
//! from the agent's polygon. It is refreshed when the agent has moved far
//! enough from where it was last built or when one of the walked polygons
//! became invalid.

use detour::{NavMeshQuery, PolyRef, QueryFilter, MAX_VERTS_PER_POLY};
use detour_common::{distance_pt_seg_sqr_2d, sqr, vdist_2d_sqr, Result};

/// Maximum number of wall segments kept
pub const MAX_LOCAL_SEGS: usize = 8;
/// Maximum number of polygons walked
pub const MAX_LOCAL_POLYS: usize = 16;

const MAX_SEGS_PER_POLY: usize = MAX_VERTS_PER_POLY * 3;

/// Wall segment and its squared distance from the boundary center
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BoundarySegment {
    /// `[ax, ay, az, bx, by, bz]`
    pub s: [f32; 6],
    pub dist_sqr: f32,
}

impl BoundarySegment {
    pub fn start(&self) -> [f32; 3] {
        [self.s[0], self.s[1], self.s[2]]
    }

    pub fn end(&self) -> [f32; 3] {
        [self.s[3], self.s[4], self.s[5]]
    }
}

#[derive(Debug, Clone)]
pub struct LocalBoundary {
    center: [f32; 3],
    segs: [BoundarySegment; MAX_LOCAL_SEGS],
    nsegs: usize,
    polys: [PolyRef; MAX_LOCAL_POLYS],
    npolys: usize,
}

impl Default for LocalBoundary {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBoundary {
    pub fn new() -> Self {
        Self {
            center: [f32::MAX; 3],
            segs: [BoundarySegment::default(); MAX_LOCAL_SEGS],
            nsegs: 0,
            polys: [PolyRef::NULL; MAX_LOCAL_POLYS],
            npolys: 0,
        }
    }

    /// Forgets all segments. The next `needs_update` is always true.
    pub fn reset(&mut self) {
        self.center = [f32::MAX; 3];
        self.nsegs = 0;
        self.npolys = 0;
    }

    /// Inserts keeping the segments sorted by distance; the farthest one
    /// drops out when full.
    fn add_segment(&mut self, dist_sqr: f32, s: [f32; 6]) {
        let i = if self.nsegs == 0 {
            0
        } else if dist_sqr >= self.segs[self.nsegs - 1].dist_sqr {
            if self.nsegs >= MAX_LOCAL_SEGS {
                return;
            }
            self.nsegs
        } else {
            let i = self.segs[..self.nsegs]
                .iter()
                .position(|seg| dist_sqr <= seg.dist_sqr)
                .unwrap_or(self.nsegs);
            let end = self.nsegs.min(MAX_LOCAL_SEGS - 1);
            self.segs.copy_within(i..end, i + 1);
            i
        };

        self.segs[i] = BoundarySegment { s, dist_sqr };
        if self.nsegs < MAX_LOCAL_SEGS {
            self.nsegs += 1;
        }
    }

    /// Rebuilds the boundary around `pos`, starting the walk at `poly_ref`.
    ///
    /// Only walls within `collision_query_range` are kept. A null reference
    /// clears the boundary.
    pub fn update(
        &mut self,
        poly_ref: PolyRef,
        pos: &[f32; 3],
        collision_query_range: f32,
        query: &mut NavMeshQuery<'_>,
        filter: &QueryFilter,
    ) -> Result<()> {
        if poly_ref.is_null() {
            self.reset();
            return Ok(());
        }

        self.center = *pos;
        self.nsegs = 0;
        self.npolys = 0;

        let result = match query.find_local_neighbourhood(
            poly_ref,
            pos,
            collision_query_range,
            filter,
            &mut self.polys,
            None,
        ) {
            Ok(result) => result,
            Err(err) => {
                self.reset();
                return Err(err);
            }
        };
        self.npolys = result.count;

        let range_sqr = sqr(collision_query_range);
        let mut segs = [[0.0; 6]; MAX_SEGS_PER_POLY];
        for k in 0..self.npolys {
            let walls = query.get_poly_wall_segments(self.polys[k], filter, &mut segs, None)?;
            for s in &segs[..walls.count] {
                let a = [s[0], s[1], s[2]];
                let b = [s[3], s[4], s[5]];
                let (dist_sqr, _) = distance_pt_seg_sqr_2d(pos, &a, &b);
                if dist_sqr > range_sqr {
                    continue;
                }
                self.add_segment(dist_sqr, *s);
            }
        }
        Ok(())
    }

    /// False when nothing was walked or any walked polygon is gone or now
    /// rejected by the filter.
    pub fn is_valid(&self, query: &NavMeshQuery<'_>, filter: &QueryFilter) -> bool {
        self.npolys > 0 && self.polys[..self.npolys].iter().all(|&r| query.is_valid_poly_ref(r, filter))
    }

    /// True once `pos` is farther than `threshold` from the center on the
    /// XZ plane.
    pub fn needs_update(&self, pos: &[f32; 3], threshold: f32) -> bool {
        self.center[0] == f32::MAX || vdist_2d_sqr(pos, &self.center) > sqr(threshold)
    }

    pub fn center(&self) -> &[f32; 3] {
        &self.center
    }

    /// Segments sorted by distance, nearest first.
    pub fn segments(&self) -> &[BoundarySegment] {
        &self.segs[..self.nsegs]
    }

    pub fn segment_count(&self) -> usize {
        self.nsegs
    }

    pub fn polys(&self) -> &[PolyRef] {
        &self.polys[..self.npolys]
    }
}
