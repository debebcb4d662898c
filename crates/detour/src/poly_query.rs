//! Polygon query visitors
//!
//! [`NavMeshQuery::query_polygons_with`](crate::NavMeshQuery::query_polygons_with)
//! hands the polygons that overlap a box to a [`PolyQuery`] in per-tile batches.

use detour_common::{vlen_sqr, vsub};

use super::{MeshTile, PolyRef};

/// Number of references handed to `PolyQuery::process` at once
pub const POLY_QUERY_BATCH: usize = 32;

/// Receives the polygons touched by an area query.
pub trait PolyQuery {
    /// Called for each batch of polygons, all from `tile`, that passed the
    /// filter. Called several times for a single query.
    fn process(&mut self, tile: &MeshTile, refs: &[PolyRef]);
}

/// Collects polygon references into a caller buffer.
pub struct CollectPolysQuery<'b> {
    polys: &'b mut [PolyRef],
    count: usize,
    overflow: bool,
}

impl<'b> CollectPolysQuery<'b> {
    pub fn new(polys: &'b mut [PolyRef]) -> Self {
        Self {
            polys,
            count: 0,
            overflow: false,
        }
    }

    pub fn polys(&self) -> &[PolyRef] {
        &self.polys[..self.count]
    }

    pub fn num_collected(&self) -> usize {
        self.count
    }

    /// True if more polygons matched than the buffer holds.
    pub fn overflow(&self) -> bool {
        self.overflow
    }
}

impl PolyQuery for CollectPolysQuery<'_> {
    fn process(&mut self, _tile: &MeshTile, refs: &[PolyRef]) {
        let remaining = self.polys.len() - self.count;
        let n = refs.len().min(remaining);
        if n < refs.len() {
            self.overflow = true;
        }
        self.polys[self.count..self.count + n].copy_from_slice(&refs[..n]);
        self.count += n;
    }
}

/// Finds the polygon nearest to a point.
///
/// A point above a polygon counts as touching it while the vertical gap is
/// within the tile's walkable climb.
pub struct FindNearestPolyQuery {
    center: [f32; 3],
    nearest_distance_sqr: f32,
    nearest_ref: PolyRef,
    nearest_point: [f32; 3],
    over_poly: bool,
}

impl FindNearestPolyQuery {
    pub fn new(center: &[f32; 3]) -> Self {
        Self {
            center: *center,
            nearest_distance_sqr: f32::MAX,
            nearest_ref: PolyRef::NULL,
            nearest_point: *center,
            over_poly: false,
        }
    }

    pub fn nearest_ref(&self) -> PolyRef {
        self.nearest_ref
    }

    pub fn nearest_point(&self) -> &[f32; 3] {
        &self.nearest_point
    }

    pub fn is_over_poly(&self) -> bool {
        self.over_poly
    }

    pub fn nearest_distance_sqr(&self) -> f32 {
        self.nearest_distance_sqr
    }
}

impl PolyQuery for FindNearestPolyQuery {
    fn process(&mut self, tile: &MeshTile, refs: &[PolyRef]) {
        let climb = tile.walkable_climb();
        for &poly_ref in refs {
            let (closest, over) = tile.closest_point_on_poly(poly_ref.poly_index() as usize, &self.center);
            let diff = vsub(&self.center, &closest);
            let d = if over {
                let h = diff[1].abs() - climb;
                if h > 0.0 {
                    h * h
                } else {
                    0.0
                }
            } else {
                vlen_sqr(&diff)
            };

            if d < self.nearest_distance_sqr {
                self.nearest_distance_sqr = d;
                self.nearest_ref = poly_ref;
                self.nearest_point = closest;
                self.over_poly = over;
            }
        }
    }
}
