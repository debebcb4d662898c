//! Navigation mesh queries
//!
//! A [`NavMeshQuery`] borrows a [`NavMesh`] and owns the scratch memory its
//! searches need. The scratch memory ([`QueryBuffers`]) can be detached with
//! [`NavMeshQuery::into_buffers`] and re-attached to a later query, which lets
//! a long running owner (the path queue, the crowd) keep its node pools and an
//! in-flight sliced search without holding a borrow of the mesh between frames.
//!
//! Every query writes into caller supplied slices and reports how many entries
//! it wrote through a [`QueryResult`].

use detour_common::{
    distance_pt_poly_edges_sqr, distance_pt_seg_sqr_2d, intersect_seg_seg_2d,
    intersect_segment_poly_2d, overlap_poly_poly_2d, point_in_polygon,
    random_point_in_convex_poly, sqr, tri_area_2d, vdist, vequal, visfinite, vlerp, vnormalize,
    vsub, Error, Result,
};

use super::node_pool::{NodeFlags, NodeIndex, NodePool, NodeQueue, MAX_NODE_POOL_SIZE, NULL_IDX};
use super::{
    CollectPolysQuery, DtStatus, FindNearestPolyQuery, MeshTile, NavMesh, Poly, PolyQuery,
    PolyRef, QueryFilter, QueryResult, RaycastHit, RaycastOptions, EXT_LINK, LINK_SIDE_INTERNAL,
    MAX_VERTS_PER_POLY, POLY_QUERY_BATCH,
};

/// Node pool size used by [`NavMeshQuery::new`]
pub const DEFAULT_MAX_NODES: usize = 2048;

/// Nodes in the small pool used by the local walks
const TINY_POOL_SIZE: usize = 64;

/// Heuristic scale, slightly under one so the estimate stays admissible
const H_SCALE: f32 = 0.999;

/// Breadth first stack size of the local walks
const MAX_LOCAL_STACK: usize = 48;

bitflags::bitflags! {
    /// Describes a vertex of a straight path
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
    pub struct StraightPathFlags: u8 {
        /// First vertex of the path
        const START = 0x01;
        /// Last vertex of the path
        const END = 0x02;
        /// Vertex is the start of an off-mesh connection
        const OFFMESH_CONNECTION = 0x04;
    }
}

bitflags::bitflags! {
    /// Extra vertices [`NavMeshQuery::find_straight_path`] may insert
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
    pub struct StraightPathOptions: u8 {
        /// Add a vertex at every polygon edge where the area type changes
        const AREA_CROSSINGS = 0x01;
        /// Add a vertex at every polygon edge crossing
        const ALL_CROSSINGS = 0x02;
    }
}

/// One vertex of a straight path
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct StraightPathPoint {
    pub pos: [f32; 3],
    pub flags: StraightPathFlags,
    /// Polygon entered at this vertex; null for the end vertex
    pub poly_ref: PolyRef,
}

/// State of a sliced A* search
#[derive(Debug, Clone)]
struct SlicedSearch {
    status: DtStatus,
    last_best: NodeIndex,
    last_best_cost: f32,
    start_ref: PolyRef,
    end_ref: PolyRef,
    start_pos: [f32; 3],
    end_pos: [f32; 3],
    filter: QueryFilter,
}

impl Default for SlicedSearch {
    fn default() -> Self {
        Self {
            status: DtStatus::FAILURE,
            last_best: NULL_IDX,
            last_best_cost: f32::MAX,
            start_ref: PolyRef::NULL,
            end_ref: PolyRef::NULL,
            start_pos: [0.0; 3],
            end_pos: [0.0; 3],
            filter: QueryFilter::default(),
        }
    }
}

/// Scratch memory of a query, including the state of a sliced search.
#[derive(Debug, Clone)]
pub struct QueryBuffers {
    node_pool: NodePool,
    tiny_node_pool: NodePool,
    open_list: NodeQueue,
    sliced: SlicedSearch,
}

impl QueryBuffers {
    /// Allocates buffers for searches of up to `max_nodes` polygons.
    pub fn new(max_nodes: usize) -> Result<Self> {
        if max_nodes == 0 || max_nodes > MAX_NODE_POOL_SIZE {
            return Err(Error::invalid_param(format!(
                "max_nodes must be in 1..={MAX_NODE_POOL_SIZE}, got {max_nodes}"
            )));
        }
        let hash_size = (max_nodes / 4).max(1).next_power_of_two();
        Ok(Self {
            node_pool: NodePool::new(max_nodes, hash_size),
            tiny_node_pool: NodePool::new(TINY_POOL_SIZE, 32),
            open_list: NodeQueue::new(max_nodes),
            sliced: SlicedSearch::default(),
        })
    }

    pub fn max_nodes(&self) -> usize {
        self.node_pool.max_nodes()
    }
}

/// Portal between two adjacent polygons
#[derive(Debug, Clone, Copy)]
struct Portal {
    left: [f32; 3],
    right: [f32; 3],
}

/// Finds the portal from `from` to `to` through the link joining them.
fn portal_points(
    from_ref: PolyRef,
    from_poly: &Poly,
    from_tile: &MeshTile,
    to_ref: PolyRef,
    to_poly: &Poly,
    to_tile: &MeshTile,
) -> Option<Portal> {
    let link = from_tile.links_of(from_poly).find(|l| l.poly_ref == to_ref)?;

    // Off-mesh connections collapse the portal to their end vertex.
    if from_poly.is_off_mesh_connection() {
        let v = from_tile.verts[from_poly.verts[link.edge as usize] as usize];
        return Some(Portal { left: v, right: v });
    }
    if to_poly.is_off_mesh_connection() {
        let back = to_tile.links_of(to_poly).find(|l| l.poly_ref == from_ref)?;
        let v = to_tile.verts[to_poly.verts[back.edge as usize] as usize];
        return Some(Portal { left: v, right: v });
    }

    let nv = from_poly.vert_count();
    let e = link.edge as usize;
    let v0 = from_tile.verts[from_poly.verts[e] as usize];
    let v1 = from_tile.verts[from_poly.verts[(e + 1) % nv] as usize];

    // Tile portals may cover only part of the edge.
    if !link.is_internal() && (link.bmin != 0 || link.bmax != 255) {
        let s = 1.0 / 255.0;
        return Some(Portal {
            left: vlerp(&v0, &v1, link.bmin as f32 * s),
            right: vlerp(&v0, &v1, link.bmax as f32 * s),
        });
    }

    Some(Portal { left: v0, right: v1 })
}

fn edge_mid_point(
    from_ref: PolyRef,
    from_poly: &Poly,
    from_tile: &MeshTile,
    to_ref: PolyRef,
    to_poly: &Poly,
    to_tile: &MeshTile,
) -> Option<[f32; 3]> {
    let portal = portal_points(from_ref, from_poly, from_tile, to_ref, to_poly, to_tile)?;
    Some(vlerp(&portal.left, &portal.right, 0.5))
}

/// Sum of the fan triangle areas, used as a sampling weight.
fn poly_weight(verts: &[[f32; 3]]) -> f32 {
    let mut area = 0.0;
    for j in 2..verts.len() {
        area += tri_area_2d(&verts[0], &verts[j - 1], &verts[j]);
    }
    area
}

#[derive(Debug, Clone, Copy)]
struct Interval {
    poly_ref: PolyRef,
    tmin: i16,
    tmax: i16,
}

const MAX_INTERVAL: usize = 16;

fn insert_interval(ints: &mut [Interval; MAX_INTERVAL], nints: &mut usize, tmin: i16, tmax: i16, poly_ref: PolyRef) {
    if *nints + 1 > MAX_INTERVAL {
        return;
    }
    let mut idx = 0;
    while idx < *nints {
        if tmax <= ints[idx].tmin {
            break;
        }
        idx += 1;
    }
    ints.copy_within(idx..*nints, idx + 1);
    ints[idx] = Interval { poly_ref, tmin, tmax };
    *nints += 1;
}

/// Writes straight path vertices into a caller buffer.
struct StraightPathWriter<'o> {
    out: &'o mut [StraightPathPoint],
    count: usize,
}

impl StraightPathWriter<'_> {
    /// Returns `IN_PROGRESS` while more vertices can be appended.
    fn append_vertex(&mut self, pos: &[f32; 3], flags: StraightPathFlags, poly_ref: PolyRef) -> DtStatus {
        if self.count > 0 && vequal(&self.out[self.count - 1].pos, pos) {
            // Same spot: keep the latest flags and polygon.
            let last = &mut self.out[self.count - 1];
            last.flags = flags;
            last.poly_ref = poly_ref;
        } else {
            self.out[self.count] = StraightPathPoint {
                pos: *pos,
                flags,
                poly_ref,
            };
            self.count += 1;
            if self.count >= self.out.len() {
                return DtStatus::SUCCESS | DtStatus::BUFFER_TOO_SMALL;
            }
            if flags == StraightPathFlags::END {
                return DtStatus::SUCCESS;
            }
        }
        DtStatus::IN_PROGRESS
    }

    fn last_pos(&self) -> [f32; 3] {
        self.out[self.count - 1].pos
    }

    fn truncation(&self) -> DtStatus {
        if self.count >= self.out.len() {
            DtStatus::BUFFER_TOO_SMALL
        } else {
            DtStatus::empty()
        }
    }
}

/// Runs queries against a navigation mesh.
pub struct NavMeshQuery<'a> {
    nav: &'a NavMesh,
    buffers: QueryBuffers,
}

impl<'a> NavMeshQuery<'a> {
    /// Creates a query with a pool of [`DEFAULT_MAX_NODES`] nodes
    pub fn new(nav: &'a NavMesh) -> Self {
        Self {
            nav,
            buffers: QueryBuffers {
                node_pool: NodePool::new(DEFAULT_MAX_NODES, DEFAULT_MAX_NODES / 4),
                tiny_node_pool: NodePool::new(TINY_POOL_SIZE, 32),
                open_list: NodeQueue::new(DEFAULT_MAX_NODES),
                sliced: SlicedSearch::default(),
            },
        }
    }

    pub fn with_max_nodes(nav: &'a NavMesh, max_nodes: usize) -> Result<Self> {
        Ok(Self::with_buffers(nav, QueryBuffers::new(max_nodes)?))
    }

    /// Attaches previously detached buffers, keeping any sliced search state.
    pub fn with_buffers(nav: &'a NavMesh, buffers: QueryBuffers) -> Self {
        Self { nav, buffers }
    }

    /// Releases the mesh borrow and hands back the scratch memory.
    pub fn into_buffers(self) -> QueryBuffers {
        self.buffers
    }

    pub fn nav_mesh(&self) -> &'a NavMesh {
        self.nav
    }

    /// Node pool of the last search, for inspection.
    pub fn node_pool(&self) -> &NodePool {
        &self.buffers.node_pool
    }

    fn tile_and_poly(&self, poly_ref: PolyRef) -> Result<(&'a MeshTile, &'a Poly)> {
        let nav: &'a NavMesh = self.nav;
        nav.get_tile_and_poly_by_ref(poly_ref)
    }

    // ------------------------------------------------------------------
    // Point and area queries
    // ------------------------------------------------------------------

    /// Nearest polygon to `center` within the box `center ± half_extents`.
    ///
    /// Returns a null reference and `center` when nothing is in range.
    pub fn find_nearest_poly(
        &self,
        center: &[f32; 3],
        half_extents: &[f32; 3],
        filter: &QueryFilter,
    ) -> Result<(PolyRef, [f32; 3])> {
        let mut query = FindNearestPolyQuery::new(center);
        self.query_polygons_with(center, half_extents, filter, &mut query)?;
        Ok((query.nearest_ref(), *query.nearest_point()))
    }

    /// Collects the ground polygons overlapping the query box.
    pub fn query_polygons(
        &self,
        center: &[f32; 3],
        half_extents: &[f32; 3],
        filter: &QueryFilter,
        polys: &mut [PolyRef],
    ) -> Result<QueryResult> {
        if polys.is_empty() {
            return Err(Error::invalid_param("polygon buffer is empty"));
        }
        let mut collector = CollectPolysQuery::new(polys);
        self.query_polygons_with(center, half_extents, filter, &mut collector)?;

        let mut status = DtStatus::SUCCESS;
        if collector.overflow() {
            status |= DtStatus::BUFFER_TOO_SMALL;
        }
        let n = collector.num_collected();
        Ok(QueryResult::new(n, n, status))
    }

    /// Feeds the polygons overlapping the query box to `query` in batches.
    pub fn query_polygons_with<Q: PolyQuery + ?Sized>(
        &self,
        center: &[f32; 3],
        half_extents: &[f32; 3],
        filter: &QueryFilter,
        query: &mut Q,
    ) -> Result<()> {
        if !visfinite(center) || !visfinite(half_extents) || half_extents.iter().any(|&e| e < 0.0) {
            return Err(Error::invalid_param("query box must be finite with non-negative extents"));
        }

        let bmin = vsub(center, half_extents);
        let bmax = [
            center[0] + half_extents[0],
            center[1] + half_extents[1],
            center[2] + half_extents[2],
        ];

        let (minx, miny) = self.nav.calc_tile_loc(&bmin);
        let (maxx, maxy) = self.nav.calc_tile_loc(&bmax);

        for y in miny..=maxy {
            for x in minx..=maxx {
                for tile in self.nav.get_tiles_at(x, y) {
                    Self::query_polygons_in_tile(tile, &bmin, &bmax, filter, query);
                }
            }
        }
        Ok(())
    }

    fn query_polygons_in_tile<Q: PolyQuery + ?Sized>(
        tile: &MeshTile,
        qmin: &[f32; 3],
        qmax: &[f32; 3],
        filter: &QueryFilter,
        query: &mut Q,
    ) {
        let mut batch = [PolyRef::NULL; POLY_QUERY_BATCH];
        let mut n = 0;
        tile.query_polygons(qmin, qmax, |i| {
            if !filter.pass_filter(&tile.polys[i]) {
                return;
            }
            batch[n] = tile.poly_ref(i);
            n += 1;
            if n == POLY_QUERY_BATCH {
                query.process(tile, &batch);
                n = 0;
            }
        });
        if n > 0 {
            query.process(tile, &batch[..n]);
        }
    }

    /// Closest point on the polygon and whether `pos` lies over it.
    pub fn closest_point_on_poly(&self, poly_ref: PolyRef, pos: &[f32; 3]) -> Result<([f32; 3], bool)> {
        if !visfinite(pos) {
            return Err(Error::invalid_param("position is not finite"));
        }
        self.nav.closest_point_on_poly(poly_ref, pos)
    }

    /// `pos` itself when it lies inside the polygon on the XZ plane, else the
    /// nearest point on the polygon boundary. Ignores the detail mesh.
    pub fn closest_point_on_poly_boundary(&self, poly_ref: PolyRef, pos: &[f32; 3]) -> Result<[f32; 3]> {
        let (tile, poly) = self.tile_and_poly(poly_ref)?;
        if !visfinite(pos) {
            return Err(Error::invalid_param("position is not finite"));
        }

        let (verts, nv) = tile.poly_verts(poly);
        let mut edged = [0.0; MAX_VERTS_PER_POLY];
        let mut edget = [0.0; MAX_VERTS_PER_POLY];
        let inside = distance_pt_poly_edges_sqr(pos, &verts[..nv], &mut edged, &mut edget);
        if inside {
            return Ok(*pos);
        }

        let mut imin = 0;
        for i in 1..nv {
            if edged[i] < edged[imin] {
                imin = i;
            }
        }
        let va = &verts[imin];
        let vb = &verts[(imin + 1) % nv];
        Ok(vlerp(va, vb, edget[imin]))
    }

    /// Height of the polygon surface under `pos`.
    ///
    /// Off-mesh connections interpolate between their end points. `None` when
    /// `pos` is outside a ground polygon.
    pub fn get_poly_height(&self, poly_ref: PolyRef, pos: &[f32; 3]) -> Result<Option<f32>> {
        let (tile, poly) = self.tile_and_poly(poly_ref)?;
        if !visfinite(pos) {
            return Err(Error::invalid_param("position is not finite"));
        }

        if poly.is_off_mesh_connection() {
            let v0 = tile.verts[poly.verts[0] as usize];
            let v1 = tile.verts[poly.verts[1] as usize];
            let (_, t) = distance_pt_seg_sqr_2d(pos, &v0, &v1);
            return Ok(Some(v0[1] + (v1[1] - v0[1]) * t));
        }

        Ok(tile.get_poly_height(poly_ref.poly_index() as usize, pos))
    }

    /// True when the reference resolves and its polygon passes the filter.
    pub fn is_valid_poly_ref(&self, poly_ref: PolyRef, filter: &QueryFilter) -> bool {
        self.nav
            .try_tile_and_poly(poly_ref)
            .is_some_and(|(_, poly)| filter.pass_filter(poly))
    }

    /// Left and right end points of the portal between two adjacent polygons.
    pub fn get_portal_points(&self, from: PolyRef, to: PolyRef) -> Result<([f32; 3], [f32; 3])> {
        let (from_tile, from_poly) = self.tile_and_poly(from)?;
        let (to_tile, to_poly) = self.tile_and_poly(to)?;
        portal_points(from, from_poly, from_tile, to, to_poly, to_tile)
            .map(|p| (p.left, p.right))
            .ok_or_else(|| Error::invalid_param("polygons are not adjacent"))
    }

    pub fn get_edge_mid_point(&self, from: PolyRef, to: PolyRef) -> Result<[f32; 3]> {
        let (left, right) = self.get_portal_points(from, to)?;
        Ok(vlerp(&left, &right, 0.5))
    }

    // ------------------------------------------------------------------
    // A*
    // ------------------------------------------------------------------

    /// Finds the polygon corridor from `start_ref` to `end_ref`.
    ///
    /// When the end cannot be reached the path leads to the polygon closest to
    /// it and the status carries `PARTIAL_RESULT`.
    pub fn find_path(
        &mut self,
        start_ref: PolyRef,
        end_ref: PolyRef,
        start_pos: &[f32; 3],
        end_pos: &[f32; 3],
        filter: &QueryFilter,
        path: &mut [PolyRef],
    ) -> Result<QueryResult> {
        if path.is_empty() {
            return Err(Error::invalid_param("path buffer is empty"));
        }
        self.init_sliced_find_path(start_ref, end_ref, start_pos, end_pos, filter)?;
        self.update_sliced_find_path(u32::MAX)?;
        self.finalize_sliced_find_path(path)
    }

    /// Starts a sliced search. Returns `IN_PROGRESS`, or `SUCCESS` when start
    /// and end are the same polygon.
    pub fn init_sliced_find_path(
        &mut self,
        start_ref: PolyRef,
        end_ref: PolyRef,
        start_pos: &[f32; 3],
        end_pos: &[f32; 3],
        filter: &QueryFilter,
    ) -> Result<DtStatus> {
        self.buffers.sliced = SlicedSearch::default();

        if !self.nav.is_valid_poly_ref(start_ref) || !self.nav.is_valid_poly_ref(end_ref) {
            return Err(Error::invalid_param("start or end polygon is not valid"));
        }
        if !visfinite(start_pos) || !visfinite(end_pos) {
            return Err(Error::invalid_param("start or end position is not finite"));
        }

        let bufs = &mut self.buffers;
        bufs.sliced = SlicedSearch {
            status: DtStatus::IN_PROGRESS,
            last_best: NULL_IDX,
            last_best_cost: f32::MAX,
            start_ref,
            end_ref,
            start_pos: *start_pos,
            end_pos: *end_pos,
            filter: filter.clone(),
        };

        if start_ref == end_ref {
            bufs.sliced.status = DtStatus::SUCCESS;
            return Ok(DtStatus::SUCCESS);
        }

        bufs.node_pool.clear();
        bufs.open_list.clear();

        let start = bufs.node_pool.get_node(start_ref, 0).ok_or(Error::OutOfNodes)?;
        let heuristic = vdist(start_pos, end_pos) * H_SCALE;
        {
            let node = bufs.node_pool.node_mut(start);
            node.pos = *start_pos;
            node.parent = NULL_IDX;
            node.cost = 0.0;
            node.total = heuristic;
            node.flags = NodeFlags::OPEN;
        }
        bufs.open_list.push(&bufs.node_pool, start);

        bufs.sliced.last_best = start;
        bufs.sliced.last_best_cost = heuristic;

        Ok(DtStatus::IN_PROGRESS)
    }

    /// Status of the current sliced search
    pub fn sliced_status(&self) -> DtStatus {
        self.buffers.sliced.status
    }

    /// Runs up to `max_iter` iterations of the sliced search.
    ///
    /// Returns the iterations done and the search status. A polygon that
    /// disappeared since the previous call fails the search with
    /// [`Error::Invalidated`].
    pub fn update_sliced_find_path(&mut self, max_iter: u32) -> Result<(u32, DtStatus)> {
        let nav = self.nav;
        let bufs = &mut self.buffers;
        let q = &mut bufs.sliced;

        if !q.status.is_in_progress() {
            return Ok((0, q.status));
        }

        if !nav.is_valid_poly_ref(q.start_ref) || !nav.is_valid_poly_ref(q.end_ref) {
            q.status = DtStatus::FAILURE;
            return Err(Error::invalidated("start or end polygon was removed during the search"));
        }

        let mut iter = 0;
        while iter < max_iter {
            let Some(best_idx) = bufs.open_list.pop() else {
                break;
            };
            iter += 1;

            {
                let node = bufs.node_pool.node_mut(best_idx);
                node.flags.remove(NodeFlags::OPEN);
                node.flags.insert(NodeFlags::CLOSED);
            }
            let best = *bufs.node_pool.node(best_idx);

            if best.id == q.end_ref {
                q.last_best = best_idx;
                q.status = DtStatus::success_with(q.status);
                return Ok((iter, q.status));
            }

            let Some((best_tile, best_poly)) = nav.try_tile_and_poly(best.id) else {
                q.status = DtStatus::FAILURE;
                return Err(Error::invalidated("current polygon was removed during the search"));
            };

            let parent_ref = bufs
                .node_pool
                .parent(best_idx)
                .map_or(PolyRef::NULL, |p| bufs.node_pool.node(p).id);
            if parent_ref.is_valid() && !nav.is_valid_poly_ref(parent_ref) {
                q.status = DtStatus::FAILURE;
                return Err(Error::invalidated("parent polygon was removed during the search"));
            }

            for link in best_tile.links_of(best_poly) {
                let neighbour_ref = link.poly_ref;
                if neighbour_ref.is_null() || neighbour_ref == parent_ref {
                    continue;
                }
                let Some((nei_tile, nei_poly)) = nav.try_tile_and_poly(neighbour_ref) else {
                    continue;
                };
                if !q.filter.pass_filter(nei_poly) {
                    continue;
                }

                // Tile crossings get their own node per side.
                let cross_side = if link.side != LINK_SIDE_INTERNAL { link.side >> 1 } else { 0 };

                let Some(nei_idx) = bufs.node_pool.get_node(neighbour_ref, cross_side) else {
                    q.status |= DtStatus::OUT_OF_NODES;
                    continue;
                };

                if bufs.node_pool.node(nei_idx).flags.is_empty() {
                    let Some(mid) = edge_mid_point(best.id, best_poly, best_tile, neighbour_ref, nei_poly, nei_tile)
                    else {
                        continue;
                    };
                    bufs.node_pool.node_mut(nei_idx).pos = mid;
                }
                let nei = *bufs.node_pool.node(nei_idx);

                let (cost, heuristic) = if neighbour_ref == q.end_ref {
                    let cur_cost = q.filter.get_cost(&best.pos, &nei.pos, nei_poly);
                    let end_cost = q.filter.get_cost(&nei.pos, &q.end_pos, nei_poly);
                    (best.cost + cur_cost + end_cost, 0.0)
                } else {
                    let cur_cost = q.filter.get_cost(&best.pos, &nei.pos, nei_poly);
                    (best.cost + cur_cost, vdist(&nei.pos, &q.end_pos) * H_SCALE)
                };
                let total = cost + heuristic;

                if nei.flags.intersects(NodeFlags::OPEN | NodeFlags::CLOSED) && total >= nei.total {
                    continue;
                }

                let was_open = nei.flags.contains(NodeFlags::OPEN);
                {
                    let node = bufs.node_pool.node_mut(nei_idx);
                    node.parent = best_idx;
                    node.flags.remove(NodeFlags::CLOSED);
                    node.cost = cost;
                    node.total = total;
                    node.flags.insert(NodeFlags::OPEN);
                }
                if was_open {
                    bufs.open_list.modify(&bufs.node_pool, nei_idx);
                } else {
                    bufs.open_list.push(&bufs.node_pool, nei_idx);
                }

                if heuristic < q.last_best_cost {
                    q.last_best_cost = heuristic;
                    q.last_best = nei_idx;
                }
            }
        }

        if bufs.open_list.is_empty() {
            // Every reachable polygon is explored; finalize reports the best one.
            q.status = DtStatus::success_with(q.status);
        }

        Ok((iter, q.status))
    }

    /// Writes the result of the sliced search and resets it.
    ///
    /// Called before the search finished, the path leads to the best node so
    /// far and is marked partial.
    pub fn finalize_sliced_find_path(&mut self, path: &mut [PolyRef]) -> Result<QueryResult> {
        if path.is_empty() {
            return Err(Error::invalid_param("path buffer is empty"));
        }
        let q = std::mem::take(&mut self.buffers.sliced);
        if q.status.is_failure() {
            return Err(Error::Failure("no sliced search to finalize".into()));
        }

        if q.start_ref == q.end_ref {
            path[0] = q.start_ref;
            return Ok(QueryResult::new(1, 1, DtStatus::success_with(q.status)));
        }

        let mut details = q.status.details();
        if self.buffers.node_pool.node(q.last_best).id != q.end_ref {
            details |= DtStatus::PARTIAL_RESULT;
        }

        let (count, required) = self.path_to_node(q.last_best, path);
        if required > count {
            details |= DtStatus::BUFFER_TOO_SMALL;
        }
        Ok(QueryResult::new(count, required, DtStatus::success_with(details)))
    }

    /// Like [`finalize_sliced_find_path`](Self::finalize_sliced_find_path),
    /// but ends the path at the furthest polygon of `existing` that the search
    /// visited. Used to replan while keeping the current corridor prefix.
    pub fn finalize_sliced_find_path_partial(
        &mut self,
        existing: &[PolyRef],
        path: &mut [PolyRef],
    ) -> Result<QueryResult> {
        if existing.is_empty() || path.is_empty() {
            return Err(Error::invalid_param("existing path and path buffer must not be empty"));
        }
        let q = std::mem::take(&mut self.buffers.sliced);
        if q.status.is_failure() {
            return Err(Error::Failure("no sliced search to finalize".into()));
        }

        if q.start_ref == q.end_ref {
            path[0] = q.start_ref;
            return Ok(QueryResult::new(1, 1, DtStatus::success_with(q.status)));
        }

        let mut details = q.status.details();
        let mut found = [NULL_IDX; 1];
        let mut node = NULL_IDX;
        for &r in existing.iter().rev() {
            if self.buffers.node_pool.find_nodes(r, &mut found) > 0 {
                node = found[0];
                break;
            }
        }
        if node == NULL_IDX {
            details |= DtStatus::PARTIAL_RESULT;
            node = q.last_best;
        }

        let (count, required) = self.path_to_node(node, path);
        if required > count {
            details |= DtStatus::BUFFER_TOO_SMALL;
        }
        Ok(QueryResult::new(count, required, DtStatus::success_with(details)))
    }

    /// Writes the chain from the search root to `end`. Returns the entries
    /// written and the full chain length; a truncated path keeps its start.
    fn path_to_node(&self, end: NodeIndex, path: &mut [PolyRef]) -> (usize, usize) {
        let pool = &self.buffers.node_pool;

        let mut length = 0;
        let mut cur = Some(end);
        while let Some(idx) = cur {
            length += 1;
            cur = pool.parent(idx);
        }

        let mut cur = Some(end);
        let mut k = length;
        while let Some(idx) = cur {
            k -= 1;
            if k < path.len() {
                path[k] = pool.node(idx).id;
            }
            cur = pool.parent(idx);
        }

        (length.min(path.len()), length)
    }

    // ------------------------------------------------------------------
    // Funnel
    // ------------------------------------------------------------------

    /// Turns a polygon corridor into the string of corner points an agent
    /// follows, pulling the path tight through the portals.
    ///
    /// `start_pos` and `end_pos` are clamped to the first and last polygon.
    /// If a portal cannot be resolved the path stops inside the last good
    /// polygon and the status is `PARTIAL_RESULT`.
    pub fn find_straight_path(
        &self,
        start_pos: &[f32; 3],
        end_pos: &[f32; 3],
        path: &[PolyRef],
        straight_path: &mut [StraightPathPoint],
        options: StraightPathOptions,
    ) -> Result<QueryResult> {
        if !visfinite(start_pos) || !visfinite(end_pos) {
            return Err(Error::invalid_param("start or end position is not finite"));
        }
        if path.is_empty() || path[0].is_null() || straight_path.is_empty() {
            return Err(Error::invalid_param("path and output buffer must not be empty"));
        }

        let closest_start = self.closest_point_on_poly_boundary(path[0], start_pos)?;
        let mut closest_end = self.closest_point_on_poly_boundary(path[path.len() - 1], end_pos)?;

        let mut out = StraightPathWriter {
            out: straight_path,
            count: 0,
        };
        let crossings = options.intersects(StraightPathOptions::AREA_CROSSINGS | StraightPathOptions::ALL_CROSSINGS);

        let stat = out.append_vertex(&closest_start, StraightPathFlags::START, path[0]);
        if stat != DtStatus::IN_PROGRESS {
            return Ok(QueryResult::new(out.count, out.count, stat));
        }

        if path.len() > 1 {
            let mut portal_apex = closest_start;
            let mut portal_left = portal_apex;
            let mut portal_right = portal_apex;
            let mut apex_index = 0;
            let mut left_index = 0;
            let mut right_index = 0;
            let mut left_off_mesh = false;
            let mut right_off_mesh = false;
            let mut left_poly_ref = path[0];
            let mut right_poly_ref = path[0];

            let mut i = 0;
            while i < path.len() {
                let left;
                let right;
                let to_off_mesh;

                if i + 1 < path.len() {
                    let portal = self.nav.try_tile_and_poly(path[i]).zip(self.nav.try_tile_and_poly(path[i + 1])).and_then(
                        |((from_tile, from_poly), (to_tile, to_poly))| {
                            portal_points(path[i], from_poly, from_tile, path[i + 1], to_poly, to_tile)
                                .map(|p| (p, to_poly.is_off_mesh_connection()))
                        },
                    );
                    let Some((portal, off_mesh)) = portal else {
                        // path[i + 1] is gone. Stop inside path[i].
                        closest_end = self.closest_point_on_poly_boundary(path[i], end_pos)?;
                        if crossings {
                            self.append_portals(apex_index, i, &closest_end, path, &mut out, options);
                        }
                        out.append_vertex(&closest_end, StraightPathFlags::empty(), path[i]);
                        let status = DtStatus::SUCCESS | DtStatus::PARTIAL_RESULT | out.truncation();
                        return Ok(QueryResult::new(out.count, out.count, status));
                    };
                    left = portal.left;
                    right = portal.right;
                    to_off_mesh = off_mesh;

                    // Skip a portal the start sits on.
                    if i == 0 {
                        let (d, _) = distance_pt_seg_sqr_2d(&portal_apex, &left, &right);
                        if d < sqr(0.001) {
                            i += 1;
                            continue;
                        }
                    }
                } else {
                    left = closest_end;
                    right = closest_end;
                    to_off_mesh = false;
                }

                // Right vertex.
                if tri_area_2d(&portal_apex, &portal_right, &right) <= 0.0 {
                    if vequal(&portal_apex, &portal_right) || tri_area_2d(&portal_apex, &portal_left, &right) > 0.0 {
                        portal_right = right;
                        right_poly_ref = path.get(i + 1).copied().unwrap_or(PolyRef::NULL);
                        right_off_mesh = to_off_mesh;
                        right_index = i;
                    } else {
                        if crossings {
                            let stat = self.append_portals(apex_index, left_index, &portal_left, path, &mut out, options);
                            if stat != DtStatus::IN_PROGRESS {
                                return Ok(QueryResult::new(out.count, out.count, stat));
                            }
                        }

                        portal_apex = portal_left;
                        apex_index = left_index;

                        let flags = if left_poly_ref.is_null() {
                            StraightPathFlags::END
                        } else if left_off_mesh {
                            StraightPathFlags::OFFMESH_CONNECTION
                        } else {
                            StraightPathFlags::empty()
                        };
                        let stat = out.append_vertex(&portal_apex, flags, left_poly_ref);
                        if stat != DtStatus::IN_PROGRESS {
                            return Ok(QueryResult::new(out.count, out.count, stat));
                        }

                        portal_left = portal_apex;
                        portal_right = portal_apex;
                        left_index = apex_index;
                        right_index = apex_index;

                        i = apex_index + 1;
                        continue;
                    }
                }

                // Left vertex.
                if tri_area_2d(&portal_apex, &portal_left, &left) >= 0.0 {
                    if vequal(&portal_apex, &portal_left) || tri_area_2d(&portal_apex, &portal_right, &left) < 0.0 {
                        portal_left = left;
                        left_poly_ref = path.get(i + 1).copied().unwrap_or(PolyRef::NULL);
                        left_off_mesh = to_off_mesh;
                        left_index = i;
                    } else {
                        if crossings {
                            let stat =
                                self.append_portals(apex_index, right_index, &portal_right, path, &mut out, options);
                            if stat != DtStatus::IN_PROGRESS {
                                return Ok(QueryResult::new(out.count, out.count, stat));
                            }
                        }

                        portal_apex = portal_right;
                        apex_index = right_index;

                        let flags = if right_poly_ref.is_null() {
                            StraightPathFlags::END
                        } else if right_off_mesh {
                            StraightPathFlags::OFFMESH_CONNECTION
                        } else {
                            StraightPathFlags::empty()
                        };
                        let stat = out.append_vertex(&portal_apex, flags, right_poly_ref);
                        if stat != DtStatus::IN_PROGRESS {
                            return Ok(QueryResult::new(out.count, out.count, stat));
                        }

                        portal_left = portal_apex;
                        portal_right = portal_apex;
                        left_index = apex_index;
                        right_index = apex_index;

                        i = apex_index + 1;
                        continue;
                    }
                }

                i += 1;
            }

            if crossings {
                let stat = self.append_portals(apex_index, path.len() - 1, &closest_end, path, &mut out, options);
                if stat != DtStatus::IN_PROGRESS {
                    return Ok(QueryResult::new(out.count, out.count, stat));
                }
            }
        }

        out.append_vertex(&closest_end, StraightPathFlags::END, PolyRef::NULL);
        let status = DtStatus::SUCCESS | out.truncation();
        Ok(QueryResult::new(out.count, out.count, status))
    }

    /// Adds the portal crossings between `start_idx` and `end_idx` along the
    /// segment from the last written vertex to `end_pos`.
    fn append_portals(
        &self,
        start_idx: usize,
        end_idx: usize,
        end_pos: &[f32; 3],
        path: &[PolyRef],
        out: &mut StraightPathWriter<'_>,
        options: StraightPathOptions,
    ) -> DtStatus {
        let start_pos = out.last_pos();

        for i in start_idx..end_idx {
            let (Some((from_tile, from_poly)), Some((to_tile, to_poly))) =
                (self.nav.try_tile_and_poly(path[i]), self.nav.try_tile_and_poly(path[i + 1]))
            else {
                return DtStatus::FAILURE | DtStatus::INVALID_PARAM;
            };

            let Some(portal) = portal_points(path[i], from_poly, from_tile, path[i + 1], to_poly, to_tile) else {
                break;
            };

            if options.contains(StraightPathOptions::AREA_CROSSINGS)
                && !options.contains(StraightPathOptions::ALL_CROSSINGS)
                && from_poly.area == to_poly.area
            {
                continue;
            }

            if let Some((_, t)) = intersect_seg_seg_2d(&start_pos, end_pos, &portal.left, &portal.right) {
                let pt = vlerp(&portal.left, &portal.right, t);
                let stat = out.append_vertex(&pt, StraightPathFlags::empty(), path[i + 1]);
                if stat != DtStatus::IN_PROGRESS {
                    return stat;
                }
            }
        }
        DtStatus::IN_PROGRESS
    }

    // ------------------------------------------------------------------
    // Local movement
    // ------------------------------------------------------------------

    /// Moves from `start_pos` towards `end_pos` while staying on the mesh.
    ///
    /// The search is limited to a small neighbourhood around the segment. The
    /// returned position is `end_pos` if it is reachable, else the nearest
    /// point on a wall. `visited` receives the polygons from the start to the
    /// polygon containing the result.
    pub fn move_along_surface(
        &mut self,
        start_ref: PolyRef,
        start_pos: &[f32; 3],
        end_pos: &[f32; 3],
        filter: &QueryFilter,
        visited: &mut [PolyRef],
    ) -> Result<([f32; 3], QueryResult)> {
        if !self.nav.is_valid_poly_ref(start_ref) {
            return Err(Error::invalid_param("start polygon is not valid"));
        }
        if !visfinite(start_pos) || !visfinite(end_pos) || visited.is_empty() {
            return Err(Error::invalid_param("positions must be finite and the visited buffer non-empty"));
        }

        let nav = self.nav;
        let pool = &mut self.buffers.tiny_node_pool;
        pool.clear();

        let mut stack = [NULL_IDX; MAX_LOCAL_STACK];
        let mut nstack = 0;

        let start = pool.get_node(start_ref, 0).ok_or(Error::OutOfNodes)?;
        {
            let node = pool.node_mut(start);
            node.parent = NULL_IDX;
            node.cost = 0.0;
            node.total = 0.0;
            node.flags = NodeFlags::CLOSED;
        }
        stack[nstack] = start;
        nstack += 1;

        let mut best_pos = *start_pos;
        let mut best_dist = f32::MAX;
        let mut best_node = NULL_IDX;

        // Search constraint: a circle around the segment.
        let search_pos = vlerp(start_pos, end_pos, 0.5);
        let search_rad_sqr = sqr(vdist(start_pos, end_pos) / 2.0 + 0.001);

        while nstack > 0 {
            let cur = stack[0];
            stack.copy_within(1..nstack, 0);
            nstack -= 1;

            let cur_ref = pool.node(cur).id;
            let Some((cur_tile, cur_poly)) = nav.try_tile_and_poly(cur_ref) else {
                continue;
            };
            let (verts, nv) = cur_tile.poly_verts(cur_poly);

            if point_in_polygon(end_pos, &verts[..nv]) {
                best_node = cur;
                best_pos = *end_pos;
                break;
            }

            let mut j = nv - 1;
            for i in 0..nv {
                const MAX_NEIS: usize = 8;
                let mut neis = [PolyRef::NULL; MAX_NEIS];
                let mut nneis = 0;

                if cur_poly.neis[j] & EXT_LINK != 0 {
                    for link in cur_tile.links_of(cur_poly) {
                        if link.edge as usize == j && link.poly_ref.is_valid() {
                            if let Some((_, nei_poly)) = nav.try_tile_and_poly(link.poly_ref) {
                                if filter.pass_filter(nei_poly) && nneis < MAX_NEIS {
                                    neis[nneis] = link.poly_ref;
                                    nneis += 1;
                                }
                            }
                        }
                    }
                } else if cur_poly.neis[j] != 0 {
                    let idx = (cur_poly.neis[j] - 1) as usize;
                    if filter.pass_filter(&cur_tile.polys[idx]) {
                        neis[nneis] = cur_tile.poly_ref(idx);
                        nneis += 1;
                    }
                }

                if nneis == 0 {
                    // Wall edge.
                    let (d, t) = distance_pt_seg_sqr_2d(end_pos, &verts[j], &verts[i]);
                    if d < best_dist {
                        best_pos = vlerp(&verts[j], &verts[i], t);
                        best_dist = d;
                        best_node = cur;
                    }
                } else {
                    for &nei_ref in &neis[..nneis] {
                        let Some(nei) = pool.get_node(nei_ref, 0) else {
                            continue;
                        };
                        if pool.node(nei).flags.contains(NodeFlags::CLOSED) {
                            continue;
                        }
                        let (d, _) = distance_pt_seg_sqr_2d(&search_pos, &verts[j], &verts[i]);
                        if d > search_rad_sqr {
                            continue;
                        }
                        if nstack < MAX_LOCAL_STACK {
                            let node = pool.node_mut(nei);
                            node.parent = cur;
                            node.flags.insert(NodeFlags::CLOSED);
                            stack[nstack] = nei;
                            nstack += 1;
                        }
                    }
                }
                j = i;
            }
        }

        let mut status = DtStatus::SUCCESS;
        let (count, required) = if best_node != NULL_IDX {
            Self::write_chain(pool, best_node, visited)
        } else {
            (0, 0)
        };
        if required > count {
            status |= DtStatus::BUFFER_TOO_SMALL;
        }

        Ok((best_pos, QueryResult::new(count, required, status)))
    }

    /// Same as `path_to_node` for an arbitrary pool.
    fn write_chain(pool: &NodePool, end: NodeIndex, out: &mut [PolyRef]) -> (usize, usize) {
        let mut length = 0;
        let mut cur = Some(end);
        while let Some(idx) = cur {
            length += 1;
            cur = pool.parent(idx);
        }
        let mut cur = Some(end);
        let mut k = length;
        while let Some(idx) = cur {
            k -= 1;
            if k < out.len() {
                out[k] = pool.node(idx).id;
            }
            cur = pool.parent(idx);
        }
        (length.min(out.len()), length)
    }

    /// Casts a ray along the surface from `start_pos` towards `end_pos`.
    ///
    /// Stops at the first wall. `hit.t` is `f32::MAX` when the end was reached
    /// inside a polygon. The visited polygons go into `path`. `prev_ref` is the
    /// polygon before `start_ref`, used only for costs.
    #[allow(clippy::too_many_arguments)]
    pub fn raycast(
        &self,
        start_ref: PolyRef,
        start_pos: &[f32; 3],
        end_pos: &[f32; 3],
        filter: &QueryFilter,
        options: RaycastOptions,
        prev_ref: PolyRef,
        path: &mut [PolyRef],
    ) -> Result<RaycastHit> {
        let (start_tile, start_poly) = self.tile_and_poly(start_ref)?;
        if !visfinite(start_pos) || !visfinite(end_pos) {
            return Err(Error::invalid_param("start or end position is not finite"));
        }
        if prev_ref.is_valid() && !self.nav.is_valid_poly_ref(prev_ref) {
            return Err(Error::invalid_param("previous polygon is not valid"));
        }

        let mut hit = RaycastHit {
            t: 0.0,
            ..RaycastHit::no_hit()
        };

        let dir = vsub(end_pos, start_pos);
        let mut cur_pos = *start_pos;
        let mut n = 0;

        let mut cur_ref = start_ref;
        let mut tile = start_tile;
        let mut poly = start_poly;

        while cur_ref.is_valid() {
            let (verts, nv) = tile.poly_verts(poly);

            let Some(isect) = intersect_segment_poly_2d(start_pos, end_pos, &verts[..nv]) else {
                // Could not hit the polygon, keep the old t and report hit.
                hit.path_count = n;
                return Ok(hit);
            };

            hit.hit_edge_index = isect.seg_max;

            if isect.tmax > hit.t {
                hit.t = isect.tmax;
            }

            if n < path.len() {
                path[n] = cur_ref;
                n += 1;
            } else {
                hit.status |= DtStatus::BUFFER_TOO_SMALL;
            }

            // Ray end is completely inside the polygon.
            let Some(seg_max) = isect.seg_max else {
                hit.t = f32::MAX;
                hit.path_count = n;
                if options.contains(RaycastOptions::USE_COSTS) {
                    hit.path_cost += filter.get_cost(&cur_pos, end_pos, poly);
                }
                return Ok(hit);
            };

            // Follow the neighbour across the exit edge.
            let mut next: Option<(PolyRef, &MeshTile, &Poly)> = None;
            for link in tile.links_of(poly) {
                if link.edge as usize != seg_max {
                    continue;
                }
                let Some((next_tile, next_poly)) = self.nav.try_tile_and_poly(link.poly_ref) else {
                    continue;
                };
                if next_poly.is_off_mesh_connection() || !filter.pass_filter(next_poly) {
                    continue;
                }

                if link.is_internal() || (link.bmin == 0 && link.bmax == 255) {
                    next = Some((link.poly_ref, next_tile, next_poly));
                    break;
                }

                // Partial tile portal: the crossing must fall inside it.
                let e = link.edge as usize;
                let left = verts[e];
                let right = verts[(e + 1) % nv];
                let axis = match link.side {
                    0 | 4 => 2,
                    2 | 6 => 0,
                    _ => continue,
                };
                let s = 1.0 / 255.0;
                let mut lmin = left[axis] + (right[axis] - left[axis]) * (link.bmin as f32 * s);
                let mut lmax = left[axis] + (right[axis] - left[axis]) * (link.bmax as f32 * s);
                if lmin > lmax {
                    std::mem::swap(&mut lmin, &mut lmax);
                }
                let x = start_pos[axis] + (end_pos[axis] - start_pos[axis]) * isect.tmax;
                if x >= lmin && x <= lmax {
                    next = Some((link.poly_ref, next_tile, next_poly));
                    break;
                }
            }

            if options.contains(RaycastOptions::USE_COSTS) {
                // Exit point of this polygon, with the height taken from the edge.
                let last_pos = cur_pos;
                cur_pos = [
                    start_pos[0] + dir[0] * hit.t,
                    start_pos[1] + dir[1] * hit.t,
                    start_pos[2] + dir[2] * hit.t,
                ];
                let e1 = verts[seg_max];
                let e2 = verts[(seg_max + 1) % nv];
                let e_dir = vsub(&e2, &e1);
                let diff = vsub(&cur_pos, &e1);
                let s = if sqr(e_dir[0]) > sqr(e_dir[2]) {
                    diff[0] / e_dir[0]
                } else {
                    diff[2] / e_dir[2]
                };
                cur_pos[1] = e1[1] + e_dir[1] * s;
                hit.path_cost += filter.get_cost(&last_pos, &cur_pos, poly);
            }

            let Some((next_ref, next_tile, next_poly)) = next else {
                // Wall.
                let va = verts[seg_max];
                let vb = verts[(seg_max + 1) % nv];
                let dx = vb[0] - va[0];
                let dz = vb[2] - va[2];
                hit.hit_normal = vnormalize(&[dz, 0.0, -dx]);
                hit.path_count = n;
                return Ok(hit);
            };

            cur_ref = next_ref;
            tile = next_tile;
            poly = next_poly;
        }

        hit.path_count = n;
        Ok(hit)
    }

    /// Collects the non-overlapping polygons around `center` reachable within
    /// `radius`, walking breadth first from `start_ref`.
    ///
    /// Polygons that overlap an already collected one in 2D are skipped, so
    /// the result is a single layer.
    pub fn find_local_neighbourhood(
        &mut self,
        start_ref: PolyRef,
        center: &[f32; 3],
        radius: f32,
        filter: &QueryFilter,
        result_ref: &mut [PolyRef],
        mut result_parent: Option<&mut [PolyRef]>,
    ) -> Result<QueryResult> {
        if !self.nav.is_valid_poly_ref(start_ref) {
            return Err(Error::invalid_param("start polygon is not valid"));
        }
        if !visfinite(center) || !radius.is_finite() || radius < 0.0 || result_ref.is_empty() {
            return Err(Error::invalid_param("invalid neighbourhood query"));
        }

        let nav = self.nav;
        let pool = &mut self.buffers.tiny_node_pool;
        pool.clear();

        let mut stack = [NULL_IDX; MAX_LOCAL_STACK];
        let mut nstack = 0;

        let start = pool.get_node(start_ref, 0).ok_or(Error::OutOfNodes)?;
        {
            let node = pool.node_mut(start);
            node.parent = NULL_IDX;
            node.flags = NodeFlags::CLOSED;
        }
        stack[nstack] = start;
        nstack += 1;

        let radius_sqr = sqr(radius);
        let mut status = DtStatus::SUCCESS;

        let mut n = 0;
        result_ref[n] = start_ref;
        if let Some(parents) = result_parent.as_deref_mut() {
            if let Some(slot) = parents.get_mut(n) {
                *slot = PolyRef::NULL;
            }
        }
        n += 1;
        let mut required = 1;

        while nstack > 0 {
            let cur = stack[0];
            stack.copy_within(1..nstack, 0);
            nstack -= 1;

            let cur_ref = pool.node(cur).id;
            let Some((cur_tile, cur_poly)) = nav.try_tile_and_poly(cur_ref) else {
                continue;
            };

            for link in cur_tile.links_of(cur_poly) {
                let nei_ref = link.poly_ref;
                if nei_ref.is_null() {
                    continue;
                }
                let Some(nei_idx) = pool.get_node(nei_ref, 0) else {
                    continue;
                };
                if pool.node(nei_idx).flags.contains(NodeFlags::CLOSED) {
                    continue;
                }

                let Some((nei_tile, nei_poly)) = nav.try_tile_and_poly(nei_ref) else {
                    continue;
                };
                if nei_poly.is_off_mesh_connection() || !filter.pass_filter(nei_poly) {
                    continue;
                }

                let Some(portal) = portal_points(cur_ref, cur_poly, cur_tile, nei_ref, nei_poly, nei_tile) else {
                    continue;
                };
                let (dist_sqr, _) = distance_pt_seg_sqr_2d(center, &portal.left, &portal.right);
                if dist_sqr > radius_sqr {
                    continue;
                }

                // Visited even when rejected below, so the overlap test runs once.
                {
                    let node = pool.node_mut(nei_idx);
                    node.flags.insert(NodeFlags::CLOSED);
                    node.parent = cur;
                }

                let (pa, npa) = nei_tile.poly_verts(nei_poly);
                let mut overlap = false;
                for &past_ref in &result_ref[..n] {
                    // Connected polygons do not overlap.
                    if cur_tile.links_of(cur_poly).any(|l| l.poly_ref == past_ref) {
                        continue;
                    }
                    let Some((past_tile, past_poly)) = nav.try_tile_and_poly(past_ref) else {
                        continue;
                    };
                    let (pb, npb) = past_tile.poly_verts(past_poly);
                    if overlap_poly_poly_2d(&pa[..npa], &pb[..npb]) {
                        overlap = true;
                        break;
                    }
                }
                if overlap {
                    continue;
                }

                required += 1;
                if n < result_ref.len() {
                    result_ref[n] = nei_ref;
                    if let Some(parents) = result_parent.as_deref_mut() {
                        if let Some(slot) = parents.get_mut(n) {
                            *slot = cur_ref;
                        }
                    }
                    n += 1;
                } else {
                    status |= DtStatus::BUFFER_TOO_SMALL;
                }

                if nstack < MAX_LOCAL_STACK {
                    stack[nstack] = nei_idx;
                    nstack += 1;
                }
            }
        }

        Ok(QueryResult::new(n, required, status))
    }

    /// Wall segments of a polygon, as `[ax, ay, az, bx, by, bz]`.
    ///
    /// With `segment_refs`, portal segments are returned too and each segment
    /// gets the neighbour behind it (null for walls). Edges to polygons the
    /// filter rejects count as walls. Partial tile portals split an edge into
    /// portal and wall pieces.
    pub fn get_poly_wall_segments(
        &self,
        poly_ref: PolyRef,
        filter: &QueryFilter,
        segment_verts: &mut [[f32; 6]],
        mut segment_refs: Option<&mut [PolyRef]>,
    ) -> Result<QueryResult> {
        let (tile, poly) = self.tile_and_poly(poly_ref)?;
        if segment_verts.is_empty() {
            return Err(Error::invalid_param("segment buffer is empty"));
        }

        let store_portals = segment_refs.is_some();
        let mut status = DtStatus::SUCCESS;
        let mut n = 0;
        let mut required = 0;

        let mut push = |a: [f32; 3], b: [f32; 3], r: PolyRef, n: &mut usize, status: &mut DtStatus| {
            required += 1;
            if *n < segment_verts.len() {
                segment_verts[*n] = [a[0], a[1], a[2], b[0], b[1], b[2]];
                if let Some(refs) = segment_refs.as_deref_mut() {
                    if let Some(slot) = refs.get_mut(*n) {
                        *slot = r;
                    }
                }
                *n += 1;
            } else {
                *status |= DtStatus::BUFFER_TOO_SMALL;
            }
        };

        let nv = poly.vert_count();
        let mut ints = [Interval {
            poly_ref: PolyRef::NULL,
            tmin: 0,
            tmax: 0,
        }; MAX_INTERVAL];

        let mut j = nv - 1;
        for i in 0..nv {
            let vj = tile.verts[poly.verts[j] as usize];
            let vi = tile.verts[poly.verts[i] as usize];
            let mut nints = 0;

            if poly.neis[j] & EXT_LINK != 0 {
                for link in tile.links_of(poly) {
                    if link.edge as usize != j || link.poly_ref.is_null() {
                        continue;
                    }
                    if let Some((_, nei_poly)) = self.nav.try_tile_and_poly(link.poly_ref) {
                        if filter.pass_filter(nei_poly) {
                            insert_interval(&mut ints, &mut nints, link.bmin as i16, link.bmax as i16, link.poly_ref);
                        }
                    }
                }
            } else {
                let mut nei_ref = PolyRef::NULL;
                if poly.neis[j] != 0 {
                    let idx = (poly.neis[j] - 1) as usize;
                    if filter.pass_filter(&tile.polys[idx]) {
                        nei_ref = tile.poly_ref(idx);
                    }
                }
                if nei_ref.is_valid() && !store_portals {
                    j = i;
                    continue;
                }
                push(vj, vi, nei_ref, &mut n, &mut status);
                j = i;
                continue;
            }

            // Sentinels.
            insert_interval(&mut ints, &mut nints, -1, 0, PolyRef::NULL);
            insert_interval(&mut ints, &mut nints, 255, 256, PolyRef::NULL);

            for k in 1..nints {
                if store_portals && ints[k].poly_ref.is_valid() {
                    let tmin = ints[k].tmin as f32 / 255.0;
                    let tmax = ints[k].tmax as f32 / 255.0;
                    push(vlerp(&vj, &vi, tmin), vlerp(&vj, &vi, tmax), ints[k].poly_ref, &mut n, &mut status);
                }

                let imin = ints[k - 1].tmax;
                let imax = ints[k].tmin;
                if imin != imax {
                    let tmin = imin as f32 / 255.0;
                    let tmax = imax as f32 / 255.0;
                    push(vlerp(&vj, &vi, tmin), vlerp(&vj, &vi, tmax), PolyRef::NULL, &mut n, &mut status);
                }
            }
            j = i;
        }

        Ok(QueryResult::new(n, required, status))
    }

    // ------------------------------------------------------------------
    // Dijkstra searches
    // ------------------------------------------------------------------

    /// Resets the main pool and seeds it with `start_ref` at `pos`.
    fn begin_dijkstra(&mut self, start_ref: PolyRef, pos: &[f32; 3]) -> Result<()> {
        let bufs = &mut self.buffers;
        bufs.node_pool.clear();
        bufs.open_list.clear();

        let start = bufs.node_pool.get_node(start_ref, 0).ok_or(Error::OutOfNodes)?;
        {
            let node = bufs.node_pool.node_mut(start);
            node.pos = *pos;
            node.parent = NULL_IDX;
            node.cost = 0.0;
            node.total = 0.0;
            node.flags = NodeFlags::OPEN;
        }
        bufs.open_list.push(&bufs.node_pool, start);
        Ok(())
    }

    /// Pops the cheapest open node and closes it.
    fn pop_closed(&mut self) -> Option<NodeIndex> {
        let bufs = &mut self.buffers;
        let idx = bufs.open_list.pop()?;
        let node = bufs.node_pool.node_mut(idx);
        node.flags.remove(NodeFlags::OPEN);
        node.flags.insert(NodeFlags::CLOSED);
        Some(idx)
    }

    /// Relaxes `nei_ref` from `best_idx` with the given step cost. Returns
    /// false when the pool ran out of nodes.
    fn relax(&mut self, best_idx: NodeIndex, nei_ref: PolyRef, pos: [f32; 3], step: impl FnOnce(&[f32; 3], &[f32; 3]) -> f32) -> bool {
        let bufs = &mut self.buffers;
        let Some(nei_idx) = bufs.node_pool.get_node(nei_ref, 0) else {
            return false;
        };
        let nei = *bufs.node_pool.node(nei_idx);
        if nei.flags.contains(NodeFlags::CLOSED) {
            return true;
        }

        let nei_pos = if nei.flags.is_empty() { pos } else { nei.pos };
        let best = *bufs.node_pool.node(best_idx);
        let total = best.total + step(&best.pos, &nei_pos);

        if nei.flags.contains(NodeFlags::OPEN) && total >= nei.total {
            return true;
        }

        {
            let node = bufs.node_pool.node_mut(nei_idx);
            node.pos = nei_pos;
            node.parent = best_idx;
            node.total = total;
        }
        if nei.flags.contains(NodeFlags::OPEN) {
            bufs.open_list.modify(&bufs.node_pool, nei_idx);
        } else {
            bufs.node_pool.node_mut(nei_idx).flags = NodeFlags::OPEN;
            bufs.open_list.push(&bufs.node_pool, nei_idx);
        }
        true
    }

    fn parent_ref(&self, idx: NodeIndex) -> PolyRef {
        let pool = &self.buffers.node_pool;
        pool.parent(idx).map_or(PolyRef::NULL, |p| pool.node(p).id)
    }

    /// Finds the polygons whose portals touch a circle, expanding by cost
    /// from `start_ref`.
    ///
    /// Each result gets its parent polygon and the cost to reach it.
    #[allow(clippy::too_many_arguments)]
    pub fn find_polys_around_circle(
        &mut self,
        start_ref: PolyRef,
        center: &[f32; 3],
        radius: f32,
        filter: &QueryFilter,
        result_ref: &mut [PolyRef],
        result_parent: Option<&mut [PolyRef]>,
        result_cost: Option<&mut [f32]>,
    ) -> Result<QueryResult> {
        if !self.nav.is_valid_poly_ref(start_ref) {
            return Err(Error::invalid_param("start polygon is not valid"));
        }
        if !visfinite(center) || !radius.is_finite() || radius < 0.0 {
            return Err(Error::invalid_param("circle must be finite with a non-negative radius"));
        }

        let radius_sqr = sqr(radius);
        self.dijkstra_collect(start_ref, center, filter, result_ref, result_parent, result_cost, |va, vb| {
            distance_pt_seg_sqr_2d(center, va, vb).0 <= radius_sqr
        })
    }

    /// Like [`find_polys_around_circle`](Self::find_polys_around_circle) with
    /// a convex polygon as the search shape.
    #[allow(clippy::too_many_arguments)]
    pub fn find_polys_around_shape(
        &mut self,
        start_ref: PolyRef,
        verts: &[[f32; 3]],
        filter: &QueryFilter,
        result_ref: &mut [PolyRef],
        result_parent: Option<&mut [PolyRef]>,
        result_cost: Option<&mut [f32]>,
    ) -> Result<QueryResult> {
        if !self.nav.is_valid_poly_ref(start_ref) {
            return Err(Error::invalid_param("start polygon is not valid"));
        }
        if verts.len() < 3 || verts.iter().any(|v| !visfinite(v)) {
            return Err(Error::invalid_param("shape needs at least three finite vertices"));
        }

        let mut center = [0.0; 3];
        for v in verts {
            center[0] += v[0];
            center[1] += v[1];
            center[2] += v[2];
        }
        let scale = 1.0 / verts.len() as f32;
        let center = [center[0] * scale, center[1] * scale, center[2] * scale];

        self.dijkstra_collect(start_ref, &center, filter, result_ref, result_parent, result_cost, |va, vb| {
            intersect_segment_poly_2d(va, vb, verts).is_some_and(|isect| isect.tmin <= 1.0 && isect.tmax >= 0.0)
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn dijkstra_collect(
        &mut self,
        start_ref: PolyRef,
        start_pos: &[f32; 3],
        filter: &QueryFilter,
        result_ref: &mut [PolyRef],
        mut result_parent: Option<&mut [PolyRef]>,
        mut result_cost: Option<&mut [f32]>,
        touches: impl Fn(&[f32; 3], &[f32; 3]) -> bool,
    ) -> Result<QueryResult> {
        let nav = self.nav;
        self.begin_dijkstra(start_ref, start_pos)?;

        let mut status = DtStatus::SUCCESS;
        let mut n = 0;
        let mut required = 0;

        while let Some(best_idx) = self.pop_closed() {
            let best = *self.buffers.node_pool.node(best_idx);
            let Some((best_tile, best_poly)) = nav.try_tile_and_poly(best.id) else {
                continue;
            };
            let parent_ref = self.parent_ref(best_idx);

            required += 1;
            if n < result_ref.len() {
                result_ref[n] = best.id;
                if let Some(slot) = result_parent.as_deref_mut().and_then(|p| p.get_mut(n)) {
                    *slot = parent_ref;
                }
                if let Some(slot) = result_cost.as_deref_mut().and_then(|c| c.get_mut(n)) {
                    *slot = best.total;
                }
                n += 1;
            } else {
                status |= DtStatus::BUFFER_TOO_SMALL;
            }

            for link in best_tile.links_of(best_poly) {
                let nei_ref = link.poly_ref;
                if nei_ref.is_null() || nei_ref == parent_ref {
                    continue;
                }
                let Some((nei_tile, nei_poly)) = nav.try_tile_and_poly(nei_ref) else {
                    continue;
                };
                if !filter.pass_filter(nei_poly) {
                    continue;
                }
                let Some(portal) = portal_points(best.id, best_poly, best_tile, nei_ref, nei_poly, nei_tile) else {
                    continue;
                };
                if !touches(&portal.left, &portal.right) {
                    continue;
                }

                let mid = vlerp(&portal.left, &portal.right, 0.5);
                if !self.relax(best_idx, nei_ref, mid, |a, b| filter.get_cost(a, b, nei_poly)) {
                    status |= DtStatus::OUT_OF_NODES;
                }
            }
        }

        Ok(QueryResult::new(n, required, status))
    }

    /// Path from the start of the last Dijkstra search to `end_ref`.
    pub fn get_path_from_dijkstra_search(&self, end_ref: PolyRef, path: &mut [PolyRef]) -> Result<QueryResult> {
        if !self.nav.is_valid_poly_ref(end_ref) || path.is_empty() {
            return Err(Error::invalid_param("end polygon must be valid and the path buffer non-empty"));
        }
        let mut found = [NULL_IDX; 1];
        if self.buffers.node_pool.find_nodes(end_ref, &mut found) == 0
            || !self.buffers.node_pool.node(found[0]).flags.contains(NodeFlags::CLOSED)
        {
            return Err(Error::invalid_param("end polygon was not reached by the last search"));
        }

        let (count, required) = self.path_to_node(found[0], path);
        let mut status = DtStatus::SUCCESS;
        if required > count {
            status |= DtStatus::BUFFER_TOO_SMALL;
        }
        Ok(QueryResult::new(count, required, status))
    }

    /// True if the last search closed a node of `poly_ref`.
    pub fn is_in_closed_list(&self, poly_ref: PolyRef) -> bool {
        let mut found = [NULL_IDX; 4];
        let n = self.buffers.node_pool.find_nodes(poly_ref, &mut found);
        found[..n]
            .iter()
            .any(|&i| self.buffers.node_pool.node(i).flags.contains(NodeFlags::CLOSED))
    }

    /// Distance from `center` to the nearest wall within `max_radius`.
    ///
    /// Returns the distance, the hit point and the wall normal pointing
    /// towards `center`. The distance is `max_radius` when no wall is that
    /// close.
    pub fn find_distance_to_wall(
        &mut self,
        start_ref: PolyRef,
        center: &[f32; 3],
        max_radius: f32,
        filter: &QueryFilter,
    ) -> Result<(f32, [f32; 3], [f32; 3])> {
        if !self.nav.is_valid_poly_ref(start_ref) {
            return Err(Error::invalid_param("start polygon is not valid"));
        }
        if !visfinite(center) || !max_radius.is_finite() || max_radius < 0.0 {
            return Err(Error::invalid_param("center must be finite with a non-negative radius"));
        }

        let nav = self.nav;
        self.begin_dijkstra(start_ref, center)?;

        let mut radius_sqr = sqr(max_radius);
        let mut hit_pos = *center;

        while let Some(best_idx) = self.pop_closed() {
            let best = *self.buffers.node_pool.node(best_idx);
            let Some((tile, poly)) = nav.try_tile_and_poly(best.id) else {
                continue;
            };
            let parent_ref = self.parent_ref(best_idx);
            let nv = poly.vert_count();

            // Walls of this polygon.
            let mut j = nv - 1;
            for i in 0..nv {
                let solid = if poly.neis[j] & EXT_LINK != 0 {
                    !tile.links_of(poly).any(|l| {
                        l.edge as usize == j
                            && nav
                                .try_tile_and_poly(l.poly_ref)
                                .is_some_and(|(_, p)| filter.pass_filter(p))
                    })
                } else if poly.neis[j] != 0 {
                    !filter.pass_filter(&tile.polys[(poly.neis[j] - 1) as usize])
                } else {
                    true
                };

                if solid {
                    let vj = tile.verts[poly.verts[j] as usize];
                    let vi = tile.verts[poly.verts[i] as usize];
                    let (dist_sqr, t) = distance_pt_seg_sqr_2d(center, &vj, &vi);
                    if dist_sqr <= radius_sqr {
                        radius_sqr = dist_sqr;
                        hit_pos = vlerp(&vj, &vi, t);
                    }
                }
                j = i;
            }

            for link in tile.links_of(poly) {
                let nei_ref = link.poly_ref;
                if nei_ref.is_null() || nei_ref == parent_ref {
                    continue;
                }
                let Some((nei_tile, nei_poly)) = nav.try_tile_and_poly(nei_ref) else {
                    continue;
                };
                if nei_poly.is_off_mesh_connection() {
                    continue;
                }

                let e = link.edge as usize;
                let va = tile.verts[poly.verts[e] as usize];
                let vb = tile.verts[poly.verts[(e + 1) % nv] as usize];
                let (dist_sqr, _) = distance_pt_seg_sqr_2d(center, &va, &vb);
                if dist_sqr > radius_sqr || !filter.pass_filter(nei_poly) {
                    continue;
                }

                let Some(mid) = edge_mid_point(best.id, poly, tile, nei_ref, nei_poly, nei_tile) else {
                    continue;
                };
                // Pool exhaustion only shrinks the searched area.
                self.relax(best_idx, nei_ref, mid, |a, b| vdist(a, b));
            }
        }

        let hit_normal = vnormalize(&vsub(center, &hit_pos));
        Ok((radius_sqr.sqrt(), hit_pos, hit_normal))
    }

    // ------------------------------------------------------------------
    // Random points
    // ------------------------------------------------------------------

    /// Uniformly random point on the mesh, weighted by polygon area.
    ///
    /// `frand` must return values in `[0, 1)`.
    pub fn find_random_point(
        &self,
        filter: &QueryFilter,
        frand: &mut impl FnMut() -> f32,
    ) -> Result<(PolyRef, [f32; 3])> {
        let mut selected: Option<(&MeshTile, usize)> = None;
        let mut area_sum = 0.0;

        for tile in self.nav.tiles() {
            for (i, poly) in tile.polys.iter().enumerate() {
                if poly.is_off_mesh_connection() || !filter.pass_filter(poly) {
                    continue;
                }
                let (verts, nv) = tile.poly_verts(poly);
                let area = poly_weight(&verts[..nv]);
                area_sum += area;
                if frand() * area_sum <= area {
                    selected = Some((tile, i));
                }
            }
        }

        let (tile, idx) = selected.ok_or_else(|| Error::Failure("no polygon passes the filter".into()))?;
        Ok(self.random_point_in(tile, idx, frand))
    }

    /// Random point on a polygon reachable from `start_ref` whose portals lie
    /// within `max_radius` of `center`. The point itself may fall outside the
    /// circle.
    pub fn find_random_point_around_circle(
        &mut self,
        start_ref: PolyRef,
        center: &[f32; 3],
        max_radius: f32,
        filter: &QueryFilter,
        frand: &mut impl FnMut() -> f32,
    ) -> Result<(PolyRef, [f32; 3])> {
        let (_, start_poly) = self.tile_and_poly(start_ref)?;
        if !filter.pass_filter(start_poly) {
            return Err(Error::invalid_param("start polygon is rejected by the filter"));
        }
        if !visfinite(center) || !max_radius.is_finite() || max_radius < 0.0 {
            return Err(Error::invalid_param("circle must be finite with a non-negative radius"));
        }

        let nav = self.nav;
        self.begin_dijkstra(start_ref, center)?;

        let radius_sqr = sqr(max_radius);
        let mut selected: Option<(&MeshTile, usize)> = None;
        let mut area_sum = 0.0;

        while let Some(best_idx) = self.pop_closed() {
            let best = *self.buffers.node_pool.node(best_idx);
            let Some((best_tile, best_poly)) = nav.try_tile_and_poly(best.id) else {
                continue;
            };

            if !best_poly.is_off_mesh_connection() {
                let (verts, nv) = best_tile.poly_verts(best_poly);
                let area = poly_weight(&verts[..nv]);
                area_sum += area;
                if frand() * area_sum <= area {
                    selected = Some((best_tile, best.id.poly_index() as usize));
                }
            }

            let parent_ref = self.parent_ref(best_idx);
            for link in best_tile.links_of(best_poly) {
                let nei_ref = link.poly_ref;
                if nei_ref.is_null() || nei_ref == parent_ref {
                    continue;
                }
                let Some((nei_tile, nei_poly)) = nav.try_tile_and_poly(nei_ref) else {
                    continue;
                };
                if !filter.pass_filter(nei_poly) {
                    continue;
                }
                let Some(portal) = portal_points(best.id, best_poly, best_tile, nei_ref, nei_poly, nei_tile) else {
                    continue;
                };
                let (dist_sqr, _) = distance_pt_seg_sqr_2d(center, &portal.left, &portal.right);
                if dist_sqr > radius_sqr {
                    continue;
                }
                let mid = vlerp(&portal.left, &portal.right, 0.5);
                self.relax(best_idx, nei_ref, mid, |a, b| vdist(a, b));
            }
        }

        let (tile, idx) = selected.ok_or_else(|| Error::Failure("no polygon found around the circle".into()))?;
        Ok(self.random_point_in(tile, idx, frand))
    }

    fn random_point_in(&self, tile: &MeshTile, idx: usize, frand: &mut impl FnMut() -> f32) -> (PolyRef, [f32; 3]) {
        let poly = &tile.polys[idx];
        let (verts, nv) = tile.poly_verts(poly);
        let mut areas = [0.0; MAX_VERTS_PER_POLY];
        let s = frand();
        let t = frand();
        let mut pt = random_point_in_convex_poly(&verts[..nv], &mut areas[..nv], s, t);
        if let Some(h) = tile.get_poly_height(idx, &pt) {
            pt[1] = h;
        }
        (tile.poly_ref(idx), pt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_mesh_helpers::{grid_nav_mesh, GridTile, grid_params};
    use crate::{NavMesh, PolyFlags, TileFlags, TileRef};

    const EXT: [f32; 3] = [0.5, 2.0, 0.5];

    fn nearest(query: &NavMeshQuery<'_>, pos: [f32; 3]) -> PolyRef {
        let (r, _) = query.find_nearest_poly(&pos, &EXT, &QueryFilter::default()).unwrap();
        assert!(r.is_valid(), "no polygon near {pos:?}");
        r
    }

    #[test]
    fn test_buffers_validate_size() {
        assert!(QueryBuffers::new(0).is_err());
        assert!(QueryBuffers::new(MAX_NODE_POOL_SIZE + 1).is_err());
        assert_eq!(QueryBuffers::new(128).unwrap().max_nodes(), 128);
    }

    #[test]
    fn test_find_nearest_poly() {
        let mesh = grid_nav_mesh(1, 1, 10.0, 5).unwrap();
        let query = NavMeshQuery::new(&mesh);
        let filter = QueryFilter::default();

        let (r, pt) = query.find_nearest_poly(&[3.0, 0.5, 3.0], &EXT, &filter).unwrap();
        assert!(r.is_valid());
        assert_eq!(pt, [3.0, 0.0, 3.0]);

        // Nothing within the box.
        let (r, pt) = query.find_nearest_poly(&[30.0, 0.0, 30.0], &EXT, &filter).unwrap();
        assert!(r.is_null());
        assert_eq!(pt, [30.0, 0.0, 30.0]);

        assert!(query.find_nearest_poly(&[f32::NAN, 0.0, 0.0], &EXT, &filter).is_err());
    }

    #[test]
    fn test_query_polygons_reports_truncation() {
        let mesh = grid_nav_mesh(1, 1, 10.0, 5).unwrap();
        let query = NavMeshQuery::new(&mesh);
        let filter = QueryFilter::default();

        let mut polys = [PolyRef::NULL; 64];
        let result = query.query_polygons(&[5.0, 0.0, 5.0], &[10.0, 1.0, 10.0], &filter, &mut polys).unwrap();
        assert_eq!(result.count, 25);
        assert!(!result.is_truncated());

        let mut small = [PolyRef::NULL; 4];
        let result = query.query_polygons(&[5.0, 0.0, 5.0], &[10.0, 1.0, 10.0], &filter, &mut small).unwrap();
        assert_eq!(result.count, 4);
        assert!(result.is_truncated());
    }

    #[test]
    fn test_find_path_across_grid() {
        let mesh = grid_nav_mesh(1, 1, 10.0, 5).unwrap();
        let mut query = NavMeshQuery::new(&mesh);
        let filter = QueryFilter::default();

        let start = [1.0, 0.0, 1.0];
        let end = [9.0, 0.0, 1.0];
        let start_ref = nearest(&query, start);
        let end_ref = nearest(&query, end);

        let mut path = [PolyRef::NULL; 32];
        let result = query.find_path(start_ref, end_ref, &start, &end, &filter, &mut path).unwrap();
        assert!(result.status.is_success());
        assert!(!result.is_partial());
        assert_eq!(result.count, 5);
        assert_eq!(path[0], start_ref);
        assert_eq!(path[4], end_ref);
    }

    #[test]
    fn test_find_path_same_poly() {
        let mesh = grid_nav_mesh(1, 1, 10.0, 5).unwrap();
        let mut query = NavMeshQuery::new(&mesh);
        let start = [1.0, 0.0, 1.0];
        let r = nearest(&query, start);

        let mut path = [PolyRef::NULL; 4];
        let result = query
            .find_path(r, r, &start, &[1.5, 0.0, 1.5], &QueryFilter::default(), &mut path)
            .unwrap();
        assert_eq!(result.count, 1);
        assert_eq!(path[0], r);
    }

    #[test]
    fn test_find_path_unreachable_is_partial() {
        // Blocked column at x index 2 splits the tile in two.
        let mut tile = GridTile::new(0, 0, 10.0, 5);
        for z in 0..5 {
            tile = tile.block(2, z);
        }
        let mut mesh = NavMesh::new(grid_params(10.0, 4)).unwrap();
        mesh.add_tile(tile.build().unwrap(), TileFlags::FREE_DATA, TileRef::NULL).unwrap();

        let mut query = NavMeshQuery::new(&mesh);
        let start = [1.0, 0.0, 5.0];
        let end = [9.0, 0.0, 5.0];
        let start_ref = nearest(&query, start);
        let end_ref = nearest(&query, end);

        let mut path = [PolyRef::NULL; 32];
        let result = query
            .find_path(start_ref, end_ref, &start, &end, &QueryFilter::default(), &mut path)
            .unwrap();
        assert!(result.is_partial());
        assert_ne!(path[result.count - 1], end_ref);
        // Best node is on the wall side next to the gap.
        let (last_pt, _) = query.closest_point_on_poly(path[result.count - 1], &end).unwrap();
        assert!(last_pt[0] <= 4.0 + 1e-4);
    }

    #[test]
    fn test_find_path_truncates_from_start() {
        let mesh = grid_nav_mesh(1, 1, 10.0, 5).unwrap();
        let mut query = NavMeshQuery::new(&mesh);
        let start = [1.0, 0.0, 1.0];
        let end = [9.0, 0.0, 1.0];
        let start_ref = nearest(&query, start);
        let end_ref = nearest(&query, end);

        let mut path = [PolyRef::NULL; 3];
        let result = query
            .find_path(start_ref, end_ref, &start, &end, &QueryFilter::default(), &mut path)
            .unwrap();
        assert_eq!(result.count, 3);
        assert_eq!(result.required, 5);
        assert!(result.is_truncated());
        assert_eq!(path[0], start_ref);
    }

    #[test]
    fn test_find_path_rejects_bad_input() {
        let mesh = grid_nav_mesh(1, 1, 10.0, 5).unwrap();
        let mut query = NavMeshQuery::new(&mesh);
        let filter = QueryFilter::default();
        let r = nearest(&query, [1.0, 0.0, 1.0]);
        let mut path = [PolyRef::NULL; 4];

        let res = query.find_path(PolyRef::NULL, r, &[0.0; 3], &[0.0; 3], &filter, &mut path);
        assert!(matches!(res, Err(Error::InvalidParam(_))));
        let res = query.find_path(r, r, &[f32::INFINITY, 0.0, 0.0], &[0.0; 3], &filter, &mut path);
        assert!(matches!(res, Err(Error::InvalidParam(_))));
        let res = query.find_path(r, r, &[0.0; 3], &[0.0; 3], &filter, &mut []);
        assert!(matches!(res, Err(Error::InvalidParam(_))));
    }

    #[test]
    fn test_area_cost_steers_path() {
        // Middle row is expensive; the path should go around it when cheaper.
        let mut tile = GridTile::new(0, 0, 10.0, 5);
        for x in 1..4 {
            tile = tile.area(x, 2, 5);
        }
        let mut mesh = NavMesh::new(grid_params(10.0, 4)).unwrap();
        mesh.add_tile(tile.build().unwrap(), TileFlags::FREE_DATA, TileRef::NULL).unwrap();

        let mut query = NavMeshQuery::new(&mesh);
        let mut filter = QueryFilter::default();
        filter.set_area_cost(5, 100.0);

        let start = [5.0, 0.0, 1.0];
        let end = [5.0, 0.0, 9.0];
        let start_ref = nearest(&query, start);
        let end_ref = nearest(&query, end);

        let mut path = [PolyRef::NULL; 32];
        let result = query.find_path(start_ref, end_ref, &start, &end, &filter, &mut path).unwrap();
        assert!(!result.is_partial());
        for &r in &path[..result.count] {
            assert_ne!(mesh.get_poly_area(r).unwrap(), 5);
        }
    }

    #[test]
    fn test_straight_path_on_open_grid() {
        let mesh = grid_nav_mesh(1, 1, 10.0, 5).unwrap();
        let mut query = NavMeshQuery::new(&mesh);
        let filter = QueryFilter::default();

        let start = [1.0, 0.0, 1.0];
        let end = [9.0, 0.0, 1.5];
        let start_ref = nearest(&query, start);
        let end_ref = nearest(&query, end);

        let mut path = [PolyRef::NULL; 32];
        let result = query.find_path(start_ref, end_ref, &start, &end, &filter, &mut path).unwrap();

        let mut straight = [StraightPathPoint::default(); 8];
        let sp = query
            .find_straight_path(&start, &end, &path[..result.count], &mut straight, StraightPathOptions::empty())
            .unwrap();
        assert_eq!(sp.count, 2);
        assert_eq!(straight[0].flags, StraightPathFlags::START);
        assert_eq!(straight[0].pos, start);
        assert_eq!(straight[1].flags, StraightPathFlags::END);
        assert_eq!(straight[1].poly_ref, PolyRef::NULL);
        assert_eq!(straight[1].pos, end);
    }

    #[test]
    fn test_straight_path_bends_around_wall() {
        // Wall along x index 2 except the top row.
        let mut tile = GridTile::new(0, 0, 10.0, 5);
        for z in 0..4 {
            tile = tile.block(2, z);
        }
        let mut mesh = NavMesh::new(grid_params(10.0, 4)).unwrap();
        mesh.add_tile(tile.build().unwrap(), TileFlags::FREE_DATA, TileRef::NULL).unwrap();

        let mut query = NavMeshQuery::new(&mesh);
        let filter = QueryFilter::default();
        let start = [1.0, 0.0, 1.0];
        let end = [9.0, 0.0, 1.0];
        let start_ref = nearest(&query, start);
        let end_ref = nearest(&query, end);

        let mut path = [PolyRef::NULL; 32];
        let result = query.find_path(start_ref, end_ref, &start, &end, &filter, &mut path).unwrap();
        assert!(!result.is_partial());

        let mut straight = [StraightPathPoint::default(); 8];
        let sp = query
            .find_straight_path(&start, &end, &path[..result.count], &mut straight, StraightPathOptions::empty())
            .unwrap();
        assert_eq!(sp.count, 4);
        assert!((straight[1].pos[0] - 4.0).abs() < 1e-4);
        assert!((straight[1].pos[2] - 8.0).abs() < 1e-4);
        assert!((straight[2].pos[0] - 6.0).abs() < 1e-4);
        assert!((straight[2].pos[2] - 8.0).abs() < 1e-4);

        // A two-vertex buffer truncates.
        let mut short = [StraightPathPoint::default(); 2];
        let sp = query
            .find_straight_path(&start, &end, &path[..result.count], &mut short, StraightPathOptions::empty())
            .unwrap();
        assert_eq!(sp.count, 2);
        assert!(sp.is_truncated());
    }

    #[test]
    fn test_straight_path_all_crossings() {
        let mesh = grid_nav_mesh(1, 1, 10.0, 5).unwrap();
        let mut query = NavMeshQuery::new(&mesh);
        let filter = QueryFilter::default();
        let start = [1.0, 0.0, 1.0];
        let end = [9.0, 0.0, 1.0];
        let start_ref = nearest(&query, start);
        let end_ref = nearest(&query, end);

        let mut path = [PolyRef::NULL; 32];
        let result = query.find_path(start_ref, end_ref, &start, &end, &filter, &mut path).unwrap();

        let mut straight = [StraightPathPoint::default(); 16];
        let sp = query
            .find_straight_path(&start, &end, &path[..result.count], &mut straight, StraightPathOptions::ALL_CROSSINGS)
            .unwrap();
        // Start, four portal crossings, end.
        assert_eq!(sp.count, 6);
        for (k, p) in straight[1..5].iter().enumerate() {
            assert!((p.pos[0] - 2.0 * (k + 1) as f32).abs() < 1e-4);
            assert_eq!(p.poly_ref, path[k + 1]);
        }

        // No area changes on a uniform grid.
        let sp = query
            .find_straight_path(&start, &end, &path[..result.count], &mut straight, StraightPathOptions::AREA_CROSSINGS)
            .unwrap();
        assert_eq!(sp.count, 2);
    }

    #[test]
    fn test_closest_point_on_poly_boundary() {
        let mesh = grid_nav_mesh(1, 1, 10.0, 5).unwrap();
        let query = NavMeshQuery::new(&mesh);
        let r = nearest(&query, [1.0, 0.0, 1.0]);

        let inside = query.closest_point_on_poly_boundary(r, &[1.0, 3.0, 1.5]).unwrap();
        assert_eq!(inside, [1.0, 3.0, 1.5]);

        let outside = query.closest_point_on_poly_boundary(r, &[5.0, 0.0, 1.0]).unwrap();
        assert!((outside[0] - 2.0).abs() < 1e-5);
        assert!((outside[2] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_get_poly_height() {
        let mesh = grid_nav_mesh(1, 1, 10.0, 5).unwrap();
        let query = NavMeshQuery::new(&mesh);
        let r = nearest(&query, [1.0, 0.0, 1.0]);
        assert_eq!(query.get_poly_height(r, &[1.0, 5.0, 1.0]).unwrap(), Some(0.0));
        assert_eq!(query.get_poly_height(r, &[5.0, 0.0, 5.0]).unwrap(), None);
    }

    #[test]
    fn test_raycast() {
        let mut tile = GridTile::new(0, 0, 10.0, 5);
        tile = tile.block(3, 0);
        let mut mesh = NavMesh::new(grid_params(10.0, 4)).unwrap();
        mesh.add_tile(tile.build().unwrap(), TileFlags::FREE_DATA, TileRef::NULL).unwrap();
        let query = NavMeshQuery::new(&mesh);
        let filter = QueryFilter::default();

        let start = [1.0, 0.0, 1.0];
        let start_ref = nearest(&query, start);
        let mut path = [PolyRef::NULL; 16];

        // Open ray ends inside a polygon.
        let hit = query
            .raycast(start_ref, &start, &[5.0, 0.0, 1.0], &filter, RaycastOptions::empty(), PolyRef::NULL, &mut path)
            .unwrap();
        assert_eq!(hit.t, f32::MAX);
        assert_eq!(hit.path_count, 3);

        // Blocked cell at x in [6, 8].
        let end = [9.0, 0.0, 1.0];
        let hit = query
            .raycast(start_ref, &start, &end, &filter, RaycastOptions::empty(), PolyRef::NULL, &mut path)
            .unwrap();
        assert!(hit.hit_wall());
        assert!((hit.t - 5.0 / 8.0).abs() < 1e-4);
        assert!((hit.hit_normal[0] + 1.0).abs() < 1e-4);
        let pt = hit.hit_point(&start, &end);
        assert!((pt[0] - 6.0).abs() < 1e-4);
    }

    #[test]
    fn test_raycast_costs() {
        let mesh = grid_nav_mesh(1, 1, 10.0, 5).unwrap();
        let query = NavMeshQuery::new(&mesh);
        let filter = QueryFilter::default();
        let start = [1.0, 0.0, 1.0];
        let start_ref = nearest(&query, start);
        let mut path = [PolyRef::NULL; 16];

        let hit = query
            .raycast(start_ref, &start, &[7.0, 0.0, 1.0], &filter, RaycastOptions::USE_COSTS, PolyRef::NULL, &mut path)
            .unwrap();
        assert_eq!(hit.t, f32::MAX);
        assert!((hit.path_cost - 6.0).abs() < 1e-3);
    }

    #[test]
    fn test_move_along_surface_slides_on_wall() {
        let mesh = grid_nav_mesh(1, 1, 10.0, 5).unwrap();
        let mut query = NavMeshQuery::new(&mesh);
        let filter = QueryFilter::default();
        let start = [9.0, 0.0, 5.0];
        let start_ref = nearest(&query, start);

        let mut visited = [PolyRef::NULL; 16];
        let (pos, result) = query
            .move_along_surface(start_ref, &start, &[11.0, 0.0, 5.0], &filter, &mut visited)
            .unwrap();
        assert!((pos[0] - 10.0).abs() < 1e-4);
        assert!((pos[2] - 5.0).abs() < 1e-4);
        assert_eq!(result.count, 1);
        assert_eq!(visited[0], start_ref);

        let (pos, result) = query
            .move_along_surface(start_ref, &start, &[7.0, 0.0, 5.0], &filter, &mut visited)
            .unwrap();
        assert_eq!(pos, [7.0, 0.0, 5.0]);
        assert_eq!(result.count, 2);
        assert_eq!(visited[0], start_ref);
    }

    #[test]
    fn test_find_local_neighbourhood() {
        let mesh = grid_nav_mesh(1, 1, 10.0, 5).unwrap();
        let mut query = NavMeshQuery::new(&mesh);
        let filter = QueryFilter::default();
        let center = [5.0, 0.0, 5.0];
        let start_ref = nearest(&query, center);

        let mut refs = [PolyRef::NULL; 16];
        let mut parents = [PolyRef::NULL; 16];
        let result = query
            .find_local_neighbourhood(start_ref, &center, 1.2, &filter, &mut refs, Some(&mut parents))
            .unwrap();
        // Centre cell plus its four edge neighbours.
        assert_eq!(result.count, 5);
        assert_eq!(refs[0], start_ref);
        assert!(parents[1..5].iter().all(|&p| p == start_ref));
    }

    #[test]
    fn test_wall_segments() {
        let mesh = grid_nav_mesh(1, 1, 10.0, 5).unwrap();
        let query = NavMeshQuery::new(&mesh);
        let filter = QueryFilter::default();
        let corner = nearest(&query, [1.0, 0.0, 1.0]);

        let mut segs = [[0.0; 6]; 8];
        let result = query.get_poly_wall_segments(corner, &filter, &mut segs, None).unwrap();
        assert_eq!(result.count, 2);

        let mut refs = [PolyRef::NULL; 8];
        let result = query.get_poly_wall_segments(corner, &filter, &mut segs, Some(&mut refs)).unwrap();
        assert_eq!(result.count, 4);
        assert_eq!(refs[..4].iter().filter(|r| r.is_valid()).count(), 2);
    }

    #[test]
    fn test_find_polys_around_circle_and_path_back() {
        let mesh = grid_nav_mesh(1, 1, 10.0, 5).unwrap();
        let mut query = NavMeshQuery::new(&mesh);
        let filter = QueryFilter::default();
        let center = [5.0, 0.0, 5.0];
        let start_ref = nearest(&query, center);

        let mut refs = [PolyRef::NULL; 32];
        let mut costs = [0.0; 32];
        let result = query
            .find_polys_around_circle(start_ref, &center, 3.0, &filter, &mut refs, None, Some(&mut costs))
            .unwrap();
        assert_eq!(refs[0], start_ref);
        assert_eq!(costs[0], 0.0);
        assert!(result.count > 5);
        assert!(costs[..result.count].windows(2).all(|w| w[0] <= w[1]));

        let far = refs[result.count - 1];
        assert!(query.is_in_closed_list(far));
        let mut path = [PolyRef::NULL; 16];
        let back = query.get_path_from_dijkstra_search(far, &mut path).unwrap();
        assert_eq!(path[0], start_ref);
        assert_eq!(path[back.count - 1], far);
    }

    #[test]
    fn test_find_polys_around_shape() {
        let mesh = grid_nav_mesh(1, 1, 10.0, 5).unwrap();
        let mut query = NavMeshQuery::new(&mesh);
        let filter = QueryFilter::default();
        let start_ref = nearest(&query, [5.0, 0.0, 5.0]);

        // Thin box along x through the middle row.
        let shape = [[1.0, 0.0, 4.5], [1.0, 0.0, 5.5], [9.0, 0.0, 5.5], [9.0, 0.0, 4.5]];
        let mut refs = [PolyRef::NULL; 32];
        let result = query
            .find_polys_around_shape(start_ref, &shape, &filter, &mut refs, None, None)
            .unwrap();
        assert_eq!(result.count, 5);
    }

    #[test]
    fn test_find_distance_to_wall() {
        let mesh = grid_nav_mesh(1, 1, 10.0, 5).unwrap();
        let mut query = NavMeshQuery::new(&mesh);
        let filter = QueryFilter::default();
        let center = [5.0, 0.0, 1.0];
        let r = nearest(&query, center);

        let (d, pos, normal) = query.find_distance_to_wall(r, &center, 5.0, &filter).unwrap();
        assert!((d - 1.0).abs() < 1e-4);
        assert!((pos[2]).abs() < 1e-4);
        assert!((normal[2] - 1.0).abs() < 1e-4);

        let (d, _, _) = query.find_distance_to_wall(r, &center, 0.5, &filter).unwrap();
        assert_eq!(d, 0.5);
    }

    #[test]
    fn test_random_points_stay_on_mesh() {
        let mesh = grid_nav_mesh(2, 1, 10.0, 2).unwrap();
        let mut query = NavMeshQuery::new(&mesh);
        let filter = QueryFilter::default();
        let mut rng = fastrand::Rng::with_seed(7);

        for _ in 0..50 {
            let (r, pt) = query.find_random_point(&filter, &mut || rng.f32()).unwrap();
            let (_, over) = query.closest_point_on_poly(r, &pt).unwrap();
            assert!(over);
            assert!(pt[0] >= 0.0 && pt[0] <= 20.0);
        }

        let center = [5.0, 0.0, 5.0];
        let start_ref = nearest(&query, center);
        for _ in 0..20 {
            let (r, _) = query
                .find_random_point_around_circle(start_ref, &center, 1.0, &filter, &mut || rng.f32())
                .unwrap();
            assert!(r.is_valid());
        }

        let none = QueryFilter::new(PolyFlags::SWIM, PolyFlags::empty());
        assert!(query.find_random_point(&none, &mut || 0.5).is_err());
    }

    #[test]
    fn test_sliced_search_is_resumable_across_buffers() {
        let mesh = grid_nav_mesh(1, 1, 10.0, 5).unwrap();
        let start = [1.0, 0.0, 1.0];
        let end = [9.0, 0.0, 9.0];
        let filter = QueryFilter::default();

        let mut query = NavMeshQuery::new(&mesh);
        let start_ref = nearest(&query, start);
        let end_ref = nearest(&query, end);
        query.init_sliced_find_path(start_ref, end_ref, &start, &end, &filter).unwrap();
        let (iters, status) = query.update_sliced_find_path(2).unwrap();
        assert_eq!(iters, 2);
        assert!(status.is_in_progress());

        let buffers = query.into_buffers();
        let mut query = NavMeshQuery::with_buffers(&mesh, buffers);
        loop {
            let (_, status) = query.update_sliced_find_path(2).unwrap();
            if !status.is_in_progress() {
                break;
            }
        }
        let mut path = [PolyRef::NULL; 32];
        let result = query.finalize_sliced_find_path(&mut path).unwrap();
        assert!(!result.is_partial());
        assert_eq!(path[result.count - 1], end_ref);

        // Finalizing twice has nothing to report.
        assert!(query.finalize_sliced_find_path(&mut path).is_err());
    }
}
