//! Path corridor for smooth path following
//!
//! A corridor is the polygon path from the agent's position to its target.
//! Moving the agent or the target patches the ends of the path with the
//! polygons the local surface walk visited, so small moves never need a new
//! search. The corridor always holds at least the polygon the agent stands
//! on.

use detour::{
    NavMeshQuery, PolyRef, QueryFilter, RaycastOptions, StraightPathFlags, StraightPathOptions, StraightPathPoint,
};
use detour_common::{sqr, vdist_2d, vdist_2d_sqr, vsub, Error, Result};
use log::trace;

/// Corners closer than this to the agent are dropped
const MIN_TARGET_DIST: f32 = 0.01;

/// Polygons a single position move may visit
const MAX_VISITED: usize = 16;

/// Raycast and partial search result size of the optimizations
const MAX_RES: usize = 32;

/// Search iterations spent by one topology optimization
const MAX_TOPOLOGY_ITER: u32 = 32;

/// Polygon corridor between the agent position and its target.
#[derive(Debug, Clone)]
pub struct PathCorridor {
    pos: [f32; 3],
    target: [f32; 3],
    path: Vec<PolyRef>,
    max_path: usize,
}

impl PathCorridor {
    /// Creates a corridor able to hold `max_path` polygons, collapsed on a
    /// null polygon until [`reset`](Self::reset).
    pub fn new(max_path: usize) -> Result<Self> {
        if max_path == 0 {
            return Err(Error::invalid_param("corridor needs room for at least one polygon"));
        }
        let mut path = Vec::with_capacity(max_path);
        path.push(PolyRef::NULL);
        Ok(Self {
            pos: [0.0; 3],
            target: [0.0; 3],
            path,
            max_path,
        })
    }

    /// Collapses the corridor to a single polygon with position and target
    /// at `pos`.
    pub fn reset(&mut self, poly_ref: PolyRef, pos: [f32; 3]) {
        self.pos = pos;
        self.target = pos;
        self.path.clear();
        self.path.push(poly_ref);
    }

    /// Replaces the path. `path[0]` must contain the current position; extra
    /// polygons beyond the capacity are dropped.
    pub fn set_corridor(&mut self, target: [f32; 3], path: &[PolyRef]) -> Result<()> {
        if path.is_empty() {
            return Err(Error::invalid_param("corridor path must not be empty"));
        }
        self.target = target;
        self.path.clear();
        self.path.extend_from_slice(&path[..path.len().min(self.max_path)]);
        Ok(())
    }

    /// Straight path corners ahead of the agent, written to `corners`.
    ///
    /// Corners too close to the position are pruned, and the list stops at
    /// the first off-mesh connection.
    pub fn find_corners(&self, corners: &mut [StraightPathPoint], query: &NavMeshQuery<'_>) -> Result<usize> {
        let result = query.find_straight_path(
            &self.pos,
            &self.target,
            &self.path,
            corners,
            StraightPathOptions::empty(),
        )?;
        let mut n = result.count;

        let skip = corners[..n]
            .iter()
            .position(|c| {
                c.flags.contains(StraightPathFlags::OFFMESH_CONNECTION)
                    || vdist_2d_sqr(&c.pos, &self.pos) > sqr(MIN_TARGET_DIST)
            })
            .unwrap_or(n);
        if skip > 0 {
            corners.copy_within(skip..n, 0);
            n -= skip;
        }

        if let Some(i) = corners[..n]
            .iter()
            .position(|c| c.flags.contains(StraightPathFlags::OFFMESH_CONNECTION))
        {
            n = i + 1;
        }
        Ok(n)
    }

    /// Shortcuts the start of the corridor when `next` is directly visible.
    ///
    /// The ray is cast towards `next` for at most `path_optimization_range`;
    /// the corridor is only patched when the ray gets (almost) all the way.
    pub fn optimize_path_visibility(
        &mut self,
        next: &[f32; 3],
        path_optimization_range: f32,
        query: &NavMeshQuery<'_>,
        filter: &QueryFilter,
    ) -> Result<()> {
        let dist = vdist_2d(&self.pos, next);
        if dist < 0.01 {
            return Ok(());
        }
        let dist = (dist + 0.01).min(path_optimization_range);

        let delta = vsub(next, &self.pos);
        let s = path_optimization_range / dist;
        let goal = [self.pos[0] + delta[0] * s, self.pos[1] + delta[1] * s, self.pos[2] + delta[2] * s];

        let mut res = [PolyRef::NULL; MAX_RES];
        let hit = query.raycast(
            self.path[0],
            &self.pos,
            &goal,
            filter,
            RaycastOptions::empty(),
            PolyRef::NULL,
            &mut res,
        )?;
        if hit.path_count > 1 && hit.t > 0.99 {
            merge_corridor_start_shortcut(&mut self.path, self.max_path, &res[..hit.path_count]);
        }
        Ok(())
    }

    /// Replaces the start of the corridor with a short bounded search.
    ///
    /// Returns true when the corridor changed. Reuses the sliced search state
    /// of `query`.
    pub fn optimize_path_topology(&mut self, query: &mut NavMeshQuery<'_>, filter: &QueryFilter) -> Result<bool> {
        if self.path.len() < 3 {
            return Ok(false);
        }

        let last = self.path[self.path.len() - 1];
        query.init_sliced_find_path(self.path[0], last, &self.pos, &self.target, filter)?;
        query.update_sliced_find_path(MAX_TOPOLOGY_ITER)?;
        let mut res = [PolyRef::NULL; MAX_RES];
        let result = query.finalize_sliced_find_path_partial(&self.path, &mut res)?;

        if result.count > 0 {
            merge_corridor_start_shortcut(&mut self.path, self.max_path, &res[..result.count]);
            trace!("topology optimization merged {} polygons", result.count);
            return Ok(true);
        }
        Ok(false)
    }

    /// Advances the corridor past the off-mesh connection `offmesh_con_ref`.
    ///
    /// Returns the polygon before the connection and the connection's start
    /// and end points in travel order. The position moves to the end point.
    pub fn move_over_offmesh_connection(
        &mut self,
        offmesh_con_ref: PolyRef,
        query: &NavMeshQuery<'_>,
    ) -> Result<(PolyRef, [f32; 3], [f32; 3])> {
        // The connection must not be the last polygon: the agent lands on the
        // one after it.
        let Some(k) = self.path.iter().position(|&r| r == offmesh_con_ref) else {
            return Err(Error::invalid_param("off-mesh connection is not on the corridor"));
        };
        if k + 1 >= self.path.len() {
            return Err(Error::invalid_param("off-mesh connection ends the corridor"));
        }
        let prev_ref = if k > 0 { self.path[k - 1] } else { self.path[0] };

        let (start_pos, end_pos) = query
            .nav_mesh()
            .get_off_mesh_connection_poly_end_points(prev_ref, offmesh_con_ref)?;
        self.path.drain(..=k);
        self.pos = end_pos;
        Ok((prev_ref, start_pos, end_pos))
    }

    /// Moves the position along the mesh surface towards `new_pos`.
    ///
    /// The start of the corridor follows the visited polygons and the height
    /// snaps to the first polygon.
    pub fn move_position(&mut self, new_pos: &[f32; 3], query: &mut NavMeshQuery<'_>, filter: &QueryFilter) -> Result<()> {
        let mut visited = [PolyRef::NULL; MAX_VISITED];
        let (mut result, walk) = query.move_along_surface(self.path[0], &self.pos, new_pos, filter, &mut visited)?;
        merge_corridor_start_moved(&mut self.path, self.max_path, &visited[..walk.count]);

        if let Some(h) = query.get_poly_height(self.path[0], &result)? {
            result[1] = h;
        }
        self.pos = result;
        Ok(())
    }

    /// Moves the target along the mesh surface towards `new_pos`, extending
    /// or shrinking the end of the corridor.
    pub fn move_target_position(
        &mut self,
        new_pos: &[f32; 3],
        query: &mut NavMeshQuery<'_>,
        filter: &QueryFilter,
    ) -> Result<()> {
        let mut visited = [PolyRef::NULL; MAX_VISITED];
        let last = self.path[self.path.len() - 1];
        let (result, walk) = query.move_along_surface(last, &self.target, new_pos, filter, &mut visited)?;
        merge_corridor_end_moved(&mut self.path, self.max_path, &visited[..walk.count]);
        self.target = result;
        Ok(())
    }

    /// Puts the agent back on `safe_ref` at `safe_pos` when the first polygon
    /// became invalid.
    ///
    /// The next polygon is replaced by a null marker so the corridor fails
    /// validation and gets replanned, while the rest of the path is kept as a
    /// hint for the replanner.
    pub fn fix_path_start(&mut self, safe_ref: PolyRef, safe_pos: [f32; 3]) {
        self.pos = safe_pos;
        let n = self.path.len();
        if n < 3 && n > 0 {
            let last = self.path[n - 1];
            self.path.clear();
            let fixed = [safe_ref, PolyRef::NULL, last];
            self.path.extend_from_slice(&fixed[..self.max_path.min(3)]);
        } else if n == 0 {
            self.path.push(safe_ref);
        } else {
            self.path[0] = safe_ref;
            self.path[1] = PolyRef::NULL;
        }
    }

    /// Cuts the corridor at the first polygon that is no longer valid and
    /// clamps the target into the last remaining polygon.
    ///
    /// When the first polygon itself is invalid the corridor restarts at
    /// `safe_ref`.
    pub fn trim_invalid_path(
        &mut self,
        safe_ref: PolyRef,
        safe_pos: [f32; 3],
        query: &NavMeshQuery<'_>,
        filter: &QueryFilter,
    ) -> Result<()> {
        let n = self
            .path
            .iter()
            .position(|&r| !query.is_valid_poly_ref(r, filter))
            .unwrap_or(self.path.len());

        if n == self.path.len() {
            return Ok(());
        } else if n == 0 {
            self.pos = safe_pos;
            self.path.clear();
            self.path.push(safe_ref);
        } else {
            self.path.truncate(n);
        }

        let last = self.path[self.path.len() - 1];
        self.target = query.closest_point_on_poly_boundary(last, &self.target)?;
        Ok(())
    }

    /// Checks the first `max_look_ahead` polygons against the mesh and the
    /// filter.
    pub fn is_valid(&self, max_look_ahead: usize, query: &NavMeshQuery<'_>, filter: &QueryFilter) -> bool {
        self.path
            .iter()
            .take(max_look_ahead)
            .all(|&r| query.is_valid_poly_ref(r, filter))
    }

    pub fn pos(&self) -> &[f32; 3] {
        &self.pos
    }

    pub fn target(&self) -> &[f32; 3] {
        &self.target
    }

    /// Polygon the agent stands on, null for a collapsed corridor.
    pub fn first_poly(&self) -> PolyRef {
        self.path.first().copied().unwrap_or(PolyRef::NULL)
    }

    pub fn last_poly(&self) -> PolyRef {
        self.path.last().copied().unwrap_or(PolyRef::NULL)
    }

    pub fn path(&self) -> &[PolyRef] {
        &self.path
    }

    pub fn path_count(&self) -> usize {
        self.path.len()
    }

    pub fn max_path(&self) -> usize {
        self.max_path
    }
}

/// Furthest polygon of `path` that also appears in `visited`, and its
/// earliest position in `visited`.
fn furthest_common(path: &[PolyRef], visited: &[PolyRef], from_end: bool) -> Option<(usize, usize)> {
    let matches = |i: usize| visited.iter().position(|&v| v == path[i]).map(|j| (i, j));
    if from_end {
        (0..path.len()).rev().find_map(matches)
    } else {
        (0..path.len()).find_map(matches)
    }
}

/// Patches the start of `path` after the agent moved through `visited`.
///
/// `visited` starts at the old first polygon and ends where the agent is
/// now; the path is rewritten to begin at the new polygon.
pub fn merge_corridor_start_moved(path: &mut Vec<PolyRef>, max_path: usize, visited: &[PolyRef]) {
    let Some((furthest_path, furthest_visited)) = furthest_common(path, visited, true) else {
        return;
    };

    let req = (visited.len() - furthest_visited).min(max_path);
    let orig = (furthest_path + 1).min(path.len());
    let size = (path.len() - orig).min(max_path - req);

    path.truncate(orig + size);
    path.drain(..orig);
    path.splice(0..0, visited[furthest_visited..].iter().rev().take(req).copied());
}

/// Patches the end of `path` after the target moved through `visited`.
pub fn merge_corridor_end_moved(path: &mut Vec<PolyRef>, max_path: usize, visited: &[PolyRef]) {
    let Some((furthest_path, furthest_visited)) = furthest_common(path, visited, false) else {
        return;
    };

    let ppos = furthest_path + 1;
    let vpos = furthest_visited + 1;
    let count = (visited.len() - vpos).min(max_path.saturating_sub(ppos));

    path.truncate(ppos);
    path.extend_from_slice(&visited[vpos..vpos + count]);
}

/// Replaces the start of `path` with a shortcut `visited` that begins at the
/// current first polygon and rejoins the path later on.
pub fn merge_corridor_start_shortcut(path: &mut Vec<PolyRef>, max_path: usize, visited: &[PolyRef]) {
    let Some((furthest_path, furthest_visited)) = furthest_common(path, visited, true) else {
        return;
    };

    let req = furthest_visited.min(max_path);
    if req == 0 {
        return;
    }
    let orig = furthest_path;
    let size = (path.len() - orig).min(max_path - req);

    path.truncate(orig + size);
    path.drain(..orig);
    path.splice(0..0, visited[..req].iter().copied());
}

#[cfg(test)]
mod tests {
    use super::*;
    use detour::test_mesh_helpers::{grid_nav_mesh, grid_params, GridTile};
    use detour::{NavMesh, TileFlags, TileRef};

    const EXT: [f32; 3] = [0.5, 2.0, 0.5];

    fn refs(ids: &[u32]) -> Vec<PolyRef> {
        ids.iter().map(|&i| PolyRef::new(i)).collect()
    }

    fn nearest(query: &NavMeshQuery<'_>, pos: [f32; 3]) -> Result<PolyRef> {
        let (r, _) = query.find_nearest_poly(&pos, &EXT, &QueryFilter::default())?;
        assert!(r.is_valid(), "no polygon near {pos:?}");
        Ok(r)
    }

    fn corridor_to(query: &mut NavMeshQuery<'_>, start: [f32; 3], end: [f32; 3]) -> Result<PathCorridor> {
        let filter = QueryFilter::default();
        let start_ref = nearest(query, start)?;
        let end_ref = nearest(query, end)?;
        let mut path = [PolyRef::NULL; 64];
        let result = query.find_path(start_ref, end_ref, &start, &end, &filter, &mut path)?;
        let mut corridor = PathCorridor::new(64)?;
        corridor.reset(start_ref, start);
        corridor.set_corridor(end, &path[..result.count])?;
        Ok(corridor)
    }

    #[test]
    fn test_merge_start_moved() {
        // Walked from 1 over 2 into 7, which is off the old path.
        let mut path = refs(&[1, 2, 3, 4]);
        merge_corridor_start_moved(&mut path, 16, &refs(&[1, 2, 7]));
        assert_eq!(path, refs(&[7, 2, 3, 4]));

        // Walked forward along the path.
        let mut path = refs(&[1, 2, 3, 4]);
        merge_corridor_start_moved(&mut path, 16, &refs(&[1, 2, 3]));
        assert_eq!(path, refs(&[3, 4]));

        // Nothing in common leaves the path alone.
        let mut path = refs(&[1, 2, 3]);
        merge_corridor_start_moved(&mut path, 16, &refs(&[8, 9]));
        assert_eq!(path, refs(&[1, 2, 3]));
    }

    #[test]
    fn test_merge_end_moved() {
        let mut path = refs(&[1, 2, 3, 4]);
        merge_corridor_end_moved(&mut path, 16, &refs(&[4, 5, 6]));
        assert_eq!(path, refs(&[1, 2, 3, 4, 5, 6]));

        // Respects the capacity.
        let mut path = refs(&[1, 2, 3, 4]);
        merge_corridor_end_moved(&mut path, 5, &refs(&[4, 5, 6]));
        assert_eq!(path, refs(&[1, 2, 3, 4, 5]));

        // Target moved back into the corridor.
        let mut path = refs(&[1, 2, 3, 4]);
        merge_corridor_end_moved(&mut path, 16, &refs(&[2, 3]));
        assert_eq!(path, refs(&[1, 2, 3]));
    }

    #[test]
    fn test_merge_start_shortcut() {
        let mut path = refs(&[1, 2, 3, 4, 5]);
        merge_corridor_start_shortcut(&mut path, 16, &refs(&[1, 9, 4]));
        assert_eq!(path, refs(&[1, 9, 4, 5]));

        // A shortcut that only touches the first polygon changes nothing.
        let mut path = refs(&[1, 2, 3]);
        merge_corridor_start_shortcut(&mut path, 16, &refs(&[1, 8]));
        assert_eq!(path, refs(&[1, 2, 3]));
    }

    #[test]
    fn test_set_corridor_and_reset() -> Result<()> {
        assert!(PathCorridor::new(0).is_err());
        let mut corridor = PathCorridor::new(3)?;
        corridor.reset(PolyRef::new(5), [1.0, 0.0, 1.0]);
        assert_eq!(corridor.path(), &[PolyRef::new(5)]);
        assert_eq!(corridor.target(), &[1.0, 0.0, 1.0]);

        corridor.set_corridor([4.0, 0.0, 4.0], &refs(&[5, 6, 7, 8]))?;
        assert_eq!(corridor.path_count(), 3);
        assert_eq!(corridor.last_poly(), PolyRef::new(7));
        assert!(corridor.set_corridor([0.0; 3], &[]).is_err());
        Ok(())
    }

    #[test]
    fn test_move_position_follows_surface() -> Result<()> {
        let nav_mesh = grid_nav_mesh(1, 1, 10.0, 5)?;
        let mut query = NavMeshQuery::new(&nav_mesh);
        let filter = QueryFilter::default();
        let mut corridor = corridor_to(&mut query, [1.0, 0.0, 5.0], [9.0, 0.0, 5.0])?;
        assert_eq!(corridor.path_count(), 5);

        corridor.move_position(&[3.0, 0.0, 5.0], &mut query, &filter)?;
        assert_eq!(corridor.pos(), &[3.0, 0.0, 5.0]);
        assert_eq!(corridor.path_count(), 4);
        assert_eq!(corridor.first_poly(), nearest(&query, [3.0, 0.0, 5.0])?);

        // Clamped at the tile border.
        corridor.move_position(&[3.0, 0.0, -4.0], &mut query, &filter)?;
        assert!(corridor.pos()[2].abs() < 1e-4);
        assert!(corridor.is_valid(usize::MAX, &query, &filter));
        Ok(())
    }

    #[test]
    fn test_move_target_position_extends_path() -> Result<()> {
        let nav_mesh = grid_nav_mesh(1, 1, 10.0, 5)?;
        let mut query = NavMeshQuery::new(&nav_mesh);
        let filter = QueryFilter::default();
        let mut corridor = corridor_to(&mut query, [1.0, 0.0, 5.0], [5.0, 0.0, 5.0])?;
        assert_eq!(corridor.path_count(), 3);

        corridor.move_target_position(&[9.0, 0.0, 5.0], &mut query, &filter)?;
        assert_eq!(corridor.target(), &[9.0, 0.0, 5.0]);
        assert_eq!(corridor.path_count(), 5);
        assert_eq!(corridor.last_poly(), nearest(&query, [9.0, 0.0, 5.0])?);
        Ok(())
    }

    #[test]
    fn test_find_corners_ends_at_target() -> Result<()> {
        let mut nav_mesh = NavMesh::new(grid_params(10.0, 2))?;
        let mut tile = GridTile::new(0, 0, 10.0, 5);
        for z in 1..5 {
            tile = tile.block(2, z);
        }
        nav_mesh.add_tile(tile.build()?, TileFlags::empty(), TileRef::NULL)?;
        let mut query = NavMeshQuery::new(&nav_mesh);
        let corridor = corridor_to(&mut query, [1.0, 0.0, 9.0], [9.0, 0.0, 9.0])?;

        let mut corners = [StraightPathPoint::default(); 4];
        let n = corridor.find_corners(&mut corners, &query)?;
        assert!(n >= 2);
        // The first corner is the wall end, never the agent position.
        assert!(vdist_2d(&corners[0].pos, corridor.pos()) > MIN_TARGET_DIST);
        assert!((corners[0].pos[2] - 2.0).abs() < 1e-3);
        Ok(())
    }

    #[test]
    fn test_optimize_visibility_shortcuts_start() -> Result<()> {
        let nav_mesh = grid_nav_mesh(1, 1, 10.0, 5)?;
        let mut query = NavMeshQuery::new(&nav_mesh);
        let filter = QueryFilter::default();
        let start = [1.0, 0.0, 1.0];
        let end = [9.0, 0.0, 9.0];
        let mut corridor = corridor_to(&mut query, start, end)?;
        let before = corridor.path_count();
        assert_eq!(before, 9);

        corridor.optimize_path_visibility(&end, 12.0, &query, &filter)?;
        assert!(corridor.path_count() <= before);
        assert_eq!(corridor.first_poly(), nearest(&query, start)?);
        assert_eq!(corridor.last_poly(), nearest(&query, end)?);
        assert!(corridor.is_valid(usize::MAX, &query, &filter));
        Ok(())
    }

    #[test]
    fn test_optimize_topology_keeps_ends() -> Result<()> {
        let nav_mesh = grid_nav_mesh(1, 1, 10.0, 5)?;
        let mut query = NavMeshQuery::new(&nav_mesh);
        let filter = QueryFilter::default();
        let start = [1.0, 0.0, 1.0];
        let end = [9.0, 0.0, 9.0];
        let mut corridor = corridor_to(&mut query, start, end)?;
        let first = corridor.first_poly();
        let last = corridor.last_poly();

        assert!(corridor.optimize_path_topology(&mut query, &filter)?);
        assert_eq!(corridor.first_poly(), first);
        assert_eq!(corridor.last_poly(), last);
        for pair in corridor.path().windows(2) {
            assert!(query.get_portal_points(pair[0], pair[1]).is_ok());
        }

        let mut short = PathCorridor::new(4)?;
        short.reset(first, start);
        assert!(!short.optimize_path_topology(&mut query, &filter)?);
        Ok(())
    }

    #[test]
    fn test_invalid_corridor_after_tile_removal() -> Result<()> {
        let mut nav_mesh = grid_nav_mesh(3, 1, 10.0, 2)?;
        let filter = QueryFilter::default();
        let mut corridor = {
            let mut query = NavMeshQuery::new(&nav_mesh);
            corridor_to(&mut query, [1.0, 0.0, 5.0], [29.0, 0.0, 5.0])?
        };
        let first = corridor.first_poly();

        let middle = nav_mesh.get_tile_ref_at(1, 0, 0);
        nav_mesh.remove_tile(middle)?;
        let query = NavMeshQuery::new(&nav_mesh);
        assert!(!corridor.is_valid(usize::MAX, &query, &filter));
        // The part on the first tile is still fine.
        assert!(corridor.is_valid(2, &query, &filter));

        corridor.trim_invalid_path(first, [1.0, 0.0, 5.0], &query, &filter)?;
        assert!(corridor.is_valid(usize::MAX, &query, &filter));
        assert!(corridor.path().iter().all(|r| r.tile_index() == first.tile_index()));
        assert!(corridor.target()[0] <= 10.0 + 1e-4);
        Ok(())
    }

    #[test]
    fn test_fix_path_start_marks_corridor_for_replan() -> Result<()> {
        let mut corridor = PathCorridor::new(8)?;
        corridor.reset(PolyRef::new(1), [0.0; 3]);
        corridor.set_corridor([5.0, 0.0, 0.0], &refs(&[1, 2]))?;
        corridor.fix_path_start(PolyRef::new(9), [1.0, 0.0, 0.0]);
        assert_eq!(corridor.path(), &refs(&[9, 0, 2])[..]);
        assert_eq!(corridor.pos(), &[1.0, 0.0, 0.0]);

        corridor.set_corridor([5.0, 0.0, 0.0], &refs(&[1, 2, 3, 4]))?;
        corridor.fix_path_start(PolyRef::new(9), [1.0, 0.0, 0.0]);
        assert_eq!(corridor.path(), &refs(&[9, 0, 3, 4])[..]);
        Ok(())
    }

    #[test]
    fn test_fix_path_start_respects_capacity() -> Result<()> {
        let mut corridor = PathCorridor::new(2)?;
        corridor.reset(PolyRef::new(1), [0.0; 3]);
        corridor.set_corridor([5.0, 0.0, 0.0], &refs(&[1, 2]))?;
        corridor.fix_path_start(PolyRef::new(9), [1.0, 0.0, 0.0]);
        assert_eq!(corridor.path(), &refs(&[9, 0])[..]);

        let mut corridor = PathCorridor::new(1)?;
        corridor.reset(PolyRef::new(1), [0.0; 3]);
        corridor.fix_path_start(PolyRef::new(9), [1.0, 0.0, 0.0]);
        assert_eq!(corridor.path(), &refs(&[9])[..]);
        Ok(())
    }

    #[test]
    fn test_move_over_offmesh_connection() -> Result<()> {
        let mut tile = GridTile::new(0, 0, 10.0, 5);
        for z in 0..5 {
            tile = tile.block(2, z);
        }
        let tile = tile.off_mesh([3.0, 0.0, 5.0], [7.0, 0.0, 5.0], 0.5, false);
        let mut nav_mesh = NavMesh::new(grid_params(10.0, 2))?;
        nav_mesh.add_tile(tile.build()?, TileFlags::empty(), TileRef::NULL)?;
        let mut query = NavMeshQuery::new(&nav_mesh);
        let mut corridor = corridor_to(&mut query, [1.0, 0.0, 5.0], [9.0, 0.0, 5.0])?;

        let mut corners = [StraightPathPoint::default(); 8];
        let n = corridor.find_corners(&mut corners, &query)?;
        let last = corners[n - 1];
        assert!(last.flags.contains(StraightPathFlags::OFFMESH_CONNECTION));

        let landing = nearest(&query, [7.0, 0.0, 5.0])?;
        let (prev, start, end) = corridor.move_over_offmesh_connection(last.poly_ref, &query)?;
        assert_eq!(prev, nearest(&query, [3.0, 0.0, 5.0])?);
        assert_eq!(start, [3.0, 0.0, 5.0]);
        assert_eq!(end, [7.0, 0.0, 5.0]);
        assert_eq!(corridor.pos(), &end);
        assert_eq!(corridor.first_poly(), landing);

        // Already passed.
        assert!(corridor.move_over_offmesh_connection(last.poly_ref, &query).is_err());
        Ok(())
    }
}
