//! Tests for spatial queries: box queries, Dijkstra area searches, wall
//! distance and random sampling.

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use crate::test_mesh_helpers::{grid_nav_mesh, grid_params, GridTile};
    use crate::{DtStatus, MeshTile, NavMesh, NavMeshQuery, PolyQuery, PolyRef, QueryFilter, TileFlags, TileRef};
    use detour_common::Result;

    const EXT: [f32; 3] = [0.5, 2.0, 0.5];

    fn nearest(query: &NavMeshQuery<'_>, pos: [f32; 3]) -> Result<PolyRef> {
        let (r, _) = query.find_nearest_poly(&pos, &EXT, &QueryFilter::default())?;
        assert!(r.is_valid(), "no polygon near {pos:?}");
        Ok(r)
    }

    fn mesh_with(tiles: &[GridTile]) -> Result<NavMesh> {
        let mut nav_mesh = NavMesh::new(grid_params(10.0, 8))?;
        for tile in tiles {
            nav_mesh.add_tile(tile.build()?, TileFlags::empty(), TileRef::NULL)?;
        }
        Ok(nav_mesh)
    }

    #[derive(Default)]
    struct TileCounter {
        tiles: HashSet<usize>,
        batches: usize,
        total: usize,
    }

    impl PolyQuery for TileCounter {
        fn process(&mut self, tile: &MeshTile, refs: &[PolyRef]) {
            self.tiles.insert(tile.index());
            self.batches += 1;
            self.total += refs.len();
            assert!(refs.iter().all(|r| r.tile_index() as usize == tile.index()));
        }
    }

    #[test]
    fn test_custom_poly_query_gets_per_tile_batches() -> Result<()> {
        let nav_mesh = grid_nav_mesh(2, 1, 10.0, 2)?;
        let query = NavMeshQuery::new(&nav_mesh);
        let mut counter = TileCounter::default();
        query.query_polygons_with(&[10.0, 0.0, 5.0], &[20.0, 1.0, 20.0], &QueryFilter::default(), &mut counter)?;
        assert_eq!(counter.total, 8);
        assert_eq!(counter.tiles.len(), 2);
        assert!(counter.batches >= 2);
        Ok(())
    }

    #[test]
    fn test_query_polygons_honours_area_filter() -> Result<()> {
        let nav_mesh = mesh_with(&[GridTile::new(0, 0, 10.0, 2).area(0, 0, 3).area(1, 1, 3)])?;
        let query = NavMeshQuery::new(&nav_mesh);
        let mut filter = QueryFilter::default();
        filter.set_area_enabled(3, false);

        let mut polys = [PolyRef::NULL; 8];
        let result = query.query_polygons(&[5.0, 0.0, 5.0], &[10.0, 1.0, 10.0], &filter, &mut polys)?;
        assert_eq!(result.count, 2);
        for r in &polys[..result.count] {
            assert_ne!(nav_mesh.get_poly_area(*r)?, 3);
        }

        // Nearest skips the disabled cell under the point.
        let (r, pt) = query.find_nearest_poly(&[2.0, 0.0, 2.0], &[4.0, 2.0, 4.0], &filter)?;
        assert!(r.is_valid());
        assert_ne!(nav_mesh.get_poly_area(r)?, 3);
        assert!(pt[0] >= 5.0 - 1e-4 || pt[2] >= 5.0 - 1e-4);
        Ok(())
    }

    #[test]
    fn test_circle_search_parents_and_truncation() -> Result<()> {
        let nav_mesh = grid_nav_mesh(1, 1, 10.0, 5)?;
        let mut query = NavMeshQuery::new(&nav_mesh);
        let filter = QueryFilter::default();
        let center = [5.0, 0.0, 5.0];
        let start_ref = nearest(&query, center)?;

        let mut refs = [PolyRef::NULL; 32];
        let mut parents = [PolyRef::NULL; 32];
        let result = query.find_polys_around_circle(start_ref, &center, 2.5, &filter, &mut refs, Some(&mut parents), None)?;
        assert!(parents[0].is_null());
        for i in 1..result.count {
            // A parent is always reported before its children.
            assert!(refs[..i].contains(&parents[i]), "parent of {} missing", refs[i]);
        }

        let mut small = [PolyRef::NULL; 3];
        let truncated = query.find_polys_around_circle(start_ref, &center, 2.5, &filter, &mut small, None, None)?;
        assert_eq!(truncated.count, 3);
        assert_eq!(truncated.required, result.count);
        assert!(truncated.status.contains(DtStatus::BUFFER_TOO_SMALL));
        Ok(())
    }

    #[test]
    fn test_circle_search_stops_at_walls() -> Result<()> {
        let mut tile = GridTile::new(0, 0, 10.0, 5);
        for z in 0..5 {
            tile = tile.block(2, z);
        }
        let nav_mesh = mesh_with(&[tile])?;
        let mut query = NavMeshQuery::new(&nav_mesh);
        let center = [3.0, 0.0, 5.0];
        let start_ref = nearest(&query, center)?;

        let mut refs = [PolyRef::NULL; 32];
        let result = query.find_polys_around_circle(start_ref, &center, 20.0, &QueryFilter::default(), &mut refs, None, None)?;
        // Only the left two columns are reachable.
        assert_eq!(result.count, 10);

        let mut rng = fastrand::Rng::with_seed(3);
        for _ in 0..50 {
            let (r, pt) = query.find_random_point_around_circle(start_ref, &center, 20.0, &QueryFilter::default(), &mut || rng.f32())?;
            assert!(refs[..result.count].contains(&r));
            assert!(pt[0] <= 4.0 + 1e-4);
        }
        Ok(())
    }

    #[test]
    fn test_distance_to_blocked_cell() -> Result<()> {
        let nav_mesh = mesh_with(&[GridTile::new(0, 0, 10.0, 5).block(2, 2)])?;
        let mut query = NavMeshQuery::new(&nav_mesh);
        let center = [3.0, 0.0, 5.0];
        let start_ref = nearest(&query, center)?;

        let (d, pos, normal) = query.find_distance_to_wall(start_ref, &center, 5.0, &QueryFilter::default())?;
        assert!((d - 1.0).abs() < 1e-4, "distance {d}");
        assert!((pos[0] - 4.0).abs() < 1e-4);
        assert!((normal[0] + 1.0).abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn test_random_point_is_area_weighted() -> Result<()> {
        // One 10 x 10 polygon next to twenty-five 2 x 2 polygons.
        let nav_mesh = mesh_with(&[GridTile::new(0, 0, 10.0, 1), GridTile::new(1, 0, 10.0, 5)])?;
        let query = NavMeshQuery::new(&nav_mesh);
        let filter = QueryFilter::default();
        let mut rng = fastrand::Rng::with_seed(42);

        let samples = 2000;
        let mut left = 0;
        for _ in 0..samples {
            let (r, pt) = query.find_random_point(&filter, &mut || rng.f32())?;
            let (_, over) = query.closest_point_on_poly(r, &pt)?;
            assert!(over);
            if pt[0] < 10.0 {
                left += 1;
            }
        }
        // Equal areas: about half the samples on each side.
        assert!((800..=1200).contains(&left), "{left} of {samples} samples on the left");
        Ok(())
    }

    #[test]
    fn test_shape_search_reports_costs() -> Result<()> {
        let nav_mesh = grid_nav_mesh(1, 1, 10.0, 5)?;
        let mut query = NavMeshQuery::new(&nav_mesh);
        let start_ref = nearest(&query, [1.0, 0.0, 1.0])?;

        // Column along z at x = 1.
        let shape = [[0.5, 0.0, 0.5], [0.5, 0.0, 9.5], [1.5, 0.0, 9.5], [1.5, 0.0, 0.5]];
        let mut refs = [PolyRef::NULL; 16];
        let mut costs = [0.0; 16];
        let result = query.find_polys_around_shape(start_ref, &shape, &QueryFilter::default(), &mut refs, None, Some(&mut costs))?;
        assert_eq!(result.count, 5);
        assert!(costs[..result.count].windows(2).all(|w| w[0] <= w[1]));

        assert!(query
            .find_polys_around_shape(start_ref, &shape[..2], &QueryFilter::default(), &mut refs, None, None)
            .is_err());
        Ok(())
    }
}
