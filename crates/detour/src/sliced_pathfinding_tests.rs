//! Tests for the sliced A* search

#[cfg(test)]
mod tests {
    use crate::test_mesh_helpers::{grid_nav_mesh, grid_params, GridTile};
    use crate::{
        DtStatus, NavMesh, NavMeshQuery, PolyRef, QueryBuffers, QueryFilter, StraightPathOptions, StraightPathPoint,
        TileFlags, TileRef,
    };
    use detour_common::{Error, Result};

    const EXT: [f32; 3] = [0.5, 2.0, 0.5];

    fn nearest(query: &NavMeshQuery<'_>, pos: [f32; 3]) -> Result<PolyRef> {
        let (r, _) = query.find_nearest_poly(&pos, &EXT, &QueryFilter::default())?;
        assert!(r.is_valid(), "no polygon near {pos:?}");
        Ok(r)
    }

    fn run_sliced(query: &mut NavMeshQuery<'_>, budget: u32) -> Result<u32> {
        let mut frames = 0;
        loop {
            let (_, status) = query.update_sliced_find_path(budget)?;
            frames += 1;
            if !status.is_in_progress() {
                return Ok(frames);
            }
        }
    }

    #[test]
    fn test_sliced_matches_single_call() -> Result<()> {
        let nav_mesh = grid_nav_mesh(2, 2, 10.0, 5)?;
        let filter = QueryFilter::default();
        let mut query = NavMeshQuery::new(&nav_mesh);

        let pairs = [
            ([1.0, 0.0, 1.0], [19.0, 0.0, 19.0]),
            ([3.0, 0.0, 17.0], [15.0, 0.0, 1.0]),
            ([9.0, 0.0, 9.0], [11.0, 0.0, 11.0]),
        ];
        for (start, end) in pairs {
            let start_ref = nearest(&query, start)?;
            let end_ref = nearest(&query, end)?;

            let mut single = [PolyRef::NULL; 64];
            let expected = query.find_path(start_ref, end_ref, &start, &end, &filter, &mut single)?;

            for budget in [1, 3, 16] {
                let status = query.init_sliced_find_path(start_ref, end_ref, &start, &end, &filter)?;
                assert!(status.is_in_progress());
                run_sliced(&mut query, budget)?;
                let mut sliced = [PolyRef::NULL; 64];
                let result = query.finalize_sliced_find_path(&mut sliced)?;
                assert_eq!(result.count, expected.count, "budget {budget}");
                assert_eq!(&sliced[..result.count], &single[..expected.count], "budget {budget}");
            }
        }
        Ok(())
    }

    #[test]
    fn test_partial_finalize_before_completion() -> Result<()> {
        let nav_mesh = grid_nav_mesh(1, 1, 10.0, 5)?;
        let filter = QueryFilter::default();
        let mut query = NavMeshQuery::new(&nav_mesh);
        let start = [1.0, 0.0, 1.0];
        let end = [9.0, 0.0, 9.0];
        let start_ref = nearest(&query, start)?;
        let end_ref = nearest(&query, end)?;

        query.init_sliced_find_path(start_ref, end_ref, &start, &end, &filter)?;
        query.update_sliced_find_path(3)?;
        assert!(query.sliced_status().is_in_progress());

        let mut path = [PolyRef::NULL; 32];
        let result = query.finalize_sliced_find_path(&mut path)?;
        assert!(result.is_partial());
        assert_eq!(path[0], start_ref);
        assert_ne!(path[result.count - 1], end_ref);
        // The state is consumed.
        assert!(query.sliced_status().is_failure());
        Ok(())
    }

    #[test]
    fn test_finalize_partial_keeps_existing_corridor() -> Result<()> {
        let nav_mesh = grid_nav_mesh(1, 1, 10.0, 5)?;
        let filter = QueryFilter::default();
        let mut query = NavMeshQuery::new(&nav_mesh);
        let start = [1.0, 0.0, 5.0];
        let end = [9.0, 0.0, 5.0];
        let start_ref = nearest(&query, start)?;
        let end_ref = nearest(&query, end)?;

        let mut corridor = [PolyRef::NULL; 16];
        let full = query.find_path(start_ref, end_ref, &start, &end, &filter, &mut corridor)?;
        assert_eq!(full.count, 5);

        // Replan a short way and end at the furthest corridor polygon reached.
        query.init_sliced_find_path(start_ref, end_ref, &start, &end, &filter)?;
        query.update_sliced_find_path(2)?;
        let mut path = [PolyRef::NULL; 16];
        let result = query.finalize_sliced_find_path_partial(&corridor[..full.count], &mut path)?;
        assert!(result.count >= 1);
        assert_eq!(path[0], start_ref);
        assert!(corridor[..full.count].contains(&path[result.count - 1]));

        assert!(query.finalize_sliced_find_path_partial(&[], &mut path).is_err());
        Ok(())
    }

    #[test]
    fn test_tile_removal_invalidates_search() -> Result<()> {
        let mut nav_mesh = grid_nav_mesh(3, 1, 10.0, 5)?;
        let filter = QueryFilter::default();
        let start = [1.0, 0.0, 5.0];
        let end = [29.0, 0.0, 5.0];

        let buffers = {
            let mut query = NavMeshQuery::new(&nav_mesh);
            let start_ref = nearest(&query, start)?;
            let end_ref = nearest(&query, end)?;
            query.init_sliced_find_path(start_ref, end_ref, &start, &end, &filter)?;
            let (_, status) = query.update_sliced_find_path(8)?;
            assert!(status.is_in_progress());
            query.into_buffers()
        };

        // Eight cells in, the frontier is inside the middle tile.
        let middle = nav_mesh.get_tile_ref_at(1, 0, 0);
        nav_mesh.remove_tile(middle)?;

        let mut query = NavMeshQuery::with_buffers(&nav_mesh, buffers);
        let mut result = Ok((0, DtStatus::IN_PROGRESS));
        for _ in 0..100 {
            result = query.update_sliced_find_path(40);
            if !matches!(result, Ok((_, status)) if status.is_in_progress()) {
                break;
            }
        }
        assert!(matches!(result, Err(Error::Invalidated(_))), "{result:?}");
        assert!(query.sliced_status().is_failure());
        Ok(())
    }

    #[test]
    fn test_removed_end_tile_invalidates_search() -> Result<()> {
        let mut nav_mesh = grid_nav_mesh(2, 1, 10.0, 5)?;
        let filter = QueryFilter::default();
        let start = [1.0, 0.0, 5.0];
        let end = [19.0, 0.0, 5.0];

        let buffers = {
            let mut query = NavMeshQuery::new(&nav_mesh);
            let start_ref = nearest(&query, start)?;
            let end_ref = nearest(&query, end)?;
            query.init_sliced_find_path(start_ref, end_ref, &start, &end, &filter)?;
            query.update_sliced_find_path(1)?;
            query.into_buffers()
        };

        let right = nav_mesh.get_tile_ref_at(1, 0, 0);
        nav_mesh.remove_tile(right)?;
        let mut query = NavMeshQuery::with_buffers(&nav_mesh, buffers);
        assert!(matches!(query.update_sliced_find_path(10), Err(Error::Invalidated(_))));
        Ok(())
    }

    #[test]
    fn test_small_pool_runs_out_of_nodes() -> Result<()> {
        let nav_mesh = grid_nav_mesh(1, 1, 10.0, 5)?;
        let filter = QueryFilter::default();
        let mut query = NavMeshQuery::with_buffers(&nav_mesh, QueryBuffers::new(4)?);
        let start = [1.0, 0.0, 1.0];
        let end = [9.0, 0.0, 9.0];
        let start_ref = nearest(&query, start)?;
        let end_ref = nearest(&query, end)?;

        let mut path = [PolyRef::NULL; 32];
        let result = query.find_path(start_ref, end_ref, &start, &end, &filter, &mut path)?;
        assert!(result.status.contains(DtStatus::OUT_OF_NODES));
        assert!(result.is_partial());
        assert_eq!(path[0], start_ref);
        Ok(())
    }

    #[test]
    fn test_sliced_path_feeds_funnel() -> Result<()> {
        let tile = GridTile::new(0, 0, 10.0, 5).block(2, 1).block(2, 2).block(2, 3).block(2, 4);
        let mut nav_mesh = NavMesh::new(grid_params(10.0, 2))?;
        nav_mesh.add_tile(tile.build()?, TileFlags::empty(), TileRef::NULL)?;

        let filter = QueryFilter::default();
        let mut query = NavMeshQuery::new(&nav_mesh);
        let start = [1.0, 0.0, 9.0];
        let end = [9.0, 0.0, 9.0];
        let start_ref = nearest(&query, start)?;
        let end_ref = nearest(&query, end)?;

        query.init_sliced_find_path(start_ref, end_ref, &start, &end, &filter)?;
        run_sliced(&mut query, 2)?;
        let mut path = [PolyRef::NULL; 32];
        let result = query.finalize_sliced_find_path(&mut path)?;
        assert!(!result.is_partial());

        // The only gap in the wall is the bottom row.
        let mut straight = [StraightPathPoint::default(); 8];
        let straight_result =
            query.find_straight_path(&start, &end, &path[..result.count], &mut straight, StraightPathOptions::empty())?;
        assert!(straight_result.count >= 4);
        let corners = &straight[1..straight_result.count - 1];
        assert!(corners.iter().all(|c| c.pos[2] <= 2.0 + 1e-4));
        Ok(())
    }
}
