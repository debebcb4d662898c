//! Multi-frame crowd scenarios
//!
//! These tests run the full update pipeline over many frames and check:
//! - identical runs produce identical positions
//! - avoidance keeps crossing agents apart
//! - agents recover when tiles disappear under them
//! - off-mesh connections are traversed

#[cfg(test)]
mod tests {
    use crate::{Crowd, CrowdAgentParams, CrowdAgentState, CrowdConfig, MoveRequestState, UpdateFlags};
    use detour::test_mesh_helpers::{grid_nav_mesh, grid_params, GridTile};
    use detour::{NavMesh, NavMeshQuery, PolyRef, QueryFilter, TileFlags, TileRef};
    use detour_common::{vdist_2d, Result};

    const DT: f32 = 0.1;

    fn poly_near(nav_mesh: &NavMesh, crowd: &Crowd, pos: [f32; 3]) -> Result<PolyRef> {
        let query = NavMeshQuery::new(nav_mesh);
        let (r, _) = query.find_nearest_poly(&pos, &crowd.query_half_extents(), &QueryFilter::default())?;
        assert!(r.is_valid(), "no polygon near {pos:?}");
        Ok(r)
    }

    fn send(nav_mesh: &NavMesh, crowd: &mut Crowd, idx: usize, target: [f32; 3]) -> Result<()> {
        let target_ref = poly_near(nav_mesh, crowd, target)?;
        crowd.request_move_target(idx, target_ref, &target)
    }

    fn position(crowd: &Crowd, idx: usize) -> [f32; 3] {
        crowd.agent(idx).map(|a| a.position()).unwrap_or([f32::NAN; 3])
    }

    fn run_swarm() -> Result<Vec<[u32; 3]>> {
        let nav_mesh = grid_nav_mesh(2, 2, 10.0, 5)?;
        let mut crowd = Crowd::new(CrowdConfig::default())?;
        let params = CrowdAgentParams {
            radius: 0.5,
            update_flags: UpdateFlags::all(),
            ..Default::default()
        };

        let starts = [
            ([1.0, 0.0, 1.0], [19.0, 0.0, 19.0]),
            ([19.0, 0.0, 19.0], [1.0, 0.0, 1.0]),
            ([1.0, 0.0, 19.0], [19.0, 0.0, 1.0]),
            ([19.0, 0.0, 1.0], [1.0, 0.0, 19.0]),
            ([10.0, 0.0, 1.0], [10.0, 0.0, 19.0]),
            ([10.0, 0.0, 19.0], [10.0, 0.0, 1.0]),
        ];
        for (start, target) in starts {
            let idx = crowd.add_agent(&nav_mesh, &start, &params)?;
            send(&nav_mesh, &mut crowd, idx, target)?;
        }

        for _ in 0..120 {
            crowd.update(&nav_mesh, DT, None)?;
        }
        Ok(crowd.active_agents().map(|i| position(&crowd, i).map(f32::to_bits)).collect())
    }

    #[test]
    fn test_identical_runs_are_deterministic() -> Result<()> {
        let first = run_swarm()?;
        let second = run_swarm()?;
        assert_eq!(first.len(), 6);
        assert_eq!(first, second);
        Ok(())
    }

    /// Two agents walking at each other along the same row; returns the
    /// smallest distance seen and the final positions.
    fn run_crossing(update_flags: UpdateFlags, z_offset: f32) -> Result<(f32, [f32; 3], [f32; 3])> {
        let nav_mesh = grid_nav_mesh(1, 1, 20.0, 4)?;
        let mut crowd = Crowd::new(CrowdConfig::default())?;
        let params = CrowdAgentParams {
            radius: 0.5,
            collision_query_range: 6.0,
            update_flags,
            ..Default::default()
        };

        let a = crowd.add_agent(&nav_mesh, &[2.0, 0.0, 11.0], &params)?;
        let b = crowd.add_agent(&nav_mesh, &[18.0, 0.0, 11.0 + z_offset], &params)?;
        send(&nav_mesh, &mut crowd, a, [18.0, 0.0, 11.0])?;
        send(&nav_mesh, &mut crowd, b, [2.0, 0.0, 11.0 + z_offset])?;

        let mut min_dist = f32::MAX;
        for _ in 0..150 {
            crowd.update(&nav_mesh, DT, None)?;
            min_dist = min_dist.min(vdist_2d(&position(&crowd, a), &position(&crowd, b)));
        }
        Ok((min_dist, position(&crowd, a), position(&crowd, b)))
    }

    #[test]
    fn test_avoidance_keeps_crossing_agents_apart() -> Result<()> {
        let flags = UpdateFlags::ANTICIPATE_TURNS | UpdateFlags::OBSTACLE_AVOIDANCE | UpdateFlags::SEPARATION;
        let (min_dist, a, b) = run_crossing(flags, 0.3)?;
        assert!(min_dist >= 0.5, "agents came {min_dist} close");
        // They got past each other.
        assert!(a[0] > 10.0, "{a:?}");
        assert!(b[0] < 10.0, "{b:?}");
        Ok(())
    }

    #[test]
    fn test_agents_overlap_without_avoidance() -> Result<()> {
        let (min_dist, _, _) = run_crossing(UpdateFlags::empty(), 0.0)?;
        // Collision resolution never fully removes the penetration of agents
        // pushing into each other.
        assert!(min_dist < 1.0 - 1e-3, "closest distance {min_dist}");
        Ok(())
    }

    #[test]
    fn test_removed_tile_under_corridor_triggers_replan() -> Result<()> {
        let mut nav_mesh = grid_nav_mesh(3, 1, 10.0, 5)?;
        let mut crowd = Crowd::new(CrowdConfig::default())?;
        let params = CrowdAgentParams {
            update_flags: UpdateFlags::ANTICIPATE_TURNS,
            ..Default::default()
        };
        let idx = crowd.add_agent(&nav_mesh, &[1.0, 0.0, 5.0], &params)?;
        send(&nav_mesh, &mut crowd, idx, [29.0, 0.0, 5.0])?;

        let middle = nav_mesh.get_tile_ref_at(1, 0, 0);
        for _ in 0..3 {
            crowd.update(&nav_mesh, DT, None)?;
        }
        {
            let agent = crowd.agent(idx).expect("agent");
            assert_eq!(agent.target_state(), MoveRequestState::Valid);
            assert!(!agent.is_partial());
            assert!(agent.corridor().path().iter().any(|r| r.tile_index() == middle.tile_index()));
        }

        nav_mesh.remove_tile(middle)?;
        {
            let query = NavMeshQuery::new(&nav_mesh);
            let agent = crowd.agent(idx).expect("agent");
            assert!(!agent.corridor().is_valid(10, &query, &QueryFilter::default()));
        }

        for _ in 0..80 {
            crowd.update(&nav_mesh, DT, None)?;
        }

        let query = NavMeshQuery::new(&nav_mesh);
        let filter = QueryFilter::default();
        let agent = crowd.agent(idx).expect("agent");
        assert_eq!(agent.state(), CrowdAgentState::Walking);
        assert_eq!(agent.target_state(), MoveRequestState::Valid);
        assert!(agent.is_partial());
        let path = agent.corridor().path();
        assert!(path.iter().all(|&r| query.is_valid_poly_ref(r, &filter)));
        assert!(path.iter().all(|r| r.tile_index() != middle.tile_index()));
        // Stopped at the edge of the first tile.
        let pos = agent.position();
        assert!(pos[0] <= 10.0 && pos[0] > 8.0, "{pos:?}");
        Ok(())
    }

    #[test]
    fn test_removed_tile_under_agent_invalidates_it() -> Result<()> {
        let mut nav_mesh = grid_nav_mesh(2, 1, 10.0, 5)?;
        let mut crowd = Crowd::new(CrowdConfig::default())?;
        let idx = crowd.add_agent(&nav_mesh, &[5.0, 0.0, 5.0], &CrowdAgentParams::default())?;
        send(&nav_mesh, &mut crowd, idx, [15.0, 0.0, 5.0])?;
        crowd.update(&nav_mesh, DT, None)?;

        let left = nav_mesh.get_tile_ref_at(0, 0, 0);
        nav_mesh.remove_tile(left)?;
        crowd.update(&nav_mesh, DT, None)?;

        let agent = crowd.agent(idx).expect("agent");
        assert_eq!(agent.state(), CrowdAgentState::Invalid);
        assert!(agent.corridor().first_poly().is_null());

        // Invalid agents are left alone until moved back onto the mesh.
        let frozen = agent.position();
        crowd.update(&nav_mesh, DT, None)?;
        assert_eq!(position(&crowd, idx), frozen);

        crowd.teleport_agent(&nav_mesh, idx, &[12.0, 0.0, 5.0])?;
        assert_eq!(crowd.agent(idx).map(|a| a.state()), Some(CrowdAgentState::Walking));
        Ok(())
    }

    #[test]
    fn test_agent_traverses_offmesh_connection() -> Result<()> {
        let mut tile = GridTile::new(0, 0, 10.0, 5);
        for z in 0..5 {
            tile = tile.block(2, z);
        }
        let tile = tile.off_mesh([3.0, 0.0, 5.0], [7.0, 0.0, 5.0], 0.5, false);
        let mut nav_mesh = NavMesh::new(grid_params(10.0, 2))?;
        nav_mesh.add_tile(tile.build()?, TileFlags::empty(), TileRef::NULL)?;

        let mut crowd = Crowd::new(CrowdConfig::default())?;
        let params = CrowdAgentParams {
            update_flags: UpdateFlags::ANTICIPATE_TURNS,
            ..Default::default()
        };
        let idx = crowd.add_agent(&nav_mesh, &[1.0, 0.0, 5.0], &params)?;
        send(&nav_mesh, &mut crowd, idx, [9.0, 0.0, 5.0])?;

        let mut saw_offmesh = false;
        for _ in 0..60 {
            crowd.update(&nav_mesh, DT, None)?;
            let agent = crowd.agent(idx).expect("agent");
            if agent.state() == CrowdAgentState::OffMesh {
                saw_offmesh = true;
                assert!(agent.animation().active);
                assert_eq!(agent.animation().end_pos, [7.0, 0.0, 5.0]);
            }
        }

        assert!(saw_offmesh);
        let agent = crowd.agent(idx).expect("agent");
        assert_eq!(agent.state(), CrowdAgentState::Walking);
        let pos = agent.position();
        assert!(pos[0] > 8.5, "{pos:?}");
        Ok(())
    }
}
