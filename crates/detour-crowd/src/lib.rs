//! Multi-agent crowd simulation on detour navigation meshes
//!
//! Agents follow polygon corridors planned by a shared path queue and steer
//! locally: they avoid walls collected into a per agent boundary, keep apart
//! from neighbours found through a proximity grid and pick collision free
//! velocities by sampling.
//!
//! # Example
//!
//! ```rust,ignore
//! use detour_crowd::{Crowd, CrowdAgentParams, CrowdConfig};
//!
//! let mut crowd = Crowd::new(CrowdConfig::default())?;
//! let agent = crowd.add_agent(&nav_mesh, &start_pos, &CrowdAgentParams::default())?;
//! crowd.request_move_target(agent, target_ref, &target_pos)?;
//!
//! // Once per frame; the mesh may change between frames.
//! crowd.update(&nav_mesh, dt, None)?;
//! let pos = crowd.agent(agent).map(|a| a.position());
//! ```
//!
//! # Architecture
//!
//! - [`Crowd`]: agent table and the per frame update
//! - [`PathCorridor`]: path state of one agent
//! - [`LocalBoundary`]: walls near one agent
//! - [`ObstacleAvoidanceQuery`]: velocity sampling
//! - [`ProximityGrid`]: neighbour lookups

pub mod crowd;
pub mod local_boundary;
pub mod obstacle_avoidance;
pub mod path_corridor;
pub mod proximity_grid;

pub use crowd::*;
pub use local_boundary::*;
pub use obstacle_avoidance::*;
pub use path_corridor::*;
pub use proximity_grid::*;

#[cfg(test)]
mod crowd_scenario_tests;
