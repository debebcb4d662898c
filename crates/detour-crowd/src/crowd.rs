//! Crowd manager
//!
//! The crowd owns a fixed table of agents and advances all of them with one
//! [`Crowd::update`] call per frame. Paths are planned asynchronously through
//! a [`PathQueue`]; each agent follows its [`PathCorridor`], avoids walls from
//! its [`LocalBoundary`] and other agents found through the
//! [`ProximityGrid`], and picks a collision free velocity with the
//! [`ObstacleAvoidanceQuery`].
//!
//! The crowd does not hold on to the navigation mesh. Every call that needs
//! the mesh takes it as a parameter, so tiles may be added or removed between
//! frames; agents whose polygons disappear replan or become invalid on the
//! next update.

use glam::Vec3;
use log::{debug, trace, warn};

use detour::{
    NavMesh, NavMeshQuery, PathQueue, PathQueueRef, PathQueueStatus, PolyRef, QueryBuffers, QueryFilter,
    StraightPathFlags, StraightPathPoint,
};
use detour_common::{sqr, tri_area_2d, Error, Result};

use crate::local_boundary::LocalBoundary;
use crate::obstacle_avoidance::{ObstacleAvoidanceDebugData, ObstacleAvoidanceParams, ObstacleAvoidanceQuery};
use crate::path_corridor::PathCorridor;
use crate::proximity_grid::ProximityGrid;

/// Neighbours an agent takes into account for steering
pub const MAX_NEIGHBOURS: usize = 6;

/// Corners an agent looks ahead on its path. The last one is only used to
/// detect off-mesh connections and the end of the path.
pub const MAX_CORNERS: usize = 4;

/// Obstacle avoidance parameter sets
pub const MAX_OBSTAVOIDANCE_PARAMS: usize = 8;

/// Query filter types
pub const MAX_QUERY_FILTER_TYPE: usize = 16;

/// Circles and segments fed to the avoidance query per agent
const MAX_AVOIDANCE_CIRCLES: usize = MAX_NEIGHBOURS;
const MAX_AVOIDANCE_SEGMENTS: usize = 8;

/// Agents considered per grid query, before the height and range checks
const MAX_GRID_NEIGHBOURS: usize = 32;

/// Seconds between topology optimizations of one agent
const OPT_TIME_THR: f32 = 0.5;
/// Agents optimized per update
const OPT_MAX_AGENTS: usize = 1;

/// Seconds before a corridor that ends short of the target is replanned
const TARGET_REPLAN_DELAY: f32 = 1.0;
/// Corridor polygons validated every frame
const CHECK_LOOKAHEAD: usize = 10;
/// Agents submitted to the path queue per update
const PATH_MAX_AGENTS: usize = 8;

/// Iterations of the quick search run when a move is requested
const QUICK_SEARCH_ITERS: u32 = 20;
const QUICK_SEARCH_MAX_RES: usize = 32;

const COLLISION_RESOLVE_FACTOR: f32 = 0.7;
const COLLISION_ITERATIONS: usize = 4;

/// Capacities of a crowd, fixed at construction.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct CrowdConfig {
    pub max_agents: usize,
    /// Largest radius an agent may have; sizes the grid cells and the
    /// placement extents.
    pub max_agent_radius: f32,
    /// Capacity of every corridor and of path queue results
    pub max_path_result: usize,
    pub path_queue_nodes: usize,
    pub path_queue_capacity: usize,
    /// A* iterations the path queue may spend per update
    pub max_iters_per_update: u32,
    /// Node pool of the query used for quick searches and local queries
    pub max_common_nodes: usize,
    /// Local boundaries rebuilt per update
    pub boundary_updates_per_frame: usize,
}

impl Default for CrowdConfig {
    fn default() -> Self {
        Self {
            max_agents: 128,
            max_agent_radius: 0.6,
            max_path_result: 256,
            path_queue_nodes: 4096,
            path_queue_capacity: 8,
            max_iters_per_update: 100,
            max_common_nodes: 512,
            boundary_updates_per_frame: 32,
        }
    }
}

bitflags::bitflags! {
    /// Steering features enabled per agent.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
    pub struct UpdateFlags: u8 {
        const ANTICIPATE_TURNS = 1;
        const OBSTACLE_AVOIDANCE = 2;
        const SEPARATION = 4;
        /// Shortcut the corridor towards visible corners
        const OPTIMIZE_VIS = 8;
        /// Periodically replan the start of the corridor
        const OPTIMIZE_TOPO = 16;
    }
}

/// Per agent configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct CrowdAgentParams {
    pub radius: f32,
    pub height: f32,
    pub max_acceleration: f32,
    pub max_speed: f32,
    /// Range within which walls and other agents are considered
    pub collision_query_range: f32,
    /// Range of the visibility optimization
    pub path_optimization_range: f32,
    pub separation_weight: f32,
    pub update_flags: UpdateFlags,
    /// Index into the obstacle avoidance parameter sets
    pub obstacle_avoidance_type: u8,
    /// Index into the query filters
    pub query_filter_type: u8,
    pub user_data: u64,
}

impl Default for CrowdAgentParams {
    fn default() -> Self {
        let radius = 0.6;
        Self {
            radius,
            height: 2.0,
            max_acceleration: 8.0,
            max_speed: 3.5,
            collision_query_range: radius * 12.0,
            path_optimization_range: radius * 30.0,
            separation_weight: 2.0,
            update_flags: UpdateFlags::ANTICIPATE_TURNS
                | UpdateFlags::OBSTACLE_AVOIDANCE
                | UpdateFlags::OPTIMIZE_VIS
                | UpdateFlags::OPTIMIZE_TOPO,
            obstacle_avoidance_type: 0,
            query_filter_type: 0,
            user_data: 0,
        }
    }
}

/// Kind of surface the agent is moving on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CrowdAgentState {
    /// Not placed on the mesh
    #[default]
    Invalid,
    Walking,
    /// Traversing an off-mesh connection
    OffMesh,
}

/// Progress of the agent's move request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MoveRequestState {
    #[default]
    None,
    Failed,
    Valid,
    /// A quick search runs on the next update
    Requesting,
    WaitingForQueue,
    WaitingForPath,
    /// Steered by a requested velocity instead of a path
    Velocity,
}

impl MoveRequestState {
    fn follows_path(self) -> bool {
        !matches!(self, MoveRequestState::None | MoveRequestState::Velocity)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CrowdNeighbour {
    /// Agent index
    pub idx: usize,
    /// Squared distance on the XZ plane
    pub dist: f32,
}

/// Motion over an off-mesh connection.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CrowdAgentAnimation {
    pub active: bool,
    pub init_pos: [f32; 3],
    pub start_pos: [f32; 3],
    pub end_pos: [f32; 3],
    pub poly_ref: PolyRef,
    pub t: f32,
    pub tmax: f32,
}

#[derive(Debug, Clone)]
pub struct CrowdAgent {
    active: bool,
    state: CrowdAgentState,
    /// The corridor ends short of the target
    partial: bool,
    corridor: PathCorridor,
    boundary: LocalBoundary,
    topology_opt_time: f32,
    neis: [CrowdNeighbour; MAX_NEIGHBOURS],
    nneis: usize,
    desired_speed: f32,

    npos: Vec3,
    disp: Vec3,
    dvel: Vec3,
    nvel: Vec3,
    vel: Vec3,

    params: CrowdAgentParams,

    corners: [StraightPathPoint; MAX_CORNERS],
    ncorners: usize,

    target_state: MoveRequestState,
    target_ref: PolyRef,
    /// Target position, or the velocity for [`MoveRequestState::Velocity`]
    target_pos: [f32; 3],
    target_pathq_ref: PathQueueRef,
    target_replan: bool,
    target_replan_time: f32,

    anim: CrowdAgentAnimation,
}

impl CrowdAgent {
    fn new(max_path: usize) -> Result<Self> {
        Ok(Self {
            active: false,
            state: CrowdAgentState::Invalid,
            partial: false,
            corridor: PathCorridor::new(max_path)?,
            boundary: LocalBoundary::new(),
            topology_opt_time: 0.0,
            neis: [CrowdNeighbour::default(); MAX_NEIGHBOURS],
            nneis: 0,
            desired_speed: 0.0,
            npos: Vec3::ZERO,
            disp: Vec3::ZERO,
            dvel: Vec3::ZERO,
            nvel: Vec3::ZERO,
            vel: Vec3::ZERO,
            params: CrowdAgentParams::default(),
            corners: [StraightPathPoint::default(); MAX_CORNERS],
            ncorners: 0,
            target_state: MoveRequestState::None,
            target_ref: PolyRef::NULL,
            target_pos: [0.0; 3],
            target_pathq_ref: PathQueueRef::INVALID,
            target_replan: false,
            target_replan_time: 0.0,
            anim: CrowdAgentAnimation::default(),
        })
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn state(&self) -> CrowdAgentState {
        self.state
    }

    pub fn target_state(&self) -> MoveRequestState {
        self.target_state
    }

    pub fn params(&self) -> &CrowdAgentParams {
        &self.params
    }

    pub fn position(&self) -> [f32; 3] {
        self.npos.to_array()
    }

    pub fn velocity(&self) -> [f32; 3] {
        self.vel.to_array()
    }

    pub fn desired_velocity(&self) -> [f32; 3] {
        self.dvel.to_array()
    }

    /// Velocity chosen by the avoidance before acceleration limits.
    pub fn new_velocity(&self) -> [f32; 3] {
        self.nvel.to_array()
    }

    pub fn desired_speed(&self) -> f32 {
        self.desired_speed
    }

    pub fn is_partial(&self) -> bool {
        self.partial
    }

    pub fn target_ref(&self) -> PolyRef {
        self.target_ref
    }

    pub fn target_pos(&self) -> [f32; 3] {
        self.target_pos
    }

    pub fn corridor(&self) -> &PathCorridor {
        &self.corridor
    }

    pub fn boundary(&self) -> &LocalBoundary {
        &self.boundary
    }

    /// Neighbours, nearest first.
    pub fn neighbours(&self) -> &[CrowdNeighbour] {
        &self.neis[..self.nneis]
    }

    pub fn corners(&self) -> &[StraightPathPoint] {
        &self.corners[..self.ncorners]
    }

    pub fn animation(&self) -> &CrowdAgentAnimation {
        &self.anim
    }

    fn follows_path(&self) -> bool {
        self.target_state.follows_path()
    }

    /// Heads for the first corner.
    fn calc_straight_steer_direction(&self) -> Vec3 {
        if self.ncorners == 0 {
            return Vec3::ZERO;
        }
        let mut dir = Vec3::from_array(self.corners[0].pos) - self.npos;
        dir.y = 0.0;
        dir.normalize_or_zero()
    }

    /// Heads for the first corner, bending towards the second one to round
    /// off the turn.
    fn calc_smooth_steer_direction(&self) -> Vec3 {
        if self.ncorners == 0 {
            return Vec3::ZERO;
        }
        let ip1 = 1.min(self.ncorners - 1);
        let mut dir0 = Vec3::from_array(self.corners[0].pos) - self.npos;
        let mut dir1 = Vec3::from_array(self.corners[ip1].pos) - self.npos;
        dir0.y = 0.0;
        dir1.y = 0.0;

        let len0 = dir0.length();
        let len1 = dir1.length();
        if len1 > 0.001 {
            dir1 /= len1;
        }

        let dir = Vec3::new(dir0.x - dir1.x * len0 * 0.5, 0.0, dir0.z - dir1.z * len0 * 0.5);
        dir.normalize_or_zero()
    }

    /// Distance to the end of the path, capped at `range`.
    fn distance_to_goal(&self, range: f32) -> f32 {
        if self.ncorners == 0 {
            return range;
        }
        let last = &self.corners[self.ncorners - 1];
        if last.flags.contains(StraightPathFlags::END) {
            let d = Vec3::from_array(last.pos) - self.npos;
            return (d.x * d.x + d.z * d.z).sqrt().min(range);
        }
        range
    }

    /// The last corner is an off-mesh connection within `radius`.
    fn over_offmesh_connection(&self, radius: f32) -> bool {
        if self.ncorners == 0 {
            return false;
        }
        let last = &self.corners[self.ncorners - 1];
        if !last.flags.contains(StraightPathFlags::OFFMESH_CONNECTION) {
            return false;
        }
        let d = Vec3::from_array(last.pos) - self.npos;
        d.x * d.x + d.z * d.z < sqr(radius)
    }

    /// Steers the velocity towards `nvel` within the acceleration limit and
    /// moves the position.
    fn integrate(&mut self, dt: f32) {
        let max_delta = self.params.max_acceleration * dt;
        let mut dv = self.nvel - self.vel;
        let ds = dv.length();
        if ds > max_delta {
            dv *= max_delta / ds;
        }
        self.vel += dv;

        if self.vel.length() > 0.0001 {
            self.npos += self.vel * dt;
        } else {
            self.vel = Vec3::ZERO;
        }
    }
}

/// Debug capture of one agent during an update.
#[derive(Debug, Clone, Default)]
pub struct CrowdAgentDebugInfo {
    /// Agent to capture
    pub idx: Option<usize>,
    /// Segment of the last visibility optimization
    pub opt_start: [f32; 3],
    pub opt_end: [f32; 3],
    /// Avoidance samples of the agent
    pub vod: Option<ObstacleAvoidanceDebugData>,
}

/// Multi agent steering on a navigation mesh.
#[derive(Debug)]
pub struct Crowd {
    config: CrowdConfig,
    agents: Vec<CrowdAgent>,
    path_queue: PathQueue,
    obstacle_query_params: [ObstacleAvoidanceParams; MAX_OBSTAVOIDANCE_PARAMS],
    obstacle_query: ObstacleAvoidanceQuery,
    grid: ProximityGrid,
    /// Shared by quick searches and local queries; lent to a query per update
    query_buffers: Option<QueryBuffers>,
    filters: [QueryFilter; MAX_QUERY_FILTER_TYPE],
    agent_placement_half_extents: [f32; 3],
    path_result: Vec<PolyRef>,
    boundary_cursor: usize,
    velocity_sample_count: usize,
}

impl Crowd {
    pub fn new(config: CrowdConfig) -> Result<Self> {
        if config.max_agents == 0 {
            return Err(Error::invalid_param("crowd needs room for at least one agent"));
        }
        if !(config.max_agent_radius.is_finite() && config.max_agent_radius > 0.0) {
            return Err(Error::invalid_param(format!(
                "invalid max agent radius {}",
                config.max_agent_radius
            )));
        }
        if config.max_path_result == 0 {
            return Err(Error::invalid_param("max path result must be positive"));
        }

        let r = config.max_agent_radius;
        let agents = (0..config.max_agents)
            .map(|_| CrowdAgent::new(config.max_path_result))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            path_queue: PathQueue::new(config.max_path_result, config.path_queue_nodes, config.path_queue_capacity)?,
            obstacle_query_params: [ObstacleAvoidanceParams::default(); MAX_OBSTAVOIDANCE_PARAMS],
            obstacle_query: ObstacleAvoidanceQuery::new(MAX_AVOIDANCE_CIRCLES, MAX_AVOIDANCE_SEGMENTS)?,
            grid: ProximityGrid::new(config.max_agents * 4, r * 3.0)?,
            query_buffers: Some(QueryBuffers::new(config.max_common_nodes)?),
            filters: std::array::from_fn(|_| QueryFilter::default()),
            agent_placement_half_extents: [r * 2.0, r * 1.5, r * 2.0],
            path_result: vec![PolyRef::NULL; config.max_path_result],
            boundary_cursor: 0,
            velocity_sample_count: 0,
            agents,
            config,
        })
    }

    pub fn config(&self) -> &CrowdConfig {
        &self.config
    }

    /// Search extents used to place agents and targets on the mesh.
    pub fn query_half_extents(&self) -> [f32; 3] {
        self.agent_placement_half_extents
    }

    /// Avoidance samples taken during the last update.
    pub fn velocity_sample_count(&self) -> usize {
        self.velocity_sample_count
    }

    pub fn filter(&self, i: usize) -> Option<&QueryFilter> {
        self.filters.get(i)
    }

    pub fn filter_mut(&mut self, i: usize) -> Option<&mut QueryFilter> {
        self.filters.get_mut(i)
    }

    pub fn set_obstacle_avoidance_params(&mut self, idx: usize, params: ObstacleAvoidanceParams) -> Result<()> {
        let slot = self
            .obstacle_query_params
            .get_mut(idx)
            .ok_or_else(|| Error::invalid_param(format!("avoidance parameter set {idx} out of range")))?;
        *slot = params;
        Ok(())
    }

    pub fn obstacle_avoidance_params(&self, idx: usize) -> Option<&ObstacleAvoidanceParams> {
        self.obstacle_query_params.get(idx)
    }

    pub fn agent(&self, idx: usize) -> Option<&CrowdAgent> {
        self.agents.get(idx)
    }

    /// Capacity of the agent table.
    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    /// Indices of the agents in use.
    pub fn active_agents(&self) -> impl Iterator<Item = usize> + '_ {
        self.agents.iter().enumerate().filter(|(_, ag)| ag.active).map(|(i, _)| i)
    }

    pub fn path_queue(&self) -> &PathQueue {
        &self.path_queue
    }

    fn active_agent_mut(&mut self, idx: usize) -> Result<&mut CrowdAgent> {
        match self.agents.get_mut(idx) {
            Some(ag) if ag.active => Ok(ag),
            _ => Err(Error::invalid_param(format!("agent {idx} is not active"))),
        }
    }

    fn validate_params(&self, params: &CrowdAgentParams) -> Result<()> {
        if params.query_filter_type as usize >= MAX_QUERY_FILTER_TYPE {
            return Err(Error::invalid_param(format!(
                "query filter type {} out of range",
                params.query_filter_type
            )));
        }
        if params.obstacle_avoidance_type as usize >= MAX_OBSTAVOIDANCE_PARAMS {
            return Err(Error::invalid_param(format!(
                "obstacle avoidance type {} out of range",
                params.obstacle_avoidance_type
            )));
        }
        if !(params.radius > 0.0 && params.max_speed > 0.0 && params.max_acceleration >= 0.0) {
            return Err(Error::invalid_param("agent radius, speed and acceleration must be positive"));
        }
        // The proximity grid is sized for agents up to this radius.
        if params.radius > self.config.max_agent_radius {
            return Err(Error::invalid_param(format!(
                "agent radius {} exceeds the crowd's max agent radius {}",
                params.radius, self.config.max_agent_radius
            )));
        }
        if !(params.collision_query_range > 0.0 && params.path_optimization_range >= 0.0) {
            return Err(Error::invalid_param("agent query ranges must be positive"));
        }
        Ok(())
    }

    /// Lends the shared buffers to a query on `nav_mesh`.
    fn take_query<'a>(&mut self, nav_mesh: &'a NavMesh) -> Result<NavMeshQuery<'a>> {
        let buffers = match self.query_buffers.take() {
            Some(buffers) => buffers,
            None => QueryBuffers::new(self.config.max_common_nodes)?,
        };
        Ok(NavMeshQuery::with_buffers(nav_mesh, buffers))
    }

    fn return_query(&mut self, query: NavMeshQuery<'_>) {
        self.query_buffers = Some(query.into_buffers());
    }

    /// Adds an agent at the mesh position nearest to `pos`.
    ///
    /// The agent starts `Invalid` when no polygon is in range. Fails with
    /// [`Error::OutOfMemory`] when every slot is taken.
    pub fn add_agent(&mut self, nav_mesh: &NavMesh, pos: &[f32; 3], params: &CrowdAgentParams) -> Result<usize> {
        self.validate_params(params)?;
        let Some(idx) = self.agents.iter().position(|ag| !ag.active) else {
            return Err(Error::OutOfMemory(format!("crowd is full ({} agents)", self.agents.len()).into()));
        };

        let query = self.take_query(nav_mesh)?;
        let filter = &self.filters[params.query_filter_type as usize];
        let nearest = query.find_nearest_poly(pos, &self.agent_placement_half_extents, filter);
        self.return_query(query);
        let (poly_ref, nearest) = match nearest {
            Ok((r, p)) if r.is_valid() => (r, p),
            _ => (PolyRef::NULL, *pos),
        };

        let ag = &mut self.agents[idx];
        ag.params = *params;
        ag.corridor.reset(poly_ref, nearest);
        ag.boundary.reset();
        ag.partial = false;
        ag.topology_opt_time = 0.0;
        ag.target_replan_time = 0.0;
        ag.nneis = 0;
        ag.ncorners = 0;
        ag.dvel = Vec3::ZERO;
        ag.nvel = Vec3::ZERO;
        ag.vel = Vec3::ZERO;
        ag.disp = Vec3::ZERO;
        ag.npos = Vec3::from_array(nearest);
        ag.desired_speed = 0.0;
        ag.state = if poly_ref.is_valid() {
            CrowdAgentState::Walking
        } else {
            CrowdAgentState::Invalid
        };
        ag.target_state = MoveRequestState::None;
        ag.target_ref = PolyRef::NULL;
        ag.target_pathq_ref = PathQueueRef::INVALID;
        ag.anim = CrowdAgentAnimation::default();
        ag.active = true;

        debug!("agent {idx} added at {nearest:?} on {poly_ref} ({:?})", ag.state);
        Ok(idx)
    }

    /// Frees the slot and cancels the agent's pending path request.
    pub fn remove_agent(&mut self, idx: usize) -> Result<()> {
        let ag = self.active_agent_mut(idx)?;
        let handle = ag.target_pathq_ref;
        ag.active = false;
        ag.state = CrowdAgentState::Invalid;
        ag.target_state = MoveRequestState::None;
        ag.target_pathq_ref = PathQueueRef::INVALID;
        ag.anim.active = false;
        if !handle.is_invalid() {
            self.path_queue.cancel(handle);
        }
        debug!("agent {idx} removed");
        Ok(())
    }

    pub fn update_agent_parameters(&mut self, idx: usize, params: &CrowdAgentParams) -> Result<()> {
        self.validate_params(params)?;
        self.active_agent_mut(idx)?.params = *params;
        Ok(())
    }

    /// Moves an agent to the mesh position nearest to `pos`, dropping its
    /// velocity. A path target is kept and replanned from the new position.
    pub fn teleport_agent(&mut self, nav_mesh: &NavMesh, idx: usize, pos: &[f32; 3]) -> Result<()> {
        let filter_type = self.active_agent_mut(idx)?.params.query_filter_type as usize;
        let query = self.take_query(nav_mesh)?;
        let nearest = query.find_nearest_poly(pos, &self.agent_placement_half_extents, &self.filters[filter_type]);
        self.return_query(query);
        let (poly_ref, nearest) = match nearest {
            Ok((r, p)) if r.is_valid() => (r, p),
            _ => (PolyRef::NULL, *pos),
        };

        let ag = &mut self.agents[idx];
        ag.corridor.reset(poly_ref, nearest);
        ag.boundary.reset();
        ag.partial = false;
        ag.npos = Vec3::from_array(nearest);
        ag.vel = Vec3::ZERO;
        ag.dvel = Vec3::ZERO;
        ag.nvel = Vec3::ZERO;
        ag.ncorners = 0;
        ag.nneis = 0;
        ag.anim.active = false;
        ag.state = if poly_ref.is_valid() {
            CrowdAgentState::Walking
        } else {
            CrowdAgentState::Invalid
        };
        debug!("agent {idx} teleported to {nearest:?} ({:?})", ag.state);

        if ag.follows_path() && ag.target_state != MoveRequestState::Failed {
            let (target_ref, target_pos) = (ag.target_ref, ag.target_pos);
            self.request_move_target_replan(idx, target_ref, target_pos);
        }
        Ok(())
    }

    /// Starts moving an agent towards `pos` on polygon `target_ref`.
    pub fn request_move_target(&mut self, idx: usize, target_ref: PolyRef, pos: &[f32; 3]) -> Result<()> {
        if target_ref.is_null() {
            return Err(Error::invalid_param("move target polygon is null"));
        }
        let ag = self.active_agent_mut(idx)?;
        let old = std::mem::replace(&mut ag.target_pathq_ref, PathQueueRef::INVALID);
        ag.target_ref = target_ref;
        ag.target_pos = *pos;
        ag.target_replan = false;
        ag.target_state = MoveRequestState::Requesting;
        if !old.is_invalid() {
            self.path_queue.cancel(old);
        }
        debug!("agent {idx} move request to {pos:?} on {target_ref}");
        Ok(())
    }

    /// Replans towards the current target, keeping the corridor as a hint.
    fn request_move_target_replan(&mut self, idx: usize, target_ref: PolyRef, pos: [f32; 3]) {
        let ag = &mut self.agents[idx];
        let old = std::mem::replace(&mut ag.target_pathq_ref, PathQueueRef::INVALID);
        ag.target_ref = target_ref;
        ag.target_pos = pos;
        ag.target_replan = true;
        ag.target_state = if target_ref.is_valid() {
            MoveRequestState::Requesting
        } else {
            MoveRequestState::Failed
        };
        if !old.is_invalid() {
            self.path_queue.cancel(old);
        }
        trace!("agent {idx} replans towards {target_ref}");
    }

    /// Steers an agent with a fixed velocity instead of a path.
    pub fn request_move_velocity(&mut self, idx: usize, vel: &[f32; 3]) -> Result<()> {
        let ag = self.active_agent_mut(idx)?;
        let old = std::mem::replace(&mut ag.target_pathq_ref, PathQueueRef::INVALID);
        ag.target_ref = PolyRef::NULL;
        ag.target_pos = *vel;
        ag.target_replan = false;
        ag.target_state = MoveRequestState::Velocity;
        if !old.is_invalid() {
            self.path_queue.cancel(old);
        }
        Ok(())
    }

    /// Stops following the current target or velocity.
    pub fn reset_move_target(&mut self, idx: usize) -> Result<()> {
        let ag = self.active_agent_mut(idx)?;
        let old = std::mem::replace(&mut ag.target_pathq_ref, PathQueueRef::INVALID);
        ag.target_ref = PolyRef::NULL;
        ag.target_pos = [0.0; 3];
        ag.dvel = Vec3::ZERO;
        ag.target_replan = false;
        ag.target_state = MoveRequestState::None;
        if !old.is_invalid() {
            self.path_queue.cancel(old);
        }
        Ok(())
    }

    /// Advances the simulation by `dt` seconds.
    ///
    /// Per agent failures are logged and degrade that agent; only running out
    /// of memory for the shared query fails the whole update.
    pub fn update(
        &mut self,
        nav_mesh: &NavMesh,
        dt: f32,
        mut debug: Option<&mut CrowdAgentDebugInfo>,
    ) -> Result<()> {
        self.velocity_sample_count = 0;
        let debug_idx = debug.as_ref().and_then(|d| d.idx);

        let mut query = self.take_query(nav_mesh)?;

        self.check_path_validity(&mut query, dt);
        self.rebuild_grid();
        self.update_move_requests(&mut query, nav_mesh);
        self.update_topology_optimization(&mut query, dt);
        self.update_boundaries_and_neighbours(&mut query);
        self.find_corners(&query, debug_idx, debug.as_deref_mut());
        self.trigger_offmesh_connections(&query);
        self.calc_desired_velocities();
        self.plan_velocities(debug_idx, debug.as_deref_mut());

        for ag in self.agents.iter_mut().filter(|ag| ag.active && ag.state == CrowdAgentState::Walking) {
            ag.integrate(dt);
        }

        self.resolve_collisions();
        self.move_agents(&mut query);
        self.return_query(query);

        self.update_offmesh_animations(dt);
        Ok(())
    }

    fn check_path_validity(&mut self, query: &mut NavMeshQuery<'_>, dt: f32) {
        for idx in 0..self.agents.len() {
            let ag = &mut self.agents[idx];
            if !ag.active || ag.state != CrowdAgentState::Walking {
                continue;
            }
            ag.target_replan_time += dt;
            let filter = &self.filters[ag.params.query_filter_type as usize];
            let mut replan = false;

            let mut agent_pos = ag.npos.to_array();
            let mut agent_ref = ag.corridor.first_poly();
            if !query.is_valid_poly_ref(agent_ref, filter) {
                // The polygon under the agent is gone; look for a new one.
                let found = query.find_nearest_poly(&agent_pos, &self.agent_placement_half_extents, filter);
                match found {
                    Ok((r, nearest)) if r.is_valid() => {
                        agent_ref = r;
                        agent_pos = nearest;
                    }
                    _ => {
                        warn!("agent {idx} lost its polygon at {agent_pos:?}");
                        ag.corridor.reset(PolyRef::NULL, agent_pos);
                        ag.partial = false;
                        ag.boundary.reset();
                        ag.state = CrowdAgentState::Invalid;
                        continue;
                    }
                }

                // Keep the rest of the corridor as a hint for the replan.
                ag.corridor.fix_path_start(agent_ref, agent_pos);
                ag.boundary.reset();
                ag.npos = Vec3::from_array(agent_pos);
                replan = true;
            }

            if !ag.follows_path() {
                continue;
            }

            if ag.target_state != MoveRequestState::Failed && !query.is_valid_poly_ref(ag.target_ref, filter) {
                let found = query.find_nearest_poly(&ag.target_pos, &self.agent_placement_half_extents, filter);
                match found {
                    Ok((r, nearest)) if r.is_valid() => {
                        ag.target_ref = r;
                        ag.target_pos = nearest;
                    }
                    _ => ag.target_ref = PolyRef::NULL,
                }
                replan = true;
            }

            if ag.target_ref.is_null() {
                warn!("agent {idx} lost its target polygon");
                ag.corridor.reset(agent_ref, agent_pos);
                ag.partial = false;
                ag.target_state = MoveRequestState::None;
            }

            if !ag.corridor.is_valid(CHECK_LOOKAHEAD, query, filter) {
                trace!("agent {idx} corridor became invalid");
                replan = true;
            }

            // The corridor ends early; try to get closer to the target.
            if ag.target_state == MoveRequestState::Valid
                && ag.target_replan_time > TARGET_REPLAN_DELAY
                && ag.corridor.path_count() < CHECK_LOOKAHEAD
                && ag.corridor.last_poly() != ag.target_ref
            {
                replan = true;
            }

            if replan && ag.target_state != MoveRequestState::None {
                let (target_ref, target_pos) = (ag.target_ref, ag.target_pos);
                self.request_move_target_replan(idx, target_ref, target_pos);
            }
        }
    }

    fn update_move_requests(&mut self, query: &mut NavMeshQuery<'_>, nav_mesh: &NavMesh) {
        let mut queue = [(0usize, 0.0f32); PATH_MAX_AGENTS];
        let mut nqueue = 0;

        for idx in 0..self.agents.len() {
            let ag = &mut self.agents[idx];
            if !ag.active || ag.state == CrowdAgentState::Invalid || !ag.follows_path() {
                continue;
            }
            let filter = &self.filters[ag.params.query_filter_type as usize];

            if ag.target_state == MoveRequestState::Requesting {
                let pos = ag.npos.to_array();
                let mut req_path = [PolyRef::NULL; QUICK_SEARCH_MAX_RES];
                let existing = if ag.target_replan { Some(ag.corridor.path()) } else { None };
                let mut count = quick_search(
                    query,
                    ag.corridor.first_poly(),
                    ag.target_ref,
                    &pos,
                    &ag.target_pos,
                    filter,
                    existing,
                    &mut req_path,
                )
                .unwrap_or_else(|err| {
                    trace!("agent {idx} quick search failed: {err}");
                    0
                });

                let mut req_pos = ag.target_pos;
                if count > 0 && req_path[count - 1] != ag.target_ref {
                    // Partial path: aim for the closest point of the last polygon.
                    match query.closest_point_on_poly(req_path[count - 1], &ag.target_pos) {
                        Ok((p, _)) => req_pos = p,
                        Err(_) => count = 0,
                    }
                }
                if count == 0 {
                    req_pos = pos;
                    req_path[0] = ag.corridor.first_poly();
                    count = 1;
                }

                if let Err(err) = ag.corridor.set_corridor(req_pos, &req_path[..count]) {
                    warn!("agent {idx} could not set its corridor: {err}");
                }
                ag.boundary.reset();
                ag.partial = false;

                if req_path[count - 1] == ag.target_ref {
                    ag.target_state = MoveRequestState::Valid;
                    ag.target_replan_time = 0.0;
                } else {
                    // Longer or possibly unreachable: plan the rest in the queue.
                    ag.target_state = MoveRequestState::WaitingForQueue;
                }
            }

            if ag.target_state == MoveRequestState::WaitingForQueue {
                nqueue = push_by_priority(&mut queue, nqueue, idx, ag.target_replan_time);
            }
        }

        for &(idx, _) in &queue[..nqueue] {
            let ag = &mut self.agents[idx];
            let filter = &self.filters[ag.params.query_filter_type as usize];
            match self.path_queue.request(
                ag.corridor.last_poly(),
                ag.target_ref,
                ag.corridor.target(),
                &ag.target_pos,
                filter,
            ) {
                Ok(handle) => {
                    ag.target_pathq_ref = handle;
                    ag.target_state = MoveRequestState::WaitingForPath;
                }
                Err(err) => trace!("agent {idx} stays queued: {err}"),
            }
        }

        self.path_queue.update(nav_mesh, self.config.max_iters_per_update);

        for idx in 0..self.agents.len() {
            let ag = &mut self.agents[idx];
            if !ag.active || ag.target_state != MoveRequestState::WaitingForPath {
                continue;
            }

            match self.path_queue.get_request_status(ag.target_pathq_ref) {
                PathQueueStatus::InProgress => {}
                PathQueueStatus::Failed | PathQueueStatus::Invalid => {
                    warn!("agent {idx} path request failed");
                    self.path_queue.cancel(ag.target_pathq_ref);
                    ag.target_pathq_ref = PathQueueRef::INVALID;
                    ag.target_state = if ag.target_ref.is_valid() {
                        MoveRequestState::Requesting
                    } else {
                        MoveRequestState::Failed
                    };
                    ag.target_replan_time = 0.0;
                }
                PathQueueStatus::Ready => {
                    let handle = std::mem::replace(&mut ag.target_pathq_ref, PathQueueRef::INVALID);
                    let mut target_pos = ag.target_pos;
                    let mut nres = 0;
                    let mut valid = match self.path_queue.get_path_result(handle, &mut self.path_result) {
                        Ok(result) => {
                            nres = result.count;
                            ag.partial = result.is_partial();
                            nres > 0
                        }
                        Err(_) => false,
                    };

                    // The search started where the corridor ended when the
                    // request was made.
                    let path = ag.corridor.path();
                    let npath = path.len();
                    if valid && path[npath - 1] != self.path_result[0] {
                        valid = false;
                    }

                    if valid {
                        nres = splice_old_path(&mut self.path_result, nres, &path[..npath - 1]);

                        let last = self.path_result[nres - 1];
                        if last != ag.target_ref {
                            match query.closest_point_on_poly(last, &target_pos) {
                                Ok((p, _)) => target_pos = p,
                                Err(_) => valid = false,
                            }
                        }
                    }

                    if valid {
                        if let Err(err) = ag.corridor.set_corridor(target_pos, &self.path_result[..nres]) {
                            warn!("agent {idx} could not set its corridor: {err}");
                        }
                        ag.boundary.reset();
                        ag.target_state = MoveRequestState::Valid;
                    } else {
                        warn!("agent {idx} path result could not be merged");
                        ag.target_state = MoveRequestState::Failed;
                    }
                    ag.target_replan_time = 0.0;
                }
            }
        }
    }

    fn update_topology_optimization(&mut self, query: &mut NavMeshQuery<'_>, dt: f32) {
        let mut queue = [(0usize, 0.0f32); OPT_MAX_AGENTS];
        let mut nqueue = 0;

        for (idx, ag) in self.agents.iter_mut().enumerate() {
            if !ag.active
                || ag.state != CrowdAgentState::Walking
                || !ag.follows_path()
                || !ag.params.update_flags.contains(UpdateFlags::OPTIMIZE_TOPO)
            {
                continue;
            }
            ag.topology_opt_time += dt;
            if ag.topology_opt_time >= OPT_TIME_THR {
                nqueue = push_by_priority(&mut queue, nqueue, idx, ag.topology_opt_time);
            }
        }

        for &(idx, _) in &queue[..nqueue] {
            let ag = &mut self.agents[idx];
            let filter = &self.filters[ag.params.query_filter_type as usize];
            if let Err(err) = ag.corridor.optimize_path_topology(query, filter) {
                trace!("agent {idx} topology optimization failed: {err}");
            }
            ag.topology_opt_time = 0.0;
        }
    }

    fn rebuild_grid(&mut self) {
        self.grid.clear();
        for (idx, ag) in self.agents.iter().enumerate().filter(|(_, ag)| ag.active) {
            let p = ag.npos;
            let r = ag.params.radius;
            if !self.grid.add_item(idx, p.x - r, p.z - r, p.x + r, p.z + r) {
                warn!("proximity grid is full, agent {idx} is missing from it");
            }
        }
    }

    fn update_boundaries_and_neighbours(&mut self, query: &mut NavMeshQuery<'_>) {
        let n = self.agents.len();
        let mut budget = self.config.boundary_updates_per_frame;
        let start = self.boundary_cursor % n;

        for k in 0..n {
            let idx = (start + k) % n;
            let ag = &mut self.agents[idx];
            if !ag.active || ag.state != CrowdAgentState::Walking {
                continue;
            }
            let filter = &self.filters[ag.params.query_filter_type as usize];
            let pos = ag.npos.to_array();
            let range = ag.params.collision_query_range;

            if budget > 0
                && (ag.boundary.needs_update(&pos, range * 0.25) || !ag.boundary.is_valid(query, filter))
            {
                budget -= 1;
                self.boundary_cursor = idx + 1;
                if let Err(err) = ag.boundary.update(ag.corridor.first_poly(), &pos, range, query, filter) {
                    trace!("agent {idx} boundary update failed: {err}");
                }
            }
        }

        for idx in 0..n {
            let ag = &self.agents[idx];
            if !ag.active || ag.state != CrowdAgentState::Walking {
                continue;
            }
            let (neis, nneis) = get_neighbours(
                idx,
                ag.npos,
                ag.params.height,
                ag.params.collision_query_range,
                &self.agents,
                &self.grid,
            );
            let ag = &mut self.agents[idx];
            ag.neis = neis;
            ag.nneis = nneis;
        }
    }

    fn find_corners(
        &mut self,
        query: &NavMeshQuery<'_>,
        debug_idx: Option<usize>,
        mut debug: Option<&mut CrowdAgentDebugInfo>,
    ) {
        for (idx, ag) in self.agents.iter_mut().enumerate() {
            if !ag.active || ag.state != CrowdAgentState::Walking || !ag.follows_path() {
                continue;
            }
            let filter = &self.filters[ag.params.query_filter_type as usize];

            ag.ncorners = ag.corridor.find_corners(&mut ag.corners, query).unwrap_or_else(|err| {
                trace!("agent {idx} corners failed: {err}");
                0
            });

            let capture = debug.as_deref_mut().filter(|_| debug_idx == Some(idx));
            if ag.params.update_flags.contains(UpdateFlags::OPTIMIZE_VIS) && ag.ncorners > 0 {
                // Shortcut to the corner after the next one when it is visible.
                let target = ag.corners[1.min(ag.ncorners - 1)].pos;
                if let Err(err) =
                    ag.corridor
                        .optimize_path_visibility(&target, ag.params.path_optimization_range, query, filter)
                {
                    trace!("agent {idx} visibility optimization failed: {err}");
                }
                if let Some(d) = capture {
                    d.opt_start = *ag.corridor.pos();
                    d.opt_end = target;
                }
            } else if let Some(d) = capture {
                d.opt_start = [0.0; 3];
                d.opt_end = [0.0; 3];
            }
        }
    }

    fn trigger_offmesh_connections(&mut self, query: &NavMeshQuery<'_>) {
        for (idx, ag) in self.agents.iter_mut().enumerate() {
            if !ag.active || ag.state != CrowdAgentState::Walking || !ag.follows_path() {
                continue;
            }
            if !ag.over_offmesh_connection(ag.params.radius * 2.25) {
                continue;
            }

            let con = ag.corners[ag.ncorners - 1].poly_ref;
            match ag.corridor.move_over_offmesh_connection(con, query) {
                Ok((_, start_pos, end_pos)) => {
                    let d = Vec3::from_array(end_pos) - Vec3::from_array(start_pos);
                    ag.anim = CrowdAgentAnimation {
                        active: true,
                        init_pos: ag.npos.to_array(),
                        start_pos,
                        end_pos,
                        poly_ref: con,
                        t: 0.0,
                        tmax: ((d.x * d.x + d.z * d.z).sqrt() / ag.params.max_speed) * 0.5,
                    };
                    ag.state = CrowdAgentState::OffMesh;
                    ag.ncorners = 0;
                    ag.nneis = 0;
                    debug!("agent {idx} enters off-mesh connection {con}");
                }
                // A blocked connection fails validation and gets replanned.
                Err(err) => trace!("agent {idx} could not take connection {con}: {err}"),
            }
        }
    }

    fn calc_desired_velocities(&mut self) {
        for idx in 0..self.agents.len() {
            let ag = &self.agents[idx];
            if !ag.active || ag.state != CrowdAgentState::Walking || ag.target_state == MoveRequestState::None {
                continue;
            }

            let mut dvel;
            let desired_speed;
            if ag.target_state == MoveRequestState::Velocity {
                dvel = Vec3::from_array(ag.target_pos);
                desired_speed = dvel.length();
            } else {
                dvel = if ag.params.update_flags.contains(UpdateFlags::ANTICIPATE_TURNS) {
                    ag.calc_smooth_steer_direction()
                } else {
                    ag.calc_straight_steer_direction()
                };
                // Slow down close to the end of the path.
                let slow_down_radius = ag.params.radius * 2.0;
                let speed_scale = ag.distance_to_goal(slow_down_radius) / slow_down_radius;
                desired_speed = ag.params.max_speed;
                dvel *= desired_speed * speed_scale;
            }

            if ag.params.update_flags.contains(UpdateFlags::SEPARATION) {
                let separation_dist = ag.params.collision_query_range;
                let inv_separation_dist = 1.0 / separation_dist;
                let mut w = 0.0;
                let mut disp = Vec3::ZERO;

                for nei in ag.neighbours() {
                    let other = &self.agents[nei.idx];
                    let mut diff = ag.npos - other.npos;
                    diff.y = 0.0;
                    let dist_sqr = diff.length_squared();
                    if dist_sqr < 0.00001 || dist_sqr > sqr(separation_dist) {
                        continue;
                    }
                    let dist = dist_sqr.sqrt();
                    let weight = ag.params.separation_weight * (1.0 - sqr(dist * inv_separation_dist));
                    disp += diff * (weight / dist);
                    w += 1.0;
                }

                if w > 0.0001 {
                    dvel += disp / w;
                    let speed_sqr = dvel.length_squared();
                    let desired_sqr = sqr(desired_speed);
                    if speed_sqr > desired_sqr {
                        dvel *= desired_sqr / speed_sqr;
                    }
                }
            }

            let ag = &mut self.agents[idx];
            ag.dvel = dvel;
            ag.desired_speed = desired_speed;
        }
    }

    fn plan_velocities(&mut self, debug_idx: Option<usize>, mut debug: Option<&mut CrowdAgentDebugInfo>) {
        for idx in 0..self.agents.len() {
            let ag = &self.agents[idx];
            if !ag.active || ag.state != CrowdAgentState::Walking {
                continue;
            }

            if !ag.params.update_flags.contains(UpdateFlags::OBSTACLE_AVOIDANCE) {
                let dvel = ag.dvel;
                self.agents[idx].nvel = dvel;
                continue;
            }

            self.obstacle_query.reset();
            for nei in ag.neighbours() {
                let other = &self.agents[nei.idx];
                self.obstacle_query.add_circle(
                    &other.npos.to_array(),
                    other.params.radius,
                    &other.vel.to_array(),
                    &other.dvel.to_array(),
                );
            }

            let pos = ag.npos.to_array();
            for seg in ag.boundary.segments() {
                let (s, e) = (seg.start(), seg.end());
                // Walls facing away from the agent.
                if tri_area_2d(&pos, &s, &e) < 0.0 {
                    continue;
                }
                self.obstacle_query.add_segment(&s, &e);
            }

            let vod = debug
                .as_deref_mut()
                .filter(|_| debug_idx == Some(idx))
                .and_then(|d| d.vod.as_mut());
            let params = &self.obstacle_query_params[ag.params.obstacle_avoidance_type as usize];
            let (nvel, ns) = self.obstacle_query.sample_velocity_adaptive(
                &pos,
                ag.params.radius,
                ag.desired_speed,
                &ag.vel.to_array(),
                &ag.dvel.to_array(),
                params,
                vod,
            );
            self.velocity_sample_count += ns;
            self.agents[idx].nvel = Vec3::from_array(nvel);
        }
    }

    fn resolve_collisions(&mut self) {
        for _ in 0..COLLISION_ITERATIONS {
            for idx in 0..self.agents.len() {
                let ag = &self.agents[idx];
                if !ag.active || ag.state != CrowdAgentState::Walking {
                    continue;
                }

                let mut disp = Vec3::ZERO;
                let mut w = 0.0;
                for nei in ag.neighbours() {
                    let other = &self.agents[nei.idx];
                    let mut diff = ag.npos - other.npos;
                    diff.y = 0.0;

                    let combined = ag.params.radius + other.params.radius;
                    let dist_sqr = diff.length_squared();
                    if dist_sqr > sqr(combined) {
                        continue;
                    }
                    let dist = dist_sqr.sqrt();
                    let pen = if dist < 0.0001 {
                        // Stacked agents: push apart sideways, in opposite
                        // directions.
                        diff = if idx > nei.idx {
                            Vec3::new(-ag.dvel.z, 0.0, ag.dvel.x)
                        } else {
                            Vec3::new(ag.dvel.z, 0.0, -ag.dvel.x)
                        };
                        0.01
                    } else {
                        (1.0 / dist) * ((combined - dist) * 0.5) * COLLISION_RESOLVE_FACTOR
                    };
                    disp += diff * pen;
                    w += 1.0;
                }

                if w > 0.0001 {
                    disp /= w;
                }
                self.agents[idx].disp = disp;
            }

            for ag in self.agents.iter_mut().filter(|ag| ag.active && ag.state == CrowdAgentState::Walking) {
                ag.npos += ag.disp;
            }
        }
    }

    fn move_agents(&mut self, query: &mut NavMeshQuery<'_>) {
        for (idx, ag) in self.agents.iter_mut().enumerate() {
            if !ag.active || ag.state != CrowdAgentState::Walking {
                continue;
            }
            let filter = &self.filters[ag.params.query_filter_type as usize];

            // Clamp to the mesh.
            if let Err(err) = ag.corridor.move_position(&ag.npos.to_array(), query, filter) {
                trace!("agent {idx} could not move: {err}");
            }
            ag.npos = Vec3::from_array(*ag.corridor.pos());

            if !ag.follows_path() {
                let first = ag.corridor.first_poly();
                ag.corridor.reset(first, ag.npos.to_array());
                ag.partial = false;
            }
        }
    }

    fn update_offmesh_animations(&mut self, dt: f32) {
        for (idx, ag) in self.agents.iter_mut().enumerate() {
            if !ag.active || !ag.anim.active {
                continue;
            }
            let anim = &mut ag.anim;
            anim.t += dt;
            if anim.t > anim.tmax {
                anim.active = false;
                ag.state = CrowdAgentState::Walking;
                debug!("agent {idx} leaves off-mesh connection {}", anim.poly_ref);
                continue;
            }

            let init = Vec3::from_array(anim.init_pos);
            let start = Vec3::from_array(anim.start_pos);
            let end = Vec3::from_array(anim.end_pos);
            let ta = anim.tmax * 0.15;
            let tb = anim.tmax;
            ag.npos = if anim.t < ta {
                init.lerp(start, tween(anim.t, 0.0, ta))
            } else {
                start.lerp(end, tween(anim.t, ta, tb))
            };
            ag.vel = Vec3::ZERO;
            ag.dvel = Vec3::ZERO;
        }
    }
}

fn tween(t: f32, t0: f32, t1: f32) -> f32 {
    if t1 - t0 <= 0.0 {
        return 1.0;
    }
    ((t - t0) / (t1 - t0)).clamp(0.0, 1.0)
}

/// Runs a short sliced search from `start_ref` to `end_ref`. With `existing`
/// set, a path that does not reach the end stops at the furthest polygon of
/// the existing corridor it visited.
#[allow(clippy::too_many_arguments)]
fn quick_search(
    query: &mut NavMeshQuery<'_>,
    start_ref: PolyRef,
    end_ref: PolyRef,
    start_pos: &[f32; 3],
    end_pos: &[f32; 3],
    filter: &QueryFilter,
    existing: Option<&[PolyRef]>,
    path: &mut [PolyRef],
) -> Result<usize> {
    query.init_sliced_find_path(start_ref, end_ref, start_pos, end_pos, filter)?;
    query.update_sliced_find_path(QUICK_SEARCH_ITERS)?;
    let result = match existing {
        Some(existing) => query.finalize_sliced_find_path_partial(existing, path)?,
        None => query.finalize_sliced_find_path(path)?,
    };
    Ok(result.count)
}

/// Prepends `old` (the corridor minus its last polygon, where the search
/// started) to the first `nres` polygons of `res` and removes back and forth
/// steps. Returns the new length.
fn splice_old_path(res: &mut [PolyRef], nres: usize, old: &[PolyRef]) -> usize {
    let max = res.len();
    let prefix = old.len().min(max - 1);
    let nres = nres.min(max - prefix);
    res.copy_within(0..nres, prefix);
    res[..prefix].copy_from_slice(&old[..prefix]);
    let mut n = nres + prefix;

    // A, B, A collapses to A.
    let mut j = 1;
    while j + 1 < n {
        if res[j - 1] == res[j + 1] {
            res.copy_within(j + 1..n, j - 1);
            n -= 2;
            j = (j - 1).max(1);
        } else {
            j += 1;
        }
    }
    n
}

/// Inserts `idx` keeping `queue` sorted by descending priority. The lowest
/// priority drops out when full. Returns the new length.
fn push_by_priority<const N: usize>(queue: &mut [(usize, f32); N], n: usize, idx: usize, priority: f32) -> usize {
    let slot = queue[..n].iter().position(|&(_, p)| priority > p).unwrap_or(n);
    if slot >= N {
        return n;
    }
    let end = n.min(N - 1);
    queue.copy_within(slot..end, slot + 1);
    queue[slot] = (idx, priority);
    (n + 1).min(N)
}

/// Agents overlapping the query range of agent `skip`, nearest first.
fn get_neighbours(
    skip: usize,
    pos: Vec3,
    height: f32,
    range: f32,
    agents: &[CrowdAgent],
    grid: &ProximityGrid,
) -> ([CrowdNeighbour; MAX_NEIGHBOURS], usize) {
    let mut result = [CrowdNeighbour::default(); MAX_NEIGHBOURS];
    let mut n = 0;

    let mut ids = [0usize; MAX_GRID_NEIGHBOURS];
    let nids = grid.query_items(pos.x - range, pos.z - range, pos.x + range, pos.z + range, &mut ids);

    for &id in &ids[..nids] {
        if id == skip {
            continue;
        }
        let ag = &agents[id];
        let mut diff = pos - ag.npos;
        if diff.y.abs() >= (height + ag.params.height) / 2.0 {
            continue;
        }
        diff.y = 0.0;
        let dist_sqr = diff.length_squared();
        if dist_sqr > sqr(range) {
            continue;
        }

        let slot = result[..n].iter().position(|nei| dist_sqr <= nei.dist).unwrap_or(n);
        if slot >= MAX_NEIGHBOURS {
            continue;
        }
        let end = n.min(MAX_NEIGHBOURS - 1);
        result.copy_within(slot..end, slot + 1);
        result[slot] = CrowdNeighbour { idx: id, dist: dist_sqr };
        n = (n + 1).min(MAX_NEIGHBOURS);
    }
    (result, n)
}
