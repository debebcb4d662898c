//! Velocity sampling obstacle avoidance
//!
//! Candidate velocities are scored against the desired velocity, the current
//! velocity, a side bias and the time until the first collision with a
//! neighbouring agent or a wall. The lowest penalty wins. Two sampling
//! schemes are provided: a regular grid and an adaptive pattern of rings
//! aligned to the desired velocity that is refined around the best sample.
//!
//! All arithmetic happens on the XZ plane; the Y components are ignored.

use glam::{Vec2, Vec3};

use detour_common::{distance_pt_seg_sqr_2d, sqr, Error, Result};

/// Maximum number of directions per ring of the adaptive pattern
pub const MAX_PATTERN_DIVS: usize = 32;
/// Maximum number of rings of the adaptive pattern
pub const MAX_PATTERN_RINGS: usize = 4;

/// Segments closer than this count as touching the agent
const TOUCH_RANGE: f32 = 0.01;

/// Moving obstacle, usually another agent
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ObstacleCircle {
    pub p: Vec3,
    pub vel: Vec3,
    pub dvel: Vec3,
    pub rad: f32,
    /// Direction from the agent to the obstacle
    pub dp: Vec3,
    /// Side the agent prefers to pass on
    pub np: Vec3,
}

/// Static obstacle, a wall segment
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ObstacleSegment {
    pub p: Vec3,
    pub q: Vec3,
    /// The agent is practically on the segment
    pub touch: bool,
}

/// Weights and sampling pattern of the avoidance query.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct ObstacleAvoidanceParams {
    /// How much the sampling is centered on the desired velocity, `0..=1`
    pub vel_bias: f32,
    pub weight_des_vel: f32,
    pub weight_cur_vel: f32,
    pub weight_side: f32,
    pub weight_toi: f32,
    /// Time horizon of the collision test, in seconds
    pub horiz_time: f32,
    pub grid_size: u8,
    pub adaptive_divs: u8,
    pub adaptive_rings: u8,
    pub adaptive_depth: u8,
}

impl Default for ObstacleAvoidanceParams {
    fn default() -> Self {
        Self {
            vel_bias: 0.4,
            weight_des_vel: 2.0,
            weight_cur_vel: 0.75,
            weight_side: 0.75,
            weight_toi: 2.5,
            horiz_time: 2.5,
            grid_size: 33,
            adaptive_divs: 7,
            adaptive_rings: 2,
            adaptive_depth: 5,
        }
    }
}

/// One scored candidate velocity
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AvoidanceSample {
    pub vel: Vec3,
    pub size: f32,
    pub pen: f32,
    pub vpen: f32,
    pub vcpen: f32,
    pub spen: f32,
    pub tpen: f32,
}

/// Records every sample of one query, for visualization.
#[derive(Debug, Clone)]
pub struct ObstacleAvoidanceDebugData {
    samples: Vec<AvoidanceSample>,
    max_samples: usize,
}

impl ObstacleAvoidanceDebugData {
    pub fn new(max_samples: usize) -> Self {
        Self {
            samples: Vec::with_capacity(max_samples),
            max_samples,
        }
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_sample(&mut self, vel: Vec3, size: f32, pen: f32, vpen: f32, vcpen: f32, spen: f32, tpen: f32) {
        if self.samples.len() >= self.max_samples {
            return;
        }
        self.samples.push(AvoidanceSample {
            vel,
            size,
            pen,
            vpen,
            vcpen,
            spen,
            tpen,
        });
    }

    /// Rescales every penalty kind to `0..=1` over the recorded samples.
    pub fn normalize_samples(&mut self) {
        normalize(&mut self.samples, |s| &mut s.pen);
        normalize(&mut self.samples, |s| &mut s.vpen);
        normalize(&mut self.samples, |s| &mut s.vcpen);
        normalize(&mut self.samples, |s| &mut s.spen);
        normalize(&mut self.samples, |s| &mut s.tpen);
    }

    pub fn samples(&self) -> &[AvoidanceSample] {
        &self.samples
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }
}

fn normalize(samples: &mut [AvoidanceSample], field: impl Fn(&mut AvoidanceSample) -> &mut f32) {
    if samples.is_empty() {
        return;
    }
    let mut min_pen = f32::MAX;
    let mut max_pen = -f32::MAX;
    for s in samples.iter_mut() {
        let v = *field(s);
        min_pen = min_pen.min(v);
        max_pen = max_pen.max(v);
    }
    let range = max_pen - min_pen;
    let scale = if range > 0.001 { 1.0 / range } else { 1.0 };
    for s in samples.iter_mut() {
        let v = field(s);
        *v = ((*v - min_pen) * scale).clamp(0.0, 1.0);
    }
}

fn dot_2d(a: Vec3, b: Vec3) -> f32 {
    a.x * b.x + a.z * b.z
}

fn len_2d(v: Vec3) -> f32 {
    (v.x * v.x + v.z * v.z).sqrt()
}

fn perp_2d(u: Vec3, v: Vec3) -> f32 {
    u.z * v.x - u.x * v.z
}

/// Times at which a circle at `c0` moving with `v` touches the circle at `c1`.
fn sweep_circle_circle(c0: Vec3, r0: f32, v: Vec3, c1: Vec3, r1: f32) -> Option<(f32, f32)> {
    const EPS: f32 = 0.0001;
    let s = c1 - c0;
    let r = r0 + r1;
    let c = dot_2d(s, s) - r * r;
    let a = dot_2d(v, v);
    if a < EPS {
        return None;
    }
    let b = dot_2d(v, s);
    let d = b * b - a * c;
    if d < 0.0 {
        return None;
    }
    let inv_a = 1.0 / a;
    let rd = d.sqrt();
    Some(((b - rd) * inv_a, (b + rd) * inv_a))
}

/// Parameter along the ray `ap + t * u` where it crosses segment `bp..bq`.
fn isect_ray_seg(ap: Vec3, u: Vec3, bp: Vec3, bq: Vec3) -> Option<f32> {
    let v = bq - bp;
    let w = ap - bp;
    let d = perp_2d(u, v);
    if d.abs() < 1e-6 {
        return None;
    }
    let d = 1.0 / d;
    let t = perp_2d(v, w) * d;
    if !(0.0..=1.0).contains(&t) {
        return None;
    }
    let s = perp_2d(u, w) * d;
    if !(0.0..=1.0).contains(&s) {
        return None;
    }
    Some(t)
}

/// Picks a collision free velocity among sampled candidates.
#[derive(Debug, Clone)]
pub struct ObstacleAvoidanceQuery {
    params: ObstacleAvoidanceParams,
    inv_horiz_time: f32,
    vmax: f32,
    inv_vmax: f32,
    max_circles: usize,
    circles: Vec<ObstacleCircle>,
    max_segments: usize,
    segments: Vec<ObstacleSegment>,
}

impl ObstacleAvoidanceQuery {
    pub fn new(max_circles: usize, max_segments: usize) -> Result<Self> {
        if max_circles == 0 && max_segments == 0 {
            return Err(Error::invalid_param("avoidance query needs room for obstacles"));
        }
        Ok(Self {
            params: ObstacleAvoidanceParams::default(),
            inv_horiz_time: 0.0,
            vmax: 0.0,
            inv_vmax: 0.0,
            max_circles,
            circles: Vec::with_capacity(max_circles),
            max_segments,
            segments: Vec::with_capacity(max_segments),
        })
    }

    /// Removes all obstacles.
    pub fn reset(&mut self) {
        self.circles.clear();
        self.segments.clear();
    }

    /// Adds a moving circle; ignored when the circle table is full.
    pub fn add_circle(&mut self, pos: &[f32; 3], rad: f32, vel: &[f32; 3], dvel: &[f32; 3]) {
        if self.circles.len() >= self.max_circles {
            return;
        }
        self.circles.push(ObstacleCircle {
            p: Vec3::from_array(*pos),
            vel: Vec3::from_array(*vel),
            dvel: Vec3::from_array(*dvel),
            rad,
            ..Default::default()
        });
    }

    /// Adds a wall segment; ignored when the segment table is full.
    pub fn add_segment(&mut self, p: &[f32; 3], q: &[f32; 3]) {
        if self.segments.len() >= self.max_segments {
            return;
        }
        self.segments.push(ObstacleSegment {
            p: Vec3::from_array(*p),
            q: Vec3::from_array(*q),
            touch: false,
        });
    }

    pub fn circles(&self) -> &[ObstacleCircle] {
        &self.circles
    }

    pub fn segments(&self) -> &[ObstacleSegment] {
        &self.segments
    }

    fn prepare(&mut self, pos: Vec3, dvel: Vec3) {
        for cir in &mut self.circles {
            let mut dp = cir.p - pos;
            dp.y = 0.0;
            cir.dp = dp.normalize_or_zero();
            let dv = cir.dvel - dvel;

            // Pass on the side the obstacle is not heading to.
            let a = dv.x * cir.dp.z - cir.dp.x * dv.z;
            cir.np = if a < 0.01 {
                Vec3::new(-cir.dp.z, 0.0, cir.dp.x)
            } else {
                Vec3::new(cir.dp.z, 0.0, -cir.dp.x)
            };
        }

        let p = pos.to_array();
        for seg in &mut self.segments {
            let (d, _) = distance_pt_seg_sqr_2d(&p, &seg.p.to_array(), &seg.q.to_array());
            seg.touch = d < sqr(TOUCH_RANGE);
        }
    }

    fn begin(&mut self, pos: Vec3, vmax: f32, dvel: Vec3, params: &ObstacleAvoidanceParams) {
        self.prepare(pos, dvel);
        self.params = *params;
        self.inv_horiz_time = 1.0 / self.params.horiz_time;
        self.vmax = vmax;
        self.inv_vmax = if vmax > 0.0 { 1.0 / vmax } else { f32::MAX };
    }

    /// Scores one candidate velocity. Bails out with `min_penalty` as soon
    /// as the candidate cannot beat it.
    #[allow(clippy::too_many_arguments)]
    fn process_sample(
        &self,
        vcand: Vec3,
        cs: f32,
        pos: Vec3,
        rad: f32,
        vel: Vec3,
        dvel: Vec3,
        min_penalty: f32,
        debug: Option<&mut ObstacleAvoidanceDebugData>,
    ) -> f32 {
        let p = &self.params;
        let vpen = p.weight_des_vel * (len_2d(vcand - dvel) * self.inv_vmax);
        let vcpen = p.weight_cur_vel * (len_2d(vcand - vel) * self.inv_vmax);

        // Collision time below which this sample cannot win anymore.
        let min_pen = min_penalty - vpen - vcpen;
        let t_threshold = (p.weight_toi / min_pen - 0.1) * p.horiz_time;
        if t_threshold - p.horiz_time > -f32::EPSILON {
            return min_penalty;
        }

        let mut tmin = p.horiz_time;
        let mut side = 0.0;
        let mut nside = 0;

        for cir in &self.circles {
            // Reciprocal: each agent takes half of the avoidance.
            let vab = vcand * 2.0 - vel - cir.vel;

            side += (dot_2d(cir.dp, vab) * 0.5 + 0.5).min(dot_2d(cir.np, vab) * 2.0).clamp(0.0, 1.0);
            nside += 1;

            let Some((mut htmin, htmax)) = sweep_circle_circle(pos, rad, vab, cir.p, cir.rad) else {
                continue;
            };

            // Already overlapping: push harder to separate.
            if htmin < 0.0 && htmax > 0.0 {
                htmin = -htmin * 0.5;
            }

            if htmin >= 0.0 && htmin < tmin {
                tmin = htmin;
                if tmin < t_threshold {
                    return min_penalty;
                }
            }
        }

        for seg in &self.segments {
            let htmin = if seg.touch {
                // Moving away from a touching wall is free.
                let sdir = seg.q - seg.p;
                let snorm = Vec3::new(-sdir.z, 0.0, sdir.x);
                if dot_2d(snorm, vcand) < 0.0 {
                    continue;
                }
                0.0
            } else {
                match isect_ray_seg(pos, vcand, seg.p, seg.q) {
                    Some(t) => t,
                    None => continue,
                }
            };

            // Walls are approached more closely than agents.
            let htmin = htmin * 2.0;
            if htmin < tmin {
                tmin = htmin;
                if tmin < t_threshold {
                    return min_penalty;
                }
            }
        }

        if nside > 0 {
            side /= nside as f32;
        }

        let spen = p.weight_side * side;
        let tpen = p.weight_toi * (1.0 / (0.1 + tmin * self.inv_horiz_time));
        let penalty = vpen + vcpen + spen + tpen;

        if let Some(debug) = debug {
            debug.add_sample(vcand, cs, penalty, vpen, vcpen, spen, tpen);
        }
        penalty
    }

    /// Samples a regular grid of velocities centered on the biased desired
    /// velocity. Returns the best velocity and the number of samples taken.
    #[allow(clippy::too_many_arguments)]
    pub fn sample_velocity_grid(
        &mut self,
        pos: &[f32; 3],
        rad: f32,
        vmax: f32,
        vel: &[f32; 3],
        dvel: &[f32; 3],
        params: &ObstacleAvoidanceParams,
        mut debug: Option<&mut ObstacleAvoidanceDebugData>,
    ) -> ([f32; 3], usize) {
        let pos = Vec3::from_array(*pos);
        let vel = Vec3::from_array(*vel);
        let dvel = Vec3::from_array(*dvel);
        self.begin(pos, vmax, dvel, params);
        if let Some(debug) = debug.as_deref_mut() {
            debug.reset();
        }

        let grid_size = self.params.grid_size.max(2) as usize;
        let center = Vec2::new(dvel.x, dvel.z) * self.params.vel_bias;
        let cs = vmax * 2.0 * (1.0 - self.params.vel_bias) / (grid_size - 1) as f32;
        let half = (grid_size - 1) as f32 * cs * 0.5;

        let mut min_penalty = f32::MAX;
        let mut nvel = Vec3::ZERO;
        let mut ns = 0;

        for y in 0..grid_size {
            for x in 0..grid_size {
                let vcand = Vec3::new(
                    center.x + x as f32 * cs - half,
                    0.0,
                    center.y + y as f32 * cs - half,
                );
                if sqr(vcand.x) + sqr(vcand.z) > sqr(vmax + cs / 2.0) {
                    continue;
                }

                let penalty =
                    self.process_sample(vcand, cs, pos, rad, vel, dvel, min_penalty, debug.as_deref_mut());
                ns += 1;
                if penalty < min_penalty {
                    min_penalty = penalty;
                    nvel = vcand;
                }
            }
        }

        (nvel.to_array(), ns)
    }

    /// Samples rings of directions aligned to the desired velocity, then
    /// repeatedly refines a smaller pattern around the best candidate.
    /// Returns the best velocity and the number of samples taken.
    #[allow(clippy::too_many_arguments)]
    pub fn sample_velocity_adaptive(
        &mut self,
        pos: &[f32; 3],
        rad: f32,
        vmax: f32,
        vel: &[f32; 3],
        dvel: &[f32; 3],
        params: &ObstacleAvoidanceParams,
        mut debug: Option<&mut ObstacleAvoidanceDebugData>,
    ) -> ([f32; 3], usize) {
        let pos = Vec3::from_array(*pos);
        let vel = Vec3::from_array(*vel);
        let dvel = Vec3::from_array(*dvel);
        self.begin(pos, vmax, dvel, params);
        if let Some(debug) = debug.as_deref_mut() {
            debug.reset();
        }

        let ndivs = (self.params.adaptive_divs as usize).clamp(1, MAX_PATTERN_DIVS);
        let nrings = (self.params.adaptive_rings as usize).clamp(1, MAX_PATTERN_RINGS);
        let depth = self.params.adaptive_depth as usize;

        let (pat, npat) = sampling_pattern(Vec2::new(dvel.x, dvel.z), ndivs, nrings);

        let mut cr = vmax * (1.0 - self.params.vel_bias);
        let mut res = Vec3::new(dvel.x * self.params.vel_bias, 0.0, dvel.z * self.params.vel_bias);
        let mut ns = 0;

        for _ in 0..depth {
            let mut min_penalty = f32::MAX;
            let mut bvel = Vec3::ZERO;

            for p in &pat[..npat] {
                let vcand = Vec3::new(res.x + p.x * cr, 0.0, res.z + p.y * cr);
                if sqr(vcand.x) + sqr(vcand.z) > sqr(vmax + 0.001) {
                    continue;
                }

                let penalty =
                    self.process_sample(vcand, cr / 10.0, pos, rad, vel, dvel, min_penalty, debug.as_deref_mut());
                ns += 1;
                if penalty < min_penalty {
                    min_penalty = penalty;
                    bvel = vcand;
                }
            }

            res = bvel;
            cr *= 0.5;
        }

        (res.to_array(), ns)
    }
}

const MAX_PATTERN: usize = MAX_PATTERN_DIVS * MAX_PATTERN_RINGS + 1;

/// Unit sampling pattern: the origin plus `nrings` rings of `ndivs`
/// directions, the first direction of every other ring along `dir`.
fn sampling_pattern(dir: Vec2, ndivs: usize, nrings: usize) -> ([Vec2; MAX_PATTERN], usize) {
    let mut pat = [Vec2::ZERO; MAX_PATTERN];
    let da = std::f32::consts::TAU / ndivs as f32;
    let (sa, ca) = da.sin_cos();

    let d0 = dir.normalize_or_zero();
    let (hs, hc) = (da * 0.5).sin_cos();
    let d1 = Vec2::new(d0.x * hc - d0.y * hs, d0.x * hs + d0.y * hc);
    let ddir = [d0, d1];

    // The origin is always a candidate.
    let mut npat = 1;
    for j in 0..nrings {
        let r = (nrings - j) as f32 / nrings as f32;
        pat[npat] = ddir[j % 2] * r;
        let mut last1 = npat;
        let mut last2 = npat;
        npat += 1;

        let mut i = 1;
        while i + 1 < ndivs {
            let a = pat[last1];
            let b = pat[last2];
            // Clockwise on one side, counter clockwise on the other.
            pat[npat] = Vec2::new(a.x * ca + a.y * sa, -a.x * sa + a.y * ca);
            pat[npat + 1] = Vec2::new(b.x * ca - b.y * sa, b.x * sa + b.y * ca);
            last1 = npat;
            last2 = npat + 1;
            npat += 2;
            i += 2;
        }

        if ndivs & 1 == 0 {
            let b = pat[last2];
            pat[npat] = Vec2::new(b.x * ca - b.y * sa, b.x * sa + b.y * ca);
            npat += 1;
        }
    }

    (pat, npat)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query_with_circle(p: [f32; 3], vel: [f32; 3]) -> Result<ObstacleAvoidanceQuery> {
        let mut query = ObstacleAvoidanceQuery::new(6, 8)?;
        query.add_circle(&p, 0.5, &vel, &vel);
        Ok(query)
    }

    #[test]
    fn test_default_params() {
        let params = ObstacleAvoidanceParams::default();
        assert_eq!(params.vel_bias, 0.4);
        assert_eq!(params.weight_des_vel, 2.0);
        assert_eq!(params.weight_cur_vel, 0.75);
        assert_eq!(params.weight_side, 0.75);
        assert_eq!(params.weight_toi, 2.5);
        assert_eq!(params.horiz_time, 2.5);
        assert_eq!(params.grid_size, 33);
        assert_eq!((params.adaptive_divs, params.adaptive_rings, params.adaptive_depth), (7, 2, 5));
    }

    #[test]
    fn test_obstacle_tables_are_bounded() -> Result<()> {
        assert!(ObstacleAvoidanceQuery::new(0, 0).is_err());
        let mut query = ObstacleAvoidanceQuery::new(1, 1)?;
        query.add_circle(&[0.0; 3], 1.0, &[0.0; 3], &[0.0; 3]);
        query.add_circle(&[1.0; 3], 1.0, &[0.0; 3], &[0.0; 3]);
        query.add_segment(&[0.0; 3], &[1.0, 0.0, 0.0]);
        query.add_segment(&[0.0; 3], &[0.0, 0.0, 1.0]);
        assert_eq!(query.circles().len(), 1);
        assert_eq!(query.segments().len(), 1);
        query.reset();
        assert!(query.circles().is_empty() && query.segments().is_empty());
        Ok(())
    }

    #[test]
    fn test_pattern_size() {
        let (pat, n) = sampling_pattern(Vec2::new(1.0, 0.0), 7, 2);
        assert_eq!(n, 1 + 2 * 7);
        assert_eq!(pat[0], Vec2::ZERO);
        // Outer ring points along the desired direction.
        assert!((pat[1] - Vec2::new(1.0, 0.0)).length() < 1e-6);
        assert!(pat[1..n].iter().take(7).all(|p| (p.length() - 1.0).abs() < 1e-5));

        let (_, n) = sampling_pattern(Vec2::new(0.0, 1.0), 8, 3);
        assert_eq!(n, 1 + 3 * 8);
    }

    #[test]
    fn test_free_space_keeps_desired_velocity() -> Result<()> {
        let mut query = ObstacleAvoidanceQuery::new(6, 8)?;
        let params = ObstacleAvoidanceParams::default();
        let dvel = [2.0, 0.0, 0.0];

        let (nvel, ns) = query.sample_velocity_grid(&[0.0; 3], 0.5, 2.0, &dvel, &dvel, &params, None);
        assert!(ns > 0);
        assert!((nvel[0] - 2.0).abs() < 0.2 && nvel[2].abs() < 0.2, "{nvel:?}");

        let (nvel, ns) = query.sample_velocity_adaptive(&[0.0; 3], 0.5, 2.0, &dvel, &dvel, &params, None);
        assert!(ns > 0);
        assert!((nvel[0] - 2.0).abs() < 0.2 && nvel[2].abs() < 0.2, "{nvel:?}");
        Ok(())
    }

    #[test]
    fn test_steers_around_oncoming_agent() -> Result<()> {
        let mut query = query_with_circle([3.0, 0.0, 0.0], [-2.0, 0.0, 0.0])?;
        let params = ObstacleAvoidanceParams::default();
        let dvel = [2.0, 0.0, 0.0];

        let (nvel, _) = query.sample_velocity_adaptive(&[0.0; 3], 0.5, 2.0, &dvel, &dvel, &params, None);
        // Turns away from the straight line towards the obstacle.
        assert!(nvel[2].abs() > 0.1, "{nvel:?}");
        let toi = sweep_circle_circle(
            Vec3::ZERO,
            0.5,
            Vec3::from_array(nvel) * 2.0 - Vec3::new(2.0, 0.0, 0.0) - Vec3::new(-2.0, 0.0, 0.0),
            Vec3::new(3.0, 0.0, 0.0),
            0.5,
        );
        let straight = sweep_circle_circle(
            Vec3::ZERO,
            0.5,
            Vec3::new(4.0, 0.0, 0.0),
            Vec3::new(3.0, 0.0, 0.0),
            0.5,
        );
        let straight_toi = straight.map(|(t, _)| t).unwrap_or(f32::MAX);
        assert!(toi.map_or(true, |(t, _)| t < 0.0 || t > straight_toi));
        Ok(())
    }

    #[test]
    fn test_wall_ahead_blocks_forward_samples() -> Result<()> {
        let mut query = ObstacleAvoidanceQuery::new(6, 8)?;
        query.add_segment(&[1.0, 0.0, -5.0], &[1.0, 0.0, 5.0]);
        let params = ObstacleAvoidanceParams::default();
        let dvel = [2.0, 0.0, 0.0];

        let (free, _) = {
            let mut open = ObstacleAvoidanceQuery::new(6, 8)?;
            open.sample_velocity_grid(&[0.0; 3], 0.5, 2.0, &[0.0; 3], &dvel, &params, None)
        };
        let (nvel, _) = query.sample_velocity_grid(&[0.0; 3], 0.5, 2.0, &[0.0; 3], &dvel, &params, None);
        assert!(nvel[0] < free[0], "{nvel:?} vs {free:?}");
        Ok(())
    }

    #[test]
    fn test_debug_data_records_and_normalizes() -> Result<()> {
        let mut query = query_with_circle([2.0, 0.0, 0.0], [0.0; 3])?;
        let params = ObstacleAvoidanceParams::default();
        let mut debug = ObstacleAvoidanceDebugData::new(1024);

        let (_, ns) =
            query.sample_velocity_grid(&[0.0; 3], 0.5, 2.0, &[0.0; 3], &[2.0, 0.0, 0.0], &params, Some(&mut debug));
        // Early outs are not recorded.
        assert!(debug.sample_count() > 0 && debug.sample_count() <= ns);

        debug.normalize_samples();
        for s in debug.samples() {
            for v in [s.pen, s.vpen, s.vcpen, s.spen, s.tpen] {
                assert!((0.0..=1.0).contains(&v));
            }
        }

        let mut small = ObstacleAvoidanceDebugData::new(4);
        query.sample_velocity_grid(&[0.0; 3], 0.5, 2.0, &[0.0; 3], &[2.0, 0.0, 0.0], &params, Some(&mut small));
        assert!(small.sample_count() <= 4);
        Ok(())
    }

    #[test]
    fn test_sweep_and_ray_helpers() {
        let hit = sweep_circle_circle(Vec3::ZERO, 0.5, Vec3::new(1.0, 0.0, 0.0), Vec3::new(3.0, 0.0, 0.0), 0.5);
        let (tmin, tmax) = hit.expect("collides");
        assert!((tmin - 2.0).abs() < 1e-5 && (tmax - 4.0).abs() < 1e-5);
        assert!(sweep_circle_circle(Vec3::ZERO, 0.5, Vec3::ZERO, Vec3::X, 0.5).is_none());

        let t = isect_ray_seg(Vec3::ZERO, Vec3::new(2.0, 0.0, 0.0), Vec3::new(1.0, 0.0, -1.0), Vec3::new(1.0, 0.0, 1.0));
        assert!((t.expect("crosses") - 0.5).abs() < 1e-6);
        assert!(isect_ray_seg(Vec3::ZERO, Vec3::new(0.0, 0.0, 2.0), Vec3::new(1.0, 0.0, -1.0), Vec3::new(1.0, 0.0, 1.0)).is_none());
    }
}
