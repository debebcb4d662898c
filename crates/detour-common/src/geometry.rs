//! 2D geometry operations on the XZ plane
//!
//! Navigation polygons are convex and wound clockwise when viewed from above
//! (looking down the Y axis). Routines that depend on winding assume that.

use crate::math::{vdot_2d, vlerp, vperp_2d, vsub};

/// Twice the signed area of a triangle on the XZ plane.
///
/// Positive for clockwise winding when viewed from above.
#[inline]
pub fn tri_area_2d(a: &[f32; 3], b: &[f32; 3], c: &[f32; 3]) -> f32 {
    let abx = b[0] - a[0];
    let abz = b[2] - a[2];
    let acx = c[0] - a[0];
    let acz = c[2] - a[2];
    acx * abz - abx * acz
}

/// Check if two axis-aligned bounding boxes overlap.
#[inline]
pub fn overlap_bounds(amin: &[f32; 3], amax: &[f32; 3], bmin: &[f32; 3], bmax: &[f32; 3]) -> bool {
    !(amin[0] > bmax[0]
        || amax[0] < bmin[0]
        || amin[1] > bmax[1]
        || amax[1] < bmin[1]
        || amin[2] > bmax[2]
        || amax[2] < bmin[2])
}

/// Check if two quantized bounding boxes overlap.
#[inline]
pub fn overlap_quant_bounds(
    amin: &[u16; 3],
    amax: &[u16; 3],
    bmin: &[u16; 3],
    bmax: &[u16; 3],
) -> bool {
    !(amin[0] > bmax[0]
        || amax[0] < bmin[0]
        || amin[1] > bmax[1]
        || amax[1] < bmin[1]
        || amin[2] > bmax[2]
        || amax[2] < bmin[2])
}

/// Check if two 1D ranges overlap, shrunk by `eps`.
#[inline]
pub fn overlap_range(amin: f32, amax: f32, bmin: f32, bmax: f32, eps: f32) -> bool {
    !((amin + eps) > bmax || (amax - eps) < bmin)
}

/// Squared distance from `pt` to the segment `p`-`q` on the XZ plane.
///
/// Returns the squared distance and the parametric position of the closest
/// point along the segment.
pub fn distance_pt_seg_sqr_2d(pt: &[f32; 3], p: &[f32; 3], q: &[f32; 3]) -> (f32, f32) {
    let pqx = q[0] - p[0];
    let pqz = q[2] - p[2];
    let dx = pt[0] - p[0];
    let dz = pt[2] - p[2];
    let d = pqx * pqx + pqz * pqz;
    let mut t = pqx * dx + pqz * dz;
    if d > 0.0 {
        t /= d;
    }
    t = t.clamp(0.0, 1.0);
    let dx = p[0] + t * pqx - pt[0];
    let dz = p[2] + t * pqz - pt[2];
    (dx * dx + dz * dz, t)
}

/// Height of the triangle at the XZ location of `p`, if `p` lies inside it.
pub fn closest_height_point_triangle(
    p: &[f32; 3],
    a: &[f32; 3],
    b: &[f32; 3],
    c: &[f32; 3],
) -> Option<f32> {
    const EPS: f32 = 1e-6;

    let v0 = vsub(c, a);
    let v1 = vsub(b, a);
    let v2 = vsub(p, a);

    // Scaled barycentric coordinates
    let mut denom = v0[0] * v1[2] - v0[2] * v1[0];
    if denom.abs() < EPS {
        return None;
    }

    let mut u = v1[2] * v2[0] - v1[0] * v2[2];
    let mut v = v0[0] * v2[2] - v0[2] * v2[0];

    if denom < 0.0 {
        denom = -denom;
        u = -u;
        v = -v;
    }

    if u >= 0.0 && v >= 0.0 && (u + v) <= denom {
        Some(a[1] + (v0[1] * u + v1[1] * v) / denom)
    } else {
        None
    }
}

/// Crossing-number point in polygon test on the XZ plane.
pub fn point_in_polygon(pt: &[f32; 3], verts: &[[f32; 3]]) -> bool {
    let nverts = verts.len();
    if nverts == 0 {
        return false;
    }
    let mut c = false;
    let mut j = nverts - 1;
    for i in 0..nverts {
        let vi = &verts[i];
        let vj = &verts[j];
        if ((vi[2] > pt[2]) != (vj[2] > pt[2]))
            && (pt[0] < (vj[0] - vi[0]) * (pt[2] - vi[2]) / (vj[2] - vi[2]) + vi[0])
        {
            c = !c;
        }
        j = i;
    }
    c
}

/// Point in polygon test that also measures the squared distance to every edge.
///
/// `ed[j]` and `et[j]` receive the distance and parametric position for the
/// edge running from vertex `j` to vertex `j + 1`.
pub fn distance_pt_poly_edges_sqr(
    pt: &[f32; 3],
    verts: &[[f32; 3]],
    ed: &mut [f32],
    et: &mut [f32],
) -> bool {
    let nverts = verts.len();
    if nverts == 0 {
        return false;
    }
    let mut c = false;
    let mut j = nverts - 1;
    for i in 0..nverts {
        let vi = &verts[i];
        let vj = &verts[j];
        if ((vi[2] > pt[2]) != (vj[2] > pt[2]))
            && (pt[0] < (vj[0] - vi[0]) * (pt[2] - vi[2]) / (vj[2] - vi[2]) + vi[0])
        {
            c = !c;
        }
        let (d, t) = distance_pt_seg_sqr_2d(pt, vj, vi);
        ed[j] = d;
        et[j] = t;
        j = i;
    }
    c
}

/// Result of clipping a segment against a convex polygon.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentPolyIntersection {
    pub tmin: f32,
    pub tmax: f32,
    /// Edge the segment enters through, if any.
    pub seg_min: Option<usize>,
    /// Edge the segment leaves through, if any.
    pub seg_max: Option<usize>,
}

/// Clips the segment `p0`-`p1` against a clockwise convex polygon on the XZ plane.
pub fn intersect_segment_poly_2d(
    p0: &[f32; 3],
    p1: &[f32; 3],
    verts: &[[f32; 3]],
) -> Option<SegmentPolyIntersection> {
    const EPS: f32 = 0.000001;

    let mut res = SegmentPolyIntersection {
        tmin: 0.0,
        tmax: 1.0,
        seg_min: None,
        seg_max: None,
    };
    let dir = vsub(p1, p0);

    let nverts = verts.len();
    let mut j = nverts.checked_sub(1)?;
    for i in 0..nverts {
        let edge = vsub(&verts[i], &verts[j]);
        let diff = vsub(p0, &verts[j]);
        let n = vperp_2d(&edge, &diff);
        let d = vperp_2d(&dir, &edge);
        if d.abs() < EPS {
            // Nearly parallel to this edge
            if n < 0.0 {
                return None;
            }
            j = i;
            continue;
        }
        let t = n / d;
        if d < 0.0 {
            // Entering across this edge
            if t > res.tmin {
                res.tmin = t;
                res.seg_min = Some(j);
                if res.tmin > res.tmax {
                    return None;
                }
            }
        } else if t < res.tmax {
            // Exiting across this edge
            res.tmax = t;
            res.seg_max = Some(j);
            if res.tmax < res.tmin {
                return None;
            }
        }
        j = i;
    }

    Some(res)
}

/// Intersection parameters of two infinite lines through the given segments.
///
/// Returns `(s, t)` where `s` is along `ap`-`aq` and `t` along `bp`-`bq`, or
/// `None` when the lines are parallel.
pub fn intersect_seg_seg_2d(
    ap: &[f32; 3],
    aq: &[f32; 3],
    bp: &[f32; 3],
    bq: &[f32; 3],
) -> Option<(f32, f32)> {
    let u = vsub(aq, ap);
    let v = vsub(bq, bp);
    let w = vsub(ap, bp);
    let d = vperp_2d(&u, &v);
    if d.abs() < 1e-6 {
        return None;
    }
    let s = vperp_2d(&v, &w) / d;
    let t = vperp_2d(&u, &w) / d;
    Some((s, t))
}

fn project_poly(axis: &[f32; 3], poly: &[[f32; 3]]) -> (f32, f32) {
    let mut rmin = vdot_2d(axis, &poly[0]);
    let mut rmax = rmin;
    for v in &poly[1..] {
        let d = vdot_2d(axis, v);
        rmin = rmin.min(d);
        rmax = rmax.max(d);
    }
    (rmin, rmax)
}

/// Separating axis test for two convex polygons on the XZ plane.
pub fn overlap_poly_poly_2d(polya: &[[f32; 3]], polyb: &[[f32; 3]]) -> bool {
    const EPS: f32 = 1e-4;

    if polya.is_empty() || polyb.is_empty() {
        return false;
    }

    for (a, b) in [(polya, polyb), (polyb, polya)] {
        let n = a.len();
        let mut j = n - 1;
        for i in 0..n {
            let va = &a[j];
            let vb = &a[i];
            let axis = [vb[2] - va[2], 0.0, -(vb[0] - va[0])];
            let (amin, amax) = project_poly(&axis, a);
            let (bmin, bmax) = project_poly(&axis, b);
            if !overlap_range(amin, amax, bmin, bmax, EPS) {
                // Separating axis found
                return false;
            }
            j = i;
        }
    }
    true
}

/// Picks a point in a convex polygon from two uniform samples `s` and `t`.
///
/// `areas` is scratch space with at least `pts.len()` entries.
pub fn random_point_in_convex_poly(pts: &[[f32; 3]], areas: &mut [f32], s: f32, t: f32) -> [f32; 3] {
    let npts = pts.len();
    if npts < 3 {
        return pts.first().copied().unwrap_or([0.0; 3]);
    }

    // Triangle fan areas
    let mut areasum = 0.0;
    for i in 2..npts {
        areas[i] = tri_area_2d(&pts[0], &pts[i - 1], &pts[i]);
        areasum += areas[i].max(0.001);
    }

    // Pick a sub triangle weighted by area
    let thr = s * areasum;
    let mut acc = 0.0;
    let mut u = 1.0;
    let mut tri = npts - 1;
    for (i, &dacc) in areas.iter().enumerate().take(npts).skip(2) {
        if thr >= acc && thr < (acc + dacc) {
            u = (thr - acc) / dacc;
            tri = i;
            break;
        }
        acc += dacc;
    }

    let v = t.sqrt();

    let a = 1.0 - v;
    let b = (1.0 - u) * v;
    let c = u * v;
    let pa = &pts[0];
    let pb = &pts[tri - 1];
    let pc = &pts[tri];

    [
        a * pa[0] + b * pb[0] + c * pc[0],
        a * pa[1] + b * pb[1] + c * pc[1],
        a * pa[2] + b * pb[2] + c * pc[2],
    ]
}

/// Area of a convex polygon on the XZ plane (fan triangulation).
pub fn poly_area_2d(verts: &[[f32; 3]]) -> f32 {
    let mut area = 0.0;
    for i in 2..verts.len() {
        area += tri_area_2d(&verts[0], &verts[i - 1], &verts[i]);
    }
    area * 0.5
}

/// Average of the polygon vertices.
pub fn calc_poly_center(verts: &[[f32; 3]]) -> [f32; 3] {
    let mut c = [0.0; 3];
    if verts.is_empty() {
        return c;
    }
    for v in verts {
        c[0] += v[0];
        c[1] += v[1];
        c[2] += v[2];
    }
    let s = 1.0 / verts.len() as f32;
    [c[0] * s, c[1] * s, c[2] * s]
}

/// Point on segment `a`-`b` closest to `pt` on the XZ plane.
#[inline]
pub fn closest_pt_seg_2d(pt: &[f32; 3], a: &[f32; 3], b: &[f32; 3]) -> [f32; 3] {
    let (_, t) = distance_pt_seg_sqr_2d(pt, a, b);
    vlerp(a, b, t)
}

/// The tile side opposite to `side` (sides are numbered 0..8 counter-clockwise from +X).
#[inline]
pub fn opposite_tile(side: i32) -> i32 {
    (side + 4) & 0x7
}
