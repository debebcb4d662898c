//! Scalar and vector helpers for `[f32; 3]` positions
//!
//! Positions are Y-up; the "2D" variants work on the XZ plane.

/// Squared value (x²)
#[inline]
pub fn sqr<T: std::ops::Mul<Output = T> + Copy>(x: T) -> T {
    x * x
}

/// Clamps a value between min and max
#[inline]
pub fn clamp<T: PartialOrd>(v: T, min: T, max: T) -> T {
    if v < min {
        min
    } else if v > max {
        max
    } else {
        v
    }
}

/// Next power of two greater than or equal to x
#[inline]
pub fn next_pow2(x: u32) -> u32 {
    if x == 0 {
        return 1;
    }
    let mut n = x - 1;
    n |= n >> 1;
    n |= n >> 2;
    n |= n >> 4;
    n |= n >> 8;
    n |= n >> 16;
    n + 1
}

/// Integer log base 2
#[inline]
pub fn ilog2(x: u32) -> u32 {
    if x == 0 {
        return 0;
    }
    31 - x.leading_zeros()
}

/// Align value to 4-byte boundary
#[inline]
pub fn align4(x: usize) -> usize {
    (x + 3) & !3
}

#[inline]
pub fn vadd(a: &[f32; 3], b: &[f32; 3]) -> [f32; 3] {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

#[inline]
pub fn vsub(a: &[f32; 3], b: &[f32; 3]) -> [f32; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

#[inline]
pub fn vscale(v: &[f32; 3], s: f32) -> [f32; 3] {
    [v[0] * s, v[1] * s, v[2] * s]
}

/// Scaled vector addition (a + b * s)
#[inline]
pub fn vmad(a: &[f32; 3], b: &[f32; 3], s: f32) -> [f32; 3] {
    [a[0] + b[0] * s, a[1] + b[1] * s, a[2] + b[2] * s]
}

/// Linear interpolation between two points
#[inline]
pub fn vlerp(a: &[f32; 3], b: &[f32; 3], t: f32) -> [f32; 3] {
    [
        a[0] + (b[0] - a[0]) * t,
        a[1] + (b[1] - a[1]) * t,
        a[2] + (b[2] - a[2]) * t,
    ]
}

#[inline]
pub fn vmin(a: &[f32; 3], b: &[f32; 3]) -> [f32; 3] {
    [a[0].min(b[0]), a[1].min(b[1]), a[2].min(b[2])]
}

#[inline]
pub fn vmax(a: &[f32; 3], b: &[f32; 3]) -> [f32; 3] {
    [a[0].max(b[0]), a[1].max(b[1]), a[2].max(b[2])]
}

#[inline]
pub fn vdot(a: &[f32; 3], b: &[f32; 3]) -> f32 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

/// Dot product on the XZ plane
#[inline]
pub fn vdot_2d(a: &[f32; 3], b: &[f32; 3]) -> f32 {
    a[0] * b[0] + a[2] * b[2]
}

/// Perp dot product on the XZ plane (u.z * v.x - u.x * v.z)
#[inline]
pub fn vperp_2d(u: &[f32; 3], v: &[f32; 3]) -> f32 {
    u[2] * v[0] - u[0] * v[2]
}

#[inline]
pub fn vlen_sqr(v: &[f32; 3]) -> f32 {
    vdot(v, v)
}

#[inline]
pub fn vlen(v: &[f32; 3]) -> f32 {
    vlen_sqr(v).sqrt()
}

#[inline]
pub fn vdist(a: &[f32; 3], b: &[f32; 3]) -> f32 {
    vdist_sqr(a, b).sqrt()
}

#[inline]
pub fn vdist_sqr(a: &[f32; 3], b: &[f32; 3]) -> f32 {
    sqr(b[0] - a[0]) + sqr(b[1] - a[1]) + sqr(b[2] - a[2])
}

/// Distance on the XZ plane
#[inline]
pub fn vdist_2d(a: &[f32; 3], b: &[f32; 3]) -> f32 {
    vdist_2d_sqr(a, b).sqrt()
}

/// Squared distance on the XZ plane
#[inline]
pub fn vdist_2d_sqr(a: &[f32; 3], b: &[f32; 3]) -> f32 {
    sqr(b[0] - a[0]) + sqr(b[2] - a[2])
}

/// Normalizes the vector; a zero vector is returned unchanged.
#[inline]
pub fn vnormalize(v: &[f32; 3]) -> [f32; 3] {
    let len = vlen(v);
    if len > 0.0 {
        vscale(v, 1.0 / len)
    } else {
        *v
    }
}

/// Points closer than 1/16384 are considered equal.
#[inline]
pub fn vequal(a: &[f32; 3], b: &[f32; 3]) -> bool {
    const THR: f32 = 1.0 / 16384.0;
    vdist_sqr(a, b) < THR * THR
}

#[inline]
pub fn visfinite(v: &[f32; 3]) -> bool {
    v[0].is_finite() && v[1].is_finite() && v[2].is_finite()
}

/// Finite check on the XZ components only
#[inline]
pub fn visfinite_2d(v: &[f32; 3]) -> bool {
    v[0].is_finite() && v[2].is_finite()
}
