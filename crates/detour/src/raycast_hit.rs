//! Raycast options and hit information

use super::DtStatus;

bitflags::bitflags! {
    /// Options for [`NavMeshQuery::raycast`](crate::NavMeshQuery::raycast)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
    pub struct RaycastOptions: u8 {
        /// Accumulate the filter cost of the visited segments
        const USE_COSTS = 0x01;
    }
}

/// Outcome of a raycast along the mesh surface.
///
/// The visited polygons are written to the caller's path buffer;
/// `path_count` tells how many entries are valid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RaycastHit {
    /// Hit parameter along the segment; `f32::MAX` when the end was reached
    pub t: f32,
    /// Normal of the wall that was hit
    pub hit_normal: [f32; 3],
    /// Edge of the last visited polygon that stopped the ray
    pub hit_edge_index: Option<usize>,
    /// Entries written to the path buffer
    pub path_count: usize,
    /// Accumulated cost, only with `RaycastOptions::USE_COSTS`
    pub path_cost: f32,
    /// `BUFFER_TOO_SMALL` when the path buffer overflowed
    pub status: DtStatus,
}

impl Default for RaycastHit {
    fn default() -> Self {
        Self::no_hit()
    }
}

impl RaycastHit {
    pub fn no_hit() -> Self {
        Self {
            t: f32::MAX,
            hit_normal: [0.0; 3],
            hit_edge_index: None,
            path_count: 0,
            path_cost: 0.0,
            status: DtStatus::SUCCESS,
        }
    }

    /// True when a wall stopped the ray before the end point
    pub fn hit_wall(&self) -> bool {
        self.t < f32::MAX
    }

    /// Point where the ray stopped, or `end` when it got through.
    pub fn hit_point(&self, start: &[f32; 3], end: &[f32; 3]) -> [f32; 3] {
        if self.hit_wall() {
            detour_common::vlerp(start, end, self.t)
        } else {
            *end
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_hit() {
        let hit = RaycastHit::no_hit();
        assert_eq!(hit.t, f32::MAX);
        assert!(!hit.hit_wall());
        assert_eq!(hit.hit_point(&[0.0; 3], &[1.0, 0.0, 2.0]), [1.0, 0.0, 2.0]);
    }

    #[test]
    fn test_hit_point() {
        let hit = RaycastHit {
            t: 0.25,
            hit_edge_index: Some(2),
            ..RaycastHit::no_hit()
        };
        assert!(hit.hit_wall());
        assert_eq!(hit.hit_point(&[0.0; 3], &[4.0, 0.0, 0.0]), [1.0, 0.0, 0.0]);
    }
}
