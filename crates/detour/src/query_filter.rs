//! Per-query traversal policy

use super::{Poly, PolyFlags, MAX_AREAS};
use detour_common::vdist;

/// Selects which polygons a query may visit and what it costs to cross them.
///
/// A polygon passes when it has at least one flag in `include_flags`, no flag
/// in `exclude_flags`, and its area bit is set in `area_mask`.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryFilter {
    pub include_flags: PolyFlags,
    pub exclude_flags: PolyFlags,
    /// Bit `a` set means area type `a` is traversable.
    pub area_mask: u64,
    /// Cost multiplier per area type.
    pub area_cost: [f32; MAX_AREAS],
}

impl Default for QueryFilter {
    fn default() -> Self {
        Self {
            include_flags: PolyFlags::ALL,
            exclude_flags: PolyFlags::empty(),
            area_mask: u64::MAX,
            area_cost: [1.0; MAX_AREAS],
        }
    }
}

impl QueryFilter {
    pub fn new(include_flags: PolyFlags, exclude_flags: PolyFlags) -> Self {
        Self {
            include_flags,
            exclude_flags,
            ..Default::default()
        }
    }

    /// Returns true if the polygon can be visited.
    #[inline]
    pub fn pass_filter(&self, poly: &Poly) -> bool {
        poly.flags.intersects(self.include_flags)
            && !poly.flags.intersects(self.exclude_flags)
            && (self.area_mask >> (poly.area as u32 & 63)) & 1 == 1
    }

    /// Cost of moving from `pa` to `pb`, where the move ends inside `target`.
    #[inline]
    pub fn get_cost(&self, pa: &[f32; 3], pb: &[f32; 3], target: &Poly) -> f32 {
        vdist(pa, pb) * self.area_cost[target.area as usize % MAX_AREAS]
    }

    pub fn area_cost(&self, area: u8) -> f32 {
        self.area_cost[area as usize % MAX_AREAS]
    }

    pub fn set_area_cost(&mut self, area: u8, cost: f32) {
        if (area as usize) < MAX_AREAS {
            self.area_cost[area as usize] = cost;
        }
    }

    /// Allows or forbids an area type.
    pub fn set_area_enabled(&mut self, area: u8, enabled: bool) {
        if (area as usize) < MAX_AREAS {
            if enabled {
                self.area_mask |= 1u64 << area;
            } else {
                self.area_mask &= !(1u64 << area);
            }
        }
    }

    pub fn include_flags(&self) -> PolyFlags {
        self.include_flags
    }

    pub fn set_include_flags(&mut self, flags: PolyFlags) {
        self.include_flags = flags;
    }

    pub fn exclude_flags(&self) -> PolyFlags {
        self.exclude_flags
    }

    pub fn set_exclude_flags(&mut self, flags: PolyFlags) {
        self.exclude_flags = flags;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PolyType;

    fn poly(flags: PolyFlags, area: u8) -> Poly {
        Poly {
            flags,
            area,
            poly_type: PolyType::Ground,
            ..Default::default()
        }
    }

    #[test]
    fn test_flag_masks() {
        let mut filter = QueryFilter::default();
        let walk = poly(PolyFlags::WALK, 0);
        let door = poly(PolyFlags::WALK | PolyFlags::DOOR, 0);
        let none = poly(PolyFlags::empty(), 0);
        assert!(filter.pass_filter(&walk));
        assert!(filter.pass_filter(&door));
        assert!(!filter.pass_filter(&none));

        filter.set_exclude_flags(PolyFlags::DOOR);
        assert!(filter.pass_filter(&walk));
        assert!(!filter.pass_filter(&door));

        filter.set_include_flags(PolyFlags::SWIM);
        assert!(!filter.pass_filter(&walk));
    }

    #[test]
    fn test_area_mask() {
        let mut filter = QueryFilter::default();
        let water = poly(PolyFlags::WALK, 5);
        assert!(filter.pass_filter(&water));
        filter.set_area_enabled(5, false);
        assert!(!filter.pass_filter(&water));
        assert!(filter.pass_filter(&poly(PolyFlags::WALK, 4)));
        filter.set_area_enabled(5, true);
        assert!(filter.pass_filter(&water));
    }

    #[test]
    fn test_cost_uses_target_area() {
        let mut filter = QueryFilter::default();
        filter.set_area_cost(3, 10.0);
        let grass = poly(PolyFlags::WALK, 0);
        let mud = poly(PolyFlags::WALK, 3);
        let a = [0.0, 0.0, 0.0];
        let b = [3.0, 0.0, 4.0];
        assert_eq!(filter.get_cost(&a, &b, &grass), 5.0);
        assert_eq!(filter.get_cost(&a, &b, &mud), 50.0);
        assert_eq!(filter.area_cost(3), 10.0);
    }
}
