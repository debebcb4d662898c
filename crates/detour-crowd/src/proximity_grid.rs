//! Proximity grid for neighbour queries in crowd simulation
//!
//! Items are axis aligned boxes on the XZ plane, hashed into grid cells. The
//! item pool and the bucket table are allocated once; the crowd clears and
//! refills the grid every frame. A box spanning several cells is stored in
//! each of them and deduplicated again when queried.

use detour_common::{Error, Result};

/// Sentinel for an empty bucket or the end of a bucket chain
const NULL_ITEM: u32 = u32::MAX;

/// Item stored in one cell
#[derive(Debug, Clone, Copy)]
struct Item {
    id: usize,
    x: i32,
    y: i32,
    next: u32,
}

/// Spatial hash of item boxes.
#[derive(Debug, Clone)]
pub struct ProximityGrid {
    cell_size: f32,
    inv_cell_size: f32,
    pool: Vec<Item>,
    pool_size: usize,
    buckets: Vec<u32>,
    bounds: [i32; 4],
}

fn hash_pos2(x: i32, y: i32, n: usize) -> usize {
    ((x.wrapping_mul(73_856_093) ^ y.wrapping_mul(19_349_663)) as u32 as usize) & (n - 1)
}

impl ProximityGrid {
    /// Creates a grid holding up to `pool_size` cell entries.
    pub fn new(pool_size: usize, cell_size: f32) -> Result<Self> {
        if pool_size == 0 || pool_size >= NULL_ITEM as usize {
            return Err(Error::invalid_param(format!("invalid pool size {pool_size}")));
        }
        if !(cell_size.is_finite() && cell_size > 0.0) {
            return Err(Error::invalid_param(format!("invalid cell size {cell_size}")));
        }

        let bucket_count = pool_size.next_power_of_two();
        let mut grid = Self {
            cell_size,
            inv_cell_size: 1.0 / cell_size,
            pool: Vec::with_capacity(pool_size),
            pool_size,
            buckets: vec![NULL_ITEM; bucket_count],
            bounds: [0; 4],
        };
        grid.clear();
        Ok(grid)
    }

    /// Removes all items, keeping the allocations.
    pub fn clear(&mut self) {
        self.buckets.fill(NULL_ITEM);
        self.pool.clear();
        self.bounds = [i32::MAX, i32::MAX, i32::MIN, i32::MIN];
    }

    fn cell_range(&self, minx: f32, miny: f32, maxx: f32, maxy: f32) -> (i32, i32, i32, i32) {
        (
            (minx * self.inv_cell_size).floor() as i32,
            (miny * self.inv_cell_size).floor() as i32,
            (maxx * self.inv_cell_size).floor() as i32,
            (maxy * self.inv_cell_size).floor() as i32,
        )
    }

    /// Inserts `id` into every cell its box touches.
    ///
    /// Returns false when the pool ran out before all cells were filled.
    pub fn add_item(&mut self, id: usize, minx: f32, miny: f32, maxx: f32, maxy: f32) -> bool {
        let (iminx, iminy, imaxx, imaxy) = self.cell_range(minx, miny, maxx, maxy);

        self.bounds[0] = self.bounds[0].min(iminx);
        self.bounds[1] = self.bounds[1].min(iminy);
        self.bounds[2] = self.bounds[2].max(imaxx);
        self.bounds[3] = self.bounds[3].max(imaxy);

        for y in iminy..=imaxy {
            for x in iminx..=imaxx {
                if self.pool.len() >= self.pool_size {
                    return false;
                }
                let h = hash_pos2(x, y, self.buckets.len());
                let idx = self.pool.len() as u32;
                self.pool.push(Item {
                    id,
                    x,
                    y,
                    next: self.buckets[h],
                });
                self.buckets[h] = idx;
            }
        }
        true
    }

    /// Collects the distinct ids stored in the cells overlapping the box.
    ///
    /// Stops when `ids` is full and returns the number written.
    pub fn query_items(&self, minx: f32, miny: f32, maxx: f32, maxy: f32, ids: &mut [usize]) -> usize {
        let (iminx, iminy, imaxx, imaxy) = self.cell_range(minx, miny, maxx, maxy);

        let mut n = 0;
        for y in iminy..=imaxy {
            for x in iminx..=imaxx {
                let h = hash_pos2(x, y, self.buckets.len());
                let mut idx = self.buckets[h];
                while idx != NULL_ITEM {
                    let item = &self.pool[idx as usize];
                    if item.x == x && item.y == y && !ids[..n].contains(&item.id) {
                        if n >= ids.len() {
                            return n;
                        }
                        ids[n] = item.id;
                        n += 1;
                    }
                    idx = item.next;
                }
            }
        }
        n
    }

    /// Number of items stored in cell `(x, y)`.
    pub fn get_item_count_at(&self, x: i32, y: i32) -> usize {
        let h = hash_pos2(x, y, self.buckets.len());
        let mut n = 0;
        let mut idx = self.buckets[h];
        while idx != NULL_ITEM {
            let item = &self.pool[idx as usize];
            if item.x == x && item.y == y {
                n += 1;
            }
            idx = item.next;
        }
        n
    }

    /// Cell bounds of everything added since the last clear, as
    /// `[minx, miny, maxx, maxy]`.
    pub fn bounds(&self) -> [i32; 4] {
        self.bounds
    }

    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }

    /// Cell entries in use.
    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_validates() {
        assert!(ProximityGrid::new(0, 1.0).is_err());
        assert!(ProximityGrid::new(16, 0.0).is_err());
        assert!(ProximityGrid::new(16, f32::NAN).is_err());
        assert!(ProximityGrid::new(16, 1.0).is_ok());
    }

    #[test]
    fn test_item_spanning_cells_is_stored_in_each() -> Result<()> {
        let mut grid = ProximityGrid::new(32, 1.0)?;
        assert!(grid.add_item(7, 0.5, 0.5, 1.5, 1.5));
        assert_eq!(grid.len(), 4);
        for (x, y) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
            assert_eq!(grid.get_item_count_at(x, y), 1, "cell ({x}, {y})");
        }
        assert_eq!(grid.get_item_count_at(2, 2), 0);
        assert_eq!(grid.bounds(), [0, 0, 1, 1]);

        // Reported once even though every queried cell holds it.
        let mut ids = [0; 8];
        assert_eq!(grid.query_items(-1.0, -1.0, 3.0, 3.0, &mut ids), 1);
        assert_eq!(ids[0], 7);
        Ok(())
    }

    #[test]
    fn test_query_only_sees_overlapping_cells() -> Result<()> {
        let mut grid = ProximityGrid::new(64, 2.0)?;
        grid.add_item(1, 0.0, 0.0, 0.5, 0.5);
        grid.add_item(2, 10.0, 10.0, 10.5, 10.5);
        grid.add_item(3, -5.0, -5.0, -4.5, -4.5);

        let mut ids = [0; 8];
        let n = grid.query_items(-1.0, -1.0, 1.0, 1.0, &mut ids);
        assert_eq!(&ids[..n], &[1]);

        let n = grid.query_items(-6.0, -6.0, 11.0, 11.0, &mut ids);
        let mut found = ids[..n].to_vec();
        found.sort_unstable();
        assert_eq!(found, vec![1, 2, 3]);
        assert_eq!(grid.bounds(), [-3, -3, 5, 5]);
        Ok(())
    }

    #[test]
    fn test_output_buffer_limits_results() -> Result<()> {
        let mut grid = ProximityGrid::new(64, 1.0)?;
        for id in 0..5 {
            grid.add_item(id, 0.1, 0.1, 0.2, 0.2);
        }
        let mut ids = [usize::MAX; 3];
        assert_eq!(grid.query_items(0.0, 0.0, 0.5, 0.5, &mut ids), 3);
        assert_eq!(grid.get_item_count_at(0, 0), 5);
        Ok(())
    }

    #[test]
    fn test_pool_exhaustion_and_clear() -> Result<()> {
        let mut grid = ProximityGrid::new(3, 1.0)?;
        // Needs four cells.
        assert!(!grid.add_item(1, 0.5, 0.5, 1.5, 1.5));
        assert_eq!(grid.len(), 3);
        assert!(!grid.add_item(2, 5.0, 5.0, 5.1, 5.1));

        grid.clear();
        assert!(grid.is_empty());
        assert_eq!(grid.get_item_count_at(0, 0), 0);
        assert!(grid.add_item(2, 5.0, 5.0, 5.1, 5.1));
        assert_eq!(grid.get_item_count_at(5, 5), 1);
        Ok(())
    }
}
