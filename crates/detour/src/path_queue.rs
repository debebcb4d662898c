//! Asynchronous path requests
//!
//! Requests are queued in fixed slots and searched one at a time with the
//! sliced A*, spending at most `max_iters` iterations per [`PathQueue::update`].
//! The queue owns its [`QueryBuffers`] and borrows the mesh only for the
//! duration of an update, so the mesh may change between frames. A search
//! whose polygons disappear fails instead of touching stale data.
//!
//! Handles carry the slot generation; once a result is fetched or the
//! request cancelled the slot moves to the next generation and old handles
//! read as [`PathQueueStatus::Invalid`].

use detour_common::{Error, Result};
use log::{debug, trace, warn};

use super::{DtStatus, NavMesh, NavMeshQuery, PolyRef, QueryBuffers, QueryFilter, QueryResult};

const SLOT_BITS: u32 = 8;
const SLOT_MASK: u32 = (1 << SLOT_BITS) - 1;
const GENERATION_MASK: u32 = (1 << (32 - SLOT_BITS)) - 1;

/// Handle of a queued path request: `slot | generation << 8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct PathQueueRef(u32);

impl PathQueueRef {
    pub const INVALID: PathQueueRef = PathQueueRef(0);

    fn new(slot: usize, generation: u32) -> Self {
        Self((slot as u32 & SLOT_MASK) | (generation << SLOT_BITS))
    }

    pub fn slot(self) -> usize {
        (self.0 & SLOT_MASK) as usize
    }

    pub fn generation(self) -> u32 {
        self.0 >> SLOT_BITS
    }

    pub fn is_invalid(self) -> bool {
        self.0 == 0
    }

    pub fn id(self) -> u32 {
        self.0
    }
}

/// Status of a request as seen through its handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathQueueStatus {
    /// Waiting for or being searched
    InProgress,
    /// Result available; fetch it with `get_path_result`
    Ready,
    /// Search failed; fetching the result releases the slot
    Failed,
    /// Unknown, stale or already consumed handle
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Pending,
    Searching,
    Ready,
    Failed,
}

#[derive(Debug, Clone)]
struct PathQuery {
    generation: u32,
    state: SlotState,
    start_ref: PolyRef,
    end_ref: PolyRef,
    start_pos: [f32; 3],
    end_pos: [f32; 3],
    filter: QueryFilter,
    path: Vec<PolyRef>,
    result: QueryResult,
}

impl PathQuery {
    fn new(max_path_size: usize) -> Self {
        Self {
            generation: 1,
            state: SlotState::Free,
            start_ref: PolyRef::NULL,
            end_ref: PolyRef::NULL,
            start_pos: [0.0; 3],
            end_pos: [0.0; 3],
            filter: QueryFilter::default(),
            path: vec![PolyRef::NULL; max_path_size],
            result: QueryResult::new(0, 0, DtStatus::empty()),
        }
    }

    fn handle(&self, slot: usize) -> PathQueueRef {
        PathQueueRef::new(slot, self.generation)
    }

    fn release(&mut self) {
        self.state = SlotState::Free;
        self.generation = (self.generation + 1) & GENERATION_MASK;
        if self.generation == 0 {
            self.generation = 1;
        }
    }
}

/// Fixed-capacity queue of sliced path searches
#[derive(Debug)]
pub struct PathQueue {
    queries: Vec<PathQuery>,
    queue_head: usize,
    max_path_size: usize,
    buffers: Option<QueryBuffers>,
}

impl PathQueue {
    /// `capacity` slots of at most 256, each returning up to `max_path_size`
    /// polygons from searches of up to `max_search_nodes` nodes.
    pub fn new(max_path_size: usize, max_search_nodes: usize, capacity: usize) -> Result<Self> {
        if max_path_size == 0 {
            return Err(Error::invalid_param("max_path_size must be positive"));
        }
        if capacity == 0 || capacity > SLOT_MASK as usize + 1 {
            return Err(Error::invalid_param(format!("queue capacity {capacity} out of range")));
        }
        Ok(Self {
            queries: (0..capacity).map(|_| PathQuery::new(max_path_size)).collect(),
            queue_head: 0,
            max_path_size,
            buffers: Some(QueryBuffers::new(max_search_nodes)?),
        })
    }

    pub fn max_path_size(&self) -> usize {
        self.max_path_size
    }

    pub fn capacity(&self) -> usize {
        self.queries.len()
    }

    /// Requests not yet consumed or cancelled
    pub fn len(&self) -> usize {
        self.queries.iter().filter(|q| q.state != SlotState::Free).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queues a search. Fails with [`Error::Full`] when every slot is taken.
    pub fn request(
        &mut self,
        start_ref: PolyRef,
        end_ref: PolyRef,
        start_pos: &[f32; 3],
        end_pos: &[f32; 3],
        filter: &QueryFilter,
    ) -> Result<PathQueueRef> {
        let Some(slot) = self.queries.iter().position(|q| q.state == SlotState::Free) else {
            warn!("path queue full ({} slots)", self.queries.len());
            return Err(Error::Full);
        };

        let q = &mut self.queries[slot];
        q.state = SlotState::Pending;
        q.start_ref = start_ref;
        q.end_ref = end_ref;
        q.start_pos = *start_pos;
        q.end_pos = *end_pos;
        q.filter.clone_from(filter);
        q.result = QueryResult::new(0, 0, DtStatus::empty());

        let handle = q.handle(slot);
        debug!("path request {:#x}: {} -> {}", handle.id(), start_ref, end_ref);
        Ok(handle)
    }

    /// Advances the queued searches by at most `max_iters` A* iterations in
    /// total. Only one search is in flight at a time.
    pub fn update(&mut self, nav_mesh: &NavMesh, max_iters: u32) {
        let Some(buffers) = self.buffers.take() else {
            return;
        };
        let mut query = NavMeshQuery::with_buffers(nav_mesh, buffers);

        let mut iter_budget = max_iters;
        let n = self.queries.len();
        for _ in 0..n {
            let slot = self.queue_head % n;
            let q = &mut self.queries[slot];

            if !matches!(q.state, SlotState::Pending | SlotState::Searching) {
                self.queue_head = (self.queue_head + 1) % n;
                continue;
            }

            if q.state == SlotState::Pending {
                match query.init_sliced_find_path(q.start_ref, q.end_ref, &q.start_pos, &q.end_pos, &q.filter) {
                    Ok(_) => q.state = SlotState::Searching,
                    Err(err) => {
                        warn!("path request in slot {slot} failed to start: {err}");
                        q.state = SlotState::Failed;
                    }
                }
            }

            if q.state == SlotState::Searching {
                match query.update_sliced_find_path(iter_budget) {
                    Ok((iters, status)) => {
                        trace!("path request in slot {slot}: {iters} iterations, {status}");
                        iter_budget = iter_budget.saturating_sub(iters);
                        if !status.is_in_progress() {
                            match query.finalize_sliced_find_path(&mut q.path) {
                                Ok(result) => {
                                    q.result = result;
                                    q.state = SlotState::Ready;
                                }
                                Err(err) => {
                                    warn!("path request in slot {slot} failed: {err}");
                                    q.state = SlotState::Failed;
                                }
                            }
                        }
                    }
                    Err(err) => {
                        warn!("path request in slot {slot} failed: {err}");
                        q.state = SlotState::Failed;
                    }
                }
            }

            if iter_budget == 0 {
                break;
            }
            self.queue_head = (self.queue_head + 1) % n;
        }

        self.buffers = Some(query.into_buffers());
    }

    fn slot_of(&self, handle: PathQueueRef) -> Option<usize> {
        let slot = handle.slot();
        let q = self.queries.get(slot)?;
        (!handle.is_invalid() && q.state != SlotState::Free && q.generation == handle.generation()).then_some(slot)
    }

    pub fn get_request_status(&self, handle: PathQueueRef) -> PathQueueStatus {
        match self.slot_of(handle).map(|s| self.queries[s].state) {
            Some(SlotState::Pending | SlotState::Searching) => PathQueueStatus::InProgress,
            Some(SlotState::Ready) => PathQueueStatus::Ready,
            Some(SlotState::Failed) => PathQueueStatus::Failed,
            Some(SlotState::Free) | None => PathQueueStatus::Invalid,
        }
    }

    /// Copies a finished result into `path` and releases the slot.
    ///
    /// A failed request is released too and reported as an error. Requests
    /// still in progress are left untouched.
    pub fn get_path_result(&mut self, handle: PathQueueRef, path: &mut [PolyRef]) -> Result<QueryResult> {
        let slot = self
            .slot_of(handle)
            .ok_or_else(|| Error::invalidated("unknown path request"))?;
        let q = &mut self.queries[slot];

        match q.state {
            SlotState::Ready => {
                let n = q.result.count.min(path.len());
                path[..n].copy_from_slice(&q.path[..n]);
                let mut status = q.result.status;
                if n < q.result.count {
                    status |= DtStatus::BUFFER_TOO_SMALL;
                }
                let required = q.result.required;
                q.release();
                Ok(QueryResult::new(n, required, status))
            }
            SlotState::Failed => {
                q.release();
                Err(Error::Failure("path request failed".into()))
            }
            _ => Err(Error::invalid_param("path request is still in progress")),
        }
    }

    /// Drops a request in any state. Returns false for unknown handles.
    pub fn cancel(&mut self, handle: PathQueueRef) -> bool {
        let Some(slot) = self.slot_of(handle) else {
            return false;
        };
        debug!("path request {:#x} cancelled", handle.id());
        self.queries[slot].release();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_mesh_helpers::grid_nav_mesh;
    use std::borrow::Cow;

    fn poly_at(nav_mesh: &NavMesh, pos: [f32; 3]) -> PolyRef {
        let query = NavMeshQuery::new(nav_mesh);
        query
            .find_nearest_poly(&pos, &[0.5, 2.0, 0.5], &QueryFilter::default())
            .map(|(r, _)| r)
            .unwrap_or(PolyRef::NULL)
    }

    #[test]
    fn test_handle_layout() {
        let h = PathQueueRef::new(5, 3);
        assert_eq!(h.slot(), 5);
        assert_eq!(h.generation(), 3);
        assert_eq!(h.id(), 5 | 3 << 8);
        assert!(PathQueueRef::INVALID.is_invalid());
    }

    #[test]
    fn test_new_validates() {
        assert!(PathQueue::new(0, 64, 4).is_err());
        assert!(PathQueue::new(16, 64, 0).is_err());
        assert!(PathQueue::new(16, 64, 257).is_err());
        assert!(PathQueue::new(16, 0, 4).is_err());
    }

    #[test]
    fn test_request_update_result() -> Result<()> {
        let nav_mesh = grid_nav_mesh(1, 1, 10.0, 5)?;
        let mut queue = PathQueue::new(32, 256, 4)?;
        let start = [1.0, 0.0, 1.0];
        let end = [9.0, 0.0, 9.0];
        let start_ref = poly_at(&nav_mesh, start);
        let end_ref = poly_at(&nav_mesh, end);

        let handle = queue.request(start_ref, end_ref, &start, &end, &QueryFilter::default())?;
        assert_eq!(queue.get_request_status(handle), PathQueueStatus::InProgress);

        // Small budgets take several frames.
        let mut frames = 0;
        while queue.get_request_status(handle) == PathQueueStatus::InProgress {
            queue.update(&nav_mesh, 2);
            frames += 1;
            assert!(frames < 100);
        }
        assert!(frames > 1);
        assert_eq!(queue.get_request_status(handle), PathQueueStatus::Ready);

        let mut path = [PolyRef::NULL; 32];
        let result = queue.get_path_result(handle, &mut path)?;
        assert_eq!(path[0], start_ref);
        assert_eq!(path[result.count - 1], end_ref);
        assert!(!result.is_partial());

        // Consumed.
        assert_eq!(queue.get_request_status(handle), PathQueueStatus::Invalid);
        assert!(queue.get_path_result(handle, &mut path).is_err());
        assert!(queue.is_empty());
        Ok(())
    }

    #[test]
    fn test_full_queue_and_reuse() -> Result<()> {
        let nav_mesh = grid_nav_mesh(1, 1, 10.0, 5)?;
        let mut queue = PathQueue::new(32, 256, 2)?;
        let filter = QueryFilter::default();
        let a = poly_at(&nav_mesh, [1.0, 0.0, 1.0]);
        let b = poly_at(&nav_mesh, [9.0, 0.0, 1.0]);

        let first = queue.request(a, b, &[1.0, 0.0, 1.0], &[9.0, 0.0, 1.0], &filter)?;
        let second = queue.request(b, a, &[9.0, 0.0, 1.0], &[1.0, 0.0, 1.0], &filter)?;
        assert!(matches!(queue.request(a, b, &[0.0; 3], &[0.0; 3], &filter), Err(Error::Full)));
        // Existing requests are unaffected.
        assert_eq!(queue.get_request_status(first), PathQueueStatus::InProgress);
        assert_eq!(queue.get_request_status(second), PathQueueStatus::InProgress);

        assert!(queue.cancel(first));
        assert!(!queue.cancel(first));
        let third = queue.request(a, b, &[1.0, 0.0, 1.0], &[9.0, 0.0, 1.0], &filter)?;
        assert_eq!(third.slot(), first.slot());
        assert_ne!(third, first);
        assert_eq!(queue.get_request_status(first), PathQueueStatus::Invalid);

        queue.update(&nav_mesh, 1000);
        assert_eq!(queue.get_request_status(second), PathQueueStatus::Ready);
        assert_eq!(queue.get_request_status(third), PathQueueStatus::Ready);
        Ok(())
    }

    #[test]
    fn test_invalid_request_fails() -> Result<()> {
        let nav_mesh = grid_nav_mesh(1, 1, 10.0, 2)?;
        let mut queue = PathQueue::new(8, 64, 2)?;
        let a = poly_at(&nav_mesh, [1.0, 0.0, 1.0]);

        let handle = queue.request(a, PolyRef::new(0xdead_beef), &[1.0, 0.0, 1.0], &[0.0; 3], &QueryFilter::default())?;
        queue.update(&nav_mesh, 10);
        assert_eq!(queue.get_request_status(handle), PathQueueStatus::Failed);

        let mut path = [PolyRef::NULL; 8];
        assert!(matches!(queue.get_path_result(handle, &mut path), Err(Error::Failure(Cow::Borrowed(_)))));
        assert_eq!(queue.get_request_status(handle), PathQueueStatus::Invalid);
        assert!(matches!(queue.get_path_result(handle, &mut path), Err(Error::Invalidated(Cow::Borrowed(_)))));
        Ok(())
    }

    #[test]
    fn test_tile_removed_mid_search() -> Result<()> {
        let mut nav_mesh = grid_nav_mesh(2, 1, 10.0, 5)?;
        let mut queue = PathQueue::new(32, 256, 2)?;
        let start = [1.0, 0.0, 5.0];
        let end = [19.0, 0.0, 5.0];
        let start_ref = poly_at(&nav_mesh, start);
        let end_ref = poly_at(&nav_mesh, end);

        let handle = queue.request(start_ref, end_ref, &start, &end, &QueryFilter::default())?;
        queue.update(&nav_mesh, 2);
        assert_eq!(queue.get_request_status(handle), PathQueueStatus::InProgress);

        let right = nav_mesh.get_tile_ref_at(1, 0, 0);
        nav_mesh.remove_tile(right)?;
        queue.update(&nav_mesh, 1000);
        assert_eq!(queue.get_request_status(handle), PathQueueStatus::Failed);
        Ok(())
    }
}
