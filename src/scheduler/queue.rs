use std::collections::HashMap;

use uuid::Uuid;

use crate::error::{Result, SchedError};
use crate::scheduler::request::WorkerRequest;

/// Pending requests, most urgent first.
///
/// Binary heap over the requests themselves, with a side map from request id
/// to heap position so removal by id is `O(log n)` as well.
#[derive(Debug, Default)]
pub struct RequestQueue {
    heap: Vec<WorkerRequest>,
    pos: HashMap<Uuid, usize>,
}

/// Higher priority first, then earlier submission.
fn before(a: &WorkerRequest, b: &WorkerRequest) -> bool {
    a.priority > b.priority || (a.priority == b.priority && a.seq < b.seq)
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.pos.contains_key(id)
    }

    pub fn get(&self, id: &Uuid) -> Option<&WorkerRequest> {
        self.pos.get(id).map(|&i| &self.heap[i])
    }

    /// Insert a request. A request whose id is already queued is answered
    /// with [`SchedError::DuplicateRequest`] and dropped.
    pub fn push(&mut self, request: WorkerRequest) -> bool {
        if self.pos.contains_key(&request.sched_id) {
            tracing::warn!(sched_id = %request.sched_id, "Duplicate request id, rejecting");
            let id = request.sched_id;
            request.respond(Err(SchedError::DuplicateRequest(id)));
            return false;
        }

        let i = self.heap.len();
        self.pos.insert(request.sched_id, i);
        self.heap.push(request);
        self.sift_up(i);
        true
    }

    pub fn peek(&self) -> Option<&WorkerRequest> {
        self.heap.first()
    }

    pub fn pop(&mut self) -> Option<WorkerRequest> {
        if self.heap.is_empty() {
            return None;
        }
        Some(self.remove_at(0))
    }

    /// Take a request out of the queue without answering it.
    pub fn take(&mut self, id: &Uuid) -> Option<WorkerRequest> {
        let i = *self.pos.get(id)?;
        Some(self.remove_at(i))
    }

    /// Remove a queued request and answer its caller with
    /// [`SchedError::RequestRemoved`].
    pub fn remove(&mut self, id: &Uuid) -> Result<()> {
        let request = self.take(id).ok_or(SchedError::RequestNotFound(*id))?;
        request.respond(Err(SchedError::RequestRemoved));
        Ok(())
    }

    /// Requests in dispatch order. Does not modify the queue.
    pub fn ordered(&self) -> Vec<&WorkerRequest> {
        let mut out: Vec<&WorkerRequest> = self.heap.iter().collect();
        out.sort_by(|a, b| (-(a.priority as i64), a.seq).cmp(&(-(b.priority as i64), b.seq)));
        out
    }

    /// Empty the queue, in dispatch order.
    pub fn drain(&mut self) -> Vec<WorkerRequest> {
        let mut out = Vec::with_capacity(self.heap.len());
        while let Some(request) = self.pop() {
            out.push(request);
        }
        out
    }

    fn remove_at(&mut self, i: usize) -> WorkerRequest {
        let request = self.heap.swap_remove(i);
        self.pos.remove(&request.sched_id);

        if i < self.heap.len() {
            self.pos.insert(self.heap[i].sched_id, i);
            self.sift_down(i);
            self.sift_up(i);
        }
        request
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.heap.swap(a, b);
        self.pos.insert(self.heap[a].sched_id, a);
        self.pos.insert(self.heap[b].sched_id, b);
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if !before(&self.heap[i], &self.heap[parent]) {
                break;
            }
            self.swap(i, parent);
            i = parent;
        }
    }

    fn sift_down(&mut self, mut i: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * i + 1;
            let right = left + 1;
            let mut best = i;
            if left < len && before(&self.heap[left], &self.heap[best]) {
                best = left;
            }
            if right < len && before(&self.heap[right], &self.heap[best]) {
                best = right;
            }
            if best == i {
                break;
            }
            self.swap(i, best);
            i = best;
        }
    }
}
