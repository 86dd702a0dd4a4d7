//! Recyclable storage for internal requests.

use super::{FileRequest, RequestId};
use std::ops::{Index, IndexMut};

struct Slot {
    generation: u32,
    request: Option<FileRequest>,
}

/// Slot arena with a free list. Recycling a slot bumps its generation so old
/// ids stop resolving.
#[derive(Default)]
pub struct RequestArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl RequestArena {
    /// Empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty arena with room for `capacity` requests.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::with_capacity(capacity),
            live: 0,
        }
    }

    /// Store `request`, reusing a recycled slot when one is available.
    pub fn insert(&mut self, request: FileRequest) -> RequestId {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.request = Some(request);
            return RequestId::new(index, slot.generation);
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            request: Some(request),
        });
        RequestId::new(index, 0)
    }

    /// Remove a request and recycle its slot.
    pub fn remove(&mut self, id: RequestId) -> Option<FileRequest> {
        let slot = self.slots.get_mut(id.index() as usize)?;
        if slot.generation != id.generation() || slot.request.is_none() {
            return None;
        }
        let request = slot.request.take();
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index());
        self.live -= 1;
        request
    }

    /// Live request behind `id`. Stale ids yield `None`.
    pub fn get(&self, id: RequestId) -> Option<&FileRequest> {
        self.slots
            .get(id.index() as usize)
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.request.as_ref())
    }

    /// Live request behind `id`, mutably.
    pub fn get_mut(&mut self, id: RequestId) -> Option<&mut FileRequest> {
        self.slots
            .get_mut(id.index() as usize)
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.request.as_mut())
    }

    /// Whether `id` names a live request.
    pub fn contains(&self, id: RequestId) -> bool {
        self.get(id).is_some()
    }

    /// Number of live requests.
    pub fn len(&self) -> usize {
        self.live
    }

    /// Whether no request is live.
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Slots allocated over the arena's lifetime (live + recycled).
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

impl Index<RequestId> for RequestArena {
    type Output = FileRequest;

    fn index(&self, id: RequestId) -> &FileRequest {
        match self.get(id) {
            Some(request) => request,
            None => panic!("stale request id {:?}", id),
        }
    }
}

impl IndexMut<RequestId> for RequestArena {
    fn index_mut(&mut self, id: RequestId) -> &mut FileRequest {
        match self.get_mut(id) {
            Some(request) => request,
            None => panic!("stale request id {:?}", id),
        }
    }
}
