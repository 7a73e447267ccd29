//! Resource lifetime tracking.
//!
//! [`ResourceTracker`] is an arena of records indexed by [`ResourceId`].
//! Each record counts how many recorded command buffers reference the
//! resource (*bound*) and, per global queue index, how many executing
//! submissions read or write it (*used*). A resource is only freed once
//! it has been destroyed *and* both counts are zero; until then
//! [`destroy`](ResourceTracker::destroy) defers the release.
//!
//! The tracker is deliberately free of any Vulkan types so the whole
//! state machine can be unit tested. Callers hold it behind the same lock
//! used to record and submit command streams.

use bitflags::bitflags;

use crate::queue::{MAX_GLOBAL_QUEUES, QueueId, SyncMask};

bitflags! {
    /// Kinds of access a command stream makes to a resource.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Access: u8 {
        const READ = 1;
        const WRITE = 1 << 1;
    }
}

/// Generational handle into a [`ResourceTracker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId {
    index: u32,
    generation: u32,
}

/// Result of dropping a reference to a resource.
#[derive(Debug)]
pub enum Release<T> {
    /// Other bound or executing references remain.
    Pending,
    /// No references remain and the resource is still alive.
    Idle,
    /// The resource had been destroyed; this was its last reference.
    Freed(T),
}

/// Result of [`ResourceTracker::destroy`].
#[derive(Debug)]
pub enum Disposal<T> {
    Freed(T),
    Deferred,
}

#[derive(Debug)]
struct Record<T> {
    payload: T,
    bound: u32,
    used: u32,
    reads: [u16; MAX_GLOBAL_QUEUES],
    writes: [u16; MAX_GLOBAL_QUEUES],
    destroyed: bool,
}

impl<T> Record<T> {
    fn mask(&self, access: Access) -> SyncMask {
        let mut bits = 0u32;
        for queue in 0..MAX_GLOBAL_QUEUES {
            let read = access.contains(Access::READ) && self.reads[queue] > 0;
            let write = access.contains(Access::WRITE) && self.writes[queue] > 0;
            if read || write {
                bits |= 1 << queue;
            }
        }
        SyncMask::from_bits(bits)
    }

    fn is_idle(&self) -> bool {
        self.bound == 0 && self.used == 0
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    record: Option<Record<T>>,
}

#[derive(Debug)]
pub struct ResourceTracker<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
}

impl<T> Default for ResourceTracker<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }
}

impl<T> ResourceTracker<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, payload: T) -> ResourceId {
        let record = Record {
            payload,
            bound: 0,
            used: 0,
            reads: [0; MAX_GLOBAL_QUEUES],
            writes: [0; MAX_GLOBAL_QUEUES],
            destroyed: false,
        };
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.record = Some(record);
            ResourceId {
                index,
                generation: slot.generation,
            }
        } else {
            self.slots.push(Slot {
                generation: 0,
                record: Some(record),
            });
            ResourceId {
                index: (self.slots.len() - 1) as u32,
                generation: 0,
            }
        }
    }

    fn record(&self, id: ResourceId) -> Option<&Record<T>> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.record.as_ref()
    }

    fn record_mut(&mut self, id: ResourceId) -> Option<&mut Record<T>> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.record.as_mut()
    }

    fn remove(&mut self, id: ResourceId) -> Option<T> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let record = slot.record.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;
        Some(record.payload)
    }

    /// Payload of a live (or destroyed but still referenced) resource.
    pub fn get(&self, id: ResourceId) -> Option<&T> {
        self.record(id).map(|r| &r.payload)
    }

    pub fn get_mut(&mut self, id: ResourceId) -> Option<&mut T> {
        self.record_mut(id).map(|r| &mut r.payload)
    }

    pub fn contains(&self, id: ResourceId) -> bool {
        self.record(id).is_some()
    }

    /// Number of records that have not been freed yet.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// A command stream started referencing `id`.
    pub fn notify_bound(&mut self, id: ResourceId) {
        match self.record_mut(id) {
            Some(record) => record.bound += 1,
            None => debug_assert!(false, "notify_bound on unknown {id:?}"),
        }
    }

    /// A command stream referencing `id` was submitted to `queue`.
    pub fn notify_used(&mut self, id: ResourceId, queue: QueueId, access: Access) {
        let Some(record) = self.record_mut(id) else {
            debug_assert!(false, "notify_used on unknown {id:?}");
            return;
        };
        let q = queue.global_index() as usize;
        record.used += 1;
        if access.contains(Access::READ) {
            record.reads[q] += 1;
        }
        if access.contains(Access::WRITE) {
            record.writes[q] += 1;
        }
    }

    /// A submission on `queue` that used `id` finished executing.
    pub fn notify_done(
        &mut self,
        id: ResourceId,
        queue: QueueId,
        access: Access,
    ) -> Release<T> {
        let Some(record) = self.record_mut(id) else {
            debug_assert!(false, "notify_done on unknown {id:?}");
            return Release::Pending;
        };
        let q = queue.global_index() as usize;
        debug_assert!(record.used > 0 && record.bound > 0);
        record.used = record.used.saturating_sub(1);
        record.bound = record.bound.saturating_sub(1);
        if access.contains(Access::READ) {
            record.reads[q] = record.reads[q].saturating_sub(1);
        }
        if access.contains(Access::WRITE) {
            record.writes[q] = record.writes[q].saturating_sub(1);
        }
        self.release(id)
    }

    /// A command stream that bound `id` was discarded without submission.
    pub fn notify_unbound(&mut self, id: ResourceId) -> Release<T> {
        let Some(record) = self.record_mut(id) else {
            debug_assert!(false, "notify_unbound on unknown {id:?}");
            return Release::Pending;
        };
        debug_assert!(record.bound > record.used);
        record.bound = record.bound.saturating_sub(1);
        self.release(id)
    }

    fn release(&mut self, id: ResourceId) -> Release<T> {
        match self.record(id) {
            Some(record) if record.is_idle() && record.destroyed => {
                self.remove(id).map_or(Release::Pending, Release::Freed)
            }
            Some(record) if record.is_idle() => Release::Idle,
            _ => Release::Pending,
        }
    }

    /// Destroy `id`, freeing it now if nothing references it.
    pub fn destroy(&mut self, id: ResourceId) -> Disposal<T> {
        let Some(record) = self.record_mut(id) else {
            return Disposal::Deferred;
        };
        if record.is_idle() {
            match self.remove(id) {
                Some(payload) => Disposal::Freed(payload),
                None => Disposal::Deferred,
            }
        } else {
            record.destroyed = true;
            Disposal::Deferred
        }
    }

    /// Every reference held by a finished submission on `queue` is
    /// dropped. Returns what happened to each resource, in order.
    pub fn retire(
        &mut self,
        queue: QueueId,
        uses: impl IntoIterator<Item = (ResourceId, Access)>,
    ) -> Vec<(ResourceId, Release<T>)> {
        uses.into_iter()
            .map(|(id, access)| (id, self.notify_done(id, queue, access)))
            .collect()
    }

    /// Drop the bound references of a stream that will never execute.
    pub fn unbind_all(
        &mut self,
        ids: impl IntoIterator<Item = ResourceId>,
    ) -> Vec<(ResourceId, Release<T>)> {
        ids.into_iter()
            .map(|id| (id, self.notify_unbound(id)))
            .collect()
    }

    /// Queues with outstanding accesses of the given kinds.
    pub fn use_mask(&self, id: ResourceId, access: Access) -> SyncMask {
        self.record(id).map_or(SyncMask::empty(), |r| r.mask(access))
    }

    /// Queues a submission on `queue` must wait for before it runs.
    ///
    /// Reading waits on every queue still writing the resource; writing
    /// also waits on the readers. `explicit` is added as is and `queue`
    /// itself is always left out, as same-queue ordering is implicit.
    pub fn hazard_mask(
        &self,
        queue: QueueId,
        explicit: SyncMask,
        uses: impl IntoIterator<Item = (ResourceId, Access)>,
    ) -> SyncMask {
        let mut wait = explicit;
        for (id, access) in uses {
            let conflicts = if access.contains(Access::WRITE) {
                Access::READ | Access::WRITE
            } else {
                Access::WRITE
            };
            wait |= self.use_mask(id, conflicts);
        }
        wait.without(queue)
    }

    pub fn is_in_use(&self, id: ResourceId) -> bool {
        !self.use_mask(id, Access::all()).is_empty()
    }

    pub fn is_bound(&self, id: ResourceId) -> bool {
        self.bound_count(id) > 0
    }

    pub fn is_used(&self, id: ResourceId) -> bool {
        self.use_count(id) > 0
    }

    pub fn bound_count(&self, id: ResourceId) -> u32 {
        self.record(id).map_or(0, |r| r.bound)
    }

    pub fn use_count(&self, id: ResourceId) -> u32 {
        self.record(id).map_or(0, |r| r.used)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueType;

    fn gfx() -> QueueId {
        QueueId::primary(QueueType::Graphics)
    }

    fn compute() -> QueueId {
        QueueId::primary(QueueType::Compute)
    }

    #[test]
    fn bound_then_used_then_done() {
        let mut tracker = ResourceTracker::new();
        let id = tracker.insert("vb");

        tracker.notify_bound(id);
        assert!(tracker.is_bound(id));
        assert!(!tracker.is_used(id));

        tracker.notify_used(id, gfx(), Access::READ);
        assert_eq!(tracker.use_mask(id, Access::READ), SyncMask::of(gfx()));
        assert!(tracker.use_mask(id, Access::WRITE).is_empty());

        assert!(matches!(
            tracker.notify_done(id, gfx(), Access::READ),
            Release::Idle
        ));
        assert!(!tracker.is_bound(id));
        assert!(tracker.use_mask(id, Access::all()).is_empty());
    }

    #[test]
    fn destroy_waits_for_bound_references() {
        let mut tracker = ResourceTracker::new();
        let id = tracker.insert(7u32);
        tracker.notify_bound(id);

        assert!(matches!(tracker.destroy(id), Disposal::Deferred));
        assert_eq!(tracker.get(id), Some(&7));

        tracker.notify_used(id, compute(), Access::WRITE);
        assert!(matches!(
            tracker.notify_done(id, compute(), Access::WRITE),
            Release::Freed(7)
        ));
        assert!(!tracker.contains(id));
        assert!(tracker.is_empty());
    }

    #[test]
    fn discarded_stream_unbinds() {
        let mut tracker = ResourceTracker::new();
        let id = tracker.insert(());
        tracker.notify_bound(id);
        tracker.notify_bound(id);
        assert!(matches!(tracker.notify_unbound(id), Release::Pending));
        assert!(matches!(tracker.notify_unbound(id), Release::Idle));
        assert!(matches!(tracker.destroy(id), Disposal::Freed(())));
    }

    #[test]
    fn per_queue_masks_are_counted() {
        let mut tracker = ResourceTracker::new();
        let id = tracker.insert(());
        for _ in 0..2 {
            tracker.notify_bound(id);
            tracker.notify_used(id, gfx(), Access::READ);
        }
        tracker.notify_bound(id);
        tracker.notify_used(id, compute(), Access::READ | Access::WRITE);

        let readers = tracker.use_mask(id, Access::READ);
        assert!(readers.contains(gfx()) && readers.contains(compute()));
        assert_eq!(tracker.use_mask(id, Access::WRITE), SyncMask::of(compute()));

        let _ = tracker.notify_done(id, gfx(), Access::READ);
        assert!(tracker.use_mask(id, Access::READ).contains(gfx()));
        let _ = tracker.notify_done(id, gfx(), Access::READ);
        assert!(!tracker.use_mask(id, Access::READ).contains(gfx()));
        assert_eq!(tracker.use_count(id), 1);
    }

    #[test]
    fn destroy_is_deferred_while_only_bound() {
        let mut tracker = ResourceTracker::new();
        let id = tracker.insert("uniforms");
        tracker.notify_bound(id);

        assert!(!tracker.is_in_use(id));
        assert!(matches!(tracker.destroy(id), Disposal::Deferred));
        assert_eq!(tracker.get(id), Some(&"uniforms"));

        let released = tracker.unbind_all([id]);
        assert_eq!(released.len(), 1);
        assert!(matches!(released[0].1, Release::Freed("uniforms")));
        assert!(tracker.is_empty());
    }

    #[test]
    fn retire_releases_each_use_of_a_submission() {
        let mut tracker = ResourceTracker::new();
        let src = tracker.insert("src");
        let dst = tracker.insert("dst");
        for (id, access) in [(src, Access::READ), (dst, Access::WRITE)] {
            tracker.notify_bound(id);
            tracker.notify_used(id, compute(), access);
        }
        assert!(matches!(tracker.destroy(src), Disposal::Deferred));

        let released = tracker.retire(compute(), [(src, Access::READ), (dst, Access::WRITE)]);
        assert!(matches!(released[0].1, Release::Freed("src")));
        assert!(matches!(released[1].1, Release::Idle));
        assert!(!tracker.is_in_use(dst));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn reads_wait_on_writers_and_writes_wait_on_everyone() {
        let upload = QueueId::primary(QueueType::Upload);
        let mut tracker = ResourceTracker::new();
        let written = tracker.insert(());
        let read = tracker.insert(());
        tracker.notify_bound(written);
        tracker.notify_used(written, upload, Access::WRITE);
        tracker.notify_bound(read);
        tracker.notify_used(read, compute(), Access::READ);

        let mask = tracker.hazard_mask(gfx(), SyncMask::empty(), [(written, Access::READ)]);
        assert_eq!(mask, SyncMask::of(upload));

        let mask = tracker.hazard_mask(gfx(), SyncMask::empty(), [(read, Access::READ)]);
        assert!(mask.is_empty());

        let mask = tracker.hazard_mask(gfx(), SyncMask::empty(), [(read, Access::WRITE)]);
        assert_eq!(mask, SyncMask::of(compute()));
    }

    #[test]
    fn hazard_mask_keeps_explicit_waits_but_not_own_queue() {
        let mut tracker = ResourceTracker::new();
        let id = tracker.insert(());
        tracker.notify_bound(id);
        tracker.notify_used(id, gfx(), Access::WRITE);

        let upload = QueueId::primary(QueueType::Upload);
        let mask = tracker.hazard_mask(gfx(), SyncMask::of(upload), [(id, Access::READ)]);
        assert_eq!(mask, SyncMask::of(upload));

        let mask = tracker.hazard_mask(compute(), SyncMask::of(compute()), [(id, Access::READ)]);
        assert_eq!(mask, SyncMask::of(gfx()));
    }

    #[test]
    fn stale_ids_are_rejected_after_reuse() {
        let mut tracker = ResourceTracker::new();
        let old = tracker.insert("a");
        assert!(matches!(tracker.destroy(old), Disposal::Freed("a")));
        let new = tracker.insert("b");
        assert_ne!(old, new);
        assert_eq!(tracker.get(old), None);
        assert_eq!(tracker.get(new), Some(&"b"));
        assert!(!tracker.is_bound(old));
    }
}
