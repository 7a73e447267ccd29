//! Queue identities and cross-queue sync masks.
//!
//! Every queue the backend submits to has a *global index*
//! (`type * MAX_QUEUES_PER_TYPE + index`). A [`SyncMask`] is a bitset over
//! global indices naming the queues a piece of work must wait on.

use std::fmt;

/// Upper bound on queues of a single [`QueueType`].
pub const MAX_QUEUES_PER_TYPE: u32 = 8;

/// Number of distinct global queue indices.
pub const MAX_GLOBAL_QUEUES: usize = QueueType::ALL.len() * MAX_QUEUES_PER_TYPE as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueueType {
    Graphics = 0,
    Compute = 1,
    Upload = 2,
}

impl QueueType {
    pub const ALL: [QueueType; 3] =
        [QueueType::Graphics, QueueType::Compute, QueueType::Upload];

    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId {
    pub ty: QueueType,
    pub index: u32,
}

impl QueueId {
    pub fn new(ty: QueueType, index: u32) -> Self {
        debug_assert!(index < MAX_QUEUES_PER_TYPE);
        Self { ty, index }
    }

    /// The first (and currently only) queue of `ty`.
    pub fn primary(ty: QueueType) -> Self {
        Self::new(ty, 0)
    }

    pub fn global_index(self) -> u32 {
        self.ty as u32 * MAX_QUEUES_PER_TYPE + self.index
    }

    pub fn from_global_index(global: u32) -> Option<Self> {
        let ty = *QueueType::ALL.get((global / MAX_QUEUES_PER_TYPE) as usize)?;
        Some(Self::new(ty, global % MAX_QUEUES_PER_TYPE))
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}[{}]", self.ty, self.index)
    }
}

/// Bitset of global queue indices.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SyncMask(u32);

impl SyncMask {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn of(queue: QueueId) -> Self {
        Self(1 << queue.global_index())
    }

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, queue: QueueId) -> bool {
        self.0 & (1 << queue.global_index()) != 0
    }

    pub fn insert(&mut self, queue: QueueId) {
        self.0 |= 1 << queue.global_index();
    }

    pub fn without(self, queue: QueueId) -> Self {
        Self(self.0 & !(1 << queue.global_index()))
    }

    pub fn queues(self) -> impl Iterator<Item = QueueId> {
        (0..MAX_GLOBAL_QUEUES as u32)
            .filter(move |bit| self.0 & (1 << bit) != 0)
            .filter_map(QueueId::from_global_index)
    }
}

impl std::ops::BitOr for SyncMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for SyncMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for SyncMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.queues()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_index_roundtrip() {
        let q = QueueId::new(QueueType::Upload, 3);
        assert_eq!(q.global_index(), 19);
        assert_eq!(QueueId::from_global_index(19), Some(q));
        assert_eq!(QueueId::from_global_index(MAX_GLOBAL_QUEUES as u32), None);
    }

    #[test]
    fn mask_set_operations() {
        let gfx = QueueId::primary(QueueType::Graphics);
        let compute = QueueId::primary(QueueType::Compute);
        let mut mask = SyncMask::of(gfx);
        mask |= SyncMask::of(compute);
        assert!(mask.contains(gfx));
        assert!(mask.contains(compute));
        assert_eq!(mask.queues().collect::<Vec<_>>(), [gfx, compute]);

        let others = mask.without(gfx);
        assert!(!others.contains(gfx));
        assert_eq!(others, SyncMask::of(compute));
        assert!(others.without(compute).is_empty());
    }
}
