use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::engine::Task;
use crate::tile::TileId;

/// Handle of an allocated slot, valid until it is passed to
/// [`TileStorage::delete_slot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(usize);

impl SlotId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Default)]
struct SlotTag {
    id: Option<TileId>,
    task: Weak<Task>,
}

/// One storage unit of a [`TileStorage`] pool.
///
/// The payload is guarded by a read/write lock: production tasks write it,
/// consumers read it, and neither can observe a half-written tile. Every
/// allocation bumps the slot's generation, so a consumer that kept a handle
/// across an eviction can tell that the payload now belongs to another tile.
pub struct Slot<T> {
    index: usize,
    generation: AtomicU64,
    tag: Mutex<SlotTag>,
    data: RwLock<T>,
}

impl<T> Slot<T> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// The tile currently stored in this slot.
    pub fn id(&self) -> Option<TileId> {
        self.tag.lock().id
    }

    /// The task responsible for filling this slot, if it is still alive.
    pub fn task(&self) -> Option<Arc<Task>> {
        self.tag.lock().task.upgrade()
    }

    pub(crate) fn set_tag(&self, id: TileId, task: &Arc<Task>) {
        let mut tag = self.tag.lock();
        tag.id = Some(id);
        tag.task = Arc::downgrade(task);
    }

    fn clear_tag(&self) {
        *self.tag.lock() = SlotTag::default();
    }

    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.data.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.data.write()
    }
}

/// A fixed-capacity pool of slots with an index-based free list.
///
/// The pool is not synchronized: its owner serializes access.
pub struct TileStorage<T> {
    slots: Vec<Arc<Slot<T>>>,
    free: Vec<usize>,
    allocated: Vec<bool>,
}

impl<T> TileStorage<T> {
    /// Creates `capacity` slots, initializing each payload with `init(index)`.
    pub fn new(capacity: usize, mut init: impl FnMut(usize) -> T) -> Self {
        let slots = (0..capacity)
            .map(|index| {
                Arc::new(Slot {
                    index,
                    generation: AtomicU64::new(0),
                    tag: Mutex::new(SlotTag::default()),
                    data: RwLock::new(init(index)),
                })
            })
            .collect();

        Self {
            slots,
            free: (0..capacity).rev().collect(),
            allocated: vec![false; capacity],
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn free_slots(&self) -> usize {
        self.free.len()
    }

    /// Takes a free slot, or returns `None` if every slot is in use.
    pub fn new_slot(&mut self) -> Option<SlotId> {
        let index = self.free.pop()?;
        self.allocated[index] = true;
        self.slots[index].generation.fetch_add(1, Ordering::AcqRel);
        Some(SlotId(index))
    }

    /// Returns a slot to the pool.
    ///
    /// # Panics
    /// Panics if the slot is already free.
    pub fn delete_slot(&mut self, slot: SlotId) {
        assert!(self.allocated[slot.0], "slot {} is already free", slot.0);
        self.allocated[slot.0] = false;
        self.slots[slot.0].clear_tag();
        self.free.push(slot.0);
    }

    pub fn slot(&self, slot: SlotId) -> &Arc<Slot<T>> {
        &self.slots[slot.0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_until_exhausted() {
        let mut storage = TileStorage::new(2, |i| i * 10);
        assert_eq!(storage.capacity(), 2);

        let a = storage.new_slot().unwrap();
        let b = storage.new_slot().unwrap();
        assert_ne!(a, b);
        assert_eq!(a.index(), 0);
        assert_eq!(*storage.slot(b).read(), 10);
        assert!(storage.new_slot().is_none());
        assert_eq!(storage.free_slots(), 0);

        storage.delete_slot(a);
        assert_eq!(storage.free_slots(), 1);
        assert_eq!(storage.new_slot(), Some(a));
    }

    #[test]
    fn reallocation_bumps_generation_and_clears_tag() {
        let mut storage = TileStorage::new(1, |_| 0u8);
        let slot = storage.new_slot().unwrap();
        let handle = storage.slot(slot).clone();
        let first = handle.generation();

        let task = Task::graph();
        let id = TileId::new(crate::tile::ProducerId(1), 2, 3, 4);
        handle.set_tag(id, &task);
        assert_eq!(handle.id(), Some(id));
        assert!(handle.task().is_some());

        storage.delete_slot(slot);
        assert_eq!(handle.id(), None);
        assert!(handle.task().is_none());

        storage.new_slot().unwrap();
        assert!(handle.generation() > first);
    }

    #[test]
    fn payload_is_writable() {
        let mut storage = TileStorage::new(1, |_| Vec::<f32>::new());
        let slot = storage.new_slot().unwrap();
        storage.slot(slot).write().push(1.5);
        assert_eq!(storage.slot(slot).read().as_slice(), &[1.5]);
    }

    #[test]
    #[should_panic(expected = "already free")]
    fn double_delete_panics() {
        let mut storage = TileStorage::new(1, |_| ());
        let slot = storage.new_slot().unwrap();
        storage.delete_slot(slot);
        storage.delete_slot(slot);
    }
}
