use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::core::Deadline;
use crate::engine::{Task, Work};
use crate::tile::{Slot, TileCache, TileId};

/// Builds the tasks that fill tile slots.
///
/// Producers must be deterministic: the same coordinates always produce the
/// same data.
pub trait TileProducer<T>: Send + Sync {
    /// Returns a task writing the tile at `(level, tx, ty)` into `slot`.
    ///
    /// When `reusable` is set, it is the task that produced this tile before
    /// its slot was reclaimed, and the producer must return it, rebound to
    /// `slot`, rather than build a new one.
    fn create_tile(
        &self,
        level: u32,
        tx: i32,
        ty: i32,
        slot: &Arc<Slot<T>>,
        deadline: Deadline,
        reusable: Option<Arc<Task>>,
    ) -> Arc<Task>;
}

type Fill<T> = dyn Fn(TileId, &mut T) -> bool + Send + Sync;

/// Work that fills one tile slot with a closure.
///
/// The closure returns whether the data it wrote differs from what the slot
/// held for this tile before. When dropped, the work tells the cache that no
/// task for its tile is alive anymore.
pub struct FillTile<T> {
    tile: TileId,
    slot: Mutex<Arc<Slot<T>>>,
    fill: Box<Fill<T>>,
    cache: Weak<TileCache<T>>,
    type_key: &'static str,
}

impl<T: Send + Sync + 'static> FillTile<T> {
    pub fn new(
        cache: Weak<TileCache<T>>,
        tile: TileId,
        slot: Arc<Slot<T>>,
        fill: impl Fn(TileId, &mut T) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            tile,
            slot: Mutex::new(slot),
            fill: Box::new(fill),
            cache,
            type_key: "fill_tile",
        }
    }

    /// Groups the duration statistics of this work under `type_key`.
    pub fn with_type_key(mut self, type_key: &'static str) -> Self {
        self.type_key = type_key;
        self
    }

    pub fn tile(&self) -> TileId {
        self.tile
    }

    pub fn slot(&self) -> Arc<Slot<T>> {
        self.slot.lock().clone()
    }

    pub fn rebind(&self, slot: Arc<Slot<T>>) {
        *self.slot.lock() = slot;
    }

    /// Rebinds `reusable` to `slot` if it is a `FillTile` task, otherwise
    /// wraps `make()` in a new task with `deadline`.
    ///
    /// A reused task keeps its deadline: it may still be queued in a
    /// scheduler, which has to be told about any change through
    /// [`Scheduler::reschedule`](crate::Scheduler::reschedule).
    pub fn create(
        reusable: Option<Arc<Task>>,
        slot: &Arc<Slot<T>>,
        deadline: Deadline,
        make: impl FnOnce() -> Self,
    ) -> Arc<Task> {
        if let Some(task) = reusable
            && let Some(work) = task.work::<Self>()
        {
            work.rebind(slot.clone());
            return task;
        }

        let task = Task::new(make());
        task.set_deadline(deadline);
        task
    }
}

impl<T: Send + Sync + 'static> Work for FillTile<T> {
    fn type_key(&self) -> &'static str {
        self.type_key
    }

    fn run(&self) -> bool {
        let slot = self.slot();
        let mut data = slot.write();
        (self.fill)(self.tile, &mut data)
    }
}

impl<T> Drop for FillTile<T> {
    fn drop(&mut self) {
        if let Some(cache) = self.cache.upgrade() {
            let TileId {
                producer,
                level,
                tx,
                ty,
            } = self.tile;
            cache.create_tile_task_deleted(producer, level, tx, ty);
        }
    }
}
