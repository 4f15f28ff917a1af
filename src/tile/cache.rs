use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::ReentrantMutex;
use tracing::{debug, trace};

use crate::core::{Deadline, IMMEDIATE, Reason};
use crate::engine::Task;
use crate::scheduler::Scheduler;
use crate::tile::{ProducerId, Slot, SlotId, TileId, TileProducer, TileStorage};

/// A tile known to a [`TileCache`]: its identity, the task producing its
/// data, and the slot holding that data.
pub struct Tile<T> {
    id: TileId,
    task: Arc<Task>,
    slot_id: SlotId,
    slot: Arc<Slot<T>>,
    users: AtomicU32,
}

impl<T> Tile<T> {
    pub fn id(&self) -> TileId {
        self.id
    }

    pub fn producer(&self) -> ProducerId {
        self.id.producer
    }

    pub fn level(&self) -> u32 {
        self.id.level
    }

    pub fn tx(&self) -> i32 {
        self.id.tx
    }

    pub fn ty(&self) -> i32 {
        self.id.ty
    }

    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }

    pub fn slot(&self) -> &Arc<Slot<T>> {
        &self.slot
    }

    /// Number of outstanding [`TileCache::get_tile`] calls not yet matched by
    /// a [`TileCache::put_tile`].
    pub fn users(&self) -> u32 {
        self.users.load(Ordering::Acquire)
    }
}

impl<T> fmt::Debug for Tile<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tile")
            .field("id", &self.id)
            .field("task", &self.task.id())
            .field("slot", &self.slot.index())
            .field("users", &self.users())
            .finish()
    }
}

/// Tiles evicted while the cache state is borrowed. Dropping one may drop
/// its task, whose destructor calls back into the cache, so they are only
/// released once the borrow has ended.
type Graveyard<T> = Vec<Arc<Tile<T>>>;

struct CacheState<T> {
    storage: TileStorage<T>,
    producers: HashMap<ProducerId, Arc<dyn TileProducer<T>>>,
    used: HashMap<TileId, Arc<Tile<T>>>,
    /// Unused tiles with their LRU stamp.
    unused: HashMap<TileId, (u64, Arc<Tile<T>>)>,
    /// Unused tiles by increasing release time.
    lru: BTreeMap<u64, TileId>,
    stamp: u64,
    /// Tasks of evicted tiles that are still alive somewhere.
    deleted: HashMap<TileId, Weak<Task>>,
}

impl<T> CacheState<T> {
    fn push_unused(&mut self, tile: Arc<Tile<T>>) {
        self.stamp += 1;
        self.lru.insert(self.stamp, tile.id);
        self.unused.insert(tile.id, (self.stamp, tile));
    }

    fn take_unused(&mut self, id: TileId) -> Option<Arc<Tile<T>>> {
        let (stamp, tile) = self.unused.remove(&id)?;
        self.lru.remove(&stamp);
        Some(tile)
    }

    /// Moves an existing tile to the used set with one more user.
    fn acquire(&mut self, id: TileId) -> Option<Arc<Tile<T>>> {
        if let Some(tile) = self.used.get(&id) {
            tile.users.fetch_add(1, Ordering::AcqRel);
            return Some(tile.clone());
        }
        let tile = self.take_unused(id)?;
        tile.users.store(1, Ordering::Release);
        self.used.insert(id, tile.clone());
        Some(tile)
    }

    /// Takes a free slot, evicting the least recently released tile if the
    /// storage is full.
    fn new_slot(&mut self, graveyard: &mut Graveyard<T>) -> Option<SlotId> {
        if let Some(slot) = self.storage.new_slot() {
            return Some(slot);
        }

        let (_, &victim) = self.lru.iter().next()?;
        let tile = self.take_unused(victim)?;
        trace!(tile = %victim, task = %tile.task.id(), "evicting unused tile");

        self.deleted.insert(victim, Arc::downgrade(&tile.task));
        self.storage.delete_slot(tile.slot_id);
        graveyard.push(tile);
        self.storage.new_slot()
    }
}

/// Keeps track of which tiles hold a storage slot.
///
/// Tiles in use are never evicted. Tiles that nobody uses anymore keep their
/// slot, and their data, until the slot is needed for another tile, at which
/// point the least recently released one is evicted. The production task of
/// an evicted tile is remembered for as long as it stays alive, so asking for
/// that tile again reuses the task instead of building a new one.
///
/// All operations are serialized by a reentrant lock, so producers may call
/// back into the cache while creating tiles.
pub struct TileCache<T> {
    name: String,
    scheduler: Option<Arc<dyn Scheduler>>,
    state: ReentrantMutex<RefCell<CacheState<T>>>,
}

impl<T> TileCache<T> {
    pub fn new(
        name: impl Into<String>,
        storage: TileStorage<T>,
        scheduler: Option<Arc<dyn Scheduler>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            scheduler,
            state: ReentrantMutex::new(RefCell::new(CacheState {
                storage,
                producers: HashMap::new(),
                used: HashMap::new(),
                unused: HashMap::new(),
                lru: BTreeMap::new(),
                stamp: 0,
                deleted: HashMap::new(),
            })),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scheduler(&self) -> Option<&Arc<dyn Scheduler>> {
        self.scheduler.as_ref()
    }

    /// Runs `f` on the borrowed state, then releases evicted tiles.
    fn with_state<R>(&self, f: impl FnOnce(&mut CacheState<T>, &mut Graveyard<T>) -> R) -> R {
        let guard = self.state.lock();
        let mut graveyard = Vec::new();
        let result = {
            let mut state = guard.borrow_mut();
            f(&mut state, &mut graveyard)
        };
        drop(graveyard);
        result
    }

    pub fn capacity(&self) -> usize {
        self.with_state(|state, _| state.storage.capacity())
    }

    pub fn free_slots(&self) -> usize {
        self.with_state(|state, _| state.storage.free_slots())
    }

    pub fn used_tiles(&self) -> usize {
        self.with_state(|state, _| state.used.len())
    }

    pub fn unused_tiles(&self) -> usize {
        self.with_state(|state, _| state.unused.len())
    }

    /// Number of evicted tiles whose production task is remembered.
    pub fn deleted_tasks(&self) -> usize {
        self.with_state(|state, _| state.deleted.len())
    }

    /// Registers the producer of tiles tagged with `id`.
    ///
    /// # Panics
    /// Panics if another producer is already registered under `id`.
    pub fn register_producer(&self, id: ProducerId, producer: Arc<dyn TileProducer<T>>) {
        self.with_state(|state, _| {
            let previous = state.producers.insert(id, producer);
            assert!(previous.is_none(), "producer {id} registered twice in cache {}", self.name);
        });
    }

    /// Looks a tile up without changing its user count.
    pub fn find_tile(
        &self,
        producer: ProducerId,
        level: u32,
        tx: i32,
        ty: i32,
        include_unused: bool,
    ) -> Option<Arc<Tile<T>>> {
        let id = TileId::new(producer, level, tx, ty);
        self.with_state(|state, _| {
            state.used.get(&id).cloned().or_else(|| {
                include_unused
                    .then(|| state.unused.get(&id).map(|(_, tile)| tile.clone()))
                    .flatten()
            })
        })
    }

    /// Releases one use of `tile` and returns the remaining number of users.
    /// A tile without users becomes the most recently released unused tile.
    ///
    /// # Panics
    /// Panics if `tile` is not in use.
    pub fn put_tile(&self, tile: &Arc<Tile<T>>) -> u32 {
        self.with_state(|state, _| {
            let in_use = state
                .used
                .get(&tile.id)
                .is_some_and(|used| Arc::ptr_eq(used, tile));
            assert!(
                in_use && tile.users() > 0,
                "tile {} released more often than acquired in cache {}",
                tile.id,
                self.name
            );

            let users = tile.users.fetch_sub(1, Ordering::AcqRel) - 1;
            if users == 0 {
                state.used.remove(&tile.id);
                state.push_unused(tile.clone());
            }
            users
        })
    }

    /// Called when the production task of a tile is destroyed, so the cache
    /// stops remembering it.
    pub fn create_tile_task_deleted(&self, producer: ProducerId, level: u32, tx: i32, ty: i32) {
        let id = TileId::new(producer, level, tx, ty);
        self.with_state(|state, _| {
            let dead = state.deleted.get(&id).is_some_and(|task| task.strong_count() == 0);
            if dead {
                state.deleted.remove(&id);
            }
        });
    }

    /// Marks the production tasks of every tile of `producer` not done, so
    /// that the tiles are produced again the next time they are used.
    pub fn invalidate_tiles(&self, producer: ProducerId) {
        let tasks = self.tasks_matching(|id| id.producer == producer);
        debug!(cache = %self.name, %producer, tasks = tasks.len(), "invalidating tiles");
        for task in &tasks {
            self.invalidate(task);
        }
    }

    pub fn invalidate_tile(&self, producer: ProducerId, level: u32, tx: i32, ty: i32) {
        let target = TileId::new(producer, level, tx, ty);
        let tasks = self.tasks_matching(|id| *id == target);
        debug!(cache = %self.name, tile = %target, tasks = tasks.len(), "invalidating tile");
        for task in &tasks {
            self.invalidate(task);
        }
    }

    fn tasks_matching(&self, matches: impl Fn(&TileId) -> bool) -> Vec<Arc<Task>> {
        self.with_state(|state, _| {
            let live = state
                .used
                .values()
                .chain(state.unused.values().map(|(_, tile)| tile))
                .filter(|tile| matches(&tile.id))
                .map(|tile| tile.task.clone());
            let remembered = state
                .deleted
                .iter()
                .filter(|(id, _)| matches(id))
                .filter_map(|(_, task)| task.upgrade());
            live.chain(remembered).collect()
        })
    }

    fn invalidate(&self, task: &Arc<Task>) {
        match &self.scheduler {
            Some(scheduler) => scheduler.reschedule(task, Reason::DataChanged, task.deadline()),
            None => task.set_is_done(false, 0, Reason::DataChanged),
        }
    }

    /// Makes sure the task of an existing tile completes by `deadline`.
    fn hurry(&self, tile: &Tile<T>, deadline: Deadline) {
        let task = &tile.task;
        if task.is_done() || task.deadline() <= deadline {
            return;
        }
        match &self.scheduler {
            Some(scheduler) => scheduler.reschedule(task, Reason::DataNeeded, deadline),
            None => {
                task.lower_deadline(deadline);
            }
        }
    }
}

impl<T: Send + Sync + 'static> TileCache<T> {
    /// Returns the tile at the given coordinates, with one more user.
    ///
    /// The tile is taken from the used tiles, else from the unused ones, else
    /// created in a free slot, evicting the least recently released unused
    /// tile if needed. Returns `None` if the storage is full of used tiles.
    ///
    /// # Panics
    /// Panics if no producer is registered under `producer`.
    pub fn get_tile(
        &self,
        producer: ProducerId,
        level: u32,
        tx: i32,
        ty: i32,
        deadline: Deadline,
    ) -> Option<Arc<Tile<T>>> {
        let id = TileId::new(producer, level, tx, ty);
        let _guard = self.state.lock();

        if let Some(tile) = self.with_state(|state, _| state.acquire(id)) {
            self.hurry(&tile, deadline);
            return Some(tile);
        }
        self.create(id, deadline, 1)
    }

    /// Creates the tile at the given coordinates ahead of time, unless the
    /// cache already has it. The new tile has no user, so it is the first
    /// candidate for eviction until somebody gets it.
    ///
    /// The production task is handed to the scheduler if it can prefetch
    /// tasks of that kind. Returns `None` if the tile was already known or
    /// no slot is available.
    ///
    /// # Panics
    /// Panics if `deadline` is immediate.
    pub fn prefetch_tile(
        &self,
        producer: ProducerId,
        level: u32,
        tx: i32,
        ty: i32,
        deadline: Deadline,
    ) -> Option<Arc<Tile<T>>> {
        assert!(deadline > IMMEDIATE, "prefetching tile with an immediate deadline");
        let id = TileId::new(producer, level, tx, ty);
        let _guard = self.state.lock();

        let known = self.with_state(|state, _| state.used.contains_key(&id) || state.unused.contains_key(&id));
        if known {
            return None;
        }

        let tile = self.create(id, deadline, 0)?;
        if let Some(scheduler) = &self.scheduler
            && scheduler.supports_prefetch(tile.task.is_gpu())
            && !scheduler.schedule(&tile.task)
        {
            trace!(cache = %self.name, tile = %id, "prefetch not accepted by scheduler");
        }
        Some(tile)
    }

    fn create(&self, id: TileId, deadline: Deadline, users: u32) -> Option<Arc<Tile<T>>> {
        let allocated = self.with_state(|state, graveyard| {
            let producer = match state.producers.get(&id.producer) {
                Some(producer) => producer.clone(),
                None => panic!("no producer {} in cache {}", id.producer, self.name),
            };
            let slot_id = state.new_slot(graveyard)?;
            let slot = state.storage.slot(slot_id).clone();
            let reusable = state.deleted.remove(&id).and_then(|task| task.upgrade());
            Some((producer, slot_id, slot, reusable))
        });
        let Some((producer, slot_id, slot, reusable)) = allocated else {
            debug!(cache = %self.name, tile = %id, "cache is full");
            return None;
        };

        let reused = reusable.clone();
        let task = producer.create_tile(id.level, id.tx, id.ty, &slot, deadline, reusable);
        if let Some(previous) = &reused {
            assert!(
                Arc::ptr_eq(previous, &task),
                "producer {} built a second task for tile {} while the first is alive",
                id.producer,
                id
            );
        }
        slot.set_tag(id, &task);

        let tile = Arc::new(Tile {
            id,
            task: task.clone(),
            slot_id,
            slot,
            users: AtomicU32::new(users),
        });
        self.with_state(|state, _| {
            if users > 0 {
                state.used.insert(id, tile.clone());
            } else {
                state.push_unused(tile.clone());
            }
        });

        if reused.is_some() {
            debug!(cache = %self.name, tile = %id, task = %task.id(), "reusing production task");
            match &self.scheduler {
                Some(scheduler) => scheduler.reschedule(&task, Reason::DataNeeded, deadline),
                None => {
                    task.set_is_done(false, 0, Reason::DataNeeded);
                    task.lower_deadline(deadline);
                }
            }
        }
        Some(tile)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::scheduler::{MultithreadScheduler, SchedulerConfig};
    use crate::tile::FillTile;

    const HEIGHTS: ProducerId = ProducerId(7);

    /// Writes `level * 100 + tx * 10 + ty` into the slot.
    struct Heights {
        cache: Weak<TileCache<u32>>,
        created: AtomicUsize,
    }

    impl TileProducer<u32> for Heights {
        fn create_tile(
            &self,
            level: u32,
            tx: i32,
            ty: i32,
            slot: &Arc<Slot<u32>>,
            deadline: Deadline,
            reusable: Option<Arc<Task>>,
        ) -> Arc<Task> {
            self.created.fetch_add(1, Ordering::SeqCst);
            let tile = TileId::new(HEIGHTS, level, tx, ty);
            FillTile::create(reusable, slot, deadline, || {
                FillTile::new(self.cache.clone(), tile, slot.clone(), |id, data: &mut u32| {
                    let value = id.level * 100 + id.tx as u32 * 10 + id.ty as u32;
                    let changed = *data != value;
                    *data = value;
                    changed
                })
            })
        }
    }

    fn setup(capacity: usize, scheduler: Option<Arc<dyn Scheduler>>) -> (Arc<TileCache<u32>>, Arc<Heights>) {
        let cache = TileCache::new("heights", TileStorage::new(capacity, |_| 0), scheduler);
        let producer = Arc::new(Heights {
            cache: Arc::downgrade(&cache),
            created: AtomicUsize::new(0),
        });
        cache.register_producer(HEIGHTS, producer.clone());
        (cache, producer)
    }

    fn get(cache: &TileCache<u32>, tx: i32) -> Option<Arc<Tile<u32>>> {
        cache.get_tile(HEIGHTS, 0, tx, 0, IMMEDIATE)
    }

    #[test]
    fn released_tile_is_reused_without_production() {
        let (cache, producer) = setup(2, None);

        let a = get(&cache, 0).unwrap();
        assert_eq!(a.users(), 1);
        let again = get(&cache, 0).unwrap();
        assert!(Arc::ptr_eq(&a, &again));
        assert_eq!(a.users(), 2);

        assert_eq!(cache.put_tile(&a), 1);
        assert_eq!(cache.put_tile(&a), 0);
        assert_eq!(cache.used_tiles(), 0);
        assert_eq!(cache.unused_tiles(), 1);

        let third = get(&cache, 0).unwrap();
        assert!(Arc::ptr_eq(&a, &third));
        assert_eq!(third.users(), 1);
        assert_eq!(producer.created.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn users_count_gets_minus_puts() {
        let (cache, _) = setup(1, None);
        let tile = get(&cache, 0).unwrap();
        for _ in 0..4 {
            get(&cache, 0).unwrap();
        }
        assert_eq!(tile.users(), 5);
        for expected in (2..5).rev() {
            assert_eq!(cache.put_tile(&tile), expected);
        }
        assert!(cache.find_tile(HEIGHTS, 0, 0, 0, false).is_some());
        cache.put_tile(&tile);
        cache.put_tile(&tile);
        assert!(cache.find_tile(HEIGHTS, 0, 0, 0, false).is_none());
        assert!(cache.find_tile(HEIGHTS, 0, 0, 0, true).is_some());
    }

    #[test]
    fn evicts_least_recently_released() {
        let (cache, _) = setup(3, None);
        let a = get(&cache, 0).unwrap();
        let b = get(&cache, 1).unwrap();
        let c = get(&cache, 2).unwrap();
        cache.put_tile(&b);
        cache.put_tile(&a);
        cache.put_tile(&c);

        get(&cache, 3).unwrap();
        assert!(cache.find_tile(HEIGHTS, 0, 1, 0, true).is_none());
        assert!(cache.find_tile(HEIGHTS, 0, 0, 0, true).is_some());

        get(&cache, 4).unwrap();
        assert!(cache.find_tile(HEIGHTS, 0, 0, 0, true).is_none());
        assert!(cache.find_tile(HEIGHTS, 0, 2, 0, true).is_some());
        assert_eq!(cache.free_slots(), 0);
    }

    #[test]
    fn eviction_forgets_dead_tasks() {
        let (cache, producer) = setup(1, None);
        let a = get(&cache, 0).unwrap();
        let first_task = Arc::downgrade(a.task());
        cache.put_tile(&a);
        drop(a);

        let b = get(&cache, 1).unwrap();
        assert!(cache.find_tile(HEIGHTS, 0, 0, 0, true).is_none());
        // nothing kept the old task alive
        assert!(first_task.upgrade().is_none());
        assert_eq!(cache.deleted_tasks(), 0);

        assert!(get(&cache, 0).is_none(), "the only slot is in use");
        cache.put_tile(&b);
        let a = get(&cache, 0).unwrap();
        assert_eq!(producer.created.load(Ordering::SeqCst), 3);
        assert_eq!(a.slot().id(), Some(a.id()));
    }

    #[test]
    fn live_task_is_reused_after_eviction() {
        let (cache, producer) = setup(1, None);
        let a = get(&cache, 0).unwrap();
        let task = a.task().clone();
        task.run();
        task.set_is_done(true, 1, Reason::DataNeeded);
        cache.put_tile(&a);
        drop(a);

        let b = get(&cache, 1).unwrap();
        assert_eq!(cache.deleted_tasks(), 1);
        cache.put_tile(&b);
        drop(b);

        let a = get(&cache, 0).unwrap();
        assert!(Arc::ptr_eq(a.task(), &task));
        assert_eq!(cache.deleted_tasks(), 0);
        // the slot changed hands, so the old result is stale
        assert!(!task.is_done());
        let fill = task.work::<FillTile<u32>>().unwrap();
        assert!(Arc::ptr_eq(&fill.slot(), a.slot()));
        assert_eq!(producer.created.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn dropping_remembered_task_forgets_it() {
        let (cache, _) = setup(1, None);
        let a = get(&cache, 0).unwrap();
        let task = a.task().clone();
        cache.put_tile(&a);
        drop(a);
        get(&cache, 1).unwrap();
        assert_eq!(cache.deleted_tasks(), 1);

        drop(task);
        assert_eq!(cache.deleted_tasks(), 0);
    }

    #[test]
    fn prefetched_tile_is_unused_until_requested() {
        let (cache, producer) = setup(2, None);
        let tile = cache.prefetch_tile(HEIGHTS, 1, 0, 0, 3).unwrap();
        assert_eq!(tile.users(), 0);
        assert_eq!(tile.task().deadline(), 3);
        assert_eq!(cache.unused_tiles(), 1);
        assert!(cache.prefetch_tile(HEIGHTS, 1, 0, 0, 3).is_none());

        let got = cache.get_tile(HEIGHTS, 1, 0, 0, IMMEDIATE).unwrap();
        assert!(Arc::ptr_eq(&tile, &got));
        assert_eq!(got.users(), 1);
        // needed now rather than in three frames
        assert_eq!(got.task().deadline(), IMMEDIATE);
        assert_eq!(producer.created.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn invalidation_reaches_used_unused_and_remembered_tiles() {
        let (cache, _) = setup(2, None);
        let used = get(&cache, 0).unwrap();
        let unused = get(&cache, 1).unwrap();
        cache.put_tile(&unused);
        let evicted = unused.task().clone();
        drop(unused);
        get(&cache, 2).unwrap();
        assert_eq!(cache.deleted_tasks(), 1);

        for task in [used.task(), &evicted] {
            task.set_is_done(true, 1, Reason::DataNeeded);
        }
        cache.invalidate_tile(HEIGHTS, 0, 0, 0);
        assert!(!used.task().is_done());
        assert!(evicted.is_done());

        used.task().set_is_done(true, 2, Reason::DataNeeded);
        cache.invalidate_tiles(HEIGHTS);
        assert!(!used.task().is_done());
        assert!(!evicted.is_done());
        assert_eq!(used.task().completion_date(), 0);
    }

    #[test]
    fn scheduled_tiles_are_filled() {
        let scheduler: Arc<dyn Scheduler> = Arc::new(
            MultithreadScheduler::new(SchedulerConfig {
                thread_count: 2,
                ..Default::default()
            })
            .unwrap(),
        );
        let (cache, _) = setup(4, Some(scheduler.clone()));

        let frame = Task::graph();
        let tiles: Vec<_> = (0..4)
            .map(|tx| cache.get_tile(HEIGHTS, 2, tx, 1, IMMEDIATE).unwrap())
            .collect();
        for tile in &tiles {
            frame.add_task(tile.task());
        }
        scheduler.run(&frame);

        for (tx, tile) in tiles.iter().enumerate() {
            assert!(tile.task().is_done());
            assert_eq!(*tile.slot().read(), 200 + tx as u32 * 10 + 1);
        }
    }

    #[test]
    fn prefetch_goes_through_scheduler() {
        let scheduler = Arc::new(
            MultithreadScheduler::new(SchedulerConfig {
                prefetch_rate: 4,
                ..Default::default()
            })
            .unwrap(),
        );
        let dyn_scheduler: Arc<dyn Scheduler> = scheduler.clone();
        let (cache, _) = setup(2, Some(dyn_scheduler));

        let tile = cache.prefetch_tile(HEIGHTS, 0, 1, 1, 5).unwrap();
        assert_eq!(scheduler.pending(), 1);
        scheduler.run(&Task::graph());
        assert!(tile.task().is_done());
        assert_eq!(*tile.slot().read(), 11);
    }

    #[test]
    fn reused_prefetch_task_runs_when_needed_now() {
        let scheduler = Arc::new(
            MultithreadScheduler::new(SchedulerConfig {
                prefetch_rate: 1,
                ..Default::default()
            })
            .unwrap(),
        );
        let dyn_scheduler: Arc<dyn Scheduler> = scheduler.clone();
        let (cache, producer) = setup(1, Some(dyn_scheduler));

        let prefetched = cache.prefetch_tile(HEIGHTS, 0, 3, 0, 5).unwrap();
        let task = prefetched.task().clone();
        assert_eq!(scheduler.pending(), 1);
        drop(prefetched);

        let other = get(&cache, 1).unwrap();
        assert_eq!(cache.deleted_tasks(), 1);
        cache.put_tile(&other);
        drop(other);

        let tile = get(&cache, 3).unwrap();
        assert!(Arc::ptr_eq(tile.task(), &task));
        assert_eq!(task.deadline(), IMMEDIATE);

        let (done, finished) = mpsc::channel();
        let runner = scheduler.clone();
        let frame = task.clone();
        thread::spawn(move || {
            runner.run(&frame);
            let _ = done.send(());
        });
        assert!(finished.recv_timeout(Duration::from_secs(5)).is_ok(), "frame never finished");

        assert!(task.is_done());
        assert_eq!(*tile.slot().read(), 30);
        assert_eq!(producer.created.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn invalidated_tile_is_produced_again() {
        let scheduler: Arc<dyn Scheduler> = Arc::new(
            MultithreadScheduler::new(SchedulerConfig {
                thread_count: 1,
                ..Default::default()
            })
            .unwrap(),
        );
        let (cache, _) = setup(2, Some(scheduler.clone()));
        let tile = get(&cache, 2).unwrap();
        let frame = Task::graph();
        frame.add_task(tile.task());
        scheduler.run(&frame);
        assert_eq!(*tile.slot().read(), 20);

        *tile.slot().write() = 999;
        cache.invalidate_tile(HEIGHTS, 0, 2, 0);
        assert!(!frame.is_done());
        scheduler.run(&frame);

        assert!(tile.task().is_done());
        assert_eq!(*tile.slot().read(), 20);
    }

    #[test]
    fn reused_task_fills_its_new_slot() {
        let scheduler: Arc<dyn Scheduler> = Arc::new(MultithreadScheduler::new(SchedulerConfig::default()).unwrap());
        let (cache, _) = setup(1, Some(scheduler.clone()));

        let a = get(&cache, 4).unwrap();
        let task = a.task().clone();
        scheduler.run(&task);
        assert_eq!(*a.slot().read(), 40);
        cache.put_tile(&a);
        drop(a);

        // takes over the only slot
        let b = get(&cache, 5).unwrap();
        scheduler.run(b.task());
        assert_eq!(*b.slot().read(), 50);
        cache.put_tile(&b);
        drop(b);

        let a = get(&cache, 4).unwrap();
        assert!(Arc::ptr_eq(a.task(), &task));
        scheduler.run(&task);
        assert!(task.is_done());
        assert_eq!(*a.slot().read(), 40);
    }

    #[test]
    #[should_panic(expected = "released more often than acquired")]
    fn releasing_unused_tile_panics() {
        let (cache, _) = setup(1, None);
        let tile = get(&cache, 0).unwrap();
        cache.put_tile(&tile);
        cache.put_tile(&tile);
    }

    #[test]
    #[should_panic(expected = "no producer")]
    fn unknown_producer_panics() {
        let (cache, _) = setup(1, None);
        cache.get_tile(ProducerId(99), 0, 0, 0, IMMEDIATE);
    }

    #[test]
    #[should_panic(expected = "immediate deadline")]
    fn prefetch_requires_future_deadline() {
        let (cache, _) = setup(1, None);
        cache.prefetch_tile(HEIGHTS, 0, 0, 0, IMMEDIATE);
    }
}
