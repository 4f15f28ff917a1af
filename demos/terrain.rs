use std::sync::{Arc, Weak};

use tessera::{
    Deadline, FillTile, IMMEDIATE, MultithreadScheduler, ProducerId, Scheduler, SchedulerConfig,
    Slot, Task, TileCache, TileId, TileProducer, TileStorage,
};

/// This example streams a height field around a moving camera.
///
/// Every frame the camera needs the 3x3 block of tiles around it. Those are
/// requested with an immediate deadline and must be ready before the frame
/// is drawn. The column of tiles the camera is heading towards is prefetched
/// with a later deadline, so worker threads can produce it in the meantime.
///
/// Topology of one frame:
///   [frame graph]
///     ├── [fill tile (x-1, y-1)]
///     ├── ...
///     └── [fill tile (x+1, y+1)]
///
/// Run with `RUST_LOG=debug` to see tiles being evicted and reused.

const TILE_SIZE: usize = 64;
const LEVEL: u32 = 4;
const HEIGHTS: ProducerId = ProducerId(1);

type Heights = Vec<f32>;

/// Produces tiles of a smooth, deterministic height field.
struct HeightProducer {
    cache: Weak<TileCache<Heights>>,
}

impl TileProducer<Heights> for HeightProducer {
    fn create_tile(
        &self,
        level: u32,
        tx: i32,
        ty: i32,
        slot: &Arc<Slot<Heights>>,
        deadline: Deadline,
        reusable: Option<Arc<Task>>,
    ) -> Arc<Task> {
        let tile = TileId::new(HEIGHTS, level, tx, ty);
        FillTile::create(reusable, slot, deadline, || {
            FillTile::new(self.cache.clone(), tile, slot.clone(), fill_heights)
                .with_type_key("heights")
        })
    }
}

fn fill_heights(tile: TileId, data: &mut Heights) -> bool {
    let scale = (1u32 << tile.level) as f32;
    data.clear();
    data.reserve(TILE_SIZE * TILE_SIZE);
    for j in 0..TILE_SIZE {
        for i in 0..TILE_SIZE {
            let x = (tile.tx as f32 + i as f32 / TILE_SIZE as f32) / scale;
            let y = (tile.ty as f32 + j as f32 / TILE_SIZE as f32) / scale;
            data.push((x * 7.0).sin() * (y * 5.0).cos() * 100.0);
        }
    }
    true
}

fn main() -> anyhow::Result<()> {
    tessera::init_logging()?;

    // -----------------------------------------------------------------------
    // 1. Scheduler
    // -----------------------------------------------------------------------
    // Two workers help with immediate tiles and keep producing prefetched
    // tiles between frames. Every frame also runs at least two prefetch
    // tasks on the main thread.
    let config = SchedulerConfig::from_json(
        r#"{ "thread_count": 2, "prefetch_rate": 2, "record_diagnostics": true }"#,
    )?;
    let scheduler = Arc::new(MultithreadScheduler::new(config)?);

    // -----------------------------------------------------------------------
    // 2. Tile cache
    // -----------------------------------------------------------------------
    // Twelve slots fit the visible block and the prefetched column, so older
    // tiles get evicted as the camera moves.
    let storage = TileStorage::new(12, |_| Heights::new());
    let cache = TileCache::new("heights", storage, Some(scheduler.clone() as Arc<dyn Scheduler>));
    cache.register_producer(
        HEIGHTS,
        Arc::new(HeightProducer {
            cache: Arc::downgrade(&cache),
        }),
    );

    // -----------------------------------------------------------------------
    // 3. Frames
    // -----------------------------------------------------------------------
    let mut last_frame = None;
    for frame in 0..6 {
        let cx = frame;
        let cy = 0;

        let graph = Task::graph();
        let mut visible = Vec::new();
        for ty in cy - 1..=cy + 1 {
            for tx in cx - 1..=cx + 1 {
                match cache.get_tile(HEIGHTS, LEVEL, tx, ty, IMMEDIATE) {
                    Some(tile) => {
                        graph.add_task(tile.task());
                        visible.push(tile);
                    }
                    None => tracing::warn!(tx, ty, "no free slot for visible tile"),
                }
            }
        }

        for ty in cy - 1..=cy + 1 {
            cache.prefetch_tile(HEIGHTS, LEVEL, cx + 2, ty, 1);
        }

        scheduler.run(&graph);

        let peak = visible
            .iter()
            .flat_map(|tile| tile.slot().read().iter().copied().max_by(f32::total_cmp))
            .fold(f32::MIN, f32::max);
        println!(
            "frame {frame}: {} tiles, peak height {peak:.1}, {} free slots",
            visible.len(),
            cache.free_slots()
        );

        for tile in &visible {
            cache.put_tile(tile);
        }
        last_frame = Some(graph);
    }

    // -----------------------------------------------------------------------
    // 4. Invalidation
    // -----------------------------------------------------------------------
    // Pretend the terrain was edited: every cached height tile is produced
    // again the next time it is used.
    cache.invalidate_tiles(HEIGHTS);
    if let Some(graph) = &last_frame {
        scheduler.run(graph);
    }

    // -----------------------------------------------------------------------
    // 5. Diagnostics
    // -----------------------------------------------------------------------
    let diagnostics = scheduler.take_diagnostics();
    for summary in diagnostics.summary() {
        println!(
            "{}: {} runs, {:?} total, {:?} max",
            summary.type_key, summary.count, summary.total, summary.max
        );
    }
    for stats in scheduler.stats().snapshot() {
        println!(
            "{}: expecting {:?} per tile after {} samples",
            stats.type_key, stats.expected, stats.samples
        );
    }
    if let Some(graph) = &last_frame {
        println!("{}", diagnostics.render_mermaid(graph));
    }

    Ok(())
}
