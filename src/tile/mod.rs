//! Tile storage and caching.
//!
//! Tiles are pieces of procedurally produced data addressed by a quadtree
//! coordinate. Their payload lives in a [`Slot`] of a fixed-size
//! [`TileStorage`] pool, and is written by a production task built by a
//! [`TileProducer`]. The [`TileCache`] decides which tiles keep their slot.

mod cache;
mod producer;
mod storage;

use std::fmt;

pub use cache::{Tile, TileCache};
pub use producer::{FillTile, TileProducer};
pub use storage::{Slot, SlotId, TileStorage};

/// Identifier of a producer registered with a [`TileCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProducerId(pub u32);

impl fmt::Display for ProducerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Logical identity of a tile: the producer that builds it and its quadtree
/// coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TileId {
    pub producer: ProducerId,
    pub level: u32,
    pub tx: i32,
    pub ty: i32,
}

impl TileId {
    pub fn new(producer: ProducerId, level: u32, tx: i32, ty: i32) -> Self {
        Self {
            producer,
            level,
            tx,
            ty,
        }
    }
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", self.producer, self.level, self.tx, self.ty)
    }
}
