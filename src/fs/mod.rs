pub mod bitmap;
pub mod bitmap_cache;
pub mod dir_entry;
pub mod fat_table;
pub mod geometry;
pub mod scanner;

pub use geometry::{FatType, VolumeGeometry};
