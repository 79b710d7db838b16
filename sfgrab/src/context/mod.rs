//! Per-item context threaded through the pipeline.
//!
//! This module provides:
//! - The typed item identifier (`ItemName`, `ItemType`)
//! - The key/value bag holding derived paths and stats
//! - The `Item` owned by one in-flight unit of work
//! - Late-bound templates realized against an item

mod bags;
mod identity;
mod interpolation;
mod item;

pub use bags::{keys, ItemBag};
pub use identity::{ItemName, ItemType};
pub use interpolation::ItemTemplate;
pub use item::{Item, Provenance};
