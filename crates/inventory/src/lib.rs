//! Inventory domain module.
//!
//! Per-location stock records with a two-phase reservation protocol
//! (reserve → commit | release), implemented purely as deterministic domain logic
//! (no IO, no storage).

pub mod movement;
pub mod stock;

pub use movement::{MovementType, ReferenceType, StockMovement};
pub use stock::{
    Inventory, InventoryCommand, InventoryError, InventoryEvent, InventoryKey, QuantityChange,
};
