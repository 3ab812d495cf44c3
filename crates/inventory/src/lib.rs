//! Inventory domain module: turning reconciled GRN lines into stock.
//!
//! Pure planning only. The engine writes the planned rows and flips the GRN's
//! `inventory_added` flag in the same transaction.

pub mod stock;

pub use stock::{
    GrnMaterialized, InventoryEvent, InventoryMovement, InventoryRecord, Materialization,
    MaterializedRow, MovementType, QualityStatus, StockEntry, StockType, plan_materialization,
    quality_for,
};
