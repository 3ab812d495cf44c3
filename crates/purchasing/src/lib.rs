//! Purchasing domain module (purchase order lifecycle).
//!
//! Pure domain logic: the receiving engine loads and persists purchase orders, this
//! crate only decides which status moves are legal.

pub mod order;

pub use order::{
    CreatePurchaseOrder, NewPurchaseOrderLine, PurchaseOrder, PurchaseOrderCommand,
    PurchaseOrderCreated, PurchaseOrderEvent, PurchaseOrderLine, PurchaseOrderStatus,
    PurchaseOrderStatusChanged,
};
