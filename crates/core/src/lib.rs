//! `loomerp-core` — domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod aggregate;
pub mod entity;
pub mod error;
pub mod id;
pub mod quantity;
pub mod value_object;

pub use aggregate::{Aggregate, AggregateRoot, ExpectedVersion};
pub use entity::Entity;
pub use error::{ConflictKind, DomainError, DomainResult};
pub use id::{
    GrnId, InventoryId, MovementId, OutboxId, PurchaseOrderId, UserId, VendorId, VendorReturnId,
};
pub use quantity::Quantity;
pub use value_object::ValueObject;
