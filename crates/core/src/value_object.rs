//! Value object trait: equality by value, not identity.

/// Marker trait for value objects.
///
/// Value objects are **immutable** and **compared by value**: two quantities of
/// `85.5` are the same quantity regardless of which receipt line they came from.
/// To "modify" one, build a new value.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
