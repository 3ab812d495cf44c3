//! Entity trait: identity + continuity across state changes.

/// Entity marker + minimal interface.
///
/// Implemented by the persisted receiving rows (GRNs, claims, stock rows) so stores
/// can key them uniformly.
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Copy + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the entity identifier.
    fn entity_id(&self) -> Self::Id;
}
