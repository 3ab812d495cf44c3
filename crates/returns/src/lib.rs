//! Returns domain module: shortage claims raised against vendors.

pub mod claim;

pub use claim::{
    ClaimOutcome, ReturnStatus, ReturnType, ShortageItem, VendorReturn, VendorReturnEvent,
    VendorReturnRaised, VendorReturnUpdated, apply_fulfillment, raise_or_update,
};
