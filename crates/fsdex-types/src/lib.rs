//! Error taxonomy and small support types shared by every `fsdex-*` crate.

mod error;

pub use error::FsDexError;

/// A path and the wall-clock instant at which some operation on it completed.
///
/// Not a general-purpose timestamp: for [`FsDexError::InvariantViolation`] and friends we only
/// ever need ordering, never calendar semantics, so `std::time::Instant` is used throughout
/// rather than `SystemTime`.
pub type Instant = std::time::Instant;
