//! Shared primitive types used across every pipeline stage.

/// Calendar year of a reported period.
pub type Year = i32;

/// Calendar month, 1..=12.
pub type Month = u32;

/// Stable slug identifying a canonical distributor.
pub type DistributorId = String;

/// Stable slug identifying an economic group.
pub type GroupId = String;

/// The canonical run identifier.
pub type RunId = String;
