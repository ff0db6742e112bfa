//! Domain error conditions.
//!
//! Operations return `anyhow::Result`; the conditions callers are expected to branch on
//! are raised as [`SummaryError`] and can be recovered with `err.downcast_ref::<SummaryError>()`.

/// Result type used throughout the crate for fallible operations.
pub type SummaryResult<T> = anyhow::Result<T>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Conditions that are part of the public contract rather than faults.
pub enum SummaryError {
    /// The catalog holds no datasets at all; the store is not yet populated.
    #[error("no datasets in the catalog")]
    EmptyDb,

    /// No product with this name exists in the catalog.
    #[error("unknown product: {0}")]
    UnknownProduct(String),

    /// A (year, month, day) selector that does not name a period.
    #[error("invalid time selector year={year:?} month={month:?} day={day:?}")]
    InvalidTimeSpec {
        /// Requested year.
        year: Option<i32>,
        /// Requested month.
        month: Option<u32>,
        /// Requested day.
        day: Option<u32>,
    },

    /// A spatial reference id with no entry in `spatial_ref_sys`.
    #[error("unknown srid {0}")]
    UnknownSrid(i32),

    /// Geometry text that could not be decoded into a polygonal geometry.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),
}
