//! Spatial and temporal summaries of a dataset catalog.
//!
//! For each product, a refresh keeps a per-dataset spatial index in step with the
//! catalog, aggregates it into per-region footprints and per-period overviews
//! (day, month, year, all time), and records product-level bookkeeping. Entry point:
//! [`store::SummaryStore`].

#![deny(missing_docs)]

pub mod catalog;
pub mod config;
pub mod crs;
pub mod db;
pub mod error;
pub mod geometry;
pub mod models;
pub mod overview;
pub mod period;
pub mod product;
pub mod reconcile;
pub mod regions;
#[allow(missing_docs)]
pub mod schema;
pub mod spatial;
pub mod staleness;
pub mod store;
pub mod tz;

pub use error::{SummaryError, SummaryResult};
pub use store::{RefreshStats, SummaryStore};
