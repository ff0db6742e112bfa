//! Diesel models mapping to the database schema.
//!
//! These types mirror the tables defined in the embedded migrations and in
//! [`crate::schema`]:
//! - [`crate::schema::spatial_ref_sys`]: reference coordinate systems (srid → authority code)
//! - [`crate::schema::product`]: per-product rollup and refresh bookkeeping
//! - [`crate::schema::dataset_spatial`]: one row per active catalog dataset
//! - [`crate::schema::region`]: per-region unioned footprints and counts
//! - [`crate::schema::time_overview`]: per-period aggregates
//!
//! Timestamps are RFC3339 UTC strings with millisecond precision; geometries are
//! GeoJSON geometry text tagged by an integer srid column.

use diesel::prelude::*;

use crate::schema::*;

/// A row in [`crate::schema::spatial_ref_sys`].
#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = spatial_ref_sys, check_for_backend(diesel::sqlite::Sqlite))]
pub struct SpatialRefSys {
    /// Canonical reference-system id.
    pub srid: i32,
    /// Authority name (e.g., "EPSG").
    pub auth_name: String,
    /// Code within the authority.
    pub auth_srid: i32,
    /// proj4 definition used for reprojection.
    pub proj4text: String,
}

/// A row in [`crate::schema::product`].
#[derive(Debug, Clone, Queryable, Selectable, Identifiable)]
#[diesel(table_name = product, check_for_backend(diesel::sqlite::Sqlite))]
pub struct ProductRow {
    /// Catalog product id (partition key for every other table).
    pub id: i32,
    /// Product name, unique.
    pub name: String,
    /// Active datasets in the spatial index at the last refresh.
    pub dataset_count: i32,
    /// Earliest center time (RFC3339 UTC).
    pub time_earliest: Option<String>,
    /// Latest center time (RFC3339 UTC).
    pub time_latest: Option<String>,
    /// Watermark recorded at the start of the last refresh.
    pub last_refresh: Option<String>,
    /// Watermark of the last refresh that completed.
    pub last_successful_summary: Option<String>,
    /// JSON array of linked source product names.
    pub source_product_refs: String,
    /// JSON array of linked derived product names.
    pub derived_product_refs: String,
    /// JSON object of fixed metadata fields; NULL when never computed.
    pub fixed_metadata: Option<String>,
}

/// A row in [`crate::schema::dataset_spatial`].
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Identifiable)]
#[diesel(table_name = dataset_spatial, check_for_backend(diesel::sqlite::Sqlite))]
pub struct DatasetSpatial {
    /// Dataset id (hyphenated UUID).
    pub id: String,
    /// FK to [`ProductRow::id`].
    pub product_ref: i32,
    /// Center time (RFC3339 UTC); the temporal key.
    pub center_time: String,
    /// Dataset creation time (RFC3339 UTC).
    pub creation_time: Option<String>,
    /// Footprint as GeoJSON geometry text in its native CRS.
    pub footprint: Option<String>,
    /// srid of `footprint`; NULL when the CRS could not be resolved.
    pub footprint_srid: Option<i32>,
    /// Product-defined grouping key.
    pub region_code: Option<String>,
    /// Total size of the dataset's files.
    pub size_bytes: Option<i64>,
}

/// Insertable/changeset form of [`DatasetSpatial`]; NULLs overwrite on conflict.
#[derive(Debug, Clone, Insertable, AsChangeset)]
#[diesel(table_name = dataset_spatial, treat_none_as_null = true)]
pub struct NewDatasetSpatial<'a> {
    /// Dataset id (hyphenated UUID).
    pub id: &'a str,
    /// FK to [`ProductRow::id`].
    pub product_ref: i32,
    /// Center time (RFC3339 UTC).
    pub center_time: &'a str,
    /// Dataset creation time (RFC3339 UTC).
    pub creation_time: Option<&'a str>,
    /// Footprint as GeoJSON geometry text.
    pub footprint: Option<&'a str>,
    /// srid of `footprint`.
    pub footprint_srid: Option<i32>,
    /// Product-defined grouping key.
    pub region_code: Option<&'a str>,
    /// Total size of the dataset's files.
    pub size_bytes: Option<i64>,
}

/// A row in [`crate::schema::region`].
#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = region, check_for_backend(diesel::sqlite::Sqlite))]
pub struct RegionRow {
    /// FK to [`ProductRow::id`].
    pub product_ref: i32,
    /// Region code; the unregioned bucket is stored as "".
    pub region_code: String,
    /// Simplified union of member footprints, GeoJSON in EPSG:4326.
    pub footprint: Option<String>,
    /// Datasets in the region.
    pub count: i32,
    /// When the row was computed (RFC3339 UTC).
    pub generation_time: String,
}

/// Insertable/changeset form of [`RegionRow`].
#[derive(Debug, Clone, Insertable, AsChangeset)]
#[diesel(table_name = region, primary_key(product_ref, region_code), treat_none_as_null = true)]
pub struct NewRegion<'a> {
    /// FK to [`ProductRow::id`].
    pub product_ref: i32,
    /// Region code ("" for the unregioned bucket).
    pub region_code: &'a str,
    /// GeoJSON footprint in EPSG:4326.
    pub footprint: Option<&'a str>,
    /// Datasets in the region.
    pub count: i32,
    /// Generation timestamp (RFC3339 UTC).
    pub generation_time: &'a str,
}

/// A row in [`crate::schema::time_overview`]. Also used as the insert/update form.
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(
    table_name = time_overview,
    primary_key(product_ref, start_day, period_type),
    check_for_backend(diesel::sqlite::Sqlite),
    treat_none_as_null = true
)]
pub struct TimeOverviewRow {
    /// FK to [`ProductRow::id`].
    pub product_ref: i32,
    /// First day of the period (YYYY-MM-DD).
    pub start_day: String,
    /// "day" | "month" | "year" | "all".
    pub period_type: String,
    /// Datasets whose center time falls in the period.
    pub dataset_count: i32,
    /// Datasets contributing a footprint.
    pub footprint_count: i32,
    /// Union of footprints, GeoJSON in `footprint_srid`.
    pub footprint_geometry: Option<String>,
    /// CRS of `footprint_geometry`.
    pub footprint_srid: Option<i32>,
    /// JSON array of observed CRS names (e.g. "EPSG:32756").
    pub crses: String,
    /// Sum of dataset sizes.
    pub size_bytes: Option<i64>,
    /// Earliest center time (RFC3339 UTC).
    pub time_earliest: Option<String>,
    /// Latest center time (RFC3339 UTC).
    pub time_latest: Option<String>,
    /// Newest dataset creation time (RFC3339 UTC).
    pub newest_dataset_creation_time: Option<String>,
    /// JSON array of `[region_code | null, count]` pairs.
    pub region_dataset_counts: String,
    /// When the row was computed (RFC3339 UTC).
    pub generation_time: String,
}
