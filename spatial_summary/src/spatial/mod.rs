//! The per-dataset spatial index (`dataset_spatial`) and its synchronization with the catalog.
//!
//! ## Modes
//! - **Upsert**: active datasets of the product changed after the watermark (or all of
//!   them) are extracted through the product's field expressions and upserted by id;
//!   a conflict overwrites every column.
//! - **Delete**: rows of archived datasets (optionally only those archived after the
//!   watermark) are removed.
//! - **Full resync**: everything above without a watermark, plus removal of rows whose
//!   dataset no longer exists in the catalog at all. This is a set-difference scan over
//!   the product and is meant for periodic use.
//!
//! ## Transactions
//! Each page of upserts and each delete batch runs in its own **`BEGIN IMMEDIATE`**
//! transaction via `SqliteConnection::immediate_transaction`, keeping write-lock windows
//! short while catalog reads happen outside of them.

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::NaiveDate;
use chrono_tz::Tz;
use diesel::prelude::*;
use geo::MultiPolygon;
use uuid::Uuid;

use crate::{
    catalog::{
        ArchiveFilter, CatalogDataset, CatalogProduct, DatasetCatalog, DatasetQuery, ProductFields,
        for_each_page,
    },
    crs::CrsResolver,
    error::SummaryError,
    geometry::{self, Reprojector},
    models::{DatasetSpatial, NewDatasetSpatial},
    period::{Period, PeriodType, TimeWindow},
    reconcile::{self, Footprint},
    schema::dataset_spatial::dsl as ds,
    tz,
};

/// srid of footprints synthesized from a path/row grid, and of region footprints.
pub const WGS84_SRID: i32 = 4326;

const DELETE_CHUNK: usize = 500;

/// Row counts from one synchronization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Rows inserted or overwritten.
    pub upserted: usize,
    /// Rows removed.
    pub deleted: usize,
}

#[derive(Debug, Clone, PartialEq)]
struct ExtractedRow {
    id: String,
    center_time: String,
    creation_time: Option<String>,
    footprint: Option<String>,
    footprint_srid: Option<i32>,
    region_code: Option<String>,
    size_bytes: Option<i64>,
}

impl ExtractedRow {
    fn as_new(&self, product_ref: i32) -> NewDatasetSpatial<'_> {
        NewDatasetSpatial {
            id: &self.id,
            product_ref,
            center_time: &self.center_time,
            creation_time: self.creation_time.as_deref(),
            footprint: self.footprint.as_deref(),
            footprint_srid: self.footprint_srid,
            region_code: self.region_code.as_deref(),
            size_bytes: self.size_bytes,
        }
    }
}

/// Keeps `dataset_spatial` consistent with the catalog for one product.
pub struct Synchronizer<'a, C: ?Sized> {
    catalog: &'a C,
    resolver: &'a CrsResolver,
    product: &'a CatalogProduct,
    fields: &'a ProductFields,
}

impl<'a, C> Synchronizer<'a, C>
where
    C: DatasetCatalog + ?Sized,
{
    /// Synchronizer for `product` using its resolved field expressions.
    pub fn new(
        catalog: &'a C,
        resolver: &'a CrsResolver,
        product: &'a CatalogProduct,
        fields: &'a ProductFields,
    ) -> Self {
        Synchronizer {
            catalog,
            resolver,
            product,
            fields,
        }
    }

    fn extract(&self, ds: &CatalogDataset) -> Option<ExtractedRow> {
        let vals = self.fields.extract(&ds.metadata);
        let Some(center_time) = vals.center_time else {
            tracing::warn!(dataset = %ds.id, product = %self.product.name, "dataset has no center time; not indexed");
            return None;
        };
        let footprint = match vals.footprint.as_ref().map(geometry::from_value) {
            Some(Ok(mp)) => match geometry::encode(&mp) {
                Ok(text) => Some(text),
                Err(e) => {
                    tracing::warn!(dataset = %ds.id, error = %e, "footprint could not be encoded");
                    None
                }
            },
            Some(Err(e)) => {
                tracing::warn!(dataset = %ds.id, error = %e, "unparseable footprint");
                None
            }
            None => None,
        };
        let footprint_srid = self
            .resolver
            .resolve(vals.crs.as_ref(), self.fields.default_crs.as_deref());
        Some(ExtractedRow {
            id: ds.id.hyphenated().to_string(),
            center_time: tz::to_rfc3339_millis(center_time),
            creation_time: vals.creation_time.map(tz::to_rfc3339_millis),
            footprint,
            footprint_srid,
            region_code: vals.region_code,
            size_bytes: vals.size_bytes,
        })
    }

    /// Upsert active datasets changed after `after` (all when `None`). Returns affected rows.
    pub fn upsert_datasets(
        &self,
        conn: &mut SqliteConnection,
        after: Option<chrono::DateTime<chrono::Utc>>,
    ) -> anyhow::Result<usize> {
        let query = DatasetQuery {
            product_id: Some(self.product.id),
            archived: ArchiveFilter::Active,
            changed_after: after,
            ..Default::default()
        };
        let product_ref = self.product.id;
        let mut affected = 0;
        for_each_page(self.catalog, &query, |batch| {
            let rows: Vec<ExtractedRow> = batch.iter().filter_map(|d| self.extract(d)).collect();
            affected += conn.immediate_transaction::<_, anyhow::Error, _>(|conn| {
                let mut n = 0;
                for row in &rows {
                    let new = row.as_new(product_ref);
                    n += diesel::insert_into(ds::dataset_spatial)
                        .values(&new)
                        .on_conflict(ds::id)
                        .do_update()
                        .set(&new)
                        .execute(conn)?;
                }
                Ok(n)
            })?;
            Ok(())
        })?;
        Ok(affected)
    }

    /// Remove rows of datasets archived after `after` (all archived when `None`).
    pub fn delete_archived(
        &self,
        conn: &mut SqliteConnection,
        after: Option<chrono::DateTime<chrono::Utc>>,
    ) -> anyhow::Result<usize> {
        let query = DatasetQuery {
            product_id: Some(self.product.id),
            archived: ArchiveFilter::Archived,
            changed_after: after,
            ..Default::default()
        };
        let mut ids = Vec::new();
        for_each_page(self.catalog, &query, |batch| {
            ids.extend(batch.iter().map(|d| d.id.hyphenated().to_string()));
            Ok(())
        })?;
        delete_ids(conn, &ids)
    }

    /// Remove rows whose dataset no longer exists in the catalog for this product.
    pub fn delete_missing(&self, conn: &mut SqliteConnection) -> anyhow::Result<usize> {
        let present: HashSet<String> = self
            .catalog
            .dataset_ids(self.product.id)?
            .into_iter()
            .map(|id| id.hyphenated().to_string())
            .collect();
        let stored: Vec<String> = ds::dataset_spatial
            .filter(ds::product_ref.eq(self.product.id))
            .select(ds::id)
            .load(conn)?;
        let gone: Vec<String> = stored.into_iter().filter(|id| !present.contains(id)).collect();
        delete_ids(conn, &gone)
    }

    /// Bring the index up to date for changes after `after`.
    ///
    /// With `full`, the watermark is ignored and rows of vanished datasets are removed too.
    /// An entirely empty catalog fails with [`SummaryError::EmptyDb`] in either mode, so a
    /// full resync never wipes the index.
    pub fn sync(
        &self,
        conn: &mut SqliteConnection,
        after: Option<chrono::DateTime<chrono::Utc>>,
        full: bool,
    ) -> anyhow::Result<SyncStats> {
        let after = if full { None } else { after };
        if self.catalog.total_dataset_count()? == 0 {
            return Err(SummaryError::EmptyDb.into());
        }
        let upserted = self.upsert_datasets(conn, after)?;
        let mut deleted = self.delete_archived(conn, after)?;
        if full {
            deleted += self.delete_missing(conn)?;
        }
        tracing::info!(
            product = %self.product.name,
            upserted,
            deleted,
            full,
            "spatial index synchronized"
        );
        Ok(SyncStats { upserted, deleted })
    }

    /// Give datasets without a footprint one synthesized from a path/row reference grid
    /// (shapes in EPSG:4326). Returns rows updated.
    pub fn apply_synthesized_footprints(
        &self,
        conn: &mut SqliteConnection,
        shapes: &HashMap<(i32, i32), MultiPolygon<f64>>,
    ) -> anyhow::Result<usize> {
        let missing: Vec<String> = ds::dataset_spatial
            .filter(ds::product_ref.eq(self.product.id))
            .filter(ds::footprint.is_null())
            .select(ds::id)
            .load(conn)?;
        let ids: Vec<Uuid> = missing.iter().filter_map(|s| Uuid::parse_str(s).ok()).collect();
        let mut updates = Vec::new();
        for d in self.catalog.datasets_by_id(&ids)? {
            let Some((path, rows)) = self.fields.path_rows(&d.metadata) else {
                continue;
            };
            if let Some(mp) = reconcile::synthesize_footprint(path, rows, shapes) {
                updates.push((d.id.hyphenated().to_string(), geometry::encode(&mp)?));
            }
        }
        conn.immediate_transaction::<_, anyhow::Error, _>(|conn| {
            let mut n = 0;
            for (id, text) in &updates {
                n += diesel::update(ds::dataset_spatial.find(id))
                    .set((ds::footprint.eq(text), ds::footprint_srid.eq(WGS84_SRID)))
                    .execute(conn)?;
            }
            Ok(n)
        })
    }
}

fn delete_ids(conn: &mut SqliteConnection, ids: &[String]) -> anyhow::Result<usize> {
    let mut n = 0;
    for chunk in ids.chunks(DELETE_CHUNK) {
        n += conn.immediate_transaction::<_, anyhow::Error, _>(|conn| {
            Ok(diesel::delete(ds::dataset_spatial.filter(ds::id.eq_any(chunk))).execute(conn)?)
        })?;
    }
    Ok(n)
}

/// Index rows of a product whose center time lies in `window`, ordered by `(center_time, id)`.
pub fn load_rows(
    conn: &mut SqliteConnection,
    product_ref: i32,
    window: &TimeWindow,
) -> anyhow::Result<Vec<DatasetSpatial>> {
    let (start, end) = window.bounds_rfc3339();
    let mut q = ds::dataset_spatial
        .filter(ds::product_ref.eq(product_ref))
        .select(DatasetSpatial::as_select())
        .into_boxed();
    if let Some(s) = start {
        q = q.filter(ds::center_time.ge(s));
    }
    if let Some(e) = end {
        q = q.filter(ds::center_time.lt(e));
    }
    Ok(q.order((ds::center_time.asc(), ds::id.asc())).load(conn)?)
}

/// Footprint of a stored row, when it has both geometry and srid and the geometry decodes.
pub fn footprint_of(row: &DatasetSpatial) -> Option<Footprint> {
    let text = row.footprint.as_deref()?;
    let srid = row.footprint_srid?;
    match geometry::decode(text) {
        Ok(geometry) => Some(Footprint { srid, geometry }),
        Err(e) => {
            tracing::warn!(dataset = %row.id, error = %e, "stored footprint does not decode");
            None
        }
    }
}

/// Months (first days) that hold at least one indexed dataset of the product.
pub fn months_with_data(
    conn: &mut SqliteConnection,
    product_ref: i32,
    grouping_tz: Tz,
) -> anyhow::Result<BTreeSet<NaiveDate>> {
    let times: Vec<String> = ds::dataset_spatial
        .filter(ds::product_ref.eq(product_ref))
        .select(ds::center_time)
        .load(conn)?;
    let mut out = BTreeSet::new();
    for t in times {
        let day = tz::local_date(tz::parse_ts_to_utc(&t)?, grouping_tz);
        out.insert(Period::containing(PeriodType::Month, day).start_day);
    }
    Ok(out)
}

/// Months (first days) in which the given datasets are currently indexed. Ids without a row
/// are ignored.
pub fn indexed_months(
    conn: &mut SqliteConnection,
    product_ref: i32,
    ids: &[String],
    grouping_tz: Tz,
) -> anyhow::Result<BTreeSet<NaiveDate>> {
    let mut out = BTreeSet::new();
    for chunk in ids.chunks(DELETE_CHUNK) {
        let times: Vec<String> = ds::dataset_spatial
            .filter(ds::product_ref.eq(product_ref))
            .filter(ds::id.eq_any(chunk))
            .select(ds::center_time)
            .load(conn)?;
        for t in times {
            let day = tz::local_date(tz::parse_ts_to_utc(&t)?, grouping_tz);
            out.insert(Period::containing(PeriodType::Month, day).start_day);
        }
    }
    Ok(out)
}

/// Datasets of a product in a region, newest first.
pub fn datasets_by_region(
    conn: &mut SqliteConnection,
    product_ref: i32,
    region_code: &str,
    window: &TimeWindow,
    limit: i64,
    offset: i64,
) -> anyhow::Result<Vec<DatasetSpatial>> {
    let (start, end) = window.bounds_rfc3339();
    let mut q = ds::dataset_spatial
        .filter(ds::product_ref.eq(product_ref))
        .filter(ds::region_code.eq(region_code))
        .select(DatasetSpatial::as_select())
        .into_boxed();
    if let Some(s) = start {
        q = q.filter(ds::center_time.ge(s));
    }
    if let Some(e) = end {
        q = q.filter(ds::center_time.lt(e));
    }
    Ok(q
        .order((ds::center_time.desc(), ds::id.asc()))
        .limit(limit)
        .offset(offset)
        .load(conn)?)
}

/// Ids of products with datasets in a region, ascending.
pub fn products_by_region(
    conn: &mut SqliteConnection,
    region_code: &str,
    window: &TimeWindow,
    limit: i64,
    offset: i64,
) -> anyhow::Result<Vec<i32>> {
    let (start, end) = window.bounds_rfc3339();
    let mut q = ds::dataset_spatial
        .filter(ds::region_code.eq(region_code))
        .select(ds::product_ref)
        .distinct()
        .into_boxed();
    if let Some(s) = start {
        q = q.filter(ds::center_time.ge(s));
    }
    if let Some(e) = end {
        q = q.filter(ds::center_time.lt(e));
    }
    Ok(q.order(ds::product_ref.asc()).limit(limit).offset(offset).load(conn)?)
}

/// A dataset's footprint in EPSG:4326 together with its region code.
///
/// `None` when the dataset is not indexed. The footprint is `None` when absent, without
/// a resolved CRS, or not reprojectable.
pub fn dataset_footprint_region(
    conn: &mut SqliteConnection,
    resolver: &CrsResolver,
    id: Uuid,
) -> anyhow::Result<Option<(Option<MultiPolygon<f64>>, Option<String>)>> {
    let row: Option<DatasetSpatial> = ds::dataset_spatial
        .find(id.hyphenated().to_string())
        .select(DatasetSpatial::as_select())
        .first(conn)
        .optional()?;
    let Some(row) = row else {
        return Ok(None);
    };
    let footprint = match footprint_of(&row) {
        Some(f) if f.srid == WGS84_SRID => Some(f.geometry),
        Some(f) => Reprojector::between(resolver, f.srid, WGS84_SRID)
            .and_then(|r| r.reproject(&f.geometry))
            .map_err(|e| tracing::warn!(dataset = %row.id, error = %e, "footprint not reprojectable"))
            .ok(),
        None => None,
    };
    Ok(Some((footprint, row.region_code)))
}
