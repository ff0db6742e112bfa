//! Per-product rollup and refresh bookkeeping (`product` table).
//!
//! The row is keyed by the catalog product id and carries:
//! - dataset count and center-time range of the spatial index,
//! - the `last_refresh` / `last_successful_summary` watermarks,
//! - linked source/derived product names,
//! - `fixed_metadata`: search fields whose value is identical across every active dataset.
//!   `NULL` means never computed; `{}` means computed with no fixed fields.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use diesel::{dsl::count_star, prelude::*};
use serde_json::{Map, Value};

use crate::{
    catalog::{ArchiveFilter, CatalogProduct, DatasetCatalog, DatasetQuery, ProductFields, for_each_page},
    models::ProductRow,
    schema::{dataset_spatial::dsl as ds, product::dsl as pr},
    tz,
};

/// Rollup of one product as stored.
#[derive(Debug, Clone, PartialEq)]
pub struct ProductSummary {
    /// Catalog product id.
    pub id: i32,
    /// Product name.
    pub name: String,
    /// Datasets in the spatial index at the last refresh.
    pub dataset_count: i64,
    /// Earliest center time.
    pub time_earliest: Option<DateTime<Utc>>,
    /// Latest center time.
    pub time_latest: Option<DateTime<Utc>>,
    /// Start of the last refresh.
    pub last_refresh: Option<DateTime<Utc>>,
    /// Watermark of the last completed refresh.
    pub last_successful_summary: Option<DateTime<Utc>>,
    /// Names of products whose datasets are sources of this product's datasets.
    pub source_products: Vec<String>,
    /// Names of products derived from this product's datasets.
    pub derived_products: Vec<String>,
    /// Fixed metadata fields; `None` when never computed.
    pub fixed_metadata: Option<Map<String, Value>>,
}

impl ProductSummary {
    fn from_row(row: ProductRow) -> anyhow::Result<Self> {
        let ts = |s: Option<String>| s.as_deref().map(tz::parse_ts_to_utc).transpose();
        Ok(ProductSummary {
            id: row.id,
            dataset_count: i64::from(row.dataset_count),
            time_earliest: ts(row.time_earliest)?,
            time_latest: ts(row.time_latest)?,
            last_refresh: ts(row.last_refresh)?,
            last_successful_summary: ts(row.last_successful_summary)?,
            source_products: serde_json::from_str(&row.source_product_refs)?,
            derived_products: serde_json::from_str(&row.derived_product_refs)?,
            fixed_metadata: row
                .fixed_metadata
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            name: row.name,
        })
    }
}

/// Make sure a row exists for `product`; updates the name of an existing row, inserts
/// otherwise. Returns the product id.
pub fn upsert_product_record(
    conn: &mut SqliteConnection,
    product: &CatalogProduct,
) -> anyhow::Result<i32> {
    conn.immediate_transaction::<_, anyhow::Error, _>(|conn| {
        let updated = diesel::update(pr::product.find(product.id))
            .set(pr::name.eq(&product.name))
            .execute(conn)?;
        if updated == 0 {
            diesel::insert_into(pr::product)
                .values((pr::id.eq(product.id), pr::name.eq(&product.name)))
                .execute(conn)?;
            tracing::info!(product = %product.name, id = product.id, "product record created");
        }
        Ok(product.id)
    })
}

/// Record the start of a refresh.
pub fn record_refresh_start(
    conn: &mut SqliteConnection,
    product_ref: i32,
    at: DateTime<Utc>,
) -> anyhow::Result<()> {
    diesel::update(pr::product.find(product_ref))
        .set(pr::last_refresh.eq(tz::to_rfc3339_millis(at)))
        .execute(conn)?;
    Ok(())
}

/// Recompute dataset count and time range from the spatial index.
pub fn update_stats(conn: &mut SqliteConnection, product_ref: i32) -> anyhow::Result<i64> {
    let (count, earliest, latest): (i64, Option<String>, Option<String>) = ds::dataset_spatial
        .filter(ds::product_ref.eq(product_ref))
        .select((
            count_star(),
            diesel::dsl::min(ds::center_time),
            diesel::dsl::max(ds::center_time),
        ))
        .first(conn)?;
    diesel::update(pr::product.find(product_ref))
        .set((
            pr::dataset_count.eq(i32::try_from(count)?),
            pr::time_earliest.eq(earliest),
            pr::time_latest.eq(latest),
        ))
        .execute(conn)?;
    Ok(count)
}

/// Move `last_successful_summary` forward to `watermark`. Returns `false` when the stored
/// value is already at or past it.
pub fn mark_successful(
    conn: &mut SqliteConnection,
    product_ref: i32,
    watermark: DateTime<Utc>,
) -> anyhow::Result<bool> {
    let w = tz::to_rfc3339_millis(watermark);
    let n = diesel::update(
        pr::product.find(product_ref).filter(
            pr::last_successful_summary
                .is_null()
                .or(pr::last_successful_summary.lt(&w)),
        ),
    )
    .set(pr::last_successful_summary.eq(&w))
    .execute(conn)?;
    Ok(n > 0)
}

/// Search fields whose value is identical and non-null across every active dataset.
///
/// Candidates come from the first `sample_size` datasets and are then checked against the
/// rest. A product without active datasets has no fixed fields.
pub fn compute_fixed_metadata<C>(
    catalog: &C,
    product: &CatalogProduct,
    fields: &ProductFields,
    sample_size: usize,
) -> anyhow::Result<Map<String, Value>>
where
    C: DatasetCatalog + ?Sized,
{
    let query = DatasetQuery {
        product_id: Some(product.id),
        archived: ArchiveFilter::Active,
        ..Default::default()
    };
    let sample = catalog.datasets(&DatasetQuery {
        limit: Some(sample_size.max(1)),
        ..query.clone()
    })?;
    let Some(first) = sample.datasets.first() else {
        return Ok(Map::new());
    };

    let mut candidates: Map<String, Value> = fields
        .search_fields
        .iter()
        .filter_map(|(name, expr)| {
            expr.evaluate(&first.metadata)
                .filter(|v| !v.is_null())
                .map(|v| (name.clone(), v))
        })
        .collect();

    let prune = |doc: &Value, candidates: &mut Map<String, Value>| {
        candidates.retain(|name, fixed| {
            fields
                .search_fields
                .iter()
                .find(|(n, _)| n == name)
                .and_then(|(_, expr)| expr.evaluate(doc))
                .is_some_and(|v| v == *fixed)
        });
    };
    for ds in &sample.datasets {
        prune(&ds.metadata, &mut candidates);
    }
    if sample.remaining > 0 && !candidates.is_empty() {
        let rest = DatasetQuery {
            offset: sample.datasets.len(),
            ..query
        };
        for_each_page(catalog, &rest, |batch| {
            for ds in &batch {
                prune(&ds.metadata, &mut candidates);
            }
            Ok(())
        })?;
    }
    tracing::debug!(product = %product.name, fixed = candidates.len(), "fixed metadata computed");
    Ok(candidates)
}

/// Sorted distinct names of products linked to a sample of `product`'s datasets:
/// `(sources, derived)`.
pub fn linked_products<C>(
    catalog: &C,
    product: &CatalogProduct,
    sample_size: usize,
) -> anyhow::Result<(Vec<String>, Vec<String>)>
where
    C: DatasetCatalog + ?Sized,
{
    let sample = catalog.datasets(&DatasetQuery {
        product_id: Some(product.id),
        archived: ArchiveFilter::Active,
        limit: Some(sample_size.max(1)),
        ..Default::default()
    })?;
    let mut source_ids = Vec::new();
    let mut derived_ids = Vec::new();
    for ds in &sample.datasets {
        source_ids.extend(catalog.source_ids(ds.id)?);
        derived_ids.extend(catalog.derived_ids(ds.id)?);
    }
    let names = |ids: &[uuid::Uuid]| -> anyhow::Result<Vec<String>> {
        let product_ids: BTreeSet<i32> = catalog
            .datasets_by_id(ids)?
            .iter()
            .map(|d| d.product_id)
            .collect();
        let mut out = BTreeSet::new();
        for id in product_ids {
            if let Some(p) = catalog.product_by_id(id)? {
                out.insert(p.name);
            }
        }
        Ok(out.into_iter().collect())
    };
    Ok((names(&source_ids)?, names(&derived_ids)?))
}

/// Store fixed metadata and linked products.
pub fn set_product_details(
    conn: &mut SqliteConnection,
    product_ref: i32,
    fixed_metadata: &Map<String, Value>,
    sources: &[String],
    derived: &[String],
) -> anyhow::Result<()> {
    diesel::update(pr::product.find(product_ref))
        .set((
            pr::fixed_metadata.eq(Some(serde_json::to_string(fixed_metadata)?)),
            pr::source_product_refs.eq(serde_json::to_string(sources)?),
            pr::derived_product_refs.eq(serde_json::to_string(derived)?),
        ))
        .execute(conn)?;
    Ok(())
}

/// Stored rollup of a product by name.
pub fn get_product_summary(
    conn: &mut SqliteConnection,
    name: &str,
) -> anyhow::Result<Option<ProductSummary>> {
    pr::product
        .filter(pr::name.eq(name))
        .select(ProductRow::as_select())
        .first(conn)
        .optional()?
        .map(ProductSummary::from_row)
        .transpose()
}

/// Stored rollup of a product by id.
pub fn get_product_summary_by_id(
    conn: &mut SqliteConnection,
    product_ref: i32,
) -> anyhow::Result<Option<ProductSummary>> {
    pr::product
        .find(product_ref)
        .select(ProductRow::as_select())
        .first(conn)
        .optional()?
        .map(ProductSummary::from_row)
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        catalog::memory::{InMemoryCatalog, eo3_metadata_type},
        db::{connection::connect_sqlite, migrate},
    };
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::TempDir;

    fn setup() -> (TempDir, SqliteConnection) {
        let dir = TempDir::new().unwrap();
        let url = dir.path().join("p.sqlite").display().to_string();
        migrate::run_sqlite(&url).unwrap();
        (dir, connect_sqlite(&url).unwrap())
    }

    #[test]
    fn successful_watermark_only_moves_forward() {
        let (_d, mut conn) = setup();
        let p = CatalogProduct {
            id: 7,
            name: "ls8".into(),
            metadata_type: "eo3".into(),
        };
        assert_eq!(upsert_product_record(&mut conn, &p).unwrap(), 7);
        assert_eq!(upsert_product_record(&mut conn, &p).unwrap(), 7);

        let t1 = Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap();
        let t0 = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        assert!(mark_successful(&mut conn, 7, t1).unwrap());
        assert!(!mark_successful(&mut conn, 7, t0).unwrap());
        let s = get_product_summary(&mut conn, "ls8").unwrap().unwrap();
        assert_eq!(s.last_successful_summary, Some(t1));
        assert_eq!(s.fixed_metadata, None);
    }

    #[test]
    fn fixed_metadata_distinguishes_empty_from_unset() {
        let (_d, mut conn) = setup();
        let cat = InMemoryCatalog::new();
        cat.add_metadata_type(eo3_metadata_type()).unwrap();
        let p = cat.add_product("ls8", "eo3").unwrap();
        upsert_product_record(&mut conn, &p).unwrap();
        let fields = ProductFields::resolve(&eo3_metadata_type(), None, None).unwrap();
        let t = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        for (i, instrument) in ["OLI_TIRS", "OLI_TIRS", "TM"].iter().enumerate() {
            cat.add_dataset(
                "ls8",
                uuid::Uuid::new_v4(),
                json!({"properties": {
                    "datetime": format!("2020-01-0{}T00:00:00Z", i + 1),
                    "platform": "landsat-8",
                    "instruments": instrument,
                }}),
                t,
            )
            .unwrap();
        }
        let fixed = compute_fixed_metadata(&cat, &p, &fields, 2).unwrap();
        assert_eq!(fixed.get("platform"), Some(&json!("landsat-8")));
        assert!(!fixed.contains_key("instrument"));
        assert!(!fixed.contains_key("center_time"));

        set_product_details(&mut conn, p.id, &Map::new(), &[], &[]).unwrap();
        let s = get_product_summary(&mut conn, "ls8").unwrap().unwrap();
        assert_eq!(s.fixed_metadata, Some(Map::new()));
    }
}
