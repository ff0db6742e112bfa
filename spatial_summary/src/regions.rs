//! Per-region footprints and counts.
//!
//! A refresh groups a product's indexed datasets by `(region_code, srid)`, unions each
//! group, reprojects the unions to EPSG:4326, unions again per region, simplifies, and
//! upserts one `region` row per code. Rows for codes that no longer occur are deleted.
//! Datasets without a region code form the unregioned bucket, stored under `""`.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use geo::MultiPolygon;

use crate::{
    crs::CrsResolver,
    geometry,
    models::{DatasetSpatial, NewRegion, RegionRow},
    period::TimeWindow,
    reconcile::{self, Footprint},
    schema::region::dsl as rg,
    spatial::{self, WGS84_SRID},
    tz,
};

/// Region code under which unregioned datasets are stored.
pub const UNREGIONED: &str = "";

/// One region of a product.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionSummary {
    /// Region code.
    pub region_code: String,
    /// Simplified union of member footprints, EPSG:4326.
    pub footprint: Option<MultiPolygon<f64>>,
    /// Datasets in the region.
    pub count: i64,
    /// When this row was computed.
    pub generation_time: DateTime<Utc>,
}

impl RegionSummary {
    fn from_row(row: RegionRow) -> anyhow::Result<Self> {
        Ok(RegionSummary {
            footprint: row.footprint.as_deref().map(geometry::decode).transpose()?,
            count: i64::from(row.count),
            generation_time: tz::parse_ts_to_utc(&row.generation_time)?,
            region_code: row.region_code,
        })
    }
}

struct RegionAggregate {
    count: usize,
    footprints: Vec<Footprint>,
}

fn group_rows(rows: &[DatasetSpatial]) -> BTreeMap<String, RegionAggregate> {
    let mut groups: BTreeMap<String, RegionAggregate> = BTreeMap::new();
    for row in rows {
        let code = row.region_code.clone().unwrap_or_else(|| UNREGIONED.to_string());
        let agg = groups.entry(code).or_insert_with(|| RegionAggregate {
            count: 0,
            footprints: Vec::new(),
        });
        agg.count += 1;
        if let Some(fp) = spatial::footprint_of(row) {
            agg.footprints.push(fp);
        }
    }
    groups
}

/// Rebuild the region rows of a product. Returns rows written plus rows deleted.
pub fn refresh_regions(
    conn: &mut SqliteConnection,
    product_ref: i32,
    resolver: &CrsResolver,
    simplify_tolerance: f64,
) -> anyhow::Result<usize> {
    let rows = spatial::load_rows(conn, product_ref, &TimeWindow::UNBOUNDED)?;
    let generation_time = tz::to_rfc3339_millis(Utc::now());

    let mut computed = Vec::new();
    for (code, agg) in group_rows(&rows) {
        let footprint = reconcile::reconcile(&agg.footprints, WGS84_SRID, resolver)
            .geometry
            .map(|g| geometry::simplify(&g, simplify_tolerance))
            .map(|g| geometry::encode(&g))
            .transpose()?;
        let count = i32::try_from(agg.count)?;
        computed.push((code, footprint, count));
    }
    let current: BTreeSet<&str> = computed.iter().map(|(c, _, _)| c.as_str()).collect();

    let changed = conn.immediate_transaction::<_, anyhow::Error, _>(|conn| {
        let mut n = 0;
        for (code, footprint, count) in &computed {
            let new = NewRegion {
                product_ref,
                region_code: code,
                footprint: footprint.as_deref(),
                count: *count,
                generation_time: &generation_time,
            };
            n += diesel::insert_into(rg::region)
                .values(&new)
                .on_conflict((rg::product_ref, rg::region_code))
                .do_update()
                .set(&new)
                .execute(conn)?;
        }

        let stored: Vec<String> = rg::region
            .filter(rg::product_ref.eq(product_ref))
            .select(rg::region_code)
            .load(conn)?;
        let stale: Vec<&String> = stored
            .iter()
            .filter(|c| !current.contains(c.as_str()))
            .collect();
        if !stale.is_empty() {
            n += diesel::delete(
                rg::region
                    .filter(rg::product_ref.eq(product_ref))
                    .filter(rg::region_code.eq_any(stale)),
            )
            .execute(conn)?;
        }
        Ok(n)
    })?;
    tracing::info!(product_ref, regions = computed.len(), changed, "regions refreshed");
    Ok(changed)
}

/// Regions of a product, ordered by code.
///
/// Returns `None` when the product does not support regions: no rows at all, or only the
/// unregioned bucket.
pub fn get_region_summaries(
    conn: &mut SqliteConnection,
    product_ref: i32,
) -> anyhow::Result<Option<Vec<RegionSummary>>> {
    let rows: Vec<RegionRow> = rg::region
        .filter(rg::product_ref.eq(product_ref))
        .filter(rg::region_code.ne(UNREGIONED))
        .select(RegionRow::as_select())
        .order(rg::region_code.asc())
        .load(conn)?;
    if rows.is_empty() {
        return Ok(None);
    }
    rows.into_iter()
        .map(RegionSummary::from_row)
        .collect::<anyhow::Result<Vec<_>>>()
        .map(Some)
}

/// One region of a product.
pub fn get_region(
    conn: &mut SqliteConnection,
    product_ref: i32,
    region_code: &str,
) -> anyhow::Result<Option<RegionSummary>> {
    rg::region
        .find((product_ref, region_code))
        .select(RegionRow::as_select())
        .first(conn)
        .optional()?
        .map(RegionSummary::from_row)
        .transpose()
}
