//! Overview computation.
//!
//! Day and month overviews are summarised directly from the spatial-index rows in their
//! window. Year and all-time overviews are combined from the stored overviews of the
//! next-finer period type, so a year can be rebuilt from already-rebuilt months without
//! rescanning datasets, and a year's `dataset_count` is by construction the sum of its
//! months.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use diesel::SqliteConnection;

use crate::{
    crs::CrsResolver,
    geometry,
    models::DatasetSpatial,
    overview::TimePeriodOverview,
    period::{Period, PeriodType},
    reconcile,
    spatial, tz,
};

/// Summarise `rows` (already scoped to `period`'s window) into an overview.
pub fn summarise(
    product_ref: i32,
    period: Period,
    rows: &[DatasetSpatial],
    target_srid: i32,
    resolver: &CrsResolver,
    generation_time: DateTime<Utc>,
) -> anyhow::Result<TimePeriodOverview> {
    let mut o = TimePeriodOverview::empty(product_ref, period, generation_time);
    if rows.is_empty() {
        return Ok(o);
    }

    let mut footprints = Vec::new();
    let mut size: Option<i64> = None;
    let mut earliest: Option<DateTime<Utc>> = None;
    let mut latest: Option<DateTime<Utc>> = None;
    for row in rows {
        let center = tz::parse_ts_to_utc(&row.center_time)?;
        earliest = Some(earliest.map_or(center, |e| e.min(center)));
        latest = Some(latest.map_or(center, |l| l.max(center)));
        if let Some(created) = row.creation_time.as_deref() {
            let created = tz::parse_ts_to_utc(created)?;
            o.newest_dataset_creation_time = o.newest_dataset_creation_time.max(Some(created));
        }
        if let Some(b) = row.size_bytes {
            size = Some(size.unwrap_or(0).saturating_add(b));
        }
        if let Some(srid) = row.footprint_srid {
            if let Some(name) = resolver.srid_name(srid) {
                o.crses.insert(name);
            }
        }
        *o.region_dataset_counts
            .entry(row.region_code.clone())
            .or_insert(0) += 1;
        if let Some(fp) = spatial::footprint_of(row) {
            footprints.push(fp);
        }
    }

    let reconciled = reconcile::reconcile(&footprints, target_srid, resolver);
    o.dataset_count = i64::try_from(rows.len())?;
    o.footprint_count = i64::try_from(reconciled.footprint_count)?;
    o.footprint_srid = reconciled.geometry.as_ref().map(|_| target_srid);
    o.footprint_geometry = reconciled.geometry;
    o.size_bytes = size;
    o.time_range = earliest.zip(latest);
    o.derive_wgs84(resolver);
    Ok(o)
}

/// Build the overview of any period by scanning the spatial index over its window.
pub fn build(
    conn: &mut SqliteConnection,
    product_ref: i32,
    period: Period,
    grouping_tz: Tz,
    target_srid: i32,
    resolver: &CrsResolver,
) -> anyhow::Result<TimePeriodOverview> {
    let window = period.window(grouping_tz)?;
    let rows = spatial::load_rows(conn, product_ref, &window)?;
    tracing::debug!(product_ref, %period, rows = rows.len(), "building overview");
    summarise(product_ref, period, &rows, target_srid, resolver, Utc::now())
}

/// Build a month overview and the overviews of its days that hold datasets, from one scan.
pub fn build_month_and_days(
    conn: &mut SqliteConnection,
    product_ref: i32,
    month: Period,
    grouping_tz: Tz,
    target_srid: i32,
    resolver: &CrsResolver,
) -> anyhow::Result<(TimePeriodOverview, Vec<TimePeriodOverview>)> {
    anyhow::ensure!(
        month.period_type == PeriodType::Month,
        "expected a month period, got {month}"
    );
    let window = month.window(grouping_tz)?;
    let rows = spatial::load_rows(conn, product_ref, &window)?;
    let now = Utc::now();

    let mut by_day: BTreeMap<NaiveDate, Vec<DatasetSpatial>> = BTreeMap::new();
    for row in &rows {
        let day = tz::local_date(tz::parse_ts_to_utc(&row.center_time)?, grouping_tz);
        by_day.entry(day).or_default().push(row.clone());
    }
    let days = by_day
        .into_iter()
        .map(|(day, day_rows)| {
            summarise(product_ref, Period::day(day), &day_rows, target_srid, resolver, now)
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    let month_overview = summarise(product_ref, month, &rows, target_srid, resolver, now)?;
    tracing::debug!(
        product_ref,
        %month,
        datasets = month_overview.dataset_count,
        days = days.len(),
        "built month overview"
    );
    Ok((month_overview, days))
}

/// Combine overviews of finer periods into the overview of `period`.
///
/// Children whose footprint is in a CRS other than `target_srid` contribute counts but
/// not geometry.
pub fn combine(
    product_ref: i32,
    period: Period,
    children: &[TimePeriodOverview],
    target_srid: i32,
    resolver: &CrsResolver,
    generation_time: DateTime<Utc>,
) -> TimePeriodOverview {
    let mut o = TimePeriodOverview::empty(product_ref, period, generation_time);
    let mut geoms = Vec::new();
    for c in children {
        o.dataset_count += c.dataset_count;
        o.crses.extend(c.crses.iter().cloned());
        o.size_bytes = match (o.size_bytes, c.size_bytes) {
            (Some(a), Some(b)) => Some(a.saturating_add(b)),
            (a, b) => a.or(b),
        };
        o.time_range = match (o.time_range, c.time_range) {
            (Some((a0, a1)), Some((b0, b1))) => Some((a0.min(b0), a1.max(b1))),
            (a, b) => a.or(b),
        };
        o.newest_dataset_creation_time = o
            .newest_dataset_creation_time
            .max(c.newest_dataset_creation_time);
        for (k, v) in &c.region_dataset_counts {
            *o.region_dataset_counts.entry(k.clone()).or_insert(0) += v;
        }
        match (&c.footprint_geometry, c.footprint_srid) {
            (Some(g), Some(srid)) if srid == target_srid => {
                geoms.push(g);
                o.footprint_count += c.footprint_count;
            }
            (Some(_), srid) => {
                tracing::warn!(%period, child = %c.period, ?srid, target_srid, "child footprint in another CRS; geometry not combined");
            }
            _ => {}
        }
    }
    if !geoms.is_empty() {
        o.footprint_geometry = Some(geometry::union_all(geoms));
        o.footprint_srid = Some(target_srid);
    }
    o.derive_wgs84(resolver);
    o
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{crs::SridRegistry, models::SpatialRefSys};
    use chrono::TimeZone;

    fn resolver() -> CrsResolver {
        CrsResolver::new(SridRegistry::from_rows([SpatialRefSys {
            srid: 4326,
            auth_name: "EPSG".into(),
            auth_srid: 4326,
            proj4text: "+proj=longlat +datum=WGS84 +no_defs".into(),
        }]))
    }

    fn row(id: &str, center: &str, region: Option<&str>, size: Option<i64>) -> DatasetSpatial {
        DatasetSpatial {
            id: id.into(),
            product_ref: 1,
            center_time: center.into(),
            creation_time: Some("2021-01-01T00:00:00.000Z".into()),
            footprint: Some(
                r#"{"type":"Polygon","coordinates":[[[150,-30],[151,-30],[151,-29],[150,-29],[150,-30]]]}"#
                    .into(),
            ),
            footprint_srid: Some(4326),
            region_code: region.map(str::to_string),
            size_bytes: size,
        }
    }

    #[test]
    fn summarise_counts_and_ranges() {
        let rows = vec![
            row("a", "2020-01-02T00:00:00.000Z", Some("r1"), Some(10)),
            row("b", "2020-01-05T00:00:00.000Z", None, None),
            row("c", "2020-01-09T00:00:00.000Z", Some("r1"), Some(5)),
        ];
        let now = Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap();
        let o = summarise(1, Period::month(2020, 1).unwrap(), &rows, 4326, &resolver(), now).unwrap();
        assert_eq!(o.dataset_count, 3);
        assert_eq!(o.footprint_count, 3);
        assert_eq!(o.size_bytes, Some(15));
        assert_eq!(o.crses.iter().collect::<Vec<_>>(), vec!["EPSG:4326"]);
        assert_eq!(o.region_dataset_counts[&Some("r1".to_string())], 2);
        assert_eq!(o.region_dataset_counts[&None], 1);
        let (a, b) = o.time_range.unwrap();
        assert_eq!(a, Utc.with_ymd_and_hms(2020, 1, 2, 0, 0, 0).unwrap());
        assert_eq!(b, Utc.with_ymd_and_hms(2020, 1, 9, 0, 0, 0).unwrap());
        assert!(o.footprint_wgs84.is_some());
    }

    #[test]
    fn combine_sums_children() {
        let now = Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap();
        let r = resolver();
        let jan = summarise(
            1,
            Period::month(2020, 1).unwrap(),
            &[row("a", "2020-01-02T00:00:00.000Z", Some("r1"), Some(1))],
            4326,
            &r,
            now,
        )
        .unwrap();
        let feb = summarise(
            1,
            Period::month(2020, 2).unwrap(),
            &[
                row("b", "2020-02-02T00:00:00.000Z", Some("r2"), None),
                row("c", "2020-02-03T00:00:00.000Z", Some("r1"), Some(2)),
            ],
            4326,
            &r,
            now,
        )
        .unwrap();
        let year = combine(1, Period::year(2020).unwrap(), &[jan, feb], 4326, &r, now);
        assert_eq!(year.dataset_count, 3);
        assert_eq!(year.footprint_count, 3);
        assert_eq!(year.size_bytes, Some(3));
        assert_eq!(year.region_dataset_counts[&Some("r1".to_string())], 2);
        assert!(year.footprint_geometry.is_some());
    }

    #[test]
    fn empty_rows_give_empty_overview() {
        let now = Utc::now();
        let o = summarise(1, Period::year(2020).unwrap(), &[], 4326, &resolver(), now).unwrap();
        assert_eq!(o.dataset_count, 0);
        assert!(o.footprint_geometry.is_none());
        assert!(o.time_range.is_none());
    }
}
