//! Per-period overviews: the materialized aggregates served to the query layer.
//!
//! - [`TimePeriodOverview`]: the domain value, convertible to and from a `time_overview` row.
//! - [`build`]: computes overviews from the spatial index (day/month) or by combining
//!   already-stored finer periods (year/all).
//! - [`repo`]: the portable [`OverviewRepo`] surface and its SQLite implementation.

pub mod build;
pub mod repo;

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use geo::MultiPolygon;

use crate::{
    crs::CrsResolver,
    geometry::{self, Reprojector},
    models::TimeOverviewRow,
    period::{self, Period},
    spatial::WGS84_SRID,
    tz,
};

pub use repo::{OverviewRepo, PeriodDatasetCount, SqliteOverviewRepo, UpsertOutcome};

/// Aggregate of one product over one period.
#[derive(Debug, Clone, PartialEq)]
pub struct TimePeriodOverview {
    /// Product id.
    pub product_ref: i32,
    /// The period summarised.
    pub period: Period,
    /// Datasets whose center time falls in the period.
    pub dataset_count: i64,
    /// Datasets contributing a footprint to `footprint_geometry`.
    pub footprint_count: i64,
    /// Union of footprints in `footprint_srid`.
    pub footprint_geometry: Option<MultiPolygon<f64>>,
    /// CRS of `footprint_geometry`.
    pub footprint_srid: Option<i32>,
    /// `footprint_geometry` in EPSG:4326. Derived, never stored.
    pub footprint_wgs84: Option<MultiPolygon<f64>>,
    /// Names of the CRSes observed among the period's datasets.
    pub crses: BTreeSet<String>,
    /// Sum of known dataset sizes.
    pub size_bytes: Option<i64>,
    /// Earliest and latest center time.
    pub time_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    /// Newest creation time among the datasets.
    pub newest_dataset_creation_time: Option<DateTime<Utc>>,
    /// Datasets per region code; `None` holds unregioned datasets.
    pub region_dataset_counts: BTreeMap<Option<String>, i64>,
    /// When the overview was computed.
    pub generation_time: DateTime<Utc>,
}

impl TimePeriodOverview {
    /// An overview of zero datasets.
    pub fn empty(product_ref: i32, period: Period, generation_time: DateTime<Utc>) -> Self {
        TimePeriodOverview {
            product_ref,
            period,
            dataset_count: 0,
            footprint_count: 0,
            footprint_geometry: None,
            footprint_srid: None,
            footprint_wgs84: None,
            crses: BTreeSet::new(),
            size_bytes: None,
            time_range: None,
            newest_dataset_creation_time: None,
            region_dataset_counts: BTreeMap::new(),
            generation_time,
        }
    }

    /// Region counts for display: `None` when the only bucket is the unregioned one.
    pub fn regions_for_display(&self) -> Option<&BTreeMap<Option<String>, i64>> {
        let only_unregioned = self.region_dataset_counts.len() == 1
            && self.region_dataset_counts.contains_key(&None);
        (!self.region_dataset_counts.is_empty() && !only_unregioned)
            .then_some(&self.region_dataset_counts)
    }

    /// Fill `footprint_wgs84` from `footprint_geometry`.
    pub fn derive_wgs84(&mut self, resolver: &CrsResolver) {
        self.footprint_wgs84 = match (&self.footprint_geometry, self.footprint_srid) {
            (Some(g), Some(WGS84_SRID)) => Some(g.clone()),
            (Some(g), Some(srid)) => Reprojector::between(resolver, srid, WGS84_SRID)
                .and_then(|r| r.reproject(g))
                .map_err(|e| tracing::warn!(srid, error = %e, "overview footprint not reprojectable"))
                .ok(),
            _ => None,
        };
    }

    /// Storage row.
    pub fn to_row(&self) -> anyhow::Result<TimeOverviewRow> {
        let regions: Vec<(Option<&str>, i64)> = self
            .region_dataset_counts
            .iter()
            .map(|(k, v)| (k.as_deref(), *v))
            .collect();
        Ok(TimeOverviewRow {
            product_ref: self.product_ref,
            start_day: self.period.start_day_str(),
            period_type: self.period.period_type.as_str().to_string(),
            dataset_count: i32::try_from(self.dataset_count)?,
            footprint_count: i32::try_from(self.footprint_count)?,
            footprint_geometry: self
                .footprint_geometry
                .as_ref()
                .map(geometry::encode)
                .transpose()?,
            footprint_srid: self.footprint_srid,
            crses: serde_json::to_string(&self.crses)?,
            size_bytes: self.size_bytes,
            time_earliest: self.time_range.map(|(a, _)| tz::to_rfc3339_millis(a)),
            time_latest: self.time_range.map(|(_, b)| tz::to_rfc3339_millis(b)),
            newest_dataset_creation_time: self
                .newest_dataset_creation_time
                .map(tz::to_rfc3339_millis),
            region_dataset_counts: serde_json::to_string(&regions)?,
            generation_time: tz::to_rfc3339_millis(self.generation_time),
        })
    }

    /// Decode a storage row. `footprint_wgs84` is left unset.
    pub fn from_row(row: TimeOverviewRow) -> anyhow::Result<Self> {
        let period = Period {
            period_type: row.period_type.parse()?,
            start_day: period::parse_start_day(&row.start_day)?,
        };
        let parse = |s: Option<String>| s.as_deref().map(tz::parse_ts_to_utc).transpose();
        let earliest = parse(row.time_earliest)?;
        let latest = parse(row.time_latest)?;
        let regions: Vec<(Option<String>, i64)> = serde_json::from_str(&row.region_dataset_counts)?;
        Ok(TimePeriodOverview {
            product_ref: row.product_ref,
            period,
            dataset_count: i64::from(row.dataset_count),
            footprint_count: i64::from(row.footprint_count),
            footprint_geometry: row
                .footprint_geometry
                .as_deref()
                .map(geometry::decode)
                .transpose()?,
            footprint_srid: row.footprint_srid,
            footprint_wgs84: None,
            crses: serde_json::from_str(&row.crses)?,
            size_bytes: row.size_bytes,
            time_range: earliest.zip(latest),
            newest_dataset_creation_time: parse(row.newest_dataset_creation_time)?,
            region_dataset_counts: regions.into_iter().collect(),
            generation_time: tz::parse_ts_to_utc(&row.generation_time)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> TimePeriodOverview {
        let t = Utc.with_ymd_and_hms(2020, 3, 4, 5, 6, 7).unwrap();
        let mut o = TimePeriodOverview::empty(3, Period::month(2020, 3).unwrap(), t);
        o.dataset_count = 4;
        o.crses.insert("EPSG:32756".into());
        o.region_dataset_counts.insert(None, 1);
        o.region_dataset_counts.insert(Some("56_12".into()), 3);
        o.time_range = Some((t, t));
        o
    }

    #[test]
    fn row_encoding_keeps_unregioned_bucket() {
        let o = sample();
        let row = o.to_row().unwrap();
        assert_eq!(row.region_dataset_counts, r#"[[null,1],["56_12",3]]"#);
        assert_eq!(row.crses, r#"["EPSG:32756"]"#);
        assert_eq!(row.start_day, "2020-03-01");
        assert_eq!(TimePeriodOverview::from_row(row).unwrap(), o);
    }

    #[test]
    fn only_unregioned_counts_are_not_displayed() {
        let mut o = sample();
        assert!(o.regions_for_display().is_some());
        o.region_dataset_counts.remove(&Some("56_12".into()));
        assert!(o.regions_for_display().is_none());
    }
}
