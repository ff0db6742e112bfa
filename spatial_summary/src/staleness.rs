//! Which periods need recomputation.
//!
//! Two escalating checks: [`outdated_months`] looks at catalog changes after a watermark,
//! [`outdated_years`] compares stored year overviews with the months they were built from.
//! Both only narrow the work of a refresh; a forced refresh ignores them.
//!
//! A [`RefreshPlan`] collects the months to rebuild as linear month ids in a
//! [`RoaringBitmap`], and derives the years and the all-time row from them.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use chrono_tz::Tz;
use diesel::SqliteConnection;
use roaring::RoaringBitmap;

use crate::{
    catalog::{ArchiveFilter, CatalogProduct, DatasetCatalog, DatasetQuery, ProductFields, for_each_page},
    overview::OverviewRepo,
    period::{self, Period, PeriodType},
    spatial, tz,
};

/// Months (first days, in `grouping_tz`) holding datasets of `product` added, updated or
/// archived after `since`, with the number of such datasets. `since = None` counts all.
pub fn outdated_months<C>(
    catalog: &C,
    product: &CatalogProduct,
    fields: &ProductFields,
    since: Option<DateTime<Utc>>,
    grouping_tz: Tz,
) -> anyhow::Result<Vec<(NaiveDate, usize)>>
where
    C: DatasetCatalog + ?Sized,
{
    let query = DatasetQuery {
        product_id: Some(product.id),
        archived: ArchiveFilter::Any,
        changed_after: since,
        ..Default::default()
    };
    let mut months: BTreeMap<NaiveDate, usize> = BTreeMap::new();
    for_each_page(catalog, &query, |batch| {
        for ds in &batch {
            let Some(center) = fields.extract(&ds.metadata).center_time else {
                continue;
            };
            let day = tz::local_date(center, grouping_tz);
            *months
                .entry(Period::containing(PeriodType::Month, day).start_day)
                .or_insert(0) += 1;
        }
        Ok(())
    })?;
    Ok(months.into_iter().collect())
}

/// Months in which datasets of `product` changed after `since` were indexed before this
/// refresh. Read ahead of the sync so a dataset that moves to another month, or is archived,
/// also outdates the month it leaves.
pub fn previous_months<C>(
    conn: &mut SqliteConnection,
    catalog: &C,
    product: &CatalogProduct,
    since: DateTime<Utc>,
    grouping_tz: Tz,
) -> anyhow::Result<BTreeSet<NaiveDate>>
where
    C: DatasetCatalog + ?Sized,
{
    let query = DatasetQuery {
        product_id: Some(product.id),
        archived: ArchiveFilter::Any,
        changed_after: Some(since),
        ..Default::default()
    };
    let mut ids = Vec::new();
    for_each_page(catalog, &query, |batch| {
        ids.extend(batch.iter().map(|d| d.id.hyphenated().to_string()));
        Ok(())
    })?;
    spatial::indexed_months(conn, product.id, &ids, grouping_tz)
}

/// Years whose stored overview is older than one of its stored months, or missing while
/// months exist.
pub fn outdated_years<R>(
    conn: &mut SqliteConnection,
    repo: &R,
    product_ref: i32,
) -> anyhow::Result<Vec<NaiveDate>>
where
    R: OverviewRepo + ?Sized,
{
    let years: BTreeMap<NaiveDate, DateTime<Utc>> = repo
        .generation_times(conn, product_ref, PeriodType::Year)?
        .into_iter()
        .collect();
    let mut out = BTreeSet::new();
    for (month, generated) in repo.generation_times(conn, product_ref, PeriodType::Month)? {
        let year = Period::containing(PeriodType::Year, month).start_day;
        match years.get(&year) {
            Some(year_generated) if *year_generated >= generated => {}
            _ => {
                out.insert(year);
            }
        }
    }
    Ok(out.into_iter().collect())
}

/// The set of periods one refresh pass rebuilds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RefreshPlan {
    months: RoaringBitmap,
    years: BTreeSet<i32>,
}

impl RefreshPlan {
    /// Empty plan.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the month containing `day` (and therefore its year).
    pub fn add_month(&mut self, day: NaiveDate) {
        match period::month_id(day) {
            Some(id) => {
                self.months.insert(id);
            }
            None => tracing::warn!(%day, "month out of range; not planned"),
        }
    }

    /// Rebuild the year containing `day` from its stored months.
    pub fn add_year(&mut self, day: NaiveDate) {
        self.years.insert(day.year());
    }

    /// Nothing to rebuild.
    pub fn is_empty(&self) -> bool {
        self.months.is_empty() && self.years.is_empty()
    }

    /// Number of months planned.
    pub fn month_count(&self) -> u64 {
        self.months.len()
    }

    /// Month periods to rebuild, ascending.
    pub fn months(&self) -> Vec<Period> {
        self.months
            .iter()
            .filter_map(period::month_from_id)
            .map(|d| Period::containing(PeriodType::Month, d))
            .collect()
    }

    /// Year periods to rebuild, ascending: those added explicitly and those of planned months.
    pub fn years(&self) -> Vec<Period> {
        let mut years = self.years.clone();
        years.extend(
            self.months
                .iter()
                .filter_map(period::month_from_id)
                .map(|d| d.year()),
        );
        years
            .into_iter()
            .filter_map(|y| Period::year(y).ok())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn plan_dedups_months_and_derives_years() {
        let mut plan = RefreshPlan::new();
        assert!(plan.is_empty());
        plan.add_month(ymd(2020, 3, 14));
        plan.add_month(ymd(2020, 3, 1));
        plan.add_month(ymd(2019, 12, 31));
        plan.add_year(ymd(2017, 6, 1));
        assert_eq!(plan.month_count(), 2);
        let months: Vec<_> = plan.months().iter().map(Period::start_day_str).collect();
        assert_eq!(months, vec!["2019-12-01", "2020-03-01"]);
        let years: Vec<_> = plan.years().iter().map(Period::start_day_str).collect();
        assert_eq!(years, vec!["2017-01-01", "2019-01-01", "2020-01-01"]);
    }
}
