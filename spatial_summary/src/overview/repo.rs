//! Overview persistence: the [`OverviewRepo`] surface and its SQLite implementation.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, Utc};
use diesel::prelude::*;

use crate::{
    error::SummaryResult,
    models::TimeOverviewRow,
    overview::TimePeriodOverview,
    period::{self, Period, PeriodType},
    schema::{product::dsl as pr, time_overview::dsl as to},
    tz,
};

/// Result of a conditional overview write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// The row was inserted or replaced.
    Written,
    /// A row with a newer `generation_time` was already stored; nothing was written.
    SkippedStale,
}

/// Stored dataset count of one overview, labelled with its product name.
#[derive(Debug, Clone, PartialEq, Eq, Queryable)]
pub struct PeriodDatasetCount {
    /// Product name.
    pub product_name: String,
    /// First day of the period (YYYY-MM-DD).
    pub start_day: String,
    /// "day" | "month" | "year" | "all".
    pub period_type: String,
    /// Datasets in the period.
    pub dataset_count: i32,
}

/// Portable surface, SQLite implementation below.
pub trait OverviewRepo {
    /// Write `overview` unless the stored row for its key was generated later.
    fn upsert(
        &self,
        conn: &mut SqliteConnection,
        overview: &TimePeriodOverview,
    ) -> SummaryResult<UpsertOutcome>;

    /// Point lookup. `None` when no overview was ever generated for the key.
    fn get(
        &self,
        conn: &mut SqliteConnection,
        product_ref: i32,
        period: Period,
    ) -> SummaryResult<Option<TimePeriodOverview>>;

    /// Stored periods of one type, ascending.
    fn periods(
        &self,
        conn: &mut SqliteConnection,
        product_ref: i32,
        period_type: PeriodType,
    ) -> SummaryResult<Vec<Period>>;

    /// Stored overviews of `period`'s next-finer type that lie inside it, ascending.
    fn load_children(
        &self,
        conn: &mut SqliteConnection,
        product_ref: i32,
        period: Period,
    ) -> SummaryResult<Vec<TimePeriodOverview>>;

    /// Stored `(start_day, generation_time)` pairs of one type, ascending.
    fn generation_times(
        &self,
        conn: &mut SqliteConnection,
        product_ref: i32,
        period_type: PeriodType,
    ) -> SummaryResult<Vec<(NaiveDate, DateTime<Utc>)>>;

    /// Delete the children of `parent` that are not in `keep`. Returns rows deleted.
    fn delete_children_except(
        &self,
        conn: &mut SqliteConnection,
        product_ref: i32,
        parent: Period,
        keep: &BTreeSet<NaiveDate>,
    ) -> SummaryResult<usize>;

    /// Delete one overview. Returns rows deleted.
    fn delete(
        &self,
        conn: &mut SqliteConnection,
        product_ref: i32,
        period: Period,
    ) -> SummaryResult<usize>;

    /// Dataset counts of every stored overview, ordered by product name, period type and
    /// start day.
    fn dataset_counts_per_period(
        &self,
        conn: &mut SqliteConnection,
    ) -> SummaryResult<Vec<PeriodDatasetCount>>;
}

const OPEN_END: &str = "9999-12-31";

/// Overview repository over the `time_overview` table.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteOverviewRepo;

impl SqliteOverviewRepo {
    /// New repository handle.
    pub fn new() -> Self {
        Self
    }
}

fn child_type(parent: Period) -> Option<PeriodType> {
    match parent.period_type {
        PeriodType::All => Some(PeriodType::Year),
        PeriodType::Year => Some(PeriodType::Month),
        PeriodType::Month => Some(PeriodType::Day),
        PeriodType::Day => None,
    }
}

/// `[from, until)` start-day bounds of `parent`'s children in storage format.
fn child_bounds(parent: Period) -> (String, String) {
    let from = parent.start_day_str();
    let until = parent
        .next_start()
        .map_or_else(|| OPEN_END.to_string(), |d| d.format("%Y-%m-%d").to_string());
    (from, until)
}

impl OverviewRepo for SqliteOverviewRepo {
    fn upsert(
        &self,
        conn: &mut SqliteConnection,
        overview: &TimePeriodOverview,
    ) -> SummaryResult<UpsertOutcome> {
        let row = overview.to_row()?;
        conn.immediate_transaction::<_, anyhow::Error, _>(|conn| {
            let stored: Option<String> = to::time_overview
                .find((row.product_ref, &row.start_day, &row.period_type))
                .select(to::generation_time)
                .first(conn)
                .optional()?;
            if let Some(stored) = stored {
                let stored_at = tz::parse_ts_to_utc(&stored)?;
                if stored_at > overview.generation_time {
                    tracing::warn!(
                        product_ref = row.product_ref,
                        period = %overview.period,
                        stored = %stored,
                        attempted = %row.generation_time,
                        "newer overview already stored; skipping write"
                    );
                    return Ok(UpsertOutcome::SkippedStale);
                }
            }
            diesel::insert_into(to::time_overview)
                .values(&row)
                .on_conflict((to::product_ref, to::start_day, to::period_type))
                .do_update()
                .set(&row)
                .execute(conn)?;
            Ok(UpsertOutcome::Written)
        })
    }

    fn get(
        &self,
        conn: &mut SqliteConnection,
        product_ref: i32,
        period: Period,
    ) -> SummaryResult<Option<TimePeriodOverview>> {
        to::time_overview
            .find((product_ref, period.start_day_str(), period.period_type.as_str()))
            .select(TimeOverviewRow::as_select())
            .first(conn)
            .optional()?
            .map(TimePeriodOverview::from_row)
            .transpose()
    }

    fn periods(
        &self,
        conn: &mut SqliteConnection,
        product_ref: i32,
        period_type: PeriodType,
    ) -> SummaryResult<Vec<Period>> {
        let days: Vec<String> = to::time_overview
            .filter(to::product_ref.eq(product_ref))
            .filter(to::period_type.eq(period_type.as_str()))
            .select(to::start_day)
            .order(to::start_day.asc())
            .load(conn)?;
        days.iter()
            .map(|d| {
                Ok(Period {
                    period_type,
                    start_day: period::parse_start_day(d)?,
                })
            })
            .collect()
    }

    fn load_children(
        &self,
        conn: &mut SqliteConnection,
        product_ref: i32,
        period: Period,
    ) -> SummaryResult<Vec<TimePeriodOverview>> {
        let Some(kind) = child_type(period) else {
            return Ok(Vec::new());
        };
        let (from, until) = child_bounds(period);
        to::time_overview
            .filter(to::product_ref.eq(product_ref))
            .filter(to::period_type.eq(kind.as_str()))
            .filter(to::start_day.ge(from))
            .filter(to::start_day.lt(until))
            .select(TimeOverviewRow::as_select())
            .order(to::start_day.asc())
            .load(conn)?
            .into_iter()
            .map(TimePeriodOverview::from_row)
            .collect()
    }

    fn generation_times(
        &self,
        conn: &mut SqliteConnection,
        product_ref: i32,
        period_type: PeriodType,
    ) -> SummaryResult<Vec<(NaiveDate, DateTime<Utc>)>> {
        let rows: Vec<(String, String)> = to::time_overview
            .filter(to::product_ref.eq(product_ref))
            .filter(to::period_type.eq(period_type.as_str()))
            .select((to::start_day, to::generation_time))
            .order(to::start_day.asc())
            .load(conn)?;
        rows.iter()
            .map(|(d, g)| Ok((period::parse_start_day(d)?, tz::parse_ts_to_utc(g)?)))
            .collect()
    }

    fn delete_children_except(
        &self,
        conn: &mut SqliteConnection,
        product_ref: i32,
        parent: Period,
        keep: &BTreeSet<NaiveDate>,
    ) -> SummaryResult<usize> {
        let Some(kind) = child_type(parent) else {
            return Ok(0);
        };
        let (from, until) = child_bounds(parent);
        let keep: Vec<String> = keep
            .iter()
            .map(|d| d.format("%Y-%m-%d").to_string())
            .collect();
        conn.immediate_transaction::<_, anyhow::Error, _>(|conn| {
            Ok(diesel::delete(
                to::time_overview
                    .filter(to::product_ref.eq(product_ref))
                    .filter(to::period_type.eq(kind.as_str()))
                    .filter(to::start_day.ge(&from))
                    .filter(to::start_day.lt(&until))
                    .filter(to::start_day.ne_all(&keep)),
            )
            .execute(conn)?)
        })
    }

    fn delete(
        &self,
        conn: &mut SqliteConnection,
        product_ref: i32,
        period: Period,
    ) -> SummaryResult<usize> {
        Ok(diesel::delete(to::time_overview.find((
            product_ref,
            period.start_day_str(),
            period.period_type.as_str(),
        )))
        .execute(conn)?)
    }

    fn dataset_counts_per_period(
        &self,
        conn: &mut SqliteConnection,
    ) -> SummaryResult<Vec<PeriodDatasetCount>> {
        Ok(to::time_overview
            .inner_join(pr::product)
            .select((pr::name, to::start_day, to::period_type, to::dataset_count))
            .order((pr::name.asc(), to::period_type.asc(), to::start_day.asc()))
            .load(conn)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrate;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn setup() -> (TempDir, SqliteConnection) {
        let dir = TempDir::new().unwrap();
        let url = dir.path().join("o.sqlite").display().to_string();
        migrate::run_sqlite(&url).unwrap();
        let mut conn = crate::db::connection::connect_sqlite(&url).unwrap();
        diesel::insert_into(pr::product)
            .values((pr::id.eq(1), pr::name.eq("ls8")))
            .execute(&mut conn)
            .unwrap();
        (dir, conn)
    }

    fn overview(period: Period, count: i64, at: DateTime<Utc>) -> TimePeriodOverview {
        let mut o = TimePeriodOverview::empty(1, period, at);
        o.dataset_count = count;
        o
    }

    #[test]
    fn stale_write_is_skipped() {
        let (_d, mut conn) = setup();
        let repo = SqliteOverviewRepo::new();
        let m = Period::month(2020, 1).unwrap();
        let newer = Utc.with_ymd_and_hms(2021, 1, 2, 0, 0, 0).unwrap();
        let older = Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap();

        assert_eq!(repo.upsert(&mut conn, &overview(m, 5, newer)).unwrap(), UpsertOutcome::Written);
        assert_eq!(
            repo.upsert(&mut conn, &overview(m, 9, older)).unwrap(),
            UpsertOutcome::SkippedStale
        );
        assert_eq!(repo.get(&mut conn, 1, m).unwrap().unwrap().dataset_count, 5);
        // equal generation time overwrites
        assert_eq!(repo.upsert(&mut conn, &overview(m, 7, newer)).unwrap(), UpsertOutcome::Written);
        assert_eq!(repo.get(&mut conn, 1, m).unwrap().unwrap().dataset_count, 7);
    }

    #[test]
    fn children_are_scoped_to_parent() {
        let (_d, mut conn) = setup();
        let repo = SqliteOverviewRepo::new();
        let at = Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap();
        for (y, m) in [(2019, 12), (2020, 1), (2020, 6), (2021, 1)] {
            repo.upsert(&mut conn, &overview(Period::month(y, m).unwrap(), 1, at)).unwrap();
        }
        let kids = repo
            .load_children(&mut conn, 1, Period::year(2020).unwrap())
            .unwrap();
        let days: Vec<_> = kids.iter().map(|o| o.period.start_day_str()).collect();
        assert_eq!(days, vec!["2020-01-01", "2020-06-01"]);

        let keep = BTreeSet::from([NaiveDate::from_ymd_opt(2020, 6, 1).unwrap()]);
        let n = repo
            .delete_children_except(&mut conn, 1, Period::year(2020).unwrap(), &keep)
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(repo.periods(&mut conn, 1, PeriodType::Month).unwrap().len(), 3);
    }

    #[test]
    fn counts_per_period_are_labelled() {
        let (_d, mut conn) = setup();
        let repo = SqliteOverviewRepo::new();
        let at = Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap();
        repo.upsert(&mut conn, &overview(Period::year(2020).unwrap(), 4, at)).unwrap();
        repo.upsert(&mut conn, &overview(Period::month(2020, 2).unwrap(), 4, at)).unwrap();
        let counts = repo.dataset_counts_per_period(&mut conn).unwrap();
        assert_eq!(counts.len(), 2);
        assert_eq!(counts[0].product_name, "ls8");
        assert_eq!(counts[0].period_type, "month");
        assert_eq!(counts[1].period_type, "year");
        assert_eq!(counts[1].dataset_count, 4);
    }

    #[test]
    fn missing_overview_is_none() {
        let (_d, mut conn) = setup();
        let repo = SqliteOverviewRepo::new();
        assert!(repo.get(&mut conn, 1, Period::all()).unwrap().is_none());
    }
}
