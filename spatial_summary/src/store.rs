//! The summary store: the per-product refresh pipeline and the query surface.
//!
//! A refresh runs, for one product:
//! 1. product record upsert and `last_refresh`,
//! 2. spatial index synchronization from the last successful watermark (or full),
//! 3. region rebuild,
//! 4. staleness planning, then month+day, year and all-time overview rebuilds,
//! 5. product statistics, fixed metadata and linked products,
//! 6. `last_successful_summary` moved to the refresh start.
//!
//! Every write is scoped to the product, so refreshes of distinct products do not
//! interact. Nothing here holds a transaction across stages.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use chrono_tz::Tz;
use diesel::SqliteConnection;
use geo::MultiPolygon;
use uuid::Uuid;

use crate::{
    catalog::{ArchiveFilter, CatalogProduct, DatasetCatalog, DatasetQuery, ProductFields, for_each_page},
    config::SummaryConfig,
    crs::CrsResolver,
    error::SummaryError,
    models::DatasetSpatial,
    overview::{
        OverviewRepo, PeriodDatasetCount, SqliteOverviewRepo, TimePeriodOverview, UpsertOutcome,
        build,
    },
    period::{Period, PeriodType, TimeWindow},
    product::{self, ProductSummary},
    regions::{self, RegionSummary},
    spatial::{self, Synchronizer},
    staleness::{self, RefreshPlan},
};

/// Outcome of one product refresh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshStats {
    /// Spatial index rows inserted or overwritten.
    pub datasets_added: usize,
    /// Spatial index rows removed.
    pub datasets_removed: usize,
    /// Region rows written or deleted.
    pub regions_changed: usize,
}

/// Datasets added on one day to one product.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrivalBucket {
    /// UTC day of arrival.
    pub day: NaiveDate,
    /// Product name.
    pub product_name: String,
    /// Datasets added that day.
    pub dataset_count: usize,
    /// Up to three dataset ids, earliest added first.
    pub sample_ids: Vec<Uuid>,
}

const ARRIVAL_SAMPLES: usize = 3;

/// Summary pipeline over a dataset catalog.
pub struct SummaryStore<C> {
    catalog: C,
    config: SummaryConfig,
    grouping_tz: Tz,
    resolver: CrsResolver,
    repo: SqliteOverviewRepo,
}

impl<C> std::fmt::Debug for SummaryStore<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SummaryStore")
            .field("grouping_tz", &self.grouping_tz)
            .field("footprint_srid", &self.config.footprint_srid)
            .field("resolver", &self.resolver)
            .finish()
    }
}

impl<C: DatasetCatalog> SummaryStore<C> {
    /// Store over `catalog`, loading the CRS registry from the migrated database.
    pub fn new(
        conn: &mut SqliteConnection,
        catalog: C,
        config: SummaryConfig,
    ) -> anyhow::Result<Self> {
        let grouping_tz = config.grouping_tz()?;
        let resolver = CrsResolver::load(conn)?;
        Ok(SummaryStore {
            catalog,
            config,
            grouping_tz,
            resolver,
            repo: SqliteOverviewRepo::new(),
        })
    }

    /// The catalog.
    pub fn catalog(&self) -> &C {
        &self.catalog
    }

    /// Active configuration.
    pub fn config(&self) -> &SummaryConfig {
        &self.config
    }

    /// CRS resolver shared by every stage.
    pub fn resolver(&self) -> &CrsResolver {
        &self.resolver
    }

    /// Overview repository.
    pub fn repo(&self) -> &SqliteOverviewRepo {
        &self.repo
    }

    fn product(&self, name: &str) -> anyhow::Result<CatalogProduct> {
        self.catalog
            .product(name)?
            .ok_or_else(|| SummaryError::UnknownProduct(name.to_string()).into())
    }

    fn product_context(&self, name: &str) -> anyhow::Result<(CatalogProduct, ProductFields)> {
        let product = self.product(name)?;
        let metadata_type = self
            .catalog
            .metadata_type(&product.metadata_type)?
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "product {} references unknown metadata type {}",
                    product.name,
                    product.metadata_type
                )
            })?;
        let overrides = self.config.product(&product.name);
        let fields = ProductFields::resolve(
            &metadata_type,
            overrides.and_then(|o| o.region_code.as_ref()),
            overrides.and_then(|o| o.default_crs.as_deref()),
        )?;
        Ok((product, fields))
    }

    /// Refresh one product. `force` resynchronizes everything and rebuilds every period.
    pub fn refresh(
        &self,
        conn: &mut SqliteConnection,
        name: &str,
        force: bool,
    ) -> anyhow::Result<RefreshStats> {
        let (product, fields) = self.product_context(name)?;
        if self.catalog.total_dataset_count()? == 0 {
            return Err(SummaryError::EmptyDb.into());
        }
        let product_ref = product::upsert_product_record(conn, &product)?;
        let watermark = product::get_product_summary_by_id(conn, product_ref)?
            .and_then(|s| s.last_successful_summary);
        let started = Utc::now();
        product::record_refresh_start(conn, product_ref, started)?;

        let watermark = watermark.filter(|_| !force);
        let previous = match watermark {
            Some(since) => {
                staleness::previous_months(conn, &self.catalog, &product, since, self.grouping_tz)?
            }
            None => BTreeSet::new(),
        };
        let sync = Synchronizer::new(&self.catalog, &self.resolver, &product, &fields)
            .sync(conn, watermark, force)?;
        let regions_changed = regions::refresh_regions(
            conn,
            product_ref,
            &self.resolver,
            self.config.region_simplify_tolerance,
        )?;

        let mut plan = self.plan(conn, &product, &fields, watermark)?;
        for m in previous {
            plan.add_month(m);
        }
        self.rebuild(conn, product_ref, &plan)?;

        let count = product::update_stats(conn, product_ref)?;
        let sample = self.config.fixed_metadata_sample_size;
        let fixed = product::compute_fixed_metadata(&self.catalog, &product, &fields, sample)?;
        let (sources, derived) = product::linked_products(&self.catalog, &product, sample)?;
        product::set_product_details(conn, product_ref, &fixed, &sources, &derived)?;
        product::mark_successful(conn, product_ref, started)?;

        tracing::info!(
            product = %product.name,
            datasets = count,
            added = sync.upserted,
            removed = sync.deleted,
            regions_changed,
            months = plan.month_count(),
            force,
            "product refreshed"
        );
        Ok(RefreshStats {
            datasets_added: sync.upserted,
            datasets_removed: sync.deleted,
            regions_changed,
        })
    }

    /// Refresh every catalog product. A failing product is logged and does not stop the rest.
    pub fn refresh_all(
        &self,
        conn: &mut SqliteConnection,
        force: bool,
    ) -> anyhow::Result<Vec<(String, anyhow::Result<RefreshStats>)>> {
        let mut out = Vec::new();
        for p in self.catalog.products()? {
            let res = self.refresh(conn, &p.name, force);
            if let Err(e) = &res {
                tracing::warn!(product = %p.name, error = %e, "product refresh failed");
            }
            out.push((p.name, res));
        }
        Ok(out)
    }

    /// Periods to rebuild. Without a watermark every month with data or a stored
    /// overview is planned.
    fn plan(
        &self,
        conn: &mut SqliteConnection,
        product: &CatalogProduct,
        fields: &ProductFields,
        watermark: Option<DateTime<Utc>>,
    ) -> anyhow::Result<RefreshPlan> {
        let mut plan = RefreshPlan::new();
        match watermark {
            None => {
                for m in spatial::months_with_data(conn, product.id, self.grouping_tz)? {
                    plan.add_month(m);
                }
                for m in self.repo.periods(conn, product.id, PeriodType::Month)? {
                    plan.add_month(m.start_day);
                }
                for y in self.repo.periods(conn, product.id, PeriodType::Year)? {
                    plan.add_year(y.start_day);
                }
            }
            Some(since) => {
                let months = staleness::outdated_months(
                    &self.catalog,
                    product,
                    fields,
                    Some(since),
                    self.grouping_tz,
                )?;
                for (m, _) in months {
                    plan.add_month(m);
                }
                for y in staleness::outdated_years(conn, &self.repo, product.id)? {
                    plan.add_year(y);
                }
            }
        }
        Ok(plan)
    }

    fn rebuild(
        &self,
        conn: &mut SqliteConnection,
        product_ref: i32,
        plan: &RefreshPlan,
    ) -> anyhow::Result<()> {
        let srid = self.config.footprint_srid;
        let mut stale_writes = 0usize;
        let mut write = |conn: &mut SqliteConnection, o: &TimePeriodOverview| -> anyhow::Result<()> {
            if self.repo.upsert(conn, o)? == UpsertOutcome::SkippedStale {
                stale_writes += 1;
            }
            Ok(())
        };

        for month in plan.months() {
            let (overview, days) = build::build_month_and_days(
                conn,
                product_ref,
                month,
                self.grouping_tz,
                srid,
                &self.resolver,
            )?;
            let keep: BTreeSet<NaiveDate> = days.iter().map(|d| d.period.start_day).collect();
            if overview.dataset_count == 0 {
                self.repo.delete(conn, product_ref, month)?;
            } else {
                write(conn, &overview)?;
                for day in &days {
                    write(conn, day)?;
                }
            }
            self.repo.delete_children_except(conn, product_ref, month, &keep)?;
        }

        let mut years_changed = false;
        for year in plan.years() {
            let months = self.repo.load_children(conn, product_ref, year)?;
            years_changed = true;
            if months.is_empty() {
                self.repo.delete(conn, product_ref, year)?;
                continue;
            }
            let o = build::combine(product_ref, year, &months, srid, &self.resolver, Utc::now());
            write(conn, &o)?;
        }

        let all = Period::all();
        if years_changed || self.repo.get(conn, product_ref, all)?.is_none() {
            let years = self.repo.load_children(conn, product_ref, all)?;
            let o = build::combine(product_ref, all, &years, srid, &self.resolver, Utc::now());
            write(conn, &o)?;
        }
        if stale_writes > 0 {
            tracing::warn!(product_ref, stale_writes, "some overviews were already newer");
        }
        Ok(())
    }

    /// Stored overview of a product for a (year, month, day) selector, with
    /// `footprint_wgs84` filled in. `None` when never generated.
    pub fn get_overview(
        &self,
        conn: &mut SqliteConnection,
        name: &str,
        year: Option<i32>,
        month: Option<u32>,
        day: Option<u32>,
    ) -> anyhow::Result<Option<TimePeriodOverview>> {
        let period = Period::from_time_spec(year, month, day)?;
        let product = self.product(name)?;
        let mut overview = self.repo.get(conn, product.id, period)?;
        if let Some(o) = overview.as_mut() {
            o.derive_wgs84(&self.resolver);
        }
        Ok(overview)
    }

    /// Regions of a product; `None` when it has none besides the unregioned bucket.
    pub fn get_region_summaries(
        &self,
        conn: &mut SqliteConnection,
        name: &str,
    ) -> anyhow::Result<Option<Vec<RegionSummary>>> {
        let product = self.product(name)?;
        regions::get_region_summaries(conn, product.id)
    }

    /// One region of a product.
    pub fn get_region(
        &self,
        conn: &mut SqliteConnection,
        name: &str,
        region_code: &str,
    ) -> anyhow::Result<Option<RegionSummary>> {
        let product = self.product(name)?;
        regions::get_region(conn, product.id, region_code)
    }

    /// Months with datasets changed after `since`, with change counts.
    pub fn outdated_months(
        &self,
        name: &str,
        since: Option<DateTime<Utc>>,
    ) -> anyhow::Result<Vec<(NaiveDate, usize)>> {
        let (product, fields) = self.product_context(name)?;
        staleness::outdated_months(&self.catalog, &product, &fields, since, self.grouping_tz)
    }

    /// Years whose stored overview predates one of their months.
    pub fn outdated_years(
        &self,
        conn: &mut SqliteConnection,
        name: &str,
    ) -> anyhow::Result<Vec<NaiveDate>> {
        let product = self.product(name)?;
        staleness::outdated_years(conn, &self.repo, product.id)
    }

    /// Active datasets added within `period` before the newest arrival, per UTC day and
    /// product; newest day first, then product name.
    pub fn latest_arrivals(&self, period: Duration) -> anyhow::Result<Vec<ArrivalBucket>> {
        let mut newest: Option<DateTime<Utc>> = None;
        let everything = DatasetQuery {
            archived: ArchiveFilter::Any,
            ..Default::default()
        };
        for_each_page(&self.catalog, &everything, |batch| {
            newest = newest.max(batch.iter().map(|d| d.added).max());
            Ok(())
        })?;
        let Some(newest) = newest else {
            return Err(SummaryError::EmptyDb.into());
        };
        let query = DatasetQuery {
            archived: ArchiveFilter::Active,
            added_after: Some(newest - period),
            ..Default::default()
        };
        let mut buckets: BTreeMap<(NaiveDate, i32), (usize, Vec<Uuid>)> = BTreeMap::new();
        for_each_page(&self.catalog, &query, |batch| {
            for d in batch {
                let b = buckets
                    .entry((d.added.date_naive(), d.product_id))
                    .or_default();
                b.0 += 1;
                if b.1.len() < ARRIVAL_SAMPLES {
                    b.1.push(d.id);
                }
            }
            Ok(())
        })?;
        let mut out = Vec::with_capacity(buckets.len());
        for ((day, product_id), (dataset_count, sample_ids)) in buckets {
            let product_name = self
                .catalog
                .product_by_id(product_id)?
                .map_or_else(|| product_id.to_string(), |p| p.name);
            out.push(ArrivalBucket {
                day,
                product_name,
                dataset_count,
                sample_ids,
            });
        }
        out.sort_by(|a, b| b.day.cmp(&a.day).then_with(|| a.product_name.cmp(&b.product_name)));
        Ok(out)
    }

    /// Stored dataset counts of every overview, labelled by product name.
    pub fn product_dataset_counts_per_period(
        &self,
        conn: &mut SqliteConnection,
    ) -> anyhow::Result<Vec<PeriodDatasetCount>> {
        self.repo.dataset_counts_per_period(conn)
    }

    /// Stored rollup of a product.
    pub fn get_product_summary(
        &self,
        conn: &mut SqliteConnection,
        name: &str,
    ) -> anyhow::Result<Option<ProductSummary>> {
        product::get_product_summary(conn, name)
    }

    /// Indexed datasets of a product in a region, newest first.
    pub fn datasets_by_region(
        &self,
        conn: &mut SqliteConnection,
        name: &str,
        region_code: &str,
        window: &TimeWindow,
        limit: i64,
        offset: i64,
    ) -> anyhow::Result<Vec<DatasetSpatial>> {
        let product = self.product(name)?;
        spatial::datasets_by_region(conn, product.id, region_code, window, limit, offset)
    }

    /// Names of products with datasets in a region, by product id.
    pub fn products_by_region(
        &self,
        conn: &mut SqliteConnection,
        region_code: &str,
        window: &TimeWindow,
        limit: i64,
        offset: i64,
    ) -> anyhow::Result<Vec<String>> {
        let mut out = Vec::new();
        for id in spatial::products_by_region(conn, region_code, window, limit, offset)? {
            if let Some(p) = self.catalog.product_by_id(id)? {
                out.push(p.name);
            }
        }
        Ok(out)
    }

    /// A dataset's footprint in EPSG:4326 and its region code.
    pub fn dataset_footprint_region(
        &self,
        conn: &mut SqliteConnection,
        id: Uuid,
    ) -> anyhow::Result<Option<(Option<MultiPolygon<f64>>, Option<String>)>> {
        spatial::dataset_footprint_region(conn, &self.resolver, id)
    }

    /// Fill missing footprints of a product from a path/row reference grid in EPSG:4326.
    pub fn apply_synthesized_footprints(
        &self,
        conn: &mut SqliteConnection,
        name: &str,
        shapes: &HashMap<(i32, i32), MultiPolygon<f64>>,
    ) -> anyhow::Result<usize> {
        let (product, fields) = self.product_context(name)?;
        Synchronizer::new(&self.catalog, &self.resolver, &product, &fields)
            .apply_synthesized_footprints(conn, shapes)
    }
}
