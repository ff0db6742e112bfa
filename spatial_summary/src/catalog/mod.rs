//! The dataset catalog collaborator.
//!
//! The summaries are derived from an external catalog of datasets whose storage engine is
//! not part of this crate. [`DatasetCatalog`] is the capability the summary pipeline needs
//! from it: product and metadata-type lookup, filtered+paged dataset enumeration, bulk fetch
//! by id, and lineage links. [`memory::InMemoryCatalog`] is a process-local implementation.

pub mod field;
pub mod memory;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde_json::Value;
use uuid::Uuid;

pub use field::{Derivation, FieldExpression, ProductFields, SpatialValues};

/// A product (typed collection of datasets) as known to the catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogProduct {
    /// Catalog id; also the partition key of every summary table.
    pub id: i32,
    /// Unique product name.
    pub name: String,
    /// Name of the metadata type describing its datasets.
    pub metadata_type: String,
}

/// A metadata type: named search fields mapped to expressions over dataset documents.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataType {
    /// Unique name (e.g. "eo3").
    pub name: String,
    /// Logical field name -> expression. Well-known names: `center_time`, `creation_time`,
    /// `footprint`, `crs`, `region_code`, `size_bytes`, `sat_path`, `sat_row`.
    pub fields: IndexMap<String, FieldExpression>,
}

/// One catalog dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogDataset {
    /// Dataset identity.
    pub id: Uuid,
    /// Owning product id.
    pub product_id: i32,
    /// Metadata document.
    pub metadata: Value,
    /// When the dataset was indexed.
    pub added: DateTime<Utc>,
    /// Last modification (never earlier than `added`).
    pub updated: DateTime<Utc>,
    /// Set once archived.
    pub archived: Option<DateTime<Utc>>,
}

impl CatalogDataset {
    /// Latest of `added` and `updated`.
    pub fn changed(&self) -> DateTime<Utc> {
        self.added.max(self.updated)
    }
}

/// Which archive state to enumerate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ArchiveFilter {
    /// Only datasets that are not archived.
    #[default]
    Active,
    /// Only archived datasets.
    Archived,
    /// Everything.
    Any,
}

/// Filters for [`DatasetCatalog::datasets`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatasetQuery {
    /// Restrict to one product id.
    pub product_id: Option<i32>,
    /// Archive state.
    pub archived: ArchiveFilter,
    /// Only datasets added or updated strictly after this instant.
    pub changed_after: Option<DateTime<Utc>>,
    /// Only datasets added strictly after this instant.
    pub added_after: Option<DateTime<Utc>>,
    /// Page size; `None` means no limit.
    pub limit: Option<usize>,
    /// Rows to skip.
    pub offset: usize,
}

/// One page of a dataset enumeration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatasetPage {
    /// Datasets of this page, ordered by `(added, id)`.
    pub datasets: Vec<CatalogDataset>,
    /// Matching datasets beyond this page.
    pub remaining: usize,
}

/// Capability consumed from the catalog.
pub trait DatasetCatalog {
    /// Every product.
    fn products(&self) -> anyhow::Result<Vec<CatalogProduct>>;

    /// Product by name.
    fn product(&self, name: &str) -> anyhow::Result<Option<CatalogProduct>>;

    /// Product by id.
    fn product_by_id(&self, id: i32) -> anyhow::Result<Option<CatalogProduct>>;

    /// Metadata type by name.
    fn metadata_type(&self, name: &str) -> anyhow::Result<Option<MetadataType>>;

    /// Filtered, paged enumeration.
    fn datasets(&self, query: &DatasetQuery) -> anyhow::Result<DatasetPage>;

    /// Bulk fetch; unknown ids are skipped.
    fn datasets_by_id(&self, ids: &[Uuid]) -> anyhow::Result<Vec<CatalogDataset>>;

    /// Every dataset id of the product, archived ones included.
    fn dataset_ids(&self, product_id: i32) -> anyhow::Result<Vec<Uuid>>;

    /// Datasets across all products, archived ones included.
    fn total_dataset_count(&self) -> anyhow::Result<usize>;

    /// Direct lineage sources of a dataset.
    fn source_ids(&self, id: Uuid) -> anyhow::Result<Vec<Uuid>>;

    /// Datasets that list `id` as a source.
    fn derived_ids(&self, id: Uuid) -> anyhow::Result<Vec<Uuid>>;
}

/// Page size used when walking a full enumeration.
pub const PAGE_SIZE: usize = 1000;

/// Walk every page of `query`, calling `f` on each batch. Returns the number of datasets seen.
pub fn for_each_page<C, F>(catalog: &C, query: &DatasetQuery, mut f: F) -> anyhow::Result<usize>
where
    C: DatasetCatalog + ?Sized,
    F: FnMut(Vec<CatalogDataset>) -> anyhow::Result<()>,
{
    let mut q = query.clone();
    q.limit = Some(PAGE_SIZE);
    let mut seen = 0;
    loop {
        let page = catalog.datasets(&q)?;
        let n = page.datasets.len();
        seen += n;
        if n > 0 {
            f(page.datasets)?;
        }
        if page.remaining == 0 || n == 0 {
            return Ok(seen);
        }
        q.offset += n;
    }
}

/// Collect a full enumeration.
pub fn collect_all<C>(catalog: &C, query: &DatasetQuery) -> anyhow::Result<Vec<CatalogDataset>>
where
    C: DatasetCatalog + ?Sized,
{
    let mut out = Vec::new();
    for_each_page(catalog, query, |batch| {
        out.extend(batch);
        Ok(())
    })?;
    Ok(out)
}
