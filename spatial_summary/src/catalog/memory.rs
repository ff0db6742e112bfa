//! In-process [`DatasetCatalog`] implementation.
//!
//! Holds products, metadata types, datasets and lineage edges behind one `RwLock`.
//! Mutators mirror the catalog events the summaries react to: indexing, archiving,
//! restoring, metadata updates and out-of-band deletion.

use std::{
    collections::BTreeMap,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use anyhow::{anyhow, bail};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde_json::Value;
use uuid::Uuid;

use super::{
    ArchiveFilter, CatalogDataset, CatalogProduct, DatasetCatalog, DatasetPage, DatasetQuery,
    Derivation, FieldExpression, MetadataType,
};

#[derive(Debug, Default)]
struct State {
    metadata_types: IndexMap<String, MetadataType>,
    products: BTreeMap<i32, CatalogProduct>,
    datasets: BTreeMap<Uuid, CatalogDataset>,
    sources: BTreeMap<Uuid, Vec<Uuid>>,
}

/// Thread-safe in-memory catalog.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    state: RwLock<State>,
}

impl InMemoryCatalog {
    /// Empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> anyhow::Result<RwLockReadGuard<'_, State>> {
        self.state.read().map_err(|_| anyhow!("catalog lock poisoned"))
    }

    fn write(&self) -> anyhow::Result<RwLockWriteGuard<'_, State>> {
        self.state.write().map_err(|_| anyhow!("catalog lock poisoned"))
    }

    /// Register (or replace) a metadata type.
    pub fn add_metadata_type(&self, mt: MetadataType) -> anyhow::Result<()> {
        self.write()?.metadata_types.insert(mt.name.clone(), mt);
        Ok(())
    }

    /// Register a product; ids are assigned sequentially from 1.
    pub fn add_product(&self, name: &str, metadata_type: &str) -> anyhow::Result<CatalogProduct> {
        let mut st = self.write()?;
        if !st.metadata_types.contains_key(metadata_type) {
            bail!("unknown metadata type {metadata_type}");
        }
        if st.products.values().any(|p| p.name == name) {
            bail!("duplicate product {name}");
        }
        let id = st.products.keys().next_back().copied().unwrap_or(0) + 1;
        let p = CatalogProduct {
            id,
            name: name.to_string(),
            metadata_type: metadata_type.to_string(),
        };
        st.products.insert(id, p.clone());
        Ok(p)
    }

    /// Index a dataset into `product`.
    pub fn add_dataset(
        &self,
        product: &str,
        id: Uuid,
        metadata: Value,
        added: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        self.add_dataset_with_sources(product, id, metadata, added, &[])
    }

    /// Index a dataset with lineage sources.
    pub fn add_dataset_with_sources(
        &self,
        product: &str,
        id: Uuid,
        metadata: Value,
        added: DateTime<Utc>,
        sources: &[Uuid],
    ) -> anyhow::Result<()> {
        let mut st = self.write()?;
        let product_id = st
            .products
            .values()
            .find(|p| p.name == product)
            .map(|p| p.id)
            .ok_or_else(|| anyhow!("unknown product {product}"))?;
        if st.datasets.contains_key(&id) {
            bail!("dataset {id} already indexed");
        }
        st.datasets.insert(
            id,
            CatalogDataset {
                id,
                product_id,
                metadata,
                added,
                updated: added,
                archived: None,
            },
        );
        if !sources.is_empty() {
            st.sources.insert(id, sources.to_vec());
        }
        Ok(())
    }

    fn with_dataset<F>(&self, id: Uuid, f: F) -> anyhow::Result<()>
    where
        F: FnOnce(&mut CatalogDataset),
    {
        let mut st = self.write()?;
        let ds = st
            .datasets
            .get_mut(&id)
            .ok_or_else(|| anyhow!("unknown dataset {id}"))?;
        f(ds);
        Ok(())
    }

    /// Archive a dataset.
    pub fn archive(&self, id: Uuid, at: DateTime<Utc>) -> anyhow::Result<()> {
        self.with_dataset(id, |d| {
            d.archived = Some(at);
            d.updated = at;
        })
    }

    /// Un-archive a dataset.
    pub fn restore(&self, id: Uuid, at: DateTime<Utc>) -> anyhow::Result<()> {
        self.with_dataset(id, |d| {
            d.archived = None;
            d.updated = at;
        })
    }

    /// Bump a dataset's `updated` timestamp.
    pub fn touch(&self, id: Uuid, at: DateTime<Utc>) -> anyhow::Result<()> {
        self.with_dataset(id, |d| d.updated = at)
    }

    /// Replace a dataset's metadata document.
    pub fn update_metadata(&self, id: Uuid, metadata: Value, at: DateTime<Utc>) -> anyhow::Result<()> {
        self.with_dataset(id, |d| {
            d.metadata = metadata;
            d.updated = at;
        })
    }

    /// Delete a dataset without archiving it first.
    pub fn remove(&self, id: Uuid) -> anyhow::Result<bool> {
        let mut st = self.write()?;
        st.sources.remove(&id);
        Ok(st.datasets.remove(&id).is_some())
    }
}

fn matches(q: &DatasetQuery, d: &CatalogDataset) -> bool {
    let archived_ok = match q.archived {
        ArchiveFilter::Active => d.archived.is_none(),
        ArchiveFilter::Archived => d.archived.is_some(),
        ArchiveFilter::Any => true,
    };
    archived_ok
        && q.product_id.is_none_or(|p| p == d.product_id)
        && q.changed_after.is_none_or(|t| d.changed() > t)
        && q.added_after.is_none_or(|t| d.added > t)
}

impl DatasetCatalog for InMemoryCatalog {
    fn products(&self) -> anyhow::Result<Vec<CatalogProduct>> {
        Ok(self.read()?.products.values().cloned().collect())
    }

    fn product(&self, name: &str) -> anyhow::Result<Option<CatalogProduct>> {
        Ok(self.read()?.products.values().find(|p| p.name == name).cloned())
    }

    fn product_by_id(&self, id: i32) -> anyhow::Result<Option<CatalogProduct>> {
        Ok(self.read()?.products.get(&id).cloned())
    }

    fn metadata_type(&self, name: &str) -> anyhow::Result<Option<MetadataType>> {
        Ok(self.read()?.metadata_types.get(name).cloned())
    }

    fn datasets(&self, query: &DatasetQuery) -> anyhow::Result<DatasetPage> {
        let st = self.read()?;
        let mut hits: Vec<&CatalogDataset> =
            st.datasets.values().filter(|d| matches(query, d)).collect();
        hits.sort_by_key(|d| (d.added, d.id));

        let total = hits.len();
        let start = query.offset.min(total);
        let end = query
            .limit
            .map_or(total, |l| start.saturating_add(l).min(total));
        Ok(DatasetPage {
            datasets: hits[start..end].iter().map(|d| (*d).clone()).collect(),
            remaining: total - end,
        })
    }

    fn datasets_by_id(&self, ids: &[Uuid]) -> anyhow::Result<Vec<CatalogDataset>> {
        let st = self.read()?;
        Ok(ids.iter().filter_map(|id| st.datasets.get(id).cloned()).collect())
    }

    fn dataset_ids(&self, product_id: i32) -> anyhow::Result<Vec<Uuid>> {
        Ok(self
            .read()?
            .datasets
            .values()
            .filter(|d| d.product_id == product_id)
            .map(|d| d.id)
            .collect())
    }

    fn total_dataset_count(&self) -> anyhow::Result<usize> {
        Ok(self.read()?.datasets.len())
    }

    fn source_ids(&self, id: Uuid) -> anyhow::Result<Vec<Uuid>> {
        Ok(self.read()?.sources.get(&id).cloned().unwrap_or_default())
    }

    fn derived_ids(&self, id: Uuid) -> anyhow::Result<Vec<Uuid>> {
        Ok(self
            .read()?
            .sources
            .iter()
            .filter(|(_, srcs)| srcs.contains(&id))
            .map(|(child, _)| *child)
            .collect())
    }
}

/// Field layout of EO3-style dataset documents.
///
/// `center_time` is `properties.datetime`, falling back to the center of
/// `properties.dtr:start_datetime`..`dtr:end_datetime`; the footprint is the top-level
/// `geometry` in the CRS named by `crs`; `platform` and `instrument` are extra
/// search fields.
pub fn eo3_metadata_type() -> MetadataType {
    let col = |path: &[&str]| FieldExpression::column(path.iter().copied());
    let mut fields = IndexMap::new();
    fields.insert(
        "center_time".to_string(),
        FieldExpression::Derived(Derivation::Coalesce(vec![
            col(&["properties", "datetime"]),
            FieldExpression::Derived(Derivation::RangeCenter {
                begin: Box::new(col(&["properties", "dtr:start_datetime"])),
                end: Box::new(col(&["properties", "dtr:end_datetime"])),
            }),
        ])),
    );
    fields.insert(
        "creation_time".to_string(),
        col(&["properties", "odc:processing_datetime"]),
    );
    fields.insert("footprint".to_string(), col(&["geometry"]));
    fields.insert("crs".to_string(), col(&["crs"]));
    fields.insert(
        "region_code".to_string(),
        col(&["properties", "odc:region_code"]),
    );
    fields.insert("size_bytes".to_string(), col(&["properties", "odc:file_size"]));
    fields.insert("sat_path".to_string(), col(&["properties", "landsat:wrs_path"]));
    fields.insert("sat_row".to_string(), col(&["properties", "landsat:wrs_row"]));
    fields.insert("platform".to_string(), col(&["properties", "platform"]));
    fields.insert("instrument".to_string(), col(&["properties", "instruments"]));
    MetadataType {
        name: "eo3".to_string(),
        fields,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn t(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 5, 1, h, 0, 0).unwrap()
    }

    fn catalog() -> (InMemoryCatalog, Vec<Uuid>) {
        let cat = InMemoryCatalog::new();
        cat.add_metadata_type(eo3_metadata_type()).unwrap();
        cat.add_product("ls8", "eo3").unwrap();
        let ids: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        for (i, id) in ids.iter().enumerate() {
            cat.add_dataset("ls8", *id, json!({}), t(i as u32)).unwrap();
        }
        (cat, ids)
    }

    #[test]
    fn pages_report_remaining() {
        let (cat, _) = catalog();
        let page = cat
            .datasets(&DatasetQuery {
                limit: Some(2),
                offset: 1,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(page.datasets.len(), 2);
        assert_eq!(page.remaining, 2);
    }

    #[test]
    fn archive_filters_and_bumps_updated() {
        let (cat, ids) = catalog();
        cat.archive(ids[0], t(10)).unwrap();
        let active = super::super::collect_all(&cat, &DatasetQuery::default()).unwrap();
        assert_eq!(active.len(), 4);

        let changed = cat
            .datasets(&DatasetQuery {
                archived: ArchiveFilter::Archived,
                changed_after: Some(t(9)),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(changed.datasets.len(), 1);
        assert_eq!(changed.datasets[0].id, ids[0]);
    }

    #[test]
    fn lineage_is_navigable_both_ways() {
        let (cat, ids) = catalog();
        let child = Uuid::new_v4();
        cat.add_dataset_with_sources("ls8", child, json!({}), t(6), &[ids[1]])
            .unwrap();
        assert_eq!(cat.source_ids(child).unwrap(), vec![ids[1]]);
        assert_eq!(cat.derived_ids(ids[1]).unwrap(), vec![child]);
    }

    #[test]
    fn duplicate_products_are_rejected() {
        let (cat, _) = catalog();
        assert!(cat.add_product("ls8", "eo3").is_err());
        assert!(cat.add_product("s2", "nope").is_err());
    }
}
