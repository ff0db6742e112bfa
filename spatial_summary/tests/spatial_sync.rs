mod common;

use chrono::Duration;
use diesel::prelude::*;
use spatial_summary::catalog::memory::{InMemoryCatalog, eo3_metadata_type};
use spatial_summary::catalog::{DatasetCatalog, ProductFields};
use spatial_summary::crs::CrsResolver;
use spatial_summary::error::SummaryError;
use spatial_summary::models::DatasetSpatial;
use spatial_summary::product;
use spatial_summary::schema::dataset_spatial::dsl as ds;
use spatial_summary::spatial::Synchronizer;
use uuid::Uuid;

fn stored(conn: &mut SqliteConnection) -> Vec<DatasetSpatial> {
    ds::dataset_spatial
        .select(DatasetSpatial::as_select())
        .order(ds::center_time.asc())
        .load(conn)
        .unwrap()
}

fn seeded() -> (InMemoryCatalog, Vec<Uuid>) {
    let cat = common::catalog_with_product("ls8");
    let mut ids = Vec::new();
    for (i, crs) in ["EPSG:32756", "EPSG:32756", "not a crs"].iter().enumerate() {
        let id = Uuid::new_v4();
        cat.add_dataset(
            "ls8",
            id,
            common::eo3_doc(
                &format!("2020-01-0{}T00:00:00Z", i + 1),
                Some(crs),
                Some(common::square(300_000.0, 6_200_000.0, 10_000.0)),
                (i == 0).then_some("56_83"),
                Some(5),
            ),
            common::indexed_at(),
        )
        .unwrap();
        ids.push(id);
    }
    (cat, ids)
}

#[test]
fn upsert_extracts_fields_and_resolves_crs() {
    let (_db, mut conn) = common::setup_db();
    let (cat, ids) = seeded();
    let resolver = CrsResolver::load(&mut conn).unwrap();
    let p = cat.product("ls8").unwrap().unwrap();
    product::upsert_product_record(&mut conn, &p).unwrap();
    let fields = ProductFields::resolve(&eo3_metadata_type(), None, None).unwrap();
    let sync = Synchronizer::new(&cat, &resolver, &p, &fields);

    let stats = sync.sync(&mut conn, None, false).unwrap();
    assert_eq!(stats.upserted, 3);
    assert_eq!(stats.deleted, 0);

    let rows = stored(&mut conn);
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0].id, ids[0].hyphenated().to_string());
    assert_eq!(rows[0].center_time, "2020-01-01T00:00:00.000Z");
    assert_eq!(rows[0].footprint_srid, Some(32756));
    assert_eq!(rows[0].region_code.as_deref(), Some("56_83"));
    assert_eq!(rows[0].size_bytes, Some(5));
    assert_eq!(rows[2].footprint_srid, None, "unresolvable CRS is stored as NULL");
    assert!(rows[2].footprint.is_some());

    // Re-running overwrites rather than duplicating.
    sync.sync(&mut conn, None, false).unwrap();
    assert_eq!(stored(&mut conn).len(), 3);
}

#[test]
fn archived_datasets_leave_the_index_and_full_resync_removes_vanished_ones() {
    let (_db, mut conn) = common::setup_db();
    let (cat, ids) = seeded();
    let resolver = CrsResolver::load(&mut conn).unwrap();
    let p = cat.product("ls8").unwrap().unwrap();
    product::upsert_product_record(&mut conn, &p).unwrap();
    let fields = ProductFields::resolve(&eo3_metadata_type(), None, None).unwrap();
    let sync = Synchronizer::new(&cat, &resolver, &p, &fields);
    sync.sync(&mut conn, None, false).unwrap();

    let watermark = common::indexed_at() + Duration::hours(1);
    cat.archive(ids[0], watermark + Duration::hours(1)).unwrap();
    let stats = sync.sync(&mut conn, Some(watermark), false).unwrap();
    assert_eq!(stats, spatial_summary::spatial::SyncStats { upserted: 0, deleted: 1 });
    assert_eq!(stored(&mut conn).len(), 2);

    // An out-of-band removal is invisible to the incremental path.
    assert!(cat.remove(ids[1]).unwrap());
    let stats = sync.sync(&mut conn, Some(watermark), false).unwrap();
    assert_eq!(stats.deleted, 0);
    assert_eq!(stored(&mut conn).len(), 2);

    let stats = sync.sync(&mut conn, Some(watermark), true).unwrap();
    assert_eq!(stats.deleted, 1);
    let rows = stored(&mut conn);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, ids[2].hyphenated().to_string());
}

#[test]
fn syncing_an_empty_catalog_is_empty_db() {
    let (_db, mut conn) = common::setup_db();
    let cat = common::catalog_with_product("ls8");
    let resolver = CrsResolver::load(&mut conn).unwrap();
    let p = cat.product("ls8").unwrap().unwrap();
    product::upsert_product_record(&mut conn, &p).unwrap();
    let fields = ProductFields::resolve(&eo3_metadata_type(), None, None).unwrap();

    for full in [false, true] {
        let err = Synchronizer::new(&cat, &resolver, &p, &fields)
            .sync(&mut conn, None, full)
            .unwrap_err();
        assert_eq!(err.downcast_ref::<SummaryError>(), Some(&SummaryError::EmptyDb));
    }
}

#[test]
fn default_crs_applies_when_dataset_crs_is_missing() {
    let (_db, mut conn) = common::setup_db();
    let cat = common::catalog_with_product("ls8");
    cat.add_dataset(
        "ls8",
        Uuid::new_v4(),
        common::eo3_doc(
            "2020-01-01T00:00:00Z",
            None,
            Some(common::square(300_000.0, 6_200_000.0, 10.0)),
            None,
            None,
        ),
        common::indexed_at(),
    )
    .unwrap();
    let resolver = CrsResolver::load(&mut conn).unwrap();
    let p = cat.product("ls8").unwrap().unwrap();
    product::upsert_product_record(&mut conn, &p).unwrap();
    let fields = ProductFields::resolve(&eo3_metadata_type(), None, Some("EPSG:32756")).unwrap();
    Synchronizer::new(&cat, &resolver, &p, &fields)
        .sync(&mut conn, None, false)
        .unwrap();
    assert_eq!(stored(&mut conn)[0].footprint_srid, Some(32756));
}
