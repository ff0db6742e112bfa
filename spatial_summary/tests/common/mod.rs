#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use diesel::QueryableByName;
use diesel::prelude::*;
use diesel::sql_types::{Integer, Text};
use serde_json::{Value, json};
use spatial_summary::catalog::memory::{InMemoryCatalog, eo3_metadata_type};
use spatial_summary::config::SummaryConfig;
use spatial_summary::db::{connection, migrate};
use spatial_summary::store::SummaryStore;
use std::path::PathBuf;
use tempfile::TempDir;
use uuid::Uuid;

#[derive(QueryableByName)]
struct JournalMode {
    #[diesel(sql_type = Text)]
    journal_mode: String,
}
#[derive(QueryableByName)]
struct ForeignKeys {
    #[diesel(sql_type = Integer)]
    foreign_keys: i32,
}
#[derive(QueryableByName)]
struct BusyTimeout {
    #[diesel(sql_type = Integer, column_name = "timeout")]
    busy_timeout: i32,
}

pub struct TestDb {
    _dir: TempDir,    // keep alive for the life of the test
    pub path: String, // <tmpdir>/test.db
}

pub fn setup_db() -> (TestDb, SqliteConnection) {
    let dir = TempDir::new().expect("tempdir");
    let mut p = PathBuf::from(dir.path());
    p.push("test.db");
    let path = p.to_string_lossy().to_string();

    migrate::run_all(&path).expect("migrations");

    let conn = connection::connect_sqlite(&path).expect("connect");
    (TestDb { _dir: dir, path }, conn)
}

pub fn assert_sqlite_pragmas(conn: &mut SqliteConnection) {
    use diesel::sql_query;

    let jm: JournalMode = sql_query("PRAGMA journal_mode;").get_result(conn).unwrap();
    assert_eq!(jm.journal_mode.to_lowercase(), "wal");

    let fk: ForeignKeys = sql_query("PRAGMA foreign_keys;").get_result(conn).unwrap();
    assert_eq!(fk.foreign_keys, 1);

    let bt: BusyTimeout = sql_query("PRAGMA busy_timeout;").get_result(conn).unwrap();
    assert_eq!(bt.busy_timeout, 5000);
}

/// Fixed time when fixture datasets were indexed.
pub fn indexed_at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2021, 2, 1, 0, 0, 0).unwrap()
}

/// Square polygon, `size` metres wide, with lower-left corner at (x, y).
pub fn square(x: f64, y: f64, size: f64) -> Value {
    json!({
        "type": "Polygon",
        "coordinates": [[[x, y], [x + size, y], [x + size, y + size], [x, y + size], [x, y]]]
    })
}

/// An EO3-style dataset document.
pub fn eo3_doc(
    datetime: &str,
    crs: Option<&str>,
    geometry: Option<Value>,
    region: Option<&str>,
    size: Option<i64>,
) -> Value {
    let mut props = json!({
        "datetime": datetime,
        "odc:processing_datetime": "2021-01-15T00:00:00Z",
        "platform": "landsat-8",
    });
    if let Some(r) = region {
        props["odc:region_code"] = json!(r);
    }
    if let Some(s) = size {
        props["odc:file_size"] = json!(s);
    }
    let mut doc = json!({ "properties": props });
    if let Some(c) = crs {
        doc["crs"] = json!(c);
    }
    if let Some(g) = geometry {
        doc["geometry"] = g;
    }
    doc
}

/// Catalog with the eo3 metadata type and one product.
pub fn catalog_with_product(name: &str) -> InMemoryCatalog {
    let cat = InMemoryCatalog::new();
    cat.add_metadata_type(eo3_metadata_type()).unwrap();
    cat.add_product(name, "eo3").unwrap();
    cat
}

/// Eight datasets of `name` in March 2020, four in UTM 55S and four in UTM 56S.
pub fn seed_two_zones(cat: &InMemoryCatalog, name: &str) -> Vec<Uuid> {
    let mut ids = Vec::new();
    for i in 0..8u32 {
        let (crs, x, region) = if i < 4 {
            ("EPSG:32755", 600_000.0, "55_83")
        } else {
            ("EPSG:32756", 300_000.0, "56_83")
        };
        let y = 6_200_000.0 + f64::from(i % 4) * 20_000.0;
        let id = Uuid::new_v4();
        cat.add_dataset(
            name,
            id,
            eo3_doc(
                &format!("2020-03-{:02}T01:00:00Z", i + 2),
                Some(crs),
                Some(square(x, y, 30_000.0)),
                Some(region),
                Some(1_000),
            ),
            indexed_at(),
        )
        .unwrap();
        ids.push(id);
    }
    ids
}

pub fn store(conn: &mut SqliteConnection, cat: InMemoryCatalog) -> SummaryStore<InMemoryCatalog> {
    SummaryStore::new(conn, cat, SummaryConfig::default()).expect("store")
}
