mod common;

use proptest::prelude::*;
use spatial_summary::crs::{CrsDescriptor, CrsResolver};

fn text(s: &str) -> CrsDescriptor {
    CrsDescriptor::Text(s.to_string())
}

#[test]
fn seeded_registry_resolves_every_descriptor_form() {
    let (_db, mut conn) = common::setup_db();
    let r = CrsResolver::load(&mut conn).unwrap();

    assert_eq!(r.resolve(Some(&text("EPSG:32756")), None), Some(32756));
    assert_eq!(r.resolve(Some(&text("epsg:4326")), None), Some(4326));
    let wkt = r#"GEOGCS["WGS 84",DATUM["WGS_1984",SPHEROID["WGS 84",6378137,298.257223563]],AUTHORITY["EPSG","4326"]]"#;
    assert_eq!(r.resolve(Some(&text(wkt)), None), Some(4326));
    let gda = CrsDescriptor::DatumZone {
        datum: "GDA94".into(),
        zone: -56,
    };
    assert_eq!(r.resolve(Some(&gda), None), Some(28356));
    assert_eq!(r.resolve(Some(&text("not a crs")), None), None);
    assert_eq!(r.resolve(Some(&text("EPSG:999999")), None), None);
    assert_eq!(r.resolve(None, Some("EPSG:3577")), Some(3577));

    assert_eq!(r.srid_name(32755).as_deref(), Some("EPSG:32755"));
    assert_eq!(r.srid_name(1), None);
    r.srid_name(32755);
    assert_eq!(r.memoized_names(), 2);
}

#[test]
fn refresh_keeps_names_and_reloads_registry() {
    let (_db, mut conn) = common::setup_db();
    let r = CrsResolver::load(&mut conn).unwrap();
    let before = r.registry().len();
    r.srid_name(4326);
    r.refresh(&mut conn).unwrap();
    assert_eq!(r.registry().len(), before);
    assert_eq!(r.memoized_names(), 1);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]
    #[test]
    fn utm_shorthand_round_trips_through_names(zone in 1i32..=60, south in any::<bool>()) {
        let (_db, mut conn) = common::setup_db();
        let r = CrsResolver::load(&mut conn).unwrap();
        let srid = if south { 32700 + zone } else { 32600 + zone };
        let name = format!("EPSG:{srid}");
        prop_assert_eq!(r.resolve(Some(&text(&name)), None), Some(srid));
        prop_assert_eq!(r.srid_name(srid), Some(name));
    }
}
