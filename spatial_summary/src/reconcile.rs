//! Multi-CRS footprint reconciliation.
//!
//! Footprints of one product may be stored in several native CRSes (one per UTM zone, say).
//! A geometric union is only defined within one CRS, so footprints are grouped by srid,
//! repaired and unioned per group, each group's union is reprojected once to the target
//! CRS, and the reprojected groups are unioned into the final footprint.

use std::collections::{BTreeMap, HashMap};

use geo::MultiPolygon;

use crate::{
    crs::CrsResolver,
    geometry::{self, Reprojector},
};

/// A geometry tagged with its srid.
#[derive(Debug, Clone, PartialEq)]
pub struct Footprint {
    /// CRS of `geometry`.
    pub srid: i32,
    /// Polygonal geometry.
    pub geometry: MultiPolygon<f64>,
}

/// Result of [`reconcile`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Reconciled {
    /// Union in the target CRS; `None` when no group could be reprojected.
    pub geometry: Option<MultiPolygon<f64>>,
    /// srids whose footprints made it into `geometry`, ascending.
    pub srids: Vec<i32>,
    /// Footprints that made it into `geometry`.
    pub footprint_count: usize,
}

/// Per-srid union of `footprints`, in srid order.
pub fn union_by_srid<'a, I>(footprints: I) -> BTreeMap<i32, (MultiPolygon<f64>, usize)>
where
    I: IntoIterator<Item = &'a Footprint>,
{
    let mut groups: BTreeMap<i32, Vec<&MultiPolygon<f64>>> = BTreeMap::new();
    for f in footprints {
        groups.entry(f.srid).or_default().push(&f.geometry);
    }
    groups
        .into_iter()
        .map(|(srid, geoms)| {
            let n = geoms.len();
            (srid, (geometry::union_all(geoms), n))
        })
        .collect()
}

/// Union footprints across CRSes into `target_srid`.
///
/// Groups whose srid has no projection definition, or whose reprojection fails, are
/// skipped with a warning rather than failing the whole reconciliation.
pub fn reconcile<'a, I>(footprints: I, target_srid: i32, resolver: &CrsResolver) -> Reconciled
where
    I: IntoIterator<Item = &'a Footprint>,
{
    let mut parts = Vec::new();
    let mut out = Reconciled::default();
    for (srid, (unioned, n)) in union_by_srid(footprints) {
        let projected = if srid == target_srid {
            Ok(unioned)
        } else {
            Reprojector::between(resolver, srid, target_srid).and_then(|r| r.reproject(&unioned))
        };
        match projected {
            Ok(g) => {
                parts.push(g);
                out.srids.push(srid);
                out.footprint_count += n;
            }
            Err(e) => {
                tracing::warn!(srid, target_srid, error = %e, "skipping footprints that cannot be reprojected");
            }
        }
    }
    if !parts.is_empty() {
        out.geometry = Some(geometry::union_all(&parts));
    }
    out
}

/// Synthesize a footprint for a dataset lacking geometry from a path/row reference grid:
/// the union of the grid shapes of `path` over the inclusive `rows` range.
///
/// Returns `None` when no shape of the range is known.
pub fn synthesize_footprint(
    path: i32,
    rows: (i32, i32),
    shapes: &HashMap<(i32, i32), MultiPolygon<f64>>,
) -> Option<MultiPolygon<f64>> {
    let tiles: Vec<&MultiPolygon<f64>> = (rows.0..=rows.1)
        .filter_map(|row| shapes.get(&(path, row)))
        .collect();
    (!tiles.is_empty()).then(|| geometry::union_all(tiles))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{crs::SridRegistry, models::SpatialRefSys};
    use geo::{Area, polygon};

    fn resolver() -> CrsResolver {
        let row = |srid: i32, proj4: &str| SpatialRefSys {
            srid,
            auth_name: "EPSG".into(),
            auth_srid: srid,
            proj4text: proj4.into(),
        };
        CrsResolver::new(SridRegistry::from_rows([
            row(4326, "+proj=longlat +datum=WGS84 +no_defs"),
            row(32755, "+proj=utm +zone=55 +south +datum=WGS84 +units=m +no_defs"),
            row(32756, "+proj=utm +zone=56 +south +datum=WGS84 +units=m +no_defs"),
        ]))
    }

    fn square(srid: i32, x0: f64, y0: f64, size: f64) -> Footprint {
        Footprint {
            srid,
            geometry: MultiPolygon::new(vec![polygon![
                (x: x0, y: y0), (x: x0 + size, y: y0),
                (x: x0 + size, y: y0 + size), (x: x0, y: y0 + size)
            ]]),
        }
    }

    #[test]
    fn groups_are_unioned_before_reprojection() {
        let fps = vec![
            square(32755, 700_000.0, 6_200_000.0, 50_000.0),
            square(32755, 720_000.0, 6_200_000.0, 50_000.0),
            square(32756, 250_000.0, 6_200_000.0, 50_000.0),
        ];
        let by = union_by_srid(&fps);
        assert_eq!(by.len(), 2);
        assert_eq!(by[&32755].1, 2);
        assert!((by[&32755].0.unsigned_area() - 70_000.0 * 50_000.0).abs() < 1.0);

        let r = reconcile(&fps, 4326, &resolver());
        assert_eq!(r.srids, vec![32755, 32756]);
        assert_eq!(r.footprint_count, 3);
        let g = r.geometry.unwrap();
        assert!(g.unsigned_area() > 0.0);
        for p in &g.0 {
            for c in &p.exterior().0 {
                assert!((140.0..160.0).contains(&c.x) && (-40.0..-30.0).contains(&c.y));
            }
        }
    }

    #[test]
    fn unknown_srids_are_skipped() {
        let fps = vec![square(999, 0.0, 0.0, 1.0), square(4326, 150.0, -30.0, 1.0)];
        let r = reconcile(&fps, 4326, &resolver());
        assert_eq!(r.srids, vec![4326]);
        assert_eq!(r.footprint_count, 1);
    }

    #[test]
    fn empty_input_has_no_geometry() {
        let r = reconcile(&Vec::<Footprint>::new(), 4326, &resolver());
        assert!(r.geometry.is_none());
        assert_eq!(r.footprint_count, 0);
    }

    #[test]
    fn synthesized_footprint_covers_row_range() {
        let mut shapes = HashMap::new();
        for row in 80..=85 {
            shapes.insert((90, row), square(4326, 140.0, -(row as f64) / 3.0, 1.0).geometry);
        }
        let fp = synthesize_footprint(90, (82, 84), &shapes).unwrap();
        assert!(fp.unsigned_area() > 0.0);
        assert!(synthesize_footprint(91, (82, 84), &shapes).is_none());
    }
}
