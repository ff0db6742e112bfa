//! Footprint geometry: GeoJSON text codec, repair, union, simplification and reprojection.
//!
//! Footprints are polygonal; every decoded geometry is normalized to a [`MultiPolygon`].
//! Repair re-nodes a geometry through the overlay engine (the equivalent of a zero-width
//! buffer), which resolves self-intersections and ring orientation so later unions are
//! total over whatever geometries exist.

use anyhow::Context;
use geo::{Area, BooleanOps, Coord, Geometry, MapCoords, MultiPolygon, SimplifyVwPreserve};
use proj4rs::{proj::Proj, transform::transform};
use serde_json::Value;

use crate::{crs::CrsResolver, error::SummaryError};

/// Decode GeoJSON geometry text.
pub fn decode(text: &str) -> anyhow::Result<MultiPolygon<f64>> {
    let g: geojson::Geometry = serde_json::from_str(text)
        .map_err(|e| SummaryError::InvalidGeometry(e.to_string()))?;
    from_geojson(g)
}

/// Decode a GeoJSON geometry value embedded in a metadata document.
pub fn from_value(v: &Value) -> anyhow::Result<MultiPolygon<f64>> {
    let g: geojson::Geometry = serde_json::from_value(v.clone())
        .map_err(|e| SummaryError::InvalidGeometry(e.to_string()))?;
    from_geojson(g)
}

fn from_geojson(g: geojson::Geometry) -> anyhow::Result<MultiPolygon<f64>> {
    let geom = Geometry::<f64>::try_from(g)
        .map_err(|e| SummaryError::InvalidGeometry(e.to_string()))?;
    polygonal(geom).ok_or_else(|| SummaryError::InvalidGeometry("not polygonal".into()).into())
}

fn polygonal(geom: Geometry<f64>) -> Option<MultiPolygon<f64>> {
    match geom {
        Geometry::Polygon(p) => Some(MultiPolygon::new(vec![p])),
        Geometry::MultiPolygon(mp) => Some(mp),
        Geometry::Rect(r) => Some(MultiPolygon::new(vec![r.to_polygon()])),
        Geometry::Triangle(t) => Some(MultiPolygon::new(vec![t.to_polygon()])),
        Geometry::GeometryCollection(gc) => {
            let polys: Vec<_> = gc
                .into_iter()
                .filter_map(polygonal)
                .flat_map(|mp| mp.0)
                .collect();
            (!polys.is_empty()).then(|| MultiPolygon::new(polys))
        }
        _ => None,
    }
}

/// Encode as GeoJSON geometry text.
pub fn encode(mp: &MultiPolygon<f64>) -> anyhow::Result<String> {
    let g = geojson::Geometry::new(geojson::Value::from(mp));
    Ok(serde_json::to_string(&g)?)
}

/// Repair an invalid geometry: drop degenerate rings and non-finite polygons, then re-node.
pub fn repair(mp: &MultiPolygon<f64>) -> MultiPolygon<f64> {
    let kept: Vec<_> = mp
        .0
        .iter()
        .filter(|p| {
            p.exterior().0.len() >= 4
                && p.exterior().0.iter().all(|c| c.x.is_finite() && c.y.is_finite())
        })
        .cloned()
        .collect();
    MultiPolygon::new(kept).union(&MultiPolygon::new(vec![]))
}

/// Union of many geometries. Inputs are repaired first.
pub fn union_all<'a, I>(geoms: I) -> MultiPolygon<f64>
where
    I: IntoIterator<Item = &'a MultiPolygon<f64>>,
{
    geoms
        .into_iter()
        .fold(MultiPolygon::new(vec![]), |acc, g| acc.union(&repair(g)))
}

/// Topology-preserving simplification. `tolerance` is a distance in the geometry's units;
/// vertices forming triangles smaller than `tolerance²` are removed. If simplification
/// collapses the geometry, the input is returned.
pub fn simplify(mp: &MultiPolygon<f64>, tolerance: f64) -> MultiPolygon<f64> {
    let eps = tolerance * tolerance;
    let out = mp.simplify_vw_preserve(&eps);
    if out.unsigned_area() > 0.0 {
        out
    } else {
        mp.clone()
    }
}

fn is_geographic(proj4: &str) -> bool {
    proj4.contains("+proj=longlat") || proj4.contains("+proj=latlong")
}

/// Coordinate transformation between two proj4-defined CRSes.
///
/// Geographic CRSes are degrees at the API and radians inside proj4rs.
pub struct Reprojector {
    src: Proj,
    dst: Proj,
    src_geographic: bool,
    dst_geographic: bool,
}

impl Reprojector {
    /// Build from proj4 definitions.
    pub fn new(src_proj4: &str, dst_proj4: &str) -> anyhow::Result<Self> {
        let src = Proj::from_proj_string(src_proj4)
            .map_err(|e| anyhow::anyhow!("invalid source projection {src_proj4}: {e:?}"))?;
        let dst = Proj::from_proj_string(dst_proj4)
            .map_err(|e| anyhow::anyhow!("invalid target projection {dst_proj4}: {e:?}"))?;
        Ok(Reprojector {
            src,
            dst,
            src_geographic: is_geographic(src_proj4),
            dst_geographic: is_geographic(dst_proj4),
        })
    }

    /// Build from two registered srids.
    pub fn between(resolver: &CrsResolver, src: i32, dst: i32) -> anyhow::Result<Self> {
        let s = resolver.proj4(src).ok_or(SummaryError::UnknownSrid(src))?;
        let d = resolver.proj4(dst).ok_or(SummaryError::UnknownSrid(dst))?;
        Self::new(&s, &d).with_context(|| format!("reprojector {src} -> {dst}"))
    }

    /// Transform one coordinate.
    pub fn transform_coord(&self, c: Coord<f64>) -> anyhow::Result<Coord<f64>> {
        let mut point = if self.src_geographic {
            (c.x.to_radians(), c.y.to_radians(), 0.0)
        } else {
            (c.x, c.y, 0.0)
        };
        transform(&self.src, &self.dst, &mut point)
            .map_err(|e| anyhow::anyhow!("transform failed at ({}, {}): {e:?}", c.x, c.y))?;
        let (x, y) = if self.dst_geographic {
            (point.0.to_degrees(), point.1.to_degrees())
        } else {
            (point.0, point.1)
        };
        if !(x.is_finite() && y.is_finite()) {
            anyhow::bail!("transform produced non-finite coordinate for ({}, {})", c.x, c.y);
        }
        Ok(Coord { x, y })
    }

    /// Transform every coordinate of a geometry.
    pub fn reproject(&self, mp: &MultiPolygon<f64>) -> anyhow::Result<MultiPolygon<f64>> {
        mp.try_map_coords(|c| self.transform_coord(c))
    }
}
