//! Coordinate reference system resolution.
//!
//! Datasets describe their CRS in one of three ways:
//! - shorthand `AUTH:CODE` (e.g. `EPSG:32756`)
//! - WKT ending in an authority clause, `... AUTHORITY["EPSG","32756"]]`
//! - a legacy `{datum, zone}` pair; datum `GDA94` means EPSG `283` followed by `|zone|`
//!
//! [`CrsResolver::resolve`] tries these in that order, then the product's default CRS, and
//! yields `None` when nothing matches. Unresolvable CRSes are expected for legacy data and
//! are never an error.
//!
//! The resolver owns two read-mostly snapshots swapped with `arc-swap`:
//! - the `spatial_ref_sys` registry (authority code <-> srid, proj4 definitions), loaded by
//!   [`CrsResolver::load`] and replaced wholesale by [`CrsResolver::refresh`];
//! - a memo of srid -> display name (`"EPSG:32756"`). Entries are added lazily and never
//!   evicted: reference systems are immutable once seeded. Readers never block.

use std::{collections::HashMap, fmt, sync::Arc};

use arc_swap::ArcSwap;
use diesel::prelude::*;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::{models::SpatialRefSys, schema::spatial_ref_sys::dsl as srs};

static SHORTHAND: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Za-z0-9]+):([0-9]+)$").expect("static regex"));

static WKT_AUTHORITY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"AUTHORITY\["([a-zA-Z0-9]+)", *"([0-9]+)"\]\]$"#).expect("static regex")
});

/// A dataset's CRS as found in its metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrsDescriptor {
    /// Shorthand code or WKT text.
    Text(String),
    /// Legacy datum + zone pair.
    DatumZone {
        /// Datum name, e.g. "GDA94".
        datum: String,
        /// Signed zone; southern zones may be negative.
        zone: i32,
    },
}

impl CrsDescriptor {
    /// Interpret a metadata value: a string, or an object with `datum` and `zone`.
    pub fn from_value(v: &Value) -> Option<Self> {
        match v {
            Value::String(s) => Some(CrsDescriptor::Text(s.trim().to_string())),
            Value::Object(map) => {
                let datum = map.get("datum")?.as_str()?.to_string();
                let zone = match map.get("zone")? {
                    Value::Number(n) => n.as_i64()?,
                    Value::String(s) => s.trim().parse().ok()?,
                    _ => return None,
                };
                Some(CrsDescriptor::DatumZone {
                    datum,
                    zone: i32::try_from(zone).ok()?,
                })
            }
            _ => None,
        }
    }
}

impl fmt::Display for CrsDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CrsDescriptor::Text(s) => f.write_str(s),
            CrsDescriptor::DatumZone { datum, zone } => write!(f, "{datum} zone {zone}"),
        }
    }
}

/// Whether `s` has the `AUTH:CODE` shape.
pub fn is_shorthand(s: &str) -> bool {
    SHORTHAND.is_match(s)
}

/// Authority code from a shorthand string.
pub fn parse_shorthand(s: &str) -> Option<(String, i32)> {
    let caps = SHORTHAND.captures(s.trim())?;
    Some((caps[1].to_string(), caps[2].parse().ok()?))
}

/// Authority code from the trailing `AUTHORITY[..]]` clause of WKT.
pub fn parse_wkt_authority(s: &str) -> Option<(String, i32)> {
    let caps = WKT_AUTHORITY.captures(s.trim_end())?;
    Some((caps[1].to_string(), caps[2].parse().ok()?))
}

/// EPSG code for a legacy datum/zone pair. Only GDA94 is known.
pub fn datum_zone_code(datum: &str, zone: i32) -> Option<(String, i32)> {
    if datum != "GDA94" {
        return None;
    }
    let code = format!("283{}", zone.unsigned_abs()).parse().ok()?;
    Some(("EPSG".to_string(), code))
}

/// Immutable snapshot of `spatial_ref_sys`.
#[derive(Debug, Default)]
pub struct SridRegistry {
    by_code: HashMap<(String, i32), i32>,
    by_srid: HashMap<i32, SpatialRefSys>,
}

impl SridRegistry {
    /// Build from rows. Authority names match case-insensitively.
    pub fn from_rows(rows: impl IntoIterator<Item = SpatialRefSys>) -> Self {
        let mut reg = SridRegistry::default();
        for row in rows {
            reg.by_code
                .insert((row.auth_name.to_lowercase(), row.auth_srid), row.srid);
            reg.by_srid.insert(row.srid, row);
        }
        reg
    }

    /// srid for an authority code.
    pub fn lookup(&self, auth_name: &str, auth_srid: i32) -> Option<i32> {
        self.by_code
            .get(&(auth_name.to_lowercase(), auth_srid))
            .copied()
    }

    /// Registry entry for an srid.
    pub fn get(&self, srid: i32) -> Option<&SpatialRefSys> {
        self.by_srid.get(&srid)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.by_srid.len()
    }

    /// Whether the registry holds no entries.
    pub fn is_empty(&self) -> bool {
        self.by_srid.is_empty()
    }
}

type NameMemo = HashMap<i32, Option<String>>;

/// Resolves CRS descriptors to srids and srids to display names.
pub struct CrsResolver {
    registry: ArcSwap<SridRegistry>,
    names: ArcSwap<NameMemo>,
}

impl fmt::Debug for CrsResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrsResolver")
            .field("registry_len", &self.registry.load().len())
            .field("names_memoized", &self.names.load().len())
            .finish()
    }
}

impl CrsResolver {
    /// Resolver over an in-memory registry.
    pub fn new(registry: SridRegistry) -> Self {
        CrsResolver {
            registry: ArcSwap::from_pointee(registry),
            names: ArcSwap::from_pointee(NameMemo::new()),
        }
    }

    /// Load the registry from `spatial_ref_sys`.
    pub fn load(conn: &mut SqliteConnection) -> anyhow::Result<Self> {
        Ok(Self::new(read_registry(conn)?))
    }

    /// Reload the registry snapshot. The name memo is kept.
    pub fn refresh(&self, conn: &mut SqliteConnection) -> anyhow::Result<()> {
        self.registry.store(Arc::new(read_registry(conn)?));
        Ok(())
    }

    /// Current registry snapshot.
    pub fn registry(&self) -> Arc<SridRegistry> {
        self.registry.load_full()
    }

    /// Resolve a descriptor, falling back to `default_crs` (`AUTH:CODE`).
    ///
    /// Order: shorthand, WKT authority suffix, datum/zone, default. A form that parses
    /// but names a code missing from the registry falls through to the next form.
    pub fn resolve(&self, desc: Option<&CrsDescriptor>, default_crs: Option<&str>) -> Option<i32> {
        let reg = self.registry.load();
        let lookup = |code: Option<(String, i32)>| code.and_then(|(a, c)| reg.lookup(&a, c));

        let from_desc = match desc {
            Some(CrsDescriptor::Text(s)) => {
                lookup(parse_shorthand(s)).or_else(|| lookup(parse_wkt_authority(s)))
            }
            Some(CrsDescriptor::DatumZone { datum, zone }) => lookup(datum_zone_code(datum, *zone)),
            None => None,
        };
        from_desc.or_else(|| lookup(default_crs.and_then(parse_shorthand)))
    }

    /// Display name (`AUTH:CODE`) of an srid, memoized.
    pub fn srid_name(&self, srid: i32) -> Option<String> {
        if let Some(hit) = self.names.load().get(&srid) {
            return hit.clone();
        }
        let name = self
            .registry
            .load()
            .get(srid)
            .map(|r| format!("{}:{}", r.auth_name, r.auth_srid));
        self.names.rcu(|memo| {
            let mut next = NameMemo::clone(memo);
            next.insert(srid, name.clone());
            next
        });
        name
    }

    /// proj4 definition of an srid.
    pub fn proj4(&self, srid: i32) -> Option<String> {
        self.registry.load().get(srid).map(|r| r.proj4text.clone())
    }

    /// Number of memoized srid names.
    pub fn memoized_names(&self) -> usize {
        self.names.load().len()
    }
}

fn read_registry(conn: &mut SqliteConnection) -> anyhow::Result<SridRegistry> {
    let rows: Vec<SpatialRefSys> = srs::spatial_ref_sys
        .select(SpatialRefSys::as_select())
        .load(conn)?;
    Ok(SridRegistry::from_rows(rows))
}
