//! Field expressions: how a spatial-index column is derived from a dataset document.
//!
//! A metadata type declares, per logical field, where the value lives in a dataset's
//! metadata document. Expressions are resolved once per product into [`ProductFields`]
//! and reused for every dataset of a refresh pass.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{catalog::MetadataType, crs::CrsDescriptor, tz};

/// How to obtain one field's value from a dataset document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldExpression {
    /// Value at a key path, e.g. `["properties", "odc:region_code"]`.
    Column(Vec<String>),
    /// Value computed from other expressions.
    Derived(Derivation),
    /// The same value for every dataset.
    Constant(Value),
}

/// Computed field kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Derivation {
    /// First non-null value.
    Coalesce(Vec<FieldExpression>),
    /// Midpoint of a `[begin, end]` time range.
    RangeCenter {
        /// Range start.
        begin: Box<FieldExpression>,
        /// Range end.
        end: Box<FieldExpression>,
    },
    /// Region code `"{path}_{row}"` from satellite path/row values (or their lower bounds).
    PathRow {
        /// Satellite path.
        path: Box<FieldExpression>,
        /// Satellite row.
        row: Box<FieldExpression>,
    },
}

impl FieldExpression {
    /// Shorthand for a [`FieldExpression::Column`] from dotted segments.
    pub fn column<I, S>(path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        FieldExpression::Column(path.into_iter().map(Into::into).collect())
    }

    /// Evaluate against a dataset document. Missing keys and JSON nulls yield `None`.
    pub fn evaluate(&self, doc: &Value) -> Option<Value> {
        match self {
            FieldExpression::Column(path) => {
                let mut cur = doc;
                for key in path {
                    cur = cur.get(key.as_str())?;
                }
                (!cur.is_null()).then(|| cur.clone())
            }
            FieldExpression::Constant(v) => (!v.is_null()).then(|| v.clone()),
            FieldExpression::Derived(d) => d.evaluate(doc),
        }
    }

    /// Evaluate and interpret the value as a timestamp.
    pub fn evaluate_time(&self, doc: &Value) -> Option<DateTime<Utc>> {
        self.evaluate(doc).as_ref().and_then(value_as_time)
    }

    /// Evaluate and interpret the value as a non-empty string (numbers are formatted).
    pub fn evaluate_string(&self, doc: &Value) -> Option<String> {
        let s = match self.evaluate(doc)? {
            Value::String(s) => s,
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        let s = s.trim();
        (!s.is_empty()).then(|| s.to_string())
    }

    /// Evaluate and interpret the value as an integer.
    pub fn evaluate_i64(&self, doc: &Value) -> Option<i64> {
        match self.evaluate(doc)? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl Derivation {
    fn evaluate(&self, doc: &Value) -> Option<Value> {
        match self {
            Derivation::Coalesce(options) => options.iter().find_map(|e| e.evaluate(doc)),
            Derivation::RangeCenter { begin, end } => {
                let b = begin.evaluate_time(doc);
                let e = end.evaluate_time(doc);
                let center = match (b, e) {
                    (Some(b), Some(e)) => b + (e - b) / 2,
                    (Some(t), None) | (None, Some(t)) => t,
                    (None, None) => return None,
                };
                Some(Value::String(tz::to_rfc3339_millis(center)))
            }
            Derivation::PathRow { path, row } => {
                let (p, _) = path.evaluate(doc).as_ref().and_then(value_as_int_range)?;
                let (r, _) = row.evaluate(doc).as_ref().and_then(value_as_int_range)?;
                Some(Value::String(format!("{p}_{r}")))
            }
        }
    }
}

/// Interpret a JSON value as an RFC-3339 timestamp.
pub fn value_as_time(v: &Value) -> Option<DateTime<Utc>> {
    tz::parse_ts_to_utc(v.as_str()?).ok()
}

/// Interpret a number, or a `{begin,end}` / `{lower,upper}` object, as an inclusive integer range.
pub fn value_as_int_range(v: &Value) -> Option<(i32, i32)> {
    fn int(v: &Value) -> Option<i32> {
        v.as_i64()
            .or_else(|| v.as_f64().map(|f| f as i64))
            .and_then(|n| i32::try_from(n).ok())
    }
    match v {
        Value::Number(_) => int(v).map(|n| (n, n)),
        Value::Object(map) => {
            let lo = map.get("begin").or_else(|| map.get("lower")).and_then(int)?;
            let hi = map
                .get("end")
                .or_else(|| map.get("upper"))
                .and_then(int)
                .unwrap_or(lo);
            Some((lo.min(hi), lo.max(hi)))
        }
        _ => None,
    }
}

/// Values extracted from one dataset for the spatial index.
#[derive(Debug, Clone, PartialEq)]
pub struct SpatialValues {
    /// Temporal key.
    pub center_time: Option<DateTime<Utc>>,
    /// Dataset creation time.
    pub creation_time: Option<DateTime<Utc>>,
    /// Footprint as a GeoJSON geometry value in the native CRS.
    pub footprint: Option<Value>,
    /// CRS descriptor of the footprint.
    pub crs: Option<CrsDescriptor>,
    /// Region grouping key.
    pub region_code: Option<String>,
    /// Total size of the dataset's files.
    pub size_bytes: Option<i64>,
}

/// Field expressions of one product, resolved from its metadata type plus overrides.
#[derive(Debug, Clone, PartialEq)]
pub struct ProductFields {
    /// Center time.
    pub center_time: FieldExpression,
    /// Creation time.
    pub creation_time: Option<FieldExpression>,
    /// Footprint geometry.
    pub footprint: Option<FieldExpression>,
    /// CRS descriptor (string or `{datum, zone}` object).
    pub crs: Option<FieldExpression>,
    /// Region code.
    pub region_code: Option<FieldExpression>,
    /// Size in bytes.
    pub size_bytes: Option<FieldExpression>,
    /// Satellite path, used to synthesize footprints.
    pub sat_path: Option<FieldExpression>,
    /// Satellite row, used to synthesize footprints.
    pub sat_row: Option<FieldExpression>,
    /// CRS used when a dataset's own descriptor does not resolve (`AUTH:CODE`).
    pub default_crs: Option<String>,
    /// Every search field of the metadata type, for fixed-metadata detection.
    pub search_fields: Vec<(String, FieldExpression)>,
}

impl ProductFields {
    /// Resolve a metadata type's fields, with optional per-product overrides.
    ///
    /// Errors if the metadata type declares no `center_time` field.
    pub fn resolve(
        metadata_type: &MetadataType,
        region_code_override: Option<&FieldExpression>,
        default_crs: Option<&str>,
    ) -> anyhow::Result<Self> {
        let get = |name: &str| metadata_type.fields.get(name).cloned();
        let center_time = get("center_time").ok_or_else(|| {
            anyhow::anyhow!(
                "metadata type {} has no center_time field",
                metadata_type.name
            )
        })?;
        Ok(ProductFields {
            center_time,
            creation_time: get("creation_time"),
            footprint: get("footprint"),
            crs: get("crs"),
            region_code: region_code_override.cloned().or_else(|| get("region_code")),
            size_bytes: get("size_bytes"),
            sat_path: get("sat_path"),
            sat_row: get("sat_row"),
            default_crs: default_crs.map(str::to_string),
            search_fields: metadata_type
                .fields
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        })
    }

    /// Extract spatial-index values from a dataset document.
    pub fn extract(&self, doc: &Value) -> SpatialValues {
        SpatialValues {
            center_time: self.center_time.evaluate_time(doc),
            creation_time: self.creation_time.as_ref().and_then(|e| e.evaluate_time(doc)),
            footprint: self.footprint.as_ref().and_then(|e| e.evaluate(doc)),
            crs: self
                .crs
                .as_ref()
                .and_then(|e| e.evaluate(doc))
                .as_ref()
                .and_then(CrsDescriptor::from_value),
            region_code: self.region_code.as_ref().and_then(|e| e.evaluate_string(doc)),
            size_bytes: self.size_bytes.as_ref().and_then(|e| e.evaluate_i64(doc)),
        }
    }

    /// Satellite path and inclusive row range, when both are declared and present.
    pub fn path_rows(&self, doc: &Value) -> Option<(i32, (i32, i32))> {
        let path = self.sat_path.as_ref()?.evaluate(doc)?;
        let row = self.sat_row.as_ref()?.evaluate(doc)?;
        let (p, _) = value_as_int_range(&path)?;
        Some((p, value_as_int_range(&row)?))
    }
}
