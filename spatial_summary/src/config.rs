//! Summary configuration: parsing, normalization, and loading.
//!
//! A TOML document describes:
//! - Where the summary database lives (`database_url`, else `$DATABASE_URL`)
//! - The time zone calendar periods are grouped in (`grouping_time_zone`)
//! - The display CRS of period footprints (`footprint_srid`)
//! - Region simplification tolerance and the fixed-metadata sample size
//! - Per-product overrides (`[products.<name>]`): a default CRS for datasets whose own
//!   CRS does not resolve, and a replacement `region_code` field expression
//!
//! ```toml
//! grouping_time_zone = "Australia/Darwin"
//!
//! [products.ga_ls8c_ard_3]
//! default_crs = "epsg:32653"
//! region_code = { column = ["properties", "odc:region_code"] }
//! ```
//!
//! Entrypoints:
//! - Parse + normalize from a TOML string: [`load_config_str`]
//! - Parse + normalize from a file path: [`load_config_path`]
//! - Normalization only: [`normalize_config`]

use std::collections::HashSet;

use anyhow::{Context, bail};
use chrono_tz::Tz;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use toml::from_str;

use crate::{catalog::FieldExpression, crs, tz};

fn default_time_zone() -> String {
    "UTC".to_string()
}

fn default_footprint_srid() -> i32 {
    4326
}

fn default_simplify_tolerance() -> f64 {
    0.0001
}

fn default_sample_size() -> usize {
    50
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SummaryConfig {
    /// SQLite path or `sqlite:` URL. Falls back to `$DATABASE_URL`.
    #[serde(default)]
    pub database_url: Option<String>,
    /// IANA zone in which day/month/year boundaries are evaluated.
    #[serde(default = "default_time_zone")]
    pub grouping_time_zone: String,
    /// CRS of stored period footprints.
    #[serde(default = "default_footprint_srid")]
    pub footprint_srid: i32,
    /// Distance tolerance in degrees for region simplification; the VW area threshold is its square.
    #[serde(default = "default_simplify_tolerance")]
    pub region_simplify_tolerance: f64,
    /// Datasets sampled to find fixed-metadata candidates and linked products.
    #[serde(default = "default_sample_size")]
    pub fixed_metadata_sample_size: usize,
    /// Per-product overrides, keyed by product name.
    #[serde(default)]
    pub products: IndexMap<String, ProductCfg>,
}

impl Default for SummaryConfig {
    fn default() -> Self {
        SummaryConfig {
            database_url: None,
            grouping_time_zone: default_time_zone(),
            footprint_srid: default_footprint_srid(),
            region_simplify_tolerance: default_simplify_tolerance(),
            fixed_metadata_sample_size: default_sample_size(),
            products: IndexMap::new(),
        }
    }
}

/// Overrides for one product.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ProductCfg {
    /// `AUTH:CODE` used when a dataset's CRS does not resolve.
    pub default_crs: Option<String>,
    /// Replacement region-code expression.
    pub region_code: Option<FieldExpression>,
}

impl SummaryConfig {
    /// Parsed grouping time zone.
    pub fn grouping_tz(&self) -> anyhow::Result<Tz> {
        tz::parse_tz(&self.grouping_time_zone)
    }

    /// Overrides for `product`, if any.
    pub fn product(&self, product: &str) -> Option<&ProductCfg> {
        self.products.get(product)
    }

    /// `database_url`, else `$DATABASE_URL`.
    pub fn resolve_database_url(&self) -> anyhow::Result<String> {
        match &self.database_url {
            Some(url) => Ok(url.clone()),
            None => std::env::var("DATABASE_URL")
                .context("database_url not configured and DATABASE_URL is not set"),
        }
    }
}

/// Summary of changes performed during normalization.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct NormalizationReport {
    /// Product keys that changed when trimming.
    pub products_renamed: usize,
    /// `default_crs` values rewritten to canonical `AUTH:CODE` form.
    pub default_crs_normalized: usize,
    /// Products with neither override set, removed.
    pub empty_products_dropped: usize,
}

/// Normalize a configuration in place.
///
/// What normalization does:
/// - Trim product keys; reject empty or duplicate keys after trimming
/// - Trim and upper-case `default_crs`, rejecting anything not shaped `AUTH:CODE`
/// - Drop product entries with no overrides
/// - Validate the grouping time zone, the tolerance (finite, > 0) and the sample size (> 0)
///
/// Errors:
/// - Any of the validations above
pub fn normalize_config(cfg: &mut SummaryConfig) -> anyhow::Result<NormalizationReport> {
    let mut report = NormalizationReport::default();

    cfg.grouping_time_zone = cfg.grouping_time_zone.trim().to_string();
    tz::parse_tz(&cfg.grouping_time_zone)?;
    if !cfg.region_simplify_tolerance.is_finite() || cfg.region_simplify_tolerance <= 0.0 {
        bail!(
            "region_simplify_tolerance must be positive, got {}",
            cfg.region_simplify_tolerance
        );
    }
    if cfg.fixed_metadata_sample_size == 0 {
        bail!("fixed_metadata_sample_size must be at least 1");
    }
    if let Some(url) = &cfg.database_url {
        let url = url.trim();
        if url.is_empty() {
            bail!("database_url cannot be empty");
        }
        cfg.database_url = Some(url.to_string());
    }

    let mut rebuilt: IndexMap<String, ProductCfg> = IndexMap::new();
    let mut seen = HashSet::new();
    for (raw_name, mut pcfg) in std::mem::take(&mut cfg.products) {
        let name = raw_name.trim().to_string();
        if name.is_empty() {
            bail!("product name cannot be empty after trimming");
        }
        if name != raw_name {
            report.products_renamed += 1;
        }
        if !seen.insert(name.clone()) {
            bail!("duplicate product after normalization: {name}");
        }

        if let Some(raw) = pcfg.default_crs.take() {
            let norm = raw.trim().to_uppercase();
            if !crs::is_shorthand(&norm) {
                bail!("default_crs for {name} must look like AUTH:CODE, got {raw:?}");
            }
            if norm != raw {
                report.default_crs_normalized += 1;
            }
            pcfg.default_crs = Some(norm);
        }

        if pcfg.default_crs.is_none() && pcfg.region_code.is_none() {
            report.empty_products_dropped += 1;
            continue;
        }
        rebuilt.insert(name, pcfg);
    }
    cfg.products = rebuilt;
    Ok(report)
}

/// Parse and normalize a configuration from a TOML string.
///
/// Errors:
/// - TOML parse failures
/// - Normalization errors (see [`normalize_config`])
pub fn load_config_str(toml_str: &str) -> anyhow::Result<SummaryConfig> {
    let mut cfg: SummaryConfig = from_str(toml_str).context("failed to parse summary config TOML")?;
    let report = normalize_config(&mut cfg).context("normalize_config failed")?;
    tracing::debug!(?report, "summary config normalized");
    Ok(cfg)
}

/// Read a configuration TOML file from disk, parse, and normalize it.
pub fn load_config_path(path: impl AsRef<std::path::Path>) -> anyhow::Result<SummaryConfig> {
    let text = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("read config file {}", path.as_ref().display()))?;
    load_config_str(&text)
}
