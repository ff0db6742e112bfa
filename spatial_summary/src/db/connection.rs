//! SQLite connection helpers.
//!
//! Provides [`connect_sqlite`] that opens a connection and applies recommended PRAGMAs:
//! WAL journaling, foreign_keys=ON (region/overview rows cascade with their product),
//! and a 5000ms busy_timeout so concurrent per-product refreshes wait instead of failing.
//!
//! Example:
//! ```no_run
//! use spatial_summary::db::connection::connect_sqlite;
//!
//! let path = std::env::temp_dir().join("spatial_summary_example.db");
//! let _conn = connect_sqlite(path.to_str().unwrap()).expect("open sqlite");
//! ```

use anyhow::Context;
use diesel::{Connection, RunQueryDsl, SqliteConnection, sql_query};

/// Open a SQLite connection and apply connection-wide PRAGMAs.
///
/// Accepts a bare file path or a `sqlite:`-prefixed URL.
pub fn connect_sqlite(database_url: &str) -> anyhow::Result<SqliteConnection> {
    let path = strip_sqlite_scheme(database_url);
    let mut conn = SqliteConnection::establish(path)
        .with_context(|| format!("open sqlite database {path}"))?;

    sql_query("PRAGMA journal_mode=WAL;").execute(&mut conn)?;
    sql_query("PRAGMA foreign_keys=ON;").execute(&mut conn)?;
    sql_query("PRAGMA busy_timeout=5000;").execute(&mut conn)?;
    Ok(conn)
}

/// Drop a leading `sqlite://` or `sqlite:` so diesel receives a plain path.
pub(crate) fn strip_sqlite_scheme(url: &str) -> &str {
    url.strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .unwrap_or(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_prefixes_are_removed() {
        assert_eq!(strip_sqlite_scheme("sqlite:///tmp/a.db"), "/tmp/a.db");
        assert_eq!(strip_sqlite_scheme("sqlite:/tmp/a.db"), "/tmp/a.db");
        assert_eq!(strip_sqlite_scheme("/tmp/a.db"), "/tmp/a.db");
    }
}
