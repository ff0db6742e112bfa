//! Embedded schema migrations.

use anyhow::anyhow;
use diesel::{Connection, SqliteConnection, connection::SimpleConnection};
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};

use crate::db::connection::strip_sqlite_scheme;

/// Embedded Diesel migrations bundled with this crate.
///
/// These create the summary tables and seed `spatial_ref_sys`.
pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// Runs pending Diesel migrations on a SQLite database at the given URL or path.
///
/// This sets the SQLite journal mode to WAL and applies all embedded migrations, returning an error on failure.
pub fn run_sqlite(url: &str) -> anyhow::Result<()> {
    let mut conn = SqliteConnection::establish(strip_sqlite_scheme(url))?;
    conn.batch_execute("PRAGMA journal_mode=WAL;")?;
    run_on(&mut conn)
}

/// Applies pending migrations on an already-open connection.
pub fn run_on(conn: &mut SqliteConnection) -> anyhow::Result<()> {
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|e| anyhow!(e))?;
    Ok(())
}

/// Runs pending migrations for the given database URL.
///
/// Geometry columns are stored as GeoJSON text rather than PostGIS types, so only SQLite
/// is supported: `postgres://`/`postgresql://` URLs are rejected, anything else
/// (a `sqlite:` URL or a bare path) is treated as SQLite.
pub fn run_all(database_url: &str) -> anyhow::Result<()> {
    if database_url.starts_with("postgres://") || database_url.starts_with("postgresql://") {
        anyhow::bail!("Unsupported DATABASE_URL (postgres backend not available): {database_url}");
    }
    run_sqlite(database_url)
}
