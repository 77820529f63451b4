//! SQLite plumbing shared by the crawler, hosts and index databases.
//!
//! Three separate database files decouple crawl I/O from analytical index
//! I/O. Cross-database references are by id only — there are no foreign
//! keys between files, just the shared document numbering.

use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::Connection;

/// Schema script for the crawler database (urls, frontier, requests, documents).
pub const CRAWLER_SCHEMA: &str = include_str!("../../sql/crawler.sql");
/// Schema script for the hosts database (robots policy + token buckets).
pub const HOSTS_SCHEMA: &str = include_str!("../../sql/hosts.sql");
/// Schema script for the index database (documents, words, postings).
pub const INDEX_SCHEMA: &str = include_str!("../../sql/index.sql");

/// Open a database file with the pragmas every connection needs.
///
/// Foreign keys are enforced on open; a busy timeout covers the short
/// lock windows when the crawler and an indexing run share a file.
pub fn open(path: impl AsRef<Path>) -> Result<Connection> {
    let path = path.as_ref();
    let con = Connection::open(path)
        .with_context(|| format!("failed to open database {}", path.display()))?;
    con.pragma_update(None, "foreign_keys", true)?;
    con.busy_timeout(std::time::Duration::from_secs(30))?;
    Ok(con)
}

/// Open a database and make sure the given schema script has been applied.
///
/// All schema statements are `CREATE … IF NOT EXISTS`, so this is safe on
/// an already-initialized file.
pub fn open_with_schema(path: impl AsRef<Path>, schema: &str) -> Result<Connection> {
    let con = open(path)?;
    con.execute_batch(schema).context("failed to apply schema")?;
    Ok(con)
}

/// Apply a schema script read from disk, as `init-db` does.
pub fn init_db(db: impl AsRef<Path>, sql: impl AsRef<Path>) -> Result<()> {
    let sql = sql.as_ref();
    let script = std::fs::read_to_string(sql)
        .with_context(|| format!("failed to read schema script {}", sql.display()))?;
    let con = open(db)?;
    con.execute_batch(&script).context("failed to run schema script")?;
    Ok(())
}

/// Seconds since the Unix epoch as a float, the clock every timestamp and
/// rate-limit epoch in the databases uses.
pub fn now_epoch() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
