//! Persistent FIFO queue of URLs pending fetch.
//!
//! Positions form a dense `0..N-1` total order: popping removes the
//! minimum-position row and shifts the rest down, pushing appends at
//! `max+1`. A URL appears at most once in the frontier, and an entry exists
//! exactly while the URL is pending fetch.

use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, Transaction};
use tracing::debug;

use crate::crawl::urls;
use crate::storage;

pub struct Frontier {
    con: Connection,
}

impl Frontier {
    /// Open the crawler database at `path`. The schema must already exist
    /// (`init-db`).
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            con: storage::open(path)?,
        })
    }

    /// Wrap an existing connection (tests, in-process sharing).
    pub fn new(con: Connection) -> Self {
        Self { con }
    }

    /// Number of queued URLs.
    pub fn len(&self) -> Result<usize> {
        let n: i64 = self
            .con
            .query_row("SELECT count(*) FROM frontier", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Move all frontier rows with `position >= position` back by `amount`
    /// (negative amounts shift forward).
    ///
    /// Done in two updates — negate, then take the absolute value — because
    /// a single in-place renumbering would collide with the UNIQUE
    /// constraint on `position` mid-statement.
    fn shift(tx: &Transaction, position: i64, amount: i64) -> rusqlite::Result<()> {
        tx.execute(
            "UPDATE frontier SET position = -(position + ?2) WHERE position >= ?1",
            (position, amount),
        )?;
        tx.execute(
            "UPDATE frontier SET position = abs(position) WHERE position < 0",
            [],
        )?;
        Ok(())
    }

    /// Look up the URL row and its frontier position, if any.
    fn lookup(tx: &Transaction, url: &str) -> rusqlite::Result<Option<(i64, Option<i64>)>> {
        tx.query_row(
            "SELECT url.id, frontier.position FROM url \
             LEFT JOIN frontier ON url.id = frontier.url_id \
             WHERE url.url = ?1",
            [url],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
    }

    fn append_entry(tx: &Transaction, url_id: i64) -> rusqlite::Result<()> {
        tx.execute(
            "INSERT INTO frontier (position, url_id) \
             VALUES (IFNULL((SELECT max(position) + 1 FROM frontier), 0), ?1)",
            [url_id],
        )?;
        Ok(())
    }

    /// Add a URL to the end of the frontier, creating the `url` row if
    /// necessary. The URL is normalized first; a URL that is already queued
    /// is left where it is.
    pub fn push(&mut self, url: &str) -> Result<()> {
        let url = urls::normalize(url)?;
        let tx = self.con.transaction()?;
        match Self::lookup(&tx, &url)? {
            Some((_, Some(_))) => return Ok(()), // already queued
            Some((url_id, None)) => Self::append_entry(&tx, url_id)?,
            None => {
                let url_id: i64 = tx.query_row(
                    "INSERT INTO url (url) VALUES (?1) RETURNING id",
                    [&url],
                    |row| row.get(0),
                )?;
                Self::append_entry(&tx, url_id)?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Like [`push`](Self::push), but also a no-op when any request —
    /// whatever its status — has already been recorded for the URL.
    pub fn push_if_new(&mut self, url: &str) -> Result<()> {
        let url = urls::normalize(url)?;
        let requested: bool = self.con.query_row(
            "SELECT EXISTS ( \
                SELECT 1 FROM request JOIN url ON request.url_id = url.id \
                WHERE url.url = ?1)",
            [&url],
            |row| row.get(0),
        )?;
        if requested {
            debug!("already requested, not queueing: {}", url);
            return Ok(());
        }
        self.push(&url)
    }

    /// Append an already-stored URL by id, without re-normalization. Used
    /// to requeue URLs that had been rate-limited. Returns whether an entry
    /// was actually added (false when the URL is already queued).
    pub fn push_id(&mut self, url_id: i64) -> Result<bool> {
        let tx = self.con.transaction()?;
        let queued: bool = tx.query_row(
            "SELECT EXISTS (SELECT 1 FROM frontier WHERE url_id = ?1)",
            [url_id],
            |row| row.get(0),
        )?;
        if !queued {
            Self::append_entry(&tx, url_id)?;
        }
        tx.commit()?;
        Ok(!queued)
    }

    /// Insert a URL at the given position without creating gaps. An entry
    /// already queued elsewhere is moved; positions past the current end
    /// are clamped to the end.
    pub fn insert(&mut self, url: &str, position: i64) -> Result<()> {
        let url = urls::normalize(url)?;
        let tx = self.con.transaction()?;
        let url_id = match Self::lookup(&tx, &url)? {
            Some((url_id, Some(prev_pos))) => {
                if prev_pos == position {
                    return Ok(());
                }
                // Take it out of the frontier and close the gap.
                tx.execute("DELETE FROM frontier WHERE position = ?1", [prev_pos])?;
                Self::shift(&tx, prev_pos, -1)?;
                url_id
            }
            Some((url_id, None)) => url_id,
            None => tx.query_row(
                "INSERT INTO url (url) VALUES (?1) RETURNING id",
                [&url],
                |row| row.get(0),
            )?,
        };
        // Make space, then land in the gap — or at the end, but not past it.
        Self::shift(&tx, position, 1)?;
        tx.execute(
            "INSERT INTO frontier (position, url_id) \
             VALUES ( \
                 MAX(0, MIN(?1, IFNULL((SELECT max(position) + 1 FROM frontier), 0))), \
                 ?2)",
            (position, url_id),
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Remove and return the minimum-position URL; `None` when the frontier
    /// is empty. The remaining entries are shifted down so positions stay
    /// dense.
    pub fn pop(&mut self) -> Result<Option<String>> {
        let tx = self.con.transaction()?;
        let popped: Option<(i64, String)> = tx
            .query_row(
                "DELETE FROM frontier \
                 WHERE position = (SELECT min(position) FROM frontier) \
                 RETURNING position, (SELECT url FROM url WHERE id = url_id)",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let url = match popped {
            Some((pos, url)) => {
                Self::shift(&tx, pos, -1)?;
                Some(url)
            }
            None => None,
        };
        tx.commit()?;
        Ok(url)
    }

    /// Dense position check used by tests and the controller's sanity
    /// logging: positions must be exactly `0..len`.
    pub fn positions(&self) -> Result<Vec<i64>> {
        let mut stmt = self
            .con
            .prepare("SELECT position FROM frontier ORDER BY position")?;
        let positions = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(positions)
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.con
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{open_with_schema, CRAWLER_SCHEMA};

    fn frontier() -> (tempfile::TempDir, Frontier) {
        let dir = tempfile::tempdir().unwrap();
        let con = open_with_schema(dir.path().join("crawler.db"), CRAWLER_SCHEMA).unwrap();
        (dir, Frontier::new(con))
    }

    fn assert_dense(f: &Frontier) {
        let positions = f.positions().unwrap();
        let expected: Vec<i64> = (0..positions.len() as i64).collect();
        assert_eq!(positions, expected);
    }

    #[test]
    fn round_trip_dedupes_and_preserves_fifo() {
        let (_dir, mut f) = frontier();
        f.push("https://a.example/").unwrap();
        f.push("https://b.example/").unwrap();
        f.push("https://a.example/").unwrap(); // duplicate — no-op
        assert_eq!(f.len().unwrap(), 2);
        assert_dense(&f);

        assert_eq!(f.pop().unwrap().as_deref(), Some("https://a.example/"));
        assert_dense(&f);
        assert_eq!(f.pop().unwrap().as_deref(), Some("https://b.example/"));
        assert_eq!(f.pop().unwrap(), None);
    }

    #[test]
    fn push_normalizes_before_queueing() {
        let (_dir, mut f) = frontier();
        f.push("HTTPS://A.Example:443/x/../y").unwrap();
        f.push("https://a.example/y").unwrap(); // same URL after normalization
        assert_eq!(f.len().unwrap(), 1);
        assert_eq!(f.pop().unwrap().as_deref(), Some("https://a.example/y"));
    }

    #[test]
    fn fifo_order_matches_push_order() {
        let (_dir, mut f) = frontier();
        let pushed: Vec<String> = (0..12)
            .map(|i| format!("https://host{}.example/", i))
            .collect();
        for url in &pushed {
            f.push(url).unwrap();
        }
        let mut popped = Vec::new();
        while let Some(url) = f.pop().unwrap() {
            popped.push(url);
        }
        assert_eq!(popped, pushed);
    }

    #[test]
    fn positions_stay_dense_under_interleaving() {
        let (_dir, mut f) = frontier();
        for i in 0..6 {
            f.push(&format!("https://h{}.example/", i)).unwrap();
        }
        f.pop().unwrap();
        f.pop().unwrap();
        f.push("https://late.example/").unwrap();
        f.pop().unwrap();
        assert_dense(&f);
        assert_eq!(f.len().unwrap(), 4);
    }

    #[test]
    fn push_if_new_skips_previously_requested() {
        let (_dir, mut f) = frontier();
        f.push("https://seen.example/").unwrap();
        let url = f.pop().unwrap().unwrap();
        // Record a request for the URL, any status.
        f.connection()
            .execute(
                "INSERT INTO request (url_id, time, status) \
                 VALUES ((SELECT id FROM url WHERE url = ?1), 0.0, 'failed')",
                [&url],
            )
            .unwrap();
        f.push_if_new(&url).unwrap();
        assert_eq!(f.len().unwrap(), 0);
        f.push_if_new("https://fresh.example/").unwrap();
        assert_eq!(f.len().unwrap(), 1);
    }

    #[test]
    fn push_id_requeues_without_duplicating() {
        let (_dir, mut f) = frontier();
        f.push("https://limited.example/").unwrap();
        let url_id: i64 = f
            .connection()
            .query_row("SELECT id FROM url WHERE url = ?1", ["https://limited.example/"], |r| {
                r.get(0)
            })
            .unwrap();
        f.pop().unwrap();
        f.push("https://other.example/").unwrap();
        f.push_id(url_id).unwrap();
        f.push_id(url_id).unwrap(); // second requeue is a no-op
        assert_eq!(f.len().unwrap(), 2);
        assert_eq!(f.pop().unwrap().as_deref(), Some("https://other.example/"));
        assert_eq!(f.pop().unwrap().as_deref(), Some("https://limited.example/"));
    }

    #[test]
    fn insert_places_and_moves_without_gaps() {
        let (_dir, mut f) = frontier();
        for i in 0..4 {
            f.push(&format!("https://h{}.example/", i)).unwrap();
        }
        f.insert("https://front.example/", 0).unwrap();
        assert_dense(&f);
        assert_eq!(f.len().unwrap(), 5);
        assert_eq!(f.pop().unwrap().as_deref(), Some("https://front.example/"));
        assert_dense(&f);

        // Moving an already-queued entry keeps the URL unique in the queue.
        f.insert("https://h3.example/", 0).unwrap();
        assert_dense(&f);
        assert_eq!(f.len().unwrap(), 4);
        assert_eq!(f.pop().unwrap().as_deref(), Some("https://h3.example/"));
    }
}
