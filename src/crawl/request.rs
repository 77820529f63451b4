//! HTTP fetch records and the tagged request status.
//!
//! A request's outcome is one of three disjoint kinds — an HTTP status
//! code, a synthetic category, or a "rate-limited until" epoch. The column
//! stores a tagged string so the kinds can never be confused by numeric
//! range.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, USER_AGENT};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::{Connection, OptionalExtension, ToSql};
use tracing::warn;

use crate::storage;

/// Per-request timeout.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);
const ACCEPT_VALUE: &str = "text/html,application/xhtml+xml,application/xml,text/*";
const ACCEPT_LANGUAGE_VALUE: &str = "en-US,en,en-GB";

/// Outcome of a fetch attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Status {
    /// HTTP response status, whatever the class.
    Http(u16),
    /// Transport-level failure: connection, DNS, TLS, decoding.
    Failed,
    /// No response within [`REQUEST_TIMEOUT`].
    Timeout,
    /// robots policy denies this URL permanently.
    Prohibited,
    /// Host bucket was empty; retry after the given Unix epoch.
    RateLimitedUntil(f64),
}

#[derive(Debug, thiserror::Error)]
#[error("invalid status tag {0:?}")]
pub struct StatusDecodeError(pub String);

impl Status {
    pub fn encode(&self) -> String {
        match self {
            Status::Http(code) => format!("http:{}", code),
            Status::Failed => "failed".to_string(),
            Status::Timeout => "timeout".to_string(),
            Status::Prohibited => "prohibited".to_string(),
            Status::RateLimitedUntil(epoch) => format!("rate_limited:{}", epoch),
        }
    }

    pub fn decode(tag: &str) -> Result<Self, StatusDecodeError> {
        let err = || StatusDecodeError(tag.to_string());
        match tag {
            "failed" => Ok(Status::Failed),
            "timeout" => Ok(Status::Timeout),
            "prohibited" => Ok(Status::Prohibited),
            _ => {
                if let Some(code) = tag.strip_prefix("http:") {
                    code.parse().map(Status::Http).map_err(|_| err())
                } else if let Some(epoch) = tag.strip_prefix("rate_limited:") {
                    epoch.parse().map(Status::RateLimitedUntil).map_err(|_| err())
                } else {
                    Err(err())
                }
            }
        }
    }

    /// True for terminal outcomes that mean "do not fetch again": synthetic
    /// failures and any already-received HTTP response.
    pub fn is_settled(&self) -> bool {
        !matches!(self, Status::RateLimitedUntil(_))
    }
}

impl ToSql for Status {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.encode()))
    }
}

impl FromSql for Status {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let tag = value.as_str()?;
        Status::decode(tag).map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

/// One fetch attempt against a URL. Multiple requests per URL are allowed;
/// they are ordered by `time`.
#[derive(Debug, Clone)]
pub struct Request {
    pub url: String,
    pub time: f64,
    pub duration: Option<f64>,
    pub status: Option<Status>,
    pub headers: Option<BTreeMap<String, String>>,
    pub data: Option<Vec<u8>>,
}

impl Request {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            time: storage::now_epoch(),
            duration: None,
            status: None,
            headers: None,
            data: None,
        }
    }

    /// Record that robots policy denies this URL.
    pub fn prohibited(url: impl Into<String>) -> Self {
        let mut req = Self::new(url);
        req.status = Some(Status::Prohibited);
        req
    }

    /// Record that the host bucket is empty for another `seconds` seconds.
    pub fn rate_limited(url: impl Into<String>, seconds: f64) -> Self {
        let mut req = Self::new(url);
        req.status = Some(Status::RateLimitedUntil(storage::now_epoch() + seconds));
        req
    }

    /// Record a failure discovered after the fetch (e.g. an unparseable
    /// body).
    pub fn failed(url: impl Into<String>) -> Self {
        let mut req = Self::new(url);
        req.status = Some(Status::Failed);
        req
    }

    fn request_headers(user_agent: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_VALUE));
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_static(ACCEPT_LANGUAGE_VALUE),
        );
        if let Ok(ua) = HeaderValue::from_str(user_agent) {
            headers.insert(USER_AGENT, ua);
        }
        headers
    }

    /// Perform the GET. The outcome lands in `status`; headers and body are
    /// captured on success. Returns whether a body was received.
    pub async fn make(&mut self, client: &reqwest::Client, user_agent: &str) -> bool {
        let started = Instant::now();
        let response = client
            .get(&self.url)
            .timeout(REQUEST_TIMEOUT)
            .headers(Self::request_headers(user_agent))
            .send()
            .await;
        match response {
            Err(e) if e.is_timeout() => {
                self.status = Some(Status::Timeout);
            }
            Err(e) => {
                warn!("request for {} failed: {}", self.url, e);
                self.status = Some(Status::Failed);
            }
            Ok(response) => {
                let http_status = response.status();
                self.status = Some(Status::Http(http_status.as_u16()));
                self.headers = Some(
                    response
                        .headers()
                        .iter()
                        .map(|(name, value)| {
                            (
                                name.as_str().to_lowercase(),
                                String::from_utf8_lossy(value.as_bytes()).into_owned(),
                            )
                        })
                        .collect(),
                );
                if http_status.is_success() {
                    match tokio::time::timeout(REQUEST_TIMEOUT, response.bytes()).await {
                        Ok(Ok(body)) => self.data = Some(body.to_vec()),
                        Ok(Err(e)) => {
                            warn!("reading body of {} failed: {}", self.url, e);
                            self.status = Some(Status::Failed);
                        }
                        Err(_) => self.status = Some(Status::Timeout),
                    }
                }
                self.duration = Some(started.elapsed().as_secs_f64());
            }
        }
        self.data.is_some()
    }

    /// Store the request. The URL must already exist in the `url` table
    /// (the frontier created it when the URL was first sighted).
    pub fn save(&self, con: &Connection) -> Result<i64> {
        let status = self
            .status
            .context("cannot store a request without an outcome")?;
        let headers = match &self.headers {
            Some(h) => Some(serde_json::to_string(h)?),
            None => None,
        };
        let id = con.query_row(
            "INSERT INTO request (url_id, time, duration, status, headers, data) \
             VALUES ((SELECT id FROM url WHERE url = ?1), ?2, ?3, ?4, ?5, ?6) \
             RETURNING id",
            (
                &self.url,
                self.time,
                self.duration,
                status,
                headers,
                &self.data,
            ),
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Status of the most recent request for `url`, or `None` when the URL
    /// has never been requested.
    pub fn check_status(con: &Connection, url: &str) -> Result<Option<Status>> {
        let status = con
            .query_row(
                "SELECT status FROM request \
                 JOIN url ON url_id = url.id \
                 WHERE url = ?1 \
                 ORDER BY request.time DESC \
                 LIMIT 1",
                [url],
                |row| row.get(0),
            )
            .optional()?;
        Ok(status)
    }

    /// Aggregates for the progress display.
    pub fn stats(con: &Connection) -> Result<RequestStats> {
        con.query_row(
            "SELECT \
                IFNULL(AVG(duration), 0.0), \
                COUNT(*), \
                IFNULL(MAX(time) - MIN(time), 0.0), \
                COUNT(*) FILTER (WHERE status LIKE 'http:2%'), \
                COUNT(*) FILTER (WHERE status = 'failed'), \
                COUNT(*) FILTER (WHERE status = 'timeout'), \
                COUNT(*) FILTER (WHERE status = 'prohibited') \
             FROM request",
            [],
            |row| {
                let count: i64 = row.get(1)?;
                let span: f64 = row.get(2)?;
                Ok(RequestStats {
                    avg_duration: row.get(0)?,
                    requests_per_second: if span > 0.0 { count as f64 / span } else { 0.0 },
                    ok: row.get::<_, i64>(3)? as u64,
                    failed: row.get::<_, i64>(4)? as u64,
                    timed_out: row.get::<_, i64>(5)? as u64,
                    prohibited: row.get::<_, i64>(6)? as u64,
                })
            },
        )
        .context("failed to aggregate request stats")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RequestStats {
    pub avg_duration: f64,
    pub requests_per_second: f64,
    pub ok: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub prohibited: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{now_epoch, open_with_schema, CRAWLER_SCHEMA};

    fn db() -> (tempfile::TempDir, Connection) {
        let dir = tempfile::tempdir().unwrap();
        let con = open_with_schema(dir.path().join("crawler.db"), CRAWLER_SCHEMA).unwrap();
        (dir, con)
    }

    fn seed_url(con: &Connection, url: &str) {
        con.execute("INSERT INTO url (url) VALUES (?1)", [url]).unwrap();
    }

    #[test]
    fn status_tags_round_trip() {
        for status in [
            Status::Http(200),
            Status::Http(404),
            Status::Failed,
            Status::Timeout,
            Status::Prohibited,
            Status::RateLimitedUntil(1_721_000_000.25),
        ] {
            assert_eq!(Status::decode(&status.encode()).unwrap(), status);
        }
    }

    #[test]
    fn status_rejects_untagged_values() {
        assert!(Status::decode("200").is_err());
        assert!(Status::decode("1721000000.25").is_err());
        assert!(Status::decode("http:abc").is_err());
        assert!(Status::decode("").is_err());
    }

    #[test]
    fn check_status_returns_most_recent() {
        let (_dir, con) = db();
        seed_url(&con, "https://x.example/");
        let mut first = Request::new("https://x.example/");
        first.status = Some(Status::Failed);
        first.time = 10.0;
        first.save(&con).unwrap();

        let mut second = Request::new("https://x.example/");
        second.status = Some(Status::Http(200));
        second.time = 20.0;
        second.save(&con).unwrap();

        assert_eq!(
            Request::check_status(&con, "https://x.example/").unwrap(),
            Some(Status::Http(200))
        );
        assert_eq!(Request::check_status(&con, "https://y.example/").unwrap(), None);
    }

    #[test]
    fn rate_limited_epoch_lies_in_the_future() {
        let req = Request::rate_limited("https://x.example/", 30.0);
        match req.status {
            Some(Status::RateLimitedUntil(epoch)) => {
                assert!(epoch > now_epoch());
                assert!(epoch <= now_epoch() + 31.0);
            }
            other => panic!("unexpected status {:?}", other),
        }
        assert!(!req.status.unwrap().is_settled());
    }

    #[test]
    fn stats_aggregate_by_category() {
        let (_dir, con) = db();
        for (i, status) in [
            Status::Http(200),
            Status::Http(200),
            Status::Http(404),
            Status::Failed,
            Status::Timeout,
            Status::Prohibited,
        ]
        .into_iter()
        .enumerate()
        {
            let url = format!("https://s{}.example/", i);
            seed_url(&con, &url);
            let mut req = Request::new(&url);
            req.status = Some(status);
            req.time = i as f64;
            req.duration = Some(0.5);
            req.save(&con).unwrap();
        }
        let stats = Request::stats(&con).unwrap();
        assert_eq!(stats.ok, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.timed_out, 1);
        assert_eq!(stats.prohibited, 1);
        assert!((stats.avg_duration - 0.5).abs() < 1e-9);
        assert!(stats.requests_per_second > 0.0);
    }

    #[test]
    fn save_requires_an_outcome() {
        let (_dir, con) = db();
        seed_url(&con, "https://x.example/");
        assert!(Request::new("https://x.example/").save(&con).is_err());
    }
}
