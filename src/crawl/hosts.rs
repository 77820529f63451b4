//! Per-origin robots policy and token-bucket rate limiting.
//!
//! The origin (`scheme://host[:port]`) is the unit of politeness. Each
//! origin's record holds a tri-valued global policy (allow all / deny all /
//! consult robots.txt), the stored robots body, and a continuously refilled
//! token bucket. Token deduction is a single guarded UPDATE so concurrent
//! workers sharing the hosts database can never double-spend.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use reqwest::header::USER_AGENT;
use rusqlite::{Connection, ErrorCode, OptionalExtension};
use texting_robots::Robot;
use tracing::{debug, info, warn};

use crate::storage;

/// Outcome of asking for a fetch token.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TokenOutcome {
    /// Token taken; the caller is expected to make the request.
    Allowed,
    /// robots policy denies the URL permanently.
    Denied,
    /// Bucket is empty; expected seconds until a token is available.
    RetryAfter(f64),
}

/// Per-origin politeness record.
#[derive(Debug, Clone)]
pub struct Host {
    pub origin: String,
    /// `Some(true)` = allow all, `Some(false)` = deny all, `None` = consult
    /// the parsed robots rules.
    pub global_policy: Option<bool>,
    pub robots_txt: Option<String>,
    /// Tokens added per second.
    pub refill_rate: f64,
    /// Bucket capacity; `0 <= tokens <= refill_cap` always holds.
    pub refill_cap: f64,
    /// Epoch of the last bucket update.
    pub updated: f64,
    pub tokens: f64,
}

impl Host {
    /// Fresh record for an origin whose robots.txt has not been fetched
    /// yet, with a full bucket at the default rate.
    pub fn new(origin: impl Into<String>, default_cap: f64, default_rate: f64) -> Self {
        Self {
            origin: origin.into(),
            global_policy: None,
            robots_txt: None,
            refill_rate: default_rate,
            refill_cap: default_cap,
            updated: storage::now_epoch(),
            tokens: default_cap,
        }
    }

    /// Download `<origin>/robots.txt` and derive the policy:
    ///
    /// * 401/403 — the server guards robots.txt itself: deny all.
    /// * other 4xx — no robots restrictions: allow all.
    /// * 3xx surviving redirect resolution, 5xx, transport or decoding
    ///   failure — deny all until the host behaves.
    /// * success — keep the rules; rate from `Request-rate`, else
    ///   `Crawl-delay` as one token per delay, else the defaults.
    ///
    /// The bucket starts full in every case.
    pub async fn fetch(&mut self, client: &reqwest::Client, user_agent: &str) {
        let robots_url = format!("{}/robots.txt", self.origin);
        let response = client
            .get(&robots_url)
            .timeout(crate::crawl::request::REQUEST_TIMEOUT)
            .header(USER_AGENT, user_agent)
            .send()
            .await;
        let (default_cap, default_rate) = (self.refill_cap, self.refill_rate);
        self.robots_txt = None;
        match response {
            Err(e) => {
                warn!("failed to fetch robots for {}: {}", self.origin, e);
                self.global_policy = Some(false);
            }
            Ok(response) => {
                let status = response.status();
                if status.as_u16() == 401 || status.as_u16() == 403 {
                    self.global_policy = Some(false);
                } else if status.is_redirection() || status.is_server_error() {
                    self.global_policy = Some(false);
                } else if status.is_client_error() {
                    self.global_policy = Some(true);
                } else {
                    match response.text().await {
                        Err(e) => {
                            warn!("failed to read robots for {}: {}", self.origin, e);
                            self.global_policy = Some(false);
                        }
                        Ok(body) => {
                            debug!("fetched robots.txt for {}", self.origin);
                            self.apply_robots(body, user_agent, default_cap, default_rate);
                        }
                    }
                }
            }
        }
        self.updated = storage::now_epoch();
        self.tokens = self.refill_cap;
    }

    fn apply_robots(&mut self, body: String, user_agent: &str, default_cap: f64, default_rate: f64) {
        self.global_policy = None;
        if let Some((requests, seconds)) = parse_request_rate(&body) {
            self.refill_cap = requests;
            self.refill_rate = requests / seconds;
        } else {
            let delay = Robot::new(user_agent, body.as_bytes())
                .ok()
                .and_then(|robot| robot.delay)
                .map(f64::from)
                .filter(|d| *d > 0.0);
            if let Some(delay) = delay {
                self.refill_cap = 1.0;
                self.refill_rate = 1.0 / delay;
            } else {
                self.refill_cap = default_cap;
                self.refill_rate = default_rate;
            }
        }
        self.robots_txt = Some(body);
    }

    /// Policy check only; no token arithmetic. `global_policy` wins, the
    /// parsed rules decide otherwise. Unparseable stored rules deny.
    pub fn allows(&self, url: &str, user_agent: &str) -> bool {
        match self.global_policy {
            Some(policy) => policy,
            None => match &self.robots_txt {
                Some(body) => Robot::new(user_agent, body.as_bytes())
                    .map(|robot| robot.allowed(url))
                    .unwrap_or(false),
                None => false,
            },
        }
    }
}

/// `Request-rate: n/m` — n requests per m seconds. The directive predates
/// the RFC and is rare; the first parseable occurrence wins.
fn parse_request_rate(body: &str) -> Option<(f64, f64)> {
    for line in body.lines() {
        let line = line.split('#').next().unwrap_or("");
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if !name.trim().eq_ignore_ascii_case("request-rate") {
            continue;
        }
        let Some((requests, seconds)) = value.trim().split_once('/') else {
            continue;
        };
        // The denominator may carry a unit suffix (m/h); seconds otherwise.
        let requests: f64 = match requests.trim().parse() {
            Ok(r) => r,
            Err(_) => continue,
        };
        let seconds = seconds.trim();
        let (number, unit) = match seconds.char_indices().find(|(_, c)| c.is_alphabetic()) {
            Some((idx, _)) => seconds.split_at(idx),
            None => (seconds, ""),
        };
        let Ok(mut seconds) = number.trim().parse::<f64>() else {
            continue;
        };
        match unit.trim() {
            "m" => seconds *= 60.0,
            "h" => seconds *= 3600.0,
            _ => {}
        }
        if requests > 0.0 && seconds > 0.0 {
            return Some((requests, seconds));
        }
    }
    None
}

/// Persistence and atomic token accounting for [`Host`] records.
pub struct HostStore {
    con: Connection,
}

impl HostStore {
    /// Open (and, on first use, initialize) the hosts database.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            con: storage::open_with_schema(path, storage::HOSTS_SCHEMA)?,
        })
    }

    pub fn store(&self, host: &Host) -> Result<()> {
        self.con.execute(
            "INSERT OR REPLACE INTO host \
                (origin, global_policy, robots_txt, refill_rate, refill_cap, updated, tokens) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            (
                &host.origin,
                host.global_policy,
                &host.robots_txt,
                host.refill_rate,
                host.refill_cap,
                host.updated,
                host.tokens,
            ),
        )?;
        Ok(())
    }

    pub fn try_load(&self, origin: &str) -> Result<Option<Host>> {
        let host = self
            .con
            .query_row(
                "SELECT origin, global_policy, robots_txt, refill_rate, refill_cap, \
                        updated, tokens \
                 FROM host WHERE origin = ?1",
                [origin],
                |row| {
                    Ok(Host {
                        origin: row.get(0)?,
                        global_policy: row.get(1)?,
                        robots_txt: row.get(2)?,
                        refill_rate: row.get(3)?,
                        refill_cap: row.get(4)?,
                        updated: row.get(5)?,
                        tokens: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(host)
    }

    /// Check policy, then atomically take one token from the origin's
    /// bucket.
    ///
    /// The deduction is a single UPDATE that refills by elapsed time,
    /// clamps at the capacity, and subtracts one; the CHECK constraint on
    /// `tokens` rejects the statement when the bucket is empty, which is
    /// the signal to compute the remaining wait instead. Two workers can
    /// race for the last token, but only one UPDATE commits.
    pub fn try_take_token(&self, host: &Host, url: &str, user_agent: &str) -> Result<TokenOutcome> {
        if !host.allows(url, user_agent) {
            return Ok(TokenOutcome::Denied);
        }
        let now = storage::now_epoch();
        let updated = self.con.execute(
            "UPDATE host \
             SET tokens = MIN(tokens + ((?2 - updated) * refill_rate), refill_cap) - 1, \
                 updated = ?2 \
             WHERE origin = ?1",
            (&host.origin, now),
        );
        match updated {
            Ok(1) => Ok(TokenOutcome::Allowed),
            Ok(_) => Err(anyhow!("host {} is not stored", host.origin)),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::ConstraintViolation =>
            {
                // Bucket empty. Recompute the wait from the stored row —
                // the caller's copy may be stale.
                let (tokens, updated, refill_rate): (f64, f64, f64) = self
                    .con
                    .query_row(
                        "SELECT tokens, updated, refill_rate FROM host WHERE origin = ?1",
                        [&host.origin],
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                    )
                    .with_context(|| format!("host {} vanished", host.origin))?;
                let needed = (1.0 - tokens) / refill_rate;
                let waited = now - updated;
                Ok(TokenOutcome::RetryAfter((needed - waited).max(0.0)))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Store the record and log the derived policy. Convenience for the
    /// controller's robots-result handling.
    pub fn store_fetched(&self, host: &Host) -> Result<()> {
        self.store(host)?;
        info!(
            "robots for {}: policy={:?} cap={} rate={:.3}/s",
            host.origin,
            host.global_policy,
            host.refill_cap,
            host.refill_rate
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORIGIN: &str = "https://tuebingen.example";
    const AGENT: &str = "NeckarBot/0.4";

    fn store() -> (tempfile::TempDir, HostStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = HostStore::open(dir.path().join("hosts.db")).unwrap();
        (dir, store)
    }

    fn bucket_host(cap: f64, rate: f64) -> Host {
        let mut host = Host::new(ORIGIN, cap, rate);
        host.global_policy = Some(true);
        host
    }

    #[test]
    fn round_trips_through_the_store() {
        let (_dir, store) = store();
        let mut host = Host::new(ORIGIN, 60.0, 2.0);
        host.global_policy = None;
        host.robots_txt = Some("User-agent: *\nDisallow: /private/".to_string());
        store.store(&host).unwrap();

        let loaded = store.try_load(ORIGIN).unwrap().unwrap();
        assert_eq!(loaded.origin, ORIGIN);
        assert_eq!(loaded.global_policy, None);
        assert_eq!(loaded.robots_txt, host.robots_txt);
        assert_eq!(loaded.refill_cap, 60.0);
        assert!(store.try_load("https://other.example").unwrap().is_none());
    }

    #[test]
    fn token_bucket_empties_and_refills() {
        let (_dir, store) = store();
        let host = bucket_host(2.0, 1.0);
        store.store(&host).unwrap();

        let url = format!("{}/page", ORIGIN);
        assert_eq!(
            store.try_take_token(&host, &url, AGENT).unwrap(),
            TokenOutcome::Allowed
        );
        assert_eq!(
            store.try_take_token(&host, &url, AGENT).unwrap(),
            TokenOutcome::Allowed
        );
        let wait = match store.try_take_token(&host, &url, AGENT).unwrap() {
            TokenOutcome::RetryAfter(wait) => wait,
            other => panic!("expected RetryAfter, got {:?}", other),
        };
        assert!(wait > 0.0 && wait <= 1.0, "wait was {}", wait);

        std::thread::sleep(std::time::Duration::from_secs_f64(wait + 0.05));
        assert_eq!(
            store.try_take_token(&host, &url, AGENT).unwrap(),
            TokenOutcome::Allowed
        );
    }

    #[test]
    fn tokens_never_exceed_capacity() {
        let (_dir, store) = store();
        let mut host = bucket_host(2.0, 1000.0);
        // Pretend the last update was long ago: refill must clamp at cap.
        host.updated = storage::now_epoch() - 3600.0;
        store.store(&host).unwrap();
        let url = format!("{}/x", ORIGIN);
        for _ in 0..2 {
            assert_eq!(
                store.try_take_token(&host, &url, AGENT).unwrap(),
                TokenOutcome::Allowed
            );
        }
        let (tokens, cap): (f64, f64) = store
            .con
            .query_row(
                "SELECT tokens, refill_cap FROM host WHERE origin = ?1",
                [ORIGIN],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert!(tokens >= 0.0 && tokens <= cap);
    }

    #[test]
    fn global_deny_beats_everything() {
        let (_dir, store) = store();
        let mut host = Host::new(ORIGIN, 60.0, 2.0);
        host.global_policy = Some(false);
        store.store(&host).unwrap();
        assert_eq!(
            store
                .try_take_token(&host, &format!("{}/anything", ORIGIN), AGENT)
                .unwrap(),
            TokenOutcome::Denied
        );
    }

    #[test]
    fn disallow_all_rules_deny_every_url() {
        let (_dir, store) = store();
        let mut host = Host::new(ORIGIN, 60.0, 2.0);
        host.global_policy = None;
        host.robots_txt = Some("User-agent: *\nDisallow: /\n".to_string());
        store.store(&host).unwrap();
        for path in ["/", "/index.html", "/a/b/c"] {
            assert_eq!(
                store
                    .try_take_token(&host, &format!("{}{}", ORIGIN, path), AGENT)
                    .unwrap(),
                TokenOutcome::Denied
            );
        }
    }

    #[test]
    fn scoped_rules_allow_the_rest() {
        let mut host = Host::new(ORIGIN, 60.0, 2.0);
        host.global_policy = None;
        host.robots_txt =
            Some("User-agent: *\nDisallow: /private/\nAllow: /private/tour\n".to_string());
        assert!(!host.allows(&format!("{}/private/data", ORIGIN), AGENT));
        assert!(host.allows(&format!("{}/private/tour", ORIGIN), AGENT));
        assert!(host.allows(&format!("{}/public", ORIGIN), AGENT));
    }

    #[test]
    fn request_rate_directive_parses() {
        assert_eq!(parse_request_rate("Request-rate: 1/5"), Some((1.0, 5.0)));
        assert_eq!(
            parse_request_rate("User-agent: *\nrequest-rate: 30/1m\n"),
            Some((30.0, 60.0))
        );
        assert_eq!(parse_request_rate("Crawl-delay: 10"), None);
        assert_eq!(parse_request_rate("Request-rate: bogus"), None);
    }

    #[test]
    fn robots_rates_feed_the_bucket() {
        let mut host = Host::new(ORIGIN, 60.0, 2.0);
        host.apply_robots(
            "User-agent: *\nRequest-rate: 2/10\n".to_string(),
            AGENT,
            60.0,
            2.0,
        );
        assert_eq!(host.refill_cap, 2.0);
        assert!((host.refill_rate - 0.2).abs() < 1e-12);

        let mut host = Host::new(ORIGIN, 60.0, 2.0);
        host.apply_robots("User-agent: *\nCrawl-delay: 4\n".to_string(), AGENT, 60.0, 2.0);
        assert_eq!(host.refill_cap, 1.0);
        assert!((host.refill_rate - 0.25).abs() < 1e-12);

        let mut host = Host::new(ORIGIN, 60.0, 2.0);
        host.apply_robots("User-agent: *\nDisallow: /x\n".to_string(), AGENT, 60.0, 2.0);
        assert_eq!(host.refill_cap, 60.0);
        assert_eq!(host.refill_rate, 2.0);
    }
}
