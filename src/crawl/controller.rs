//! Multi-worker crawl pipeline.
//!
//! One owner task coordinates N workers over message channels. Workers do
//! the dangerous work — network I/O and HTML parsing — and nothing else;
//! the owner holds the crawl database, the hosts database and the frontier,
//! and persists every state change before dispatching follow-up work. A
//! crash therefore leaves the databases internally consistent, at worst
//! missing the URL that was in flight.

use std::collections::HashMap;
use std::io::Write;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::core::NeckarConfig;
use crate::crawl::{urls, Document, Frontier, Host, HostStore, Request, Status, TokenOutcome};
use crate::storage;

/// Work messages, owner → worker.
enum Work {
    /// Fetch `<origin>/robots.txt` and derive the host policy.
    FetchRobots { request: Request, host: Host },
    /// Perform the HTTP GET.
    Fetch(Request),
    /// Parse the body, compute fingerprint and relevance.
    ParseDocument(Document),
    /// Extract outgoing links.
    ExtractLinks(Document),
    /// Nothing to do before the earliest rate-limit epoch passes.
    Idle(f64),
}

/// Results, worker → owner.
enum Outcome {
    Robots { request: Request, host: Host },
    Fetched(Request),
    Parsed { doc: Document, parsed: bool },
    Links(Vec<String>),
    Idled,
}

/// Resolved runtime settings for one crawl.
struct Settings {
    user_agent: String,
    workers: usize,
    relevance_threshold: f64,
    near_duplicate_distance: u32,
    refill_cap: f64,
    refill_rate: f64,
}

impl Settings {
    fn from_config(config: &NeckarConfig) -> Self {
        Self {
            user_agent: config.resolve_user_agent(),
            workers: config.resolve_workers(),
            relevance_threshold: config.resolve_relevance_threshold(),
            near_duplicate_distance: config.resolve_near_duplicate_distance(),
            refill_cap: config.resolve_refill_cap(),
            refill_rate: config.resolve_refill_rate(),
        }
    }
}

pub struct Controller {
    crawl: Connection,
    frontier: Frontier,
    hosts: HostStore,
    client: reqwest::Client,
    settings: Settings,
}

impl Controller {
    /// Open the crawl and hosts databases named by the config; `crawler_db`
    /// overrides the configured crawler path (the CLI's `--db`).
    pub fn open(config: &NeckarConfig, crawler_db: Option<&str>) -> Result<Self> {
        let crawler_db = crawler_db
            .map(str::to_string)
            .unwrap_or_else(|| config.resolve_crawler_db());
        let settings = Settings::from_config(config);
        Ok(Self {
            crawl: storage::open(&crawler_db)?,
            frontier: Frontier::open(&crawler_db)?,
            hosts: HostStore::open(config.resolve_hosts_db())?,
            client: reqwest::Client::builder()
                .build()
                .context("failed to build HTTP client")?,
            settings,
        })
    }

    /// Run the crawl to completion: until the frontier is exhausted, no
    /// future rate-limit epoch remains, and every worker has drained.
    pub async fn run(mut self) -> Result<()> {
        let worker_count = self.settings.workers;
        info!("starting crawl with {} workers", worker_count);

        let (out_tx, mut out_rx) = mpsc::channel::<(usize, Outcome)>(worker_count * 2);
        let mut work_txs: HashMap<usize, mpsc::Sender<Work>> = HashMap::new();
        let mut handles = Vec::new();
        for id in 0..worker_count {
            let (work_tx, work_rx) = mpsc::channel::<Work>(1);
            work_txs.insert(id, work_tx);
            handles.push(tokio::spawn(worker_loop(
                id,
                self.client.clone(),
                self.settings.user_agent.clone(),
                work_rx,
                out_tx.clone(),
            )));
        }
        // The owner keeps no sender: once every worker is gone, recv ends.
        drop(out_tx);

        // Prime every worker with its first unit of work.
        for id in 0..worker_count {
            self.dispatch_next(id, &mut work_txs).await?;
        }

        let mut handled: u64 = 0;
        while let Some((id, outcome)) = out_rx.recv().await {
            self.handle(id, outcome, &mut work_txs).await?;
            handled += 1;
            if handled % 8 == 0 {
                self.print_progress()?;
            }
        }

        for handle in handles {
            let _ = handle.await;
        }
        self.print_progress()?;
        println!();
        info!("crawl complete");
        Ok(())
    }

    async fn handle(
        &mut self,
        id: usize,
        outcome: Outcome,
        work_txs: &mut HashMap<usize, mpsc::Sender<Work>>,
    ) -> Result<()> {
        match outcome {
            Outcome::Robots { request, host } => {
                self.hosts.store_fetched(&host)?;
                match self
                    .hosts
                    .try_take_token(&host, &request.url, &self.settings.user_agent)?
                {
                    TokenOutcome::Allowed => {
                        return self.send(id, Work::Fetch(request), work_txs).await;
                    }
                    TokenOutcome::Denied => {
                        Request::prohibited(&request.url).save(&self.crawl)?;
                    }
                    TokenOutcome::RetryAfter(seconds) => {
                        Request::rate_limited(&request.url, seconds).save(&self.crawl)?;
                        self.requeue(&request.url)?;
                    }
                }
            }
            Outcome::Fetched(request) => {
                let request_id = request.save(&self.crawl)?;
                if let Some(doc) = Document::from_request(&request, request_id) {
                    return self.send(id, Work::ParseDocument(doc), work_txs).await;
                }
            }
            Outcome::Parsed { mut doc, parsed } => {
                if !parsed {
                    // Unparseable body: record the failure so the URL is
                    // never retried, write no document.
                    warn!("failed to parse document from {}", doc.url);
                    Request::failed(&doc.url).save(&self.crawl)?;
                } else if doc.is_relevant(self.settings.relevance_threshold)
                    && !doc.check_for_duplicates(
                        &self.crawl,
                        self.settings.near_duplicate_distance,
                    )?
                {
                    doc.save(&self.crawl)?;
                    return self.send(id, Work::ExtractLinks(doc), work_txs).await;
                } else {
                    debug!("discarding {} (irrelevant or near-duplicate)", doc.url);
                }
            }
            Outcome::Links(links) => {
                for link in links {
                    if let Err(e) = self.frontier.push_if_new(&link) {
                        debug!("not queueing {}: {}", link, e);
                    }
                }
            }
            Outcome::Idled => {}
        }
        self.dispatch_next(id, work_txs).await
    }

    async fn send(
        &mut self,
        id: usize,
        work: Work,
        work_txs: &mut HashMap<usize, mpsc::Sender<Work>>,
    ) -> Result<()> {
        let gone = match work_txs.get(&id) {
            Some(tx) => tx.send(work).await.is_err(),
            None => return Ok(()),
        };
        if gone {
            // Worker crashed; its channel is closed. Continue without it.
            warn!("worker {} is gone, continuing with {} workers", id, work_txs.len() - 1);
            work_txs.remove(&id);
        }
        Ok(())
    }

    /// Select the next unit of work for a worker, or retire the worker when
    /// the crawl is complete.
    async fn dispatch_next(
        &mut self,
        id: usize,
        work_txs: &mut HashMap<usize, mpsc::Sender<Work>>,
    ) -> Result<()> {
        match self.next_work()? {
            Some(work) => self.send(id, work, work_txs).await,
            None => {
                // Closing the channel lets the worker exit.
                work_txs.remove(&id);
                Ok(())
            }
        }
    }

    /// The dispatcher's selection loop.
    ///
    /// Pop URLs until one is actionable: never-requested URLs go to fetch
    /// (or robots fetch when the host is unknown); settled statuses are
    /// skipped; future rate-limit epochs are requeued to the tail. When the
    /// frontier yields nothing useful, expired rate limits are requeued,
    /// else the worker idles until the earliest future epoch, else the
    /// crawl is complete.
    fn next_work(&mut self) -> Result<Option<Work>> {
        let mut attempts = self.frontier.len()? + 1;
        loop {
            if attempts == 0 {
                return self.fallback_work();
            }
            attempts -= 1;

            let Some(url) = self.frontier.pop()? else {
                return self.fallback_work();
            };
            match Request::check_status(&self.crawl, &url)? {
                Some(Status::Prohibited | Status::Timeout | Status::Failed) => continue,
                Some(Status::Http(_)) => continue,
                Some(Status::RateLimitedUntil(epoch)) => {
                    if epoch > storage::now_epoch() {
                        self.requeue(&url)?;
                        continue;
                    }
                }
                None => {}
            }

            let Some(origin) = urls::origin(&url) else {
                debug!("dropping unparseable frontier entry {}", url);
                continue;
            };
            match self.hosts.try_load(&origin)? {
                Some(host) => {
                    match self
                        .hosts
                        .try_take_token(&host, &url, &self.settings.user_agent)?
                    {
                        TokenOutcome::Allowed => {
                            return Ok(Some(Work::Fetch(Request::new(url))));
                        }
                        TokenOutcome::Denied => {
                            Request::prohibited(&url).save(&self.crawl)?;
                            continue;
                        }
                        TokenOutcome::RetryAfter(seconds) => {
                            Request::rate_limited(&url, seconds).save(&self.crawl)?;
                            self.requeue(&url)?;
                            continue;
                        }
                    }
                }
                None => {
                    let host = Host::new(
                        origin,
                        self.settings.refill_cap,
                        self.settings.refill_rate,
                    );
                    return Ok(Some(Work::FetchRobots {
                        request: Request::new(url),
                        host,
                    }));
                }
            }
        }
    }

    /// Frontier exhausted (or cycling): requeue expired rate limits, else
    /// idle until the earliest future epoch, else finish.
    fn fallback_work(&mut self) -> Result<Option<Work>> {
        if self.requeue_expired()? > 0 {
            return self.next_work();
        }
        let now = storage::now_epoch();
        if let Some(epoch) = self.earliest_rate_limit()? {
            if epoch > now {
                return Ok(Some(Work::Idle(epoch - now)));
            }
        }
        Ok(None)
    }

    /// Requeue a URL by id, without re-normalization.
    fn requeue(&mut self, url: &str) -> Result<()> {
        let url_id: Option<i64> = self
            .crawl
            .query_row("SELECT id FROM url WHERE url = ?1", [url], |row| row.get(0))
            .optional()?;
        match url_id {
            Some(url_id) => {
                self.frontier.push_id(url_id)?;
            }
            // Requeues come from popped entries, so the row exists; fall
            // back to a plain push if it somehow does not.
            None => self.frontier.push(url)?,
        }
        Ok(())
    }

    /// Put every URL whose most recent status is an expired rate-limit
    /// epoch back into the frontier. Returns how many were requeued.
    fn requeue_expired(&mut self) -> Result<usize> {
        let now = storage::now_epoch();
        let mut requeued = 0;
        for (url_id, status) in self.latest_rate_limits()? {
            if let Status::RateLimitedUntil(epoch) = status {
                if epoch <= now && self.frontier.push_id(url_id)? {
                    requeued += 1;
                }
            }
        }
        if requeued > 0 {
            debug!("requeued {} previously rate-limited URLs", requeued);
        }
        Ok(requeued)
    }

    /// Earliest rate-limit epoch among URLs not yet refetched.
    fn earliest_rate_limit(&mut self) -> Result<Option<f64>> {
        let mut earliest: Option<f64> = None;
        for (_, status) in self.latest_rate_limits()? {
            if let Status::RateLimitedUntil(epoch) = status {
                earliest = Some(match earliest {
                    Some(e) => e.min(epoch),
                    None => epoch,
                });
            }
        }
        Ok(earliest)
    }

    /// URLs whose most recent request is a rate-limit marker — queued or
    /// not: a requeued URL still pins the idle horizon, and `push_id`
    /// deduplicates requeues anyway.
    fn latest_rate_limits(&self) -> Result<Vec<(i64, Status)>> {
        let mut stmt = self.crawl.prepare(
            "SELECT url.id, r.status FROM url \
             JOIN request r ON r.url_id = url.id \
             WHERE r.time = (SELECT max(time) FROM request WHERE url_id = url.id) \
               AND r.status LIKE 'rate_limited:%'",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<(i64, Status)>>>()?;
        Ok(rows)
    }

    fn print_progress(&self) -> Result<()> {
        let stats = Request::stats(&self.crawl)?;
        let queued = self.frontier.len()?;
        print!(
            "\r{:.4} req/s, {:.4} s/req, {} queued, {:3} / {:3} / {:3} (f/t/p), {:4} ok",
            stats.requests_per_second,
            stats.avg_duration,
            queued,
            stats.failed,
            stats.timed_out,
            stats.prohibited,
            stats.ok
        );
        let _ = std::io::stdout().flush();
        Ok(())
    }
}

async fn worker_loop(
    id: usize,
    client: reqwest::Client,
    user_agent: String,
    mut work_rx: mpsc::Receiver<Work>,
    out_tx: mpsc::Sender<(usize, Outcome)>,
) {
    while let Some(work) = work_rx.recv().await {
        let outcome = match work {
            Work::FetchRobots { request, mut host } => {
                host.fetch(&client, &user_agent).await;
                Outcome::Robots { request, host }
            }
            Work::Fetch(mut request) => {
                request.make(&client, &user_agent).await;
                Outcome::Fetched(request)
            }
            Work::ParseDocument(mut doc) => {
                let parsed = doc.parse();
                if parsed {
                    doc.simhash();
                    doc.relevance();
                }
                Outcome::Parsed { doc, parsed }
            }
            Work::ExtractLinks(doc) => Outcome::Links(doc.links()),
            Work::Idle(seconds) => {
                debug!("worker {} idling for {:.1}s", id, seconds);
                tokio::time::sleep(std::time::Duration::from_secs_f64(seconds.max(0.0))).await;
                Outcome::Idled
            }
        };
        if out_tx.send((id, outcome)).await.is_err() {
            break;
        }
    }
}

/// One synchronous crawl step, the `crawl-next` command: pop a URL, check
/// its history and the host policy, fetch, parse, dedupe, store, queue the
/// outgoing links.
///
/// `Ok(true)` means progress was made (or the URL was skipped for a settled
/// reason); `Ok(false)` means the popped URL was requeued because of rate
/// limiting. `Ok(None)`-like frontier exhaustion is reported separately so
/// the CLI can exit with a distinct code.
pub async fn crawl_step(config: &NeckarConfig, crawler_db: Option<&str>) -> Result<Option<bool>> {
    let mut controller = Controller::open(config, crawler_db)?;
    let settings = &controller.settings;

    let Some(url) = controller.frontier.pop()? else {
        return Ok(None);
    };
    match Request::check_status(&controller.crawl, &url)? {
        Some(Status::Prohibited | Status::Timeout | Status::Failed) => {
            info!("{} previously not fetched", url);
            return Ok(Some(true));
        }
        Some(Status::Http(code)) => {
            info!("{} already fetched with status {}", url, code);
            return Ok(Some(true));
        }
        Some(Status::RateLimitedUntil(epoch)) if epoch > storage::now_epoch() => {
            info!("{} throttled for another {:.1}s", url, epoch - storage::now_epoch());
            controller.frontier.push(&url)?;
            return Ok(Some(false));
        }
        _ => {}
    }

    let origin = urls::origin(&url).context("frontier entry is not a URL")?;
    let host = match controller.hosts.try_load(&origin)? {
        Some(host) => host,
        None => {
            let mut host = Host::new(&origin, settings.refill_cap, settings.refill_rate);
            host.fetch(&controller.client, &settings.user_agent).await;
            controller.hosts.store_fetched(&host)?;
            host
        }
    };
    match controller
        .hosts
        .try_take_token(&host, &url, &settings.user_agent)?
    {
        TokenOutcome::Denied => {
            info!("crawling prohibited for {}", url);
            Request::prohibited(&url).save(&controller.crawl)?;
            return Ok(Some(true));
        }
        TokenOutcome::RetryAfter(seconds) => {
            info!("host rate-limited for {:.1}s", seconds);
            Request::rate_limited(&url, seconds).save(&controller.crawl)?;
            controller.frontier.push(&url)?;
            return Ok(Some(false));
        }
        TokenOutcome::Allowed => {}
    }

    info!("fetching {}", url);
    let mut request = Request::new(&url);
    let succeeded = request.make(&controller.client, &settings.user_agent).await;
    let request_id = request.save(&controller.crawl)?;
    if !succeeded {
        return Ok(Some(true));
    }
    let Some(mut doc) = Document::from_request(&request, request_id) else {
        return Ok(Some(true));
    };
    if !doc.parse() {
        Request::failed(&url).save(&controller.crawl)?;
        return Ok(Some(true));
    }
    info!("parsed document, relevance score is {:.4}", doc.relevance());
    if !doc.is_relevant(settings.relevance_threshold) {
        info!("document is irrelevant, ignoring links");
        return Ok(Some(true));
    }
    if doc.check_for_duplicates(&controller.crawl, settings.near_duplicate_distance)? {
        return Ok(Some(true));
    }
    doc.save(&controller.crawl)?;
    let links = doc.links();
    info!("extracted {} links", links.len());
    for link in links {
        if let Err(e) = controller.frontier.push_if_new(&link) {
            debug!("not queueing {}: {}", link, e);
        }
    }
    Ok(Some(true))
}

/// Load seed URLs, one per line, into the frontier.
pub fn load_urls(config: &NeckarConfig, crawler_db: Option<&str>, urls_file: &str) -> Result<usize> {
    let crawler_db = crawler_db
        .map(str::to_string)
        .unwrap_or_else(|| config.resolve_crawler_db());
    let mut frontier = Frontier::open(crawler_db)?;
    let contents = std::fs::read_to_string(urls_file)
        .with_context(|| format!("failed to read {}", urls_file))?;
    let mut loaded = 0;
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match frontier.push(line) {
            Ok(()) => loaded += 1,
            Err(e) => warn!("skipping seed {}: {}", line, e),
        }
    }
    Ok(loaded)
}
