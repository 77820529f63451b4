// ---------------------------------------------------------------------------
// NeckarConfig — file-based config loader (neckar.json) with env-var fallback
// ---------------------------------------------------------------------------

/// Top-level config loaded from `neckar.json`.
///
/// Every field is optional; `resolve_*` accessors fall back to an env var
/// and then to a built-in default, so a missing or partial file always
/// yields a working configuration.
#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct NeckarConfig {
    /// User-Agent sent with every outbound request, including robots.txt.
    pub user_agent: Option<String>,
    /// Path of the crawler database (urls, frontier, requests, documents).
    pub crawler_db: Option<String>,
    /// Path of the hosts database (robots policy + token buckets).
    pub hosts_db: Option<String>,
    /// Path of the index database (documents, words, postings).
    pub index_db: Option<String>,
    /// Directory holding the WordNet files and the optional entity gazetteer.
    pub data_dir: Option<String>,
    /// Crawl worker count.
    pub workers: Option<usize>,
    /// Keyword-density threshold above which a page counts as on-topic.
    pub relevance_threshold: Option<f64>,
    /// Hamming distance (out of 128) at or below which two fingerprints are
    /// near-duplicates.
    pub near_duplicate_distance: Option<u32>,
    /// Default token-bucket capacity for hosts without robots rate directives.
    pub refill_cap: Option<f64>,
    /// Default token-bucket refill rate (tokens/second).
    pub refill_rate: Option<f64>,
    /// Port of the word-cloud UI server.
    pub ui_port: Option<u16>,
    /// Base URL `download-corpora` fetches the WordNet files from.
    pub corpora_base_url: Option<String>,
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl NeckarConfig {
    /// User agent: JSON field → `NECKAR_USER_AGENT` env var → `NeckarBot/0.4`.
    pub fn resolve_user_agent(&self) -> String {
        self.user_agent
            .clone()
            .or_else(|| env_string("NECKAR_USER_AGENT"))
            .unwrap_or_else(|| "NeckarBot/0.4".to_string())
    }

    /// Crawler DB path: JSON field → `NECKAR_CRAWLER_DB` → `crawler.db`.
    pub fn resolve_crawler_db(&self) -> String {
        self.crawler_db
            .clone()
            .or_else(|| env_string("NECKAR_CRAWLER_DB"))
            .unwrap_or_else(|| "crawler.db".to_string())
    }

    /// Hosts DB path: JSON field → `NECKAR_HOSTS_DB` → `hosts.db`.
    pub fn resolve_hosts_db(&self) -> String {
        self.hosts_db
            .clone()
            .or_else(|| env_string("NECKAR_HOSTS_DB"))
            .unwrap_or_else(|| "hosts.db".to_string())
    }

    /// Index DB path: JSON field → `NECKAR_INDEX_DB` → `index.db`.
    pub fn resolve_index_db(&self) -> String {
        self.index_db
            .clone()
            .or_else(|| env_string("NECKAR_INDEX_DB"))
            .unwrap_or_else(|| "index.db".to_string())
    }

    /// Data directory: JSON field → `NECKAR_DATA_DIR` → `./corpora`.
    pub fn resolve_data_dir(&self) -> String {
        self.data_dir
            .clone()
            .or_else(|| env_string("NECKAR_DATA_DIR"))
            .unwrap_or_else(|| "corpora".to_string())
    }

    /// Worker count: JSON field → `NECKAR_WORKERS` → 8.
    pub fn resolve_workers(&self) -> usize {
        self.workers
            .or_else(|| env_string("NECKAR_WORKERS").and_then(|v| v.parse().ok()))
            .unwrap_or(8)
            .max(1)
    }

    /// Relevance threshold: JSON field → `NECKAR_RELEVANCE_THRESHOLD` → 0.01.
    pub fn resolve_relevance_threshold(&self) -> f64 {
        self.relevance_threshold
            .or_else(|| env_string("NECKAR_RELEVANCE_THRESHOLD").and_then(|v| v.parse().ok()))
            .unwrap_or(0.01)
    }

    /// Near-duplicate Hamming threshold: JSON field → env → 15.
    pub fn resolve_near_duplicate_distance(&self) -> u32 {
        self.near_duplicate_distance
            .or_else(|| env_string("NECKAR_NEAR_DUPLICATE_DISTANCE").and_then(|v| v.parse().ok()))
            .unwrap_or(15)
    }

    /// Default bucket capacity: JSON field → env → 60 tokens.
    pub fn resolve_refill_cap(&self) -> f64 {
        self.refill_cap
            .or_else(|| env_string("NECKAR_REFILL_CAP").and_then(|v| v.parse().ok()))
            .unwrap_or(60.0)
    }

    /// Default refill rate: JSON field → env → 2 tokens/second.
    pub fn resolve_refill_rate(&self) -> f64 {
        self.refill_rate
            .or_else(|| env_string("NECKAR_REFILL_RATE").and_then(|v| v.parse().ok()))
            .unwrap_or(2.0)
    }

    /// UI port: JSON field → `NECKAR_PORT` / `PORT` env vars → 5000.
    pub fn resolve_ui_port(&self) -> u16 {
        self.ui_port
            .or_else(|| env_string("NECKAR_PORT").and_then(|v| v.parse().ok()))
            .or_else(|| env_string("PORT").and_then(|v| v.parse().ok()))
            .unwrap_or(5000)
    }

    /// Corpora mirror: JSON field → `NECKAR_CORPORA_BASE_URL` → Princeton dict.
    pub fn resolve_corpora_base_url(&self) -> String {
        self.corpora_base_url
            .clone()
            .or_else(|| env_string("NECKAR_CORPORA_BASE_URL"))
            .unwrap_or_else(|| "https://wordnetcode.princeton.edu/3.0/dict".to_string())
    }
}

/// Load `neckar.json` from standard locations.
///
/// Search order (first found wins):
/// 1. `NECKAR_CONFIG` env var path
/// 2. `./neckar.json` (process cwd)
/// 3. `../neckar.json` (one level up when running from a subdirectory)
///
/// Missing file → `NeckarConfig::default()` (silent, env fallbacks apply).
/// Parse error → log a warning, return `NeckarConfig::default()`.
pub fn load_config() -> NeckarConfig {
    let mut candidates = vec![
        std::path::PathBuf::from("neckar.json"),
        std::path::PathBuf::from("../neckar.json"),
    ];
    if let Ok(env_path) = std::env::var("NECKAR_CONFIG") {
        candidates.insert(0, std::path::PathBuf::from(env_path));
    }

    for path in &candidates {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<NeckarConfig>(&contents) {
                Ok(cfg) => {
                    tracing::info!("neckar.json loaded from {}", path.display());
                    return cfg;
                }
                Err(e) => {
                    tracing::warn!(
                        "neckar.json parse error at {}: {} — using defaults",
                        path.display(),
                        e
                    );
                    return NeckarConfig::default();
                }
            },
            Err(_) => continue, // not found at this path — try next
        }
    }

    NeckarConfig::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_complete() {
        let cfg = NeckarConfig::default();
        assert_eq!(cfg.resolve_workers(), 8);
        assert_eq!(cfg.resolve_relevance_threshold(), 0.01);
        assert_eq!(cfg.resolve_near_duplicate_distance(), 15);
        assert_eq!(cfg.resolve_refill_cap(), 60.0);
        assert_eq!(cfg.resolve_refill_rate(), 2.0);
        assert!(!cfg.resolve_user_agent().is_empty());
    }

    #[test]
    fn json_fields_win_over_defaults() {
        let cfg: NeckarConfig = serde_json::from_str(
            r#"{"workers": 3, "relevance_threshold": 0.05, "crawler_db": "/tmp/c.db"}"#,
        )
        .unwrap();
        assert_eq!(cfg.resolve_workers(), 3);
        assert_eq!(cfg.resolve_relevance_threshold(), 0.05);
        assert_eq!(cfg.resolve_crawler_db(), "/tmp/c.db");
        // Untouched fields still fall back.
        assert_eq!(cfg.resolve_ui_port(), 5000);
    }
}
