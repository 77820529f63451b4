use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use neckar::core::{load_config, NeckarConfig};
use neckar::crawl::{controller, Controller, Request};
use neckar::{indexer, storage, ui};

#[derive(Parser)]
#[command(name = "neckar", version, about = "Focused web search engine for the Tübingen region")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a database file and initialize tables with an SQL script
    InitDb {
        /// Where to create the SQLite database file
        #[arg(long)]
        db: PathBuf,
        /// SQL script to initialize the tables
        #[arg(long)]
        sql: PathBuf,
    },
    /// Download the WordNet files into the data directory
    DownloadCorpora {
        /// Target directory (defaults to the configured data dir)
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Fetch a single URL and print body and headers (debugging aid)
    UrlRequest {
        #[arg(long, default_value = "https://www.uni-tuebingen.de/")]
        url: String,
    },
    /// Load URLs from a file (one per line) into the frontier
    LoadUrls {
        /// Location of the crawler database file
        #[arg(long)]
        db: Option<String>,
        /// Newline-separated list of URLs
        #[arg(long, default_value = "seed.urls")]
        urls: String,
    },
    /// Crawl a single URL off the frontier
    CrawlNext {
        #[arg(long)]
        db: Option<String>,
    },
    /// Run the multi-worker crawl until the frontier is exhausted
    Crawl {
        #[arg(long)]
        db: Option<String>,
    },
    /// Build the inverted index from the crawled documents
    IndexAll {
        #[arg(long = "crawl_db")]
        crawl_db: Option<String>,
        #[arg(long = "index_db")]
        index_db: Option<String>,
        /// SQL script creating the index tables (applied before indexing)
        #[arg(long = "index_sql")]
        index_sql: Option<PathBuf>,
    },
    /// Serve the word-cloud search UI
    Serve {
        #[arg(long = "index_db")]
        index_db: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,tower_http=warn"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();
    let config = load_config();

    match cli.command {
        Command::InitDb { db, sql } => {
            storage::init_db(&db, &sql)?;
            info!("initialized {}", db.display());
        }
        Command::DownloadCorpora { path } => {
            let target = path.unwrap_or_else(|| PathBuf::from(config.resolve_data_dir()));
            download_corpora(&config, &target).await?;
        }
        Command::UrlRequest { url } => {
            url_request(&config, &url).await?;
        }
        Command::LoadUrls { db, urls } => {
            let loaded = controller::load_urls(&config, db.as_deref(), &urls)?;
            info!("queued {} URLs from {}", loaded, urls);
        }
        Command::CrawlNext { db } => {
            match controller::crawl_step(&config, db.as_deref()).await? {
                Some(_) => {}
                None => {
                    warn!("frontier is empty");
                    std::process::exit(-1);
                }
            }
        }
        Command::Crawl { db } => {
            Controller::open(&config, db.as_deref())?.run().await?;
        }
        Command::IndexAll {
            crawl_db,
            index_db,
            index_sql,
        } => {
            let crawl_db = crawl_db.unwrap_or_else(|| config.resolve_crawler_db());
            let index_db = index_db.unwrap_or_else(|| config.resolve_index_db());
            let crawl = storage::open(&crawl_db)?;
            let mut index = match index_sql {
                Some(sql) => {
                    storage::init_db(&index_db, &sql)?;
                    storage::open(&index_db)?
                }
                None => storage::open_with_schema(&index_db, storage::INDEX_SCHEMA)?,
            };
            let stats = indexer::index_all(&crawl, &mut index)?;
            info!(
                "indexed {} documents ({} skipped, {} postings)",
                stats.indexed, stats.skipped, stats.postings
            );
        }
        Command::Serve { index_db, port } => {
            let index_db = index_db.unwrap_or_else(|| config.resolve_index_db());
            let port = port.unwrap_or_else(|| config.resolve_ui_port());
            ui::serve(
                PathBuf::from(index_db),
                PathBuf::from(config.resolve_data_dir()),
                port,
            )
            .await?;
        }
    }
    Ok(())
}

/// Fetch the WordNet noun files (and nothing else — the stopword list is
/// compiled in) from the configured mirror.
async fn download_corpora(config: &NeckarConfig, target: &std::path::Path) -> Result<()> {
    const FILES: &[&str] = &["index.noun", "data.noun"];
    std::fs::create_dir_all(target)
        .with_context(|| format!("failed to create {}", target.display()))?;
    let base = config.resolve_corpora_base_url();
    let client = reqwest::Client::new();
    for file in FILES {
        let url = format!("{}/{}", base.trim_end_matches('/'), file);
        info!("downloading {}", url);
        let response = client
            .get(&url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .with_context(|| format!("failed to download {}", url))?;
        let body = response.bytes().await?;
        let dest = target.join(file);
        std::fs::write(&dest, &body)
            .with_context(|| format!("failed to write {}", dest.display()))?;
        info!("wrote {} ({} bytes)", dest.display(), body.len());
    }
    Ok(())
}

/// One-off request with the crawler's headers; prints what the crawl
/// pipeline would see.
async fn url_request(config: &NeckarConfig, url: &str) -> Result<()> {
    let client = reqwest::Client::new();
    let mut request = Request::new(url);
    let succeeded = request.make(&client, &config.resolve_user_agent()).await;
    match request.status {
        Some(status) => println!("Status: {}", status.encode()),
        None => println!("Status: none"),
    }
    if let Some(headers) = &request.headers {
        for (name, value) in headers {
            println!("{}: {}", name, value);
        }
        println!(
            "Language: {}",
            headers.get("content-language").map(String::as_str).unwrap_or("unknown")
        );
        println!(
            "Type: {}",
            headers.get("content-type").map(String::as_str).unwrap_or("unknown")
        );
    }
    if let Some(data) = &request.data {
        println!("{}", String::from_utf8_lossy(data));
    }
    if !succeeded {
        std::process::exit(1);
    }
    Ok(())
}
