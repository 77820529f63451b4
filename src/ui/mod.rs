//! Word-cloud search UI.
//!
//! Two endpoints: `GET /` serves the static page, `POST
//! /generate_word_cloud` runs the query pipeline and returns the ranked
//! results as word-cloud entries. Query results are cached briefly — the
//! index only changes when `index-all` runs.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, Json},
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::search::Searcher;
use crate::storage;

#[derive(serde::Deserialize)]
pub struct WordCloudRequest {
    #[serde(default)]
    pub query: String,
}

/// One word-cloud entry: `text` is the document title, falling back to the
/// URL; `value` is the normalized score.
#[derive(serde::Serialize, Clone, Debug)]
pub struct WordCloudEntry {
    pub text: String,
    pub value: f64,
    pub url: String,
}

#[derive(serde::Serialize)]
struct ErrorResponse {
    error: String,
}

pub struct UiState {
    index_db: PathBuf,
    searcher: Arc<Searcher>,
    cache: moka::future::Cache<String, Arc<Vec<WordCloudEntry>>>,
}

/// Serve the UI until ctrl-c.
pub async fn serve(index_db: PathBuf, data_dir: PathBuf, port: u16) -> Result<()> {
    let searcher = {
        // WordNet loading reads a few MB of dict files; keep it off the
        // runtime threads.
        let data_dir = data_dir.clone();
        tokio::task::spawn_blocking(move || Searcher::new(data_dir)).await?
    };
    let state = Arc::new(UiState {
        index_db,
        searcher: Arc::new(searcher),
        cache: moka::future::Cache::builder()
            .max_capacity(10_000)
            .time_to_live(std::time::Duration::from_secs(60 * 10))
            .build(),
    });

    let app = Router::new()
        .route("/", get(index_page))
        .route("/generate_word_cloud", post(generate_word_cloud))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let bind_addr = format!("0.0.0.0:{}", port);
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            anyhow::bail!(
                "Address already in use: {}. Stop the existing process or pass --port {}.",
                bind_addr,
                port.saturating_add(1)
            )
        }
        Err(e) => return Err(e.into()),
    };
    info!("search UI listening on http://{}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn index_page() -> Html<&'static str> {
    Html(include_str!("index.html"))
}

async fn generate_word_cloud(
    State(state): State<Arc<UiState>>,
    Json(request): Json<WordCloudRequest>,
) -> Result<Json<Vec<WordCloudEntry>>, (StatusCode, Json<ErrorResponse>)> {
    let query = request.query.trim().to_string();
    if query.is_empty() {
        return Ok(Json(Vec::new()));
    }
    if let Some(hit) = state.cache.get(&query).await {
        return Ok(Json(hit.as_ref().clone()));
    }
    match run_query(&state, query.clone()).await {
        Ok(entries) => {
            state
                .cache
                .insert(query, Arc::new(entries.clone()))
                .await;
            Ok(Json(entries))
        }
        Err(e) => {
            error!("query failed: {:#}", e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            ))
        }
    }
}

async fn run_query(state: &Arc<UiState>, query: String) -> Result<Vec<WordCloudEntry>> {
    let index_db = state.index_db.clone();
    let searcher = Arc::clone(&state.searcher);
    tokio::task::spawn_blocking(move || -> Result<Vec<WordCloudEntry>> {
        let con = storage::open(&index_db)?;
        let results = searcher.top_results(&con, &query)?;
        Ok(results
            .into_iter()
            .map(|r| WordCloudEntry {
                text: r.title.clone().unwrap_or_else(|| r.url.clone()),
                value: r.score,
                url: r.url,
            })
            .collect())
    })
    .await?
}
