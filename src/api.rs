// HTTP surface: read projections for the dashboard, system status, private
// fetch/import triggers and the static frontend.

use std::path::Path;
use std::sync::{Arc, Mutex};

use actix_cors::Cors;
use actix_files::{Files, NamedFile};
use actix_web::dev::{ServiceRequest, ServiceResponse, fn_service};
use actix_web::{App, HttpRequest, HttpResponse, HttpServer, middleware, web};
use serde::Deserialize;
use serde_json::json;

use crate::config::Config;
use crate::error::Result;
use crate::fetcher;
use crate::importer;
use crate::rate_limiter::RateLimiter;
use crate::scheduler;
use crate::snapshot::SnapshotStore;
use crate::store::PgStore;

const MAX_INPUT_LENGTH: usize = 500;
const DEFAULT_DATE_CUTOFF_DAYS: i32 = 30;
const PRIVATE_API_KEY_HEADER: &str = "X-Private-Api-Key";

#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    limiter: Arc<RateLimiter>,
    snapshots: SnapshotStore,
    db: Arc<Mutex<Option<PgStore>>>,
}

impl AppState {
    pub fn new(config: Arc<Config>, limiter: Arc<RateLimiter>) -> Self {
        let snapshots = SnapshotStore::new(&config.snapshot_dir);
        AppState {
            config,
            limiter,
            snapshots,
            db: Arc::new(Mutex::new(None)),
        }
    }
}

#[derive(Debug, Deserialize)]
struct StationQuery {
    #[serde(rename = "trainStation")]
    train_station: Option<String>,
    #[serde(rename = "trainName")]
    train_name: Option<String>,
    #[serde(rename = "dateCutoff")]
    date_cutoff: Option<String>,
}

// ============================================================================
// Input Validation
// ============================================================================

/// Drops non-printable characters and truncates; empty input counts as missing.
fn sanitize_input(value: Option<&str>) -> Option<String> {
    let cleaned: String = value?
        .chars()
        .filter(|c| *c == ' ' || !(c.is_control() || c.is_whitespace()))
        .take(MAX_INPUT_LENGTH)
        .collect();
    (!cleaned.is_empty()).then_some(cleaned)
}

fn parse_date_cutoff(value: Option<&str>) -> std::result::Result<i32, &'static str> {
    let Some(value) = value else {
        return Ok(DEFAULT_DATE_CUTOFF_DAYS);
    };
    let days: i32 = value
        .trim()
        .parse()
        .map_err(|_| "dateCutoff must be a valid integer")?;
    if days < 1 {
        return Err("dateCutoff must be a positive integer");
    }
    Ok(days)
}

fn bad_request(message: &str) -> HttpResponse {
    HttpResponse::BadRequest().json(json!({ "error": message }))
}

fn internal_error(context: &str, message: String) -> HttpResponse {
    tracing::error!("Error in {}: {}", context, message);
    HttpResponse::InternalServerError().json(json!({ "error": "Internal server error" }))
}

// ============================================================================
// Database Access
// ============================================================================

/// Runs `query` on a blocking thread against the shared connection. The
/// connection is taken out of the slot for the duration of the query, so a slow
/// connect or query never blocks other requests on the mutex. A missing
/// connection is opened with a single attempt; it goes back into the slot only
/// after a successful query.
async fn with_store<T, F>(state: &AppState, query: F) -> std::result::Result<T, String>
where
    T: Send + 'static,
    F: FnOnce(&mut PgStore) -> Result<T> + Send + 'static,
{
    let db = state.db.clone();
    let config = state.config.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        let cached = db.lock().unwrap_or_else(|e| e.into_inner()).take();
        let mut store = match cached {
            Some(store) => store,
            None => PgStore::connect_with_attempts(&config.database, 1)?,
        };
        let result = query(&mut store);
        if result.is_ok() {
            *db.lock().unwrap_or_else(|e| e.into_inner()) = Some(store);
        }
        result
    })
    .await;

    match outcome {
        Ok(result) => result.map_err(|e| e.to_string()),
        Err(e) => Err(format!("database task panicked: {}", e)),
    }
}

// ============================================================================
// Read API
// ============================================================================

async fn train_stations(state: web::Data<AppState>) -> HttpResponse {
    match with_store(&state, |store| store.stations()).await {
        Ok(stations) => HttpResponse::Ok().json(stations),
        Err(e) => internal_error("train_stations", e),
    }
}

async fn trains(state: web::Data<AppState>, query: web::Query<StationQuery>) -> HttpResponse {
    let Some(station) = sanitize_input(query.train_station.as_deref()) else {
        return bad_request("trainStation parameter is required");
    };
    let days_cutoff = match parse_date_cutoff(query.date_cutoff.as_deref()) {
        Ok(days) => days,
        Err(message) => return bad_request(message),
    };

    let result = with_store(&state, move |store| {
        if !store.station_exists(&station)? {
            return Ok(Err("Invalid station name"));
        }
        store.trains_for_station(&station, days_cutoff).map(Ok)
    })
    .await;

    match result {
        Ok(Ok(trains)) => HttpResponse::Ok().json(trains),
        Ok(Err(message)) => bad_request(message),
        Err(e) => internal_error("trains", e),
    }
}

async fn train_arrivals(state: web::Data<AppState>, query: web::Query<StationQuery>) -> HttpResponse {
    let station = sanitize_input(query.train_station.as_deref());
    let train_name = sanitize_input(query.train_name.as_deref());
    let (Some(station), Some(train_name)) = (station, train_name) else {
        return bad_request("Both trainStation and trainName parameters are required");
    };
    let days_cutoff = match parse_date_cutoff(query.date_cutoff.as_deref()) {
        Ok(days) => days,
        Err(message) => return bad_request(message),
    };

    let result = with_store(&state, move |store| {
        if !store.station_exists(&station)? {
            return Ok(Err("Invalid station name"));
        }
        if !store.train_exists(&station, &train_name)? {
            return Ok(Err("Invalid train name for this station"));
        }
        store.train_arrivals(&station, &train_name, days_cutoff).map(Ok)
    })
    .await;

    match result {
        Ok(Ok(arrivals)) => HttpResponse::Ok().json(arrivals),
        Ok(Err(message)) => bad_request(message),
        Err(e) => internal_error("train_arrivals", e),
    }
}

async fn system_status(state: web::Data<AppState>) -> HttpResponse {
    let snapshots = state.snapshots.clone();
    let result = with_store(&state, move |store| {
        let dates = store.processed_dates()?;
        Ok((snapshots.count_date_folders(), dates))
    })
    .await;

    match result {
        Ok((num_date_folders, dates)) => {
            let processed_dates: Vec<String> = dates.iter().map(|d| d.format("%Y-%m-%d").to_string()).collect();
            HttpResponse::Ok().json(json!({
                "status": "ok",
                "data_directory": { "num_date_folders": num_date_folders },
                "database": { "processed_dates": processed_dates },
            }))
        }
        Err(e) => {
            tracing::error!("Error in status endpoint: {}", e);
            HttpResponse::InternalServerError().json(json!({ "status": "error", "error": e }))
        }
    }
}

async fn last_import(state: web::Data<AppState>) -> HttpResponse {
    match with_store(&state, |store| store.last_import()).await {
        Ok(info) => HttpResponse::Ok().json(info),
        Err(e) => internal_error("last_import", e),
    }
}

// ============================================================================
// Private Triggers
// ============================================================================

fn authorized(req: &HttpRequest, config: &Config) -> bool {
    let provided = req
        .headers()
        .get(PRIVATE_API_KEY_HEADER)
        .and_then(|value| value.to_str().ok());
    matches!((provided, config.private_api_key.as_deref()), (Some(given), Some(expected)) if given == expected)
}

fn unauthorized() -> HttpResponse {
    HttpResponse::Unauthorized().json(json!({ "error": "Unauthorized" }))
}

fn trigger_failed(context: &str, message: String) -> HttpResponse {
    tracing::error!("Error in manual data {}: {}", context, message);
    HttpResponse::InternalServerError().json(json!({ "status": "error", "error": message }))
}

async fn trigger_fetch(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    if !authorized(&req, &state.config) {
        return unauthorized();
    }
    tracing::info!("Manual data fetch requested");

    let config = state.config.clone();
    let limiter = state.limiter.clone();
    match tokio::task::spawn_blocking(move || fetcher::run_fetch_cycle(&config, limiter)).await {
        Ok(Ok(folder)) => HttpResponse::Ok().json(json!({
            "status": "success",
            "message": format!("Data fetch completed successfully. Data saved to {}", folder.display()),
        })),
        Ok(Err(e)) => trigger_failed("fetch", e.to_string()),
        Err(e) => trigger_failed("fetch", format!("fetch task panicked: {}", e)),
    }
}

async fn trigger_import(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    if !authorized(&req, &state.config) {
        return unauthorized();
    }
    tracing::info!("Manual data import requested");

    let config = state.config.clone();
    match tokio::task::spawn_blocking(move || importer::run_import_cycle(&config)).await {
        Ok(Ok(dates)) => {
            let processed_dates: Vec<String> = dates.iter().map(|d| d.format("%Y-%m-%d").to_string()).collect();
            HttpResponse::Ok().json(json!({ "status": "success", "processed_dates": processed_dates }))
        }
        Ok(Err(e)) => trigger_failed("import", e.to_string()),
        Err(e) => trigger_failed("import", format!("import task panicked: {}", e)),
    }
}

// ============================================================================
// Server Setup
// ============================================================================

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api")
            .route("/trainStations", web::get().to(train_stations))
            .route("/trains", web::get().to(trains))
            .route("/trainArrivals", web::get().to(train_arrivals))
            .route("/status", web::get().to(system_status))
            .route("/lastImport", web::get().to(last_import)),
    )
    .service(
        web::scope("/private/api")
            .route("/fetch", web::post().to(trigger_fetch))
            .route("/import", web::post().to(trigger_import)),
    );
}

/// Static files with an `index.html` fallback for client-side routes.
fn frontend(static_dir: &Path) -> Files {
    let index = static_dir.join("index.html");
    Files::new("/", static_dir)
        .index_file("index.html")
        .default_handler(fn_service(move |req: ServiceRequest| {
            let index = index.clone();
            async move {
                let (req, _) = req.into_parts();
                let file = NamedFile::open_async(index).await?;
                let res = file.into_response(&req);
                Ok::<_, actix_web::Error>(ServiceResponse::new(req, res))
            }
        }))
}

pub async fn run_server(config: Arc<Config>, limiter: Arc<RateLimiter>) -> std::io::Result<()> {
    if !config.static_dir.is_dir() {
        tracing::warn!("Static folder {:?} does not exist, creating it", config.static_dir);
        std::fs::create_dir_all(&config.static_dir)?;
    }

    scheduler::spawn_jobs(config.clone(), limiter.clone());

    let state = AppState::new(config.clone(), limiter);
    let bind_addr = config.bind_addr.clone();
    tracing::info!("Server running on http://{}", bind_addr);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allowed_origin(&state.config.base_url)
            .allowed_methods(vec!["GET", "POST"])
            .allow_any_header();

        App::new()
            .app_data(web::Data::new(state.clone()))
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .wrap(middleware::Compress::default())
            .configure(routes)
            .service(frontend(&state.config.static_dir))
    })
    .bind(bind_addr.as_str())?
    .run()
    .await
}
