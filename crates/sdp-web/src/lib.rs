//! Axum + Askama status page and JSON API over the survey snapshot.

use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use sdp_core::{PipelineError, SnapshotSummary, SpeciesSummary};
use sdp_sync::{maybe_build_scheduler, AppConfig, DataService};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "sdp-web";

pub struct AppState {
    pub service: Arc<DataService>,
}

impl AppState {
    pub fn new(service: Arc<DataService>) -> Self {
        Self { service }
    }
}

#[derive(Debug, Clone)]
struct Kpi {
    label: &'static str,
    value: String,
}

#[derive(Debug, Clone)]
struct SpeciesRow {
    species: String,
    planted: String,
    survived: String,
    survival_rate: String,
    loss_rate: String,
}

impl From<&SpeciesSummary> for SpeciesRow {
    fn from(s: &SpeciesSummary) -> Self {
        Self {
            species: s.species.clone(),
            planted: format!("{:.0}", s.planted),
            survived: format!("{:.0}", s.survived),
            survival_rate: format!("{:.1}", s.survival_rate),
            loss_rate: format!("{:.1}", s.loss_rate),
        }
    }
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    unavailable_reason: Option<String>,
    kpis: Vec<Kpi>,
    species: Vec<SpeciesRow>,
    run_id: String,
    last_updated: String,
}

impl IndexTemplate {
    fn unavailable(reason: String) -> Self {
        Self {
            unavailable_reason: Some(reason),
            kpis: Vec::new(),
            species: Vec::new(),
            run_id: String::new(),
            last_updated: String::new(),
        }
    }

    fn from_summary(summary: &SnapshotSummary, species: &[SpeciesSummary]) -> Self {
        let optional = |v: Option<f64>, suffix: &str| {
            v.map(|v| format!("{v:.1}{suffix}"))
                .unwrap_or_else(|| "n/a".to_string())
        };
        let date_range = match (summary.date_min, summary.date_max) {
            (Some(min), Some(max)) => format!("{min} to {max}"),
            _ => "n/a".to_string(),
        };
        let kpis = vec![
            Kpi { label: "Submissions", value: summary.processed_rows.to_string() },
            Kpi { label: "Completed (consented)", value: summary.completed_rows.to_string() },
            Kpi { label: "Sites", value: summary.distinct_sites.to_string() },
            Kpi { label: "Enumerators", value: summary.distinct_enumerators.to_string() },
            Kpi {
                label: "Average duration",
                value: optional(summary.avg_duration_minutes, " min"),
            },
            Kpi { label: "Quality rate", value: optional(summary.quality_rate, "%") },
            Kpi { label: "Survey dates", value: date_range },
        ];
        Self {
            unavailable_reason: None,
            kpis,
            species: species.iter().map(SpeciesRow::from).collect(),
            run_id: summary.run_id.to_string(),
            last_updated: summary.last_updated.format("%Y-%m-%d %H:%M UTC").to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct DateRangeQuery {
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api/summary", get(summary_handler))
        .route("/api/processed", get(processed_handler))
        .route("/api/completed", get(completed_handler))
        .route("/api/species", get(species_handler))
        .route("/api/refresh", post(refresh_handler))
        .with_state(Arc::new(state))
}

/// Serve until ctrl-c, running the refresh scheduler when it is enabled.
pub async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let port = config.web_port;
    let service = Arc::new(DataService::new(config)?);

    let scheduler = maybe_build_scheduler(service.clone()).await?;
    if let Some(sched) = &scheduler {
        sched.start().await?;
        info!(cron = %service.config().refresh_cron, "refresh scheduler started");
    }

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving survey dashboard");
    axum::serve(listener, app(AppState::new(service)))
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "ctrl-c handler failed");
            }
        })
        .await?;

    if let Some(mut sched) = scheduler {
        sched.shutdown().await?;
    }
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(AppConfig::from_env()?).await
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    let summary = match state.service.summary().await {
        Ok(summary) => summary,
        Err(PipelineError::NoDataAvailable { reason }) => {
            let mut resp = render_html(IndexTemplate::unavailable(reason));
            *resp.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
            return resp;
        }
        Err(err) => return server_error(err.into()),
    };
    match state.service.species().await {
        Ok(species) => render_html(IndexTemplate::from_summary(&summary, &species)),
        Err(err) => server_error(err.into()),
    }
}

async fn summary_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.service.summary().await {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => api_error(err),
    }
}

async fn processed_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.service.ensure_available(false).await {
        Ok(table) => Json(table.as_ref()).into_response(),
        Err(err) => api_error(err),
    }
}

async fn completed_handler(
    State(state): State<Arc<AppState>>,
    Query(range): Query<DateRangeQuery>,
) -> Response {
    match state.service.completed(range.from, range.to).await {
        Ok(table) => Json(table).into_response(),
        Err(err) => api_error(err),
    }
}

async fn species_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.service.species().await {
        Ok(species) => Json(species).into_response(),
        Err(err) => api_error(err),
    }
}

async fn refresh_handler(State(state): State<Arc<AppState>>) -> Response {
    if let Err(err) = state.service.refresh().await {
        return api_error(err);
    }
    match state.service.store().load_summary().await {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => api_error(err),
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}

fn api_error(err: PipelineError) -> Response {
    let (status, body) = match &err {
        PipelineError::NoDataAvailable { reason } => (
            StatusCode::SERVICE_UNAVAILABLE,
            json!({"status": "data_unavailable", "reason": reason}),
        ),
        PipelineError::Storage(_) => {
            error!(error = %err, "storage failure");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"status": "error", "error": err.to_string()}),
            )
        }
        _ => {
            warn!(error = %err, "refresh from feed failed");
            (
                StatusCode::BAD_GATEWAY,
                json!({"status": "refresh_failed", "error": err.to_string()}),
            )
        }
    };
    (status, Json(body)).into_response()
}
