use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tracing::info;

use crate::command::Command;
use crate::error::DomainError;
use crate::plant::PlantSummary;
use crate::service::{self, HubContext};

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(ctx: HubContext) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/plants", get(list_plants))
        .route("/api/plants/{id}", get(get_plant))
        .route("/api/cycles", get(list_cycles))
        .route("/api/cycles/{id}", get(get_cycle))
        .route("/api/commands", post(post_command))
        .with_state(ctx)
}

async fn api_status(State(ctx): State<HubContext>) -> impl IntoResponse {
    let st = ctx.shared.read().await;
    Json(st.to_status())
}

async fn list_plants(State(ctx): State<HubContext>) -> impl IntoResponse {
    let now = OffsetDateTime::now_utc();
    let st = ctx.shared.read().await;
    let plants: Vec<PlantSummary> = st.garden.plants().map(|p| p.summary(now)).collect();
    Json(plants)
}

async fn get_plant(State(ctx): State<HubContext>, Path(id): Path<String>) -> Response {
    let now = OffsetDateTime::now_utc();
    let st = ctx.shared.read().await;
    match st.garden.plant(&id) {
        Some(plant) => Json(plant.summary(now)).into_response(),
        None => error_response(&DomainError::UnknownPlant(id)),
    }
}

async fn list_cycles(State(ctx): State<HubContext>) -> impl IntoResponse {
    let st = ctx.shared.read().await;
    let cycles: Vec<_> = st.garden.cycles().map(|c| c.summary()).collect();
    Json(cycles)
}

async fn get_cycle(State(ctx): State<HubContext>, Path(id): Path<String>) -> Response {
    let st = ctx.shared.read().await;
    match st.garden.cycle(&id) {
        Some(cycle) => Json(cycle.summary()).into_response(),
        None => error_response(&DomainError::UnknownCycle(id)),
    }
}

async fn post_command(State(ctx): State<HubContext>, Json(cmd): Json<Command>) -> Response {
    match service::execute(&ctx, cmd).await {
        Ok(reply) => Json(reply).into_response(),
        Err(e) => error_response(&e),
    }
}

fn error_response(e: &DomainError) -> Response {
    let status = match e {
        DomainError::UnknownPlant(_) | DomainError::UnknownCycle(_) => StatusCode::NOT_FOUND,
        DomainError::DuplicateId(_) | DomainError::AmbiguousCycleMembership { .. } => {
            StatusCode::CONFLICT
        }
        _ => StatusCode::BAD_REQUEST,
    };
    (status, Json(serde_json::json!({ "error": e.to_string() }))).into_response()
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(ctx: HubContext, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!(%addr, "web api listening");

    axum::serve(listener, router(ctx))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
