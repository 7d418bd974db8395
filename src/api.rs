//! HTTP API.
//!
//! * `GET /images` lists the registry record.
//! * `PUT /images?name=<json string or array>` submits one add job per name.
//! * `DELETE /images?name=<json string>&delete_from_local_repo=<bool>`
//!   submits a delete job for a registered image.
//! * `GET /jobs`, `GET /jobs/:id` expose job records.
//! * `GET <prefix>/<repo>/<tag>/<cli>/xmlspec|spec` serve published CLI specs.
//!
//! Job outcomes never show up as HTTP errors; a 200 only means the job was
//! accepted.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use log::{debug, info};
use serde::Deserialize;
use serde_json::json;

use crate::config::Config;
use crate::discovery::Discovery;
use crate::error::{ApiError, RegistryError, WaitError};
use crate::jobs::JobOrchestrator;
use crate::puller::ImagePuller;
use crate::registry::Registry;
use crate::routes::RouteKind;
use crate::runtime::ImageRuntime;
use crate::types::{ImageRef, Operation};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: JobOrchestrator,
    /// Bounded wait for metadata-only deletes.
    pub job_timeout: Duration,
}

impl AppState {
    /// Wire the puller, discovery engine, registry and orchestrator over `runtime`.
    pub fn new(config: &Config, runtime: Arc<dyn ImageRuntime>) -> Self {
        let puller = ImagePuller::new(runtime.clone(), config.pull_retries, config.pull_backoff());
        let discovery = Discovery::new(runtime, config.run_timeout(), &config.route_prefix);
        let orchestrator = JobOrchestrator::new(
            puller,
            discovery,
            Arc::new(Registry::new()),
            config.job_history,
        );
        Self {
            orchestrator,
            job_timeout: config.job_timeout(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::InvalidName(_)
            | ApiError::Reference(_)
            | ApiError::NotRegistered(_)
            | ApiError::UnknownRoute(_) => StatusCode::BAD_REQUEST,
            ApiError::JobNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Wait(WaitError::TimedOut(..)) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Wait(WaitError::Dropped(_))
            | ApiError::Registry(RegistryError::StoreConflict(_))
            | ApiError::Registry(RegistryError::Poisoned) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "message": self.to_string() }))).into_response()
    }
}

pub fn build_router(state: AppState, route_prefix: &str) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/images",
            get(list_images).put(add_images).delete(delete_image),
        )
        .route("/jobs", get(list_jobs))
        .route("/jobs/:id", get(get_job))
        .route(
            &format!("{}/*path", route_prefix.trim_end_matches('/')),
            get(cli_route),
        )
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// `name` is JSON: one reference or an array of them.
#[derive(Deserialize)]
#[serde(untagged)]
enum Names {
    One(String),
    Many(Vec<String>),
}

fn parse_names(raw: &str) -> Result<Vec<ImageRef>, ApiError> {
    let names = match serde_json::from_str::<Names>(raw) {
        Ok(Names::One(name)) => vec![name],
        Ok(Names::Many(names)) => names,
        Err(e) => return Err(ApiError::InvalidName(e.to_string())),
    };
    if names.is_empty() {
        return Err(ApiError::InvalidName("no image given".to_string()));
    }
    names
        .iter()
        .map(|n| n.parse().map_err(ApiError::from))
        .collect()
}

#[derive(Deserialize)]
struct AddQuery {
    name: String,
}

#[derive(Deserialize)]
struct DeleteQuery {
    name: String,
    #[serde(default)]
    delete_from_local_repo: bool,
}

async fn list_images(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.orchestrator.registry().list()?))
}

async fn add_images(
    State(state): State<AppState>,
    Query(q): Query<AddQuery>,
) -> Result<impl IntoResponse, ApiError> {
    // Validate every name before submitting anything.
    let images = parse_names(&q.name)?;
    let ids: Vec<u64> = images
        .into_iter()
        .map(|image| state.orchestrator.submit(Operation::Add, image).id())
        .collect();
    info!("Accepted add job(s) {:?}", ids);
    Ok(Json(json!({ "jobs": ids })))
}

async fn delete_image(
    State(state): State<AppState>,
    Query(q): Query<DeleteQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let image: ImageRef = match serde_json::from_str::<String>(&q.name) {
        Ok(name) => name.parse()?,
        Err(e) => return Err(ApiError::InvalidName(e.to_string())),
    };
    let Some(mut handle) = state
        .orchestrator
        .submit_delete(image.clone(), q.delete_from_local_repo)?
    else {
        return Err(ApiError::NotRegistered(image.to_string()));
    };

    // A metadata-only delete is quick; answer once it has landed so the
    // next listing no longer shows the image.
    if !q.delete_from_local_repo {
        handle.wait_timeout(state.job_timeout).await?;
    }
    info!("Accepted delete job {} for {}", handle.id(), image);
    Ok(Json(json!({ "job": handle.id() })))
}

async fn list_jobs(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.orchestrator.jobs())
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .orchestrator
        .job(id)
        .map(Json)
        .ok_or(ApiError::JobNotFound(id))
}

async fn cli_route(State(state): State<AppState>, uri: Uri) -> Result<Response, ApiError> {
    let path = uri.path();
    debug!("GET {}", path);
    let Some((descriptor, entry)) = state.orchestrator.registry().route(path)? else {
        return Err(ApiError::UnknownRoute(path.to_string()));
    };
    let response = match descriptor.kind {
        RouteKind::XmlSpec => (
            [
                (header::CONTENT_TYPE, "application/xml".to_string()),
                (header::ETAG, format!("\"{}\"", entry.digest)),
            ],
            entry.xml,
        )
            .into_response(),
        RouteKind::Spec => Json(entry.spec).into_response(),
    };
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_accept_string_or_array() {
        let one = parse_names(r#""org/a:1""#).unwrap();
        assert_eq!(one, vec![ImageRef::tagged("org/a", "1")]);

        let many = parse_names(r#"["org/a:1", "org/b@sha256:ff"]"#).unwrap();
        assert_eq!(many.len(), 2);
        assert_eq!(many[1].to_string(), "org/b@sha256:ff");
    }

    #[test]
    fn names_reject_bad_input() {
        assert!(matches!(
            parse_names("org/a:1"),
            Err(ApiError::InvalidName(_))
        ));
        assert!(matches!(parse_names("[]"), Err(ApiError::InvalidName(_))));
        assert!(matches!(
            parse_names(r#"["org/a:1", "nope"]"#),
            Err(ApiError::Reference(_))
        ));
    }
}
