use super::admission::AdmissionRequest;
use super::session::StreamHub;
use crate::error::{CapacityScope, WardenError};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

pub const TOKEN_COOKIE: &str = "sse_token";

/// Failure surfaced to an HTTP caller before any stream opens
#[derive(Debug)]
pub enum HttpError {
    BadRequest(String),
    Warden(WardenError),
}

impl From<WardenError> for HttpError {
    fn from(err: WardenError) -> Self {
        HttpError::Warden(err)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    status: u16,
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            HttpError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            HttpError::Warden(err) => {
                let status =
                    StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                let message = match err {
                    WardenError::CapacityExceeded(CapacityScope::Subject) => {
                        "Too many connections for subject".to_string()
                    }
                    WardenError::CapacityExceeded(_) => "SSE capacity reached".to_string(),
                    other => other.to_string(),
                };
                (status, message)
            }
        };

        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), "{}", message);
        } else {
            tracing::debug!(status = status.as_u16(), "stream request rejected: {}", message);
        }

        let body = ErrorBody {
            error: message,
            status: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct StreamParams {
    pub process: Option<String>,
    pub token: Option<String>,
}

/// Routes for token issuance and both stream variants
pub fn router(hub: Arc<StreamHub>) -> Router {
    Router::new()
        .route("/api/automation/token", post(issue_token))
        .route("/api/automation/stream", get(process_stream))
        .route("/api/automation/processes-stream", get(processes_stream))
        .with_state(hub)
}

/// Bind and serve until `shutdown` resolves
pub async fn serve<F>(hub: Arc<StreamHub>, addr: SocketAddr, shutdown: F) -> crate::error::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "stream server listening");
    axum::serve(listener, router(hub))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// First valid address from `x-real-ip`, `x-forwarded-for`, `cf-connecting-ip`
pub fn client_ip(headers: &HeaderMap) -> String {
    let candidates = [
        header_str(headers, "x-real-ip"),
        header_str(headers, "x-forwarded-for").and_then(|v| v.split(',').next()),
        header_str(headers, "cf-connecting-ip"),
    ];

    candidates
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|ip| ip.parse::<IpAddr>().is_ok())
        .map(str::to_string)
        .unwrap_or_else(|| "unknown".to_string())
}

fn cookie<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}

fn admission<'a>(headers: &'a HeaderMap, params: &'a StreamParams, ip: &'a str) -> AdmissionRequest<'a> {
    AdmissionRequest {
        origin: header_str(headers, "origin"),
        referer: header_str(headers, "referer"),
        token: params
            .token
            .as_deref()
            .filter(|t| !t.is_empty())
            .or_else(|| cookie(headers, TOKEN_COOKIE)),
        ip,
    }
}

async fn issue_token(State(hub): State<Arc<StreamHub>>, headers: HeaderMap) -> Result<Response, HttpError> {
    let ip = client_ip(&headers);
    let request = AdmissionRequest {
        origin: header_str(&headers, "origin"),
        referer: header_str(&headers, "referer"),
        token: None,
        ip: &ip,
    };
    let issued = hub
        .gate()
        .issue_token(&request, header_str(&headers, "x-user-id"))?;

    let config = hub.gate().config();
    let mut cookie = format!(
        "{}={}; Path=/; Max-Age={}; HttpOnly; SameSite=Strict",
        TOKEN_COOKIE,
        issued.token,
        config.token_ttl.as_secs()
    );
    if config.environment.is_production() {
        cookie.push_str("; Secure");
    }
    let cookie = HeaderValue::from_str(&cookie)
        .map_err(|e| HttpError::Warden(WardenError::Internal(e.to_string())))?;

    tracing::info!(subject = %issued.subject, %ip, "stream token issued");
    let mut response = Json(issued).into_response();
    response.headers_mut().insert(header::SET_COOKIE, cookie);
    Ok(response)
}

async fn process_stream(
    State(hub): State<Arc<StreamHub>>,
    headers: HeaderMap,
    Query(params): Query<StreamParams>,
) -> Result<Response, HttpError> {
    let process = params
        .process
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| HttpError::BadRequest("process name is required".to_string()))?;

    let ip = client_ip(&headers);
    let request = admission(&headers, &params, &ip);
    let stream = hub.open_process_stream(&request, process)?;
    Ok(stream.into_response())
}

async fn processes_stream(
    State(hub): State<Arc<StreamHub>>,
    headers: HeaderMap,
    Query(params): Query<StreamParams>,
) -> Result<Response, HttpError> {
    let ip = client_ip(&headers);
    let request = admission(&headers, &params, &ip);
    let stream = hub.open_all_stream(&request).await?;
    Ok(stream.into_response())
}
