// HTTP control surface: the /tc/api/v1 routes and the reverse-proxy fallback

use crate::capture::{self, ScanRequest};
use crate::config::{Capability, Config, ProxyMount};
use crate::ifaces::{self, NetworkInterface};
use crate::shaping::{QueryResult, SetupParams, ShapingRequest, TcRunner};
use anyhow::{Context, Result};
use axum::Router;
use axum::body::Body;
use axum::extract::{Query, Request, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub runner: Arc<TcRunner>,
    pub capability: Capability,
    pub client: reqwest::Client,
}

/// Response envelope: `{"code":0,"data":...}` on success, data omitted when
/// there is nothing to return.
#[derive(Debug, Serialize)]
struct Envelope<T> {
    code: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
}

fn ok<T: Serialize>(data: T) -> Json<Envelope<T>> {
    Json(Envelope {
        code: 0,
        data: Some(data),
    })
}

fn ok_empty() -> Json<Envelope<()>> {
    Json(Envelope {
        code: 0,
        data: None,
    })
}

/// Adapter so handlers can use `?` with anyhow errors.
pub struct ApiError(anyhow::Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        log::error!("request failed: {:#}", self.0);
        (StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", self.0)).into_response()
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/tc/api/v1/versions", get(versions))
        .route("/tc/api/v1/scan", get(scan))
        .route("/tc/api/v1/init", get(init))
        .route("/tc/api/v1/config/query", get(config_query))
        .route("/tc/api/v1/config/reset", get(config_reset))
        .route("/tc/api/v1/config/setup", get(config_setup))
        .route("/tc/api/v1/raw", axum::routing::any(raw))
        .fallback(proxy_fallback)
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct VersionData {
    version: &'static str,
}

async fn versions() -> Json<Envelope<VersionData>> {
    ok(VersionData {
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Debug, Deserialize)]
struct ScanParams {
    ifaces: Option<String>,
    timeout: Option<String>,
    exp: Option<String>,
}

async fn scan(
    State(state): State<AppState>,
    Query(params): Query<ScanParams>,
) -> Result<impl IntoResponse, ApiError> {
    if !state.capability.capture {
        return Err(anyhow::anyhow!("capture is not supported on this host").into());
    }
    let request = ScanRequest::new(
        params.ifaces.as_deref(),
        params.timeout.as_deref(),
        params.exp.as_deref(),
    )?;
    log::info!(
        "scan start, iface={}, timeout={:?}, exp={}",
        request.iface,
        request.timeout,
        request.expression
    );

    let directory = ifaces::list_interfaces(&state.config.address_filter());
    let summary = capture::scan(&request, directory).await?;
    Ok(ok(summary))
}

#[derive(Debug, Serialize)]
struct InitData {
    ifaces: Vec<NetworkInterface>,
}

async fn init(State(state): State<AppState>) -> Json<Envelope<InitData>> {
    ok(InitData {
        ifaces: ifaces::list_interfaces(&state.config.address_filter()),
    })
}

#[derive(Debug, Deserialize)]
struct IfaceParams {
    iface: Option<String>,
}

async fn config_query(
    State(state): State<AppState>,
    Query(params): Query<IfaceParams>,
) -> Result<Json<Envelope<QueryResult>>, ApiError> {
    let iface = params.iface.unwrap_or_default();
    log::info!("start query for iface={iface}");
    let result = state.runner.query(&iface).await?;
    Ok(ok(result))
}

async fn config_reset(
    State(state): State<AppState>,
    Query(params): Query<IfaceParams>,
) -> Result<Json<Envelope<()>>, ApiError> {
    let iface = params.iface.unwrap_or_default();
    log::info!("start reset for iface={iface}");
    state.runner.reset(&iface).await?;
    Ok(ok_empty())
}

async fn config_setup(
    State(state): State<AppState>,
    Query(params): Query<SetupParams>,
) -> Result<Json<Envelope<()>>, ApiError> {
    let request = ShapingRequest::from_params(&params, &state.config.api_port)?;
    log::info!(
        "setup tc for iface={}, direction={:?}, identify={:?}, strategies={:?}",
        request.iface,
        request.direction,
        request.identify,
        request.strategies
    );
    state.runner.setup(&request).await?;
    Ok(ok_empty())
}

#[derive(Debug, Deserialize)]
struct RawParams {
    cmd: Option<String>,
}

/// Whitelisted raw command endpoint. The command comes from the `cmd` query
/// parameter, overridden by a non-empty request body.
async fn raw(
    State(state): State<AppState>,
    Query(params): Query<RawParams>,
    body: String,
) -> Result<Json<Envelope<serde_json::Value>>, ApiError> {
    let cmd = if body.is_empty() {
        params.cmd.unwrap_or_default()
    } else {
        body
    };
    log::info!("start raw cmd={cmd}");

    match state.runner.raw(&cmd).await? {
        Some(value) => Ok(ok(value)),
        None => Ok(Json(Envelope {
            code: 0,
            data: None,
        })),
    }
}

/// Unmatched paths: longest-prefix proxy mount first, then the UI dev server
/// when NODE_ENV=development.
async fn proxy_fallback(
    State(state): State<AppState>,
    request: Request,
) -> Result<Response, ApiError> {
    let path = request.uri().path().to_string();

    if let Some(mount) = select_mount(&state.config.proxies, &path) {
        let backend = mount.backend.clone();
        return Ok(forward(&state.client, &backend, request).await?);
    }

    if state.config.node_env == "development" {
        let backend = format!("http://{}", state.config.ui_endpoint);
        return Ok(forward(&state.client, &backend, request).await?);
    }

    Ok(StatusCode::NOT_FOUND.into_response())
}

fn select_mount<'a>(proxies: &'a [ProxyMount], path: &str) -> Option<&'a ProxyMount> {
    proxies
        .iter()
        .filter(|p| path.starts_with(&p.mount))
        .max_by_key(|p| p.mount.len())
}

/// Forward one request to a backend, preserving method, path, query, headers
/// and body.
async fn forward(client: &reqwest::Client, backend: &str, request: Request) -> Result<Response> {
    let (parts, body) = request.into_parts();

    let mut url =
        reqwest::Url::parse(backend).with_context(|| format!("parse backend {backend}"))?;
    url.set_path(parts.uri.path());
    url.set_query(parts.uri.query());

    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .context("read request body")?;

    let mut upstream = client.request(parts.method.clone(), url.clone());
    for (name, value) in &parts.headers {
        if name == header::HOST {
            continue;
        }
        upstream = upstream.header(name, value);
    }
    let response = upstream
        .body(bytes.to_vec())
        .send()
        .await
        .with_context(|| format!("proxy {} {url}", parts.method))?;

    let mut builder = Response::builder().status(response.status());
    for (name, value) in response.headers() {
        if name == header::TRANSFER_ENCODING || name == header::CONNECTION {
            continue;
        }
        builder = builder.header(name, value);
    }
    let payload = response.bytes().await.context("read backend response")?;
    Ok(builder
        .body(Body::from(payload))
        .context("build proxy response")?)
}
