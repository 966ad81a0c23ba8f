use crate::api::api_error::APIError;
use crate::api::model::{
    RegisterRequest, RegisterResponse, UpdateRecordRequest, UpdateRecordResult,
};
use crate::api::server::AppState;
use crate::config::Config;
use crate::error::Error;
use crate::store::SubdomainRecord;
use axum::body::Bytes;
use axum::extract::{ConnectInfo, FromRequestParts, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_extra::extract::WithRejection;
use serde_json::json;
use std::net::{IpAddr, SocketAddr};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

const API_USER_HEADER: &str = "X-Api-User";
const API_KEY_HEADER: &str = "X-Api-Key";

pub(super) fn new(state: AppState) -> Router {
    Router::new()
        .route("/healthcheck", get(health_check))
        .route("/register", post(register))
        .route("/update", post(update))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(state.config.api_timeout))
        .with_state(state)
}

/// The registration matching the request's `X-Api-User`/`X-Api-Key` headers.
struct Authenticated(SubdomainRecord);

#[async_trait::async_trait]
impl FromRequestParts<AppState> for Authenticated {
    type Rejection = APIError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, APIError> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
        };
        let username = header(API_USER_HEADER);
        match state.store.authenticate(username, header(API_KEY_HEADER)).await {
            Ok(record) => Ok(Authenticated(record)),
            Err(err) => {
                tracing::debug!("rejected credentials for user \"{username}\"");
                Err(err.into())
            }
        }
    }
}

/// The address an update is attributed to: the TCP peer, or the first address of the
/// configured forwarding header.
fn client_ip(config: &Config, headers: &HeaderMap, peer: SocketAddr) -> IpAddr {
    let Some(name) = &config.use_header else {
        return peer.ip();
    };
    let forwarded = headers
        .get(name.as_str())
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse::<IpAddr>().ok());
    match forwarded {
        Some(ip) => ip,
        None => {
            tracing::debug!("no usable {name} header from {peer}, using peer address");
            peer.ip()
        }
    }
}

#[allow(clippy::unused_async)]
async fn health_check() -> impl IntoResponse {
    Json(json!({"ok":"healthy"}))
}

async fn register(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<RegisterResponse>), APIError> {
    if state.config.disable_registration {
        return Err(Error::NotImplemented.into());
    }

    let request: RegisterRequest = if body.iter().all(u8::is_ascii_whitespace) {
        RegisterRequest::default()
    } else {
        serde_json::from_slice(&body)?
    };
    let allow_from = request.allow_from().map_err(Error::InvalidAllowFrom)?;

    let (record, password) = state.store.register(allow_from).await?;
    let fulldomain = state.zone.fulldomain(&record.subdomain);
    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse::new(record, password, fulldomain)),
    ))
}

async fn update(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Authenticated(record): Authenticated,
    WithRejection(Json(payload), _): WithRejection<Json<UpdateRecordRequest>, APIError>,
) -> Result<Json<UpdateRecordResult>, APIError> {
    let client_addr = client_ip(&state.config, &headers, peer);
    let subdomain = payload.subdomain.trim_end_matches('.');

    if !record.subdomain.eq_ignore_ascii_case(subdomain) || !record.allows(client_addr) {
        tracing::debug!("rejected update from {client_addr} for \"{subdomain}\"");
        return Err(Error::AuthForbidden(client_addr, subdomain.to_string()).into());
    }

    match &payload.valid_dns01() {
        Err(err) => {
            tracing::debug!("rejected update from {client_addr} for \"{subdomain}\": {err}");
            Err(Error::InvalidDNS01.into())
        }
        Ok(_) => {
            state
                .store
                .push_challenge_value(&record.subdomain, payload.txt.clone())
                .await?;
            tracing::info!(
                "accepted update from {client_addr} for \"{}\"",
                state.zone.fulldomain(&record.subdomain)
            );
            Ok(Json(UpdateRecordResult { txt: payload.txt }))
        }
    }
}
