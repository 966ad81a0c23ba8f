use crate::api::routes;
use crate::api::tls::{self, SharedTlsConfig};
use crate::config::SharedConfig;
use crate::store::SharedStore;
use crate::zone::SharedZone;
use axum::Router;
use std::net::SocketAddr;

#[derive(Clone)]
pub(super) struct AppState {
    pub config: SharedConfig,
    pub zone: SharedZone,
    pub store: SharedStore,
}

/// The API routes, ready to be served.
pub fn router(config: SharedConfig, zone: SharedZone, store: SharedStore) -> Router {
    routes::new(AppState {
        config,
        zone,
        store,
    })
}

/// Serve the API on [`Config::api_bind_addr`][crate::Config], over TLS when `tls` is given.
pub async fn new(
    config: SharedConfig,
    zone: SharedZone,
    store: SharedStore,
    tls: Option<SharedTlsConfig>,
) -> anyhow::Result<()> {
    let addr = config.api_bind_addr;
    let app = router(config, zone, store);
    match tls {
        None => {
            tracing::info!("API listening on http://{addr}");
            axum::Server::bind(&addr)
                .serve(app.into_make_service_with_connect_info::<SocketAddr>())
                .await?;
        }
        Some(tls_config) => {
            tracing::info!("API listening on https://{addr}");
            tls::serve(addr, app, tls_config).await?;
        }
    }
    Ok(())
}
