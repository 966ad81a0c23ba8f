//! HTTPS listener for the API.
//!
//! The rustls [`ServerConfig`] lives behind an [`ArcSwap`], so a renewed certificate takes
//! effect for the next handshake without restarting the listener.

use crate::error::Error;
use arc_swap::ArcSwap;
use axum::extract::ConnectInfo;
use axum::Router;
use hyper::server::conn::Http;
use rustls::ServerConfig;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tower_http::add_extension::AddExtension;

pub type SharedTlsConfig = Arc<ArcSwap<ServerConfig>>;

const ACCEPT_ERROR_DELAY: Duration = Duration::from_secs(1);

/// Build a server config from a PEM certificate chain and a PEM private key.
pub fn server_config(cert_pem: &[u8], key_pem: &[u8]) -> Result<ServerConfig, Error> {
    let certs = rustls_pemfile::certs(&mut &*cert_pem).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(Error::Tls("no certificates in PEM data".to_string()));
    }
    let key = rustls_pemfile::private_key(&mut &*key_pem)?
        .ok_or_else(|| Error::Tls("no private key in PEM data".to_string()))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

/// Read a certificate chain and key from PEM files.
pub async fn load_pem_files(
    cert_path: impl AsRef<Path>,
    key_path: impl AsRef<Path>,
) -> Result<ServerConfig, Error> {
    let cert_pem = tokio::fs::read(cert_path).await?;
    let key_pem = tokio::fs::read(key_path).await?;
    server_config(&cert_pem, &key_pem)
}

pub fn shared(config: ServerConfig) -> SharedTlsConfig {
    Arc::new(ArcSwap::from_pointee(config))
}

pub(super) async fn serve(
    addr: SocketAddr,
    app: Router,
    tls_config: SharedTlsConfig,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    loop {
        let (stream, peer) = accept_next(|| listener.accept()).await;
        let acceptor = TlsAcceptor::from(tls_config.load_full());
        let service = AddExtension::new(app.clone(), ConnectInfo(peer));

        tokio::spawn(async move {
            let stream = match acceptor.accept(stream).await {
                Ok(stream) => stream,
                Err(err) => {
                    tracing::debug!("TLS handshake with {peer} failed: {err}");
                    return;
                }
            };
            if let Err(err) = Http::new().serve_connection(stream, service).await {
                tracing::debug!("error serving API connection from {peer}: {err}");
            }
        });
    }
}

/// Retry `accept` until it yields a connection, pausing after each error so a persistent one
/// (such as running out of file descriptors) doesn't spin.
async fn accept_next<T, F, Fut>(mut accept: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(accepted) => return accepted,
            Err(err) => {
                tracing::warn!("failed to accept API connection: {err}");
                tokio::time::sleep(ACCEPT_ERROR_DELAY).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, KeyPair};

    fn self_signed() -> (String, String) {
        let key = KeyPair::generate().unwrap();
        let cert = CertificateParams::new(vec!["acme.example.com".to_string()])
            .unwrap()
            .self_signed(&key)
            .unwrap();
        (cert.pem(), key.serialize_pem())
    }

    #[test]
    fn builds_config_from_pem() {
        let (cert, key) = self_signed();
        let config = server_config(cert.as_bytes(), key.as_bytes()).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn rejects_missing_parts() {
        let (cert, key) = self_signed();
        assert!(matches!(
            server_config(b"", key.as_bytes()),
            Err(Error::Tls(_))
        ));
        assert!(matches!(
            server_config(cert.as_bytes(), b""),
            Err(Error::Tls(_))
        ));
    }

    #[tokio::test]
    async fn loads_files_and_swaps() {
        let dir = tempfile::TempDir::new().unwrap();
        let (cert, key) = self_signed();
        let (cert_path, key_path) = (dir.path().join("cert.pem"), dir.path().join("key.pem"));
        std::fs::write(&cert_path, cert).unwrap();
        std::fs::write(&key_path, key).unwrap();

        let shared = shared(load_pem_files(&cert_path, &key_path).await.unwrap());
        let before = shared.load_full();
        shared.store(Arc::new(load_pem_files(&cert_path, &key_path).await.unwrap()));
        assert!(!Arc::ptr_eq(&before, &shared.load_full()));

        assert!(matches!(
            load_pem_files(dir.path().join("missing.pem"), &key_path).await,
            Err(Error::IO(_))
        ));
    }

    #[tokio::test]
    async fn accept_errors_back_off() {
        let mut calls = 0;
        let started = std::time::Instant::now();
        let accepted = accept_next(|| {
            calls += 1;
            std::future::ready(if calls == 1 {
                Err(io::Error::new(io::ErrorKind::Other, "too many open files"))
            } else {
                Ok(calls)
            })
        })
        .await;
        assert_eq!(accepted, 2);
        assert!(started.elapsed() >= ACCEPT_ERROR_DELAY);
    }
}
