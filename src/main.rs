use acme_dns::acme::{renew_loop, CertManager, SelfChallengeProvider};
use acme_dns::api::tls::{self, SharedTlsConfig};
use acme_dns::config::TlsConfig;
use acme_dns::store::ACME_CHALLENGE_LABEL;
use acme_dns::{Config, RecordStore, SharedConfig, SharedStore, SharedZone, Zone};
use anyhow::{anyhow, Result};
use is_terminal::IsTerminal;
use std::future::Future;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_init();

    let mut first_args = std::env::args().take(2);
    let (program_name, config_file) = (
        first_args.next().unwrap_or("acme-dns".to_string()),
        first_args.next(),
    );

    let config = config_init(&program_name, config_file)?;
    let zone: SharedZone = Arc::new(Zone::try_from_config(&config)?);
    let store = RecordStore::from_config(&config).await?;
    store.reserve(ACME_CHALLENGE_LABEL).await?;

    // DNS has to be answering before any ACME challenge can be solved.
    let dns_server = acme_dns::dns::new(config.clone(), zone.clone(), store.clone()).await?;
    let mut dns_handle = tokio::spawn(dns_server.block_until_done());

    let cancel = CancellationToken::new();
    // ACME issuance can take minutes.
    let interrupted = async {
        tokio::select! {
            _ = signal::ctrl_c() => {
                tracing::info!("quitting from signal");
                Ok::<(), anyhow::Error>(())
            },
            Ok(dns_res) = &mut dns_handle => match dns_res {
                Ok(()) => Err(anyhow!("DNS server stopped during startup")),
                Err(err) => Err(anyhow::Error::from(err)),
            }
        }
    };
    let Some(tls_config) =
        or_interrupted(tls_init(&config, &zone, &store, &cancel), interrupted).await?
    else {
        cancel.cancel();
        return Ok(());
    };
    let api_server = acme_dns::api::new(config.clone(), zone.clone(), store.clone(), tls_config);
    let api_handle = tokio::spawn(api_server);

    tokio::select! {
        _ = signal::ctrl_c() => {
            tracing::info!("quitting from signal");
        },
        Ok(dns_res) = dns_handle => {
            if let Err(err) = dns_res {
                return Err(err.into())
            }
        }
        Ok(api_res) = api_handle => {
            if let Err(err) = api_res {
                return Err(err)
            }
        }
    }
    cancel.cancel();
    tracing::info!("goodbye");
    Ok(())
}

/// Run `startup` to completion unless `interrupted` resolves first, which yields `None` (or its
/// error).
async fn or_interrupted<T>(
    startup: impl Future<Output = Result<T>>,
    interrupted: impl Future<Output = Result<()>>,
) -> Result<Option<T>> {
    tokio::select! {
        res = startup => res.map(Some),
        res = interrupted => res.map(|()| None),
    }
}

fn tracing_init() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_ansi(std::io::stdout().is_terminal()))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "acme_dns=info".into()),
        )
        .init();
}

fn config_init(program_name: &str, config_file: Option<String>) -> Result<SharedConfig> {
    match config_file {
        None => Err(anyhow!("usage: {program_name} /path/to/config.json")),
        Some(config_file) => {
            tracing::debug!("loaded config from {config_file}");
            let config = Config::try_from_file(&config_file)?;
            Ok(Arc::new(config))
        }
    }
}

async fn tls_init(
    config: &Config,
    zone: &SharedZone,
    store: &SharedStore,
    cancel: &CancellationToken,
) -> Result<Option<SharedTlsConfig>> {
    match &config.tls {
        TlsConfig::None => Ok(None),
        TlsConfig::Cert {
            cert_path,
            key_path,
        } => {
            let server_config = tls::load_pem_files(cert_path, key_path).await?;
            Ok(Some(tls::shared(server_config)))
        }
        TlsConfig::Acme(acme) => {
            let provider = Arc::new(SelfChallengeProvider::new(zone.clone(), store.clone()));
            let manager = Arc::new(CertManager::new(config, acme, provider));
            let issued = manager.load_or_issue(cancel).await?;
            let tls_config = tls::shared(tls::server_config(
                issued.cert_pem.as_bytes(),
                issued.key_pem.as_bytes(),
            )?);
            tokio::spawn(renew_loop(manager, tls_config.clone(), cancel.clone()));
            Ok(Some(tls_config))
        }
    }
}
