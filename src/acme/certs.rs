use crate::acme::provider::ChallengeProvider;
use crate::api::tls::{self, SharedTlsConfig};
use crate::config::{AcmeConfig, Config};
use crate::error::Error;
use futures::future::try_join_all;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus,
};
use rcgen::{CertificateParams, KeyPair};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const ACCOUNT_FILE: &str = "account.json";
const CERT_FILE: &str = "cert.pem";
const KEY_FILE: &str = "key.pem";

const ORDER_TIMEOUT: Duration = Duration::from_secs(300);
const MAX_POLL_DELAY: Duration = Duration::from_secs(10);
const RENEW_CHECK_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);
const SECONDS_PER_DAY: i64 = 86_400;

/// A PEM certificate chain and its private key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCert {
    pub cert_pem: String,
    pub key_pem: String,
}

struct PendingChallenge {
    fqdn: String,
    digest: String,
    url: String,
}

/// Obtains and renews the API certificate from an ACME directory, solving DNS-01 challenges
/// through a [`ChallengeProvider`].
pub struct CertManager {
    directory_url: String,
    contact: Option<String>,
    names: Vec<String>,
    renew_before: i64,
    cache_dir: PathBuf,
    provider: Arc<dyn ChallengeProvider>,
}

impl CertManager {
    pub fn new(config: &Config, acme: &AcmeConfig, provider: Arc<dyn ChallengeProvider>) -> Self {
        CertManager {
            directory_url: acme.directory_url().to_string(),
            contact: acme.contact.clone(),
            names: config.acme_names(acme),
            renew_before: i64::from(acme.renew_before_days) * SECONDS_PER_DAY,
            cache_dir: PathBuf::from(&acme.cache_dir),
            provider,
        }
    }

    /// The cached certificate if it isn't due for renewal, otherwise a newly issued one.
    pub async fn load_or_issue(&self, cancel: &CancellationToken) -> Result<IssuedCert, Error> {
        if let Some(cached) = self.fresh_cached().await? {
            tracing::info!("using cached certificate for {:?}", self.names);
            return Ok(cached);
        }
        self.issue(cancel).await
    }

    /// Issue a new certificate if the cached one is missing or close to expiry.
    pub async fn renew_if_needed(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<IssuedCert>, Error> {
        if self.fresh_cached().await?.is_some() {
            return Ok(None);
        }
        self.issue(cancel).await.map(Some)
    }

    async fn fresh_cached(&self) -> Result<Option<IssuedCert>, Error> {
        let cert_path = self.cache_dir.join(CERT_FILE);
        let key_path = self.cache_dir.join(KEY_FILE);
        if !tokio::fs::try_exists(&cert_path).await? || !tokio::fs::try_exists(&key_path).await? {
            return Ok(None);
        }
        let cached = IssuedCert {
            cert_pem: tokio::fs::read_to_string(&cert_path).await?,
            key_pem: tokio::fs::read_to_string(&key_path).await?,
        };
        let remaining = expires_at(&cached.cert_pem)? - OffsetDateTime::now_utc().unix_timestamp();
        if remaining < self.renew_before {
            tracing::info!(
                "cached certificate expires in {} days, renewing",
                remaining / SECONDS_PER_DAY
            );
            return Ok(None);
        }
        Ok(Some(cached))
    }

    async fn account(&self) -> Result<Account, Error> {
        let path = self.cache_dir.join(ACCOUNT_FILE);
        if tokio::fs::try_exists(&path).await? {
            let credentials: AccountCredentials =
                serde_json::from_slice(&tokio::fs::read(&path).await?)?;
            return Ok(Account::builder()?.from_credentials(credentials).await?);
        }

        tracing::info!("creating ACME account at {}", self.directory_url);
        let contact: Vec<String> = self
            .contact
            .iter()
            .map(|c| {
                if c.starts_with("mailto:") {
                    c.clone()
                } else {
                    format!("mailto:{c}")
                }
            })
            .collect();
        let contact: Vec<&str> = contact.iter().map(String::as_str).collect();
        let (account, credentials) = Account::builder()?
            .create(
                &NewAccount {
                    contact: &contact,
                    terms_of_service_agreed: true,
                    only_return_existing: false,
                },
                self.directory_url.clone(),
                None,
            )
            .await?;
        tokio::fs::create_dir_all(&self.cache_dir).await?;
        tokio::fs::write(&path, serde_json::to_vec_pretty(&credentials)?).await?;
        Ok(account)
    }

    /// Order, validate and download a certificate for the configured names.
    pub async fn issue(&self, cancel: &CancellationToken) -> Result<IssuedCert, Error> {
        tracing::info!("ordering certificate for {:?}", self.names);
        let account = self.account().await?;
        let identifiers: Vec<Identifier> = self
            .names
            .iter()
            .map(|name| Identifier::Dns(name.clone()))
            .collect();
        let mut order = account.new_order(&NewOrder::new(&identifiers)).await?;

        let challenges = pending_challenges(&mut order).await?;
        let result = async {
            try_join_all(
                challenges
                    .iter()
                    .map(|c| self.provider.present(&c.fqdn, &c.digest, cancel)),
            )
            .await?;
            set_ready(&mut order, &challenges).await?;
            poll_order(&mut order, OrderStatus::Ready, cancel).await?;
            self.finalize(&mut order, cancel).await
        }
        .await;

        for c in &challenges {
            if let Err(err) = self.provider.cleanup(&c.fqdn, &c.digest, cancel).await {
                tracing::warn!("cleanup of {} failed: {err}", c.fqdn);
            }
        }

        let issued = result?;
        self.save(&issued).await?;
        tracing::info!("issued certificate for {:?}", self.names);
        Ok(issued)
    }

    async fn finalize(
        &self,
        order: &mut Order,
        cancel: &CancellationToken,
    ) -> Result<IssuedCert, Error> {
        let key = KeyPair::generate().map_err(csr_error)?;
        let csr = CertificateParams::new(self.names.clone())
            .map_err(csr_error)?
            .serialize_request(&key)
            .map_err(csr_error)?
            .der()
            .to_vec();
        order.finalize_csr(&csr).await?;
        poll_order(order, OrderStatus::Valid, cancel).await?;

        let cert_pem = order
            .certificate()
            .await?
            .ok_or_else(|| Error::Acme("order is valid but has no certificate".to_string()))?;
        Ok(IssuedCert {
            cert_pem,
            key_pem: key.serialize_pem(),
        })
    }

    async fn save(&self, issued: &IssuedCert) -> Result<(), Error> {
        tokio::fs::create_dir_all(&self.cache_dir).await?;
        tokio::fs::write(self.cache_dir.join(KEY_FILE), &issued.key_pem).await?;
        tokio::fs::write(self.cache_dir.join(CERT_FILE), &issued.cert_pem).await?;
        Ok(())
    }
}

fn csr_error(err: rcgen::Error) -> Error {
    Error::Acme(format!("building CSR: {err}"))
}

/// Collect the DNS-01 challenge of every authorization still pending.
async fn pending_challenges(order: &mut Order) -> Result<Vec<PendingChallenge>, Error> {
    let mut challenges = Vec::new();
    let mut authorizations = order.authorizations();
    while let Some(result) = authorizations.next().await {
        let mut authz = result?;
        match authz.status {
            AuthorizationStatus::Pending => {}
            AuthorizationStatus::Valid => continue,
            _ => {
                return Err(Error::Acme(format!(
                    "unexpected authorization status {:?}",
                    authz.status
                )))
            }
        }

        let identifier = authz.identifier();
        let domain = match &identifier.identifier {
            Identifier::Dns(domain) => domain.clone(),
            other => {
                return Err(Error::Acme(format!("unsupported identifier {other:?}")));
            }
        };
        let challenge = authz
            .challenge(ChallengeType::Dns01)
            .ok_or_else(|| Error::Acme(format!("no dns-01 challenge offered for {domain}")))?;
        challenges.push(PendingChallenge {
            fqdn: format!("_acme-challenge.{domain}"),
            digest: challenge.key_authorization().dns_value(),
            url: challenge.url.clone(),
        });
    }
    Ok(challenges)
}

/// Tell the ACME server every presented challenge can be validated. Records are served by this
/// process, so there is no propagation delay to wait out.
async fn set_ready(order: &mut Order, challenges: &[PendingChallenge]) -> Result<(), Error> {
    let mut authorizations = order.authorizations();
    while let Some(result) = authorizations.next().await {
        let mut authz = result?;
        if let Some(mut challenge) = authz.challenge(ChallengeType::Dns01) {
            if challenges.iter().any(|c| c.url == challenge.url) {
                challenge.set_ready().await?;
            }
        }
    }
    Ok(())
}

async fn poll_order(
    order: &mut Order,
    until: OrderStatus,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    let deadline = Instant::now() + ORDER_TIMEOUT;
    let mut delay = Duration::from_millis(250);
    loop {
        let state = order.refresh().await?;
        match state.status {
            OrderStatus::Valid => return Ok(()),
            OrderStatus::Ready if matches!(until, OrderStatus::Ready) => return Ok(()),
            OrderStatus::Invalid => {
                return Err(Error::Acme("order became invalid".to_string()));
            }
            _ => tracing::debug!("order is {:?}, waiting for {until:?}", state.status),
        }
        if Instant::now() + delay > deadline {
            return Err(Error::Acme(format!(
                "timed out waiting for order to become {until:?}"
            )));
        }
        tokio::select! {
            () = cancel.cancelled() => return Err(Error::Cancelled),
            () = tokio::time::sleep(delay) => {}
        }
        delay = (delay * 2).min(MAX_POLL_DELAY);
    }
}

/// Unix timestamp after which the first certificate of a PEM chain is no longer valid.
fn expires_at(cert_pem: &str) -> Result<i64, Error> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes())
        .map_err(|err| Error::Tls(format!("invalid certificate PEM: {err}")))?;
    let cert = pem
        .parse_x509()
        .map_err(|err| Error::Tls(format!("invalid certificate: {err}")))?;
    Ok(cert.validity().not_after.timestamp())
}

/// Re-check the certificate every 12 hours, swapping a renewed one into the API listener.
pub async fn renew_loop(
    manager: Arc<CertManager>,
    tls_config: SharedTlsConfig,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(RENEW_CHECK_INTERVAL);
    interval.tick().await;
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = interval.tick() => {}
        }
        match manager.renew_if_needed(&cancel).await {
            Ok(Some(issued)) => {
                match tls::server_config(issued.cert_pem.as_bytes(), issued.key_pem.as_bytes()) {
                    Ok(config) => {
                        tls_config.store(Arc::new(config));
                        tracing::info!("reloaded API certificate");
                    }
                    Err(err) => tracing::error!("renewed certificate is unusable: {err}"),
                }
            }
            Ok(None) => tracing::debug!("certificate not due for renewal"),
            Err(err) => tracing::error!("certificate renewal failed: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::EXAMPLE;
    use crate::config::TlsConfig;
    use tempfile::TempDir;

    struct NoopProvider;

    #[async_trait::async_trait]
    impl ChallengeProvider for NoopProvider {
        async fn present(&self, _: &str, _: &str, _: &CancellationToken) -> Result<(), Error> {
            Ok(())
        }

        async fn cleanup(&self, _: &str, _: &str, _: &CancellationToken) -> Result<(), Error> {
            Ok(())
        }
    }

    fn manager(cache_dir: &TempDir) -> CertManager {
        let json = EXAMPLE.replace(
            r#""dns_tcp_timeout": 5"#,
            &format!(
                r#""dns_tcp_timeout": 5,
                   "tls": {{"mode": "acme", "directory": "http://127.0.0.1:9/dir", "cache_dir": "{}"}}"#,
                cache_dir.path().display()
            ),
        );
        let config = Config::try_from_json(&json).unwrap();
        let TlsConfig::Acme(acme) = &config.tls else {
            panic!("expected acme tls config");
        };
        CertManager::new(&config, acme, Arc::new(NoopProvider))
    }

    fn cert_expiring_in(days: i64) -> IssuedCert {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec!["acme.example.com".to_string()]).unwrap();
        params.not_before = OffsetDateTime::now_utc() - time::Duration::days(1);
        params.not_after = OffsetDateTime::now_utc() + time::Duration::days(days);
        IssuedCert {
            cert_pem: params.self_signed(&key).unwrap().pem(),
            key_pem: key.serialize_pem(),
        }
    }

    #[test]
    fn reads_expiry() {
        let issued = cert_expiring_in(10);
        let remaining = expires_at(&issued.cert_pem).unwrap()
            - OffsetDateTime::now_utc().unix_timestamp();
        assert!((9 * SECONDS_PER_DAY..=10 * SECONDS_PER_DAY).contains(&remaining));
        assert!(matches!(expires_at("not a pem"), Err(Error::Tls(_))));
    }

    #[tokio::test]
    async fn reuses_fresh_cached_certificate() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        assert_eq!(manager.names, vec!["acme.example.com".to_string()]);
        assert_eq!(manager.fresh_cached().await.unwrap(), None);

        let issued = cert_expiring_in(60);
        manager.save(&issued).await.unwrap();
        assert_eq!(manager.fresh_cached().await.unwrap(), Some(issued.clone()));

        let cancel = CancellationToken::new();
        assert_eq!(manager.load_or_issue(&cancel).await.unwrap(), issued);
        assert_eq!(manager.renew_if_needed(&cancel).await.unwrap(), None);
    }

    #[tokio::test]
    async fn expiring_certificate_is_not_reused() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        manager.save(&cert_expiring_in(5)).await.unwrap();
        assert_eq!(manager.fresh_cached().await.unwrap(), None);
    }
}
