use crate::error::Error;
use crate::store::{SharedStore, ACME_CHALLENGE_LABEL};
use crate::zone::SharedZone;
use tokio_util::sync::CancellationToken;

/// Publishes [DNS-01] challenge responses for an ACME client.
///
/// [DNS-01]: https://www.rfc-editor.org/rfc/rfc8555#section-8.4
#[async_trait::async_trait]
pub trait ChallengeProvider: Send + Sync {
    /// Make `digest` resolvable as a TXT record at `fqdn`.
    async fn present(&self, fqdn: &str, digest: &str, cancel: &CancellationToken)
        -> Result<(), Error>;

    /// Withdraw a value published by [`present`][ChallengeProvider::present].
    async fn cleanup(&self, fqdn: &str, digest: &str, cancel: &CancellationToken)
        -> Result<(), Error>;
}

/// Solves challenges for the server's own names by writing straight into the record store.
///
/// Only `_acme-challenge.<domain>` can be presented. Values written here bypass the HTTP API's
/// authentication and source address checks.
#[derive(Clone)]
pub struct SelfChallengeProvider {
    zone: SharedZone,
    store: SharedStore,
}

impl SelfChallengeProvider {
    pub fn new(zone: SharedZone, store: SharedStore) -> Self {
        SelfChallengeProvider { zone, store }
    }

    fn check_fqdn(&self, fqdn: &str) -> Result<(), Error> {
        let expected = self.zone.fulldomain(ACME_CHALLENGE_LABEL);
        if fqdn.trim_end_matches('.').eq_ignore_ascii_case(&expected) {
            Ok(())
        } else {
            Err(Error::NotFound(fqdn.to_string()))
        }
    }
}

#[async_trait::async_trait]
impl ChallengeProvider for SelfChallengeProvider {
    async fn present(
        &self,
        fqdn: &str,
        digest: &str,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        self.check_fqdn(fqdn)?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Cancelled),
            res = self.store.push_challenge_value(ACME_CHALLENGE_LABEL, digest.to_string()) => {
                if res.is_ok() {
                    tracing::info!("presented challenge for \"{fqdn}\"");
                }
                res
            }
        }
    }

    /// Values age out of the two-slot challenge window, so there is nothing to remove.
    async fn cleanup(
        &self,
        fqdn: &str,
        _digest: &str,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        self.check_fqdn(fqdn)?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        tracing::debug!("cleanup for \"{fqdn}\" left to window rotation");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::EXAMPLE;
    use crate::config::Config;
    use crate::store::tests::test_store;
    use crate::zone::Zone;
    use std::sync::Arc;

    async fn provider() -> SelfChallengeProvider {
        let config = Config::try_from_json(EXAMPLE).unwrap();
        let zone = Arc::new(Zone::try_from_config(&config).unwrap());
        let store = Arc::new(test_store().await);
        store.reserve(ACME_CHALLENGE_LABEL).await.unwrap();
        SelfChallengeProvider::new(zone, store)
    }

    fn digest(c: char) -> String {
        std::iter::repeat(c).take(43).collect()
    }

    #[tokio::test]
    async fn present_writes_reserved_record() {
        let provider = provider().await;
        let cancel = CancellationToken::new();
        provider
            .present("_acme-challenge.acme.example.com", &digest('A'), &cancel)
            .await
            .unwrap();
        provider
            .present("_ACME-Challenge.acme.example.com.", &digest('B'), &cancel)
            .await
            .unwrap();
        assert_eq!(
            provider
                .store
                .lookup_challenge_values(ACME_CHALLENGE_LABEL)
                .await,
            Some(vec![digest('B'), digest('A')])
        );
        provider
            .cleanup("_acme-challenge.acme.example.com", &digest('A'), &cancel)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn concurrent_presents_both_land() {
        let provider = provider().await;
        let cancel = CancellationToken::new();
        let (apex, wildcard) = (digest('A'), digest('W'));
        let (a, b) = tokio::join!(
            provider.present("_acme-challenge.acme.example.com", &apex, &cancel),
            provider.present("_acme-challenge.acme.example.com", &wildcard, &cancel),
        );
        a.unwrap();
        b.unwrap();
        let mut values = provider
            .store
            .lookup_challenge_values(ACME_CHALLENGE_LABEL)
            .await
            .unwrap();
        values.sort();
        assert_eq!(values, vec![apex, wildcard]);
    }

    #[tokio::test]
    async fn only_own_challenge_name() {
        let provider = provider().await;
        let cancel = CancellationToken::new();
        for fqdn in [
            "_acme-challenge.example.com",
            "acme.example.com",
            "x._acme-challenge.acme.example.com",
        ] {
            assert!(matches!(
                provider.present(fqdn, &digest('A'), &cancel).await,
                Err(Error::NotFound(_))
            ));
        }
    }

    #[tokio::test]
    async fn cancelled_calls_do_nothing() {
        let provider = provider().await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            provider
                .present("_acme-challenge.acme.example.com", &digest('A'), &cancel)
                .await,
            Err(Error::Cancelled)
        ));
        assert!(matches!(
            provider
                .cleanup("_acme-challenge.acme.example.com", &digest('A'), &cancel)
                .await,
            Err(Error::Cancelled)
        ));
        assert_eq!(
            provider
                .store
                .lookup_challenge_values(ACME_CHALLENGE_LABEL)
                .await,
            Some(vec![])
        );
    }
}
