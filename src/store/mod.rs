//! Registration and challenge value storage.
//!
//! The [`RecordStore`] maps each registered subdomain label to a [`SubdomainRecord`]: the
//! registrant's credentials, the networks allowed to update it, and a rolling window of the two
//! most recent [RFC-8555][RFC-8555] [DNS-01] challenge response values, newest first.
//!
//! Every record sits behind its own lock. Updates and lookups of the same subdomain are
//! linearizable; operations on different subdomains never wait on each other.
//!
//! Persistence is delegated to a [`Backend`]. Two are provided, [`memory::InMemoryBackend`] and
//! [`file::FileBackend`]. The former is not durable across restarts. The latter writes one JSON
//! document per subdomain and loads them all again on startup.
//!
//! [RFC-8555]: https://www.rfc-editor.org/rfc/rfc8555
//! [DNS-01]: https://www.rfc-editor.org/rfc/rfc8555#section-8.4

use crate::config::Config;
use crate::error::Error;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ipnetwork::IpNetwork;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

pub mod file;
pub mod memory;

pub use file::FileBackend;
pub use memory::InMemoryBackend;

/// How many challenge values a subdomain serves at once.
pub const CHALLENGE_WINDOW: usize = 2;

/// Label of the reserved record the server solves its own certificate challenges with.
pub const ACME_CHALLENGE_LABEL: &str = "_acme-challenge";

const PASSWORD_LEN: usize = 40;
const PASSWORD_CHARSET: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_";
const REGISTER_ATTEMPTS: usize = 8;

pub type SharedStore = Arc<RecordStore>;

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct SubdomainRecord {
    pub subdomain: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password_hash: String,
    #[serde(default)]
    pub allow_from: Vec<IpNetwork>,
    #[serde(default)]
    pub challenge_window: VecDeque<String>,
    /// Reserved records have no credentials and are only written in-process.
    #[serde(default)]
    pub reserved: bool,
}

impl SubdomainRecord {
    /// Whether an update from `source_ip` is permitted. An empty `allow_from` permits anyone.
    pub fn allows(&self, source_ip: IpAddr) -> bool {
        let source_ip = source_ip.to_canonical();
        self.allow_from.is_empty() || self.allow_from.iter().any(|net| net.contains(source_ip))
    }

    fn push_challenge_value(&mut self, value: String) {
        self.challenge_window.push_front(value);
        self.challenge_window.truncate(CHALLENGE_WINDOW);
    }
}

/// Durable storage for [`SubdomainRecord`]s, keyed by subdomain.
///
/// The [`RecordStore`] serializes writes per subdomain, so a backend never sees two concurrent
/// writes for the same key.
#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    /// Load every stored record.
    async fn load(&self) -> Result<Vec<SubdomainRecord>, Error>;

    /// Store a new record. Returns `false` without writing if the subdomain already exists.
    async fn create(&self, record: &SubdomainRecord) -> Result<bool, Error>;

    /// Replace the stored state of an existing record.
    async fn save(&self, record: &SubdomainRecord) -> Result<(), Error>;
}

pub struct RecordStore {
    records: DashMap<String, Arc<RwLock<SubdomainRecord>>>,
    usernames: DashMap<String, String>,
    backend: Box<dyn Backend>,
    bcrypt_cost: u32,
    dummy_hash: String,
}

impl RecordStore {
    /// Open a store over `backend`, loading all of its records.
    pub async fn open(backend: impl Backend + 'static, bcrypt_cost: u32) -> Result<Self, Error> {
        let dummy_hash = hash_password(generate_password(), bcrypt_cost).await?;
        let store = RecordStore {
            records: DashMap::default(),
            usernames: DashMap::default(),
            backend: Box::new(backend),
            bcrypt_cost,
            dummy_hash,
        };
        for record in store.backend.load().await? {
            if !record.reserved {
                store
                    .usernames
                    .insert(record.username.clone(), record.subdomain.clone());
            }
            store.records.insert(
                record.subdomain.to_ascii_lowercase(),
                Arc::new(RwLock::new(record)),
            );
        }
        tracing::debug!("loaded {} records", store.records.len());
        Ok(store)
    }

    /// Open the store described by [`Config::store_state_path`].
    pub async fn from_config(config: &Config) -> Result<SharedStore, Error> {
        let store = match &config.store_state_path {
            Some(path) => Self::open(FileBackend::open(path).await?, config.bcrypt_cost).await?,
            None => Self::open(InMemoryBackend, config.bcrypt_cost).await?,
        };
        Ok(Arc::new(store))
    }

    /// Create a registration with a random username and subdomain.
    ///
    /// Returns the new record and the plaintext password, which is not retained anywhere.
    pub async fn register(
        &self,
        allow_from: Vec<IpNetwork>,
    ) -> Result<(SubdomainRecord, String), Error> {
        let password = generate_password();
        let password_hash = hash_password(password.clone(), self.bcrypt_cost).await?;

        for _ in 0..REGISTER_ATTEMPTS {
            let record = SubdomainRecord {
                subdomain: Uuid::new_v4().to_string(),
                username: Uuid::new_v4().to_string(),
                password_hash: password_hash.clone(),
                allow_from: allow_from.clone(),
                ..SubdomainRecord::default()
            };
            if self.records.contains_key(&record.subdomain)
                || self.usernames.contains_key(&record.username)
            {
                continue;
            }
            if !self.backend.create(&record).await? {
                continue;
            }
            match self.records.entry(record.subdomain.clone()) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(vacant) => {
                    vacant.insert(Arc::new(RwLock::new(record.clone())));
                }
            }
            self.usernames
                .insert(record.username.clone(), record.subdomain.clone());
            tracing::info!("registered subdomain \"{}\"", record.subdomain);
            return Ok((record, password));
        }
        Err(Error::Storage(
            "could not allocate a unique subdomain".to_string(),
        ))
    }

    /// Create the credential-less record for `label` if it doesn't exist yet.
    pub async fn reserve(&self, label: &str) -> Result<(), Error> {
        let label = label.to_ascii_lowercase();
        if self.records.contains_key(&label) {
            return Ok(());
        }
        let record = SubdomainRecord {
            subdomain: label.clone(),
            reserved: true,
            ..SubdomainRecord::default()
        };
        self.backend.create(&record).await?;
        self.records
            .entry(label)
            .or_insert_with(|| Arc::new(RwLock::new(record)));
        Ok(())
    }

    /// Check `password` for `username`, returning a snapshot of the owning record.
    ///
    /// A bcrypt comparison is always made, against a throwaway hash when the username is
    /// unknown, and both failure modes produce the same [`Error::Unauthorized`].
    pub async fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Result<SubdomainRecord, Error> {
        let subdomain = self.usernames.get(username).map(|s| s.value().clone());
        let record = match subdomain.and_then(|s| self.entry(&s)) {
            Some(entry) => Some(entry.read().await.clone()),
            None => None,
        };

        let hash = record
            .as_ref()
            .map_or_else(|| self.dummy_hash.clone(), |r| r.password_hash.clone());
        let password = password.to_string();
        let valid = tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash))
            .await
            .map_err(|err| Error::Storage(err.to_string()))?
            .unwrap_or(false);

        match record {
            Some(record) if valid && !record.reserved => Ok(record),
            _ => Err(Error::Unauthorized),
        }
    }

    /// Make `value` the newest challenge value of `subdomain`, evicting the oldest if the window
    /// is full.
    ///
    /// The new window is persisted before it becomes visible; if persisting fails the previous
    /// window stays in place.
    pub async fn push_challenge_value(&self, subdomain: &str, value: String) -> Result<(), Error> {
        let entry = self
            .entry(subdomain)
            .ok_or_else(|| Error::NotFound(subdomain.to_string()))?;
        let mut record = entry.write().await;
        let mut updated = record.clone();
        updated.push_challenge_value(value);
        self.backend.save(&updated).await?;
        *record = updated;
        Ok(())
    }

    /// The current challenge values of `subdomain`, newest first, or `None` if it isn't
    /// registered.
    pub async fn lookup_challenge_values(&self, subdomain: &str) -> Option<Vec<String>> {
        let entry = self.entry(subdomain)?;
        let record = entry.read().await;
        Some(record.challenge_window.iter().cloned().collect())
    }

    fn entry(&self, subdomain: &str) -> Option<Arc<RwLock<SubdomainRecord>>> {
        self.records
            .get(&subdomain.to_ascii_lowercase())
            .map(|e| Arc::clone(e.value()))
    }
}

fn generate_password() -> String {
    let mut rng = rand::rng();
    (0..PASSWORD_LEN)
        .map(|_| PASSWORD_CHARSET[rng.random_range(0..PASSWORD_CHARSET.len())] as char)
        .collect()
}

async fn hash_password(password: String, cost: u32) -> Result<String, Error> {
    tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
        .await
        .map_err(|err| Error::Storage(err.to_string()))?
        .map_err(|err| Error::Storage(err.to_string()))
}
