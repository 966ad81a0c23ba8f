//! A JSON file-backed implementation of the [`Backend`][super::Backend] trait.
//!
//! Each subdomain is persisted as its own `<subdomain>.json` document inside a state directory,
//! so an update rewrites exactly one small file and never touches other registrations.
use crate::error::Error;
use crate::store::{Backend, SubdomainRecord};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;

const EXTENSION: &str = "json";

/// A directory of JSON documents, one per subdomain. Documents are written to a temporary file
/// and renamed into place, so a crash mid-write leaves the previous state readable.
#[derive(Debug, Clone)]
#[allow(clippy::module_name_repetitions)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    /// Use `dir` as the state directory, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the directory can't be created.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, Error> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .await
            .map_err(|err| storage_error(&dir, err))?;
        Ok(Self { dir })
    }

    fn path_for(&self, subdomain: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{EXTENSION}", subdomain.to_ascii_lowercase()))
    }

    async fn write(&self, record: &SubdomainRecord) -> Result<(), Error> {
        let path = self.path_for(&record.subdomain);
        let tmp_path = path.with_extension(format!("{EXTENSION}.tmp"));
        let data = serde_json::to_vec_pretty(record)?;

        let mut tmp = File::create(&tmp_path)
            .await
            .map_err(|err| storage_error(&tmp_path, err))?;
        tmp.write_all(&data)
            .await
            .map_err(|err| storage_error(&tmp_path, err))?;
        tmp.sync_all()
            .await
            .map_err(|err| storage_error(&tmp_path, err))?;
        fs::rename(&tmp_path, &path)
            .await
            .map_err(|err| storage_error(&path, err))
    }
}

#[async_trait::async_trait]
impl Backend for FileBackend {
    async fn load(&self) -> Result<Vec<SubdomainRecord>, Error> {
        let mut records = Vec::new();
        let mut entries = fs::read_dir(&self.dir)
            .await
            .map_err(|err| storage_error(&self.dir, err))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| storage_error(&self.dir, err))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            let contents = fs::read(&path)
                .await
                .map_err(|err| storage_error(&path, err))?;
            let record: SubdomainRecord =
                serde_json::from_slice(&contents).map_err(|err| storage_error(&path, err))?;
            records.push(record);
        }
        Ok(records)
    }

    async fn create(&self, record: &SubdomainRecord) -> Result<bool, Error> {
        let path = self.path_for(&record.subdomain);
        if fs::try_exists(&path)
            .await
            .map_err(|err| storage_error(&path, err))?
        {
            return Ok(false);
        }
        self.write(record).await?;
        Ok(true)
    }

    async fn save(&self, record: &SubdomainRecord) -> Result<(), Error> {
        self.write(record).await
    }
}

fn storage_error(path: &Path, err: impl Display) -> Error {
    tracing::error!("record state {}: {err}", path.display());
    Error::Storage(format!("{}: {err}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{RecordStore, ACME_CHALLENGE_LABEL};
    use tempfile::TempDir;

    fn digest(c: char) -> String {
        std::iter::repeat(c).take(43).collect()
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = TempDir::new().unwrap();

        let (record, password) = {
            let store = RecordStore::open(FileBackend::open(dir.path()).await.unwrap(), 4)
                .await
                .unwrap();
            store.reserve(ACME_CHALLENGE_LABEL).await.unwrap();
            let (record, password) = store.register(vec![]).await.unwrap();
            store
                .push_challenge_value(&record.subdomain, digest('A'))
                .await
                .unwrap();
            store
                .push_challenge_value(&record.subdomain, digest('B'))
                .await
                .unwrap();
            (record, password)
        };

        let store = RecordStore::open(FileBackend::open(dir.path()).await.unwrap(), 4)
            .await
            .unwrap();
        assert_eq!(
            store.lookup_challenge_values(&record.subdomain).await,
            Some(vec![digest('B'), digest('A')])
        );
        assert_eq!(
            store.lookup_challenge_values(ACME_CHALLENGE_LABEL).await,
            Some(vec![])
        );
        let authed = store
            .authenticate(&record.username, &password)
            .await
            .unwrap();
        assert_eq!(authed.subdomain, record.subdomain);
        store.reserve(ACME_CHALLENGE_LABEL).await.unwrap();
    }

    #[tokio::test]
    async fn create_refuses_existing_subdomain() {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::open(dir.path()).await.unwrap();
        let record = SubdomainRecord {
            subdomain: "taken".to_string(),
            ..SubdomainRecord::default()
        };
        assert!(backend.create(&record).await.unwrap());
        assert!(!backend.create(&record).await.unwrap());
        assert_eq!(backend.load().await.unwrap(), vec![record]);
    }

    #[tokio::test]
    async fn corrupt_state_is_an_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("broken.json"), b"{ not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();
        let backend = FileBackend::open(dir.path()).await.unwrap();
        assert!(matches!(backend.load().await, Err(Error::Storage(_))));
    }
}
