use crate::error::Error;
use crate::store::{Backend, SubdomainRecord};

/// A [`Backend`] that keeps nothing. Records live only in the
/// [`RecordStore`][super::RecordStore]'s own maps and are lost on restart.
#[derive(Default, Debug, Clone, Copy)]
#[allow(clippy::module_name_repetitions)]
pub struct InMemoryBackend;

#[async_trait::async_trait]
impl Backend for InMemoryBackend {
    async fn load(&self) -> Result<Vec<SubdomainRecord>, Error> {
        Ok(Vec::new())
    }

    async fn create(&self, _record: &SubdomainRecord) -> Result<bool, Error> {
        Ok(true)
    }

    async fn save(&self, _record: &SubdomainRecord) -> Result<(), Error> {
        Ok(())
    }
}
