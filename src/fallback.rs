//! The `fallback` module serializes broadcast values to a shared directory
//! keyed by id. Producers write a copy eagerly; consumers only read it when
//! peer-to-peer dissemination fails.

use crate::broadcast_id::BroadcastId;
use crate::result::{BroadcastError, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

pub struct FallbackStore {
    workdir: PathBuf,
}

impl FallbackStore {
    pub fn new<P: AsRef<Path>>(workdir: P) -> Self {
        FallbackStore {
            workdir: workdir.as_ref().to_path_buf(),
        }
    }

    pub fn object_path(&self, id: &BroadcastId) -> PathBuf {
        self.workdir.join(id.to_string())
    }

    /// Writes atomically: the bytes land in a temporary file first and are
    /// renamed into place, so readers never observe a partial copy.
    pub fn write(&self, id: &BroadcastId, bytes: &[u8]) -> Result<()> {
        fs::create_dir_all(&self.workdir)?;
        let mut file = NamedTempFile::new_in(&self.workdir)?;
        file.write_all(bytes)?;
        file.persist(self.object_path(id))
            .map_err(|err| err.error)?;
        debug!("wrote fallback copy of {} ({} bytes)", id, bytes.len());
        Ok(())
    }

    pub fn read(&self, id: &BroadcastId) -> Result<Vec<u8>> {
        match fs::read(self.object_path(id)) {
            Ok(bytes) => {
                debug!("read fallback copy of {} ({} bytes)", id, bytes.len());
                Ok(bytes)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!("no fallback copy of {} in {:?}", id, self.workdir);
                Err(BroadcastError::FallbackUnavailable.into())
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::broadcast_id::BroadcastId;
    use crate::fallback::FallbackStore;
    use crate::result::{BroadcastError, Error};
    use tempfile::TempDir;

    #[test]
    fn test_write_read_roundtrip() {
        let workdir = TempDir::new().unwrap();
        let store = FallbackStore::new(workdir.path());
        let id = BroadcastId::new_rand();
        store.write(&id, b"reference data").unwrap();
        assert_eq!(store.read(&id).unwrap(), b"reference data");
        assert!(store.object_path(&id).exists());
    }

    #[test]
    fn test_missing_file_is_fallback_unavailable() {
        let workdir = TempDir::new().unwrap();
        let store = FallbackStore::new(workdir.path());
        assert_matches!(
            store.read(&BroadcastId::new_rand()),
            Err(Error::Broadcast(BroadcastError::FallbackUnavailable))
        );
    }

    #[test]
    fn test_overwrite_is_atomic_replace() {
        let workdir = TempDir::new().unwrap();
        let store = FallbackStore::new(workdir.path());
        let id = BroadcastId::new_rand();
        store.write(&id, b"first").unwrap();
        store.write(&id, b"second").unwrap();
        assert_eq!(store.read(&id).unwrap(), b"second");
    }
}
