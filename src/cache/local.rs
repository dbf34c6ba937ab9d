//! A [`RemoteStore`] over a plain directory.
//!
//! Artifacts live at `<root>/<aa>/<uid hex>`, sharded by the first byte, with
//! a CBOR sidecar `<uid hex>.meta` recording size and checksum. A blob whose
//! checksum no longer matches is treated as absent.

use std::fs::File;
use std::io::{BufReader, ErrorKind};

use camino::{Utf8Path, Utf8PathBuf};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};

use crate::cache::RemoteStore;
use crate::core::Hash32;
use crate::error::{TransportError, TransportErrorKind};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct BlobMeta {
    size: u64,
    checksum: Hash32,
    stored_at: String,
}

pub struct LocalStore {
    root: Utf8PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn blob_path(&self, uid: &Hash32) -> Utf8PathBuf {
        let hex = uid.to_hex();
        self.root.join(&hex[..2]).join(hex)
    }

    fn meta_path(&self, uid: &Hash32) -> Utf8PathBuf {
        self.blob_path(uid).with_extension("meta")
    }

    fn read_meta(&self, uid: &Hash32) -> Option<BlobMeta> {
        let file = File::open(self.meta_path(uid)).ok()?;
        ciborium::from_reader(BufReader::new(file)).ok()
    }

    /// Writes next to `path` and renames into place.
    fn write_atomic(path: &Utf8Path, bytes: &[u8]) -> std::io::Result<()> {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(8)
            .map(char::from)
            .collect();
        let temp = path.with_extension(format!("tmp-{suffix}"));

        std::fs::write(&temp, bytes)?;
        std::fs::rename(&temp, path).inspect_err(|_| {
            let _ = std::fs::remove_file(&temp);
        })
    }
}

impl RemoteStore for LocalStore {
    fn has(&self, uid: &Hash32) -> Result<bool, TransportError> {
        Ok(self.blob_path(uid).exists() && self.meta_path(uid).exists())
    }

    fn get(&self, uid: &Hash32) -> Result<Option<Vec<u8>>, TransportError> {
        let Some(meta) = self.read_meta(uid) else {
            return Ok(None);
        };

        let data = match std::fs::read(self.blob_path(uid)) {
            Ok(data) => data,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        if data.len() as u64 != meta.size || Hash32::hash(&data) != meta.checksum {
            tracing::warn!(%uid, "cached artifact is corrupt, ignoring it");
            return Ok(None);
        }

        Ok(Some(data))
    }

    fn put(&self, uid: &Hash32, data: &[u8]) -> Result<(), TransportError> {
        let blob = self.blob_path(uid);
        if let Some(dir) = blob.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let meta = BlobMeta {
            size: data.len() as u64,
            checksum: Hash32::hash(data),
            stored_at: chrono::Utc::now().to_rfc3339(),
        };

        let mut encoded = Vec::new();
        ciborium::into_writer(&meta, &mut encoded)
            .map_err(|err| TransportError::new(TransportErrorKind::Other, err.to_string()))?;

        Self::write_atomic(&blob, data)?;
        Self::write_atomic(&self.meta_path(uid), &encoded)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, LocalStore) {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        (temp, LocalStore::new(root))
    }

    #[test]
    fn test_put_then_get() {
        let (_temp, store) = store();
        let uid = Hash32::hash(b"node");

        assert!(!store.has(&uid).unwrap());
        assert_eq!(store.get(&uid).unwrap(), None);

        store.put(&uid, b"artifact").unwrap();
        assert!(store.has(&uid).unwrap());
        assert_eq!(store.get(&uid).unwrap().as_deref(), Some(&b"artifact"[..]));

        let hex = uid.to_hex();
        assert!(store.root().join(&hex[..2]).join(&hex).is_file());
    }

    #[test]
    fn test_corrupt_blob_is_a_miss() {
        let (_temp, store) = store();
        let uid = Hash32::hash(b"node");
        store.put(&uid, b"artifact").unwrap();

        std::fs::write(store.blob_path(&uid), b"tampered").unwrap();
        assert_eq!(store.get(&uid).unwrap(), None);
    }
}
