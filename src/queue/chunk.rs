use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::sync::Mutex;

use camino::Utf8Path;
use fs2::FileExt;
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::de::DeserializeOwned;

use crate::error::QueueError;

/// A fresh chunk name: UTC timestamp plus a random suffix.
pub fn uniq_name() -> String {
    let stamp = chrono::Utc::now().format("%Y_%m_%d_%H_%M_%S");
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();

    format!("{stamp}_{suffix}")
}

fn options(create: bool) -> OpenOptions {
    let mut options = OpenOptions::new();
    options.create(create).write(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    options
}

/// Opens (creating if needed) the lock file at `path` and takes an exclusive
/// lock without blocking. `None` means someone else holds it.
pub fn try_lock(path: &Utf8Path) -> Result<Option<File>, QueueError> {
    let file = options(true).open(path).map_err(|source| QueueError::Lock {
        path: path.to_owned(),
        source,
    })?;

    match FileExt::try_lock_exclusive(&file) {
        Ok(()) => Ok(Some(file)),
        Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(None),
        Err(source) => Err(QueueError::Lock {
            path: path.to_owned(),
            source,
        }),
    }
}

/// The chunk this process appends to. Its lock is held for as long as the
/// stream lives.
pub struct ActiveStream {
    data: File,
    _lock: File,
}

impl ActiveStream {
    pub fn create(data_path: &Utf8Path, lock_path: &Utf8Path) -> Result<Self, QueueError> {
        let lock = try_lock(lock_path)?.ok_or_else(|| QueueError::Lock {
            path: lock_path.to_owned(),
            source: std::io::Error::from(ErrorKind::WouldBlock),
        })?;

        let data = options(true).append(true).open(data_path)?;
        tracing::debug!(chunk = %data_path, "opened active chunk");

        Ok(Self { data, _lock: lock })
    }

    /// Writes one record and flushes it before returning.
    pub fn write_line(&mut self, line: &str) -> Result<(), QueueError> {
        self.data.write_all(line.as_bytes())?;
        self.data.write_all(b"\n")?;
        self.data.flush()?;
        Ok(())
    }
}

/// In-memory buffer for events delivered ahead of the durable ones.
pub struct UrgentChunk<E> {
    events: Mutex<Vec<E>>,
}

impl<E> Default for UrgentChunk<E> {
    fn default() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }
}

impl<E> UrgentChunk<E> {
    pub fn push(&self, event: E) {
        self.events.lock().unwrap().push(event);
    }

    pub fn take(&self) -> Vec<E> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    /// Puts a batch back in front of anything added since it was taken.
    pub fn release(&self, mut batch: Vec<E>) {
        let mut events = self.events.lock().unwrap();
        batch.append(&mut events);
        *events = batch;
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Reads every event of a chunk file. Lines that do not decode (such as a
/// record torn by a crash, even mid character) are dropped with a warning.
pub fn read_events<E: DeserializeOwned>(path: &Utf8Path) -> Result<Vec<E>, QueueError> {
    let bytes = std::fs::read(path)?;
    let chunk = path.file_name().unwrap_or_default();
    let mut events = Vec::new();

    for (i, line) in bytes.split(|&b| b == b'\n').enumerate() {
        if line.trim_ascii().is_empty() {
            continue;
        }

        match serde_json::from_slice(line) {
            Ok(event) => events.push(event),
            Err(source) => {
                let err = QueueError::Decode {
                    chunk: chunk.to_string(),
                    line: i + 1,
                    source,
                };
                tracing::warn!("{err}");
            }
        }
    }

    Ok(events)
}

/// Names of the regular files directly under `dir`.
pub fn list(dir: &Utf8Path) -> Result<Vec<String>, QueueError> {
    let mut names = Vec::new();
    for entry in dir.read_dir_utf8()? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            names.push(entry.file_name().to_string());
        }
    }
    Ok(names)
}

/// Removes a file that may already be gone.
pub fn remove(path: &Utf8Path) -> Result<(), QueueError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;

    use super::*;

    #[test]
    fn test_uniq_name_shape() {
        let name = uniq_name();
        let (stamp, suffix) = name.rsplit_once('_').unwrap();
        assert_eq!(stamp.len(), "2024_01_01_00_00_00".len());
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(uniq_name(), uniq_name());
    }

    #[test]
    fn test_release_prepends() {
        let urgent = UrgentChunk::default();
        urgent.push(1);
        urgent.push(2);
        let batch = urgent.take();
        urgent.push(3);
        urgent.release(batch);
        assert_eq!(urgent.take(), vec![1, 2, 3]);
        assert!(urgent.is_empty());
    }

    #[test]
    fn test_lock_is_exclusive() {
        let temp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(temp.path().join("lock")).unwrap();

        let held = try_lock(&path).unwrap();
        assert!(held.is_some());
        assert!(try_lock(&path).unwrap().is_none());
        drop(held);
        assert!(try_lock(&path).unwrap().is_some());
    }

    #[test]
    fn test_torn_line_is_dropped() {
        let temp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(temp.path().join("chunk")).unwrap();
        std::fs::write(&path, "{\"a\":1}\n{\"a\":2}\n{\"a\":").unwrap();

        let events: Vec<serde_json::Value> = read_events(&path).unwrap();
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_torn_multibyte_tail_keeps_earlier_lines() {
        let temp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(temp.path().join("chunk")).unwrap();
        std::fs::write(&path, b"{\"n\":1}\n{\"n\":2}\n\"caf\xC3").unwrap();

        let events: Vec<serde_json::Value> = read_events(&path).unwrap();
        assert_eq!(events, vec![serde_json::json!({"n": 1}), serde_json::json!({"n": 2})]);
    }
}
