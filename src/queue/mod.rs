//! Durable, chunked, multi-process event queue.
//!
//! On disk the queue is two directories under its root:
//!
//! ```text
//! <root>/data/<chunk>    newline delimited JSON records
//! <root>/locks/<chunk>   empty file carrying an advisory lock
//! ```
//!
//! Each queue instance appends to one chunk of its own, named when the
//! instance is created and never rotated. Chunks left behind by other
//! instances (finished or crashed) are picked up by [`ChunkedQueue::consume`].
//! Urgent events skip the disk entirely and are delivered through
//! [`ChunkedQueue::drain_urgent`].

pub mod chunk;

use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};
use rand::seq::SliceRandom;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::config::QueueOptions;
use crate::error::{CallbackResult, QueueError};

use self::chunk::{ActiveStream, UrgentChunk};

const DATA_DIR: &str = "data";
const LOCKS_DIR: &str = "locks";

/// What a consumer wants after handling a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sweep {
    /// The chunk was handled; delete it and go on.
    Continue,
    /// Keep the chunk and end the sweep.
    Stop,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeStats {
    /// Chunks handled and deleted.
    pub chunks: usize,
    pub events: usize,
    /// Chunks held by a live writer or another consumer.
    pub skipped: usize,
    /// Chunks kept because reading them or the consumer failed.
    pub failed: usize,
    pub stopped: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupStats {
    pub orphan_locks: usize,
    pub trimmed: usize,
}

pub struct ChunkedQueue<E = serde_json::Value> {
    data_dir: Utf8PathBuf,
    locks_dir: Utf8PathBuf,
    name: String,
    active: Mutex<Option<ActiveStream>>,
    urgent: UrgentChunk<E>,
}

impl<E> ChunkedQueue<E>
where
    E: Serialize + DeserializeOwned,
{
    pub fn open(root: impl Into<Utf8PathBuf>) -> Result<Self, QueueError> {
        let root = root.into();
        let data_dir = root.join(DATA_DIR);
        let locks_dir = root.join(LOCKS_DIR);
        std::fs::create_dir_all(&data_dir)?;
        std::fs::create_dir_all(&locks_dir)?;

        Ok(Self {
            data_dir,
            locks_dir,
            name: chunk::uniq_name(),
            active: Mutex::new(None),
            urgent: UrgentChunk::default(),
        })
    }

    pub fn from_options(options: &QueueOptions) -> Result<Self, QueueError> {
        Self::open(&options.root)
    }

    /// Name of the chunk this instance appends to.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn urgent_len(&self) -> usize {
        self.urgent.len()
    }

    /// Records an event. Durable events are on disk and flushed when this
    /// returns; urgent ones are only held in memory.
    pub fn append(&self, event: E, urgent: bool) -> Result<(), QueueError> {
        if urgent {
            self.urgent.push(event);
            return Ok(());
        }

        let line = serde_json::to_string(&event).map_err(QueueError::Encode)?;

        let mut active = self.active.lock().unwrap();
        if active.is_none() {
            *active = Some(ActiveStream::create(
                &self.data_path(&self.name),
                &self.lock_path(&self.name),
            )?);
        }

        if let Some(stream) = active.as_mut() {
            stream.write_line(&line)?;
        }

        Ok(())
    }

    /// Hands every urgent event to `consumer` at once. If the consumer fails
    /// the batch goes back to the front of the buffer and the error is only
    /// logged. Returns the number of events delivered.
    pub fn drain_urgent<F>(&self, consumer: F) -> usize
    where
        F: FnOnce(&[E]) -> CallbackResult<()>,
    {
        let batch = self.urgent.take();
        if batch.is_empty() {
            return 0;
        }

        match consumer(&batch) {
            Ok(()) => batch.len(),
            Err(err) => {
                tracing::debug!(events = batch.len(), "urgent consumer failed, events kept: {err:#}");
                self.urgent.release(batch);
                0
            }
        }
    }

    /// Feeds every closed chunk to `consumer`, in random order, deleting each
    /// chunk the consumer accepts. Problems with one chunk never end the
    /// sweep; only [`Sweep::Stop`] does.
    pub fn consume<F>(&self, mut consumer: F) -> ConsumeStats
    where
        F: FnMut(Vec<E>) -> CallbackResult<Sweep>,
    {
        let mut stats = ConsumeStats::default();

        let mut names = match chunk::list(&self.data_dir) {
            Ok(names) => names,
            Err(err) => {
                tracing::error!("couldn't list queue chunks: {err}");
                return stats;
            }
        };
        names.retain(|name| *name != self.name);
        names.shuffle(&mut rand::thread_rng());

        for name in names {
            match self.consume_chunk(&name, &mut consumer) {
                Ok(Some((Sweep::Continue, count))) => {
                    stats.chunks += 1;
                    stats.events += count;
                }
                Ok(Some((Sweep::Stop, _))) => {
                    stats.stopped = true;
                    break;
                }
                Ok(None) => stats.skipped += 1,
                Err(err) => {
                    tracing::error!(chunk = %name, "{err:#}");
                    stats.failed += 1;
                }
            }
        }

        tracing::debug!(?stats, "queue sweep finished");
        stats
    }

    /// `Ok(None)` when the chunk is locked by someone else, otherwise the
    /// consumer's verdict and the number of events it was given.
    fn consume_chunk<F>(&self, name: &str, consumer: &mut F) -> anyhow::Result<Option<(Sweep, usize)>>
    where
        F: FnMut(Vec<E>) -> CallbackResult<Sweep>,
    {
        let data_path = self.data_path(name);
        let lock_path = self.lock_path(name);

        let Some(lock) = chunk::try_lock(&lock_path)? else {
            return Ok(None);
        };

        if !data_path.exists() {
            // deleted by another consumer after we listed it
            chunk::remove(&lock_path)?;
            return Ok(None);
        }

        let events: Vec<E> = chunk::read_events(&data_path)?;
        let count = events.len();

        if count > 0 && consumer(events)? == Sweep::Stop {
            return Ok(Some((Sweep::Stop, count)));
        }

        chunk::remove(&data_path)?;
        chunk::remove(&lock_path)?;
        drop(lock);

        tracing::debug!(chunk = name, events = count, "consumed chunk");
        Ok(Some((Sweep::Continue, count)))
    }

    /// Removes lock files with no data file, keeps only the newest
    /// `max_items` chunks and empties the urgent buffer.
    pub fn cleanup(&self, max_items: usize) -> Result<CleanupStats, QueueError> {
        let mut stats = CleanupStats::default();

        let data = chunk::list(&self.data_dir)?;
        for name in chunk::list(&self.locks_dir)? {
            if data.contains(&name) || name == self.name {
                continue;
            }
            let lock_path = self.lock_path(&name);
            if let Some(lock) = chunk::try_lock(&lock_path)? {
                chunk::remove(&lock_path)?;
                drop(lock);
                stats.orphan_locks += 1;
            }
        }

        let mut data: Vec<String> = data.into_iter().filter(|name| *name != self.name).collect();
        data.sort();
        let excess = data.len().saturating_sub(max_items);

        for name in &data[..excess] {
            let lock_path = self.lock_path(name);
            let Some(lock) = chunk::try_lock(&lock_path)? else {
                continue;
            };
            chunk::remove(&self.data_path(name))?;
            chunk::remove(&lock_path)?;
            drop(lock);
            stats.trimmed += 1;
        }

        self.urgent.clear();

        if stats != CleanupStats::default() {
            tracing::info!(orphan_locks = stats.orphan_locks, trimmed = stats.trimmed, "queue cleaned up");
        }

        Ok(stats)
    }

    fn data_path(&self, name: &str) -> Utf8PathBuf {
        self.data_dir.join(name)
    }

    fn lock_path(&self, name: &str) -> Utf8PathBuf {
        self.locks_dir.join(name)
    }

    pub fn root(&self) -> &Utf8Path {
        self.data_dir.parent().unwrap_or(&self.data_dir)
    }
}
