//! Artifact cache keyed by node UID.
//!
//! A cache miss is always safe (the node is rebuilt) while a cache error must
//! never stall or fail the build. [`CacheClient`] therefore retries a bounded
//! number of times and then switches itself off for the rest of the process,
//! and [`ArtifactCache`] turns whatever is left into plain misses.

pub mod deadline;
pub mod local;
pub mod retry;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::CacheOptions;
use crate::core::Hash32;
use crate::error::TransportError;

pub use deadline::Deadline;
pub use local::LocalStore;
pub use retry::RetryPolicy;

/// The remote operations the build actually needs.
pub trait RemoteStore: Send + Sync {
    fn has(&self, uid: &Hash32) -> Result<bool, TransportError>;
    fn get(&self, uid: &Hash32) -> Result<Option<Vec<u8>>, TransportError>;
    fn put(&self, uid: &Hash32, data: &[u8]) -> Result<(), TransportError>;
}

impl<S: RemoteStore + ?Sized> RemoteStore for Box<S> {
    fn has(&self, uid: &Hash32) -> Result<bool, TransportError> {
        (**self).has(uid)
    }

    fn get(&self, uid: &Hash32) -> Result<Option<Vec<u8>>, TransportError> {
        (**self).get(uid)
    }

    fn put(&self, uid: &Hash32, data: &[u8]) -> Result<(), TransportError> {
        (**self).put(uid, data)
    }
}

impl<S: RemoteStore + ?Sized> RemoteStore for Arc<S> {
    fn has(&self, uid: &Hash32) -> Result<bool, TransportError> {
        (**self).has(uid)
    }

    fn get(&self, uid: &Hash32) -> Result<Option<Vec<u8>>, TransportError> {
        (**self).get(uid)
    }

    fn put(&self, uid: &Hash32, data: &[u8]) -> Result<(), TransportError> {
        (**self).put(uid, data)
    }
}

const WARNING_LIMIT: usize = 100;

/// Retrying, self-disabling decorator over a [`RemoteStore`].
pub struct CacheClient<S> {
    store: S,
    policy: RetryPolicy,
    disabled: AtomicBool,
}

impl<S: RemoteStore> CacheClient<S> {
    pub fn new(store: S, policy: RetryPolicy) -> Self {
        Self {
            store,
            policy,
            disabled: AtomicBool::new(false),
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    /// Runs one named call under the retry policy. Once the client is
    /// disabled, by this call or any other thread, every further attempt
    /// fails immediately without touching the store.
    pub fn call<T, F>(&self, name: &str, mut op: F) -> Result<T, TransportError>
    where
        F: FnMut(&S) -> Result<T, TransportError>,
    {
        self.policy
            .execute(name, || {
                if self.is_disabled() {
                    return Err(TransportError::disabled());
                }
                op(&self.store)
            })
            .inspect_err(|err| self.trip(name, err))
    }

    fn trip(&self, name: &str, err: &TransportError) {
        if self.disabled.swap(true, Ordering::AcqRel) {
            return;
        }

        let text = err.to_string();
        let short: String = text.chars().take(WARNING_LIMIT).collect();
        tracing::warn!("Disabling distributed cache. Last caught error: {short}...");
        tracing::debug!(call = name, "distributed cache disabled by: {text}");
    }
}

impl<S: RemoteStore> RemoteStore for CacheClient<S> {
    fn has(&self, uid: &Hash32) -> Result<bool, TransportError> {
        self.call("has", |store| store.has(uid))
    }

    fn get(&self, uid: &Hash32) -> Result<Option<Vec<u8>>, TransportError> {
        self.call("get", |store| store.get(uid))
    }

    fn put(&self, uid: &Hash32, data: &[u8]) -> Result<(), TransportError> {
        self.call("put", |store| store.put(uid, data))
    }
}

/// Fail-open view of the cache: errors read as misses.
pub struct ArtifactCache {
    client: CacheClient<Box<dyn RemoteStore>>,
}

impl ArtifactCache {
    /// Wraps `store` with the configured retry policy and, when a timeout is
    /// set, a per-call deadline.
    pub fn new(store: impl RemoteStore + 'static, options: &CacheOptions) -> Self {
        let store: Box<dyn RemoteStore> = match options.timeout() {
            Some(timeout) => Box::new(Deadline::new(store, timeout)),
            None => Box::new(store),
        };

        Self {
            client: CacheClient::new(store, RetryPolicy::from_options(options)),
        }
    }

    pub fn contains(&self, uid: &Hash32) -> bool {
        self.client.has(uid).unwrap_or(false)
    }

    pub fn lookup(&self, uid: &Hash32) -> Option<Vec<u8>> {
        match self.client.get(uid) {
            Ok(found) => found,
            Err(err) => {
                tracing::debug!(%uid, %err, "cache lookup treated as miss");
                None
            }
        }
    }

    /// Returns whether the artifact was stored.
    pub fn store(&self, uid: &Hash32, data: &[u8]) -> bool {
        match self.client.put(uid, data) {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!(%uid, %err, "cache store skipped");
                false
            }
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.client.is_disabled()
    }
}
