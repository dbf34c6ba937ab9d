use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

use crate::cache::RemoteStore;
use crate::core::Hash32;
use crate::error::{TransportError, TransportErrorKind};

/// Bounds every call of the wrapped store. A call still running when the
/// deadline passes is abandoned on its worker thread and reported as
/// [`TransportErrorKind::Timeout`].
///
/// Abandoned workers are detached, not cancelled: each keeps running until
/// the store returns. Behind a [`CacheClient`](crate::cache::CacheClient)
/// their number is bounded by `max_retries` per call, after which the client
/// disables itself and stops issuing calls.
pub struct Deadline<S> {
    inner: Arc<S>,
    timeout: Duration,
}

impl<S> Deadline<S>
where
    S: RemoteStore + 'static,
{
    pub fn new(inner: S, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(inner),
            timeout,
        }
    }

    fn run<T, F>(&self, name: &str, op: F) -> Result<T, TransportError>
    where
        T: Send + 'static,
        F: FnOnce(&S) -> Result<T, TransportError> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let inner = Arc::clone(&self.inner);

        std::thread::Builder::new()
            .name(format!("cache-{name}"))
            .spawn(move || {
                let _ = tx.send(op(&*inner));
            })?;

        match rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(TransportError::new(
                TransportErrorKind::Timeout,
                format!("{name} did not finish within {:?}", self.timeout),
            )),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::new(
                TransportErrorKind::Other,
                format!("{name} worker exited without a result"),
            )),
        }
    }
}

impl<S> RemoteStore for Deadline<S>
where
    S: RemoteStore + 'static,
{
    fn has(&self, uid: &Hash32) -> Result<bool, TransportError> {
        let uid = *uid;
        self.run("has", move |store| store.has(&uid))
    }

    fn get(&self, uid: &Hash32) -> Result<Option<Vec<u8>>, TransportError> {
        let uid = *uid;
        self.run("get", move |store| store.get(&uid))
    }

    fn put(&self, uid: &Hash32, data: &[u8]) -> Result<(), TransportError> {
        let uid = *uid;
        let data = data.to_vec();
        self.run("put", move |store| store.put(&uid, &data))
    }
}
