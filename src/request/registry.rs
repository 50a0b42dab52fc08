use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace};

use crate::error::PvaError;
use crate::ids::{Cid, IdAllocator, Ioid};
use crate::protocol::messages::Response;
use crate::request::pending::PendingRequest;
use crate::request::RequestHandle;

struct Entry<R> {
    channel: Option<Cid>,
    request: Arc<R>,
}

struct Inner<R> {
    requests: FxHashMap<Ioid, Entry<R>>,
    by_channel: FxHashMap<Cid, FxHashSet<Ioid>>,
}

impl<R> Inner<R> {
    fn remove(&mut self, id: Ioid) -> Option<Entry<R>> {
        let entry = self.requests.remove(&id)?;
        if let Some(channel) = entry.channel {
            if let Some(ids) = self.by_channel.get_mut(&channel) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.by_channel.remove(&channel);
                }
            }
        }
        Some(entry)
    }
}

/// Maps request identifiers to live request handles, with an index by channel for bulk
///  teardown.
///
/// An entry is always removed from the maps before its handle is cancelled or completed, so a
///  concurrent lookup sees either the live handle or nothing. Cancellation callbacks run
///  outside the lock.
pub struct RequestRegistry<R: RequestHandle> {
    inner: Mutex<Inner<R>>,
    ids: IdAllocator,
}

impl<R: RequestHandle> Default for RequestRegistry<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: RequestHandle> RequestRegistry<R> {
    pub fn new() -> RequestRegistry<R> {
        RequestRegistry {
            inner: Mutex::new(Inner {
                requests: Default::default(),
                by_channel: Default::default(),
            }),
            ids: IdAllocator::default(),
        }
    }

    /// An identifier that is not live at the time of the call. Prefer [Self::register_new]
    ///  which allocates and registers atomically.
    pub fn allocate(&self) -> Result<Ioid, PvaError> {
        let inner = self.inner.lock();
        self.ids.allocate(|id| inner.requests.contains_key(&id))
    }

    pub fn register(&self, id: Ioid, request: Arc<R>) -> Result<(), PvaError> {
        self.insert(None, id, request)
    }

    pub fn register_for_channel(&self, channel: Cid, id: Ioid, request: Arc<R>) -> Result<(), PvaError> {
        self.insert(Some(channel), id, request)
    }

    fn insert(&self, channel: Option<Cid>, id: Ioid, request: Arc<R>) -> Result<(), PvaError> {
        let mut inner = self.inner.lock();
        if inner.requests.contains_key(&id) {
            return Err(PvaError::DuplicateId(id));
        }
        inner.requests.insert(id, Entry { channel, request });
        if let Some(channel) = channel {
            inner.by_channel.entry(channel).or_default().insert(id);
        }
        Ok(())
    }

    pub fn register_new(&self, channel: Option<Cid>, request: Arc<R>) -> Result<Ioid, PvaError> {
        let mut inner = self.inner.lock();
        let id = self.ids.allocate(|id| inner.requests.contains_key(&id))?;

        inner.requests.insert(id, Entry { channel, request });
        if let Some(channel) = channel {
            inner.by_channel.entry(channel).or_default().insert(id);
        }
        trace!(id, ?channel, "registered request");
        Ok(id)
    }

    pub fn lookup(&self, id: Ioid) -> Option<Arc<R>> {
        self.inner.lock()
            .requests
            .get(&id)
            .map(|e| e.request.clone())
    }

    pub fn unregister(&self, id: Ioid) -> Option<Arc<R>> {
        self.inner.lock()
            .remove(id)
            .map(|e| e.request)
    }

    /// Unregisters the request only if `predicate` holds for it, checking and removing in one
    ///  critical section
    pub fn unregister_if(&self, id: Ioid, predicate: impl FnOnce(&R) -> bool) -> Option<Arc<R>> {
        let mut inner = self.inner.lock();
        if !predicate(&inner.requests.get(&id)?.request) {
            return None;
        }
        inner.remove(id).map(|e| e.request)
    }

    /// Unregisters every request of a channel and cancels them with `reason`. Returns the
    ///  number of requests that were cancelled.
    pub fn destroy_channel(&self, channel: Cid, reason: &PvaError) -> usize {
        let removed = {
            let mut inner = self.inner.lock();
            let ids = inner.by_channel.remove(&channel).unwrap_or_default();
            ids.into_iter()
                .flat_map(|id| inner.requests.remove(&id))
                .map(|e| e.request)
                .collect::<Vec<_>>()
        };

        if !removed.is_empty() {
            debug!(channel, count = removed.len(), %reason, "cancelling requests of channel");
        }
        for request in &removed {
            request.cancel(reason);
        }
        removed.len()
    }

    /// Unregisters and cancels everything
    pub fn cancel_all(&self, reason: &PvaError) -> usize {
        let removed = {
            let mut inner = self.inner.lock();
            inner.by_channel.clear();
            inner.requests.drain()
                .map(|(_, e)| e.request)
                .collect::<Vec<_>>()
        };

        for request in &removed {
            request.cancel(reason);
        }
        removed.len()
    }

    /// ids of a channel's live requests
    pub fn channel_requests(&self, channel: Cid) -> Vec<Ioid> {
        self.inner.lock()
            .by_channel
            .get(&channel)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RequestRegistry<PendingRequest> {
    /// Delivers a response to the request registered under `id`. A final response unregisters
    ///  the request in the same critical section as the lookup. Returns false if no request is
    ///  registered, which happens regularly when responses race with cancellation.
    pub fn deliver(&self, id: Ioid, response: Response) -> bool {
        let request = {
            let mut inner = self.inner.lock();
            let Some(entry) = inner.requests.get(&id) else {
                return false;
            };
            let request = entry.request.clone();
            if request.is_final(&response) {
                inner.remove(id);
            }
            request
        };

        request.deliver(response);
        true
    }
}
