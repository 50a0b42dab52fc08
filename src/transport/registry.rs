use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, trace, warn};

use crate::error::PvaError;
use crate::transport::{Connector, Transport, TransportHooks, TransportKey};

/// All live transports of a context, keyed by (address, priority), with at most one transport
///  per key.
///
/// Reads go to an immutable snapshot of the map and never block. Writes copy the map under a
///  lock and swap in the new version. Establishing a new connection is serialized per key by
///  [Reservation]s.
pub struct TransportRegistry {
    transports: ArcSwap<FxHashMap<TransportKey, Arc<dyn Transport>>>,
    write_lock: Mutex<()>,
    reservations: Mutex<FxHashMap<TransportKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportRegistry {
    pub fn new() -> TransportRegistry {
        TransportRegistry {
            transports: ArcSwap::from_pointee(FxHashMap::default()),
            write_lock: Mutex::new(()),
            reservations: Default::default(),
        }
    }

    pub fn get(&self, addr: SocketAddr, priority: u16) -> Option<Arc<dyn Transport>> {
        self.transports.load()
            .get(&TransportKey::new(addr, priority))
            .cloned()
    }

    pub fn install(&self, transport: Arc<dyn Transport>) -> Result<(), PvaError> {
        let key = transport.key();

        let _write_guard = self.write_lock.lock();
        let current = self.transports.load();
        if current.contains_key(&key) {
            warn!(?key, "attempt to install a second transport - this is a bug");
            return Err(PvaError::TransportConflict(key));
        }

        let mut updated = (**current).clone();
        updated.insert(key, transport);
        self.transports.store(Arc::new(updated));
        trace!(?key, "installed transport");
        Ok(())
    }

    /// Removes this specific transport instance. Returns false if it is not (or no longer)
    ///  registered, even if a different transport is registered under the same key.
    pub fn remove(&self, transport: &Arc<dyn Transport>) -> bool {
        let key = transport.key();

        let _write_guard = self.write_lock.lock();
        let current = self.transports.load();
        match current.get(&key) {
            Some(registered) if std::ptr::addr_eq(Arc::as_ptr(registered), Arc::as_ptr(transport)) => {
                let mut updated = (**current).clone();
                updated.remove(&key);
                self.transports.store(Arc::new(updated));
                trace!(?key, "removed transport");
                true
            }
            _ => false,
        }
    }

    /// snapshot of registered transports, optionally only those to a given address (across
    ///  all priorities)
    pub fn to_vec(&self, filter: Option<SocketAddr>) -> Vec<Arc<dyn Transport>> {
        self.transports.load()
            .iter()
            .filter(|(key, _)| filter.map_or(true, |addr| key.addr == addr))
            .map(|(_, transport)| transport.clone())
            .collect()
    }

    /// removes all transports, returning them
    pub fn clear(&self) -> Vec<Arc<dyn Transport>> {
        let _write_guard = self.write_lock.lock();
        let previous = self.transports.swap(Arc::new(FxHashMap::default()));
        previous.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.transports.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits until no other reservation for `key` is held. Reservations for different keys are
    ///  independent.
    pub async fn reserve(&self, key: TransportKey) -> Reservation<'_> {
        let mutex = self.reservations.lock()
            .entry(key)
            .or_default()
            .clone();

        let guard = mutex.lock_owned().await;
        Reservation {
            registry: self,
            key,
            guard: Some(guard),
        }
    }

    /// Returns the transport for `key` with one more attached client, reusing a registered
    ///  transport or establishing a new one through `connector`. Concurrent calls for the same
    ///  key perform at most one handshake. A failed attempt leaves nothing behind, so the next
    ///  caller tries again.
    pub async fn connect(&self, connector: &dyn Connector, key: TransportKey, hooks: TransportHooks, timeout: Duration) -> Result<Arc<dyn Transport>, PvaError> {
        let _reservation = self.reserve(key).await;

        if let Some(existing) = self.get(key.addr, key.priority) {
            if !existing.is_closed() {
                let clients = existing.attach_client();
                trace!(?key, clients, "reusing transport");
                return Ok(existing);
            }
            // closed, but the close notification has not removed it yet
            self.remove(&existing);
        }

        debug!(?key, "establishing transport");
        let transport = match tokio::time::timeout(timeout, connector.connect(key.addr, key.priority, hooks)).await {
            Ok(Ok(transport)) => transport,
            Ok(Err(e)) => {
                warn!(?key, error = %e, "connecting failed");
                return Err(PvaError::ConnectFailed { addr: key.addr, reason: e.to_string() });
            }
            Err(_) => {
                warn!(?key, ?timeout, "connecting timed out");
                return Err(PvaError::ConnectFailed { addr: key.addr, reason: format!("timed out after {:?}", timeout) });
            }
        };

        if let Err(e) = self.install(transport.clone()) {
            transport.close();
            return Err(e);
        }
        transport.attach_client();
        Ok(transport)
    }
}

/// Exclusive right to establish a connection for one key, released on drop
pub struct Reservation<'a> {
    registry: &'a TransportRegistry,
    key: TransportKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Reservation<'_> {
    pub fn key(&self) -> TransportKey {
        self.key
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());

        // the map's reference is the only one left if nobody holds or waits for this key
        let mut reservations = self.registry.reservations.lock();
        if let Some(mutex) = reservations.get(&self.key) {
            if Arc::strong_count(mutex) == 1 {
                reservations.remove(&self.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::test_util::transport::{detached_hooks, CountingConnector, RecordingTransport};
    use crate::test_util::test_addr;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn transport(n: u8, priority: u16) -> Arc<dyn Transport> {
        RecordingTransport::new(test_addr(n), priority)
    }

    #[test]
    fn test_install_conflict() {
        let registry = TransportRegistry::new();
        let first = transport(1, 0);
        let second = transport(1, 0);

        registry.install(first.clone()).unwrap();
        assert_eq!(registry.install(second.clone()), Err(PvaError::TransportConflict(TransportKey::new(test_addr(1), 0))));

        let registered = registry.get(test_addr(1), 0).unwrap();
        assert!(std::ptr::addr_eq(Arc::as_ptr(&registered), Arc::as_ptr(&first)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_different_priorities_coexist() {
        let registry = TransportRegistry::new();
        registry.install(transport(1, 0)).unwrap();
        registry.install(transport(1, 1)).unwrap();
        assert_eq!(registry.len(), 2);
        assert!(registry.get(test_addr(1), 2).is_none());
    }

    #[test]
    fn test_remove_by_identity() {
        let registry = TransportRegistry::new();
        let first = transport(1, 0);
        let replacement = transport(1, 0);

        registry.install(first.clone()).unwrap();
        assert!(registry.remove(&first));
        assert!(!registry.remove(&first));

        registry.install(replacement.clone()).unwrap();
        assert!(!registry.remove(&first));
        assert!(registry.get(test_addr(1), 0).is_some());
        assert!(registry.remove(&replacement));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_to_vec_filter() {
        let registry = TransportRegistry::new();
        registry.install(transport(1, 0)).unwrap();
        registry.install(transport(1, 5)).unwrap();
        registry.install(transport(2, 0)).unwrap();

        assert_eq!(registry.to_vec(None).len(), 3);
        let filtered = registry.to_vec(Some(test_addr(1)));
        assert_eq!(filtered.len(), 2);
        assert!(filtered.iter().all(|t| t.remote_addr() == test_addr(1)));
        assert!(registry.to_vec(Some(test_addr(3))).is_empty());

        assert_eq!(registry.clear().len(), 3);
        assert!(registry.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_connects_share_one_transport() {
        let registry = Arc::new(TransportRegistry::new());
        let connector = Arc::new(CountingConnector::with_delay(Duration::from_millis(50)));
        let key = TransportKey::new(test_addr(1), 0);

        let handles = (0..10)
            .map(|_| {
                let registry = registry.clone();
                let connector = connector.clone();
                tokio::spawn(async move {
                    registry.connect(connector.as_ref(), key, detached_hooks(), TIMEOUT).await
                })
            })
            .collect::<Vec<_>>();

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(connector.connect_count(), 1);
        assert_eq!(registry.len(), 1);
        let first = &results[0];
        assert!(results.iter().all(|t| std::ptr::addr_eq(Arc::as_ptr(t), Arc::as_ptr(first))));
        assert_eq!(connector.transports()[0].clients(), 10);

        assert!(registry.reservations.lock().is_empty());
    }

    #[tokio::test]
    async fn test_failed_connect_is_not_cached() {
        let registry = TransportRegistry::new();
        let connector = CountingConnector::new();
        let key = TransportKey::new(test_addr(1), 0);

        connector.set_failing(true);
        let result = registry.connect(&connector, key, detached_hooks(), TIMEOUT).await;
        assert!(matches!(result, Err(PvaError::ConnectFailed { addr, .. }) if addr == test_addr(1)));
        assert!(registry.is_empty());

        connector.set_failing(false);
        registry.connect(&connector, key, detached_hooks(), TIMEOUT).await.unwrap();
        assert_eq!(connector.connect_count(), 2);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let registry = TransportRegistry::new();
        let connector = CountingConnector::with_delay(Duration::from_secs(60));
        let key = TransportKey::new(test_addr(1), 0);

        let result = registry.connect(&connector, key, detached_hooks(), Duration::from_secs(1)).await;
        assert!(matches!(result, Err(PvaError::ConnectFailed { .. })));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_closed_transport_is_replaced() {
        let registry = TransportRegistry::new();
        let connector = CountingConnector::new();
        let key = TransportKey::new(test_addr(1), 0);

        let first = registry.connect(&connector, key, detached_hooks(), TIMEOUT).await.unwrap();
        first.close();

        let second = registry.connect(&connector, key, detached_hooks(), TIMEOUT).await.unwrap();
        assert!(!std::ptr::addr_eq(Arc::as_ptr(&first), Arc::as_ptr(&second)));
        assert_eq!(connector.connect_count(), 2);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reservation_excludes_same_key_only() {
        let registry = Arc::new(TransportRegistry::new());
        let key_1 = TransportKey::new(test_addr(1), 0);
        let key_2 = TransportKey::new(test_addr(2), 0);

        let reservation = registry.reserve(key_1).await;

        // a different key is not blocked
        let other = registry.reserve(key_2).await;
        drop(other);

        let acquired = Arc::new(AtomicBool::new(false));
        let handle = {
            let registry = registry.clone();
            let acquired = acquired.clone();
            tokio::spawn(async move {
                let _r = registry.reserve(key_1).await;
                acquired.store(true, Ordering::SeqCst);
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!acquired.load(Ordering::SeqCst));

        drop(reservation);
        handle.await.unwrap();
        assert!(acquired.load(Ordering::SeqCst));
        assert!(registry.reservations.lock().is_empty());
    }
}
