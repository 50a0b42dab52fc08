use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::beacon::tracker::{BeaconListener, BeaconTracker};

pub mod tracker;

/// One tracker per server address a context received beacons from
pub struct BeaconTrackerMap {
    trackers: Mutex<FxHashMap<SocketAddr, Arc<BeaconTracker>>>,
    listener: Weak<dyn BeaconListener>,
}

impl BeaconTrackerMap {
    pub fn new(listener: Weak<dyn BeaconListener>) -> BeaconTrackerMap {
        BeaconTrackerMap {
            trackers: Default::default(),
            listener,
        }
    }

    pub fn get_or_create(&self, server_addr: SocketAddr) -> Arc<BeaconTracker> {
        self.trackers.lock()
            .entry(server_addr)
            .or_insert_with(|| Arc::new(BeaconTracker::new(server_addr, self.listener.clone())))
            .clone()
    }

    pub fn get(&self, server_addr: SocketAddr) -> Option<Arc<BeaconTracker>> {
        self.trackers.lock()
            .get(&server_addr)
            .cloned()
    }

    pub fn remove(&self, server_addr: SocketAddr) -> Option<Arc<BeaconTracker>> {
        self.trackers.lock()
            .remove(&server_addr)
    }

    pub fn clear(&self) {
        self.trackers.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.trackers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
