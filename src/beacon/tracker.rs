use std::net::SocketAddr;
use std::sync::Weak;
use std::time::Instant;

#[cfg(test)] use mockall::automock;
use parking_lot::Mutex;
use tracing::{debug, info, trace};

use crate::protocol::guid::ServerGuid;

/// What a beacon tells about the server that sent it, compared to the previous beacon
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum BeaconChange {
    /// first beacon from this address
    FirstSeen,
    Unchanged,
    /// same server process, but its change counter moved
    TopologyChanged,
    /// a different server process is running at this address
    Restarted,
}

impl BeaconChange {
    pub fn is_network_change(self) -> bool {
        matches!(self, BeaconChange::TopologyChanged | BeaconChange::Restarted)
    }

    pub fn signals_new_server(self) -> bool {
        !matches!(self, BeaconChange::Unchanged)
    }
}

/// Callbacks into whoever owns the tracker (the client context). They are invoked after the
///  tracker's lock is released, so it is fine to call back into the tracker.
#[cfg_attr(test, automock)]
pub trait BeaconListener: Send + Sync + 'static {
    /// a server announced itself or changed - unresolved channels should be searched for
    fn new_server_detected(&self, server_addr: SocketAddr);
    /// the server process at this address was replaced
    fn server_restarted(&self, server_addr: SocketAddr);
}

#[derive(Debug)]
struct TrackedState {
    first_seen: bool,
    guid: ServerGuid,
    change_count: u16,
    last_sequence_id: u16,
    remote_revision: u8,
    last_beacon: Option<Instant>,
}

/// Detects new, changed and restarted servers from the beacons of one server address.
///
/// Beacons are datagrams: they may be lost, duplicated or reordered. Comparisons are therefore
///  for equality only, the sequence id is merely recorded for diagnostics.
pub struct BeaconTracker {
    server_addr: SocketAddr,
    state: Mutex<TrackedState>,
    listener: Weak<dyn BeaconListener>,
}

impl BeaconTracker {
    pub fn new(server_addr: SocketAddr, listener: Weak<dyn BeaconListener>) -> BeaconTracker {
        BeaconTracker {
            server_addr,
            state: Mutex::new(TrackedState {
                first_seen: true,
                guid: ServerGuid::default(),
                change_count: 0,
                last_sequence_id: 0,
                remote_revision: 0,
                last_beacon: None,
            }),
            listener,
        }
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub fn notify(&self, remote_revision: u8, timestamp: Instant, guid: ServerGuid, sequence_id: u16, change_count: u16) -> BeaconChange {
        let change = {
            let mut state = self.state.lock();

            let change = if state.first_seen {
                state.first_seen = false;
                BeaconChange::FirstSeen
            }
            else if state.guid != guid {
                BeaconChange::Restarted
            }
            else if state.change_count != change_count {
                BeaconChange::TopologyChanged
            }
            else {
                BeaconChange::Unchanged
            };

            state.guid = guid;
            state.change_count = change_count;
            state.last_sequence_id = sequence_id;
            state.remote_revision = remote_revision;
            state.last_beacon = Some(timestamp);
            change
        };

        match change {
            BeaconChange::Unchanged => trace!(server = ?self.server_addr, sequence_id, "beacon"),
            BeaconChange::FirstSeen => debug!(server = ?self.server_addr, ?guid, change_count, "first beacon from server"),
            BeaconChange::TopologyChanged => debug!(server = ?self.server_addr, change_count, "server reported a change"),
            BeaconChange::Restarted => info!(server = ?self.server_addr, ?guid, "server restarted"),
        }

        if change.signals_new_server() {
            // the owning context may be gone already
            if let Some(listener) = self.listener.upgrade() {
                listener.new_server_detected(self.server_addr);
                if change == BeaconChange::Restarted {
                    listener.server_restarted(self.server_addr);
                }
            }
        }
        change
    }

    /// (guid, change count) of the last beacon, `None` before the first beacon
    pub fn identity(&self) -> Option<(ServerGuid, u16)> {
        let state = self.state.lock();
        if state.first_seen {
            None
        }
        else {
            Some((state.guid, state.change_count))
        }
    }

    pub fn last_beacon(&self) -> Option<Instant> {
        self.state.lock().last_beacon
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use mockall::predicate::eq;
    use rstest::rstest;

    use super::*;
    use crate::test_util::{test_addr, test_guid};

    fn tracker_with(listener: &Arc<MockBeaconListener>) -> BeaconTracker {
        let weak: Weak<MockBeaconListener> = Arc::downgrade(listener);
        BeaconTracker::new(test_addr(1), weak)
    }

    #[test]
    fn test_first_beacon() {
        let mut listener = MockBeaconListener::new();
        listener.expect_new_server_detected()
            .with(eq(test_addr(1)))
            .once()
            .return_const(());
        listener.expect_server_restarted()
            .never();
        let listener = Arc::new(listener);

        let tracker = tracker_with(&listener);
        assert_eq!(tracker.identity(), None);

        let change = tracker.notify(2, Instant::now(), test_guid(1), 0, 0);
        assert_eq!(change, BeaconChange::FirstSeen);
        assert!(!change.is_network_change());
        assert_eq!(tracker.identity(), Some((test_guid(1), 0)));
    }

    #[test]
    fn test_identical_beacon_signals_nothing() {
        let mut listener = MockBeaconListener::new();
        listener.expect_new_server_detected()
            .once()
            .return_const(());
        listener.expect_server_restarted()
            .never();
        let listener = Arc::new(listener);

        let tracker = tracker_with(&listener);
        tracker.notify(2, Instant::now(), test_guid(1), 0, 3);
        let change = tracker.notify(2, Instant::now(), test_guid(1), 1, 3);
        assert_eq!(change, BeaconChange::Unchanged);
        assert!(!change.is_network_change());
        assert!(!change.signals_new_server());
    }

    #[test]
    fn test_scenario_topology_change_then_restart() {
        let mut listener = MockBeaconListener::new();
        listener.expect_new_server_detected()
            .with(eq(test_addr(1)))
            .times(3)
            .return_const(());
        listener.expect_server_restarted()
            .with(eq(test_addr(1)))
            .once()
            .return_const(());
        let listener = Arc::new(listener);

        let tracker = tracker_with(&listener);

        assert_eq!(tracker.notify(2, Instant::now(), test_guid(1), 0, 0), BeaconChange::FirstSeen);
        assert_eq!(tracker.identity(), Some((test_guid(1), 0)));

        let change = tracker.notify(2, Instant::now(), test_guid(1), 1, 1);
        assert_eq!(change, BeaconChange::TopologyChanged);
        assert!(change.is_network_change());
        assert_eq!(tracker.identity(), Some((test_guid(1), 1)));

        let change = tracker.notify(2, Instant::now(), test_guid(2), 0, 0);
        assert_eq!(change, BeaconChange::Restarted);
        assert!(change.is_network_change());
        assert_eq!(tracker.identity(), Some((test_guid(2), 0)));
    }

    #[rstest]
    #[case::same_count(5, BeaconChange::Restarted)]
    #[case::different_count(6, BeaconChange::Restarted)]
    fn test_guid_change_wins_over_count(#[case] change_count: u16, #[case] expected: BeaconChange) {
        let mut listener = MockBeaconListener::new();
        listener.expect_new_server_detected().return_const(());
        listener.expect_server_restarted().once().return_const(());
        let listener = Arc::new(listener);

        let tracker = tracker_with(&listener);
        tracker.notify(2, Instant::now(), test_guid(1), 0, 5);
        assert_eq!(tracker.notify(2, Instant::now(), test_guid(2), 1, change_count), expected);
    }

    #[test]
    fn test_out_of_order_sequence_ids_are_ignored() {
        let mut listener = MockBeaconListener::new();
        listener.expect_new_server_detected().once().return_const(());
        let listener = Arc::new(listener);

        let tracker = tracker_with(&listener);
        tracker.notify(2, Instant::now(), test_guid(1), 10, 0);
        assert_eq!(tracker.notify(2, Instant::now(), test_guid(1), 9, 0), BeaconChange::Unchanged);
        assert_eq!(tracker.notify(2, Instant::now(), test_guid(1), 10, 0), BeaconChange::Unchanged);
    }

    #[test]
    fn test_dropped_listener() {
        let listener = Arc::new(MockBeaconListener::new());
        let tracker = tracker_with(&listener);
        drop(listener);

        assert_eq!(tracker.notify(2, Instant::now(), test_guid(1), 0, 0), BeaconChange::FirstSeen);
        assert_eq!(tracker.notify(2, Instant::now(), test_guid(2), 0, 0), BeaconChange::Restarted);
    }
}
