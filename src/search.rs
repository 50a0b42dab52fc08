use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
#[cfg(test)] use mockall::automock;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

use crate::config::ContextConfig;
use crate::ids::Cid;
use crate::protocol::command::Command;
use crate::protocol::header::{encode_message, HeaderFlags, HEADER_SIZE};
use crate::protocol::messages::{SearchRequest, PROTOCOL_TCP};
use crate::util::backoff::ExponentialBackoff;

/// search datagrams are kept below a typical ethernet MTU
pub const MAX_SEARCH_DATAGRAM: usize = 1440;

/// Where search requests go - a UDP endpoint in production
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SearchSender: Send + Sync + 'static {
    /// the address servers should send their responses to
    fn response_address(&self) -> SocketAddr;
    async fn send_search(&self, msg: Bytes) -> anyhow::Result<()>;
}

struct SearchEntry {
    name: String,
    backoff: ExponentialBackoff,
    reset: bool,
}

/// Channels that are not resolved to a server yet. They are searched for periodically with
///  growing gaps, and all of them are searched for right away when a new server shows up.
pub struct SearchManager {
    sender: Arc<dyn SearchSender>,
    pending: Mutex<FxHashMap<Cid, SearchEntry>>,
    sequence_id: AtomicU32,

    backoff_initial_ticks: u32,
    backoff_max_ticks: u32,
    backoff_factor_eighths: u32,
}

impl SearchManager {
    pub fn new(config: &ContextConfig, sender: Arc<dyn SearchSender>) -> SearchManager {
        SearchManager {
            sender,
            pending: Default::default(),
            sequence_id: AtomicU32::new(1),
            backoff_initial_ticks: config.search_backoff_initial_ticks,
            backoff_max_ticks: config.search_backoff_max_ticks,
            backoff_factor_eighths: config.search_backoff_factor_eighths,
        }
    }

    /// starts searching for a channel on the next tick
    pub fn register(&self, cid: Cid, name: &str) {
        let entry = SearchEntry {
            name: name.to_string(),
            backoff: ExponentialBackoff::new(self.backoff_initial_ticks, self.backoff_max_ticks, self.backoff_factor_eighths),
            reset: true,
        };
        if self.pending.lock().insert(cid, entry).is_none() {
            trace!(cid, name, "searching for channel");
        }
    }

    pub fn unregister(&self, cid: Cid) -> bool {
        self.pending.lock().remove(&cid).is_some()
    }

    pub fn is_pending(&self, cid: Cid) -> bool {
        self.pending.lock().contains_key(&cid)
    }

    pub fn num_pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// every pending channel is searched for on the next tick, and back-off starts over
    pub fn boost(&self) {
        let mut pending = self.pending.lock();
        debug!(num_channels = pending.len(), "boosting channel search");
        for entry in pending.values_mut() {
            entry.reset = true;
        }
    }

    fn due_channels(&self) -> Vec<(Cid, String)> {
        let mut pending = self.pending.lock();
        let mut due = pending.iter_mut()
            .filter_map(|(cid, entry)| {
                let reset = std::mem::take(&mut entry.reset);
                entry.backoff.should_send(reset)
                    .then(|| (*cid, entry.name.clone()))
            })
            .collect::<Vec<_>>();
        due.sort_by_key(|(cid, _)| *cid);
        due
    }

    /// Packs channels into as few datagrams as possible
    fn encode_requests(&self, channels: Vec<(Cid, String)>) -> Vec<Bytes> {
        let max_payload = MAX_SEARCH_DATAGRAM - HEADER_SIZE;
        let response_address = self.sender.response_address();

        let mut result = Vec::new();
        let mut batch = Vec::new();
        let mut batch_len = SearchRequest::fixed_len();

        let mut flush = |batch: &mut Vec<(Cid, String)>| {
            let request = SearchRequest {
                sequence_id: self.sequence_id.fetch_add(1, Ordering::Relaxed),
                flags: 0,
                response_address,
                protocols: vec![PROTOCOL_TCP.to_string()],
                channels: std::mem::take(batch),
            };
            let mut payload = BytesMut::new();
            request.ser(&mut payload);
            result.push(encode_message(Command::Search, HeaderFlags::empty(), &payload));
        };

        for (cid, name) in channels {
            let entry_len = SearchRequest::channel_entry_len(&name);
            if !batch.is_empty() && (batch_len + entry_len > max_payload || batch.len() == u16::MAX as usize) {
                flush(&mut batch);
                batch_len = SearchRequest::fixed_len();
            }
            batch_len += entry_len;
            batch.push((cid, name));
        }
        if !batch.is_empty() {
            flush(&mut batch);
        }
        result
    }

    /// Sends search requests for all channels that are due, returning the number of channels
    pub async fn tick(&self) -> anyhow::Result<usize> {
        let due = self.due_channels();
        if due.is_empty() {
            return Ok(0);
        }

        let num_channels = due.len();
        let messages = self.encode_requests(due);
        trace!(num_channels, num_messages = messages.len(), "sending search requests");
        for msg in messages {
            self.sender.send_search(msg).await?;
        }
        Ok(num_channels)
    }

    pub fn spawn_timer(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let search = Arc::downgrade(self);
        tokio::spawn(Self::timer_loop(search, period))
    }

    async fn timer_loop(search: Weak<SearchManager>, period: Duration) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            let Some(search) = search.upgrade() else {
                break;
            };
            if let Err(e) = search.tick().await {
                warn!("error sending search requests: {}", e);
            }
        }
        debug!("search timer stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;
    use crate::protocol::header::MessageHeader;

    fn response_address() -> SocketAddr {
        SocketAddr::from_str("0.0.0.0:40000").unwrap()
    }

    fn decode(mut msg: Bytes) -> SearchRequest {
        let header = MessageHeader::try_deser(&mut msg).unwrap();
        assert_eq!(header.command, u8::from(Command::Search));
        assert_eq!(header.payload_size as usize, msg.len());
        SearchRequest::try_deser(&mut msg).unwrap()
    }

    fn manager_with(sender: MockSearchSender) -> SearchManager {
        let mut config = ContextConfig::new();
        config.search_backoff_initial_ticks = 1;
        config.search_backoff_max_ticks = 4;
        config.search_backoff_factor_eighths = 16;
        SearchManager::new(&config, Arc::new(sender))
    }

    fn recording_sender() -> (MockSearchSender, Arc<Mutex<Vec<SearchRequest>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let mut sender = MockSearchSender::new();
        sender.expect_response_address().return_const(response_address());
        let sent_clone = sent.clone();
        sender.expect_send_search()
            .returning(move |msg| {
                sent_clone.lock().push(decode(msg));
                Ok(())
            });
        (sender, sent)
    }

    #[tokio::test]
    async fn test_register_sends_on_next_tick() {
        let mut sender = MockSearchSender::new();
        sender.expect_response_address().return_const(response_address());
        sender.expect_send_search()
            .withf(|msg| {
                let request = decode(msg.clone());
                request.channels == vec![(1, "a".to_string()), (2, "b".to_string())]
                    && request.response_address == response_address()
                    && request.protocols == vec![PROTOCOL_TCP.to_string()]
            })
            .once()
            .returning(|_| Ok(()));

        let search = manager_with(sender);
        search.register(2, "b");
        search.register(1, "a");
        assert_eq!(search.tick().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_backoff_and_boost() {
        let (sender, sent) = recording_sender();
        let search = manager_with(sender);
        search.register(1, "a");

        let mut ticks_with_search = Vec::new();
        for tick in 0..12 {
            if search.tick().await.unwrap() > 0 {
                ticks_with_search.push(tick);
            }
        }
        // gaps of 1, 2, 4 ticks, then capped at 4
        assert_eq!(ticks_with_search, vec![0, 1, 3, 7, 11]);

        search.boost();
        assert_eq!(search.tick().await.unwrap(), 1);
        assert_eq!(search.tick().await.unwrap(), 1);
        assert_eq!(search.tick().await.unwrap(), 0);

        let sent = sent.lock();
        assert_eq!(sent.len(), 7);
        // every round has its own sequence id
        assert!(sent.windows(2).all(|w| w[0].sequence_id < w[1].sequence_id));
    }

    #[tokio::test]
    async fn test_unregistered_channels_are_not_searched() {
        let (sender, sent) = recording_sender();
        let search = manager_with(sender);
        search.register(1, "a");
        search.register(2, "b");
        assert!(search.unregister(1));
        assert!(!search.unregister(1));

        assert_eq!(search.tick().await.unwrap(), 1);
        assert_eq!(sent.lock()[0].channels, vec![(2, "b".to_string())]);
        assert!(search.is_pending(2));
        assert_eq!(search.num_pending(), 1);
    }

    #[tokio::test]
    async fn test_requests_are_split_to_fit_datagrams() {
        let (sender, sent) = recording_sender();
        let search = manager_with(sender);
        for cid in 0..20 {
            search.register(cid, &format!("{}:{}", cid, "x".repeat(200)));
        }

        assert_eq!(search.tick().await.unwrap(), 20);

        let sent = sent.lock();
        assert!(sent.len() > 1);
        assert_eq!(sent.iter().map(|r| r.channels.len()).sum::<usize>(), 20);
        for request in sent.iter() {
            let mut buf = BytesMut::new();
            request.ser(&mut buf);
            assert!(buf.len() + HEADER_SIZE <= MAX_SEARCH_DATAGRAM);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_stops_with_manager() {
        let (sender, sent) = recording_sender();
        let search = Arc::new(manager_with(sender));
        search.register(1, "a");

        let timer = search.spawn_timer(Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!sent.lock().is_empty());

        drop(search);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(timer.is_finished());
    }
}
