use std::collections::hash_map::Entry;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use bytes::Bytes;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::protocol::command::Command;
use crate::transport::Transport;

/// Debug level from which every inbound payload is dumped
pub const DUMP_DEBUG_LEVEL: u8 = 3;

/// A complete inbound application message, as handed to a [ResponseHandler]
pub struct InboundMessage<'a> {
    pub source: SocketAddr,
    /// `None` for datagrams
    pub transport: Option<&'a Arc<dyn Transport>>,
    pub version: u8,
    pub command: Command,
    pub payload: Bytes,
}

/// Interprets the payload of one command. Handlers run on the receiving task, so they must not
///  block; an `Err` is logged and the message dropped.
pub trait ResponseHandler: Send + Sync + 'static {
    fn handle(&self, msg: &InboundMessage) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DispatchOutcome {
    Handled,
    /// no handler for the command code - dropped, the connection is kept
    Unknown,
    /// the handler failed on the payload - dropped
    Failed,
}

/// Routes inbound messages to the handler registered for their command code
pub struct ResponseDispatcher {
    handlers: RwLock<FxHashMap<u8, Arc<dyn ResponseHandler>>>,
    debug_level: AtomicU8,
}

impl ResponseDispatcher {
    pub fn new(debug_level: u8) -> ResponseDispatcher {
        ResponseDispatcher {
            handlers: Default::default(),
            debug_level: AtomicU8::new(debug_level),
        }
    }

    pub fn register_handler(&self, command: Command, handler: Arc<dyn ResponseHandler>) -> anyhow::Result<()> {
        match self.handlers.write().entry(command.into()) {
            Entry::Occupied(_) => {
                Err(anyhow!("registering a second handler for command {:?}", command))
            }
            Entry::Vacant(e) => {
                e.insert(handler);
                Ok(())
            }
        }
    }

    pub fn deregister_handler(&self, command: Command) -> anyhow::Result<()> {
        if self.handlers.write().remove(&command.into()).is_none() {
            return Err(anyhow!("deregistering a handler that was not previously registered: {:?}", command));
        }
        Ok(())
    }

    pub fn set_debug_level(&self, level: u8) {
        self.debug_level.store(level, Ordering::Relaxed);
    }

    pub fn debug_level(&self) -> u8 {
        self.debug_level.load(Ordering::Relaxed)
    }

    pub fn handle_message(&self, source: SocketAddr, transport: Option<&Arc<dyn Transport>>, version: u8, command: u8, payload: Bytes) -> DispatchOutcome {
        if self.debug_level() >= DUMP_DEBUG_LEVEL {
            debug!(?source, version, command, len = payload.len(), "received message: {}", hex::encode(&payload));
        }

        let handler = self.handlers.read()
            .get(&command)
            .cloned();
        let (Some(handler), Ok(command)) = (handler, Command::try_from(command)) else {
            debug!(?source, command, "received message with a command code for which there is no handler - ignoring");
            return DispatchOutcome::Unknown;
        };

        let msg = InboundMessage {
            source,
            transport,
            version,
            command,
            payload,
        };

        trace!(?source, ?command, "dispatching message");
        match handler.handle(&msg) {
            Ok(()) => DispatchOutcome::Handled,
            Err(e) => {
                warn!(?source, ?command, "error handling message - dropping it: {}", e);
                if self.debug_level() > 0 && self.debug_level() < DUMP_DEBUG_LEVEL {
                    debug!("payload of dropped message: {}", hex::encode(&msg.payload));
                }
                DispatchOutcome::Failed
            }
        }
    }
}
