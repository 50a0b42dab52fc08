//! The handlers a client context installs in its dispatcher. Each holds a non-owning handle
//!  to the context and does nothing once the context is gone.

use std::sync::Arc;

use anyhow::bail;
use bytes::Buf;
use tracing::{debug, error, info, trace, warn};

use crate::context::ContextHandle;
use crate::dispatch::dispatcher::{InboundMessage, ResponseDispatcher, ResponseHandler};
use crate::protocol::command::Command;
use crate::protocol::messages::{BeaconMessage, CreateChannelResponse, DestroyChannel, MessageNotification, Response, SearchResponse};

const DATA_COMMANDS: [Command; 8] = [
    Command::Get,
    Command::Put,
    Command::PutGet,
    Command::Monitor,
    Command::Array,
    Command::Process,
    Command::Rpc,
    Command::GetField,
];

pub(crate) fn register_default_handlers(dispatcher: &ResponseDispatcher, context: ContextHandle) -> anyhow::Result<()> {
    dispatcher.register_handler(Command::Echo, Arc::new(EchoHandler))?;
    dispatcher.register_handler(Command::ConnectionValidated, Arc::new(NoopHandler))?;
    dispatcher.register_handler(Command::Beacon, Arc::new(BeaconHandler { context: context.clone() }))?;
    dispatcher.register_handler(Command::SearchResponse, Arc::new(SearchResponseHandler { context: context.clone() }))?;
    dispatcher.register_handler(Command::CreateChannel, Arc::new(CreateChannelHandler { context: context.clone() }))?;
    dispatcher.register_handler(Command::DestroyChannel, Arc::new(DestroyChannelHandler { context: context.clone() }))?;
    dispatcher.register_handler(Command::Message, Arc::new(MessageHandler { context: context.clone() }))?;

    let data_handler = Arc::new(DataResponseHandler { context });
    for command in DATA_COMMANDS {
        dispatcher.register_handler(command, data_handler.clone())?;
    }
    Ok(())
}

/// Echo messages are the peer's answers to liveness probes sent from here. They are never
///  answered, so two peers can not get into an echo loop.
struct EchoHandler;
impl ResponseHandler for EchoHandler {
    fn handle(&self, msg: &InboundMessage) -> anyhow::Result<()> {
        trace!(source = ?msg.source, len = msg.payload.len(), "echo");
        Ok(())
    }
}

struct NoopHandler;
impl ResponseHandler for NoopHandler {
    fn handle(&self, _msg: &InboundMessage) -> anyhow::Result<()> {
        Ok(())
    }
}

struct BeaconHandler {
    context: ContextHandle,
}
impl ResponseHandler for BeaconHandler {
    fn handle(&self, msg: &InboundMessage) -> anyhow::Result<()> {
        let beacon = BeaconMessage::try_deser(&mut msg.payload.clone())?;
        if let Some(context) = self.context.upgrade() {
            context.on_beacon(msg.source, msg.version, beacon);
        }
        Ok(())
    }
}

struct SearchResponseHandler {
    context: ContextHandle,
}
impl ResponseHandler for SearchResponseHandler {
    fn handle(&self, msg: &InboundMessage) -> anyhow::Result<()> {
        let response = SearchResponse::try_deser(&mut msg.payload.clone())?;
        trace!(source = ?msg.source, guid = ?response.guid, found = response.found, cids = ?response.cids, "search response");
        if let Some(context) = self.context.upgrade() {
            context.on_search_response(msg.source, response);
        }
        Ok(())
    }
}

struct CreateChannelHandler {
    context: ContextHandle,
}
impl ResponseHandler for CreateChannelHandler {
    fn handle(&self, msg: &InboundMessage) -> anyhow::Result<()> {
        let response = CreateChannelResponse::try_deser(&mut msg.payload.clone())?;
        if let Some(context) = self.context.upgrade() {
            context.on_create_channel_response(msg.transport, response);
        }
        Ok(())
    }
}

struct DestroyChannelHandler {
    context: ContextHandle,
}
impl ResponseHandler for DestroyChannelHandler {
    fn handle(&self, msg: &InboundMessage) -> anyhow::Result<()> {
        let destroy = DestroyChannel::try_deser(&mut msg.payload.clone())?;
        if let Some(context) = self.context.upgrade() {
            context.on_server_destroy_channel(msg.transport, destroy);
        }
        Ok(())
    }
}

/// Log output from the server concerning one request
struct MessageHandler {
    context: ContextHandle,
}
impl ResponseHandler for MessageHandler {
    fn handle(&self, msg: &InboundMessage) -> anyhow::Result<()> {
        let notification = MessageNotification::try_deser(&mut msg.payload.clone())?;
        let known = self.context.upgrade()
            .is_some_and(|c| c.requests().lookup(notification.ioid).is_some());

        let ioid = notification.ioid;
        let text = &notification.message;
        match notification.message_type {
            MessageNotification::TYPE_INFO => info!(source = ?msg.source, ioid, known, "server message: {}", text),
            MessageNotification::TYPE_WARNING => warn!(source = ?msg.source, ioid, known, "server message: {}", text),
            MessageNotification::TYPE_ERROR | MessageNotification::TYPE_FATAL => error!(source = ?msg.source, ioid, known, "server message: {}", text),
            other => debug!(source = ?msg.source, ioid, known, message_type = other, "server message: {}", text),
        }
        Ok(())
    }
}

/// Correlates responses to pending requests by their ioid. Responses for requests that are
///  gone (cancelled, timed out, or destroyed with their channel) are dropped silently.
struct DataResponseHandler {
    context: ContextHandle,
}
impl ResponseHandler for DataResponseHandler {
    fn handle(&self, msg: &InboundMessage) -> anyhow::Result<()> {
        let Some(context) = self.context.upgrade() else {
            return Ok(());
        };

        let mut buf = msg.payload.clone();
        let ioid = buf.try_get_u32()?;

        let Some(request) = context.requests().lookup(ioid) else {
            debug!(source = ?msg.source, ioid, command = ?msg.command, "response for unknown request - dropping");
            return Ok(());
        };
        if request.command() != msg.command {
            bail!("{:?} response for request {} which is a {:?} request", msg.command, ioid, request.command());
        }

        let response = match msg.command {
            Command::GetField => Response::try_deser_get_field(&mut buf)?,
            command => Response::try_deser_data(&mut buf, command == Command::Monitor)?,
        };
        trace!(ioid, command = ?msg.command, subcommand = response.subcommand, len = response.body.len(), "response");

        if !context.requests().deliver(ioid, response) {
            debug!(ioid, "request was completed or cancelled concurrently - dropping response");
        }
        Ok(())
    }
}
