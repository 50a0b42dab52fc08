use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::PvaError;
use crate::protocol::command::Command;
use crate::protocol::messages::Response;
use crate::request::RequestHandle;

pub type ResponseReceiver = mpsc::UnboundedReceiver<Result<Response, PvaError>>;

/// The delivering half of a pending request. It accepts responses until it was either
///  completed by a final response or cancelled, whichever happens first. Nothing is sent
///  after a cancellation, even if delivery and cancellation race.
#[derive(Debug)]
pub struct ResponseSink {
    sender: mpsc::UnboundedSender<Result<Response, PvaError>>,
    done: Mutex<bool>,
}

impl ResponseSink {
    pub fn new() -> (ResponseSink, ResponseReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let sink = ResponseSink {
            sender,
            done: Mutex::new(false),
        };
        (sink, receiver)
    }

    fn deliver(&self, response: Response, is_final: bool) {
        let mut done = self.done.lock();
        if *done {
            trace!("dropping response to a request that was completed or cancelled");
            return;
        }
        *done = is_final;
        // the requester may have given up already
        let _ = self.sender.send(Ok(response));
    }

    fn cancel(&self, reason: &PvaError) {
        let mut done = self.done.lock();
        if !*done {
            *done = true;
            let _ = self.sender.send(Err(reason.clone()));
        }
    }

    pub fn is_done(&self) -> bool {
        *self.done.lock()
    }
}

/// A request of the client side waiting for responses, one variant per kind of request
#[derive(Debug)]
pub enum PendingRequest {
    Get(ResponseSink),
    Put(ResponseSink),
    PutGet(ResponseSink),
    Rpc(ResponseSink),
    GetField(ResponseSink),
    Monitor(ResponseSink),
}

impl PendingRequest {
    /// the request kind matching a command, for commands that are correlated by ioid
    pub fn for_command(command: Command, sink: ResponseSink) -> Option<PendingRequest> {
        match command {
            Command::Get => Some(PendingRequest::Get(sink)),
            Command::Put => Some(PendingRequest::Put(sink)),
            Command::PutGet => Some(PendingRequest::PutGet(sink)),
            Command::Rpc => Some(PendingRequest::Rpc(sink)),
            Command::GetField => Some(PendingRequest::GetField(sink)),
            Command::Monitor => Some(PendingRequest::Monitor(sink)),
            _ => None,
        }
    }

    pub fn command(&self) -> Command {
        match self {
            PendingRequest::Get(_) => Command::Get,
            PendingRequest::Put(_) => Command::Put,
            PendingRequest::PutGet(_) => Command::PutGet,
            PendingRequest::Rpc(_) => Command::Rpc,
            PendingRequest::GetField(_) => Command::GetField,
            PendingRequest::Monitor(_) => Command::Monitor,
        }
    }

    fn sink(&self) -> &ResponseSink {
        match self {
            PendingRequest::Get(sink)
            | PendingRequest::Put(sink)
            | PendingRequest::PutGet(sink)
            | PendingRequest::Rpc(sink)
            | PendingRequest::GetField(sink)
            | PendingRequest::Monitor(sink) => sink,
        }
    }

    /// whether this response ends the request, which means the server forgot about it
    pub fn is_final(&self, response: &Response) -> bool {
        match self {
            PendingRequest::GetField(_) => true,
            _ => response.is_destroy(),
        }
    }

    pub fn deliver(&self, response: Response) {
        let is_final = self.is_final(&response);
        self.sink().deliver(response, is_final);
    }

    pub fn is_done(&self) -> bool {
        self.sink().is_done()
    }
}

impl RequestHandle for PendingRequest {
    fn cancel(&self, reason: &PvaError) {
        self.sink().cancel(reason);
    }
}
