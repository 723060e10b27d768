//! Application message handlers.
//!
//! Handlers run on the event loop, one request at a time, and must not block. A handler that needs to do real work
//! returns [`HandlerOutcome::Async`] and answers later through [`crate::Client::respond`] with the request's
//! [`Responder`].

use crate::hints::CommHints;
use crate::identity::{MsgId, PeerId};
use futures::channel::mpsc;
use log::*;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::{Display, Formatter};

/// Identifies a request that is still waiting for its response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Responder {
    pub(crate) request_id: MsgId,
    pub(crate) counterparty: PeerId,
}

impl Responder {
    pub fn counterparty(&self) -> PeerId {
        self.counterparty
    }

    pub fn request_id(&self) -> MsgId {
        self.request_id
    }
}

impl Display for Responder {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "request {} from {}", self.request_id, self.counterparty)
    }
}

#[derive(Clone, Debug)]
pub struct IncomingRequest {
    pub counterparty: PeerId,
    pub message_type: String,
    pub body: Option<Value>,
    pub responder: Responder,
}

#[derive(Clone, Debug, PartialEq)]
pub enum HandlerOutcome {
    /// Answer right away.
    Respond(Option<Value>, CommHints),
    /// Answer right away with a failure report.
    Fail(String),
    /// Never answer.
    NoResponse,
    /// Answer later with [`crate::Client::respond`].
    Async,
}

pub trait MessageHandler: Send {
    fn handle(&mut self, request: &IncomingRequest) -> HandlerOutcome;
}

impl<F> MessageHandler for F
where
    F: FnMut(&IncomingRequest) -> HandlerOutcome + Send,
{
    fn handle(&mut self, request: &IncomingRequest) -> HandlerOutcome {
        self(request)
    }
}

/// Forwards every request into a channel, for applications that would rather consume a stream of requests than
/// implement a handler. Requests are answered asynchronously.
pub struct InboundForwarder {
    sender: mpsc::Sender<IncomingRequest>,
}

impl InboundForwarder {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<IncomingRequest>) {
        let (sender, receiver) = mpsc::channel(buffer);
        (InboundForwarder { sender }, receiver)
    }
}

impl MessageHandler for InboundForwarder {
    fn handle(&mut self, request: &IncomingRequest) -> HandlerOutcome {
        match self.sender.try_send(request.clone()) {
            Ok(()) => HandlerOutcome::Async,
            Err(e) if e.is_full() => {
                warn!("Inbound queue is full, refusing {}", request.responder);
                HandlerOutcome::Fail("busy".into())
            }
            Err(_) => {
                debug!("Nobody is listening for '{}' any more", request.message_type);
                HandlerOutcome::NoResponse
            }
        }
    }
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Box<dyn MessageHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous handler for the same type.
    pub fn register(&mut self, message_type: &str, handler: Box<dyn MessageHandler>) {
        if self.handlers.insert(message_type.to_string(), handler).is_some() {
            debug!("Replaced the handler for '{message_type}'");
        }
    }

    pub fn unregister(&mut self, message_type: &str) -> bool {
        self.handlers.remove(message_type).is_some()
    }

    pub fn handles(&self, message_type: &str) -> bool {
        self.handlers.contains_key(message_type)
    }

    /// Run the handler for the request's type. `None` when no handler is registered.
    pub fn dispatch(&mut self, request: &IncomingRequest) -> Option<HandlerOutcome> {
        let handler = self.handlers.get_mut(&request.message_type)?;
        Some(handler.handle(request))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    fn request(message_type: &str) -> IncomingRequest {
        let counterparty = PeerId::digest(b"peer");
        let responder = Responder { request_id: MsgId::digest(message_type.as_bytes()), counterparty };
        IncomingRequest { counterparty, message_type: message_type.into(), body: Some(json!(1)), responder }
    }

    #[test]
    fn dispatch_by_type() {
        let mut registry = HandlerRegistry::new();
        let mut calls = 0;
        registry.register(
            "ping",
            Box::new(move |req: &IncomingRequest| {
                calls += 1;
                HandlerOutcome::Respond(Some(json!({"calls": calls, "echo": req.body})), CommHints::NO_HINT)
            }),
        );
        let outcome = registry.dispatch(&request("ping"));
        assert_eq!(outcome, Some(HandlerOutcome::Respond(Some(json!({"calls": 1, "echo": 1})), CommHints::NO_HINT)));
        assert!(registry.dispatch(&request("pong")).is_none());
        assert!(registry.unregister("ping"));
        assert!(!registry.handles("ping"));
    }

    #[tokio::test]
    async fn forwarder_streams_requests() {
        let (forwarder, mut requests) = InboundForwarder::new(1);
        let mut registry = HandlerRegistry::new();
        registry.register("ping", Box::new(forwarder));
        assert_eq!(registry.dispatch(&request("ping")), Some(HandlerOutcome::Async));
        let forwarded = requests.next().await.expect("forwarded request");
        assert_eq!(forwarded.message_type, "ping");
        assert_eq!(forwarded.responder, request("ping").responder);
        drop(requests);
        assert_eq!(registry.dispatch(&request("ping")), Some(HandlerOutcome::NoResponse));
    }
}
