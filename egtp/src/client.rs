use crate::conversation::Outcome;
use crate::envelope::Envelope;
use crate::errors::ClientError;
use crate::handicapper::Handicapper;
use crate::handlers::{InboundForwarder, IncomingRequest, MessageHandler, Responder};
use crate::hints::CommHints;
use crate::identity::PeerId;
use crate::message_types::{Command, NodeStats, SendOptions};
use crate::strategy::AddressRecord;
use futures::channel::{mpsc, oneshot};
use futures::SinkExt;
use log::*;
use serde_json::Value;

/// A sender interface to the node's event loop. It can be cheaply cloned and shared among tasks.
///
/// Every method follows the same pattern:
/// - A one-shot channel is created.
/// - A [`Command`] carrying the sender half goes to the event loop.
/// - The method waits on the receiver half for the result.
///
/// The client does no work itself.
#[derive(Clone)]
pub struct Client {
    sender: mpsc::Sender<Command>,
    peer_id: PeerId,
}

/// A conversation started with [`Client::start_conversation`].
pub struct PendingConversation {
    outcome: oneshot::Receiver<Outcome>,
    late: oneshot::Receiver<Outcome>,
}

impl PendingConversation {
    /// Wait for the response, or for the reason there will not be one.
    pub async fn response(&mut self) -> Result<Envelope, ClientError> {
        let outcome = (&mut self.outcome).await?;
        Ok(outcome?)
    }

    /// After a timeout, wait for a response that arrives late. `None` if the conversation did not time out, or the
    /// counterparty never answered before the node stopped waiting.
    pub async fn late_response(self) -> Option<Outcome> {
        self.late.await.ok()
    }
}

impl Client {
    pub(crate) fn new(sender: mpsc::Sender<Command>, peer_id: PeerId) -> Self {
        Client { sender, peer_id }
    }

    /// The id of the node this client talks to.
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Send a message and wait for the response.
    pub async fn send(
        &mut self,
        recipient: PeerId,
        message_type: &str,
        body: Option<Value>,
    ) -> Result<Envelope, ClientError> {
        self.send_with(recipient, message_type, body, SendOptions::default()).await
    }

    pub async fn send_with(
        &mut self,
        recipient: PeerId,
        message_type: &str,
        body: Option<Value>,
        options: SendOptions,
    ) -> Result<Envelope, ClientError> {
        let (sender, receiver) = oneshot::channel();
        let message_type = message_type.to_string();
        trace!("Client: sending '{message_type}' to {recipient}");
        let command = Command::Send { recipient, message_type, body, options, outcome: sender, late: None };
        self.sender.send(command).await?;
        let outcome = receiver.await?;
        Ok(outcome?)
    }

    /// Start a conversation without waiting for it. Unlike [`Self::send_with`], a response that arrives after the
    /// timeout is still delivered, through [`PendingConversation::late_response`].
    pub async fn start_conversation(
        &mut self,
        recipient: PeerId,
        message_type: &str,
        body: Option<Value>,
        options: SendOptions,
    ) -> Result<PendingConversation, ClientError> {
        let (outcome, outcome_receiver) = oneshot::channel();
        let (late, late_receiver) = oneshot::channel();
        let message_type = message_type.to_string();
        let command = Command::Send { recipient, message_type, body, options, outcome, late: Some(late) };
        self.sender.send(command).await?;
        Ok(PendingConversation { outcome: outcome_receiver, late: late_receiver })
    }

    /// Handle requests of `message_type` with `handler`, replacing any previous handler for that type.
    pub async fn register_handler<H>(&mut self, message_type: &str, handler: H) -> Result<(), ClientError>
    where
        H: MessageHandler + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        let message_type = message_type.to_string();
        self.sender.send(Command::RegisterHandler { message_type, handler: Box::new(handler), sender }).await?;
        receiver.await?;
        Ok(())
    }

    /// Receive requests of `message_type` as a stream. Answer them with [`Self::respond`]. When more than `buffer`
    /// requests are waiting, new ones are refused with a "busy" failure.
    pub async fn inbound_requests(
        &mut self,
        message_type: &str,
        buffer: usize,
    ) -> Result<mpsc::Receiver<IncomingRequest>, ClientError> {
        let (forwarder, requests) = InboundForwarder::new(buffer);
        self.register_handler(message_type, forwarder).await?;
        Ok(requests)
    }

    /// Returns false if there was no handler for the type.
    pub async fn unregister_handler(&mut self, message_type: &str) -> Result<bool, ClientError> {
        let (sender, receiver) = oneshot::channel();
        let message_type = message_type.to_string();
        self.sender.send(Command::UnregisterHandler { message_type, sender }).await?;
        Ok(receiver.await?)
    }

    pub async fn respond(&mut self, responder: Responder, body: Option<Value>) -> Result<(), ClientError> {
        self.respond_with(responder, body, None, CommHints::NO_HINT).await
    }

    pub async fn respond_failure(&mut self, responder: Responder, reason: &str) -> Result<(), ClientError> {
        self.respond_with(responder, None, Some(reason.to_string()), CommHints::NO_HINT).await
    }

    /// Answer a request. Fails with [`ClientError::UnknownResponder`] if it was already answered or has expired.
    pub async fn respond_with(
        &mut self,
        responder: Responder,
        body: Option<Value>,
        failure: Option<String>,
        hints: CommHints,
    ) -> Result<(), ClientError> {
        let (sender, receiver) = oneshot::channel();
        self.sender.send(Command::Respond { responder, body, failure, hints, sender }).await?;
        if receiver.await? {
            Ok(())
        } else {
            Err(ClientError::UnknownResponder)
        }
    }

    /// Tell the node how to reach a counterparty. Returns the id the record belongs to.
    pub async fn use_address(&mut self, record: AddressRecord) -> Result<PeerId, ClientError> {
        let (sender, receiver) = oneshot::channel();
        self.sender.send(Command::UseAddress { record, sender }).await?;
        Ok(receiver.await??)
    }

    /// Add a handicapper to the ones used to choose relayers.
    pub async fn add_handicapper<H>(&mut self, handicapper: H) -> Result<(), ClientError>
    where
        H: Handicapper + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        self.sender.send(Command::AddHandicapper { handicapper: Box::new(handicapper), sender }).await?;
        receiver.await?;
        Ok(())
    }

    /// The address record the node currently publishes for itself.
    pub async fn own_address(&mut self) -> Result<Option<AddressRecord>, ClientError> {
        let (sender, receiver) = oneshot::channel();
        self.sender.send(Command::OwnAddress { sender }).await?;
        Ok(receiver.await?)
    }

    pub async fn stats(&mut self) -> Result<NodeStats, ClientError> {
        let (sender, receiver) = oneshot::channel();
        self.sender.send(Command::Stats { sender }).await?;
        Ok(receiver.await?)
    }

    /// Stop the event loop. Every outstanding conversation fails with
    /// [`crate::errors::ConversationFailure::Shutdown`].
    pub async fn shutdown(mut self) -> Result<(), ClientError> {
        let (sender, receiver) = oneshot::channel();
        self.sender.send(Command::Shutdown { sender }).await?;
        receiver.await?;
        Ok(())
    }
}
