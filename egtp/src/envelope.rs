//! The application envelope: what goes inside a sealed message.
//!
//! An initiating message carries a recipient and a nonce, a response carries the id of the message it answers. Both
//! carry a freshness proof, the id of the last message received from the counterparty. The envelope is JSON encoded,
//! and the id of a message is the digest of its encoding.

use crate::identity::{MsgId, PeerId};
use crate::strategy::AddressRecord;
use log::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const PROTOCOL_VERSION: &str = "Mojo v0.9991";
const PROTOCOL_PREFIX: &str = "Mojo v";
/// Versions in `[MIN_VERSION, NEXT_MAJOR_VERSION)` are accepted.
const MIN_VERSION: f64 = 0.99;
const NEXT_MAJOR_VERSION: f64 = 2.0;

pub const RESULT_FAILURE: &str = "failure";

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("Malformed envelope: {0}")]
    Malformed(String),
    #[error("Incompatible protocol version '{0}'")]
    IncompatibleVersion(String),
    #[error("Inconsistent conversation markers: {0}")]
    InconsistentMarkers(&'static str),
    #[error("Could not encode envelope: {0}")]
    Encoding(#[from] serde_json::Error),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub protocol: String,
    #[serde(rename = "message type")]
    pub message_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<PeerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<PeerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<MsgId>,
    #[serde(rename = "freshness proof", default)]
    pub freshness_proof: Option<MsgId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub header: Header,
    #[serde(rename = "message body", default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metainfo: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_metainfo: Option<Value>,
}

/// Which side of a conversation a message is on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    Initiating { recipient: PeerId, nonce: PeerId },
    Response { reference: MsgId },
}

impl Envelope {
    pub fn initiating(
        message_type: &str,
        body: Option<Value>,
        recipient: PeerId,
        freshness_proof: Option<MsgId>,
        metainfo: Option<&AddressRecord>,
    ) -> Result<Self, EnvelopeError> {
        let header = Header {
            protocol: PROTOCOL_VERSION.to_string(),
            message_type: message_type.to_string(),
            recipient: Some(recipient),
            nonce: Some(PeerId::random()),
            reference: None,
            freshness_proof,
            result: None,
            failure_reason: None,
        };
        let metainfo = metainfo.map(serde_json::to_value).transpose()?;
        Ok(Envelope { header, body, metainfo, extra_metainfo: None })
    }

    /// A response to a message of type `query_type`. Its type is the query type followed by ` response`.
    pub fn response(
        query_type: &str,
        body: Option<Value>,
        reference: MsgId,
        freshness_proof: Option<MsgId>,
        metainfo: Option<&AddressRecord>,
    ) -> Result<Self, EnvelopeError> {
        let header = Header {
            protocol: PROTOCOL_VERSION.to_string(),
            message_type: response_type(query_type),
            recipient: None,
            nonce: None,
            reference: Some(reference),
            freshness_proof,
            result: None,
            failure_reason: None,
        };
        let metainfo = metainfo.map(serde_json::to_value).transpose()?;
        Ok(Envelope { header, body, metainfo, extra_metainfo: None })
    }

    /// Mark a response as a failure report.
    pub fn with_failure(mut self, reason: &str) -> Self {
        self.header.result = Some(RESULT_FAILURE.to_string());
        self.header.failure_reason = Some(reason.to_string());
        self
    }

    pub fn message_type(&self) -> &str {
        &self.header.message_type
    }

    pub fn failure(&self) -> Option<String> {
        match self.header.result.as_deref() {
            Some(RESULT_FAILURE) => {
                Some(self.header.failure_reason.clone().unwrap_or_else(|| "failure reported in header".to_string()))
            }
            _ => None,
        }
    }

    pub fn kind(&self) -> Result<MessageKind, EnvelopeError> {
        let h = &self.header;
        match (h.nonce, h.recipient, h.reference) {
            (Some(nonce), Some(recipient), None) => Ok(MessageKind::Initiating { recipient, nonce }),
            (Some(_), _, _) => Err(EnvelopeError::InconsistentMarkers("a nonce needs a recipient and no reference")),
            (None, None, Some(reference)) => Ok(MessageKind::Response { reference }),
            (None, _, _) => Err(EnvelopeError::InconsistentMarkers("a response needs a reference and no recipient")),
        }
    }

    /// The sender's address record, if it attached a usable one. Bad metainfo never fails the message.
    pub fn sender_address(&self) -> Option<AddressRecord> {
        let value = self.metainfo.as_ref()?;
        match serde_json::from_value::<AddressRecord>(value.clone()) {
            Ok(record) if !record.strategies.is_empty() => Some(record),
            Ok(_) => None,
            Err(e) => {
                debug!("Ignoring unusable metainfo: {e}");
                None
            }
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let envelope: Envelope =
            serde_json::from_slice(bytes).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
        check_version(&envelope.header.protocol)?;
        Ok(envelope)
    }
}

pub fn response_type(query_type: &str) -> String {
    format!("{query_type} response")
}

/// The id of an encoded message.
pub fn message_id(encoded: &[u8]) -> MsgId {
    MsgId::digest(encoded)
}

fn check_version(protocol: &str) -> Result<(), EnvelopeError> {
    let version = protocol
        .strip_prefix(PROTOCOL_PREFIX)
        .ok_or_else(|| EnvelopeError::Malformed(format!("not a Mojo protocol message: '{protocol}'")))?
        .trim()
        .parse::<f64>()
        .map_err(|_| EnvelopeError::IncompatibleVersion(protocol.to_string()))?;
    if (MIN_VERSION..NEXT_MAJOR_VERSION).contains(&version) {
        Ok(())
    } else {
        Err(EnvelopeError::IncompatibleVersion(protocol.to_string()))
    }
}
