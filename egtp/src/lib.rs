mod cache;
mod client;
pub mod config;
mod connection;
pub mod conversation;
pub mod envelope;
pub mod errors;
mod event_loop;
pub mod framer;
pub mod handicapper;
pub mod handlers;
pub mod hints;
pub mod identity;
pub mod lookup;
pub mod message_types;
mod node;
pub mod pool;
pub mod relay;
mod scheduler;
pub mod session;
pub mod strategy;
pub mod transaction;

pub use client::{Client, PendingConversation};
pub use config::{EgtpConfig, RelayConfig};
pub use envelope::Envelope;
pub use errors::{ClientError, ConversationFailure};
pub use handicapper::{Handicap, Handicapper};
pub use handlers::{HandlerOutcome, IncomingRequest, MessageHandler, Responder};
pub use hints::CommHints;
pub use identity::{MsgId, NodeIdentity, PeerId, PublicKey};
pub use lookup::{Directory, Lookup, LookupError, RelayDiscovery};
pub use message_types::{NodeStats, SendOptions};
pub use node::Node;
pub use strategy::AddressRecord;
