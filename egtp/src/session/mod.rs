//! Session crypto: the handshake that establishes a per-counterparty session, and the message formats that use it.
//!
//! The first messages to a counterparty carry a full header. The header names the recipient, carries the session key
//! wrapped with the recipient's public key, and carries the sender's public key, the two session ids and a signature.
//! Once the counterparty has answered over the session, later messages carry only the 20-byte session id.
//!
//! | Message type  | Layout                                                                   |
//! |---------------|--------------------------------------------------------------------------|
//! | `0x00000000`  | `lp(header) \| iv(8) \| lp(enc(plaintext \| mac))`                         |
//! | `0x00000001`  | `session_id(20) \| iv(8) \| lp(enc(plaintext \| mac))`                     |
//! | `0x00000202`  | `bad_session_id(20) \| sender_id(20)`                                    |
//!
//! `lp` is a `u32` big-endian length prefix. Trailing bytes after any of these structures are an error.

mod packing;
mod primitives;

use crate::cache::TtlCache;
use crate::identity::{NodeIdentity, PeerId, PublicKey, ID_SIZE};
use log::*;
use packing::{Packer, Unpacker};
use primitives::*;
use rand_core::{OsRng, RngCore};
use rsa::{Oaep, Pkcs1v15Sign};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::Instant;
use thiserror::Error;
use zeroize::Zeroizing;

pub use primitives::{SIZE_OF_IV, SIZE_OF_MAC, SIZE_OF_SYMMETRIC_KEYS, SIZE_OF_UNIQS};

const MSG_FULL_HEADER: u32 = 0x0000_0000;
const MSG_SHORT: u32 = 0x0000_0001;
const MSG_INVALIDATE: u32 = 0x0000_0202;
const HEADER_CACHE_SIZE: usize = 1000;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Malformed message: {0}")]
    Malformed(String),
    #[error("Unknown message type {0:#010x}")]
    UnknownMessageType(u32),
    #[error("Message is addressed to {0}, not to us")]
    NotForMe(PeerId),
    #[error("No public key is known for counterparty {0}")]
    NoCounterpartyInfo(PeerId),
    #[error("Could not decrypt the message")]
    Decrypt,
    #[error("Message authentication failed")]
    BadMac,
    #[error("The header signature does not verify")]
    BadSignature,
    #[error("The session key does not match the key seed in the header")]
    BadKey,
    #[error("Session id {0} is already in use by another counterparty")]
    DuplicateSession(PeerId),
    #[error("Unknown session {session_id}")]
    UnknownSession { session_id: PeerId, invalidate_msg: Vec<u8> },
    #[error("Counterparty {counterparty} asked us to drop session {session_id}")]
    SessionInvalidated { counterparty: PeerId, session_id: PeerId },
    #[error("Untrusted invalidate request for session {0}")]
    UntrustedInvalidate(PeerId),
    #[error("RSA failure: {0}")]
    Rsa(String),
}

impl From<rsa::Error> for SessionError {
    fn from(err: rsa::Error) -> Self {
        SessionError::Rsa(err.to_string())
    }
}

/// A message that decrypted and authenticated successfully.
#[derive(Debug, Clone)]
pub struct ParsedMessage {
    pub sender: PeerId,
    pub sender_key: PublicKey,
    pub plaintext: Vec<u8>,
}

struct Session {
    /// Ids on messages the counterparty sends us.
    id_in: PeerId,
    /// Ids on messages we send to the counterparty.
    id_out: PeerId,
    key: SymmetricKey,
    /// Set until the counterparty shows it has the session by using it. While set, every outgoing message carries it.
    header: Option<Vec<u8>>,
    initiator: PeerId,
}

#[derive(Clone)]
struct VerifiedHeader {
    sender_key: PublicKey,
    id_in: PeerId,
    id_out: PeerId,
    key: SymmetricKey,
}

pub struct SessionCrypto {
    identity: NodeIdentity,
    my_id: PeerId,
    keys: HashMap<PeerId, PublicKey>,
    sessions: HashMap<PeerId, Session>,
    /// Reverse index from incoming session id to the counterparty that owns it.
    session_index: HashMap<PeerId, PeerId>,
    header_cache: TtlCache<PeerId, VerifiedHeader>,
}

impl SessionCrypto {
    /// Set up session state for `identity`. Our own public key is known from the start, so messages to ourselves
    /// work like any other.
    pub fn new(identity: NodeIdentity) -> Self {
        let my_id = identity.peer_id();
        let own_key = identity.public_key();
        let mut crypto = SessionCrypto {
            identity,
            my_id,
            keys: HashMap::new(),
            sessions: HashMap::new(),
            session_index: HashMap::new(),
            header_cache: TtlCache::new(HEADER_CACHE_SIZE, None),
        };
        crypto.store_key(own_key);
        crypto
    }

    pub fn peer_id(&self) -> PeerId {
        self.my_id
    }

    /// Remember a counterparty's public key. Storing a key that is already known does nothing.
    pub fn store_key(&mut self, key: PublicKey) {
        let id = key.id();
        if !self.keys.contains_key(&id) {
            trace!("🔑 Storing key for {id}");
            self.keys.insert(id, key);
        }
    }

    #[cfg(test)]
    fn has_session(&self, peer: &PeerId) -> bool {
        self.sessions.contains_key(peer)
    }

    /// True once the counterparty has used the session we offered, so our messages no longer need a header.
    pub fn is_acknowledged(&self, peer: &PeerId) -> bool {
        self.sessions.get(peer).is_some_and(|s| s.header.is_none())
    }

    /// Encrypt `plaintext` for `recipient`, starting a session if none exists yet.
    pub fn generate_message(&mut self, recipient: &PeerId, plaintext: &[u8]) -> Result<Vec<u8>, SessionError> {
        if !self.sessions.contains_key(recipient) {
            self.create_session(recipient)?;
        }
        let session = self.sessions.get(recipient).ok_or(SessionError::NoCounterpartyInfo(*recipient))?;
        let mut p = Packer::new();
        match &session.header {
            Some(header) => {
                p.pack_fixed(&MSG_FULL_HEADER.to_be_bytes()).pack_bytes(header);
            }
            None => {
                p.pack_fixed(&MSG_SHORT.to_be_bytes()).pack_fixed(session.id_out.as_bytes());
            }
        }
        let mut iv = [0u8; SIZE_OF_IV];
        OsRng.fill_bytes(&mut iv);
        let encrypted = seal(&session.key[..], &iv, plaintext)?;
        p.pack_fixed(&iv).pack_bytes(&encrypted);
        Ok(p.finish())
    }

    /// Decrypt and authenticate a wire message.
    pub fn parse(&mut self, wire: &[u8]) -> Result<ParsedMessage, SessionError> {
        let mut u = Unpacker::new(wire);
        match u.unpack_u32()? {
            MSG_FULL_HEADER => {
                let header = u.unpack_bytes()?;
                let iv = u.unpack_array::<SIZE_OF_IV>()?;
                let encrypted = u.unpack_bytes()?;
                u.done()?;
                let verified = self.process_header(header)?;
                let plaintext = open(&verified.key[..], &iv, encrypted)?;
                Ok(ParsedMessage { sender: verified.sender_key.id(), sender_key: verified.sender_key, plaintext })
            }
            MSG_SHORT => {
                let session_id = PeerId::from_bytes(u.unpack_array::<ID_SIZE>()?);
                let iv = u.unpack_array::<SIZE_OF_IV>()?;
                let encrypted = u.unpack_bytes()?;
                u.done()?;
                self.parse_short(session_id, &iv, encrypted)
            }
            MSG_INVALIDATE => {
                let session_id = PeerId::from_bytes(u.unpack_array::<ID_SIZE>()?);
                let counterparty = PeerId::from_bytes(u.unpack_array::<ID_SIZE>()?);
                u.done()?;
                self.invalidate_session(&counterparty, &session_id)?;
                Err(SessionError::SessionInvalidated { counterparty, session_id })
            }
            other => Err(SessionError::UnknownMessageType(other)),
        }
    }

    /// Drop our session with `counterparty` if its outgoing id is `session_id`. Anything else is a stale or forged
    /// request and is refused.
    pub fn invalidate_session(&mut self, counterparty: &PeerId, session_id: &PeerId) -> Result<(), SessionError> {
        match self.sessions.get(counterparty) {
            Some(session) if session.id_out == *session_id => {
                debug!("Dropping session {session_id} with {counterparty} at their request");
                self.remove_session(counterparty);
                Ok(())
            }
            _ => {
                warn!("Ignoring invalidate request for session {session_id} from {counterparty}");
                Err(SessionError::UntrustedInvalidate(*session_id))
            }
        }
    }

    fn parse_short(
        &mut self,
        session_id: PeerId,
        iv: &[u8],
        encrypted: &[u8],
    ) -> Result<ParsedMessage, SessionError> {
        let Some(sender) = self.session_index.get(&session_id).copied() else {
            debug!("Message for unknown session {session_id}");
            return Err(SessionError::UnknownSession { session_id, invalidate_msg: self.invalidate_msg(&session_id) });
        };
        let sender_key = self.keys.get(&sender).cloned().ok_or(SessionError::NoCounterpartyInfo(sender))?;
        let session = self.sessions.get_mut(&sender).ok_or(SessionError::NoCounterpartyInfo(sender))?;
        let plaintext = open(&session.key[..], iv, encrypted)?;
        if session.header.take().is_some() {
            trace!("Session with {sender} acknowledged");
        }
        Ok(ParsedMessage { sender, sender_key, plaintext })
    }

    /// Forget every session and every key except our own.
    pub fn forget_sessions(&mut self) {
        self.sessions.clear();
        self.session_index.clear();
        self.header_cache.clear();
        self.keys.retain(|id, _| *id == self.my_id);
    }

    fn invalidate_msg(&self, session_id: &PeerId) -> Vec<u8> {
        let mut p = Packer::new();
        p.pack_fixed(&MSG_INVALIDATE.to_be_bytes()).pack_fixed(session_id.as_bytes()).pack_fixed(self.my_id.as_bytes());
        p.finish()
    }

    fn create_session(&mut self, recipient: &PeerId) -> Result<(), SessionError> {
        let recipient_key = self.keys.get(recipient).cloned().ok_or(SessionError::NoCounterpartyInfo(*recipient))?;
        let mut rep_out = [0u8; SIZE_OF_UNIQS];
        let mut rep_in = [0u8; SIZE_OF_UNIQS];
        let mut seed = Zeroizing::new([0u8; SIZE_OF_UNIQS]);
        OsRng.fill_bytes(&mut rep_out);
        OsRng.fill_bytes(&mut rep_in);
        OsRng.fill_bytes(&mut seed[..]);
        let id_out = mix(&self.my_id, recipient, &rep_out);
        let id_in = mix(&self.my_id, recipient, &rep_in);
        let key = derive_key(&self.my_id, recipient, &seed[..]);

        let mut inner = Packer::new();
        inner
            .pack_bytes(&self.identity.public_key().to_bytes())
            .pack_fixed(&rep_out)
            .pack_fixed(&rep_in)
            .pack_fixed(&seed[..]);
        let digest = summary(&key[..], inner.as_slice())?;
        let signature = self.identity.private_key().sign(Pkcs1v15Sign::new::<Sha256>(), &digest)?;
        inner.pack_fixed(&signature);
        let inner = Zeroizing::new(inner.finish());

        let wrapped_key = recipient_key.rsa().encrypt(&mut OsRng, Oaep::new::<Sha256>(), &key[..])?;
        let mut iv = [0u8; SIZE_OF_IV];
        OsRng.fill_bytes(&mut iv);
        let mut header = Packer::new();
        header
            .pack_fixed(recipient.as_bytes())
            .pack_bytes(&wrapped_key)
            .pack_fixed(&iv)
            .pack_bytes(&encrypt(&key[..], &iv, &inner)?);

        if let Some(previous) = self.session_index.get(&id_in) {
            return Err(SessionError::DuplicateSession(*previous));
        }
        debug!("🤝 Starting session {id_out} with {recipient}");
        self.remove_session(recipient);
        self.session_index.insert(id_in, *recipient);
        let session = Session { id_in, id_out, key, header: Some(header.finish()), initiator: self.my_id };
        self.sessions.insert(*recipient, session);
        Ok(())
    }

    fn remove_session(&mut self, counterparty: &PeerId) {
        if let Some(old) = self.sessions.remove(counterparty) {
            self.session_index.remove(&old.id_in);
        }
    }

    fn process_header(&mut self, header: &[u8]) -> Result<VerifiedHeader, SessionError> {
        let digest = PeerId::digest(header);
        let now = Instant::now();
        if let Some(cached) = self.header_cache.get(&digest, now) {
            return Ok(cached.clone());
        }
        let verified = self.verify_header(header)?;
        self.commit_session(&verified)?;
        self.header_cache.insert(digest, verified.clone(), now);
        Ok(verified)
    }

    fn verify_header(&self, header: &[u8]) -> Result<VerifiedHeader, SessionError> {
        let mut u = Unpacker::new(header);
        let recipient = PeerId::from_bytes(u.unpack_array::<ID_SIZE>()?);
        if recipient != self.my_id {
            return Err(SessionError::NotForMe(recipient));
        }
        let wrapped_key = u.unpack_bytes()?;
        let iv = u.unpack_array::<SIZE_OF_IV>()?;
        let encrypted = u.unpack_bytes()?;
        u.done()?;

        let raw_key = Zeroizing::new(
            self.identity.private_key().decrypt(Oaep::new::<Sha256>(), wrapped_key).map_err(|_| SessionError::Decrypt)?,
        );
        if raw_key.len() != SIZE_OF_SYMMETRIC_KEYS {
            return Err(SessionError::BadKey);
        }
        let mut key = Zeroizing::new([0u8; SIZE_OF_SYMMETRIC_KEYS]);
        key.copy_from_slice(&raw_key);
        let inner = Zeroizing::new(decrypt(&key[..], &iv, encrypted)?);

        let mut u = Unpacker::new(&inner);
        let sender_key = PublicKey::from_bytes(u.unpack_bytes()?).map_err(|e| SessionError::Malformed(e.to_string()))?;
        let rep_out = u.unpack_fixed(SIZE_OF_UNIQS)?;
        let rep_in = u.unpack_fixed(SIZE_OF_UNIQS)?;
        let seed = u.unpack_fixed(SIZE_OF_UNIQS)?;
        let signed = &inner[..u.position()];
        let signature = u.unpack_fixed(sender_key.size())?;
        u.done()?;

        let sender = sender_key.id();
        let derived = derive_key(&sender, &self.my_id, seed);
        if derived[..] != key[..] {
            return Err(SessionError::BadKey);
        }
        sender_key
            .rsa()
            .verify(Pkcs1v15Sign::new::<Sha256>(), &summary(&key[..], signed)?, signature)
            .map_err(|_| SessionError::BadSignature)?;
        // The sender's outgoing id is our incoming id and vice versa.
        let id_in = mix(&sender, &self.my_id, rep_out);
        let id_out = mix(&sender, &self.my_id, rep_in);
        Ok(VerifiedHeader { sender_key, id_in, id_out, key })
    }

    /// Adopt the session a verified header offers, unless we already have it or we win a crossed handshake.
    fn commit_session(&mut self, header: &VerifiedHeader) -> Result<(), SessionError> {
        let sender = header.sender_key.id();
        self.store_key(header.sender_key.clone());
        if let Some(owner) = self.session_index.get(&header.id_in) {
            if *owner != sender {
                return Err(SessionError::DuplicateSession(header.id_in));
            }
        }
        if let Some(existing) = self.sessions.get(&sender) {
            if existing.id_in == header.id_in {
                return Ok(());
            }
            // Both sides started a session at once. The one started by the lower id wins on both ends.
            let ours_pending = existing.header.is_some() && existing.initiator == self.my_id;
            if ours_pending && (sender == self.my_id || self.my_id < sender) {
                debug!("Crossed handshake with {sender}, keeping our session");
                return Ok(());
            }
        }
        debug!("🤝 Accepting session {} from {sender}", header.id_in);
        self.remove_session(&sender);
        self.session_index.insert(header.id_in, sender);
        let session = Session {
            id_in: header.id_in,
            id_out: header.id_out,
            key: header.key.clone(),
            header: None,
            initiator: sender,
        };
        self.sessions.insert(sender, session);
        Ok(())
    }

    #[cfg(test)]
    fn forget_incoming_session_ids(&mut self) {
        self.session_index.clear();
    }
}

fn summary(key: &[u8], signed: &[u8]) -> Result<Vec<u8>, SessionError> {
    Ok(Sha256::digest(mac(key, signed)?).to_vec())
}

fn seal(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, SessionError> {
    let tag = mac(key, plaintext)?;
    let mut body = Zeroizing::new(Vec::with_capacity(plaintext.len() + SIZE_OF_MAC));
    body.extend_from_slice(plaintext);
    body.extend_from_slice(&tag);
    encrypt(key, iv, &body)
}

fn open(key: &[u8], iv: &[u8], encrypted: &[u8]) -> Result<Vec<u8>, SessionError> {
    let mut body = decrypt(key, iv, encrypted)?;
    if body.len() < SIZE_OF_MAC {
        return Err(SessionError::Malformed("message shorter than its MAC".into()));
    }
    let tag = body.split_off(body.len() - SIZE_OF_MAC);
    verify_mac(key, &body, &tag)?;
    Ok(body)
}
