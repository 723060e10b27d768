//! The symmetric building blocks of the session protocol.

use super::SessionError;
use crate::identity::PeerId;
use blake2::digest::consts::U20;
use blake2::digest::{KeyInit, Mac};
use blake2::{Blake2b512, Blake2bMac, Digest};
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use des::TdesEde3;
use zeroize::Zeroizing;

pub const SIZE_OF_UNIQS: usize = 20;
pub const SIZE_OF_SYMMETRIC_KEYS: usize = 24;
pub const SIZE_OF_IV: usize = 8;
pub const SIZE_OF_MAC: usize = 20;

pub type SymmetricKey = Zeroizing<[u8; SIZE_OF_SYMMETRIC_KEYS]>;

type TdesCbcEnc = cbc::Encryptor<TdesEde3>;
type TdesCbcDec = cbc::Decryptor<TdesEde3>;
type MacFn = Blake2bMac<U20>;

/// Bind a piece of data to an ordered pair of counterparties.
pub fn mix(cp1: &PeerId, cp2: &PeerId, data: &[u8]) -> PeerId {
    let mut p = super::packing::Packer::new();
    p.pack_bytes(cp1.as_bytes()).pack_bytes(cp2.as_bytes()).pack_bytes(data);
    PeerId::digest(p.as_slice())
}

/// A deterministic byte stream expanded from a seed by hashing the seed with a block counter.
pub struct HashRandom {
    seed: Vec<u8>,
    counter: u32,
    pool: Vec<u8>,
}

impl HashRandom {
    pub fn new(seed: &[u8]) -> Self {
        HashRandom { seed: seed.to_vec(), counter: 0, pool: Vec::new() }
    }

    pub fn get(&mut self, n: usize) -> Vec<u8> {
        while self.pool.len() < n {
            let mut hasher = Blake2b512::new();
            hasher.update(&self.seed);
            hasher.update(self.counter.to_be_bytes());
            self.pool.extend_from_slice(&hasher.finalize());
            self.counter += 1;
        }
        let rest = self.pool.split_off(n);
        std::mem::replace(&mut self.pool, rest)
    }
}

/// The session key both ends derive from the initiator's seed.
pub fn derive_key(initiator: &PeerId, responder: &PeerId, seed: &[u8]) -> SymmetricKey {
    let mut key = Zeroizing::new([0u8; SIZE_OF_SYMMETRIC_KEYS]);
    let bytes = Zeroizing::new(HashRandom::new(mix(initiator, responder, seed).as_bytes()).get(SIZE_OF_SYMMETRIC_KEYS));
    key.copy_from_slice(&bytes);
    key
}

pub fn mac(key: &[u8], message: &[u8]) -> Result<[u8; SIZE_OF_MAC], SessionError> {
    let mut m = <MacFn as KeyInit>::new_from_slice(key).map_err(|_| SessionError::Malformed("bad MAC key".into()))?;
    m.update(message);
    let mut out = [0u8; SIZE_OF_MAC];
    out.copy_from_slice(&m.finalize().into_bytes());
    Ok(out)
}

pub fn verify_mac(key: &[u8], message: &[u8], tag: &[u8]) -> Result<(), SessionError> {
    let mut m = <MacFn as KeyInit>::new_from_slice(key).map_err(|_| SessionError::Malformed("bad MAC key".into()))?;
    m.update(message);
    m.verify_slice(tag).map_err(|_| SessionError::BadMac)
}

pub fn encrypt(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, SessionError> {
    let cipher = TdesCbcEnc::new_from_slices(key, iv).map_err(|_| SessionError::Malformed("bad key or IV".into()))?;
    Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

pub fn decrypt(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, SessionError> {
    let cipher = TdesCbcDec::new_from_slices(key, iv).map_err(|_| SessionError::Malformed("bad key or IV".into()))?;
    cipher.decrypt_padded_vec_mut::<Pkcs7>(ciphertext).map_err(|_| SessionError::Decrypt)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hash_random_is_a_stream() {
        let mut a = HashRandom::new(b"seed");
        let mut b = HashRandom::new(b"seed");
        let whole = a.get(100);
        let mut pieces = b.get(30);
        pieces.extend(b.get(70));
        assert_eq!(whole, pieces);
        assert_ne!(HashRandom::new(b"other").get(24), whole[..24].to_vec());
    }

    #[test]
    fn mix_is_ordered() {
        let a = PeerId::digest(b"a");
        let b = PeerId::digest(b"b");
        assert_ne!(mix(&a, &b, b"x"), mix(&b, &a, b"x"));
        assert_eq!(mix(&a, &b, b"x"), mix(&a, &b, b"x"));
    }

    #[test]
    fn symmetric_round_trip_and_mac() {
        let key = derive_key(&PeerId::digest(b"a"), &PeerId::digest(b"b"), b"seed");
        let iv = [3u8; SIZE_OF_IV];
        let ct = encrypt(&key[..], &iv, b"attack at dawn").expect("encrypt");
        assert_eq!(decrypt(&key[..], &iv, &ct).expect("decrypt"), b"attack at dawn");
        let tag = mac(&key[..], b"attack at dawn").expect("mac");
        verify_mac(&key[..], b"attack at dawn", &tag).expect("valid mac");
        assert!(matches!(verify_mac(&key[..], b"attack at dusk", &tag), Err(SessionError::BadMac)));
    }
}
