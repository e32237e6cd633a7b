//! E2EE cryptographic primitives.
//!
//! This module provides X25519 key agreement, the AES-256-CBC key wrap used
//! to distribute group keys and login key chains, the AES-256-GCM message
//! seal with its associated data layout.
//!
//! Nothing here touches storage or the network; the key lookup policy lives
//! in the client crate.

use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyInit, KeyIvInit};
use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{ProtocolError, Result};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Length of X25519 private and public keys.
pub const KEY_LENGTH: usize = 32;

/// Length of the per-message salt.
pub const SALT_LENGTH: usize = 16;

/// Length of the AES-GCM nonce.
pub const NONCE_LENGTH: usize = 12;

/// Length of the AES-GCM authentication tag.
pub const TAG_LENGTH: usize = 16;

/// AES block size, also the padding granularity.
pub const BLOCK_SIZE: usize = 16;

/// An X25519 key pair.
#[derive(Clone)]
pub struct KeyPair {
    private: [u8; KEY_LENGTH],
    public: [u8; KEY_LENGTH],
}

impl KeyPair {
    /// Generates a new random key pair from the OS RNG.
    pub fn generate() -> Self {
        let private = random_bytes::<KEY_LENGTH>();
        let public = public_key_of(&private);
        Self { private, public }
    }

    /// Rebuilds a key pair from stored private key bytes.
    pub fn from_private(private: &[u8]) -> Result<Self> {
        let private = key_array(private, "private key")?;
        let public = public_key_of(&private);
        Ok(Self { private, public })
    }

    pub fn private_key(&self) -> &[u8; KEY_LENGTH] {
        &self.private
    }

    pub fn public_key(&self) -> &[u8; KEY_LENGTH] {
        &self.public
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("private", &"[REDACTED]")
            .field("public", &self.public)
            .finish()
    }
}

fn key_array(bytes: &[u8], what: &str) -> Result<[u8; KEY_LENGTH]> {
    bytes.try_into().map_err(|_| {
        ProtocolError::InvalidKey(format!(
            "{} must be {} bytes, got {}",
            what,
            KEY_LENGTH,
            bytes.len()
        ))
    })
}

fn public_key_of(private: &[u8; KEY_LENGTH]) -> [u8; KEY_LENGTH] {
    PublicKey::from(&StaticSecret::from(*private)).to_bytes()
}

/// Derives the public key for a stored private key.
pub fn public_key_from_private(private: &[u8]) -> Result<[u8; KEY_LENGTH]> {
    Ok(public_key_of(&key_array(private, "private key")?))
}

/// X25519 shared secret between `private` and `public`.
pub fn shared_secret(private: &[u8], public: &[u8]) -> Result<[u8; KEY_LENGTH]> {
    let secret = StaticSecret::from(key_array(private, "private key")?);
    let public = PublicKey::from(key_array(public, "public key")?);
    Ok(secret.diffie_hellman(&public).to_bytes())
}

/// SHA-256 over the concatenation of `parts`.
pub fn sha256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// XORs the first half of `buf` with the second half.
pub fn xor_halves(buf: &[u8]) -> Vec<u8> {
    let half = buf.len() / 2;
    buf[..half]
        .iter()
        .zip(&buf[half..half * 2])
        .map(|(a, b)| a ^ b)
        .collect()
}

/// Fills an array from the OS RNG.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    OsRng.fill_bytes(&mut out);
    out
}

/// PKCS#7 pads `data` to a multiple of [`BLOCK_SIZE`].
///
/// Already-aligned input gains a full block of padding.
pub fn pad(data: &[u8]) -> Vec<u8> {
    let pad_len = BLOCK_SIZE - data.len() % BLOCK_SIZE;
    let mut out = Vec::with_capacity(data.len() + pad_len);
    out.extend_from_slice(data);
    out.resize(data.len() + pad_len, pad_len as u8);
    out
}

/// Removes PKCS#7 padding.
///
/// Input whose last byte is not a pad length in `1..=16`, or whose tail is
/// not uniform, is returned unchanged.
pub fn unpad(data: &[u8]) -> &[u8] {
    let Some(&last) = data.last() else {
        return data;
    };
    let pad_len = usize::from(last);
    if pad_len == 0 || pad_len > BLOCK_SIZE || pad_len > data.len() {
        return data;
    }
    let (body, tail) = data.split_at(data.len() - pad_len);
    if tail.iter().all(|&b| b == last) {
        body
    } else {
        data
    }
}

fn cbc_key_iv(secret: &[u8]) -> ([u8; 32], Vec<u8>) {
    let key = sha256(&[secret, b"Key"]);
    let iv = xor_halves(&sha256(&[secret, b"IV"]));
    (key, iv)
}

/// Encrypts `plain` for a peer: AES-256-CBC keyed by `secret`, PKCS#7 padded.
pub fn wrap_key(secret: &[u8], plain: &[u8]) -> Result<Vec<u8>> {
    let (key, iv) = cbc_key_iv(secret);
    let cipher = Aes256CbcEnc::new_from_slices(&key, &iv)
        .map_err(|e| ProtocolError::Encryption(e.to_string()))?;
    Ok(cipher.encrypt_padded_vec_mut::<NoPadding>(&pad(plain)))
}

/// AES-256-CBC decryption keyed by `secret`, without removing padding.
pub fn cbc_decrypt(secret: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let (key, iv) = cbc_key_iv(secret);
    let cipher = Aes256CbcDec::new_from_slices(&key, &iv)
        .map_err(|e| ProtocolError::Decryption(e.to_string()))?;
    cipher
        .decrypt_padded_vec_mut::<NoPadding>(data)
        .map_err(|_| {
            ProtocolError::Decryption(format!(
                "ciphertext length {} is not a multiple of {}",
                data.len(),
                BLOCK_SIZE
            ))
        })
}

/// Reverses [`wrap_key`].
///
/// Fails with [`ProtocolError::InvalidPadding`] when the decrypted block has
/// no removable padding, which is how a wrong shared secret shows up.
pub fn unwrap_key(secret: &[u8], wrapped: &[u8]) -> Result<Vec<u8>> {
    let raw = cbc_decrypt(secret, wrapped)?;
    let mut plain = unpad(&raw);
    if plain.len() == raw.len() {
        return Err(ProtocolError::InvalidPadding(raw.last().copied().unwrap_or(0)));
    }
    // doubly padded keys: strip one more uniform block
    if plain.len() == 48 {
        let tail = &plain[32..];
        let last = tail[BLOCK_SIZE - 1];
        if tail.iter().all(|&b| b == last) && usize::from(last) <= BLOCK_SIZE {
            plain = &plain[..48 - usize::from(last)];
        }
    }
    Ok(plain.to_vec())
}

/// Associated data bound into every message seal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AadContext<'a> {
    pub to: &'a str,
    pub from: &'a str,
    pub sender_key_id: i32,
    pub receiver_key_id: i32,
    pub spec_version: i32,
    pub content_type: i32,
}

impl AadContext<'_> {
    /// `to ‖ from ‖ be32(sender) ‖ be32(receiver) ‖ be32(version) ‖ be32(type)`.
    pub fn to_bytes(&self) -> Vec<u8> {
        build_aad(
            self.to,
            self.from,
            self.sender_key_id,
            self.receiver_key_id,
            self.spec_version,
            self.content_type,
        )
    }
}

/// Builds the associated data for a message seal.
pub fn build_aad(
    to: &str,
    from: &str,
    sender_key_id: i32,
    receiver_key_id: i32,
    spec_version: i32,
    content_type: i32,
) -> Vec<u8> {
    let mut aad = Vec::with_capacity(to.len() + from.len() + 16);
    aad.extend_from_slice(to.as_bytes());
    aad.extend_from_slice(from.as_bytes());
    for word in [sender_key_id, receiver_key_id, spec_version, content_type] {
        aad.extend_from_slice(&(word as u32).to_be_bytes());
    }
    aad
}

/// The five chunks an encrypted message carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageChunks {
    pub salt: Vec<u8>,
    /// Ciphertext followed by the 16-byte tag.
    pub sealed: Vec<u8>,
    pub nonce: Vec<u8>,
    pub sender_key_id: i32,
    pub receiver_key_id: i32,
}

impl MessageChunks {
    /// `[salt, ciphertext‖tag, nonce, be32(sender), be32(receiver)]`.
    pub fn to_chunks(&self) -> Vec<Vec<u8>> {
        vec![
            self.salt.clone(),
            self.sealed.clone(),
            self.nonce.clone(),
            (self.sender_key_id as u32).to_be_bytes().to_vec(),
            (self.receiver_key_id as u32).to_be_bytes().to_vec(),
        ]
    }

    /// Parses the chunk list of a received message.
    pub fn from_chunks<B: AsRef<[u8]>>(chunks: &[B]) -> Result<Self> {
        if chunks.len() < 5 {
            return Err(ProtocolError::Decryption(format!(
                "expected 5 chunks, got {}",
                chunks.len()
            )));
        }
        Ok(Self {
            salt: chunks[0].as_ref().to_vec(),
            sealed: chunks[1].as_ref().to_vec(),
            nonce: chunks[2].as_ref().to_vec(),
            sender_key_id: decode_key_id(chunks[3].as_ref())?,
            receiver_key_id: decode_key_id(chunks[4].as_ref())?,
        })
    }
}

/// Reads a big-endian key id chunk of at most four bytes.
pub fn decode_key_id(bytes: &[u8]) -> Result<i32> {
    if bytes.len() > 4 {
        return Err(ProtocolError::InvalidKey(format!(
            "key id chunk of {} bytes",
            bytes.len()
        )));
    }
    let value = bytes
        .iter()
        .fold(0u32, |acc, &b| (acc << 8) | u32::from(b));
    Ok(value as i32)
}

fn gcm_cipher(secret: &[u8], salt: &[u8]) -> Result<Aes256Gcm> {
    let key = sha256(&[secret, salt, b"Key"]);
    Aes256Gcm::new_from_slice(&key).map_err(|e| ProtocolError::InvalidKey(e.to_string()))
}

/// Seals `plaintext` with a fresh salt and nonce.
///
/// The key ids in `aad` are copied into the returned chunks.
pub fn seal_message(secret: &[u8], aad: &AadContext<'_>, plaintext: &[u8]) -> Result<MessageChunks> {
    let salt = random_bytes::<SALT_LENGTH>();
    let nonce = random_bytes::<NONCE_LENGTH>();
    let cipher = gcm_cipher(secret, &salt)?;
    let aad_bytes = aad.to_bytes();
    let sealed = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: &aad_bytes,
            },
        )
        .map_err(|_| ProtocolError::Encryption("AES-GCM seal failed".to_string()))?;

    Ok(MessageChunks {
        salt: salt.to_vec(),
        sealed,
        nonce: nonce.to_vec(),
        sender_key_id: aad.sender_key_id,
        receiver_key_id: aad.receiver_key_id,
    })
}

/// Opens sealed chunks, verifying the tag against `aad`.
///
/// Any tampering with the ciphertext, tag, nonce, salt or associated data
/// yields [`ProtocolError::Decryption`].
pub fn open_message(secret: &[u8], aad: &AadContext<'_>, chunks: &MessageChunks) -> Result<Vec<u8>> {
    if chunks.nonce.len() != NONCE_LENGTH {
        return Err(ProtocolError::Decryption(format!(
            "nonce must be {} bytes, got {}",
            NONCE_LENGTH,
            chunks.nonce.len()
        )));
    }
    if chunks.sealed.len() < TAG_LENGTH {
        return Err(ProtocolError::Decryption("ciphertext shorter than tag".to_string()));
    }
    let cipher = gcm_cipher(secret, &chunks.salt)?;
    let aad_bytes = aad.to_bytes();
    cipher
        .decrypt(
            Nonce::from_slice(&chunks.nonce),
            Payload {
                msg: &chunks.sealed,
                aad: &aad_bytes,
            },
        )
        .map_err(|_| ProtocolError::Decryption("authentication tag mismatch".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair_secret() -> (KeyPair, KeyPair, [u8; 32]) {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let secret = shared_secret(alice.private_key(), bob.public_key()).unwrap();
        (alice, bob, secret)
    }

    #[test]
    fn test_shared_secret_agrees() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let ab = shared_secret(alice.private_key(), bob.public_key()).unwrap();
        let ba = shared_secret(bob.private_key(), alice.public_key()).unwrap();
        assert_eq!(ab, ba);
    }

    #[test]
    fn test_key_pair_from_private_is_stable() {
        let pair = KeyPair::generate();
        let again = KeyPair::from_private(pair.private_key()).unwrap();
        assert_eq!(pair.public_key(), again.public_key());
        assert_eq!(
            public_key_from_private(pair.private_key()).unwrap(),
            *pair.public_key()
        );
    }

    #[test]
    fn test_invalid_key_length() {
        assert!(matches!(
            shared_secret(&[0u8; 31], &[0u8; 32]),
            Err(ProtocolError::InvalidKey(_))
        ));
        assert!(KeyPair::from_private(&[1u8; 33]).is_err());
    }

    #[test]
    fn test_key_pair_debug_redacts_private() {
        let pair = KeyPair::from_private(&[7u8; 32]).unwrap();
        let debug = format!("{:?}", pair);
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("7, 7, 7"));
    }

    #[test]
    fn test_xor_halves() {
        assert_eq!(xor_halves(&[0x0f, 0xf0, 0xff, 0xff]), vec![0xf0, 0x0f]);
        assert_eq!(xor_halves(&sha256(&[b"x"])).len(), 16);
    }

    #[test]
    fn test_sha256_concatenates_parts() {
        assert_eq!(sha256(&[b"ab", b"c"]), sha256(&[b"abc"]));
    }

    #[test]
    fn test_pad_unpad_boundaries() {
        for len in [0usize, 1, 15, 16, 17, 31, 32, 33] {
            let data: Vec<u8> = (0..len as u8).collect();
            let padded = pad(&data);
            assert_eq!(padded.len() % BLOCK_SIZE, 0);
            assert!(padded.len() > data.len());
            assert_eq!(unpad(&padded), &data[..]);
        }
    }

    #[test]
    fn test_unpad_tolerates_bad_padding() {
        let data = [1u8, 2, 3, 0];
        assert_eq!(unpad(&data), &data[..]);
        let data = [1u8, 2, 3, 17];
        assert_eq!(unpad(&data), &data[..]);
        let data = [9u8, 2, 3, 3];
        assert_eq!(unpad(&data), &data[..]);
        assert_eq!(unpad(&[]), &[] as &[u8]);
    }

    #[test]
    fn test_wrap_unwrap_group_key() {
        let (_, _, secret) = pair_secret();
        let group_private = random_bytes::<32>();
        let wrapped = wrap_key(&secret, &group_private).unwrap();
        assert_eq!(wrapped.len(), 48);
        assert_eq!(unwrap_key(&secret, &wrapped).unwrap(), group_private.to_vec());
    }

    #[test]
    fn test_unwrap_with_wrong_secret_fails_or_differs() {
        let (_, _, secret) = pair_secret();
        let plain = random_bytes::<32>();
        let wrapped = wrap_key(&secret, &plain).unwrap();
        let other = random_bytes::<32>();
        match unwrap_key(&other, &wrapped) {
            Err(ProtocolError::InvalidPadding(_)) => {}
            Ok(got) => assert_ne!(got, plain.to_vec()),
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_cbc_rejects_partial_block() {
        assert!(matches!(
            cbc_decrypt(&[1u8; 32], &[0u8; 20]),
            Err(ProtocolError::Decryption(_))
        ));
    }

    #[test]
    fn test_aad_layout() {
        let aad = build_aad("u1", "u2", 5, 6, 2, 15);
        let mut expected = b"u1u2".to_vec();
        expected.extend_from_slice(&[0, 0, 0, 5, 0, 0, 0, 6, 0, 0, 0, 2, 0, 0, 0, 15]);
        assert_eq!(aad, expected);
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let (_, _, secret) = pair_secret();
        let aad = AadContext {
            to: "ubob",
            from: "ualice",
            sender_key_id: 1,
            receiver_key_id: 5,
            spec_version: 2,
            content_type: 0,
        };
        let chunks = seal_message(&secret, &aad, br#"{"text":"hi"}"#).unwrap();
        assert_eq!(chunks.salt.len(), SALT_LENGTH);
        assert_eq!(chunks.nonce.len(), NONCE_LENGTH);
        assert_eq!(chunks.sealed.len(), 13 + TAG_LENGTH);

        let parsed = MessageChunks::from_chunks(&chunks.to_chunks()[..]).unwrap();
        assert_eq!(parsed, chunks);
        assert_eq!(
            open_message(&secret, &aad, &parsed).unwrap(),
            br#"{"text":"hi"}"#.to_vec()
        );
    }

    #[test]
    fn test_open_rejects_tampering() {
        let (_, _, secret) = pair_secret();
        let aad = AadContext {
            to: "ubob",
            from: "ualice",
            sender_key_id: 1,
            receiver_key_id: 5,
            spec_version: 2,
            content_type: 0,
        };
        let chunks = seal_message(&secret, &aad, b"payload").unwrap();

        let mut body = chunks.clone();
        body.sealed[0] ^= 1;
        assert!(open_message(&secret, &aad, &body).is_err());

        let mut tag = chunks.clone();
        let last = tag.sealed.len() - 1;
        tag.sealed[last] ^= 1;
        assert!(open_message(&secret, &aad, &tag).is_err());

        let wrong_to = AadContext { to: "ueve", ..aad };
        assert!(matches!(
            open_message(&secret, &wrong_to, &chunks),
            Err(ProtocolError::Decryption(_))
        ));

        let wrong_type = AadContext {
            content_type: 15,
            ..aad
        };
        assert!(open_message(&secret, &wrong_type, &chunks).is_err());
    }

    #[test]
    fn test_open_rejects_short_chunks() {
        let chunks = MessageChunks {
            salt: vec![0; 16],
            sealed: vec![0; 4],
            nonce: vec![0; 12],
            sender_key_id: 1,
            receiver_key_id: 1,
        };
        let aad = AadContext {
            to: "a",
            from: "b",
            sender_key_id: 1,
            receiver_key_id: 1,
            spec_version: 2,
            content_type: 0,
        };
        assert!(open_message(&[0u8; 32], &aad, &chunks).is_err());
        assert!(MessageChunks::from_chunks(&vec![vec![0u8]; 3][..]).is_err());
    }

    #[test]
    fn test_decode_key_id() {
        assert_eq!(decode_key_id(&[0, 0, 0, 5]).unwrap(), 5);
        assert_eq!(decode_key_id(&[1, 0]).unwrap(), 256);
        assert_eq!(decode_key_id(&[]).unwrap(), 0);
        assert!(decode_key_id(&[0, 0, 0, 0, 1]).is_err());
    }
}
