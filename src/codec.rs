// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Envelope Codec
//!
//! Payloads travel as JSON. When the bus is configured with an encryption key
//! the JSON bytes are sealed with AES-256-GCM before publishing; the wire
//! layout is then `nonce (12 bytes) || ciphertext || tag`. Without a key the
//! codec is a plain JSON serializer.

use crate::errors::AmqpError;
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use tracing::error;

const NONCE_LEN: usize = 12;

/// Content type of plaintext envelopes
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Content type of encrypted envelopes
pub const ENCRYPTED_CONTENT_TYPE: &str = "application/octet-stream";

/// Serializes payloads and optionally encrypts them.
#[derive(Clone, Default)]
pub struct EnvelopeCodec {
    cipher: Option<Aes256Gcm>,
}

impl fmt::Debug for EnvelopeCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvelopeCodec")
            .field("encrypted", &self.is_encrypted())
            .finish()
    }
}

impl EnvelopeCodec {
    /// Creates a codec. The AES key is the SHA-256 digest of `key`, so any
    /// passphrase length is accepted and the same passphrase always yields the
    /// same key.
    pub fn new(key: Option<&str>) -> EnvelopeCodec {
        let cipher = key.map(|passphrase| {
            let digest = Sha256::digest(passphrase.as_bytes());
            Aes256Gcm::new(&digest)
        });

        EnvelopeCodec { cipher }
    }

    /// Whether payloads are sealed with a key.
    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    /// Content type stamped on outgoing messages.
    pub fn content_type(&self) -> &'static str {
        if self.is_encrypted() {
            ENCRYPTED_CONTENT_TYPE
        } else {
            JSON_CONTENT_TYPE
        }
    }

    /// Serializes `payload` to JSON and seals it when a key is configured.
    pub fn encrypt<T>(&self, payload: &T) -> Result<Vec<u8>, AmqpError>
    where
        T: Serialize + ?Sized,
    {
        let plaintext = serde_json::to_vec(payload).map_err(|err| {
            error!(error = err.to_string(), "failure to serialize payload");
            AmqpError::SerializePayloadError
        })?;

        let Some(cipher) = &self.cipher else {
            return Ok(plaintext);
        };

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_slice())
            .map_err(|err| {
                error!(error = err.to_string(), "failure to encrypt payload");
                AmqpError::EncryptPayloadError
            })?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Opens `bytes` when a key is configured, then parses the JSON payload.
    pub fn decrypt<T>(&self, bytes: &[u8]) -> Result<T, AmqpError>
    where
        T: DeserializeOwned,
    {
        let plaintext = match &self.cipher {
            None => bytes.to_vec(),
            Some(cipher) => {
                if bytes.len() < NONCE_LEN {
                    error!(len = bytes.len(), "ciphertext too short");
                    return Err(AmqpError::DecryptPayloadError);
                }
                let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
                cipher
                    .decrypt(Nonce::from_slice(nonce), ciphertext)
                    .map_err(|err| {
                        error!(error = err.to_string(), "failure to decrypt payload");
                        AmqpError::DecryptPayloadError
                    })?
            }
        };

        serde_json::from_slice(&plaintext).map_err(|err| {
            error!(error = err.to_string(), "failure to parse payload");
            AmqpError::ParsePayloadError
        })
    }
}
