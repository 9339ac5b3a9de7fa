use secp256k1::schnorr::Signature;
use secp256k1::{Message, Secp256k1, VerifyOnly, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Maximum number of tags accepted on a single event.
pub const MAX_EVENT_TAGS: usize = 100;

/// Upper bound on `created_at` relative to the relay clock, in seconds.
pub const MAX_CREATED_AT_SKEW: i64 = 3600;

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("invalid: {0} is not well-formed hex of the expected length")]
    BadHexField(&'static str),
    #[error("invalid: event has too many tags")]
    TooManyTags,
    #[error("invalid: event has an empty tag")]
    EmptyTag,
    #[error("invalid: created_at is out of range")]
    CreatedAtOutOfRange,
    #[error("invalid: event id does not match")]
    IdMismatch,
}

/// A signed, immutable Nostr event as received on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    pub created_at: i64,
    pub kind: u64,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

impl Event {
    /// Canonical serialization used for the id digest:
    /// `[0, pubkey, created_at, kind, tags, content]` as compact JSON.
    pub fn canonical_serialization(&self) -> String {
        serde_json::json!([
            0,
            self.pubkey,
            self.created_at,
            self.kind,
            self.tags,
            self.content
        ])
        .to_string()
    }

    /// Recompute the event id from the canonical serialization.
    pub fn canonical_id(&self) -> String {
        let digest = Sha256::digest(self.canonical_serialization().as_bytes());
        hex::encode(digest)
    }

    /// Field-shape checks that need no cryptography: hex lengths, tag
    /// bounds, and the created_at window `[0, now + skew]`.
    pub fn validate_structure(&self, now: i64) -> Result<(), ValidationError> {
        decode_hex_field(&self.id, 32, "id")?;
        decode_hex_field(&self.pubkey, 32, "pubkey")?;
        decode_hex_field(&self.sig, 64, "sig")?;

        if self.tags.len() > MAX_EVENT_TAGS {
            return Err(ValidationError::TooManyTags);
        }
        if self.tags.iter().any(|t| t.is_empty()) {
            return Err(ValidationError::EmptyTag);
        }
        if self.created_at < 0 || self.created_at > now + MAX_CREATED_AT_SKEW {
            return Err(ValidationError::CreatedAtOutOfRange);
        }
        Ok(())
    }

    /// Verify that the claimed id is the digest of the canonical form.
    pub fn validate_id(&self) -> Result<(), ValidationError> {
        if self.canonical_id() != self.id {
            return Err(ValidationError::IdMismatch);
        }
        Ok(())
    }

}

fn decode_hex_field(
    value: &str,
    expected_bytes: usize,
    field: &'static str,
) -> Result<Vec<u8>, ValidationError> {
    let decoded = hex::decode(value).map_err(|_| ValidationError::BadHexField(field))?;
    if decoded.len() != expected_bytes {
        return Err(ValidationError::BadHexField(field));
    }
    Ok(decoded)
}

/// Signature verification seam. The relay worker treats this as the
/// dominant cost per event and only calls it after the cheaper structural
/// and id checks pass.
pub trait SigVerifier: Send + Sync {
    fn verify(&self, event: &Event) -> bool;
}

/// Schnorr verification over secp256k1: the message is the 32-byte event
/// id digest, the key is the x-only pubkey.
pub struct Secp256k1Verifier {
    secp: Secp256k1<VerifyOnly>,
}

impl Secp256k1Verifier {
    pub fn new() -> Secp256k1Verifier {
        Secp256k1Verifier {
            secp: Secp256k1::verification_only(),
        }
    }
}

impl Default for Secp256k1Verifier {
    fn default() -> Self {
        Secp256k1Verifier::new()
    }
}

impl SigVerifier for Secp256k1Verifier {
    fn verify(&self, event: &Event) -> bool {
        let id_bytes = match decode_hex_field(&event.id, 32, "id") {
            Ok(b) => b,
            Err(_) => return false,
        };
        let pk_bytes = match decode_hex_field(&event.pubkey, 32, "pubkey") {
            Ok(b) => b,
            Err(_) => return false,
        };
        let sig_bytes = match decode_hex_field(&event.sig, 64, "sig") {
            Ok(b) => b,
            Err(_) => return false,
        };

        let mut digest = [0u8; 32];
        digest.copy_from_slice(&id_bytes);
        let message = Message::from_digest(digest);

        let pubkey = match XOnlyPublicKey::from_slice(&pk_bytes) {
            Ok(pk) => pk,
            Err(_) => return false,
        };
        let signature = match Signature::from_slice(&sig_bytes) {
            Ok(sig) => sig,
            Err(_) => return false,
        };

        self.secp
            .verify_schnorr(&signature, &message, &pubkey)
            .is_ok()
    }
}
