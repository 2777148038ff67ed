//! UPP envelopes
//!
//! A UPP (the protocol packet) is a versioned, hint-tagged structure
//! carrying a 32-byte payload and its signature. Two variants exist:
//!
//! - *signed*: `[version, uid, hint, payload, signature]`
//! - *chained*: `[version, uid, prev_signature, hint, payload, signature]`
//!
//! The wire encoding is a MessagePack array with bin-encoded byte fields.
//! The ECDSA signature covers the encoding of the same array without the
//! trailing signature element, so a verifier re-encodes the leading fields
//! and checks the signature against those bytes.
//!
//! The first chained envelope of an identity (the genesis link) carries 64
//! zero bytes as its previous signature.

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use uuid::Uuid;

use crate::crypto::{KeyPair, PublicKey, HASH_LEN, SIGNATURE_LEN};
use crate::error::{ProtocolError, Result};

/// Version tag of a signed (unchained) envelope
pub const VERSION_SIGNED: u8 = 0x22;

/// Version tag of a chained envelope
pub const VERSION_CHAINED: u8 = 0x23;

/// Previous-signature field of a genesis chained envelope
pub const GENESIS_PREV_SIGNATURE: [u8; SIGNATURE_LEN] = [0u8; SIGNATURE_LEN];

/// One-byte operation discriminator inside an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hint {
    Binary,
    Disable,
    Enable,
    Delete,
}

impl Hint {
    /// Wire value of the hint
    pub fn byte(self) -> u8 {
        match self {
            Hint::Binary => 0x00,
            Hint::Disable => 0xfa,
            Hint::Enable => 0xfb,
            Hint::Delete => 0xfc,
        }
    }

    /// Parse a wire value
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0x00 => Ok(Hint::Binary),
            0xfa => Ok(Hint::Disable),
            0xfb => Ok(Hint::Enable),
            0xfc => Ok(Hint::Delete),
            other => Err(ProtocolError::UnknownHint(other)),
        }
    }
}

/// A signed (unchained) envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedUpp {
    pub uid: Uuid,
    pub hint: Hint,
    pub payload: Vec<u8>,
    pub signature: Vec<u8>,
}

/// A chained envelope, linked to its predecessor by `prev_signature`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainedUpp {
    pub uid: Uuid,
    pub prev_signature: Vec<u8>,
    pub hint: Hint,
    pub payload: Vec<u8>,
    pub signature: Vec<u8>,
}

/// Either envelope variant, as decoded from wire bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upp {
    Signed(SignedUpp),
    Chained(ChainedUpp),
}

#[derive(Serialize)]
struct SignedParts<'a>(
    u8,
    #[serde(with = "serde_bytes")] &'a [u8],
    u8,
    #[serde(with = "serde_bytes")] &'a [u8],
);

#[derive(Serialize)]
struct SignedWireOut<'a>(
    u8,
    #[serde(with = "serde_bytes")] &'a [u8],
    u8,
    #[serde(with = "serde_bytes")] &'a [u8],
    #[serde(with = "serde_bytes")] &'a [u8],
);

#[derive(Serialize)]
struct ChainedParts<'a>(
    u8,
    #[serde(with = "serde_bytes")] &'a [u8],
    #[serde(with = "serde_bytes")] &'a [u8],
    u8,
    #[serde(with = "serde_bytes")] &'a [u8],
);

#[derive(Serialize)]
struct ChainedWireOut<'a>(
    u8,
    #[serde(with = "serde_bytes")] &'a [u8],
    #[serde(with = "serde_bytes")] &'a [u8],
    u8,
    #[serde(with = "serde_bytes")] &'a [u8],
    #[serde(with = "serde_bytes")] &'a [u8],
);

#[derive(Deserialize)]
struct SignedWireIn(u8, ByteBuf, u8, ByteBuf, ByteBuf);

#[derive(Deserialize)]
struct ChainedWireIn(u8, ByteBuf, ByteBuf, u8, ByteBuf, ByteBuf);

fn check_payload(payload: &[u8]) -> Result<()> {
    if payload.len() != HASH_LEN {
        return Err(ProtocolError::InvalidPayloadLength {
            expected: HASH_LEN,
            got: payload.len(),
        });
    }
    Ok(())
}

impl SignedUpp {
    /// Build and sign an envelope over a 32-byte payload hash
    pub fn sign(key: &KeyPair, uid: Uuid, hint: Hint, payload: &[u8]) -> Result<Self> {
        check_payload(payload)?;
        let input = rmp_serde::to_vec(&SignedParts(
            VERSION_SIGNED,
            uid.as_bytes(),
            hint.byte(),
            payload,
        ))?;
        let signature = key.sign(&input);
        Ok(Self {
            uid,
            hint,
            payload: payload.to_vec(),
            signature: signature.to_vec(),
        })
    }

    /// The bytes the signature covers
    pub fn signing_input(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(&SignedParts(
            VERSION_SIGNED,
            self.uid.as_bytes(),
            self.hint.byte(),
            &self.payload,
        ))?)
    }

    /// Wire encoding including the signature
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(&SignedWireOut(
            VERSION_SIGNED,
            self.uid.as_bytes(),
            self.hint.byte(),
            &self.payload,
            &self.signature,
        ))?)
    }
}

impl ChainedUpp {
    /// Build and sign a chained envelope; chained envelopes always carry
    /// the binary hint
    pub fn sign(key: &KeyPair, uid: Uuid, prev_signature: &[u8], payload: &[u8]) -> Result<Self> {
        check_payload(payload)?;
        if prev_signature.len() != SIGNATURE_LEN {
            return Err(ProtocolError::InvalidSignatureLength {
                expected: SIGNATURE_LEN,
                got: prev_signature.len(),
            });
        }
        let input = rmp_serde::to_vec(&ChainedParts(
            VERSION_CHAINED,
            uid.as_bytes(),
            prev_signature,
            Hint::Binary.byte(),
            payload,
        ))?;
        let signature = key.sign(&input);
        Ok(Self {
            uid,
            prev_signature: prev_signature.to_vec(),
            hint: Hint::Binary,
            payload: payload.to_vec(),
            signature: signature.to_vec(),
        })
    }

    /// The bytes the signature covers
    pub fn signing_input(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(&ChainedParts(
            VERSION_CHAINED,
            self.uid.as_bytes(),
            &self.prev_signature,
            self.hint.byte(),
            &self.payload,
        ))?)
    }

    /// Wire encoding including the signature
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(&ChainedWireOut(
            VERSION_CHAINED,
            self.uid.as_bytes(),
            &self.prev_signature,
            self.hint.byte(),
            &self.payload,
            &self.signature,
        ))?)
    }
}

impl Upp {
    /// Decode either envelope variant from wire bytes
    ///
    /// Payload length is not enforced here: backend response envelopes
    /// carry payloads longer than a hash (request id plus metadata).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if let Ok(w) = rmp_serde::from_slice::<ChainedWireIn>(bytes) {
            if w.0 != VERSION_CHAINED {
                return Err(ProtocolError::UnknownVersion(w.0));
            }
            let uid = Uuid::from_slice(&w.1)
                .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
            return Ok(Upp::Chained(ChainedUpp {
                uid,
                prev_signature: w.2.into_vec(),
                hint: Hint::from_byte(w.3)?,
                payload: w.4.into_vec(),
                signature: w.5.into_vec(),
            }));
        }

        let w: SignedWireIn = rmp_serde::from_slice(bytes)?;
        if w.0 != VERSION_SIGNED {
            return Err(ProtocolError::UnknownVersion(w.0));
        }
        let uid =
            Uuid::from_slice(&w.1).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Upp::Signed(SignedUpp {
            uid,
            hint: Hint::from_byte(w.2)?,
            payload: w.3.into_vec(),
            signature: w.4.into_vec(),
        }))
    }

    /// Identity the envelope belongs to
    pub fn uid(&self) -> Uuid {
        match self {
            Upp::Signed(u) => u.uid,
            Upp::Chained(u) => u.uid,
        }
    }

    /// Payload field
    pub fn payload(&self) -> &[u8] {
        match self {
            Upp::Signed(u) => &u.payload,
            Upp::Chained(u) => &u.payload,
        }
    }

    /// Signature field
    pub fn signature(&self) -> &[u8] {
        match self {
            Upp::Signed(u) => &u.signature,
            Upp::Chained(u) => &u.signature,
        }
    }

    /// Check the envelope signature under the given public key
    pub fn verify(&self, public_key: &PublicKey) -> Result<()> {
        let input = match self {
            Upp::Signed(u) => u.signing_input()?,
            Upp::Chained(u) => u.signing_input()?,
        };
        public_key.verify(&input, self.signature())
    }
}
