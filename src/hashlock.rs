//! Hashlock codec
//!
//! Generates swap secrets from the OS CSPRNG, derives the on-chain commitment
//! with the hash construction the deployed HTLC contracts use, and converts
//! values to and from their chain-native representations (0x hex words,
//! 256-bit integers, unix-second timelocks).

use crate::error::{SwapError, SwapResult};

use chrono::{DateTime, TimeZone, Utc};
use ethers::types::{H256, U256};
use rand::rngs::OsRng;
use rand::TryRngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use sha3::Keccak256;
use std::fmt;
use std::str::FromStr;

/// Hash construction checked by an HTLC contract when a preimage is presented
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashFunction {
    Sha256,
    Keccak256,
}

impl fmt::Display for HashFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashFunction::Sha256 => write!(f, "sha256"),
            HashFunction::Keccak256 => write!(f, "keccak256"),
        }
    }
}

/// Encode 32 bytes as 0x-prefixed lowercase hex
pub fn encode_hex32(bytes: &[u8; 32]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Decode exactly 32 bytes of hex, with or without 0x prefix
pub fn decode_hex32(input: &str) -> SwapResult<[u8; 32]> {
    let stripped = input.strip_prefix("0x").unwrap_or(input);
    let bytes = hex::decode(stripped)
        .map_err(|e| SwapError::Validation(format!("invalid hex value {}: {}", input, e)))?;
    if bytes.len() != 32 {
        return Err(SwapError::Validation(format!(
            "expected 32 bytes, got {}",
            bytes.len()
        )));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Fill a buffer from the OS CSPRNG. There is no fallback generator.
pub fn fill_random(buf: &mut [u8]) -> SwapResult<()> {
    OsRng
        .try_fill_bytes(buf)
        .map_err(|e| SwapError::Randomness(e.to_string()))
}

/// Public 32-byte values shared with the chain: hex display, hex serde, H256 words
macro_rules! bytes32_codec {
    ($name:ident) => {
        impl $name {
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            pub fn to_h256(&self) -> ethers::types::H256 {
                ethers::types::H256::from(self.0)
            }

            pub fn from_h256(word: ethers::types::H256) -> Self {
                Self(word.0)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&$crate::hashlock::encode_hex32(&self.0))
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::error::SwapError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $crate::hashlock::decode_hex32(s).map(Self)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = <String as serde::Deserialize>::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

pub(crate) use bytes32_codec;

/// The public commitment `H(secret)` gating redemption
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Hashlock(pub [u8; 32]);

bytes32_codec!(Hashlock);

/// 256-bit swap preimage. Never printed: Debug is redacted and there is no Display.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret([u8; 32]);

impl Secret {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// ABI word for the reveal transaction
    pub fn to_h256(&self) -> H256 {
        H256::from(self.0)
    }

    pub fn to_hex(&self) -> String {
        encode_hex32(&self.0)
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

impl FromStr for Secret {
    type Err = SwapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_hex32(s).map(Self)
    }
}

impl Serialize for Secret {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Generate a fresh swap secret
pub fn generate_secret() -> SwapResult<Secret> {
    let mut bytes = [0u8; 32];
    fill_random(&mut bytes)?;
    Ok(Secret(bytes))
}

/// Derive the hashlock for a secret
pub fn commit(secret: &Secret, hash_function: HashFunction) -> Hashlock {
    let mut out = [0u8; 32];
    match hash_function {
        HashFunction::Sha256 => out.copy_from_slice(&Sha256::digest(secret.as_bytes())),
        HashFunction::Keccak256 => out.copy_from_slice(&Keccak256::digest(secret.as_bytes())),
    }
    Hashlock(out)
}

/// Check a secret against a hashlock without early exit
pub fn verify(secret: &Secret, hashlock: &Hashlock, hash_function: HashFunction) -> bool {
    let candidate = commit(secret, hash_function);
    constant_time_eq(candidate.as_bytes(), hashlock.as_bytes())
}

/// Branch-free comparison: every byte is folded in, so timing does not depend
/// on where the first difference is. Keep it that way rather than using `==`.
fn constant_time_eq(a: &[u8; 32], b: &[u8; 32]) -> bool {
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Parse an amount in the asset's smallest unit, decimal or 0x hex
pub fn parse_amount(input: &str) -> SwapResult<U256> {
    let trimmed = input.trim();
    let parsed = match trimmed.strip_prefix("0x") {
        Some(hex) => U256::from_str_radix(hex, 16).map_err(|e| e.to_string()),
        None => U256::from_dec_str(trimmed).map_err(|e| e.to_string()),
    };
    parsed.map_err(|e| SwapError::Validation(format!("invalid amount {}: {}", input, e)))
}

/// Timelock as the on-chain unix-seconds word
pub fn timelock_to_word(timelock: DateTime<Utc>) -> U256 {
    U256::from(timelock.timestamp().max(0) as u64)
}

/// Timelock from on-chain unix seconds
pub fn timelock_from_secs(secs: u64) -> SwapResult<DateTime<Utc>> {
    i64::try_from(secs)
        .ok()
        .and_then(|s| Utc.timestamp_opt(s, 0).single())
        .ok_or_else(|| SwapError::Validation(format!("timelock {} out of range", secs)))
}
