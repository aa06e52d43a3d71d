//! Identifier newtypes.
//!
//! Two identifier shapes exist in tally:
//!
//! - [`EntityId`] / [`AccountId`]: 128 bits of entropy rendered as 32
//!   lowercase hex characters. Used for expenses, people, payments, images,
//!   and accounts. Never derived from a counter — merge correctness depends
//!   on ids being globally unique across every device that will ever sync.
//! - [`DeviceId`]: a short human-typeable 6-character code drawn from an
//!   alphabet with the visually confusable characters (`0 O 1 I L`)
//!   removed. Used for manual entry, invites, and presence.

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Alphabet for device codes: digits and uppercase letters minus the
/// visually confusable `0 O 1 I L`.
pub const DEVICE_ALPHABET: &[u8] = b"23456789ABCDEFGHJKMNPQRSTUVWXYZ";

/// Length of a device code.
pub const DEVICE_CODE_LEN: usize = 6;

const ENTITY_HEX_LEN: usize = 32;

/// Error returned when parsing a malformed identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind} identifier '{raw}'")]
pub struct ParseIdError {
    /// Which identifier shape was expected.
    pub kind: &'static str,
    /// The rejected input.
    pub raw: String,
}

macro_rules! hex_id {
    ($name:ident, $kind:literal) => {
        /// 128-bit random identifier, 32 lowercase hex characters.
        #[derive(
            Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Generate a fresh identifier from the given entropy source.
            #[must_use]
            pub fn generate<R: Rng>(rng: &mut R) -> Self {
                use std::fmt::Write as _;
                let bytes: [u8; 16] = rng.gen();
                let mut s = String::with_capacity(ENTITY_HEX_LEN);
                for b in bytes {
                    write!(s, "{b:02x}").expect("write to String cannot fail");
                }
                Self(s)
            }

            /// Construct without validation. For tests and trusted storage
            /// reads only.
            #[must_use]
            pub fn new_unchecked(raw: &str) -> Self {
                Self(raw.to_string())
            }

            /// The identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let ok = s.len() == ENTITY_HEX_LEN
                    && s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase());
                if ok {
                    Ok(Self(s.to_string()))
                } else {
                    Err(ParseIdError {
                        kind: $kind,
                        raw: s.to_string(),
                    })
                }
            }
        }

        impl TryFrom<String> for $name {
            type Error = ParseIdError;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                s.parse()
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

hex_id!(EntityId, "entity");
hex_id!(AccountId, "account");

// ---------------------------------------------------------------------------
// DeviceId
// ---------------------------------------------------------------------------

/// Short human-typeable device code.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId(String);

impl DeviceId {
    /// Generate a fresh 6-character code from the unambiguous alphabet.
    #[must_use]
    pub fn generate<R: Rng>(rng: &mut R) -> Self {
        let code: String = (0..DEVICE_CODE_LEN)
            .map(|_| {
                let idx = rng.gen_range(0..DEVICE_ALPHABET.len());
                DEVICE_ALPHABET[idx] as char
            })
            .collect();
        Self(code)
    }

    /// Construct without validation. For tests and trusted storage reads
    /// only.
    #[must_use]
    pub fn new_unchecked(raw: &str) -> Self {
        Self(raw.to_string())
    }

    /// The code as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for DeviceId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ok = s.len() == DEVICE_CODE_LEN
            && s.bytes().all(|b| DEVICE_ALPHABET.contains(&b));
        if ok {
            Ok(Self(s.to_string()))
        } else {
            Err(ParseIdError {
                kind: "device",
                raw: s.to_string(),
            })
        }
    }
}

impl TryFrom<String> for DeviceId {
    type Error = ParseIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn entity_id_generates_32_lowercase_hex() {
        let mut rng = StdRng::seed_from_u64(7);
        let id = EntityId::generate(&mut rng);
        assert_eq!(id.as_str().len(), 32);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert!(!id.as_str().chars().any(|c| c.is_ascii_uppercase()));
    }

    #[test]
    fn entity_id_roundtrips_through_str() {
        let mut rng = StdRng::seed_from_u64(8);
        let id = EntityId::generate(&mut rng);
        let parsed: EntityId = id.as_str().parse().expect("parse generated id");
        assert_eq!(id, parsed);
    }

    #[test]
    fn entity_id_rejects_bad_input() {
        assert!("".parse::<EntityId>().is_err());
        assert!("short".parse::<EntityId>().is_err());
        // Right length, uppercase hex.
        assert!("ABCDEF00ABCDEF00ABCDEF00ABCDEF00".parse::<EntityId>().is_err());
        // Right length, non-hex.
        assert!("zzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz".parse::<EntityId>().is_err());
    }

    #[test]
    fn device_code_has_six_unambiguous_chars() {
        let mut rng = StdRng::seed_from_u64(9);
        for _ in 0..100 {
            let code = DeviceId::generate(&mut rng);
            assert_eq!(code.as_str().len(), DEVICE_CODE_LEN);
            for c in code.as_str().bytes() {
                assert!(DEVICE_ALPHABET.contains(&c));
            }
        }
    }

    #[test]
    fn device_alphabet_excludes_confusables() {
        for c in [b'0', b'O', b'1', b'I', b'L'] {
            assert!(!DEVICE_ALPHABET.contains(&c));
        }
    }

    #[test]
    fn device_code_rejects_bad_input() {
        assert!("A1B2C3".parse::<DeviceId>().is_err()); // contains '1'
        assert!("ABC".parse::<DeviceId>().is_err());
        assert!("abcdef".parse::<DeviceId>().is_err()); // lowercase
        assert!("A2B3C4".parse::<DeviceId>().is_ok());
    }

    #[test]
    fn serde_uses_plain_strings() {
        let id = DeviceId::new_unchecked("A2B3C4");
        let json = serde_json::to_string(&id).expect("serialize");
        assert_eq!(json, "\"A2B3C4\"");
        let back: DeviceId = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, id);
    }
}
