//! Wire messages exchanged over a peer link.
//!
//! A versioned tagged union with an explicit `type` discriminant. Binary
//! image bytes travel base64-encoded inside the JSON payload. Messages
//! with an unrecognised `type` decode to [`WireMessage::Unknown`], which
//! preserves the raw value and is ignored on receipt — newer peers can
//! ship new message kinds without breaking older ones. Structurally
//! invalid payloads (bad JSON, a known type with the wrong shape) are
//! rejected outright.

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use tally_core::doc::StateVector;
use tally_core::model::id::{AccountId, DeviceId, EntityId};
use tally_core::op::Op;

use crate::presence::PresenceState;

/// Current wire schema version, carried on every message.
pub const WIRE_VERSION: u8 = 1;

/// Error returned for a structurally invalid message.
#[derive(Debug, thiserror::Error)]
#[error("malformed wire message: {0}")]
pub struct WireError(String);

/// Handshake payload, sent by both sides as the first message on a link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    /// The sending device.
    pub device: DeviceId,
    /// The account being synced; links between different accounts are
    /// refused.
    pub account: AccountId,
    /// The sender's per-device high-water marks, used by the receiver to
    /// compute the delta.
    pub state: StateVector,
    /// The sender's display identity.
    pub presence: PresenceState,
}

/// A message on a peer link.
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    /// Handshake and (re-)sync trigger.
    Hello(Hello),
    /// A batch of ops, in the sender's per-device causal order.
    Ops {
        /// The op batch.
        ops: Vec<Op>,
    },
    /// Presence refresh.
    Presence {
        /// The sender's display identity.
        state: PresenceState,
    },
    /// Ask the peer for a receipt image.
    ImageRequest {
        /// The image being requested.
        image_id: EntityId,
    },
    /// Answer to an [`WireMessage::ImageRequest`]; `bytes` is absent when
    /// the responder does not hold the blob.
    ImageResponse {
        /// The image this answers for.
        image_id: EntityId,
        /// The blob, if held locally.
        bytes: Option<Vec<u8>>,
    },
    /// Graceful link shutdown.
    Bye,
    /// A message kind from a newer peer, preserved verbatim and ignored.
    Unknown(Value),
}

impl WireMessage {
    /// Encode to the JSON wire form.
    #[must_use]
    pub fn encode(&self) -> String {
        let value = match self {
            Self::Hello(hello) => tag("hello", serde_json::to_value(hello).unwrap_or_default()),
            Self::Ops { ops } => tag(
                "ops",
                serde_json::json!({ "ops": ops }),
            ),
            Self::Presence { state } => tag(
                "presence",
                serde_json::json!({ "state": state }),
            ),
            Self::ImageRequest { image_id } => tag(
                "image_request",
                serde_json::json!({ "image_id": image_id }),
            ),
            Self::ImageResponse { image_id, bytes } => {
                let encoded = bytes
                    .as_ref()
                    .map(|b| base64::engine::general_purpose::STANDARD.encode(b));
                tag(
                    "image_response",
                    serde_json::json!({ "image_id": image_id, "bytes": encoded }),
                )
            }
            Self::Bye => tag("bye", serde_json::json!({})),
            Self::Unknown(value) => value.clone(),
        };
        value.to_string()
    }

    /// Decode from the JSON wire form.
    ///
    /// # Errors
    ///
    /// Returns a [`WireError`] for invalid JSON, a non-object payload, or
    /// a known `type` whose body does not match its schema. An unknown
    /// `type` is NOT an error — it decodes to [`WireMessage::Unknown`].
    pub fn decode(raw: &str) -> Result<Self, WireError> {
        let value: Value =
            serde_json::from_str(raw).map_err(|err| WireError(err.to_string()))?;
        let Some(object) = value.as_object() else {
            return Err(WireError("not a JSON object".to_string()));
        };
        let Some(kind) = object.get("type").and_then(Value::as_str) else {
            return Err(WireError("missing type discriminant".to_string()));
        };

        let field = |name: &str| {
            object
                .get(name)
                .cloned()
                .ok_or_else(|| WireError(format!("{kind} message missing '{name}'")))
        };

        match kind {
            "hello" => serde_json::from_value(value.clone())
                .map(Self::Hello)
                .map_err(|err| WireError(err.to_string())),
            "ops" => {
                let ops = serde_json::from_value(field("ops")?)
                    .map_err(|err| WireError(err.to_string()))?;
                Ok(Self::Ops { ops })
            }
            "presence" => {
                let state = serde_json::from_value(field("state")?)
                    .map_err(|err| WireError(err.to_string()))?;
                Ok(Self::Presence { state })
            }
            "image_request" => {
                let image_id = serde_json::from_value(field("image_id")?)
                    .map_err(|err| WireError(err.to_string()))?;
                Ok(Self::ImageRequest { image_id })
            }
            "image_response" => {
                let image_id = serde_json::from_value(field("image_id")?)
                    .map_err(|err| WireError(err.to_string()))?;
                let bytes = match object.get("bytes") {
                    None | Some(Value::Null) => None,
                    Some(Value::String(encoded)) => Some(
                        base64::engine::general_purpose::STANDARD
                            .decode(encoded)
                            .map_err(|err| WireError(err.to_string()))?,
                    ),
                    Some(other) => {
                        return Err(WireError(format!("bytes must be base64, got {other}")));
                    }
                };
                Ok(Self::ImageResponse { image_id, bytes })
            }
            "bye" => Ok(Self::Bye),
            _ => Ok(Self::Unknown(value)),
        }
    }
}

/// Stamp the version and type discriminant onto a payload object.
fn tag(kind: &str, mut payload: Value) -> Value {
    if let Some(object) = payload.as_object_mut() {
        object.insert("v".to_string(), Value::from(WIRE_VERSION));
        object.insert("type".to_string(), Value::from(kind));
    }
    payload
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
