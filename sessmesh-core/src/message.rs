//! Change messages exchanged between nodes over the change bus.
//!
//! # Wire format
//!
//! One frame per message: a single format byte (`b'J'` for JSON, `b'M'` for
//! MessagePack) followed by the encoded [`ChangeMessage`]. Both encodings are
//! self-describing, so attribute values keep their JSON type on the receiver
//! without any schema exchange. In JSON the body looks like:
//!
//! ```json
//! {"session_id":"01J...","origin":"5f0c...","change":{"type":"attribute_set","name":"cart","value":[1,2]}}
//! ```
//!
//! The format byte lets a receiver configured for one encoding reject frames
//! from a misconfigured peer as a decode error instead of misreading them.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::config::EncodingFormat;
use crate::error::{Error, Result};
use crate::ids::NodeId;

/// Attribute values are arbitrary JSON-shaped data.
pub type AttrValue = serde_json::Value;

/// One replicated mutation of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Change {
    AttributeSet {
        name: String,
        value: AttrValue,
    },
    AttributesBulkSet {
        attrs: HashMap<String, AttrValue>,
    },
    AttributesRemoved {
        names: BTreeSet<String>,
    },
    /// The session was cleared or invalidated on the origin node; receivers
    /// drop their resident copy.
    SessionCleared,
}

/// A [`Change`] stamped with the session it belongs to and the node that made it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeMessage {
    session_id: String,
    origin: String,
    change: Change,
}

impl ChangeMessage {
    pub fn new(origin: &NodeId, session_id: impl Into<String>, change: Change) -> Self {
        Self {
            session_id: session_id.into(),
            origin: origin.as_str().to_string(),
            change,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn change(&self) -> &Change {
        &self.change
    }

    pub fn into_change(self) -> Change {
        self.change
    }

    pub fn is_from(&self, node: &NodeId) -> bool {
        self.origin == node.as_str()
    }
}

/// Encoder/decoder for change frames, chosen once from configuration.
#[derive(Debug, Clone, Copy)]
pub struct Codec {
    format: EncodingFormat,
}

impl Codec {
    pub fn for_format(format: EncodingFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> EncodingFormat {
        self.format
    }

    fn tag(format: EncodingFormat) -> u8 {
        match format {
            EncodingFormat::Json => b'J',
            EncodingFormat::Msgpack => b'M',
        }
    }

    pub fn encode(&self, msg: &ChangeMessage) -> Result<Vec<u8>> {
        let mut frame = vec![Self::tag(self.format)];
        match self.format {
            EncodingFormat::Json => serde_json::to_writer(&mut frame, msg)
                .map_err(|e| Error::Decode(format!("json encode: {e}")))?,
            EncodingFormat::Msgpack => {
                let body = rmp_serde::to_vec_named(msg)
                    .map_err(|e| Error::Decode(format!("msgpack encode: {e}")))?;
                frame.extend_from_slice(&body);
            }
        }
        Ok(frame)
    }

    pub fn decode(&self, frame: &[u8]) -> Result<ChangeMessage> {
        let (&tag, body) = frame
            .split_first()
            .ok_or_else(|| Error::Decode("empty frame".into()))?;
        if tag != Self::tag(self.format) {
            return Err(Error::Decode(format!(
                "frame format byte {tag:#04x} does not match configured {:?}",
                self.format
            )));
        }
        match self.format {
            EncodingFormat::Json => {
                serde_json::from_slice(body).map_err(|e| Error::Decode(format!("json: {e}")))
            }
            EncodingFormat::Msgpack => {
                rmp_serde::from_slice(body).map_err(|e| Error::Decode(format!("msgpack: {e}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> ChangeMessage {
        let attrs = HashMap::from([
            ("cart".to_string(), json!([{"sku": "A1", "qty": 2}])),
            ("visits".to_string(), json!(7)),
            ("ratio".to_string(), json!(0.5)),
            ("flag".to_string(), json!(null)),
        ]);
        ChangeMessage::new(&NodeId::from("node-a"), "s1", Change::AttributesBulkSet { attrs })
    }

    #[test]
    fn json_frame_is_tagged_and_readable() {
        let codec = Codec::for_format(EncodingFormat::Json);
        let msg = ChangeMessage::new(
            &NodeId::from("node-a"),
            "s1",
            Change::AttributeSet { name: "k".into(), value: json!("v") },
        );
        let frame = codec.encode(&msg).unwrap();
        assert_eq!(frame[0], b'J');
        let text = std::str::from_utf8(&frame[1..]).unwrap();
        assert!(text.contains("\"type\":\"attribute_set\""), "{text}");
        assert_eq!(codec.decode(&frame).unwrap(), msg);
    }

    #[test]
    fn msgpack_preserves_value_types() {
        let codec = Codec::for_format(EncodingFormat::Msgpack);
        let msg = sample();
        let decoded = codec.decode(&codec.encode(&msg).unwrap()).unwrap();
        let Change::AttributesBulkSet { attrs } = decoded.change() else {
            panic!("wrong variant: {decoded:?}");
        };
        assert_eq!(attrs["visits"], json!(7));
        assert!(attrs["visits"].is_u64());
        assert!(attrs["ratio"].is_f64());
        assert!(attrs["flag"].is_null());
        assert_eq!(attrs["cart"][0]["sku"], json!("A1"));
    }

    #[test]
    fn unit_variant_roundtrips_in_msgpack() {
        let codec = Codec::for_format(EncodingFormat::Msgpack);
        let msg = ChangeMessage::new(&NodeId::from("n"), "s", Change::SessionCleared);
        assert_eq!(codec.decode(&codec.encode(&msg).unwrap()).unwrap(), msg);
    }

    #[test]
    fn mismatched_format_is_a_decode_error() {
        let json = Codec::for_format(EncodingFormat::Json);
        let msgpack = Codec::for_format(EncodingFormat::Msgpack);
        let frame = json.encode(&sample()).unwrap();
        assert!(matches!(msgpack.decode(&frame), Err(Error::Decode(_))));
    }

    #[test]
    fn garbage_is_a_decode_error() {
        let codec = Codec::for_format(EncodingFormat::Json);
        assert!(matches!(codec.decode(b""), Err(Error::Decode(_))));
        assert!(matches!(codec.decode(b"J{not json"), Err(Error::Decode(_))));
        assert!(matches!(
            codec.decode(br#"J{"session_id":"s","origin":"n","change":{"type":"exploded"}}"#),
            Err(Error::Decode(_))
        ));
    }

    #[test]
    fn origin_check() {
        let msg = sample();
        assert!(msg.is_from(&NodeId::from("node-a")));
        assert!(!msg.is_from(&NodeId::from("node-b")));
    }
}
