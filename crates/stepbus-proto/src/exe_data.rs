//! Variable-publish messages on the data bus.
//!
//! A publication is three frames: the 6-byte topic (slave id, 2 bytes BE,
//! then variable id, 4 bytes BE), the step id (8 bytes BE), and the value
//! (a 1-byte type tag followed by the type's fixed encoding). Subscribers
//! match publications against their subscription set by topic prefix.

use bytes::{BufMut, Bytes, BytesMut};
use stepbus_model::{ScalarValue, StepId, Variable};
use stepbus_net::Message;
use zerocopy::byteorder::{BigEndian, U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::ProtoError;

/// Length of a topic frame in bytes.
pub const TOPIC_LEN: usize = 6;

const TAG_REAL: u8 = 0x01;
const TAG_INTEGER: u8 = 0x02;
const TAG_BOOLEAN: u8 = 0x03;
const TAG_STRING: u8 = 0x04;

/// The fixed wire layout of a topic frame.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct TopicWire {
    slave: U16<BigEndian>,
    variable: U32<BigEndian>,
}

/// The topic under which `variable` is published.
pub fn topic(variable: Variable) -> [u8; TOPIC_LEN] {
    let wire = TopicWire {
        slave: U16::new(variable.slave),
        variable: U32::new(variable.variable),
    };
    let mut out = [0u8; TOPIC_LEN];
    out.copy_from_slice(wire.as_bytes());
    out
}

/// Whether a received topic frame falls under a subscription prefix.
pub fn topic_matches(prefix: &[u8], received: &[u8]) -> bool {
    received.starts_with(prefix)
}

/// One value publication.
#[derive(Debug, Clone, PartialEq)]
pub struct DataMessage {
    /// The published variable.
    pub variable: Variable,
    /// The step the value belongs to.
    pub step_id: StepId,
    /// The value itself.
    pub value: ScalarValue,
}

impl DataMessage {
    /// Encodes this publication as a three-frame message.
    pub fn encode(&self) -> Message {
        debug_assert!(self.step_id >= 0, "published step ids are non-negative");
        let mut message = Message::new();
        message.push(Bytes::copy_from_slice(&topic(self.variable)));
        message.push(Bytes::copy_from_slice(&self.step_id.to_be_bytes()));
        message.push(encode_value(&self.value));
        message
    }

    /// Decodes a three-frame publication.
    pub fn decode(message: &Message) -> Result<Self, ProtoError> {
        let topic_frame = message.frame(0).ok_or(ProtoError::Malformed("no topic frame"))?;
        let wire = TopicWire::read_from_bytes(topic_frame.as_ref())
            .map_err(|_| ProtoError::Malformed("topic frame is not 6 bytes"))?;

        let step_frame = message.frame(1).ok_or(ProtoError::Malformed("no step frame"))?;
        let step_bytes: [u8; 8] = step_frame
            .as_ref()
            .try_into()
            .map_err(|_| ProtoError::Malformed("step frame is not 8 bytes"))?;
        let step_id = StepId::from_be_bytes(step_bytes);
        if step_id < 0 {
            return Err(ProtoError::Malformed("negative step id"));
        }

        let value_frame = message.frame(2).ok_or(ProtoError::Malformed("no value frame"))?;
        let value = decode_value(value_frame.as_ref())?;

        Ok(Self {
            variable: Variable::new(wire.slave.get(), wire.variable.get()),
            step_id,
            value,
        })
    }
}

fn encode_value(value: &ScalarValue) -> Bytes {
    let mut buf = BytesMut::new();
    match value {
        ScalarValue::Real(v) => {
            buf.put_u8(TAG_REAL);
            buf.put_f64(*v);
        }
        ScalarValue::Integer(v) => {
            buf.put_u8(TAG_INTEGER);
            buf.put_i32(*v);
        }
        ScalarValue::Boolean(v) => {
            buf.put_u8(TAG_BOOLEAN);
            buf.put_u8(u8::from(*v));
        }
        ScalarValue::String(s) => {
            buf.put_u8(TAG_STRING);
            buf.put_u32(s.len() as u32);
            buf.put_slice(s.as_bytes());
        }
    }
    buf.freeze()
}

fn decode_value(bytes: &[u8]) -> Result<ScalarValue, ProtoError> {
    let (&tag, rest) = bytes.split_first().ok_or(ProtoError::Malformed("empty value frame"))?;
    match tag {
        TAG_REAL => {
            let raw: [u8; 8] =
                rest.try_into().map_err(|_| ProtoError::Malformed("real is not 8 bytes"))?;
            Ok(ScalarValue::Real(f64::from_be_bytes(raw)))
        }
        TAG_INTEGER => {
            let raw: [u8; 4] =
                rest.try_into().map_err(|_| ProtoError::Malformed("integer is not 4 bytes"))?;
            Ok(ScalarValue::Integer(i32::from_be_bytes(raw)))
        }
        TAG_BOOLEAN => match rest {
            [0] => Ok(ScalarValue::Boolean(false)),
            [1] => Ok(ScalarValue::Boolean(true)),
            _ => Err(ProtoError::Malformed("boolean is not one byte 0/1")),
        },
        TAG_STRING => {
            if rest.len() < 4 {
                return Err(ProtoError::Malformed("string has no length prefix"));
            }
            let (len_bytes, data) = rest.split_at(4);
            let len = u32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]])
                as usize;
            if data.len() != len {
                return Err(ProtoError::Malformed("string length mismatch"));
            }
            let text = std::str::from_utf8(data).map_err(|_| ProtoError::InvalidUtf8)?;
            Ok(ScalarValue::String(text.to_string()))
        }
        other => Err(ProtoError::UnknownValueTag(other)),
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn topic_layout_is_slave_then_variable_big_endian() {
        let t = topic(Variable::new(0x0102, 0x0304_0506));
        assert_eq!(t, [0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
    }

    #[test]
    fn prefix_matching() {
        let full = topic(Variable::new(3, 9));
        let slave_prefix = 3u16.to_be_bytes();
        assert!(topic_matches(&slave_prefix, &full));
        assert!(topic_matches(&full, &full));
        assert!(!topic_matches(&topic(Variable::new(4, 9)), &full));
    }

    #[test]
    fn publication_round_trip() {
        let msg = DataMessage {
            variable: Variable::new(2, 17),
            step_id: 41,
            value: ScalarValue::Real(-0.25),
        };
        let wire = msg.encode();
        assert_eq!(wire.len(), 3);
        assert_eq!(DataMessage::decode(&wire).unwrap(), msg);
    }

    #[test]
    fn negative_step_id_is_rejected() {
        let mut wire = DataMessage {
            variable: Variable::new(1, 1),
            step_id: 0,
            value: ScalarValue::Boolean(true),
        }
        .encode();
        let mut frames = wire.into_frames();
        frames[1] = Bytes::copy_from_slice(&(-1i64).to_be_bytes());
        wire = Message::from_frames(frames);
        assert!(DataMessage::decode(&wire).is_err());
    }

    #[test]
    fn bad_boolean_byte_is_rejected() {
        assert!(decode_value(&[TAG_BOOLEAN, 2]).is_err());
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert!(matches!(decode_value(&[0x09]), Err(ProtoError::UnknownValueTag(0x09))));
    }

    #[test]
    fn nan_real_preserves_bit_pattern() {
        let encoded = encode_value(&ScalarValue::Real(f64::NAN));
        match decode_value(&encoded).unwrap() {
            ScalarValue::Real(v) => assert_eq!(v.to_bits(), f64::NAN.to_bits()),
            other => panic!("decoded {other:?}"),
        }
    }

    proptest! {
        // Every supported scalar value survives the wire unchanged.
        #[test]
        fn scalar_value_round_trip(value in scalar_value()) {
            let encoded = encode_value(&value);
            let decoded = decode_value(&encoded).unwrap();
            prop_assert_eq!(decoded, value);
        }
    }

    fn scalar_value() -> impl Strategy<Value = ScalarValue> {
        prop_oneof![
            any::<f64>().prop_filter("NaN compares unequal", |f| !f.is_nan())
                .prop_map(ScalarValue::Real),
            any::<i32>().prop_map(ScalarValue::Integer),
            any::<bool>().prop_map(ScalarValue::Boolean),
            ".{0,32}".prop_map(ScalarValue::String),
        ]
    }
}
