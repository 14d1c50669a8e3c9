//! MQTT packet types and codec for MQTT 3.1.1.
//!
//! The codec is stateless: body decoders take a complete frame body and
//! either produce a [`Packet`] or fail with a protocol error. Framing
//! (waiting for a complete `header + remaining length` prefix) is the
//! session buffer's job, see `client::Inbox`.

use bytes::Bytes;

use crate::error::{ProtocolError, Result};

/// Largest value representable by the 1-4 byte Remaining Length encoding.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// MQTT Control Packet Types (4 bits) handled by this broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
#[allow(dead_code)] // decode matches on raw type numbers
pub enum PacketType {
    Connect = 1,
    Connack = 2,
    Publish = 3,
    Puback = 4,
    Subscribe = 8,
    Suback = 9,
    Pingreq = 12,
    Pingresp = 13,
    Disconnect = 14,
}

/// Quality of Service levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
#[allow(clippy::enum_variant_names)] // MQTT spec names
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(ProtocolError::MalformedPacket(format!(
                "Invalid QoS: {}",
                value
            ))),
        }
    }
}

/// MQTT packets.
///
/// Client-to-broker packets carry decoded bodies; broker-to-client packets
/// carry only what the encoders need. `Unknown` preserves the numeric type
/// of unsupported packets for logging.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Connect(Connect),
    /// Connection accepted, no session present. The only CONNACK this
    /// broker ever sends.
    Connack,
    Publish(Publish),
    Puback { packet_id: u16 },
    Subscribe(Subscribe),
    Suback(Suback),
    Pingreq,
    Pingresp,
    Disconnect,
    Unknown { packet_type: u8 },
}

/// CONNECT packet data.
///
/// Nothing here is validated: the broker accepts any protocol name and
/// level so embedded clients with sloppy CONNECTs can still be observed.
/// The fields are retained for decoded-payload logging.
#[derive(Debug, Clone, PartialEq)]
pub struct Connect {
    pub protocol_name: String,
    pub protocol_level: u8,
    pub connect_flags: u8,
    pub keep_alive: u16,
    pub client_id: String,
}

/// PUBLISH packet data.
///
/// The topic is kept as opaque bytes: routing is an exact byte match and
/// never requires UTF-8.
#[derive(Debug, Clone, PartialEq)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: Bytes,
    pub packet_id: Option<u16>,
    pub payload: Bytes,
}

/// SUBSCRIBE packet data.
#[derive(Debug, Clone, PartialEq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub topics: Vec<(String, QoS)>,
}

/// SUBACK packet data. One return code per topic filter, in order.
#[derive(Debug, Clone, PartialEq)]
pub struct Suback {
    pub packet_id: u16,
    pub return_codes: Vec<u8>,
}

/// Cursor over a packet body.
struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn read_u8(&mut self) -> Result<u8> {
        if self.pos >= self.buf.len() {
            return Err(ProtocolError::Truncated { needed: 1, have: 0 }.into());
        }
        let b = self.buf[self.pos];
        self.pos += 1;
        Ok(b)
    }

    fn read_u16(&mut self) -> Result<u16> {
        if self.remaining() < 2 {
            return Err(ProtocolError::Truncated {
                needed: 2,
                have: self.remaining(),
            }
            .into());
        }
        let val = u16::from_be_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;
        Ok(val)
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(ProtocolError::Truncated {
                needed: len,
                have: self.remaining(),
            }
            .into());
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    /// Two-byte big-endian length-prefixed UTF-8 string.
    fn read_string(&mut self) -> Result<String> {
        let len = self.read_u16()? as usize;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8.into())
    }

    /// Two-byte big-endian length-prefixed binary data.
    fn read_binary(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u16()? as usize;
        self.read_bytes(len)
    }
}

/// Decode the Remaining Length field (variable length encoding).
///
/// Each byte contributes 7 payload bits, low group first; bit 7 is the
/// continuation flag. Returns `Ok(Some((length, bytes_consumed)))` if
/// successful, `Ok(None)` if more bytes are needed (nothing is consumed),
/// or `Err` if the fourth byte still carries the continuation bit.
pub fn decode_remaining_length(buf: &[u8]) -> Result<Option<(usize, usize)>> {
    let mut length = 0usize;

    for (i, &byte) in buf.iter().take(4).enumerate() {
        length |= ((byte & 0x7F) as usize) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((length, i + 1)));
        }
    }

    if buf.len() >= 4 {
        return Err(ProtocolError::InvalidRemainingLength.into());
    }
    Ok(None)
}

/// Encode a Remaining Length, appending 1-4 bytes to `buf`.
/// Returns the number of bytes written.
pub fn encode_remaining_length(mut len: usize, buf: &mut Vec<u8>) -> Result<usize> {
    if len > MAX_REMAINING_LENGTH {
        return Err(ProtocolError::RemainingLengthTooLarge(len).into());
    }

    let start = buf.len();
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if len == 0 {
            break;
        }
    }
    Ok(buf.len() - start)
}

/// Decode a complete frame body into a [`Packet`].
///
/// `header` is the fixed header byte; `body` holds exactly Remaining
/// Length bytes. Only the client-to-broker types this broker handles are
/// decoded; everything else (PUBREC, UNSUBSCRIBE, reserved values, a
/// stray PUBACK, ...) succeeds as [`Packet::Unknown`]. A body that does
/// not match its type fails with a protocol error.
pub fn decode_body(header: u8, body: &[u8]) -> Result<Packet> {
    let packet_type = header >> 4;
    let flags = header & 0x0F;

    match packet_type {
        1 => decode_connect(body),
        3 => decode_publish(flags, body),
        8 => decode_subscribe(body),
        12 => Ok(Packet::Pingreq),
        14 => Ok(Packet::Disconnect),
        _ => Ok(Packet::Unknown { packet_type }),
    }
}

fn decode_connect(body: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(body);

    let protocol_name = dec.read_string()?;
    let protocol_level = dec.read_u8()?;
    let connect_flags = dec.read_u8()?;
    let keep_alive = dec.read_u16()?;
    // May be empty; the server substitutes a placeholder id.
    let client_id = dec.read_string()?;

    Ok(Packet::Connect(Connect {
        protocol_name,
        protocol_level,
        connect_flags,
        keep_alive,
        client_id,
    }))
}

fn decode_publish(flags: u8, body: &[u8]) -> Result<Packet> {
    let dup = (flags & 0x08) != 0;
    let qos = QoS::try_from((flags >> 1) & 0x03)?;
    let retain = (flags & 0x01) != 0;

    let mut dec = Decoder::new(body);

    let topic = Bytes::copy_from_slice(dec.read_binary()?);

    let packet_id = if qos != QoS::AtMostOnce {
        Some(dec.read_u16()?)
    } else {
        None
    };

    let payload = Bytes::copy_from_slice(dec.read_bytes(dec.remaining())?);

    Ok(Packet::Publish(Publish {
        dup,
        qos,
        retain,
        topic,
        packet_id,
        payload,
    }))
}

fn decode_subscribe(body: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(body);
    let packet_id = dec.read_u16()?;

    let mut topics = Vec::new();
    while dec.remaining() > 0 {
        let topic = dec.read_string()?;
        let qos = QoS::try_from(dec.read_u8()? & 0x03)?;
        topics.push((topic, qos));
    }

    if topics.is_empty() {
        return Err(ProtocolError::MalformedPacket("SUBSCRIBE with no topics".into()).into());
    }

    Ok(Packet::Subscribe(Subscribe { packet_id, topics }))
}

/// Encode a packet into the provided buffer.
pub fn encode_packet(packet: &Packet, buf: &mut Vec<u8>) -> Result<()> {
    match packet {
        Packet::Connack => encode_connack(buf),
        Packet::Publish(publish) => encode_publish(publish, buf)?,
        Packet::Puback { packet_id } => encode_puback(*packet_id, buf),
        Packet::Suback(suback) => encode_suback(suback, buf)?,
        Packet::Pingresp => encode_pingresp(buf),
        // Client-to-broker packets, never encoded.
        _ => {}
    }
    Ok(())
}

/// `20 02 00 00`: connection accepted, no session present.
fn encode_connack(buf: &mut Vec<u8>) {
    buf.push((PacketType::Connack as u8) << 4);
    buf.push(2);
    buf.push(0); // session present = 0
    buf.push(0); // accepted
}

fn encode_publish(publish: &Publish, buf: &mut Vec<u8>) -> Result<()> {
    let mut fixed_header = (PacketType::Publish as u8) << 4;
    if publish.dup {
        fixed_header |= 0x08;
    }
    fixed_header |= (publish.qos as u8) << 1;
    if publish.retain {
        fixed_header |= 0x01;
    }
    buf.push(fixed_header);

    let topic_len = 2 + publish.topic.len();
    let packet_id_len = if publish.qos != QoS::AtMostOnce { 2 } else { 0 };
    let remaining = topic_len + packet_id_len + publish.payload.len();
    encode_remaining_length(remaining, buf)?;

    buf.extend_from_slice(&(publish.topic.len() as u16).to_be_bytes());
    buf.extend_from_slice(&publish.topic);

    if let Some(id) = publish.packet_id {
        buf.extend_from_slice(&id.to_be_bytes());
    }

    buf.extend_from_slice(&publish.payload);
    Ok(())
}

fn encode_puback(packet_id: u16, buf: &mut Vec<u8>) {
    buf.push((PacketType::Puback as u8) << 4);
    buf.push(2);
    buf.extend_from_slice(&packet_id.to_be_bytes());
}

fn encode_suback(suback: &Suback, buf: &mut Vec<u8>) -> Result<()> {
    buf.push((PacketType::Suback as u8) << 4);
    encode_remaining_length(2 + suback.return_codes.len(), buf)?;
    buf.extend_from_slice(&suback.packet_id.to_be_bytes());
    buf.extend_from_slice(&suback.return_codes);
    Ok(())
}

fn encode_pingresp(buf: &mut Vec<u8>) {
    buf.push((PacketType::Pingresp as u8) << 4);
    buf.push(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remaining_length_decode() {
        assert_eq!(decode_remaining_length(&[0]).unwrap(), Some((0, 1)));
        assert_eq!(decode_remaining_length(&[0x7F]).unwrap(), Some((127, 1)));
        assert_eq!(
            decode_remaining_length(&[0x80, 0x01]).unwrap(),
            Some((128, 2))
        );
        assert_eq!(
            decode_remaining_length(&[0xFF, 0xFF, 0x7F]).unwrap(),
            Some((2_097_151, 3))
        );
        assert_eq!(
            decode_remaining_length(&[0xFF, 0xFF, 0xFF, 0x7F]).unwrap(),
            Some((MAX_REMAINING_LENGTH, 4))
        );
    }

    #[test]
    fn test_remaining_length_incomplete() {
        assert_eq!(decode_remaining_length(&[]).unwrap(), None);
        assert_eq!(decode_remaining_length(&[0x80]).unwrap(), None);
        assert_eq!(decode_remaining_length(&[0x80, 0x80, 0x80]).unwrap(), None);
    }

    #[test]
    fn test_remaining_length_malformed() {
        // Continuation bit still set on the fourth byte
        assert!(decode_remaining_length(&[0x80, 0x80, 0x80, 0x80, 0x01]).is_err());
        assert!(decode_remaining_length(&[0xFF, 0xFF, 0xFF, 0xFF]).is_err());
    }

    #[test]
    fn test_remaining_length_roundtrip() {
        for value in [
            0,
            127,
            128,
            16_383,
            16_384,
            2_097_151,
            2_097_152,
            MAX_REMAINING_LENGTH,
        ] {
            let mut buf = Vec::new();
            let written = encode_remaining_length(value, &mut buf).unwrap();
            assert_eq!(written, buf.len());
            let (decoded, consumed) = decode_remaining_length(&buf).unwrap().unwrap();
            assert_eq!(decoded, value);
            assert_eq!(consumed, buf.len());
        }
    }

    #[test]
    fn test_remaining_length_too_large() {
        let mut buf = Vec::new();
        assert!(encode_remaining_length(MAX_REMAINING_LENGTH + 1, &mut buf).is_err());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_connect() {
        // protocol "MQTT", level 4, clean session, keepalive 60, empty client id
        let body = [
            0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x02, 0x00, 0x3C, 0x00, 0x00,
        ];
        let Packet::Connect(connect) = decode_body(0x10, &body).unwrap() else {
            panic!("expected CONNECT");
        };
        assert_eq!(connect.protocol_name, "MQTT");
        assert_eq!(connect.protocol_level, 4);
        assert_eq!(connect.connect_flags, 0x02);
        assert_eq!(connect.keep_alive, 60);
        assert!(connect.client_id.is_empty());
    }

    #[test]
    fn test_decode_connect_with_client_id() {
        let body = [
            0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x02, 0x00, 0x3C, 0x00, 0x04, b'r', b'a',
            b's', b'p',
        ];
        let Packet::Connect(connect) = decode_body(0x10, &body).unwrap() else {
            panic!("expected CONNECT");
        };
        assert_eq!(connect.client_id, "rasp");
    }

    #[test]
    fn test_decode_connect_truncated() {
        let body = [0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04];
        assert!(decode_body(0x10, &body).is_err());
    }

    #[test]
    fn test_decode_publish_qos0() {
        // topic "test", payload "hello"
        let body = [
            0x00, 0x04, b't', b'e', b's', b't', b'h', b'e', b'l', b'l', b'o',
        ];
        let Packet::Publish(publish) = decode_body(0x30, &body).unwrap() else {
            panic!("expected PUBLISH");
        };
        assert_eq!(publish.qos, QoS::AtMostOnce);
        assert_eq!(publish.packet_id, None);
        assert_eq!(&publish.topic[..], b"test");
        assert_eq!(&publish.payload[..], b"hello");
    }

    #[test]
    fn test_decode_publish_qos1_packet_id() {
        // topic "test", packet id 42, payload "hello"
        let body = [
            0x00, 0x04, b't', b'e', b's', b't', 0x00, 0x2A, b'h', b'e', b'l', b'l', b'o',
        ];
        let Packet::Publish(publish) = decode_body(0x32, &body).unwrap() else {
            panic!("expected PUBLISH");
        };
        assert_eq!(publish.qos, QoS::AtLeastOnce);
        assert_eq!(publish.packet_id, Some(42));
        assert_eq!(&publish.payload[..], b"hello");
    }

    #[test]
    fn test_decode_publish_empty_payload() {
        let body = [0x00, 0x04, b't', b'e', b's', b't'];
        let Packet::Publish(publish) = decode_body(0x30, &body).unwrap() else {
            panic!("expected PUBLISH");
        };
        assert!(publish.payload.is_empty());
    }

    #[test]
    fn test_decode_publish_truncated_topic() {
        // Topic length claims 16 bytes, only 4 present
        let body = [0x00, 0x10, b't', b'e', b's', b't'];
        assert!(decode_body(0x30, &body).is_err());
    }

    #[test]
    fn test_decode_subscribe() {
        // packet id 1, topic "test" qos 0
        let body = [0x00, 0x01, 0x00, 0x04, b't', b'e', b's', b't', 0x00];
        let Packet::Subscribe(subscribe) = decode_body(0x82, &body).unwrap() else {
            panic!("expected SUBSCRIBE");
        };
        assert_eq!(subscribe.packet_id, 1);
        assert_eq!(subscribe.topics, vec![("test".to_string(), QoS::AtMostOnce)]);
    }

    #[test]
    fn test_decode_subscribe_multiple_topics() {
        let body = [
            0x00, 0x07, 0x00, 0x01, b'a', 0x01, 0x00, 0x01, b'b', 0x00,
        ];
        let Packet::Subscribe(subscribe) = decode_body(0x82, &body).unwrap() else {
            panic!("expected SUBSCRIBE");
        };
        assert_eq!(subscribe.topics.len(), 2);
        assert_eq!(subscribe.topics[0], ("a".to_string(), QoS::AtLeastOnce));
        assert_eq!(subscribe.topics[1], ("b".to_string(), QoS::AtMostOnce));
    }

    #[test]
    fn test_decode_subscribe_no_topics() {
        let body = [0x00, 0x01];
        assert!(decode_body(0x82, &body).is_err());
    }

    #[test]
    fn test_decode_pingreq_disconnect() {
        assert_eq!(decode_body(0xC0, &[]).unwrap(), Packet::Pingreq);
        assert_eq!(decode_body(0xE0, &[]).unwrap(), Packet::Disconnect);
    }

    #[test]
    fn test_decode_unknown_type() {
        // Reserved type 0 and UNSUBSCRIBE (10) are tagged, not rejected
        assert_eq!(
            decode_body(0x00, &[]).unwrap(),
            Packet::Unknown { packet_type: 0 }
        );
        assert_eq!(
            decode_body(0xA2, &[0x00, 0x01]).unwrap(),
            Packet::Unknown { packet_type: 10 }
        );
        // Broker-to-client types arriving from a client are unsupported too
        assert_eq!(
            decode_body(0x40, &[0x00, 0x01]).unwrap(),
            Packet::Unknown { packet_type: 4 }
        );
    }

    #[test]
    fn test_encode_connack() {
        let mut buf = Vec::new();
        encode_packet(&Packet::Connack, &mut buf).unwrap();
        assert_eq!(buf, [0x20, 0x02, 0x00, 0x00]);
    }

    #[test]
    fn test_encode_puback() {
        let mut buf = Vec::new();
        encode_packet(&Packet::Puback { packet_id: 42 }, &mut buf).unwrap();
        assert_eq!(buf, [0x40, 0x02, 0x00, 0x2A]);
    }

    #[test]
    fn test_encode_suback() {
        let mut buf = Vec::new();
        let suback = Suback {
            packet_id: 1,
            return_codes: vec![0x00],
        };
        encode_packet(&Packet::Suback(suback), &mut buf).unwrap();
        assert_eq!(buf, [0x90, 0x03, 0x00, 0x01, 0x00]);
    }

    #[test]
    fn test_encode_suback_one_grant_per_topic() {
        let mut buf = Vec::new();
        let suback = Suback {
            packet_id: 7,
            return_codes: vec![0x00, 0x00, 0x00],
        };
        encode_packet(&Packet::Suback(suback), &mut buf).unwrap();
        assert_eq!(buf, [0x90, 0x05, 0x00, 0x07, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_encode_pingresp() {
        let mut buf = Vec::new();
        encode_packet(&Packet::Pingresp, &mut buf).unwrap();
        assert_eq!(buf, [0xD0, 0x00]);
    }

    #[test]
    fn test_publish_roundtrip() {
        let publish = Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: Bytes::from_static(b"test"),
            packet_id: None,
            payload: Bytes::from_static(b"hello"),
        };

        let mut buf = Vec::new();
        encode_packet(&Packet::Publish(publish.clone()), &mut buf).unwrap();
        assert_eq!(
            buf,
            [0x30, 0x0B, 0x00, 0x04, b't', b'e', b's', b't', b'h', b'e', b'l', b'l', b'o']
        );

        let (remaining, len_bytes) = decode_remaining_length(&buf[1..]).unwrap().unwrap();
        let body = &buf[1 + len_bytes..];
        assert_eq!(body.len(), remaining);
        assert_eq!(decode_body(buf[0], body).unwrap(), Packet::Publish(publish));
    }
}
