//! # MQTT Packet Structures and Serialization
//!
//! MQTT 3.1.1 control packets and the traits for encoding and decoding them
//! to and from a byte buffer. Only the packets a client exchanges with a
//! broker are modelled: CONNECT carries the session parameters the bridge
//! needs (clean session, keepalive, last will, credentials), and the decode
//! path covers the broker-to-client packets (CONNACK, PUBLISH, PUBACK,
//! SUBACK, PINGRESP).

use crate::error::{ErrorPlaceHolder, MqttError, ProtocolError};
use crate::util::{
    self, read_utf8_string, write_binary_data, write_utf8_string,
};
use heapless::Vec;

/// Represents the Quality of Service (QoS) levels for MQTT messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

/// A trait for packets that can be encoded into a byte buffer.
pub trait EncodePacket {
    fn encode(&self, buf: &mut [u8]) -> Result<usize, MqttError<ErrorPlaceHolder>>;
}

/// A trait for packets that can be decoded from a byte buffer.
pub trait DecodePacket<'a>: Sized {
    fn decode(buf: &'a [u8]) -> Result<Self, MqttError<ErrorPlaceHolder>>;
}

/// The broker-to-client packets the session layer dispatches on.
#[derive(Debug)]
pub enum MqttPacket<'a> {
    ConnAck(ConnAck),
    Publish(Publish<'a>),
    PubAck(PubAck),
    SubAck(SubAck),
    PingResp,
}

/// Decodes a raw byte buffer into a specific `MqttPacket`.
pub fn decode<'a>(buf: &'a [u8]) -> Result<Option<MqttPacket<'a>>, MqttError<ErrorPlaceHolder>> {
    if buf.is_empty() {
        return Ok(None);
    }

    let packet_type = buf[0] >> 4;
    let packet = match packet_type {
        2 => MqttPacket::ConnAck(ConnAck::decode(buf)?),
        3 => MqttPacket::Publish(Publish::decode(buf)?),
        4 => MqttPacket::PubAck(PubAck::decode(buf)?),
        9 => MqttPacket::SubAck(SubAck::decode(buf)?),
        13 => MqttPacket::PingResp,
        _ => {
            return Err(MqttError::Protocol(ProtocolError::InvalidPacketType(
                packet_type,
            )));
        }
    };

    Ok(Some(packet))
}

/// A last-will registration carried in CONNECT.
///
/// The broker publishes this message on the client's behalf if the session
/// drops uncleanly, which is how subscribers learn the bridge went offline.
#[derive(Debug, Clone, Copy)]
pub struct LastWill<'a> {
    pub topic: &'a str,
    pub payload: &'a [u8],
    pub qos: QoS,
    pub retain: bool,
}

// --- CONNECT Packet ---
#[derive(Debug)]
pub struct Connect<'a> {
    pub clean_session: bool,
    pub keep_alive: u16,
    pub client_id: &'a str,
    pub username: Option<&'a str>,
    pub password: Option<&'a str>,
    pub last_will: Option<LastWill<'a>>,
}

impl<'a> Connect<'a> {
    pub fn new(client_id: &'a str, keep_alive: u16, clean_session: bool) -> Self {
        Self {
            client_id,
            keep_alive,
            clean_session,
            username: None,
            password: None,
            last_will: None,
        }
    }
}

impl<'a> EncodePacket for Connect<'a> {
    fn encode(&self, buf: &mut [u8]) -> Result<usize, MqttError<ErrorPlaceHolder>> {
        let mut cursor = 0;
        *buf.get_mut(cursor).ok_or(MqttError::BufferTooSmall)? = 0x10;
        cursor += 1;
        let remaining_len_pos = cursor;
        cursor += 4;
        let content_start = cursor;

        // Variable header: protocol name "MQTT", level 4 (3.1.1)
        cursor += write_utf8_string(util::tail_mut(buf, cursor)?, "MQTT")?;
        *buf.get_mut(cursor).ok_or(MqttError::BufferTooSmall)? = 4;
        cursor += 1;

        let mut flags = 0u8;
        if self.clean_session {
            flags |= 0x02;
        }
        if let Some(will) = &self.last_will {
            flags |= 0x04;
            flags |= (will.qos as u8) << 3;
            if will.retain {
                flags |= 0x20;
            }
        }
        if self.password.is_some() {
            flags |= 0x40;
        }
        if self.username.is_some() {
            flags |= 0x80;
        }
        *buf.get_mut(cursor).ok_or(MqttError::BufferTooSmall)? = flags;
        cursor += 1;

        buf.get_mut(cursor..cursor + 2)
            .ok_or(MqttError::BufferTooSmall)?
            .copy_from_slice(&self.keep_alive.to_be_bytes());
        cursor += 2;

        // Payload: client id, will topic + message, username, password,
        // in exactly this order per the 3.1.1 spec.
        cursor += write_utf8_string(util::tail_mut(buf, cursor)?, self.client_id)?;
        if let Some(will) = &self.last_will {
            cursor += write_utf8_string(util::tail_mut(buf, cursor)?, will.topic)?;
            cursor += write_binary_data(util::tail_mut(buf, cursor)?, will.payload)?;
        }
        if let Some(username) = self.username {
            cursor += write_utf8_string(util::tail_mut(buf, cursor)?, username)?;
        }
        if let Some(password) = self.password {
            cursor += write_utf8_string(util::tail_mut(buf, cursor)?, password)?;
        }

        let remaining_len = cursor - content_start;
        let len_bytes =
            util::write_variable_byte_integer_len(&mut buf[remaining_len_pos..], remaining_len)?;
        let header_len = 1 + len_bytes;
        buf.copy_within(content_start..cursor, header_len);
        Ok(header_len + remaining_len)
    }
}

// --- CONNACK Packet ---
#[derive(Debug)]
pub struct ConnAck {
    pub session_present: bool,
    pub reason_code: u8,
}

impl<'a> DecodePacket<'a> for ConnAck {
    fn decode(buf: &'a [u8]) -> Result<Self, MqttError<ErrorPlaceHolder>> {
        if buf.len() < 4 {
            return Err(MqttError::Protocol(ProtocolError::MalformedPacket));
        }
        let session_present = (buf[2] & 0x01) != 0;
        let reason_code = buf[3];
        Ok(Self {
            session_present,
            reason_code,
        })
    }
}

// --- PUBLISH Packet ---
#[derive(Debug)]
pub struct Publish<'a> {
    pub topic: &'a str,
    pub qos: QoS,
    pub retain: bool,
    pub payload: &'a [u8],
    pub packet_id: Option<u16>,
}

impl<'a> DecodePacket<'a> for Publish<'a> {
    fn decode(buf: &'a [u8]) -> Result<Self, MqttError<ErrorPlaceHolder>> {
        let flags = buf[0] & 0x0F;
        let qos = match (flags >> 1) & 0x03 {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            2 => QoS::ExactlyOnce,
            _ => return Err(MqttError::Protocol(ProtocolError::MalformedPacket)),
        };
        let retain = (flags & 0x01) != 0;

        let mut cursor = 1;
        let remaining_len = util::read_variable_byte_integer(&mut cursor, buf)?;
        let packet_end = cursor + remaining_len;
        if packet_end > buf.len() {
            return Err(MqttError::Protocol(ProtocolError::MalformedPacket));
        }
        // Bound every further read to this packet; the caller's buffer may
        // hold bytes of a following packet.
        let buf = &buf[..packet_end];

        let topic = read_utf8_string(&mut cursor, buf)?;

        let packet_id = if qos != QoS::AtMostOnce {
            let id_bytes: [u8; 2] = buf
                .get(cursor..cursor + 2)
                .ok_or(MqttError::Protocol(ProtocolError::MalformedPacket))?
                .try_into()
                .map_err(|_| MqttError::Protocol(ProtocolError::MalformedPacket))?;
            cursor += 2;
            Some(u16::from_be_bytes(id_bytes))
        } else {
            None
        };

        let payload = &buf[cursor..];

        Ok(Publish {
            topic,
            qos,
            retain,
            payload,
            packet_id,
        })
    }
}

impl<'a> EncodePacket for Publish<'a> {
    fn encode(&self, buf: &mut [u8]) -> Result<usize, MqttError<ErrorPlaceHolder>> {
        let mut cursor = 0;

        // Fixed header: PUBLISH packet type (3) with QoS and retain flags
        let mut flags = (self.qos as u8) << 1;
        if self.retain {
            flags |= 0x01;
        }
        *buf.get_mut(cursor).ok_or(MqttError::BufferTooSmall)? = 0x30 | flags;
        cursor += 1;

        // Reserve space for remaining length (max 4 bytes)
        let remaining_len_pos = cursor;
        cursor += 4;
        let content_start = cursor;

        // Topic name
        cursor += write_utf8_string(util::tail_mut(buf, cursor)?, self.topic)?;

        // Packet ID (only for QoS > 0)
        if self.qos != QoS::AtMostOnce
            && let Some(id) = self.packet_id
        {
            buf.get_mut(cursor..cursor + 2)
                .ok_or(MqttError::BufferTooSmall)?
                .copy_from_slice(&id.to_be_bytes());
            cursor += 2;
        }

        // Payload
        if cursor + self.payload.len() > buf.len() {
            return Err(MqttError::BufferTooSmall);
        }
        buf[cursor..cursor + self.payload.len()].copy_from_slice(self.payload);
        cursor += self.payload.len();

        // Write remaining length and compact
        let remaining_len = cursor - content_start;
        let len_bytes =
            util::write_variable_byte_integer_len(&mut buf[remaining_len_pos..], remaining_len)?;
        let header_len = 1 + len_bytes;
        buf.copy_within(content_start..cursor, header_len);

        Ok(header_len + remaining_len)
    }
}

// --- PUBACK Packet ---
#[derive(Debug)]
pub struct PubAck {
    pub packet_id: u16,
}

impl<'a> DecodePacket<'a> for PubAck {
    fn decode(buf: &'a [u8]) -> Result<Self, MqttError<ErrorPlaceHolder>> {
        if buf.len() < 4 {
            return Err(MqttError::Protocol(ProtocolError::MalformedPacket));
        }
        let packet_id = u16::from_be_bytes([buf[2], buf[3]]);
        Ok(PubAck { packet_id })
    }
}

impl EncodePacket for PubAck {
    fn encode(&self, buf: &mut [u8]) -> Result<usize, MqttError<ErrorPlaceHolder>> {
        if buf.len() < 4 {
            return Err(MqttError::BufferTooSmall);
        }
        buf[0] = 0x40;
        buf[1] = 0x02;
        buf[2..4].copy_from_slice(&self.packet_id.to_be_bytes());
        Ok(4)
    }
}

// --- SUBSCRIBE Packet ---
#[derive(Debug)]
pub struct Subscribe<'a> {
    pub packet_id: u16,
    pub topics: Vec<(&'a str, QoS), 8>,
}

impl<'a> Subscribe<'a> {
    /// Creates a new Subscribe packet with a single topic filter.
    pub fn new(packet_id: u16, topic: &'a str, qos: QoS) -> Self {
        let mut topics = Vec::new();
        let _ = topics.push((topic, qos));
        Self { packet_id, topics }
    }
}

impl<'a> EncodePacket for Subscribe<'a> {
    fn encode(&self, buf: &mut [u8]) -> Result<usize, MqttError<ErrorPlaceHolder>> {
        let mut cursor = 0;

        // Fixed header: SUBSCRIBE packet type (8) with reserved bits (0x02)
        *buf.get_mut(cursor).ok_or(MqttError::BufferTooSmall)? = 0x82;
        cursor += 1;

        // Reserve space for remaining length
        let remaining_len_pos = cursor;
        cursor += 4;
        let content_start = cursor;

        // Packet ID
        buf.get_mut(cursor..cursor + 2)
            .ok_or(MqttError::BufferTooSmall)?
            .copy_from_slice(&self.packet_id.to_be_bytes());
        cursor += 2;

        // Topic filters with requested QoS
        for (topic, qos) in &self.topics {
            cursor += write_utf8_string(util::tail_mut(buf, cursor)?, topic)?;
            *buf.get_mut(cursor).ok_or(MqttError::BufferTooSmall)? = *qos as u8;
            cursor += 1;
        }

        // Write remaining length and compact
        let remaining_len = cursor - content_start;
        let len_bytes =
            util::write_variable_byte_integer_len(&mut buf[remaining_len_pos..], remaining_len)?;
        let header_len = 1 + len_bytes;
        buf.copy_within(content_start..cursor, header_len);

        Ok(header_len + remaining_len)
    }
}

// --- SUBACK Packet ---
#[derive(Debug)]
pub struct SubAck {
    pub packet_id: u16,
    pub reason_codes: Vec<u8, 8>,
}

impl<'a> DecodePacket<'a> for SubAck {
    fn decode(buf: &'a [u8]) -> Result<Self, MqttError<ErrorPlaceHolder>> {
        let mut cursor = 1;
        let remaining_len = util::read_variable_byte_integer(&mut cursor, buf)?;
        let packet_end = cursor + remaining_len;
        if packet_end > buf.len() || remaining_len < 2 {
            return Err(MqttError::Protocol(ProtocolError::MalformedPacket));
        }

        let packet_id = u16::from_be_bytes([buf[cursor], buf[cursor + 1]]);
        cursor += 2;

        let mut reason_codes = Vec::new();
        while cursor < packet_end {
            let _ = reason_codes.push(buf[cursor]);
            cursor += 1;
        }

        Ok(SubAck {
            packet_id,
            reason_codes,
        })
    }
}

// --- PINGREQ Packet ---
#[derive(Debug)]
pub struct PingReq;

impl EncodePacket for PingReq {
    fn encode(&self, buf: &mut [u8]) -> Result<usize, MqttError<ErrorPlaceHolder>> {
        if buf.len() < 2 {
            return Err(MqttError::BufferTooSmall);
        }
        buf[0] = 0xC0;
        buf[1] = 0x00;
        Ok(2)
    }
}

// --- DISCONNECT Packet ---
#[derive(Debug)]
pub struct Disconnect;

impl EncodePacket for Disconnect {
    fn encode(&self, buf: &mut [u8]) -> Result<usize, MqttError<ErrorPlaceHolder>> {
        if buf.len() < 2 {
            return Err(MqttError::BufferTooSmall);
        }
        buf[0] = 0xE0;
        buf[1] = 0x00;
        Ok(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_flags_carry_will_and_credentials() {
        let mut packet = Connect::new("bridge-1", 90, true);
        packet.username = Some("user");
        packet.password = Some("pass");
        packet.last_will = Some(LastWill {
            topic: "truma",
            payload: b"Offline",
            qos: QoS::AtMostOnce,
            retain: true,
        });

        let mut buf = [0u8; 256];
        let len = packet.encode(&mut buf).unwrap();
        assert!(len > 0);

        // Variable header starts after the 1-byte type and 1-byte remaining
        // length (packet is well under 128 bytes). Flags byte sits after
        // "MQTT" (6 bytes) and the protocol level.
        assert_eq!(buf[1] as usize, len - 2);
        let flags = buf[2 + 6 + 1];
        assert_eq!(flags & 0x02, 0x02, "clean session");
        assert_eq!(flags & 0x04, 0x04, "will flag");
        assert_eq!(flags & 0x20, 0x20, "will retain");
        assert_eq!(flags & 0x18, 0x00, "will qos 0");
        assert_eq!(flags & 0xC0, 0xC0, "username and password");
    }

    #[test]
    fn publish_qos1_round_trips_packet_id_and_retain() {
        let packet = Publish {
            topic: "truma/control_status/target_temp_room",
            qos: QoS::AtLeastOnce,
            retain: false,
            payload: b"21.5",
            packet_id: Some(42),
        };
        let mut buf = [0u8; 256];
        let len = packet.encode(&mut buf).unwrap();

        let decoded = Publish::decode(&buf[..len]).unwrap();
        assert_eq!(decoded.topic, packet.topic);
        assert_eq!(decoded.packet_id, Some(42));
        assert_eq!(decoded.qos, QoS::AtLeastOnce);
        assert!(!decoded.retain);
        assert_eq!(decoded.payload, b"21.5");
    }

    #[test]
    fn publish_qos0_has_no_packet_id() {
        let packet = Publish {
            topic: "truma",
            qos: QoS::AtMostOnce,
            retain: true,
            payload: b"Online",
            packet_id: None,
        };
        let mut buf = [0u8; 64];
        let len = packet.encode(&mut buf).unwrap();
        assert_eq!(buf[0] & 0x01, 0x01, "retain flag");

        let decoded = Publish::decode(&buf[..len]).unwrap();
        assert_eq!(decoded.packet_id, None);
        assert!(decoded.retain);
        assert_eq!(decoded.payload, b"Online");
    }

    #[test]
    fn suback_decode_reads_packet_id_and_codes() {
        let raw = [0x90, 0x03, 0x00, 0x07, 0x01];
        let suback = SubAck::decode(&raw).unwrap();
        assert_eq!(suback.packet_id, 7);
        assert_eq!(suback.reason_codes.as_slice(), &[1]);
    }

    #[test]
    fn decode_rejects_unknown_packet_type() {
        let raw = [0x60, 0x00];
        assert!(decode(&raw).is_err());
    }

    #[test]
    fn encode_into_undersized_buffer_reports_buffer_too_small() {
        let mut connect = Connect::new("bridge-1", 90, true);
        connect.last_will = Some(LastWill {
            topic: "truma",
            payload: b"Offline",
            qos: QoS::AtMostOnce,
            retain: true,
        });
        let mut buf = [0u8; 16];
        assert!(matches!(
            connect.encode(&mut buf),
            Err(MqttError::BufferTooSmall)
        ));

        let publish = Publish {
            topic: "truma/control_status/target_temp_room",
            qos: QoS::AtLeastOnce,
            retain: false,
            payload: b"21.5",
            packet_id: Some(1),
        };
        let mut buf = [0u8; 8];
        assert!(matches!(
            publish.encode(&mut buf),
            Err(MqttError::BufferTooSmall)
        ));

        let subscribe = Subscribe::new(1, "truma/set/#", QoS::AtLeastOnce);
        let mut buf = [0u8; 6];
        assert!(matches!(
            subscribe.encode(&mut buf),
            Err(MqttError::BufferTooSmall)
        ));
    }

    #[test]
    fn publish_topic_cannot_read_past_the_declared_length() {
        // Remaining length 3, but the topic length prefix claims 8 bytes:
        // the decode must not read into the trailing bytes, which belong
        // to the next packet in a receive buffer.
        let raw = [0x30, 0x03, 0x00, 0x08, b'a', b'b', b'c', b'd', b'e'];
        assert!(Publish::decode(&raw).is_err());
    }

    #[test]
    fn truncated_publish_is_rejected() {
        let packet = Publish {
            topic: "truma/set/heating_mode",
            qos: QoS::AtMostOnce,
            retain: false,
            payload: b"eco",
            packet_id: None,
        };
        let mut buf = [0u8; 64];
        let len = packet.encode(&mut buf).unwrap();
        assert!(Publish::decode(&buf[..len - 2]).is_err());
    }
}
