//! Extended data mode packets, as spoken by u-blox short range modules.
//!
//! `AA | length (12 bits, BE) | 00 | type | body | 55`
//!
//! The length covers the two id/type bytes and the body.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::error::Error;

/// First byte of every packet.
pub const START_BYTE: u8 = 0xAA;

/// Last byte of every packet.
pub const END_BYTE: u8 = 0x55;

/// Start byte, two length bytes and end byte.
pub const EDM_OVERHEAD: usize = 4;

/// Largest payload (id/type bytes included) the length field can describe.
pub const MAX_PAYLOAD: usize = 0x0FFF;

/// Largest body of an AT packet.
pub const MAX_AT_BODY: usize = MAX_PAYLOAD - 2;

/// Largest body of a data packet, which also carries a channel byte.
pub const MAX_DATA_BODY: usize = MAX_PAYLOAD - 3;

const LENGTH_MASK: u16 = 0x0FFF;

mod kind {
    pub const CONNECT_EVENT: u8 = 0x11;
    pub const DISCONNECT_EVENT: u8 = 0x21;
    pub const DATA_EVENT: u8 = 0x31;
    pub const DATA_COMMAND: u8 = 0x36;
    pub const AT_EVENT: u8 = 0x41;
    pub const AT_REQUEST: u8 = 0x44;
    pub const AT_CONFIRMATION: u8 = 0x45;
    pub const RESEND_CONNECT_EVENTS: u8 = 0x56;
    pub const START_EVENT: u8 = 0x71;
}

/// An EDM packet, in either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdmPacket {
    /// AT command text for the module.
    AtRequest(Bytes),

    /// Response text to an AT request.
    AtConfirmation(Bytes),

    /// Unsolicited AT text.
    AtEvent(Bytes),

    /// Data for the module to send on a channel.
    DataCommand {
        /// The channel.
        channel: u8,
        /// The data.
        data: Bytes,
    },

    /// Data the module received on a channel.
    DataEvent {
        /// The channel.
        channel: u8,
        /// The data.
        data: Bytes,
    },

    /// A channel was connected.
    ConnectEvent {
        /// The channel.
        channel: u8,
        /// Connection type and addresses, as sent by the module.
        info: Bytes,
    },

    /// A channel was disconnected.
    DisconnectEvent {
        /// The channel.
        channel: u8,
    },

    /// The module entered extended data mode.
    StartEvent,

    /// Ask the module to send connect events for live channels again.
    ResendConnectEvents,

    /// A packet type this codec does not know.
    Unknown {
        /// The type byte.
        kind: u8,
        /// Everything after the type byte.
        body: Bytes,
    },
}

impl EdmPacket {
    fn parse(kind: u8, mut body: Bytes) -> Result<Self, Error> {
        let channel = |body: &mut Bytes| {
            if body.is_empty() {
                Err(Error::BadResponse(format!(
                    "EDM packet type {kind:#04x} without a channel"
                )))
            } else {
                Ok(body.get_u8())
            }
        };

        Ok(match kind {
            kind::AT_REQUEST => Self::AtRequest(body),
            kind::AT_CONFIRMATION => Self::AtConfirmation(body),
            kind::AT_EVENT => Self::AtEvent(body),
            kind::DATA_COMMAND => Self::DataCommand {
                channel: channel(&mut body)?,
                data: body,
            },
            kind::DATA_EVENT => Self::DataEvent {
                channel: channel(&mut body)?,
                data: body,
            },
            kind::CONNECT_EVENT => Self::ConnectEvent {
                channel: channel(&mut body)?,
                info: body,
            },
            kind::DISCONNECT_EVENT => Self::DisconnectEvent {
                channel: channel(&mut body)?,
            },
            kind::START_EVENT => Self::StartEvent,
            kind::RESEND_CONNECT_EVENTS => Self::ResendConnectEvents,
            kind => Self::Unknown { kind, body },
        })
    }

    fn kind(&self) -> u8 {
        match self {
            EdmPacket::AtRequest(_) => kind::AT_REQUEST,
            EdmPacket::AtConfirmation(_) => kind::AT_CONFIRMATION,
            EdmPacket::AtEvent(_) => kind::AT_EVENT,
            EdmPacket::DataCommand { .. } => kind::DATA_COMMAND,
            EdmPacket::DataEvent { .. } => kind::DATA_EVENT,
            EdmPacket::ConnectEvent { .. } => kind::CONNECT_EVENT,
            EdmPacket::DisconnectEvent { .. } => kind::DISCONNECT_EVENT,
            EdmPacket::StartEvent => kind::START_EVENT,
            EdmPacket::ResendConnectEvents => kind::RESEND_CONNECT_EVENTS,
            EdmPacket::Unknown { kind, .. } => *kind,
        }
    }

    fn channel(&self) -> Option<u8> {
        match self {
            EdmPacket::DataCommand { channel, .. }
            | EdmPacket::DataEvent { channel, .. }
            | EdmPacket::ConnectEvent { channel, .. }
            | EdmPacket::DisconnectEvent { channel } => Some(*channel),
            _ => None,
        }
    }

    fn body(&self) -> &[u8] {
        match self {
            EdmPacket::AtRequest(body)
            | EdmPacket::AtConfirmation(body)
            | EdmPacket::AtEvent(body)
            | EdmPacket::DataCommand { data: body, .. }
            | EdmPacket::DataEvent { data: body, .. }
            | EdmPacket::ConnectEvent { info: body, .. }
            | EdmPacket::Unknown { body, .. } => body,
            EdmPacket::DisconnectEvent { .. }
            | EdmPacket::StartEvent
            | EdmPacket::ResendConnectEvents => &[],
        }
    }
}

/// Splits a byte stream into [`EdmPacket`]s.
///
/// Anything outside of packets (such as the `+STARTUP` text a module prints
/// when entering extended data mode) is skipped.
#[derive(Debug, Default)]
pub struct EdmCodec;

impl Decoder for EdmCodec {
    type Item = EdmPacket;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match src.iter().position(|&byte| byte == START_BYTE) {
                Some(start) => src.advance(start),
                None => {
                    src.clear();
                    return Ok(None);
                }
            }

            if src.len() < 3 {
                return Ok(None);
            }

            let payload_len = (u16::from_be_bytes([src[1], src[2]]) & LENGTH_MASK) as usize;
            let packet_len = payload_len + EDM_OVERHEAD;

            if src.len() < packet_len {
                src.reserve(packet_len - src.len());
                return Ok(None);
            }

            if payload_len < 2 || src[packet_len - 1] != END_BYTE {
                warn!("Malformed EDM packet, resynchronising");
                src.advance(1);
                continue;
            }

            let mut packet = src.split_to(packet_len).freeze();
            packet.advance(3);
            packet.truncate(payload_len);

            // Id byte, always zero.
            packet.advance(1);
            let kind = packet.get_u8();

            match EdmPacket::parse(kind, packet) {
                Ok(packet) => return Ok(Some(packet)),
                Err(e) => warn!("Dropping EDM packet: {e}"),
            }
        }
    }
}

impl Encoder<EdmPacket> for EdmCodec {
    type Error = Error;

    fn encode(&mut self, item: EdmPacket, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let channel = item.channel();
        let body = item.body();

        let payload_len = 2 + usize::from(channel.is_some()) + body.len();

        if payload_len > MAX_PAYLOAD {
            return Err(Error::InvalidParameter(format!(
                "EDM payloads are at most {MAX_PAYLOAD} bytes, got {payload_len}"
            )));
        }

        dst.reserve(payload_len + EDM_OVERHEAD);
        dst.put_u8(START_BYTE);
        dst.put_u16(payload_len as u16);
        dst.put_u8(0x00);
        dst.put_u8(item.kind());
        if let Some(channel) = channel {
            dst.put_u8(channel);
        }
        dst.extend_from_slice(body);
        dst.put_u8(END_BYTE);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn encoded(packet: EdmPacket) -> BytesMut {
        let mut dst = BytesMut::new();
        EdmCodec.encode(packet, &mut dst).unwrap();
        dst
    }

    #[test]
    fn at_request_layout() {
        let dst = encoded(EdmPacket::AtRequest(Bytes::from_static(b"AT\r")));

        assert_eq!(
            &dst[..],
            &[0xAA, 0x00, 0x05, 0x00, 0x44, b'A', b'T', b'\r', 0x55]
        );
    }

    #[test]
    fn data_command_layout() {
        let dst = encoded(EdmPacket::DataCommand {
            channel: 3,
            data: Bytes::from_static(b"hi"),
        });

        assert_eq!(
            &dst[..],
            &[0xAA, 0x00, 0x05, 0x00, 0x36, 0x03, b'h', b'i', 0x55]
        );
    }

    #[test]
    fn startup_text_is_skipped() {
        let mut src = BytesMut::from(&b"\r\n+STARTUP\r\n"[..]);
        src.extend_from_slice(&encoded(EdmPacket::StartEvent));
        src.extend_from_slice(&encoded(EdmPacket::AtConfirmation(Bytes::from_static(
            b"\r\nOK\r\n",
        ))));

        assert_eq!(EdmCodec.decode(&mut src).unwrap(), Some(EdmPacket::StartEvent));
        assert_eq!(
            EdmCodec.decode(&mut src).unwrap(),
            Some(EdmPacket::AtConfirmation(Bytes::from_static(b"\r\nOK\r\n")))
        );
        assert_eq!(EdmCodec.decode(&mut src).unwrap(), None);
    }

    #[test]
    fn partial_packet_waits() {
        let full = encoded(EdmPacket::DataEvent {
            channel: 1,
            data: Bytes::from_static(b"payload"),
        });

        let mut src = BytesMut::from(&full[..6]);
        assert_eq!(EdmCodec.decode(&mut src).unwrap(), None);

        src.extend_from_slice(&full[6..]);
        assert_eq!(
            EdmCodec.decode(&mut src).unwrap(),
            Some(EdmPacket::DataEvent {
                channel: 1,
                data: Bytes::from_static(b"payload")
            })
        );
    }

    #[test]
    fn bad_end_byte_resynchronises() {
        let mut bad = encoded(EdmPacket::DisconnectEvent { channel: 2 });
        let last = bad.len() - 1;
        bad[last] = 0x00;

        let mut src = bad;
        src.extend_from_slice(&encoded(EdmPacket::DisconnectEvent { channel: 4 }));

        assert_eq!(
            EdmCodec.decode(&mut src).unwrap(),
            Some(EdmPacket::DisconnectEvent { channel: 4 })
        );
    }

    #[test]
    fn oversized_payload_is_refused() {
        let mut dst = BytesMut::new();
        let result = EdmCodec.encode(
            EdmPacket::AtRequest(Bytes::from(vec![b'A'; MAX_PAYLOAD])),
            &mut dst,
        );

        assert!(matches!(result, Err(Error::InvalidParameter(_))));
    }
}
