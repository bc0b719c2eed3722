use std::fmt::Display;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::codecs::lines::trim;

/// Serial ports.
pub mod serial;

/// Virtual AT streams carried inside extended data mode.
pub mod edm;

/// Anything an AT client can be added on top of.
///
/// Implemented for every suitable byte stream, such as
/// [`tokio_serial::SerialStream`], [`tokio::io::DuplexStream`] or
/// [`tokio::net::TcpStream`].
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Something that happened on a wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireEvent {
    /// These bytes were put on wire, towards the module.
    ToWire(Bytes),

    /// These bytes came from wire, from the module.
    FromWire(Bytes),
}

impl Display for WireEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self {
            WireEvent::ToWire(b) => {
                write!(f, "ToWire: {}", String::from_utf8_lossy(trim(b)))
            }
            WireEvent::FromWire(b) => {
                write!(f, "FromWire: {}", String::from_utf8_lossy(trim(b)))
            }
        }
    }
}

impl WireEvent {
    /// Attempt to unwrap the event as something that was sent to wire.
    pub fn as_to_wire(&self) -> Option<&Bytes> {
        if let Self::ToWire(v) = self {
            Some(v)
        } else {
            None
        }
    }

    /// Attempt to unwrap the event as something that was received from wire.
    pub fn as_from_wire(&self) -> Option<&Bytes> {
        if let Self::FromWire(v) = self {
            Some(v)
        } else {
            None
        }
    }
}
