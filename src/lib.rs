#![deny(missing_docs)]

//! The AT client, queue and UBX framing core for u-blox modules.
//!
//! An [`at::AtClient`] is added on top of any byte stream (a serial port,
//! an in-memory stream or an EDM multiplexed channel).
//! It owns a receive task which reads the stream, hands response lines to the
//! one exchange in flight, and dispatches unsolicited result codes (URCs)
//! to registered handlers.
//!
//! The [`ubx`] module frames and checks UBX binary messages.
//!
//! The [`queue`] module provides fixed size item queues for handing data
//! between tasks, and is what the AT client uses to defer URC work.

/// The AT command client: exchanges, the receive task and URC dispatch.
pub mod at;

/// Fixed capacity item queues, coordinated by semaphores.
pub mod queue;

/// UBX binary protocol frames.
pub mod ubx;

/// Codecs for encoding/decoding messages to/from wire.
pub mod codecs;

/// Byte streams AT clients can be added on top of.
pub mod transport;

/// A simulated module, useful to test AT clients without a device.
pub mod mock;

/// The command line interface.
pub mod cli;

/// Relates to config files.
pub mod config;

/// Possible errors in this library.
pub mod error;

/// Logging/tracing setup.
pub mod logging;
