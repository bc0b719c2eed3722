/// Delimited lines, as used by the AT text protocol.
pub mod lines;

/// A continuous stream of UBX frames.
pub mod ubx;

/// Extended data mode (EDM) packets.
pub mod edm;
