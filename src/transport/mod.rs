//! Live push transport: envelope codec, per-connection state machine and the
//! registry that multiplexes connections by (channel, identity).

mod backoff;
mod connection;
mod envelope;
mod registry;
mod socket;

pub use backoff::Backoff;
pub use connection::{
  ConnectionHandle, ConnectionKey, ConnectionSettings, ConnectionStatus, MessageHandler,
  SendOutcome, StatusChange,
};
pub use envelope::{DecodeError, Envelope};
pub use registry::ConnectionRegistry;
pub use socket::{Connector, FrameSink, FrameStream, Socket, WsConnector};

#[cfg(test)]
pub(crate) use socket::testing;
