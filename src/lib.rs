//! A blocking RFC 6455 WebSocket server core: a thread-per-connection
//! frame reader, handshake validator, and connection state machine.
//!
//! The crate is split the way the read path actually works, leaf modules
//! first: [`buffer`] and [`handshake`] are the two bounded resource pools,
//! [`frame`] is the wire format, [`reader`] assembles frames into messages,
//! [`connection`] is the per-connection write surface and dispatch loop,
//! and [`server`] wires all of the above into a listening socket.

#![warn(missing_docs)]

/// typed error hierarchy for every fallible operation in this crate
pub mod errors;

/// RFC 6455 frame header layout, opcodes, and masking
pub mod frame;

/// the two-tier buffer provider (static + pooled + heap fallback)
pub mod buffer;

/// opening-handshake recognition, validation, and reply generation
pub mod handshake;

/// the frame reader / message assembler and its fragmentation state machine
pub mod reader;

/// the per-connection write surface and read/dispatch loop
pub mod connection;

/// the user-supplied handler contract
pub mod handler;

/// server configuration
pub mod config;

/// the listening-socket orchestrator: accept loop, thread-per-connection
pub mod server;

pub use config::Config;
pub use connection::Connection;
pub use errors::{HandshakeError, ProtocolError, WsError};
pub use frame::OpCode;
pub use handler::Handler;
pub use handshake::HandshakeRequest;
pub use reader::Message;
pub use server::{Server, Stream};
