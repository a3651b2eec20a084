//! Multi-user chat relay over WebSockets.
//!
//! See `README.md` for an overview, usage instructions, and the JSON
//! message protocol. Each module focuses on a concrete responsibility:
//!
//! - [`cli`] parses the command-line interface for the relay binary.
//! - [`relay`] binds the HTTP listener, upgrades `/chatserver/connect`
//!   requests to WebSockets, and drives graceful shutdown.
//! - [`protocol`] defines the JSON system message, the closed set of client
//!   requests, and decoding/encoding of text frames.
//! - [`session`] holds session identities and the bounded outbound queue each
//!   session is reached through.
//! - [`registry`] keeps the session table and room table consistent under a
//!   single lock: connect, disconnect, join, leave, and listings.
//! - [`router`] dispatches decoded requests, including direct and room
//!   messages, and reports failures back to the requester.
//!
//! Integration and unit tests use this crate directly to exercise the
//! registry state machine and wire protocol.

mod connection;

pub mod cli;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod router;
pub mod session;
