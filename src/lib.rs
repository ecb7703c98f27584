//! An IRC server, client wire library, and DCC relay engine.
//!
//! Three subsystems share this crate: the line-oriented [`connection`]
//! transport and [`acceptor`] listener, the transactional [`state`]
//! machine for users/channels/memberships, and the [`dcc`] relay that
//! pairs sender/receiver sockets for server-mediated file transfer.
//! [`message`], [`casemap`], [`glob`], and [`protocol_dsl`] implement the
//! wire format and its supporting grammar; [`dispatcher`] is where parsed
//! commands meet server state.

pub mod acceptor;
pub mod casemap;
pub mod config;
pub mod connection;
pub mod dcc;
pub mod dispatcher;
pub mod error;
pub mod glob;
pub mod line_codec;
pub mod logging;
pub mod message;
pub mod numeric;
pub mod protocol_dsl;
pub mod server;
pub mod state;

pub use error::{Error, Result};

/// The default port an `ircd` instance listens on when none is given.
pub const DEFAULT_PORT: u16 = 6667;
