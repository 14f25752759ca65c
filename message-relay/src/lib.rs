//! Point-to-point text relay over TCP.
//!
//! Clients connect, send a username as their first line, and from then on
//! write `receiver:body` lines. The relay forwards each one to the receiver as
//! `sender:receiver:body`, or drops it if nobody is registered under that
//! name. `DISCONNECT:<username>` ends a session from either side.
//!
//! - [`server`] owns the listening socket, spawns a task per connection and
//!   routes messages through the shared [`registry`].
//! - [`connection`] is the per-socket state machine run by those tasks.
//! - [`agent`] is the client side: connect, send, and receive through a
//!   [`agent::MessageListener`].
//! - [`message`] holds the line protocol and the async read/write helpers.
//! - [`cli`], [`config`] and [`client`] back the `message_relay` binary.

pub mod agent;
pub mod cli;
pub mod client;
pub mod config;
pub mod connection;
pub mod message;
pub mod registry;
pub mod server;
