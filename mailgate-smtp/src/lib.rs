//! A server-side SMTP/LMTP protocol engine.
//!
//! The engine speaks RFC 5321 plus the STARTTLS, AUTH, XCLIENT, XFORWARD,
//! and PIPELINING extensions. It owns wire framing, command sequencing, and
//! reply formatting; every policy decision (connections, credentials,
//! envelopes, messages) is delegated to an application-supplied [`Hooks`]
//! implementation.
//!
//! [`Server`] is the TCP front end; [`SmtpConnection`] drives a single
//! stream and is generic over the transport, so tests run over in-memory
//! duplex pipes.

pub mod config;
pub mod connection;
pub mod dns;
pub mod error;
pub mod framer;
pub mod hooks;
pub mod middleware;
pub mod proto;
pub mod proxy;
pub mod reply;
pub mod server;
pub mod session;
pub mod transport;

pub use config::Settings;
pub use connection::{Environment, SmtpConnection};
pub use hooks::{Body, Credentials, Hooks, Rejection};
pub use mailgate_common::{Signal, status::Status};
pub use reply::Reply;
pub use server::Server;
pub use session::{Envelope, Session};
