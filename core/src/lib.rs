//! Connection core of an HTTP/1.1 client.
//!
//! # Overview
//! One `Client` owns one connection to one origin. It queues requests,
//! serializes their writes in FIFO order, parses responses, keeps the
//! connection alive between requests, and re-establishes it when the peer
//! closes an idle socket before the next request started sending.
//!
//! # Design
//! - Host-does-IO: the core never touches a socket. The host feeds
//!   `SocketEvent`s into `Client::handle` and performs the `Action`s it polls
//!   back out. `BlockingDriver` is a ready-made host over `std::net`.
//! - TLS runs in memory through `rustls`, inside `Transport`, so plain and
//!   secure connections look identical above it.
//! - Lifecycle decisions are a pure transition table (`ConnectionStateMachine`)
//!   that tests can drive edge by edge.
//! - Parsers are recycled through a shared `ParserPool`.
//! - Debug logging goes through the `log` facade and is switched on with the
//!   `HTTP_CONN_DEBUG` environment variable.

/// `log::debug!`, gated on `HTTP_CONN_DEBUG`.
macro_rules! conn_debug {
    ($($arg:tt)*) => {
        if $crate::config::debug_enabled() {
            log::debug!($($arg)*);
        }
    };
}

pub mod client;
pub mod config;
pub mod driver;
pub mod error;
pub mod http;
pub mod parser;
pub mod queue;
pub mod state;
pub mod transport;

pub use client::{Action, Client, Event, Upgrade};
pub use config::{ConnectOptions, TlsConfig};
pub use driver::BlockingDriver;
pub use error::{ConnError, ErrorClass, Invariant};
pub use http::{HttpMethod, HttpRequest, ResponseHead};
pub use parser::{ParserPool, PoolStats, ResponseParser};
pub use queue::{RequestHandle, RequestId, RequestQueue};
pub use state::{ConnState, ConnectionStateMachine};
pub use transport::{SocketEvent, Transport};

/// Client for `host:port`, over TLS when `tls` is given. No connection is
/// made until the first request.
pub fn create_client(port: u16, host: &str, tls: Option<TlsConfig>) -> Client {
    let options = match tls {
        Some(tls) => ConnectOptions::secure(host, port, tls),
        None => ConnectOptions::new(host, port),
    };
    Client::new(options)
}
