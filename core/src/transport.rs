//! Byte-stream adapter over a plain or TLS-wrapped socket.
//!
//! # Design
//! The core never owns a socket. The host reports what happened on the
//! socket as `SocketEvent`s and drains bytes to send with `take_outgoing`.
//! `Transport` sits between the two and hides whether a TLS session is in
//! the middle: in plain mode bytes pass straight through, in TLS mode a
//! `rustls::ClientConnection` decrypts incoming records, encrypts writes,
//! and holds `Connected` back until the handshake finishes. Either way the
//! connection above sees the same `TransportEvent`s.
//!
//! Outgoing bytes stay buffered here until the host drains them, so
//! `write` can report backpressure once that buffer crosses the high-water
//! mark.

use std::io::{Read, Write};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{self, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore, SignatureScheme};

use crate::config::{ConnectOptions, TlsConfig};
use crate::error::ConnError;

/// What the host observed on the raw socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Connected,
    Data(Bytes),
    Ended,
    Error(String),
    Pause,
    Resume,
}

/// What the connection sees, after TLS (if any) has been peeled off.
#[derive(Debug)]
pub enum TransportEvent {
    Connected,
    Data(Bytes),
    Ended,
    Error(ConnError),
    Pause,
    Resume,
}

#[derive(Debug)]
enum Mode {
    Plain,
    Tls(Box<ClientConnection>),
}

#[derive(Debug)]
pub struct Transport {
    mode: Mode,
    outgoing: BytesMut,
    high_water_mark: usize,
    connected: bool,
    ended: bool,
    destroyed: bool,
}

impl Transport {
    pub fn plain(high_water_mark: usize) -> Self {
        Self {
            mode: Mode::Plain,
            outgoing: BytesMut::new(),
            high_water_mark,
            connected: false,
            ended: false,
            destroyed: false,
        }
    }

    /// TLS session to `host`. The SNI name comes from `config`, falling back
    /// to `host`.
    pub fn tls(config: &TlsConfig, host: &str, high_water_mark: usize) -> Result<Self, ConnError> {
        let name = config.server_name().unwrap_or(host).to_string();
        let server_name =
            ServerName::try_from(name.clone()).map_err(|_| ConnError::Tls(format!("invalid server name {name:?}")))?;
        let conn = ClientConnection::new(Arc::new(client_config(config)?), server_name)?;

        let mut transport = Self::plain(high_water_mark);
        transport.mode = Mode::Tls(Box::new(conn));
        Ok(transport)
    }

    pub fn for_options(options: &ConnectOptions) -> Result<Self, ConnError> {
        match options.tls() {
            Some(tls) => Self::tls(tls, options.host(), options.high_water_mark()),
            None => Ok(Self::plain(options.high_water_mark())),
        }
    }

    pub fn is_secure(&self) -> bool {
        matches!(self.mode, Mode::Tls(_))
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Bytes waiting for the host to send.
    pub fn buffered(&self) -> usize {
        self.outgoing.len()
    }

    /// Translate one socket event into zero or more transport events.
    pub fn handle(&mut self, event: SocketEvent) -> Vec<TransportEvent> {
        if self.destroyed {
            return Vec::new();
        }

        match event {
            SocketEvent::Connected => match &mut self.mode {
                Mode::Plain => {
                    self.connected = true;
                    vec![TransportEvent::Connected]
                }
                Mode::Tls(conn) => {
                    drain_tls(conn, &mut self.outgoing);
                    Vec::new()
                }
            },
            SocketEvent::Data(data) => match &mut self.mode {
                Mode::Plain => vec![TransportEvent::Data(data)],
                Mode::Tls(conn) => {
                    let mut events = receive_tls(conn, &data, &mut self.connected);
                    drain_tls(conn, &mut self.outgoing);
                    if events.iter().any(|e| matches!(e, TransportEvent::Ended)) {
                        if self.ended {
                            events.retain(|e| !matches!(e, TransportEvent::Ended));
                        }
                        self.ended = true;
                    }
                    events
                }
            },
            SocketEvent::Ended => {
                if std::mem::replace(&mut self.ended, true) {
                    Vec::new()
                } else {
                    vec![TransportEvent::Ended]
                }
            }
            SocketEvent::Error(msg) => vec![TransportEvent::Error(ConnError::Transport(msg))],
            SocketEvent::Pause => vec![TransportEvent::Pause],
            SocketEvent::Resume => vec![TransportEvent::Resume],
        }
    }

    /// Queue `data` for the socket. Returns `false` when the outgoing buffer
    /// is above the high-water mark.
    pub fn write(&mut self, data: &[u8]) -> Result<bool, ConnError> {
        if self.destroyed {
            return Err(ConnError::Transport("write after destroy".to_string()));
        }

        match &mut self.mode {
            Mode::Plain => self.outgoing.extend_from_slice(data),
            Mode::Tls(conn) => {
                // rustls caps its own record buffer, so encrypt piecewise and
                // move records out after every piece.
                let mut rest = data;
                while !rest.is_empty() {
                    let n = conn.writer().write(rest).map_err(|e| ConnError::Tls(e.to_string()))?;
                    drain_tls(conn, &mut self.outgoing);
                    if n == 0 {
                        return Err(ConnError::Tls("session accepted no plaintext".to_string()));
                    }
                    rest = &rest[n..];
                }
            }
        }
        Ok(self.outgoing.len() < self.high_water_mark)
    }

    pub fn take_outgoing(&mut self) -> Option<Bytes> {
        if self.outgoing.is_empty() {
            None
        } else {
            Some(self.outgoing.split().freeze())
        }
    }

    /// Tear the stream down. A TLS session queues its close_notify, which
    /// remains available from `take_outgoing`. Returns `false` if already
    /// destroyed.
    pub fn destroy(&mut self) -> bool {
        if self.destroyed {
            return false;
        }
        self.destroyed = true;
        if let Mode::Tls(conn) = &mut self.mode {
            conn.send_close_notify();
            drain_tls(conn, &mut self.outgoing);
        }
        true
    }
}

fn receive_tls(conn: &mut ClientConnection, data: &[u8], connected: &mut bool) -> Vec<TransportEvent> {
    let mut events = Vec::new();
    let mut input = data;

    while !input.is_empty() {
        if let Err(e) = conn.read_tls(&mut input) {
            events.push(TransportEvent::Error(ConnError::Tls(e.to_string())));
            return events;
        }
        let state = match conn.process_new_packets() {
            Ok(state) => state,
            Err(e) => {
                events.push(TransportEvent::Error(e.into()));
                return events;
            }
        };

        if !*connected && !conn.is_handshaking() {
            *connected = true;
            events.push(TransportEvent::Connected);
        }

        let available = state.plaintext_bytes_to_read();
        if available > 0 {
            let mut plaintext = vec![0u8; available];
            if let Err(e) = conn.reader().read_exact(&mut plaintext) {
                events.push(TransportEvent::Error(ConnError::Tls(e.to_string())));
                return events;
            }
            events.push(TransportEvent::Data(Bytes::from(plaintext)));
        }

        if state.peer_has_closed() {
            events.push(TransportEvent::Ended);
            break;
        }
    }
    events
}

fn drain_tls(conn: &mut ClientConnection, outgoing: &mut BytesMut) {
    let mut sink = Vec::new();
    while conn.wants_write() {
        match conn.write_tls(&mut sink) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }
    outgoing.extend_from_slice(&sink);
}

fn client_config(config: &TlsConfig) -> Result<ClientConfig, ConnError> {
    let provider = Arc::new(crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone()).with_safe_default_protocol_versions()?;

    if !config.verify {
        return Ok(builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
            .with_no_client_auth());
    }

    let mut roots = RootCertStore::empty();
    if config.certificates.is_empty() {
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    } else {
        for der in &config.certificates {
            roots.add(CertificateDer::from(der.clone()))?;
        }
    }
    Ok(builder.with_root_certificates(roots).with_no_client_auth())
}

/// Verifier installed when `TlsConfig::verify` is off. Signatures are still
/// checked so the handshake stays well-formed; the chain and name are not.
#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
