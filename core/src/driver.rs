//! A blocking host for `Client` over `std::net::TcpStream`.
//!
//! # Design
//! The driver is the smallest complete host: it performs every `Action` the
//! client hands out, reads the socket, and feeds what it saw back as
//! `SocketEvent`s. It exists for tools and tests that want real sockets
//! without an async runtime. A read that times out is reported to the
//! caller rather than to the client, since the connection itself is not at
//! fault.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use bytes::Bytes;

use crate::client::{Action, Client, Event};
use crate::error::ConnError;
use crate::transport::SocketEvent;

const READ_BUFFER: usize = 16 * 1024;
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct BlockingDriver {
    client: Client,
    socket: Option<TcpStream>,
    upgraded: Option<TcpStream>,
    connects: usize,
    read_timeout: Duration,
}

impl BlockingDriver {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            socket: None,
            upgraded: None,
            connects: 0,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut Client {
        &mut self.client
    }

    /// Number of TCP connections opened so far.
    pub fn connects(&self) -> usize {
        self.connects
    }

    /// The socket detached by the last `Event::Upgrade`.
    pub fn take_upgraded_socket(&mut self) -> Option<TcpStream> {
        self.upgraded.take()
    }

    /// Drive the connection until `done` returns `true` for an event. Returns
    /// every event observed on the way, the final one included.
    pub fn run_until<F>(&mut self, mut done: F) -> Result<Vec<Event>, ConnError>
    where
        F: FnMut(&Event) -> bool,
    {
        let mut seen = Vec::new();
        loop {
            self.perform_actions()?;

            let mut finished = false;
            while let Some(event) = self.client.poll_event() {
                if matches!(event, Event::Upgrade(_)) {
                    self.upgraded = self.socket.take();
                }
                finished |= done(&event);
                seen.push(event);
            }
            if finished {
                self.perform_actions()?;
                return Ok(seen);
            }

            let event = self.read()?;
            self.client.handle(event)?;
        }
    }

    fn perform_actions(&mut self) -> Result<(), ConnError> {
        while let Some(action) = self.client.poll_action() {
            match action {
                Action::Connect { host, port } => {
                    self.connects += 1;
                    let event = match self.connect(&host, port) {
                        Ok(stream) => {
                            self.socket = Some(stream);
                            SocketEvent::Connected
                        }
                        Err(e) => SocketEvent::Error(format!("connect {host}:{port}: {e}")),
                    };
                    self.client.handle(event)?;
                }
                Action::Write(bytes) => {
                    let Some(socket) = self.socket.as_mut() else {
                        conn_debug!("dropping {} bytes with no socket", bytes.len());
                        continue;
                    };
                    if let Err(e) = socket.write_all(&bytes) {
                        self.client.handle(SocketEvent::Error(e.to_string()))?;
                    }
                }
                Action::Close => {
                    if let Some(socket) = self.socket.take() {
                        if let Err(e) = socket.shutdown(Shutdown::Both) {
                            conn_debug!("shutdown: {e}");
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn connect(&self, host: &str, port: u16) -> std::io::Result<TcpStream> {
        let stream = TcpStream::connect((host, port))?;
        stream.set_read_timeout(Some(self.read_timeout))?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn read(&mut self) -> Result<SocketEvent, ConnError> {
        let Some(socket) = self.socket.as_mut() else {
            return Err(ConnError::Transport("no open socket to read from".to_string()));
        };

        let mut buf = [0u8; READ_BUFFER];
        match socket.read(&mut buf) {
            Ok(0) => {
                self.socket = None;
                Ok(SocketEvent::Ended)
            }
            Ok(n) => Ok(SocketEvent::Data(Bytes::copy_from_slice(&buf[..n]))),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Err(
                ConnError::Transport(format!("read timed out after {:?}", self.read_timeout)),
            ),
            Err(e) => Ok(SocketEvent::Error(e.to_string())),
        }
    }
}
