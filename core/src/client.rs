//! The connection façade: one transport, one parser, one request queue.
//!
//! # Design
//! `Client` never performs I/O. The host feeds it `SocketEvent`s through
//! `handle`, executes the `Action`s it hands out from `poll_action`
//! (connect, write, close), and reads application-facing `Event`s from
//! `poll_event`. Every decision about the connection lives here and in
//! `ConnectionStateMachine`; every decision about ordering lives in
//! `RequestQueue`.
//!
//! Writes are serialized by queue position. Only the head request reaches
//! the transport, and only while the connection is OPEN; everything else is
//! buffered on the request until it becomes the head. Responses are always
//! attributed to the head, so requests complete strictly in FIFO order and a
//! connection carries one request at a time.
//!
//! Known gaps, kept on purpose:
//! - When a response ends without keep-alive, the connection closes even if
//!   more requests are queued. They stay queued and are sent only if a later
//!   `request` call re-establishes the connection.
//! - When the transport ends after the head already sent bytes, nothing is
//!   retried. The request is reported through `Event::Stalled` and left
//!   queued.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::config::ConnectOptions;
use crate::error::{ConnError, Invariant};
use crate::http::{HttpMethod, HttpRequest, ResponseHead};
use crate::parser::{ParserHandler, ParserMode, ParserPool, ResponseParser};
use crate::queue::{RequestHandle, RequestId, RequestQueue};
use crate::state::{ConnState, ConnectionStateMachine, Signal, Step};
use crate::transport::{SocketEvent, Transport, TransportEvent};

/// Socket work the host must perform, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Connect { host: String, port: u16 },
    Write(Bytes),
    Close,
}

/// A connection handed off after a `101 Switching Protocols` response.
///
/// The host keeps the socket open and gives it, together with `transport`
/// (which still holds any TLS session) and the already-received `head`
/// bytes, to whatever speaks the new protocol.
#[derive(Debug)]
pub struct Upgrade {
    pub request: RequestHandle,
    pub response: ResponseHead,
    pub transport: Transport,
    pub head: Bytes,
}

/// Something the application may want to observe.
#[derive(Debug)]
pub enum Event {
    /// The server sent `100 Continue`; the request body may follow.
    Continue(RequestId),
    Response { request: RequestId, head: ResponseHead },
    Body { request: RequestId, chunk: Bytes },
    ResponseEnd(RequestId),
    Upgrade(Box<Upgrade>),
    /// The transport ended after this request started sending; it will not
    /// be retried.
    Stalled(RequestId),
    Pause,
    Resume,
    /// The connection failed and was torn down.
    Error(ConnError),
}

#[derive(Debug)]
pub struct Client {
    options: ConnectOptions,
    machine: ConnectionStateMachine,
    transport: Option<Transport>,
    parser: Option<ResponseParser>,
    pool: ParserPool,
    queue: RequestQueue,
    /// Head request whose response is being received.
    in_flight: Option<RequestId>,
    accept_upgrades: bool,
    /// Invariant broken inside a parser callback, reported once parsing
    /// returns.
    violation: Option<Invariant>,
    /// Bumped whenever the transport is replaced or dropped, so a batch of
    /// events from an old transport is not applied to a new one.
    generation: u64,
    actions: VecDeque<Action>,
    events: VecDeque<Event>,
}

impl Client {
    pub fn new(options: ConnectOptions) -> Self {
        Self::with_pool(options, ParserPool::default())
    }

    /// Client that borrows its parser from a shared pool.
    pub fn with_pool(options: ConnectOptions, pool: ParserPool) -> Self {
        Self {
            options,
            machine: ConnectionStateMachine::new(),
            transport: None,
            parser: None,
            pool,
            queue: RequestQueue::new(),
            in_flight: None,
            accept_upgrades: false,
            violation: None,
            generation: 0,
            actions: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.options
    }

    pub fn state(&self) -> ConnState {
        self.machine.state()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn peek_head(&self) -> Option<&RequestHandle> {
        self.queue.peek_head()
    }

    pub fn pool(&self) -> &ParserPool {
        &self.pool
    }

    /// Register (or withdraw) interest in protocol upgrades. Without it a
    /// `101` response destroys the connection.
    pub fn accept_upgrades(&mut self, accept: bool) {
        self.accept_upgrades = accept;
    }

    /// Queue a request and encode its head. The connection is established
    /// if it is closed.
    pub fn request(
        &mut self,
        method: HttpMethod,
        url: &str,
        headers: Vec<(String, String)>,
    ) -> Result<RequestId, ConnError> {
        if self.machine.state() == ConnState::Dead {
            return Err(ConnError::Dead);
        }

        let request = HttpRequest::new(method, url, headers);
        let head = request.encode_head(&self.options.authority());
        let handle = RequestHandle::new(request);
        let id = handle.id();
        conn_debug!("queue {id}: {} {}", handle.method(), handle.url());
        self.queue.append(handle);

        if self.machine.state() == ConnState::Closed {
            self.establish()?;
        }
        self.write(id, &head)?;
        Ok(id)
    }

    /// Write request bytes. Returns `true` only if the bytes went to the
    /// transport and it is below its high-water mark; `false` means they
    /// were buffered (the request is not the head, or the connection is not
    /// open) or the transport asked for backpressure.
    pub fn write(&mut self, request: RequestId, data: &[u8]) -> Result<bool, ConnError> {
        if !self.queue.contains(request) {
            return Err(ConnError::UnknownRequest(request));
        }

        let data = Bytes::copy_from_slice(data);
        if self.queue.is_head(request) && self.machine.state() == ConnState::Open {
            self.flush_head();
            return Ok(self.send(data));
        }

        self.queue.buffer(request, data);
        Ok(false)
    }

    /// Feed one socket event. An `Err` means an internal invariant broke;
    /// the connection has already been destroyed.
    pub fn handle(&mut self, event: SocketEvent) -> Result<(), ConnError> {
        let generation = self.generation;
        let Some(transport) = self.transport.as_mut() else {
            conn_debug!("no transport, dropping socket event");
            return Ok(());
        };

        for event in transport.handle(event) {
            if self.generation != generation {
                break;
            }
            self.dispatch(event)?;
        }
        Ok(())
    }

    pub fn poll_action(&mut self) -> Option<Action> {
        if let Some(action) = self.actions.pop_front() {
            return Some(action);
        }
        self.transport.as_mut()?.take_outgoing().map(Action::Write)
    }

    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Tear everything down: transport, parser, queue. Safe to call
    /// repeatedly.
    pub fn destroy(&mut self) {
        if let Err(inv) = self.machine.apply(Signal::Destroy) {
            log::warn!("destroy: {inv}");
        }
        self.release();
        self.queue.clear();
    }

    fn establish(&mut self) -> Result<(), ConnError> {
        self.transition(Signal::Establish)?;

        match Transport::for_options(&self.options) {
            Ok(transport) => self.transport = Some(transport),
            Err(err) => {
                self.fail(err);
                return Ok(());
            }
        }

        let mut parser = match self.parser.take() {
            Some(parser) => parser,
            None => self.pool.allocate(),
        };
        parser.reinitialize(ParserMode::Response);
        self.parser = Some(parser);

        self.generation += 1;
        conn_debug!("connecting to {}:{}", self.options.host(), self.options.port());
        self.actions.push_back(Action::Connect {
            host: self.options.host().to_string(),
            port: self.options.port(),
        });
        Ok(())
    }

    fn transition(&mut self, signal: Signal) -> Result<Step, ConnError> {
        match self.machine.apply(signal) {
            Ok(step) => Ok(step),
            Err(inv) => {
                self.destroy();
                Err(inv.into())
            }
        }
    }

    fn dispatch(&mut self, event: TransportEvent) -> Result<(), ConnError> {
        match event {
            TransportEvent::Connected => {
                if self.transition(Signal::Connected)? == Step::FlushHead {
                    self.flush_head();
                }
            }
            TransportEvent::Data(data) => self.on_data(data)?,
            TransportEvent::Ended => self.on_end()?,
            TransportEvent::Error(err) => self.fail(err),
            TransportEvent::Pause => self.events.push_back(Event::Pause),
            TransportEvent::Resume => self.events.push_back(Event::Resume),
        }
        Ok(())
    }

    fn on_data(&mut self, data: Bytes) -> Result<(), ConnError> {
        if self.queue.is_empty() {
            self.destroy();
            return Err(Invariant::DataWithoutRequest.into());
        }
        let Some(mut parser) = self.parser.take() else {
            return Ok(());
        };

        let generation = self.generation;
        let result = parser.execute(&data, &mut Incoming(self));

        if let Some(inv) = self.violation.take() {
            self.pool.free(parser);
            self.destroy();
            return Err(inv.into());
        }

        match result {
            Err(err) => {
                self.pool.free(parser);
                self.destroy();
                self.events.push_back(Event::Error(err.into()));
            }
            Ok(consumed) if parser.is_upgrade() => {
                let response = parser.take_upgrade_head();
                self.pool.free(parser);
                self.on_upgrade(response, data.slice(consumed..));
            }
            Ok(_) => self.rebind_parser(parser, generation),
        }
        Ok(())
    }

    fn on_end(&mut self) -> Result<(), ConnError> {
        if let Some(mut parser) = self.parser.take() {
            let generation = self.generation;
            let result = if parser.has_incoming() {
                parser.finish(&mut Incoming(self))
            } else {
                Ok(())
            };

            if let Some(inv) = self.violation.take() {
                self.pool.free(parser);
                self.destroy();
                return Err(inv.into());
            }
            if let Err(err) = result {
                self.pool.free(parser);
                self.destroy();
                self.events.push_back(Event::Error(err.into()));
                return Ok(());
            }
            if generation != self.generation {
                // The close-delimited response that just finished tore the
                // connection down.
                self.pool.free(parser);
                return Ok(());
            }
            self.parser = Some(parser);
        }

        let head_sent = self.queue.peek_head().is_some_and(RequestHandle::data_sent);
        match self.transition(Signal::Ended { head_sent })? {
            Step::Reconnect => {
                conn_debug!("transport ended before the head sent anything");
                self.release();
                if !self.queue.is_empty() {
                    self.establish()?;
                }
            }
            Step::Stall => {
                if let Some(head) = self.queue.peek_head() {
                    log::warn!("transport ended after request {} started sending", head.id());
                    self.events.push_back(Event::Stalled(head.id()));
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn on_upgrade(&mut self, response: Option<ResponseHead>, rest: Bytes) {
        let handed_off = match (self.accept_upgrades, response) {
            (true, Some(response)) => match (self.queue.pop_head(), self.transport.take()) {
                (Some(request), Some(transport)) => Some(Upgrade {
                    request,
                    response,
                    transport,
                    head: rest,
                }),
                _ => None,
            },
            _ => None,
        };

        let Some(upgrade) = handed_off else {
            self.destroy();
            self.events.push_back(Event::Error(ConnError::UnhandledUpgrade));
            return;
        };

        if let Err(inv) = self.machine.apply(Signal::Finish) {
            log::warn!("upgrade: {inv}");
        }
        self.in_flight = None;
        self.generation += 1;
        conn_debug!("upgrade to {:?}", upgrade.response.header("upgrade"));
        self.events.push_back(Event::Upgrade(Box::new(upgrade)));
    }

    /// A response head for the queue head. Returns whether body parsing is
    /// suppressed.
    fn on_response_head(&mut self, head: ResponseHead) -> bool {
        let Some(request) = self.queue.head_mut() else {
            self.violation = Some(Invariant::DataWithoutRequest);
            return true;
        };
        let id = request.id();

        if head.status == 100 {
            self.events.push_back(Event::Continue(id));
            return true;
        }
        if head.is_informational() {
            conn_debug!("ignoring interim {} for {id}", head.status);
            return true;
        }

        let skip_body = *request.method() == HttpMethod::Head;
        if request.should_keep_alive() && (head.wants_close() || (!skip_body && head.is_close_delimited())) {
            request.disable_keep_alive();
        }

        self.in_flight = Some(id);
        self.events.push_back(Event::Response { request: id, head });
        skip_body
    }

    fn on_message_complete(&mut self) -> bool {
        // Interim responses never set `in_flight`.
        let Some(id) = self.in_flight.take() else {
            return true;
        };
        self.events.push_back(Event::ResponseEnd(id));
        self.complete_request(id)
    }

    /// Pop the finished head and either hand the wire to the next request or
    /// close. Returns whether parsing may continue.
    fn complete_request(&mut self, id: RequestId) -> bool {
        if !self.queue.is_head(id) {
            self.violation = Some(Invariant::CompletionOutOfOrder {
                head: self.queue.peek_head().map(RequestHandle::id),
                completed: id,
            });
            return false;
        }
        let Some(done) = self.queue.pop_head() else {
            return false;
        };

        if done.should_keep_alive() && !self.queue.is_empty() {
            self.flush_head();
            return true;
        }

        conn_debug!(
            "closing after {} (keep-alive: {}, queued: {})",
            done.id(),
            done.should_keep_alive(),
            self.queue.len()
        );
        if let Err(inv) = self.machine.apply(Signal::Finish) {
            self.violation = Some(inv);
        }
        self.release();
        false
    }

    fn flush_head(&mut self) {
        if self.machine.state() != ConnState::Open {
            return;
        }
        let pending = match self.queue.head_mut() {
            Some(head) => head.take_pending(),
            None => return,
        };
        for chunk in pending {
            self.send(chunk);
        }
    }

    /// Hand bytes of the head request to the transport.
    fn send(&mut self, data: Bytes) -> bool {
        let Some(transport) = self.transport.as_mut() else {
            return false;
        };
        match transport.write(&data) {
            Ok(accepted) => {
                if let Some(head) = self.queue.head_mut() {
                    head.mark_sent();
                }
                accepted
            }
            Err(err) => {
                self.fail(err);
                false
            }
        }
    }

    fn fail(&mut self, err: ConnError) {
        log::warn!("connection to {}:{} failed: {err}", self.options.host(), self.options.port());
        if let Err(inv) = self.machine.apply(Signal::Error) {
            conn_debug!("{inv}");
        }
        self.release();
        self.events.push_back(Event::Error(err));
    }

    /// Drop the transport (asking the host to close the socket) and return
    /// the parser to the pool.
    fn release(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.destroy();
            if let Some(bytes) = transport.take_outgoing() {
                self.actions.push_back(Action::Write(bytes));
            }
            self.actions.push_back(Action::Close);
            self.generation += 1;
        }
        if let Some(parser) = self.parser.take() {
            self.pool.free(parser);
        }
        self.in_flight = None;
    }

    fn rebind_parser(&mut self, parser: ResponseParser, generation: u64) {
        if generation == self.generation && self.transport.is_some() {
            self.parser = Some(parser);
        } else {
            self.pool.free(parser);
        }
    }
}

/// Routes parser callbacks into the client while the parser is checked out.
struct Incoming<'a>(&'a mut Client);

impl ParserHandler for Incoming<'_> {
    fn on_head(&mut self, head: ResponseHead) -> bool {
        self.0.on_response_head(head)
    }

    fn on_body(&mut self, chunk: Bytes) {
        if let Some(request) = self.0.in_flight {
            self.0.events.push_back(Event::Body { request, chunk });
        }
    }

    fn on_message_complete(&mut self) -> bool {
        self.0.on_message_complete()
    }
}
