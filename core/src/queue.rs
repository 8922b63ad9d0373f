//! Request handles and the FIFO that decides whose turn it is to write.
//!
//! # Design
//! The queue is appended at the tail and drained from the head, never
//! reordered. Only the head may reach the transport; every other request
//! accumulates its writes in a private pending buffer until it becomes the
//! head. `buffer` is the single operation that touches a non-head entry and it
//! only ever appends to that buffer.

use std::collections::VecDeque;
use std::fmt;

use bytes::Bytes;
use uuid::Uuid;

use crate::http::{HttpMethod, HttpRequest};

/// Identity of a request for the lifetime of its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A request queued on a connection.
#[derive(Debug)]
pub struct RequestHandle {
    id: RequestId,
    request: HttpRequest,
    should_keep_alive: bool,
    data_sent: bool,
    pending: Vec<Bytes>,
}

impl RequestHandle {
    pub fn new(request: HttpRequest) -> Self {
        Self {
            id: RequestId::new(),
            should_keep_alive: request.keep_alive(),
            request,
            data_sent: false,
            pending: Vec::new(),
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn method(&self) -> &HttpMethod {
        &self.request.method
    }

    pub fn url(&self) -> &str {
        &self.request.url
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.request.headers
    }

    pub fn should_keep_alive(&self) -> bool {
        self.should_keep_alive
    }

    /// True once any byte of this request reached the transport.
    pub fn data_sent(&self) -> bool {
        self.data_sent
    }

    /// Bytes waiting for this request to become the queue head.
    pub fn pending_len(&self) -> usize {
        self.pending.iter().map(Bytes::len).sum()
    }

    pub(crate) fn disable_keep_alive(&mut self) {
        self.should_keep_alive = false;
    }

    pub(crate) fn mark_sent(&mut self) {
        self.data_sent = true;
    }

    pub(crate) fn push_pending(&mut self, data: Bytes) {
        if !data.is_empty() {
            self.pending.push(data);
        }
    }

    pub(crate) fn take_pending(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.pending)
    }
}

#[derive(Debug, Default)]
pub struct RequestQueue {
    entries: VecDeque<RequestHandle>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, request: RequestHandle) {
        self.entries.push_back(request);
    }

    pub fn peek_head(&self) -> Option<&RequestHandle> {
        self.entries.front()
    }

    pub fn head_mut(&mut self) -> Option<&mut RequestHandle> {
        self.entries.front_mut()
    }

    pub fn pop_head(&mut self) -> Option<RequestHandle> {
        self.entries.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_head(&self, id: RequestId) -> bool {
        self.peek_head().is_some_and(|r| r.id == id)
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.entries.iter().any(|r| r.id == id)
    }

    /// Append `data` to the pending buffer of request `id`. Returns `false`
    /// when no such request is queued.
    pub fn buffer(&mut self, id: RequestId, data: Bytes) -> bool {
        match self.entries.iter_mut().find(|r| r.id == id) {
            Some(request) => {
                request.push_pending(data);
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
