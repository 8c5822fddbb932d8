//! Outbound stream bookkeeping.
//!
//! Every request the requester sends, except the subscription batches
//! which have their own manager, is represented by a [`Stub`] held in
//! the [`PendingTable`] until its stream closes.  Removing the stub
//! from the table is the single point where a stream is considered
//! closed: whichever path gets there first (close response, error,
//! local close or disconnect) owns the close notification.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::LinkError;
use crate::protocol::{Method, RequestId, Response};

/// Callbacks for one outbound stream.
///
/// Callbacks run on the session reader, in frame order.  They should
/// return quickly; longer work belongs on the scheduler.
pub trait ResponseHandler: Send + Sync {
    fn handle_response(&self, response: &Response);

    /// The stream ended with an error.  `handle_close` follows.
    fn handle_error(&self, _error: &LinkError) {}

    /// The stream is closed.  Called exactly once per stream.
    fn handle_close(&self) {}
}

/// State of one open outbound stream.
#[derive(Clone)]
pub struct Stub {
    pub rid: RequestId,
    pub method: Method,
    pub path: Option<String>,
    pub handler: Arc<dyn ResponseHandler>,
}

impl std::fmt::Debug for Stub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stub")
            .field("rid", &self.rid)
            .field("method", &self.method)
            .field("path", &self.path)
            .finish()
    }
}

/// Open stubs keyed by request id, plus the id allocator.
#[derive(Debug)]
pub struct PendingTable {
    next_rid: RequestId,
    stubs: HashMap<RequestId, Stub>,
}

impl Default for PendingTable {
    fn default() -> Self {
        Self {
            next_rid: 1,
            stubs: HashMap::new(),
        }
    }
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next request id not held by an open stub.  Zero is reserved for
    /// subscription updates and is never handed out.
    pub fn allocate(&mut self) -> RequestId {
        loop {
            let rid = self.next_rid;
            self.next_rid = self.next_rid.wrapping_add(1);
            if self.next_rid == 0 {
                self.next_rid = 1;
            }
            if rid != 0 && !self.stubs.contains_key(&rid) {
                return rid;
            }
        }
    }

    pub fn insert(&mut self, stub: Stub) {
        self.stubs.insert(stub.rid, stub);
    }

    pub fn get(&self, rid: RequestId) -> Option<&Stub> {
        self.stubs.get(&rid)
    }

    pub fn remove(&mut self, rid: RequestId) -> Option<Stub> {
        self.stubs.remove(&rid)
    }

    pub fn drain(&mut self) -> Vec<Stub> {
        let mut stubs: Vec<Stub> = self.stubs.drain().map(|(_, stub)| stub).collect();
        stubs.sort_by_key(|stub| stub.rid);
        stubs
    }

    pub fn len(&self) -> usize {
        self.stubs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stubs.is_empty()
    }
}
