//! The responder side of a session.
//!
//! Inbound requests are dispatched by method.  `list`, `invoke` and
//! `set` open an inbound stream whose context lives in a table keyed by
//! request id; the work itself runs on a scheduler worker against the
//! [`ValueTree`], and the reply is only sent while the context is still
//! open.  Closing a context, whether by the peer's `close`, by normal
//! completion or by disconnect, happens exactly once because only the
//! path that removes it from the table reports it to the tree.  Each
//! context carries a token that its worker holds on to, so a worker
//! that outlives its context can never touch a later stream that
//! happens to reuse the same request id.
//!
//! `subscribe` and `unsubscribe` are acknowledged at once and applied
//! to the [`subscriptions`] registry in the background.

pub(crate) mod subscriptions;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::{json, Value};
use tracing::{debug, trace, warn};

use crate::error::{ErrorType, LinkError};
use crate::protocol::{
    validate_path, Message, Method, Permission, Request, RequestId, Response, StreamState,
};
use crate::scheduler::Scheduler;
use crate::session::Outbound;
use crate::tree::ValueTree;

use subscriptions::SubscriptionRegistry;

/// An open inbound stream.
#[derive(Clone, Debug)]
struct InboundContext {
    token: u64,
    method: Method,
    path: String,
}

#[derive(Default)]
struct ResponderState {
    outbound: Option<Outbound>,
    inbound: HashMap<RequestId, InboundContext>,
    next_token: u64,
}

impl ResponderState {
    fn is_current(&self, rid: RequestId, token: u64) -> bool {
        self.inbound.get(&rid).is_some_and(|ctx| ctx.token == token)
    }
}

struct ResponderInner {
    scheduler: Scheduler,
    tree: Arc<dyn ValueTree>,
    state: Mutex<ResponderState>,
    registry: SubscriptionRegistry,
}

/// Serves a [`ValueTree`] to the peer.  Cloning is cheap; clones share
/// state.
#[derive(Clone)]
pub struct Responder {
    inner: Arc<ResponderInner>,
}

impl Responder {
    pub fn new(scheduler: Scheduler, tree: Arc<dyn ValueTree>) -> Self {
        Self {
            inner: Arc::new(ResponderInner {
                registry: SubscriptionRegistry::new(scheduler.clone(), tree.clone()),
                scheduler,
                tree,
                state: Mutex::new(ResponderState::default()),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ResponderState> {
        self.inner.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    pub fn on_connect(&self, outbound: Outbound) {
        self.inner.registry.on_connect(outbound.clone());
        self.state().outbound = Some(outbound);
        debug!("responder connected");
    }

    /// Close every inbound stream and subscription.  Everything is
    /// released before this returns.
    pub fn on_disconnect(&self) {
        let contexts: Vec<InboundContext> = {
            let mut state = self.state();
            state.outbound = None;
            state.inbound.drain().map(|(_, ctx)| ctx).collect()
        };
        for ctx in &contexts {
            self.inner.tree.stream_closed(&ctx.path, ctx.method);
        }
        let subscriptions = self.inner.registry.close_all();
        debug!(
            streams = contexts.len(),
            subscriptions,
            "responder disconnected"
        );
    }

    /// Dispatch one request from the peer.
    pub fn handle_request(&self, req: Request) {
        trace!(rid = req.rid, method = %req.method, path = ?req.path, "inbound request");
        match req.method {
            Method::Close => self.close_inbound(req.rid),
            Method::List | Method::Invoke | Method::Set => self.open_stream(req),
            Method::Subscribe => {
                self.inner.registry.subscribe(req.paths);
                self.send(Response::closed(req.rid));
            }
            Method::Unsubscribe => {
                self.inner.registry.unsubscribe(req.sids);
                self.send(Response::closed(req.rid));
            }
            Method::Remove => self.reject(
                req.rid,
                LinkError::not_implemented("remove is not supported by this responder"),
            ),
        }
    }

    /// Answer a request that could not be accepted.
    pub fn reject(&self, rid: RequestId, error: LinkError) {
        debug!(rid, error = %error, "rejecting request");
        self.send(Response::error(rid, error));
    }

    fn send(&self, response: Response) {
        let outbound = self.state().outbound.clone();
        match outbound {
            Some(outbound) => {
                if outbound.send(Message::Response(response)).is_err() {
                    debug!("response dropped; session is gone");
                }
            }
            None => debug!(rid = response.rid, "response dropped while disconnected"),
        }
    }

    fn close_inbound(&self, rid: RequestId) {
        let Some(ctx) = self.state().inbound.remove(&rid) else {
            trace!(rid, "close for a stream that is not open");
            return;
        };
        let tree = self.inner.tree.clone();
        self.inner
            .scheduler
            .run_async(move || tree.stream_closed(&ctx.path, ctx.method));
    }

    fn open_stream(&self, req: Request) {
        let rid = req.rid;
        let Some(path) = req.path.clone() else {
            self.reject(rid, LinkError::new(ErrorType::InvalidPath, "missing path"));
            return;
        };
        if let Err(err) = validate_path(&path) {
            self.reject(rid, err);
            return;
        }
        let token = {
            let mut state = self.state();
            if state.inbound.contains_key(&rid) {
                drop(state);
                self.reject(
                    rid,
                    LinkError::new(ErrorType::InvalidParameter, format!("request {rid} is already open")),
                );
                return;
            }
            state.next_token += 1;
            let token = state.next_token;
            state.inbound.insert(
                rid,
                InboundContext {
                    token,
                    method: req.method,
                    path: path.clone(),
                },
            );
            token
        };

        let this = self.clone();
        self.inner.scheduler.run_async(move || match req.method {
            Method::List => this.run_list(rid, token, &path),
            Method::Invoke => this.run_invoke(rid, token, &path, req.params),
            Method::Set => this.run_set(rid, token, &path, req.value, req.permit),
            other => warn!(rid, method = %other, "not a stream method"),
        });
    }

    fn run_list(&self, rid: RequestId, token: u64, path: &str) {
        match self.inner.tree.list_children(path) {
            Ok(rows) => {
                let updates = rows
                    .into_iter()
                    .map(|(name, meta)| json!([name, meta]))
                    .collect();
                self.send_open(token, Response::new(rid, StreamState::Open).with_updates(updates));
            }
            Err(err) => self.finish(token, Response::error(rid, err)),
        }
    }

    fn run_invoke(&self, rid: RequestId, token: u64, path: &str, params: Option<Value>) {
        let response = match self.inner.tree.invoke(path, params) {
            Ok(rows) => Response::closed(rid).with_updates(rows),
            Err(err) => Response::error(rid, err),
        };
        self.finish(token, response);
    }

    fn run_set(
        &self,
        rid: RequestId,
        token: u64,
        path: &str,
        value: Option<Value>,
        permit: Option<Permission>,
    ) {
        let response = match value {
            None => Response::error(rid, LinkError::new(ErrorType::InvalidValue, "set without a value")),
            Some(value) => match self
                .inner
                .tree
                .write_value(path, value, permit.unwrap_or(Permission::Write))
            {
                Ok(()) => Response::closed(rid),
                Err(err) => Response::error(rid, err),
            },
        };
        self.finish(token, response);
    }

    /// Send on a stream that stays open.  Dropped if the stream that
    /// issued `token` is no longer the one open under this rid.
    fn send_open(&self, token: u64, response: Response) {
        let state = self.state();
        if !state.is_current(response.rid, token) {
            trace!(rid = response.rid, "stream closed before reply");
            return;
        }
        if let Some(outbound) = &state.outbound {
            let _ = outbound.send(Message::Response(response));
        }
    }

    /// Send the closing response of a stream and release its context.
    fn finish(&self, token: u64, response: Response) {
        let ctx = {
            let mut state = self.state();
            if !state.is_current(response.rid, token) {
                trace!(rid = response.rid, "stream closed before reply");
                return;
            }
            let Some(ctx) = state.inbound.remove(&response.rid) else {
                return;
            };
            if let Some(outbound) = &state.outbound {
                let _ = outbound.send(Message::Response(response));
            }
            ctx
        };
        self.inner.tree.stream_closed(&ctx.path, ctx.method);
    }

    /// Number of inbound streams currently open.
    pub fn open_streams(&self) -> usize {
        self.state().inbound.len()
    }

    /// Number of live subscriptions in the registry.
    pub fn subscription_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Path currently bound to `sid`, if any.
    pub fn subscribed_path(&self, sid: crate::protocol::SubscriptionId) -> Option<String> {
        self.inner.registry.path_of(sid)
    }
}
