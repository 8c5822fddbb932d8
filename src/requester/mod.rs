//! The requester side of a session.
//!
//! A [`Requester`] issues `list`, `invoke`, `set` and `remove` requests,
//! correlates the responses by request id and hands them to the
//! caller's [`ResponseHandler`].  Subscriptions go through a separate
//! table (see [`subscriptions`]) that batches requests and routes the
//! values arriving on request id 0.
//!
//! The requester outlives connections.  It is bound to the session
//! writer in [`Requester::on_connect`] and unbound in
//! [`Requester::on_disconnect`], which closes every open stream and
//! subscription.  Requests made while unbound fail with
//! [`SessionError::NotConnected`].

pub mod stub;
pub mod subscriptions;

use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::error::{ErrorType, LinkError, SessionError};
use crate::protocol::{
    validate_path, Message, Method, Permission, Request, RequestId, Response, SubscriptionId,
    ValueUpdate, UPDATE_RID,
};
use crate::scheduler::Scheduler;
use crate::session::Outbound;

pub use stub::{PendingTable, ResponseHandler, Stub};
pub use subscriptions::SubscriptionHandler;
use subscriptions::{parse_update, SubscriptionTable};

#[derive(Default)]
struct RequesterState {
    outbound: Option<Outbound>,
    table: PendingTable,
}

struct RequesterInner {
    scheduler: Scheduler,
    state: Mutex<RequesterState>,
    subscriptions: Mutex<SubscriptionTable>,
}

/// Outbound half of a session.  Cloning is cheap; clones share state.
#[derive(Clone)]
pub struct Requester {
    inner: Arc<RequesterInner>,
}

/// An open outbound stream.
#[derive(Clone)]
pub struct RequestHandle {
    rid: RequestId,
    requester: Requester,
}

impl RequestHandle {
    pub fn rid(&self) -> RequestId {
        self.rid
    }

    /// Close the stream from our side.  Returns `false` if it had
    /// already closed.
    pub fn close(&self) -> bool {
        self.requester.close(self.rid)
    }
}

impl std::fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandle").field("rid", &self.rid).finish()
    }
}

impl Requester {
    pub fn new(scheduler: Scheduler) -> Self {
        Self {
            inner: Arc::new(RequesterInner {
                scheduler,
                state: Mutex::new(RequesterState::default()),
                subscriptions: Mutex::new(SubscriptionTable::new()),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, RequesterState> {
        self.inner.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn subscriptions(&self) -> MutexGuard<'_, SubscriptionTable> {
        self.inner
            .subscriptions
            .lock()
            .unwrap_or_else(|err| err.into_inner())
    }

    /// Bind to a freshly connected session.
    pub fn on_connect(&self, outbound: Outbound) {
        self.state().outbound = Some(outbound);
        self.subscriptions().open();
        debug!("requester connected");
    }

    /// Unbind from the session and close everything that was open.
    /// Each stream and subscription handler sees exactly one close.
    pub fn on_disconnect(&self) {
        let stubs = {
            let mut state = self.state();
            state.outbound = None;
            state.table.drain()
        };
        let subscriptions = self.subscriptions().drain();
        debug!(
            streams = stubs.len(),
            subscriptions = subscriptions.len(),
            "requester disconnected"
        );

        let error = LinkError::new(ErrorType::Disconnected, "connection lost");
        for stub in stubs {
            stub.handler.handle_error(&error);
            stub.handler.handle_close();
        }
        for (sid, handler) in subscriptions {
            handler.handle_close(sid);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state().outbound.is_some()
    }

    /// List the children of `path`.  The responder answers with one
    /// snapshot and leaves the stream open until either side closes
    /// it; later changes to the children are not streamed.
    pub fn list(
        &self,
        path: &str,
        handler: Arc<dyn ResponseHandler>,
    ) -> Result<RequestHandle, SessionError> {
        self.send_request(Request::new(0, Method::List).with_path(path), handler)
    }

    pub fn invoke(
        &self,
        path: &str,
        params: Option<Value>,
        handler: Arc<dyn ResponseHandler>,
    ) -> Result<RequestHandle, SessionError> {
        let mut req = Request::new(0, Method::Invoke).with_path(path);
        req.params = params;
        self.send_request(req, handler)
    }

    /// Write `value` to `path`.  Failures are only logged; use
    /// [`Requester::set_with_handler`] to observe the outcome.
    pub fn set(
        &self,
        path: &str,
        value: Value,
        permit: Permission,
    ) -> Result<RequestHandle, SessionError> {
        let handler = Arc::new(SetOutcome {
            path: path.to_string(),
        });
        self.set_with_handler(path, value, permit, handler)
    }

    pub fn set_with_handler(
        &self,
        path: &str,
        value: Value,
        permit: Permission,
        handler: Arc<dyn ResponseHandler>,
    ) -> Result<RequestHandle, SessionError> {
        let mut req = Request::new(0, Method::Set).with_path(path);
        req.value = Some(value);
        req.permit = Some(permit);
        self.send_request(req, handler)
    }

    pub fn remove(
        &self,
        path: &str,
        handler: Arc<dyn ResponseHandler>,
    ) -> Result<RequestHandle, SessionError> {
        self.send_request(Request::new(0, Method::Remove).with_path(path), handler)
    }

    /// Allocate a request id, register the stub and queue the request.
    /// The id is assigned under the same lock that disconnect takes, so
    /// a stub is either drained by disconnect or never registered.
    fn send_request(
        &self,
        mut req: Request,
        handler: Arc<dyn ResponseHandler>,
    ) -> Result<RequestHandle, SessionError> {
        let mut state = self.state();
        let outbound = state.outbound.clone().ok_or(SessionError::NotConnected)?;
        let rid = state.table.allocate();
        req.rid = rid;
        state.table.insert(Stub {
            rid,
            method: req.method,
            path: req.path.clone(),
            handler,
        });
        trace!(rid, method = %req.method, path = ?req.path, "sending request");
        if let Err(err) = outbound.send(Message::Request(req)) {
            state.table.remove(rid);
            return Err(err);
        }
        Ok(RequestHandle {
            rid,
            requester: self.clone(),
        })
    }

    /// Close an open stream locally: deregister it, tell the peer and
    /// fire `handle_close`.  Returns `false` if it was not open.
    pub fn close(&self, rid: RequestId) -> bool {
        let (stub, outbound) = {
            let mut state = self.state();
            (state.table.remove(rid), state.outbound.clone())
        };
        let Some(stub) = stub else {
            return false;
        };
        if let Some(outbound) = outbound {
            let _ = outbound.send(Message::Request(Request::close(rid)));
        }
        stub.handler.handle_close();
        true
    }

    /// Route a response from the peer to its stream.
    pub fn handle_response(&self, response: Response) {
        if response.rid == UPDATE_RID {
            self.handle_updates(&response);
            return;
        }
        let closing = response.is_closing();
        let (handler, outbound) = {
            let mut state = self.state();
            let handler = if closing {
                state.table.remove(response.rid).map(|stub| stub.handler)
            } else {
                state.table.get(response.rid).map(|stub| stub.handler.clone())
            };
            (handler, state.outbound.clone())
        };

        let Some(handler) = handler else {
            if !closing {
                debug!(rid = response.rid, "response for unknown stream; closing it");
                if let Some(outbound) = outbound {
                    let _ = outbound.send(Message::Request(Request::close(response.rid)));
                }
            }
            return;
        };

        if let Some(error) = &response.error {
            handler.handle_error(error);
            handler.handle_close();
            return;
        }
        handler.handle_response(&response);
        if closing {
            handler.handle_close();
        }
    }

    /// Subscribe to `path`.  Subscriptions requested in the same
    /// scheduler tick are sent together.
    ///
    /// The connected check and the insert happen under the table lock
    /// that disconnect drains, so a subscription is either closed by
    /// that disconnect or refused.
    pub fn subscribe(
        &self,
        path: &str,
        qos: u8,
        handler: Arc<dyn SubscriptionHandler>,
    ) -> Result<SubscriptionId, SessionError> {
        if let Err(err) = validate_path(path) {
            warn!(path, error = %err, "subscribing to an invalid path");
        }
        let (sid, schedule) = {
            let mut table = self.subscriptions();
            if !table.is_open() {
                return Err(SessionError::NotConnected);
            }
            table.add(path.to_string(), qos, handler)
        };
        if schedule {
            self.schedule_flush();
        }
        Ok(sid)
    }

    /// End a subscription.  Its handler sees `handle_close` once, and
    /// no updates after this returns.  Returns `false` for an unknown
    /// sid.
    pub fn unsubscribe(&self, sid: SubscriptionId) -> bool {
        let Some((handler, schedule)) = self.subscriptions().remove(sid) else {
            return false;
        };
        if schedule {
            self.schedule_flush();
        }
        handler.handle_close(sid);
        true
    }

    fn schedule_flush(&self) {
        let this = self.clone();
        self.inner
            .scheduler
            .run_async(move || this.flush_subscriptions());
    }

    /// Send the queued subscribe and unsubscribe batches.  The batch is
    /// queued while the table is locked so later batches can never
    /// overtake it.
    fn flush_subscriptions(&self) {
        let mut table = self.subscriptions();
        let batch = table.take_batch();
        if batch.is_empty() {
            return;
        }
        debug!(
            subscribe = batch.subscribe.len(),
            unsubscribe = batch.unsubscribe.len(),
            "flushing subscriptions"
        );
        if !batch.subscribe.is_empty() {
            let mut req = Request::new(0, Method::Subscribe);
            req.paths = batch.subscribe;
            if let Err(err) = self.send_request(req, Arc::new(BatchOutcome(Method::Subscribe))) {
                debug!(error = %err, "subscribe batch dropped");
            }
        }
        if !batch.unsubscribe.is_empty() {
            let mut req = Request::new(0, Method::Unsubscribe);
            req.sids = batch.unsubscribe;
            if let Err(err) = self.send_request(req, Arc::new(BatchOutcome(Method::Unsubscribe))) {
                debug!(error = %err, "unsubscribe batch dropped");
            }
        }
        drop(table);
    }

    /// Dispatch the values of a rid-0 response.  Runs on the session
    /// reader, so updates for one sid reach its handler in order.
    fn handle_updates(&self, response: &Response) {
        for raw in &response.updates {
            let Some(update) = parse_update(raw) else {
                continue;
            };
            let handler = self.subscriptions().record(&update);
            match handler {
                Some(handler) => handler.handle_update(update.sid, &update.update),
                None => trace!(sid = update.sid, "update for unknown subscription"),
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.state().table.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions().len()
    }

    /// Most recent value received for `sid`.
    pub fn last_update(&self, sid: SubscriptionId) -> Option<ValueUpdate> {
        self.subscriptions().last(sid)
    }
}

/// Handler for fire-and-forget `set` requests.
struct SetOutcome {
    path: String,
}

impl ResponseHandler for SetOutcome {
    fn handle_response(&self, _response: &Response) {
        trace!(path = %self.path, "set acknowledged");
    }

    fn handle_error(&self, error: &LinkError) {
        warn!(path = %self.path, error = %error, "set failed");
    }
}

/// Handler for the subscription batches.
struct BatchOutcome(Method);

impl ResponseHandler for BatchOutcome {
    fn handle_response(&self, _response: &Response) {}

    fn handle_error(&self, error: &LinkError) {
        warn!(method = %self.0, error = %error, "subscription batch rejected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerSection;
    use crate::protocol::{StreamState, SubscriptionUpdate};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct Counts {
        responses: AtomicUsize,
        errors: AtomicUsize,
        closes: AtomicUsize,
        last_error: Mutex<Option<LinkError>>,
    }

    impl ResponseHandler for Counts {
        fn handle_response(&self, _response: &Response) {
            self.responses.fetch_add(1, Ordering::SeqCst);
        }

        fn handle_error(&self, error: &LinkError) {
            self.errors.fetch_add(1, Ordering::SeqCst);
            *self.last_error.lock().unwrap() = Some(error.clone());
        }

        fn handle_close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct Values {
        seen: Mutex<Vec<Value>>,
        closes: AtomicUsize,
    }

    impl SubscriptionHandler for Values {
        fn handle_update(&self, _sid: SubscriptionId, update: &ValueUpdate) {
            self.seen.lock().unwrap().push(update.value.clone());
        }

        fn handle_close(&self, _sid: SubscriptionId) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn connected() -> (Requester, mpsc::UnboundedReceiver<Message>) {
        let requester = Requester::new(Scheduler::new(&SchedulerSection { max_workers: 2 }));
        let (tx, rx) = mpsc::unbounded_channel();
        requester.on_connect(Outbound::new(tx));
        (requester, rx)
    }

    fn sent_request(rx: &mut mpsc::UnboundedReceiver<Message>) -> Request {
        match rx.try_recv().unwrap() {
            Message::Request(req) => req,
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn error_response_closes_once() {
        let (requester, mut rx) = connected();
        let handler = Arc::new(Counts::default());
        let handle = requester.invoke("/missing", None, handler.clone()).unwrap();
        let req = sent_request(&mut rx);
        assert_eq!(req.rid, handle.rid());

        let err = LinkError::invalid_path("/missing");
        requester.handle_response(Response::error(req.rid, err.clone()));
        requester.handle_response(Response::error(req.rid, err.clone()));
        requester.on_disconnect();

        assert_eq!(handler.errors.load(Ordering::SeqCst), 1);
        assert_eq!(handler.closes.load(Ordering::SeqCst), 1);
        assert_eq!(handler.responses.load(Ordering::SeqCst), 0);
        assert_eq!(handler.last_error.lock().unwrap().as_ref(), Some(&err));
        assert_eq!(requester.pending_count(), 0);
    }

    #[tokio::test]
    async fn open_stream_survives_until_closed() {
        let (requester, mut rx) = connected();
        let handler = Arc::new(Counts::default());
        let handle = requester.list("/", handler.clone()).unwrap();
        sent_request(&mut rx);

        requester.handle_response(Response::new(handle.rid(), StreamState::Open));
        requester.handle_response(Response::new(handle.rid(), StreamState::Open));
        assert_eq!(requester.pending_count(), 1);

        assert!(handle.close());
        assert!(!handle.close());
        let close = sent_request(&mut rx);
        assert_eq!(close.method, Method::Close);
        assert_eq!(close.rid, handle.rid());
        assert_eq!(handler.responses.load(Ordering::SeqCst), 2);
        assert_eq!(handler.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stray_open_response_is_closed() {
        let (requester, mut rx) = connected();
        requester.handle_response(Response::new(77, StreamState::Open));
        let close = sent_request(&mut rx);
        assert_eq!((close.method, close.rid), (Method::Close, 77));

        requester.handle_response(Response::closed(78));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn requests_fail_when_disconnected() {
        let requester = Requester::new(Scheduler::new(&SchedulerSection::default()));
        let err = requester
            .list("/", Arc::new(Counts::default()))
            .unwrap_err();
        assert!(matches!(err, SessionError::NotConnected));
        assert!(matches!(
            requester.subscribe("/a", 0, Arc::new(Values::default())),
            Err(SessionError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn disconnect_closes_every_stream_and_subscription() {
        let (requester, _rx) = connected();
        let list = Arc::new(Counts::default());
        let invoke = Arc::new(Counts::default());
        let values = Arc::new(Values::default());
        requester.list("/", list.clone()).unwrap();
        requester.invoke("/act", Some(json!({})), invoke.clone()).unwrap();
        requester.subscribe("/a", 0, values.clone()).unwrap();

        requester.on_disconnect();
        requester.on_disconnect();

        for h in [&list, &invoke] {
            assert_eq!(h.closes.load(Ordering::SeqCst), 1);
            assert_eq!(h.errors.load(Ordering::SeqCst), 1);
        }
        assert_eq!(values.closes.load(Ordering::SeqCst), 1);
        assert_eq!(requester.pending_count(), 0);
        assert_eq!(requester.subscription_count(), 0);
        assert!(!requester.is_connected());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn subscribe_racing_disconnect_is_closed_or_refused() {
        let requester = Requester::new(Scheduler::new(&SchedulerSection { max_workers: 2 }));
        for _ in 0..50 {
            let (tx, _rx) = mpsc::unbounded_channel();
            requester.on_connect(Outbound::new(tx));

            let subscriber = requester.clone();
            let runtime = tokio::runtime::Handle::current();
            let worker = std::thread::spawn(move || {
                let _entered = runtime.enter();
                let mut accepted = Vec::new();
                loop {
                    let values = Arc::new(Values::default());
                    match subscriber.subscribe("/a", 0, values.clone()) {
                        Ok(_) => accepted.push(values),
                        Err(_) => return accepted,
                    }
                }
            });
            std::thread::sleep(Duration::from_micros(200));
            requester.on_disconnect();

            let accepted = worker.join().unwrap();
            for values in &accepted {
                assert_eq!(values.closes.load(Ordering::SeqCst), 1);
            }
            assert_eq!(requester.subscription_count(), 0);
        }
    }

    #[tokio::test]
    async fn subscriptions_batch_and_route_updates() {
        let (requester, mut rx) = connected();
        let a = Arc::new(Values::default());
        let b = Arc::new(Values::default());
        let sid_a = requester.subscribe("/a", 0, a.clone()).unwrap();
        let sid_b = requester.subscribe("/b", 1, b.clone()).unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let Message::Request(req) = msg else {
            panic!("expected subscribe request");
        };
        assert_eq!(req.method, Method::Subscribe);
        let sids: Vec<_> = req.paths.iter().map(|p| p.sid).collect();
        assert_eq!(sids, vec![sid_a, sid_b]);

        let update = |sid, v| {
            serde_json::to_value(SubscriptionUpdate {
                sid,
                update: ValueUpdate::now(v),
            })
            .unwrap()
        };
        requester.handle_response(
            Response::new(UPDATE_RID, StreamState::Open)
                .with_updates(vec![update(sid_a, json!(1)), update(sid_b, json!("x")), update(sid_a, json!(2))]),
        );
        assert_eq!(*a.seen.lock().unwrap(), vec![json!(1), json!(2)]);
        assert_eq!(*b.seen.lock().unwrap(), vec![json!("x")]);
        assert_eq!(requester.last_update(sid_a).unwrap().value, json!(2));

        assert!(requester.unsubscribe(sid_a));
        assert!(!requester.unsubscribe(sid_a));
        requester.handle_response(
            Response::new(UPDATE_RID, StreamState::Open).with_updates(vec![update(sid_a, json!(3))]),
        );
        assert_eq!(a.seen.lock().unwrap().len(), 2);
        assert_eq!(a.closes.load(Ordering::SeqCst), 1);

        let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let Message::Request(req) = msg else {
            panic!("expected unsubscribe request");
        };
        assert_eq!(req.method, Method::Unsubscribe);
        assert_eq!(req.sids, vec![sid_a]);
    }
}
