//! Responder-side subscription registry.
//!
//! The peer assigns subscription ids; the registry maps each sid to a
//! watch on the value tree.  Registry changes arrive as a queue of
//! operations applied in order by a single scheduled drain, so a
//! `subscribe` followed by an `unsubscribe` can never be applied the
//! other way round.
//!
//! Value changes are queued per sid and sent by one scheduled flush as
//! a single rid-0 response.  With qos 0 a sid keeps only its newest
//! queued value; higher levels queue every change.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::{debug, trace, warn};

use crate::protocol::{
    validate_path, Message, Response, StreamState, SubscribePath, SubscriptionId,
    SubscriptionUpdate, ValueUpdate, UPDATE_RID,
};
use crate::scheduler::Scheduler;
use crate::session::Outbound;
use crate::tree::{ValueTree, WatchGuard};

#[derive(Debug)]
enum RegistryOp {
    Subscribe(Vec<SubscribePath>),
    Unsubscribe(Vec<SubscriptionId>),
}

#[derive(Debug)]
struct Entry {
    path: String,
    qos: u8,
    last: Option<ValueUpdate>,
    /// Distinguishes this binding from earlier bindings of the same
    /// sid, whose watches may still fire briefly.
    token: u64,
    watch: Option<WatchGuard>,
}

#[derive(Default)]
struct RegistryState {
    outbound: Option<Outbound>,
    entries: HashMap<SubscriptionId, Entry>,
    ops: VecDeque<RegistryOp>,
    draining: bool,
    queued: VecDeque<(SubscriptionId, ValueUpdate)>,
    flush_scheduled: bool,
    next_token: u64,
}

struct Shared {
    scheduler: Scheduler,
    tree: Arc<dyn ValueTree>,
    state: Mutex<RegistryState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }
}

pub(crate) struct SubscriptionRegistry {
    shared: Arc<Shared>,
}

impl SubscriptionRegistry {
    pub fn new(scheduler: Scheduler, tree: Arc<dyn ValueTree>) -> Self {
        Self {
            shared: Arc::new(Shared {
                scheduler,
                tree,
                state: Mutex::new(RegistryState::default()),
            }),
        }
    }

    pub fn on_connect(&self, outbound: Outbound) {
        self.shared.lock().outbound = Some(outbound);
    }

    pub fn subscribe(&self, paths: Vec<SubscribePath>) {
        self.enqueue(RegistryOp::Subscribe(paths));
    }

    pub fn unsubscribe(&self, sids: Vec<SubscriptionId>) {
        self.enqueue(RegistryOp::Unsubscribe(sids));
    }

    fn enqueue(&self, op: RegistryOp) {
        let start = {
            let mut state = self.shared.lock();
            state.ops.push_back(op);
            !std::mem::replace(&mut state.draining, true)
        };
        if start {
            let shared = self.shared.clone();
            self.shared.scheduler.run_async(move || drain(&shared));
        }
    }

    /// Release every subscription and forget queued work.  Each watch
    /// is dropped exactly once, here, before this returns.
    pub fn close_all(&self) -> usize {
        let entries: Vec<Entry> = {
            let mut state = self.shared.lock();
            state.outbound = None;
            state.ops.clear();
            state.queued.clear();
            state.entries.drain().map(|(_, entry)| entry).collect()
        };
        let count = entries.len();
        drop(entries);
        count
    }

    pub fn len(&self) -> usize {
        self.shared.lock().entries.len()
    }

    pub fn path_of(&self, sid: SubscriptionId) -> Option<String> {
        self.shared.lock().entries.get(&sid).map(|e| e.path.clone())
    }
}

/// Apply queued operations until the queue is empty.
fn drain(shared: &Arc<Shared>) {
    loop {
        let op = {
            let mut state = shared.lock();
            match state.ops.pop_front() {
                Some(op) => op,
                None => {
                    state.draining = false;
                    return;
                }
            }
        };
        match op {
            RegistryOp::Subscribe(paths) => {
                for entry in paths {
                    bind(shared, entry);
                }
            }
            RegistryOp::Unsubscribe(sids) => release(shared, &sids),
        }
    }
}

/// Create or rebind one sid.  Rebinding replaces the entry without any
/// notification for the old path.
fn bind(shared: &Arc<Shared>, request: SubscribePath) {
    let SubscribePath { path, sid, qos } = request;
    if let Err(err) = validate_path(&path) {
        warn!(sid, path = %path, error = %err, "skipping subscription with invalid path");
        return;
    }

    let (token, replaced) = {
        let mut state = shared.lock();
        if state.outbound.is_none() {
            return;
        }
        state.next_token += 1;
        let token = state.next_token;
        let replaced = state.entries.insert(
            sid,
            Entry {
                path: path.clone(),
                qos,
                last: None,
                token,
                watch: None,
            },
        );
        if replaced.is_some() {
            state.queued.retain(|(queued_sid, _)| *queued_sid != sid);
        }
        (token, replaced)
    };
    if let Some(old) = replaced {
        debug!(sid, from = %old.path, to = %path, "rebinding subscription");
    }

    let weak = Arc::downgrade(shared);
    let listener = Arc::new(move |update: ValueUpdate| on_change(&weak, sid, token, update));
    let watch = match shared.tree.subscribe_value(&path, listener) {
        Ok(watch) => watch,
        Err(err) => {
            warn!(sid, path = %path, error = %err, "value tree refused subscription");
            let mut state = shared.lock();
            if state.entries.get(&sid).is_some_and(|e| e.token == token) {
                state.entries.remove(&sid);
            }
            return;
        }
    };
    let initial = match shared.tree.read_value(&path) {
        Ok(value) => value,
        Err(err) => {
            debug!(sid, path = %path, error = %err, "no initial value");
            None
        }
    };

    let mut state = shared.lock();
    let Some(entry) = state.entries.get_mut(&sid).filter(|e| e.token == token) else {
        drop(state);
        drop(watch);
        return;
    };
    entry.watch = Some(watch);
    // A change observed by the watch is newer than the initial read.
    if entry.last.is_none() {
        if let Some(update) = initial {
            entry.last = Some(update.clone());
            queue(shared, &mut state, sid, qos, update);
        }
    }
    trace!(sid, path = %path, qos, "subscription bound");
}

fn release(shared: &Arc<Shared>, sids: &[SubscriptionId]) {
    let removed: Vec<Entry> = {
        let mut state = shared.lock();
        state.queued.retain(|(sid, _)| !sids.contains(sid));
        sids.iter().filter_map(|sid| state.entries.remove(sid)).collect()
    };
    for entry in &removed {
        trace!(path = %entry.path, "subscription released");
    }
}

fn on_change(weak: &Weak<Shared>, sid: SubscriptionId, token: u64, update: ValueUpdate) {
    let Some(shared) = weak.upgrade() else {
        return;
    };
    let mut state = shared.lock();
    let Some(entry) = state.entries.get_mut(&sid).filter(|e| e.token == token) else {
        return;
    };
    entry.last = Some(update.clone());
    let qos = entry.qos;
    queue(&shared, &mut state, sid, qos, update);
}

fn queue(
    shared: &Arc<Shared>,
    state: &mut RegistryState,
    sid: SubscriptionId,
    qos: u8,
    update: ValueUpdate,
) {
    let slot = if qos == 0 {
        state.queued.iter_mut().find(|(queued, _)| *queued == sid)
    } else {
        None
    };
    match slot {
        Some((_, pending)) => *pending = update,
        None => state.queued.push_back((sid, update)),
    }
    if !std::mem::replace(&mut state.flush_scheduled, true) {
        let task_shared = shared.clone();
        shared.scheduler.run_async(move || flush(&task_shared));
    }
}

/// Send everything queued as one rid-0 response.  Sending happens
/// under the registry lock so batches leave in queue order.
fn flush(shared: &Arc<Shared>) {
    let mut state = shared.lock();
    state.flush_scheduled = false;
    if state.queued.is_empty() {
        return;
    }
    let batch: Vec<_> = state.queued.drain(..).collect();
    let Some(outbound) = state.outbound.as_ref() else {
        return;
    };
    let updates = batch
        .into_iter()
        .filter_map(|(sid, update)| serde_json::to_value(SubscriptionUpdate { sid, update }).ok())
        .collect::<Vec<_>>();
    trace!(count = updates.len(), "flushing subscription updates");
    let response = Response::new(UPDATE_RID, StreamState::Open).with_updates(updates);
    if outbound.send(Message::Response(response)).is_err() {
        debug!("dropping subscription updates; session is gone");
    }
}
