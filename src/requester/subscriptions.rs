//! Requester-side subscriptions.
//!
//! Subscribing does not open a stream of its own.  Calls to
//! `subscribe` and `unsubscribe` are recorded here and flushed by one
//! scheduled task, so everything requested within a scheduler tick
//! leaves as a single `subscribe` request and a single `unsubscribe`
//! request.  Values come back on request id 0 and are routed to
//! handlers by subscription id.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::warn;

use crate::protocol::{SubscribePath, SubscriptionId, SubscriptionUpdate, ValueStatus, ValueUpdate};

/// Receives the values of one subscription.
pub trait SubscriptionHandler: Send + Sync {
    fn handle_update(&self, sid: SubscriptionId, update: &ValueUpdate);

    /// The subscription ended, by `unsubscribe` or by disconnect.
    /// Called exactly once.
    fn handle_close(&self, _sid: SubscriptionId) {}
}

pub(crate) struct Subscription {
    pub path: String,
    pub qos: u8,
    pub handler: Arc<dyn SubscriptionHandler>,
    pub last: Option<ValueUpdate>,
    /// Whether the peer has been told about this sid.
    pub sent: bool,
}

/// What one flush has to send.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct Batch {
    pub subscribe: Vec<SubscribePath>,
    pub unsubscribe: Vec<SubscriptionId>,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.subscribe.is_empty() && self.unsubscribe.is_empty()
    }
}

#[derive(Default)]
pub(crate) struct SubscriptionTable {
    next_sid: SubscriptionId,
    entries: HashMap<SubscriptionId, Subscription>,
    to_subscribe: Vec<SubscriptionId>,
    to_unsubscribe: Vec<SubscriptionId>,
    flush_scheduled: bool,
    /// Set while a session is bound; cleared by [`Self::drain`].
    open: bool,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self {
            next_sid: 1,
            ..Self::default()
        }
    }

    pub fn open(&mut self) {
        self.open = true;
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    fn allocate(&mut self) -> SubscriptionId {
        loop {
            let sid = self.next_sid;
            self.next_sid = self.next_sid.wrapping_add(1).max(1);
            if sid != 0 && !self.entries.contains_key(&sid) {
                return sid;
            }
        }
    }

    /// Register a subscription.  Returns its sid and whether the
    /// caller must schedule a flush.
    pub fn add(&mut self, path: String, qos: u8, handler: Arc<dyn SubscriptionHandler>) -> (SubscriptionId, bool) {
        let sid = self.allocate();
        self.entries.insert(
            sid,
            Subscription {
                path,
                qos,
                handler,
                last: None,
                sent: false,
            },
        );
        self.to_subscribe.push(sid);
        (sid, self.request_flush())
    }

    /// Drop a subscription.  Returns its handler, for the close
    /// callback, and whether a flush must be scheduled.  A sid the
    /// peer never heard of is simply forgotten.
    pub fn remove(&mut self, sid: SubscriptionId) -> Option<(Arc<dyn SubscriptionHandler>, bool)> {
        let entry = self.entries.remove(&sid)?;
        if entry.sent {
            self.to_unsubscribe.push(sid);
            Some((entry.handler, self.request_flush()))
        } else {
            self.to_subscribe.retain(|s| *s != sid);
            Some((entry.handler, false))
        }
    }

    fn request_flush(&mut self) -> bool {
        !std::mem::replace(&mut self.flush_scheduled, true)
    }

    /// Collect everything queued since the last flush.
    pub fn take_batch(&mut self) -> Batch {
        self.flush_scheduled = false;
        let mut batch = Batch::default();
        for sid in std::mem::take(&mut self.to_subscribe) {
            if let Some(entry) = self.entries.get_mut(&sid) {
                entry.sent = true;
                batch.subscribe.push(SubscribePath {
                    path: entry.path.clone(),
                    sid,
                    qos: entry.qos,
                });
            }
        }
        batch.unsubscribe = std::mem::take(&mut self.to_unsubscribe);
        batch
    }

    /// Record an update and return the handler that should see it.
    pub fn record(&mut self, update: &SubscriptionUpdate) -> Option<Arc<dyn SubscriptionHandler>> {
        let entry = self.entries.get_mut(&update.sid)?;
        entry.last = Some(update.update.clone());
        Some(entry.handler.clone())
    }

    pub fn last(&self, sid: SubscriptionId) -> Option<ValueUpdate> {
        self.entries.get(&sid).and_then(|e| e.last.clone())
    }

    /// Forget every subscription, returning them for close callbacks.
    /// The table stays closed until [`Self::open`] is called again.
    pub fn drain(&mut self) -> Vec<(SubscriptionId, Arc<dyn SubscriptionHandler>)> {
        self.open = false;
        self.to_subscribe.clear();
        self.to_unsubscribe.clear();
        let mut all: Vec<_> = self
            .entries
            .drain()
            .map(|(sid, entry)| (sid, entry.handler))
            .collect();
        all.sort_by_key(|(sid, _)| *sid);
        all
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Parse one entry of a rid-0 `updates` array.  Both the object form
/// `{"sid", "value", "ts", "status"}` and the positional form
/// `[sid, value, ts]` are accepted.
pub(crate) fn parse_update(raw: &Value) -> Option<SubscriptionUpdate> {
    match raw {
        Value::Object(_) => match serde_json::from_value::<SubscriptionUpdate>(raw.clone()) {
            Ok(update) => Some(update),
            Err(err) => {
                warn!(error = %err, "ignoring malformed subscription update");
                None
            }
        },
        Value::Array(items) => {
            let sid = items.first()?.as_u64().and_then(|s| u32::try_from(s).ok())?;
            let value = items.get(1).cloned().unwrap_or(Value::Null);
            let ts = items
                .get(2)
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<DateTime<Utc>>().ok())
                .unwrap_or_else(Utc::now);
            Some(SubscriptionUpdate {
                sid,
                update: ValueUpdate {
                    value,
                    status: ValueStatus::Ok,
                    ts,
                },
            })
        }
        _ => {
            warn!("ignoring subscription update that is neither object nor array");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Sink;

    impl SubscriptionHandler for Sink {
        fn handle_update(&self, _sid: SubscriptionId, _update: &ValueUpdate) {}
    }

    #[test]
    fn calls_in_one_tick_share_a_batch() {
        let mut table = SubscriptionTable::new();
        let (a, first) = table.add("/a".into(), 0, Arc::new(Sink));
        let (b, second) = table.add("/b".into(), 1, Arc::new(Sink));
        assert!(first);
        assert!(!second);

        let batch = table.take_batch();
        assert_eq!(batch.subscribe.len(), 2);
        assert_eq!(batch.subscribe[0].sid, a);
        assert_eq!(batch.subscribe[1].qos, 1);
        assert!(batch.unsubscribe.is_empty());

        let (_, flush) = table.remove(b).unwrap();
        assert!(flush);
        assert_eq!(table.take_batch().unsubscribe, vec![b]);
    }

    #[test]
    fn unsent_subscription_is_withdrawn_silently() {
        let mut table = SubscriptionTable::new();
        let (sid, _) = table.add("/a".into(), 0, Arc::new(Sink));
        let (_, flush) = table.remove(sid).unwrap();
        assert!(!flush);
        assert!(table.take_batch().is_empty());
        assert!(table.remove(sid).is_none());
    }

    #[test]
    fn drain_closes_the_table() {
        let mut table = SubscriptionTable::new();
        assert!(!table.is_open());
        table.open();
        table.add("/a".into(), 0, Arc::new(Sink));
        assert!(table.is_open());

        assert_eq!(table.drain().len(), 1);
        assert!(!table.is_open());
        assert_eq!(table.len(), 0);
        table.open();
        assert!(table.is_open());
    }

    #[test]
    fn parses_both_update_shapes() {
        let obj = parse_update(&json!({"sid": 3, "value": 42, "ts": "2024-01-01T00:00:00Z"})).unwrap();
        assert_eq!(obj.sid, 3);
        assert_eq!(obj.update.value, json!(42));

        let arr = parse_update(&json!([4, "on", "2024-01-01T00:00:00Z"])).unwrap();
        assert_eq!(arr.sid, 4);
        assert_eq!(arr.update.value, json!("on"));
        assert_eq!(arr.update.ts, obj.update.ts);

        assert!(parse_update(&json!("nope")).is_none());
    }
}
