//! The value tree a responder serves.
//!
//! Request paths resolve into a hierarchical store that lives outside
//! this crate.  The responder only needs the operations of
//! [`ValueTree`]; how nodes are stored, typed or secured is up to the
//! implementation.  [`MemoryTree`] is a small flat implementation used
//! by tests and by embedders that only need a handful of values.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tracing::debug;

use crate::error::{ErrorType, LinkError};
use crate::protocol::{Method, Permission, ValueUpdate};

/// Callback invoked with every change of a watched value.
pub type ValueListener = Arc<dyn Fn(ValueUpdate) + Send + Sync>;

/// Cancels a value watch when dropped.
pub struct WatchGuard {
    on_drop: Option<Box<dyn FnOnce() + Send>>,
}

impl WatchGuard {
    pub fn new<F>(on_drop: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            on_drop: Some(Box::new(on_drop)),
        }
    }

    /// A guard with nothing to release.
    pub fn noop() -> Self {
        Self { on_drop: None }
    }
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        if let Some(release) = self.on_drop.take() {
            release();
        }
    }
}

impl fmt::Debug for WatchGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchGuard")
            .field("armed", &self.on_drop.is_some())
            .finish()
    }
}

/// Operations the responder performs against the hierarchical store.
///
/// Calls are made from scheduler workers and may block.
pub trait ValueTree: Send + Sync {
    /// Children of `path` as `(name, metadata)` rows.
    fn list_children(&self, path: &str) -> Result<Vec<(String, Value)>, LinkError>;

    /// Current value of `path`, if it has one.
    fn read_value(&self, path: &str) -> Result<Option<ValueUpdate>, LinkError>;

    fn write_value(&self, path: &str, value: Value, permit: Permission) -> Result<(), LinkError>;

    /// Run the action at `path` and return its result rows.
    fn invoke(&self, path: &str, params: Option<Value>) -> Result<Vec<Value>, LinkError>;

    /// Call `listener` on every later change of `path`.  The current
    /// value is not replayed.  Dropping the guard ends the watch.
    fn subscribe_value(&self, path: &str, listener: ValueListener) -> Result<WatchGuard, LinkError>;

    /// A list, invoke or set stream on `path` has been closed.
    fn stream_closed(&self, _path: &str, _method: Method) {}
}

/// Action body registered with [`MemoryTree::add_action`].
pub type Action = Arc<dyn Fn(Option<Value>) -> Result<Vec<Value>, LinkError> + Send + Sync>;

type Watchers = HashMap<String, HashMap<u64, ValueListener>>;

/// A flat in-memory [`ValueTree`].  Intermediate nodes exist
/// implicitly as prefixes of stored paths.
#[derive(Default)]
pub struct MemoryTree {
    values: Mutex<BTreeMap<String, ValueUpdate>>,
    actions: Mutex<HashMap<String, Action>>,
    watchers: Arc<Mutex<Watchers>>,
    next_watch: AtomicU64,
    closed: Mutex<Vec<(String, Method)>>,
}

impl MemoryTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value and notify watchers of `path`.
    pub fn set_value(&self, path: &str, value: Value) {
        let update = ValueUpdate::now(value);
        lock(&self.values).insert(path.to_string(), update.clone());
        let listeners: Vec<ValueListener> = lock(&self.watchers)
            .get(path)
            .map(|w| w.values().cloned().collect())
            .unwrap_or_default();
        for listener in listeners {
            listener(update.clone());
        }
    }

    pub fn add_action<F>(&self, path: &str, action: F)
    where
        F: Fn(Option<Value>) -> Result<Vec<Value>, LinkError> + Send + Sync + 'static,
    {
        lock(&self.actions).insert(path.to_string(), Arc::new(action));
    }

    /// Number of live watches on `path`.
    pub fn watcher_count(&self, path: &str) -> usize {
        lock(&self.watchers).get(path).map_or(0, HashMap::len)
    }

    /// Every `(path, method)` reported through `stream_closed`, in order.
    pub fn closed_streams(&self) -> Vec<(String, Method)> {
        lock(&self.closed).clone()
    }

    fn exists(&self, path: &str) -> bool {
        if path == "/" {
            return true;
        }
        let prefix = format!("{path}/");
        let values = lock(&self.values);
        let actions = lock(&self.actions);
        values.contains_key(path)
            || actions.contains_key(path)
            || values.keys().any(|k| k.starts_with(&prefix))
            || actions.keys().any(|k| k.starts_with(&prefix))
    }
}

impl ValueTree for MemoryTree {
    fn list_children(&self, path: &str) -> Result<Vec<(String, Value)>, LinkError> {
        if !self.exists(path) {
            return Err(LinkError::invalid_path(path));
        }
        let prefix = if path == "/" { "/".to_string() } else { format!("{path}/") };
        let values = lock(&self.values);
        let actions = lock(&self.actions);

        let mut names = BTreeSet::new();
        for key in values.keys().chain(actions.keys()) {
            if let Some(rest) = key.strip_prefix(&prefix) {
                if let Some(name) = rest.split('/').next().filter(|n| !n.is_empty()) {
                    names.insert(name.to_string());
                }
            }
        }
        Ok(names
            .into_iter()
            .map(|name| {
                let full = format!("{prefix}{name}");
                let meta = if actions.contains_key(&full) {
                    json!({"$is": "node", "$invokable": "write"})
                } else if values.contains_key(&full) {
                    json!({"$is": "node", "$type": "dynamic"})
                } else {
                    json!({"$is": "node"})
                };
                (name, meta)
            })
            .collect())
    }

    fn read_value(&self, path: &str) -> Result<Option<ValueUpdate>, LinkError> {
        Ok(lock(&self.values).get(path).cloned())
    }

    fn write_value(&self, path: &str, value: Value, permit: Permission) -> Result<(), LinkError> {
        if permit < Permission::Write || permit == Permission::Never {
            return Err(LinkError::permission_denied(format!(
                "writing {path} needs write permission"
            )));
        }
        if lock(&self.actions).contains_key(path) {
            return Err(LinkError::new(
                ErrorType::InvalidValue,
                format!("{path} is an action"),
            ));
        }
        self.set_value(path, value);
        Ok(())
    }

    fn invoke(&self, path: &str, params: Option<Value>) -> Result<Vec<Value>, LinkError> {
        let action = lock(&self.actions).get(path).cloned();
        match action {
            Some(action) => action(params),
            None => Err(LinkError::invalid_path(path)),
        }
    }

    fn subscribe_value(&self, path: &str, listener: ValueListener) -> Result<WatchGuard, LinkError> {
        let id = self.next_watch.fetch_add(1, Ordering::Relaxed);
        lock(&self.watchers)
            .entry(path.to_string())
            .or_default()
            .insert(id, listener);

        let watchers = self.watchers.clone();
        let path = path.to_string();
        Ok(WatchGuard::new(move || {
            let mut watchers = lock(&watchers);
            if let Some(set) = watchers.get_mut(&path) {
                set.remove(&id);
                if set.is_empty() {
                    watchers.remove(&path);
                }
            }
            debug!(path = %path, watch = id, "value watch released");
        }))
    }

    fn stream_closed(&self, path: &str, method: Method) {
        lock(&self.closed).push((path.to_string(), method));
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|err| err.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn lists_direct_children_only() {
        let tree = MemoryTree::new();
        tree.set_value("/a/x", json!(1));
        tree.set_value("/a/y/z", json!(2));
        tree.add_action("/a/run", |_| Ok(vec![]));

        let rows = tree.list_children("/a").unwrap();
        let names: Vec<_> = rows.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["run", "x", "y"]);
        assert_eq!(rows[0].1["$invokable"], "write");
        assert_eq!(rows[1].1["$type"], "dynamic");

        assert_eq!(tree.list_children("/").unwrap().len(), 1);
        assert!(tree.list_children("/nope").is_err());
    }

    #[test]
    fn watches_end_when_guard_drops() {
        let tree = MemoryTree::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let guard = tree
            .subscribe_value(
                "/v",
                Arc::new(move |_: ValueUpdate| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        tree.set_value("/v", json!(1));
        assert_eq!(tree.watcher_count("/v"), 1);
        drop(guard);
        tree.set_value("/v", json!(2));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(tree.watcher_count("/v"), 0);
    }

    #[test]
    fn write_requires_permission() {
        let tree = MemoryTree::new();
        let err = tree.write_value("/v", json!(1), Permission::Read).unwrap_err();
        assert_eq!(err.error_type, ErrorType::PermissionDenied);
        tree.write_value("/v", json!(1), Permission::Write).unwrap();
        assert_eq!(tree.read_value("/v").unwrap().unwrap().value, json!(1));
    }

    #[test]
    fn invoke_of_missing_action_is_invalid_path() {
        let tree = MemoryTree::new();
        let err = tree.invoke("/missing", None).unwrap_err();
        assert_eq!(err.error_type, ErrorType::InvalidPath);
    }
}
