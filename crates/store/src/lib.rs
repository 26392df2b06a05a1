use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::warn;

use shared::error::CoreError;

/// Slash-free path segments addressing a node in the hierarchical store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorePath {
    segments: Vec<String>,
}

impl StorePath {
    pub fn root() -> Self {
        Self { segments: Vec::new() }
    }

    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn starts_with(&self, prefix: &StorePath) -> bool {
        self.segments.len() >= prefix.segments.len()
            && self.segments[..prefix.segments.len()] == prefix.segments[..]
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("/"))
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend failure: {0}")]
    Backend(String),

    #[error("invalid store path '{0}'")]
    InvalidPath(String),

    #[error("value serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        CoreError::Store(err.to_string())
    }
}

/// Decode a snapshot into a typed record. A null snapshot (absent node)
/// decodes to `None` instead of an error.
pub fn decode<T: DeserializeOwned>(snapshot: &Value) -> Result<Option<T>, StoreError> {
    if snapshot.is_null() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_value(snapshot.clone())?))
}

/// Receiver half of a path subscription. Snapshots are delivered
/// at-least-once: the current value arrives first, then one snapshot per
/// observed change (duplicates possible). Dropping the receiver cancels
/// the subscription deterministically.
pub struct StoreSubscription {
    rx: mpsc::UnboundedReceiver<Value>,
}

impl StoreSubscription {
    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }
}

/// The real-time hierarchical key-value store the core coordinates
/// against. `update` is an atomic multi-key write of direct children, so a
/// subscriber never observes half of a compound change. Writing null
/// removes the node.
#[async_trait]
pub trait Store: Send + Sync {
    async fn write(&self, path: &StorePath, value: Value) -> Result<(), StoreError>;
    async fn update(&self, path: &StorePath, children: HashMap<String, Value>)
        -> Result<(), StoreError>;
    async fn remove(&self, path: &StorePath) -> Result<(), StoreError>;
    async fn read_once(&self, path: &StorePath) -> Result<Value, StoreError>;
    async fn subscribe(&self, path: &StorePath) -> StoreSubscription;

    /// Issue a message key. Keys are lexicographically monotonic, so key
    /// order matches creation order.
    fn push_id(&self) -> String;
}

struct Watcher {
    path: StorePath,
    sender: mpsc::UnboundedSender<Value>,
}

/// In-memory store: one JSON tree behind a lock, with snapshot fan-out to
/// path watchers on every mutation. Drives every test in the workspace;
/// production backends implement the same trait.
pub struct MemoryStore {
    tree: RwLock<Value>,
    watchers: Mutex<Vec<Watcher>>,
    push_counter: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tree: RwLock::new(Value::Null),
            watchers: Mutex::new(Vec::new()),
            push_counter: AtomicU64::new(0),
        }
    }

    fn notify(&self, changed: &StorePath, root: &Value) {
        let mut watchers = match self.watchers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("store: watcher registry poisoned, recovering");
                poisoned.into_inner()
            }
        };
        watchers.retain(|watcher| {
            if !watcher.path.starts_with(changed) && !changed.starts_with(&watcher.path) {
                return !watcher.sender.is_closed();
            }
            watcher.sender.send(value_at(root, &watcher.path)).is_ok()
        });
    }

    #[cfg(test)]
    fn watcher_count(&self) -> usize {
        let mut watchers = self.watchers.lock().expect("watchers");
        watchers.retain(|watcher| !watcher.sender.is_closed());
        watchers.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn value_at(root: &Value, path: &StorePath) -> Value {
    let mut node = root;
    for segment in path.segments() {
        match node.get(segment) {
            Some(child) => node = child,
            None => return Value::Null,
        }
    }
    node.clone()
}

fn node_at_mut<'tree>(root: &'tree mut Value, path: &StorePath) -> &'tree mut Value {
    let mut node = root;
    for segment in path.segments() {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        node = node
            .as_object_mut()
            .expect("object ensured above")
            .entry(segment.clone())
            .or_insert(Value::Null);
    }
    node
}

fn remove_at(root: &mut Value, path: &StorePath) {
    let Some((leaf, parents)) = path.segments().split_last() else {
        *root = Value::Null;
        return;
    };
    let mut node = root;
    for segment in parents {
        match node.get_mut(segment) {
            Some(child) => node = child,
            None => return,
        }
    }
    if let Some(object) = node.as_object_mut() {
        object.remove(leaf);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn write(&self, path: &StorePath, value: Value) -> Result<(), StoreError> {
        let mut tree = self.tree.write().await;
        if value.is_null() {
            remove_at(&mut tree, path);
        } else {
            *node_at_mut(&mut tree, path) = value;
        }
        self.notify(path, &tree);
        Ok(())
    }

    async fn update(
        &self,
        path: &StorePath,
        children: HashMap<String, Value>,
    ) -> Result<(), StoreError> {
        let mut tree = self.tree.write().await;
        let node = node_at_mut(&mut tree, path);
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        let object = node.as_object_mut().expect("object ensured above");
        for (key, value) in children {
            if value.is_null() {
                object.remove(&key);
            } else {
                object.insert(key, value);
            }
        }
        self.notify(path, &tree);
        Ok(())
    }

    async fn remove(&self, path: &StorePath) -> Result<(), StoreError> {
        let mut tree = self.tree.write().await;
        remove_at(&mut tree, path);
        self.notify(path, &tree);
        Ok(())
    }

    async fn read_once(&self, path: &StorePath) -> Result<Value, StoreError> {
        let tree = self.tree.read().await;
        Ok(value_at(&tree, path))
    }

    async fn subscribe(&self, path: &StorePath) -> StoreSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        // The tree lock is held across registration. Mutations notify while
        // holding it for writing, so no change can land between the initial
        // snapshot and the watcher list picking up this sender.
        let tree = self.tree.read().await;
        let _ = tx.send(value_at(&tree, path));
        let watcher = Watcher {
            path: path.clone(),
            sender: tx,
        };
        match self.watchers.lock() {
            Ok(mut watchers) => watchers.push(watcher),
            Err(poisoned) => poisoned.into_inner().push(watcher),
        }
        StoreSubscription { rx }
    }

    fn push_id(&self) -> String {
        let count = self.push_counter.fetch_add(1, Ordering::SeqCst);
        format!("msg{count:012}")
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
