//! Story State — hierarchical dot-path-addressable key-value store (component B).
//!
//! The bus is taken by reference on every mutating call rather than owned by
//! the state store itself: a concrete value passed in, not inherited, per
//! the "no global singleton / no emitter inheritance" redesign direction.

use crate::bus::EventBus;
use crate::types::{Result, SubscriptionId};
use serde_json::Value;

/// Point-in-time capture of the whole tree, suitable for persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct StateSnapshot {
    pub root: Value,
    pub version: u64,
}

/// Hierarchical key-path store with change notification and snapshotting.
#[derive(Debug, Clone)]
pub struct StoryState {
    root: Value,
    version: u64,
}

impl Default for StoryState {
    fn default() -> Self {
        Self {
            root: Value::Object(serde_json::Map::new()),
            version: 0,
        }
    }
}

impl StoryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Deep-copy read of the value at `path`, or `None` if any segment is missing.
    pub fn get_path(&self, path: &str) -> Option<Value> {
        get_at(&self.root, path).cloned()
    }

    /// Set the value at `path`, creating intermediate objects as needed.
    /// Emits `state:changed { path, oldValue, newValue, version }` on `bus`.
    pub fn set_path(&mut self, bus: &mut EventBus, path: &str, value: Value) -> Result<()> {
        let old_value = get_at(&self.root, path).cloned().unwrap_or(Value::Null);
        set_at(&mut self.root, path, value.clone())?;
        self.version += 1;
        self.publish_change(bus, path, old_value, value);
        Ok(())
    }

    /// Shallow-merge `partial` (must be an object) into the object at `path`,
    /// creating the target object if it does not yet exist.
    pub fn update_state(&mut self, bus: &mut EventBus, path: &str, partial: Value) -> Result<()> {
        let Value::Object(partial_map) = partial else {
            return Err(crate::types::Error::validation(
                "update_state requires an object payload",
            ));
        };
        let old_value = get_at(&self.root, path).cloned().unwrap_or(Value::Null);
        let mut merged = match &old_value {
            Value::Object(map) => map.clone(),
            Value::Null => serde_json::Map::new(),
            _ => {
                return Err(crate::types::Error::validation(format!(
                    "cannot merge object into non-object at path '{path}'"
                )))
            }
        };
        for (k, v) in partial_map {
            merged.insert(k, v);
        }
        let new_value = Value::Object(merged);
        set_at(&mut self.root, path, new_value.clone())?;
        self.version += 1;
        self.publish_change(bus, path, old_value, new_value);
        Ok(())
    }

    /// Remove the value at `path` entirely.
    pub fn remove_path(&mut self, bus: &mut EventBus, path: &str) -> Result<()> {
        let old_value = get_at(&self.root, path).cloned().unwrap_or(Value::Null);
        remove_at(&mut self.root, path);
        self.version += 1;
        self.publish_change(bus, path, old_value, Value::Null);
        Ok(())
    }

    /// Deep-clone snapshot at the current version.
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            root: self.root.clone(),
            version: self.version,
        }
    }

    /// Restore a previously captured snapshot verbatim (root and version).
    pub fn restore(&mut self, snapshot: StateSnapshot) {
        self.root = snapshot.root;
        self.version = snapshot.version;
    }

    /// Subscribe to `state:changed` events whose `path` starts with `path_prefix`.
    /// Returns a cancel token (subscription id) usable with [`EventBus::unsubscribe`].
    pub fn subscribe_changes<H>(bus: &mut EventBus, path_prefix: impl Into<String>, handler: H) -> SubscriptionId
    where
        H: crate::bus::EventHandlerFn,
    {
        let prefix = path_prefix.into();
        let filter: std::sync::Arc<dyn Fn(&crate::bus::Event) -> bool + Send + Sync> =
            std::sync::Arc::new(move |event: &crate::bus::Event| {
                event
                    .payload
                    .get("path")
                    .and_then(|p| p.as_str())
                    .map(|p| p.starts_with(&prefix))
                    .unwrap_or(false)
            });
        bus.subscribe(
            "state:changed",
            handler,
            crate::bus::SubscribeOptions {
                priority: 0,
                once: false,
                filter: Some(filter),
            },
        )
    }

    fn publish_change(&self, bus: &mut EventBus, path: &str, old_value: Value, new_value: Value) {
        bus.emit(
            "state:changed",
            serde_json::json!({
                "path": path,
                "oldValue": old_value,
                "newValue": new_value,
                "version": self.version,
            }),
        );
    }
}

fn get_at<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(root);
    }
    let mut current = root;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn set_at(root: &mut Value, path: &str, value: Value) -> Result<()> {
    if path.is_empty() {
        *root = value;
        return Ok(());
    }
    let mut current = root;
    let segments: Vec<&str> = path.split('.').collect();
    for segment in &segments[..segments.len() - 1] {
        if !current.is_object() {
            *current = Value::Object(serde_json::Map::new());
        }
        let map = current.as_object_mut().expect("just coerced to object");
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }
    if !current.is_object() {
        *current = Value::Object(serde_json::Map::new());
    }
    let map = current.as_object_mut().expect("just coerced to object");
    map.insert(segments[segments.len() - 1].to_string(), value);
    Ok(())
}

fn remove_at(root: &mut Value, path: &str) {
    let segments: Vec<&str> = path.split('.').collect();
    if segments.is_empty() {
        return;
    }
    let mut current = root;
    for segment in &segments[..segments.len() - 1] {
        match current.as_object_mut().and_then(|m| m.get_mut(*segment)) {
            Some(next) => current = next,
            None => return,
        }
    }
    if let Some(map) = current.as_object_mut() {
        map.remove(segments[segments.len() - 1]);
    }
}
