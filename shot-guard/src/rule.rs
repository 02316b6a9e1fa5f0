use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

/// Per-resource rule snapshot, swapped wholesale on every load.
///
/// Readers clone the inner `Arc` and keep a consistent view for the whole
/// check, however many loads happen meanwhile.
#[derive(Debug)]
pub struct RuleMap<E: ?Sized> {
    inner: RwLock<Arc<HashMap<String, Vec<Arc<E>>>>>,
}

impl<E: ?Sized> Default for RuleMap<E> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(Arc::new(HashMap::new())),
        }
    }
}

impl<E: ?Sized> RuleMap<E> {
    pub fn snapshot(&self) -> Arc<HashMap<String, Vec<Arc<E>>>> {
        Arc::clone(&self.inner.read())
    }

    pub fn get(&self, resource: &str) -> Vec<Arc<E>> {
        self.inner.read().get(resource).cloned().unwrap_or_default()
    }

    pub fn count(&self) -> usize {
        self.inner.read().values().map(Vec::len).sum()
    }

    /// Installs `map` and returns the replaced snapshot.
    pub fn replace_all(&self, map: HashMap<String, Vec<Arc<E>>>) -> Arc<HashMap<String, Vec<Arc<E>>>> {
        std::mem::replace(&mut *self.inner.write(), Arc::new(map))
    }

    /// Replaces the entries of one resource, leaving the others untouched.
    /// Returns how many entries the resource had before.
    pub fn replace_resource(&self, resource: &str, entries: Vec<Arc<E>>) -> usize {
        let mut guard = self.inner.write();
        let mut map = HashMap::clone(&guard);
        let previous = if entries.is_empty() {
            map.remove(resource)
        } else {
            map.insert(resource.to_string(), entries)
        };
        *guard = Arc::new(map);
        previous.map(|v| v.len()).unwrap_or_default()
    }
}

/// Rule counts before and after a load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LoadOutcome {
    pub previous: usize,
    pub current: usize,
}

/// Groups `items` by the resource each one names.
pub(crate) fn group_by_resource<E: ?Sized, F>(items: Vec<Arc<E>>, resource: F) -> HashMap<String, Vec<Arc<E>>>
where
    F: Fn(&E) -> &str,
{
    let mut map: HashMap<String, Vec<Arc<E>>> = HashMap::new();
    for item in items {
        map.entry(resource(item.as_ref()).to_string()).or_default().push(item);
    }
    map
}
