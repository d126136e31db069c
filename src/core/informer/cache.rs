// src/core/informer/cache.rs

//! The indexed object cache an Informer maintains (spec §3): primary index by
//! UID, secondary index by `(namespace, name)`. Reader/writer locking per
//! spec §5c — the watch loop is the sole writer, snapshot callers are readers.

use kube::core::DynamicObject;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// A cached object, stripped of fields no subscriber needs (`managedFields`
/// etc., spec §4.C.4) at ingest time.
pub type ClusterObject = Arc<DynamicObject>;

#[derive(Default)]
pub struct ObjectCache {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    by_uid: HashMap<String, ClusterObject>,
    uid_by_name: HashMap<(String, String), String>,
}

/// Strips large, rarely-needed fields before an object enters the cache.
pub fn elide_for_cache(mut obj: DynamicObject) -> DynamicObject {
    obj.metadata.managed_fields = None;
    obj
}

impl ObjectCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, obj: DynamicObject) {
        let obj = elide_for_cache(obj);
        let Some(uid) = obj.metadata.uid.clone() else {
            return;
        };
        let namespace = obj.metadata.namespace.clone().unwrap_or_default();
        let name = obj.metadata.name.clone().unwrap_or_default();
        let mut inner = self.inner.write();
        inner.uid_by_name.insert((namespace, name), uid.clone());
        inner.by_uid.insert(uid, Arc::new(obj));
    }

    pub fn remove_by_uid(&self, uid: &str) {
        let mut inner = self.inner.write();
        if let Some(obj) = inner.by_uid.remove(uid) {
            let namespace = obj.metadata.namespace.clone().unwrap_or_default();
            let name = obj.metadata.name.clone().unwrap_or_default();
            inner.uid_by_name.remove(&(namespace, name));
        }
    }

    /// Atomic snapshot: a single read-lock acquisition, so a subscriber's
    /// initial frame never observes a torn read (spec §5 ordering guarantee).
    pub fn snapshot(&self) -> Vec<ClusterObject> {
        self.inner.read().by_uid.values().cloned().collect()
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<ClusterObject> {
        let inner = self.inner.read();
        let uid = inner
            .uid_by_name
            .get(&(namespace.to_string(), name.to_string()))?;
        inner.by_uid.get(uid).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_uid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.by_uid.clear();
        inner.uid_by_name.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn obj(uid: &str, ns: &str, name: &str) -> DynamicObject {
        DynamicObject {
            types: None,
            metadata: ObjectMeta {
                uid: Some(uid.to_string()),
                namespace: Some(ns.to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            },
            data: serde_json::Value::Null,
        }
    }

    #[test]
    fn upsert_then_get_by_name() {
        let cache = ObjectCache::new();
        cache.upsert(obj("u1", "default", "a"));
        assert!(cache.get("default", "a").is_some());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn remove_clears_both_indexes() {
        let cache = ObjectCache::new();
        cache.upsert(obj("u1", "default", "a"));
        cache.remove_by_uid("u1");
        assert!(cache.get("default", "a").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn snapshot_reflects_all_current_entries() {
        let cache = ObjectCache::new();
        cache.upsert(obj("u1", "default", "a"));
        cache.upsert(obj("u2", "default", "b"));
        let snap = cache.snapshot();
        assert_eq!(snap.len(), 2);
    }
}
