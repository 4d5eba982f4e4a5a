// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dynamic object model.
//!
//! The synchronizer never interprets upstream payloads beyond the
//! identifying metadata; the full object travels as a JSON value and is
//! handed to the storage layer as-is. Watermarks are opaque per-object
//! version markers compared only for equality.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::gvr::GroupVersion;

/// Opaque per-object version marker used for incremental sync.
///
/// The storage layer decides what it persists here; the engine only ever
/// compares watermarks for equality.
pub type Watermark = Value;

/// An upstream object reduced to identifying metadata plus its raw payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawObject {
    /// Cluster-unique object UID.
    pub uid: String,
    /// Object name.
    pub name: String,
    /// Namespace; `None` for cluster-scoped resources.
    pub namespace: Option<String>,
    /// Upstream resource version of this object snapshot.
    pub resource_version: String,
    /// `group/version` the payload is expressed in.
    pub api_version: String,
    /// Object kind.
    pub kind: String,
    /// The full object, untouched.
    pub payload: Value,
}

impl RawObject {
    /// The group/version the payload is expressed in.
    pub fn group_version(&self) -> GroupVersion {
        GroupVersion::parse(&self.api_version)
    }

    /// The watermark value recorded for this object snapshot.
    pub fn watermark(&self) -> Watermark {
        Value::String(self.resource_version.clone())
    }

    /// A minimal tombstone for an object known only by UID.
    ///
    /// Used when a deletion is inferred (the UID was tracked but absent
    /// from a fresh enumeration) and no full object is available. Storage
    /// backends resolve the rest through `convert_deleted_object`.
    pub fn tombstone(uid: impl Into<String>) -> Self {
        let uid = uid.into();
        Self {
            payload: serde_json::json!({ "metadata": { "uid": uid } }),
            uid,
            name: String::new(),
            namespace: None,
            resource_version: String::new(),
            api_version: String::new(),
            kind: String::new(),
        }
    }
}

/// A single event from an upstream watch stream.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    /// A new object appeared.
    Added(RawObject),
    /// An existing object changed.
    Modified(RawObject),
    /// An object was removed.
    Deleted(RawObject),
    /// Progress marker carrying only a resource version.
    Bookmark(String),
}

impl WatchEvent {
    /// The object carried by this event, if any.
    pub fn object(&self) -> Option<&RawObject> {
        match self {
            Self::Added(obj) | Self::Modified(obj) | Self::Deleted(obj) => Some(obj),
            Self::Bookmark(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(uid: &str, rv: &str) -> RawObject {
        RawObject {
            uid: uid.to_string(),
            name: format!("name-{uid}"),
            namespace: Some("default".to_string()),
            resource_version: rv.to_string(),
            api_version: "apps/v1".to_string(),
            kind: "Deployment".to_string(),
            payload: serde_json::json!({"metadata": {"uid": uid}}),
        }
    }

    #[test]
    fn test_watermark_equality_only() {
        assert_eq!(obj("u1", "10").watermark(), obj("u1", "10").watermark());
        assert_ne!(obj("u1", "10").watermark(), obj("u1", "11").watermark());
    }

    #[test]
    fn test_tombstone_carries_uid() {
        let t = RawObject::tombstone("u9");
        assert_eq!(t.uid, "u9");
        assert_eq!(t.payload["metadata"]["uid"], "u9");
    }

    #[test]
    fn test_watch_event_object_accessor() {
        assert!(WatchEvent::Added(obj("u1", "1")).object().is_some());
        assert!(WatchEvent::Bookmark("5".to_string()).object().is_none());
    }
}
