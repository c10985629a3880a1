// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Concurrent handle registry and its persistence.
//!
//! The database is a map from handle id to [`Handle`]. It is persisted as a
//! `.properties` file with one record per handle: the key is the handle id,
//! the value is the handle's property table as a JSON object. Live
//! containers are never persisted; after a reload every handle is stopped
//! until started again.

use std::io::{Read, Write};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::warn;

use crate::error::Result;
use crate::handle::Handle;
use crate::properties::{self, PropertyTable};

/// Comment written at the top of the database file.
const FILE_COMMENT: &str = "hangar handle database";

/// Registry of all handles.
#[derive(Default)]
pub struct HandleDatabase {
    handles: DashMap<String, Arc<Handle>>,
}

impl HandleDatabase {
    /// Create an empty database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a handle.
    pub fn get(&self, id: &str) -> Option<Arc<Handle>> {
        self.handles.get(id).map(|entry| entry.value().clone())
    }

    /// Insert a handle, returning the one it replaced.
    pub fn put(&self, handle: Arc<Handle>) -> Option<Arc<Handle>> {
        self.handles.insert(handle.id().to_string(), handle)
    }

    /// Remove a handle.
    pub fn remove(&self, id: &str) -> Option<Arc<Handle>> {
        self.handles.remove(id).map(|(_, handle)| handle)
    }

    /// Return the handle for `id`, registering an empty one if absent.
    ///
    /// Two concurrent calls for the same id always return the same handle.
    pub fn get_or_create(&self, id: &str) -> Arc<Handle> {
        self.handles
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Handle::new(id)))
            .value()
            .clone()
    }

    /// All handles, ordered by id. Safe to call while other tasks insert or
    /// remove handles.
    pub fn snapshot(&self) -> Vec<Arc<Handle>> {
        let mut handles: Vec<Arc<Handle>> = self
            .handles
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        handles.sort_by(|a, b| a.id().cmp(b.id()));
        handles
    }

    /// All handle ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        self.snapshot()
            .iter()
            .map(|handle| handle.id().to_string())
            .collect()
    }

    /// Number of handles.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether the database is empty.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Read a database from a `.properties` stream.
    ///
    /// A record whose value is not a JSON object loads as a handle with no
    /// properties (so it never autostarts) and is logged.
    pub fn load<R: Read>(reader: R) -> Result<Self> {
        let db = Self::new();
        for (id, value) in properties::read_properties(reader)? {
            let table = match serde_json::from_str::<PropertyTable>(&value) {
                Ok(table) => table,
                Err(e) => {
                    warn!(handle_id = %id, error = %e, "Ignoring unreadable handle properties");
                    PropertyTable::new()
                }
            };
            db.put(Arc::new(Handle::with_properties(id, table)));
        }
        Ok(db)
    }

    /// Write the database as a `.properties` stream.
    pub fn store<W: Write>(&self, writer: &mut W) -> Result<()> {
        let records: Vec<(String, String)> = self
            .snapshot()
            .iter()
            .map(|handle| (handle.id().to_string(), handle.properties().to_json_string()))
            .collect();
        properties::write_properties(
            writer,
            Some(FILE_COMMENT),
            records.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::properties::PropertyValue;

    fn sample_properties() -> PropertyTable {
        let mut props = PropertyTable::new();
        props.insert("containerId", "tomcat9x");
        props.insert("autostart", "true");
        props.insert("note", "multi\nline = \"quoted\" ünïcode");
        let mut system = PropertyTable::new();
        system.insert("cargo.servlet.port", "8080");
        props.insert("containerProperties", system);
        let mut war = PropertyTable::new();
        war.insert("filename", "app.war");
        war.insert("context", "/app");
        props.insert("deployableFiles", PropertyValue::List(vec![war.into()]));
        props.insert("extraClasspath", vec!["lib/a.jar".to_string(), "lib/b.jar".to_string()]);
        props
    }

    #[test]
    fn test_store_then_load_round_trip() {
        let db = HandleDatabase::new();
        db.put(Arc::new(Handle::with_properties("h1", sample_properties())));
        db.put(Arc::new(Handle::with_properties("with space=and:colon", PropertyTable::new())));

        let mut buf = Vec::new();
        db.store(&mut buf).unwrap();
        let loaded = HandleDatabase::load(buf.as_slice()).unwrap();

        assert_eq!(loaded.ids(), db.ids());
        for handle in db.snapshot() {
            let other = loaded.get(handle.id()).unwrap();
            assert_eq!(other.properties(), handle.properties());
        }
        assert!(loaded.get("h1").unwrap().is_autostart());
    }

    #[test]
    fn test_load_tolerates_corrupt_record() {
        let text = "#db\nh1={\"containerId\"\\:\"mock\",\"autostart\"\\:\"true\"}\nh2=not json\nh3=[1,2]\n";
        let db = HandleDatabase::load(text.as_bytes()).unwrap();
        assert_eq!(db.len(), 3);
        assert_eq!(db.get("h1").unwrap().properties().get("containerId"), Some("mock"));
        assert!(db.get("h2").unwrap().properties().is_empty());
        assert!(db.get("h3").unwrap().properties().is_empty());
        assert!(!db.get("h2").unwrap().is_autostart());
    }

    #[test]
    fn test_load_propagates_malformed_escape() {
        let text = "h1=\\uZZZZ\n";
        assert!(HandleDatabase::load(text.as_bytes()).is_err());
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let db = HandleDatabase::new();
        let a = db.get_or_create("h1");
        let b = db.get_or_create("h1");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(db.len(), 1);

        assert!(db.remove("h1").is_some());
        assert!(db.get("h1").is_none());
        assert!(db.remove("h1").is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_get_or_create_yields_one_handle() {
        let db = Arc::new(HandleDatabase::new());
        let mut tasks = Vec::new();
        for _ in 0..32 {
            let db = db.clone();
            tasks.push(tokio::spawn(async move { db.get_or_create("shared") }));
        }
        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap());
        }
        assert_eq!(db.len(), 1);
        assert!(handles.iter().all(|h| Arc::ptr_eq(h, &handles[0])));
    }

    #[test]
    fn test_snapshot_is_sorted() {
        let db = HandleDatabase::new();
        for id in ["c", "a", "b"] {
            db.get_or_create(id);
        }
        assert_eq!(db.ids(), vec!["a", "b", "c"]);
    }
}
