//! Task registry.
//!
//! A framework task may run components that never see the output adapter
//! (a custom partitioner, for instance) but still need the output table's
//! metadata. The adapter registers its table under a [`TaskKey`] and publishes
//! that key in the job configuration; the collaborator reads the key back and
//! looks the table up here.
//!
//! Entries hold a weak reference to the table, never the adapter itself, and
//! are removed when the [`Registration`] guard returned by `register` is
//! dropped.

use std::fmt;
use std::sync::{Arc, LazyLock, Weak};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use tracing::debug;

use crate::client::TableRef;
use crate::error::{
    DuplicateRegistrationSnafu, NotRegisteredSnafu, RegistryError, RegistryFullSnafu,
};

static GLOBAL: LazyLock<Arc<TaskRegistry>> = LazyLock::new(|| Arc::new(TaskRegistry::new()));

/// Identifier of the execution unit an output belongs to.
#[derive(Debug, Clone, Eq, Hash, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskKey(String);

impl TaskKey {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Key of the calling execution unit.
    ///
    /// Inside a spawned tokio task this is the task id; otherwise it is the
    /// current thread id. Both are unique for the lifetime of the process.
    pub fn current() -> Self {
        match tokio::task::try_id() {
            Some(id) => Self(format!("task-{id}")),
            None => Self(format!("{:?}", std::thread::current().id())),
        }
    }

    pub fn id(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TaskKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Concurrent `TaskKey -> table` mapping.
#[derive(Default)]
pub struct TaskRegistry {
    entries: DashMap<TaskKey, Weak<TableRef>>,
    max_entries: Option<usize>,
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("entries", &self.entries.len())
            .field("max_entries", &self.max_entries)
            .finish()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry refusing registrations beyond `max_entries`.
    pub fn bounded(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: Some(max_entries),
        }
    }

    /// The process-wide registry.
    pub fn global() -> Arc<TaskRegistry> {
        Arc::clone(&GLOBAL)
    }

    /// Register `table` under `key`.
    ///
    /// The entry lives as long as the returned guard.
    pub fn register(
        self: &Arc<Self>,
        key: TaskKey,
        table: &Arc<TableRef>,
    ) -> Result<Registration, RegistryError> {
        // Checked ahead of the entry lock: racing registrations may overshoot
        // the bound by the number of concurrent callers.
        if let Some(capacity) = self.max_entries {
            ensure!(self.entries.len() < capacity, RegistryFullSnafu { capacity });
        }

        match self.entries.entry(key.clone()) {
            Entry::Occupied(_) => DuplicateRegistrationSnafu { key }.fail(),
            Entry::Vacant(slot) => {
                slot.insert(Arc::downgrade(table));
                debug!(task_key = %key, table = table.name(), "Registered output table");
                Ok(Registration {
                    registry: Arc::clone(self),
                    key,
                    table: Arc::downgrade(table),
                })
            }
        }
    }

    /// Resolve `key` to its table.
    pub fn lookup(&self, key: &TaskKey) -> Result<Arc<TableRef>, RegistryError> {
        self.entries
            .get(key)
            .and_then(|entry| entry.upgrade())
            .context(NotRegisteredSnafu { key: key.clone() })
    }

    /// Remove `key`. Returns whether an entry was present; absent keys are not an error.
    pub fn unregister(&self, key: &TaskKey) -> bool {
        let removed = self.entries.remove(key).is_some();
        if removed {
            debug!(task_key = %key, "Unregistered output table");
        }
        removed
    }

    pub fn contains(&self, key: &TaskKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Scoped registry entry; dropping it unregisters the key.
#[must_use = "dropping the registration unregisters the key immediately"]
pub struct Registration {
    registry: Arc<TaskRegistry>,
    key: TaskKey,
    table: Weak<TableRef>,
}

impl Registration {
    pub fn key(&self) -> &TaskKey {
        &self.key
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("key", &self.key)
            .finish()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        // Only the entry this guard created; the key may have been
        // unregistered and taken by another output since.
        let removed = self
            .registry
            .entries
            .remove_if(&self.key, |_, table| Weak::ptr_eq(table, &self.table))
            .is_some();
        if removed {
            debug!(task_key = %self.key, "Unregistered output table");
        }
    }
}
