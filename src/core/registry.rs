//! Instance registry - The single table of instance records

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

use super::error::ManagerError;
use super::instance::{Instance, InstanceId};
use super::resource::ResourceUsage;
use crate::persistence::Database;

/// Authoritative table of instances
///
/// All operations go through one lock. Every mutation is written through to
/// the database when one is attached; a failed write is logged and the
/// in-memory table stays authoritative.
pub struct InstanceRegistry {
    instances: RwLock<HashMap<InstanceId, Instance>>,
    database: Option<Arc<Database>>,
}

impl InstanceRegistry {
    pub fn new(database: Option<Arc<Database>>) -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
            database,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<InstanceId, Instance>> {
        self.instances.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<InstanceId, Instance>> {
        self.instances.write().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, instance: &Instance) {
        if let Some(db) = &self.database {
            if let Err(e) = db.save_instance(instance) {
                warn!("Failed to persist instance {}: {}", instance.id, e);
            }
        }
    }

    /// Append to the instance's history log
    pub fn record_event(&self, id: InstanceId, event: &str, details: Option<&str>) {
        if let Some(db) = &self.database {
            if let Err(e) = db.record_instance_event(id, event, details) {
                warn!("Failed to record {} event for {}: {}", event, id, e);
            }
        }
    }

    pub fn insert(&self, instance: Instance) {
        let mut instances = self.write();
        self.persist(&instance);
        instances.insert(instance.id, instance);
    }

    /// Atomically read-modify-write one record
    ///
    /// The record is only changed (and persisted) when `f` succeeds; on error
    /// the previous value is kept.
    pub fn update_state<T, F>(&self, id: InstanceId, f: F) -> Result<T, ManagerError>
    where
        F: FnOnce(&mut Instance) -> Result<T, ManagerError>,
    {
        let mut instances = self.write();
        let current = instances.get_mut(&id).ok_or(ManagerError::NotFound(id))?;
        let mut next = current.clone();
        let out = f(&mut next)?;
        self.persist(&next);
        *current = next;
        Ok(out)
    }

    /// Attach the latest resource sample; samples are not persisted
    pub fn set_resources(&self, id: InstanceId, usage: Option<ResourceUsage>) {
        if let Some(instance) = self.write().get_mut(&id) {
            instance.resources = usage;
        }
    }

    pub fn get(&self, id: InstanceId) -> Option<Instance> {
        self.read().get(&id).cloned()
    }

    /// Point-in-time copy of every record, oldest first
    pub fn list(&self) -> Vec<Instance> {
        let mut all: Vec<Instance> = self.read().values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        all
    }

    pub fn remove(&self, id: InstanceId) -> Option<Instance> {
        let mut instances = self.write();
        let removed = instances.remove(&id)?;
        if let Some(db) = &self.database {
            if let Err(e) = db.delete_instance(id) {
                warn!("Failed to delete persisted instance {}: {}", id, e);
            }
        }
        Some(removed)
    }

    /// Count records matching a predicate under one lock acquisition
    pub fn count_where(&self, pred: impl Fn(&Instance) -> bool) -> usize {
        self.read().values().filter(|i| pred(i)).count()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn database(&self) -> Option<&Arc<Database>> {
        self.database.as_ref()
    }
}
