//! # Service model
//!
//! A service is one unit of work scheduled onto a node: identified by a
//! uuid plus its task coordinates, carrying a lifecycle and the listener
//! address it serves on. The registry is the cluster-wide replicated view;
//! every node holds the same table, refreshed through lifecycle messages
//! and cluster data sync.

use crate::error::ClusterError;
use crate::node::{ListenerAddress, NodeId};
use armada_protocol::{BufObject, DataBuf, ProtocolError};
use dashmap::DashMap;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use tokio::sync::{Mutex, MutexGuard};

/// Identity of one service instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceId {
    pub unique_id: uuid::Uuid,
    pub task_name: String,
    pub task_service_id: u32,
    pub node: NodeId,
    pub environment: String,
}

impl ServiceId {
    /// Human-facing name, e.g. `lobby-1`.
    pub fn name(&self) -> String {
        format!("{}-{}", self.task_name, self.task_service_id)
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name(), self.node)
    }
}

impl BufObject for ServiceId {
    fn write_into(&self, buf: &mut DataBuf) -> Result<(), ProtocolError> {
        buf.write_unique_id(&self.unique_id)?;
        buf.write_string(&self.task_name)?;
        buf.write_u32(self.task_service_id)?;
        self.node.write_into(buf)?;
        buf.write_string(&self.environment)
    }

    fn read_from(buf: &mut DataBuf) -> Result<Self, ProtocolError> {
        Ok(Self {
            unique_id: buf.read_unique_id()?,
            task_name: buf.read_string()?,
            task_service_id: buf.read_u32()?,
            node: NodeId::read_from(buf)?,
            environment: buf.read_string()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceLifecycle {
    Prepared,
    Running,
    Stopped,
    Deleted,
}

impl ServiceLifecycle {
    /// Prepared and running services hold capacity; stopped and deleted
    /// ones do not.
    pub fn is_active(&self) -> bool {
        matches!(self, ServiceLifecycle::Prepared | ServiceLifecycle::Running)
    }

    fn tag(&self) -> u8 {
        match self {
            ServiceLifecycle::Prepared => 0,
            ServiceLifecycle::Running => 1,
            ServiceLifecycle::Stopped => 2,
            ServiceLifecycle::Deleted => 3,
        }
    }

    fn from_tag(tag: u8) -> Result<Self, ProtocolError> {
        match tag {
            0 => Ok(ServiceLifecycle::Prepared),
            1 => Ok(ServiceLifecycle::Running),
            2 => Ok(ServiceLifecycle::Stopped),
            3 => Ok(ServiceLifecycle::Deleted),
            tag => Err(ProtocolError::UnknownTag {
                tag,
                context: "service lifecycle",
            }),
        }
    }
}

impl fmt::Display for ServiceLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceLifecycle::Prepared => "prepared",
            ServiceLifecycle::Running => "running",
            ServiceLifecycle::Stopped => "stopped",
            ServiceLifecycle::Deleted => "deleted",
        };
        f.write_str(name)
    }
}

impl BufObject for ServiceLifecycle {
    fn write_into(&self, buf: &mut DataBuf) -> Result<(), ProtocolError> {
        buf.write_u8(self.tag())
    }

    fn read_from(buf: &mut DataBuf) -> Result<Self, ProtocolError> {
        Self::from_tag(buf.read_u8()?)
    }
}

/// Replicated record of one service instance.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceInfo {
    pub id: ServiceId,
    pub lifecycle: ServiceLifecycle,
    pub address: ListenerAddress,
    pub groups: Vec<String>,
    pub properties: HashMap<String, String>,
    pub creation_time: u64,
}

impl BufObject for ServiceInfo {
    fn write_into(&self, buf: &mut DataBuf) -> Result<(), ProtocolError> {
        self.id.write_into(buf)?;
        self.lifecycle.write_into(buf)?;
        self.address.write_into(buf)?;
        self.groups.write_into(buf)?;
        self.properties.write_into(buf)?;
        buf.write_var_u64(self.creation_time)
    }

    fn read_from(buf: &mut DataBuf) -> Result<Self, ProtocolError> {
        Ok(Self {
            id: ServiceId::read_from(buf)?,
            lifecycle: ServiceLifecycle::read_from(buf)?,
            address: ListenerAddress::read_from(buf)?,
            groups: Vec::read_from(buf)?,
            properties: HashMap::read_from(buf)?,
            creation_time: buf.read_var_u64()?,
        })
    }
}

/// Template services are started from.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceTask {
    pub name: String,
    pub environment: String,
    pub min_service_count: u32,
    pub associated_nodes: Vec<NodeId>,
    pub groups: Vec<String>,
}

impl BufObject for ServiceTask {
    fn write_into(&self, buf: &mut DataBuf) -> Result<(), ProtocolError> {
        buf.write_string(&self.name)?;
        buf.write_string(&self.environment)?;
        buf.write_u32(self.min_service_count)?;
        self.associated_nodes.write_into(buf)?;
        self.groups.write_into(buf)
    }

    fn read_from(buf: &mut DataBuf) -> Result<Self, ProtocolError> {
        Ok(Self {
            name: buf.read_string()?,
            environment: buf.read_string()?,
            min_service_count: buf.read_u32()?,
            associated_nodes: Vec::read_from(buf)?,
            groups: Vec::read_from(buf)?,
        })
    }
}

/// Named group services can belong to, spanning environments.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceGroup {
    pub name: String,
    pub environments: Vec<String>,
}

impl BufObject for ServiceGroup {
    fn write_into(&self, buf: &mut DataBuf) -> Result<(), ProtocolError> {
        buf.write_string(&self.name)?;
        self.environments.write_into(buf)
    }

    fn read_from(buf: &mut DataBuf) -> Result<Self, ProtocolError> {
        Ok(Self {
            name: buf.read_string()?,
            environments: Vec::read_from(buf)?,
        })
    }
}

/// Cluster-wide service table.
#[derive(Default)]
pub struct ServiceRegistry {
    services: DashMap<uuid::Uuid, ServiceInfo>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a record, returning the previous one.
    pub fn upsert(&self, info: ServiceInfo) -> Option<ServiceInfo> {
        self.services.insert(info.id.unique_id, info)
    }

    pub fn get(&self, unique_id: &uuid::Uuid) -> Option<ServiceInfo> {
        self.services.get(unique_id).map(|e| e.value().clone())
    }

    pub fn by_name(&self, name: &str) -> Option<ServiceInfo> {
        self.services
            .iter()
            .find(|e| e.value().id.name() == name)
            .map(|e| e.value().clone())
    }

    pub fn all(&self) -> Vec<ServiceInfo> {
        self.services.iter().map(|e| e.value().clone()).collect()
    }

    pub fn by_task(&self, task_name: &str) -> Vec<ServiceInfo> {
        self.filter(|info| info.id.task_name == task_name)
    }

    pub fn by_group(&self, group: &str) -> Vec<ServiceInfo> {
        self.filter(|info| info.groups.iter().any(|g| g == group))
    }

    pub fn by_environment(&self, environment: &str) -> Vec<ServiceInfo> {
        self.filter(|info| info.id.environment == environment)
    }

    pub fn by_node(&self, node: &NodeId) -> Vec<ServiceInfo> {
        self.filter(|info| &info.id.node == node)
    }

    pub fn count_active_for_task(&self, task_name: &str) -> usize {
        self.services
            .iter()
            .filter(|e| e.value().id.task_name == task_name && e.value().lifecycle.is_active())
            .count()
    }

    pub fn count_active_for_node(&self, node: &NodeId) -> usize {
        self.services
            .iter()
            .filter(|e| &e.value().id.node == node && e.value().lifecycle.is_active())
            .count()
    }

    /// Applies a lifecycle change, returning the previous lifecycle.
    pub fn apply_lifecycle(
        &self,
        unique_id: &uuid::Uuid,
        lifecycle: ServiceLifecycle,
    ) -> Result<ServiceLifecycle, ClusterError> {
        let mut entry = self
            .services
            .get_mut(unique_id)
            .ok_or_else(|| ClusterError::UnknownService(unique_id.to_string()))?;
        let previous = entry.lifecycle;
        entry.lifecycle = lifecycle;
        Ok(previous)
    }

    /// Marks every service of a vanished node as deleted and returns the
    /// affected records.
    pub fn mark_node_deleted(&self, node: &NodeId) -> Vec<ServiceInfo> {
        let mut affected = Vec::new();
        for mut entry in self.services.iter_mut() {
            let info = entry.value_mut();
            if &info.id.node == node && info.lifecycle != ServiceLifecycle::Deleted {
                info.lifecycle = ServiceLifecycle::Deleted;
                affected.push(info.clone());
            }
        }
        affected
    }

    pub fn remove(&self, unique_id: &uuid::Uuid) -> Option<ServiceInfo> {
        self.services.remove(unique_id).map(|(_, info)| info)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    fn filter<F: Fn(&ServiceInfo) -> bool>(&self, predicate: F) -> Vec<ServiceInfo> {
        self.services
            .iter()
            .filter(|e| predicate(e.value()))
            .map(|e| e.value().clone())
            .collect()
    }
}

/// Registry of service task templates.
#[derive(Default)]
pub struct ServiceTaskRegistry {
    tasks: DashMap<String, ServiceTask>,
}

impl ServiceTaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, task: ServiceTask) -> Option<ServiceTask> {
        self.tasks.insert(task.name.clone(), task)
    }

    pub fn get(&self, name: &str) -> Option<ServiceTask> {
        self.tasks.get(name).map(|e| e.value().clone())
    }

    pub fn all(&self) -> Vec<ServiceTask> {
        self.tasks.iter().map(|e| e.value().clone()).collect()
    }

    pub fn remove(&self, name: &str) -> Option<ServiceTask> {
        self.tasks.remove(name).map(|(_, task)| task)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Registry of service groups.
#[derive(Default)]
pub struct ServiceGroupRegistry {
    groups: DashMap<String, ServiceGroup>,
}

impl ServiceGroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, group: ServiceGroup) -> Option<ServiceGroup> {
        self.groups.insert(group.name.clone(), group)
    }

    pub fn get(&self, name: &str) -> Option<ServiceGroup> {
        self.groups.get(name).map(|e| e.value().clone())
    }

    pub fn all(&self) -> Vec<ServiceGroup> {
        self.groups.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

const LOCK_SHARDS: usize = 16;

/// Sharded mutex pool serializing operations by string key.
///
/// Invariants: a key always hashes to the same shard, distinct keys may
/// share a shard, and a holder must never acquire a second shard while
/// holding one.
pub struct LockPool {
    shards: Vec<Mutex<()>>,
}

impl LockPool {
    pub fn new() -> Self {
        Self::with_shards(LOCK_SHARDS)
    }

    pub fn with_shards(count: usize) -> Self {
        let shards = (0..count.max(1)).map(|_| Mutex::new(())).collect();
        Self { shards }
    }

    pub async fn lock(&self, key: &str) -> MutexGuard<'_, ()> {
        self.shards[self.shard_for(key)].lock().await
    }

    fn shard_for(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.shards.len()
    }
}

impl Default for LockPool {
    fn default() -> Self {
        Self::new()
    }
}
