//! # Cluster data sync
//!
//! Replicated tables register a [`DataSyncHandler`] keyed by name. A sync
//! payload carries every handler's serialized elements; applying a payload
//! runs each element through the owning handler, which either takes the
//! received version or keeps its local one. Kept elements are echoed back
//! force-flagged, so the original sender converges onto the authoritative
//! data. Replication is best effort and last-writer biased, there is no
//! consensus round.

use crate::error::ClusterError;
use armada_protocol::DataBuf;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// Outcome of applying one received element.
pub enum SyncApplied {
    /// The received element was taken over (or matched local state).
    Applied,
    /// Local state won the conflict; carries the serialized local element
    /// to echo back to the sender.
    Kept(DataBuf),
}

/// One replicated table's bridge into the sync machinery.
pub trait DataSyncHandler: Send + Sync {
    /// Stable name of the table this handler syncs.
    fn key(&self) -> &str;

    /// When set, received elements always overwrite local state and the
    /// comparison step is skipped.
    fn always_force(&self) -> bool {
        false
    }

    /// Serializes every local element.
    fn collect(&self) -> Result<Vec<DataBuf>, ClusterError>;

    /// Applies one received element. Implementations compare against local
    /// state when `force` is false and decide which version survives.
    fn apply(&self, element: &mut DataBuf, force: bool) -> Result<SyncApplied, ClusterError>;
}

/// Registry of sync handlers, keyed by table name.
#[derive(Default)]
pub struct DataSyncRegistry {
    handlers: DashMap<String, Arc<dyn DataSyncHandler>>,
}

impl DataSyncRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handler: Arc<dyn DataSyncHandler>) {
        let key = handler.key().to_string();
        if self.handlers.insert(key.clone(), handler).is_some() {
            debug!(key, "sync handler replaced");
        }
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Registered table names, sorted for a stable wire order.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Serializes all registered tables into one sync payload.
    ///
    /// Layout: `bool force | varint sections | (string key | varint count |
    /// nested element ...)*`.
    pub fn serialize_all(&self, force: bool) -> Result<DataBuf, ClusterError> {
        let handlers: Vec<Arc<dyn DataSyncHandler>> =
            self.handlers.iter().map(|e| e.value().clone()).collect();

        let mut out = DataBuf::new();
        out.write_bool(force)?;
        out.write_var_u64(handlers.len() as u64)?;
        for handler in handlers {
            let elements = handler.collect()?;
            out.write_string(handler.key())?;
            out.write_var_u64(elements.len() as u64)?;
            for element in &elements {
                out.write_buf(element)?;
            }
        }
        Ok(out)
    }

    /// Applies a received sync payload. Sections without a registered
    /// handler are skipped whole. Returns the force-flagged echo payload of
    /// kept-local elements, if any survived their comparison.
    pub fn apply_all(&self, payload: &mut DataBuf) -> Result<Option<DataBuf>, ClusterError> {
        let force_flag = payload.read_bool()?;
        let section_count = payload.read_var_u64()?;
        let mut kept_sections: Vec<(String, Vec<DataBuf>)> = Vec::new();

        for _ in 0..section_count {
            let key = payload.read_string()?;
            let element_count = payload.read_var_u64()?;
            let Some(handler) = self.handlers.get(&key).map(|e| e.value().clone()) else {
                debug!(key, elements = element_count, "no sync handler, skipping section");
                for _ in 0..element_count {
                    let _ = payload.read_buf()?;
                }
                continue;
            };

            let force = force_flag || handler.always_force();
            let mut kept = Vec::new();
            for _ in 0..element_count {
                let mut element = payload.read_buf()?;
                match handler.apply(&mut element, force)? {
                    SyncApplied::Applied => {}
                    SyncApplied::Kept(local) => kept.push(local),
                }
            }
            trace!(key, kept = kept.len(), "sync section applied");
            if !kept.is_empty() {
                kept_sections.push((key, kept));
            }
        }

        if kept_sections.is_empty() {
            return Ok(None);
        }
        let mut echo = DataBuf::new();
        echo.write_bool(true)?;
        echo.write_var_u64(kept_sections.len() as u64)?;
        for (key, elements) in &kept_sections {
            echo.write_string(key)?;
            echo.write_var_u64(elements.len() as u64)?;
            for element in elements {
                echo.write_buf(element)?;
            }
        }
        Ok(Some(echo))
    }
}
