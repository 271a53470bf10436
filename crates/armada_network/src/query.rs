//! # Query correlation layer
//!
//! Adds request/response semantics on top of fire-and-forget frames. A query
//! frame carries a generated correlation id in its header; the matching
//! response carries the same id. In between, the id maps to a one-shot
//! completion slot with a deadline in the pending table.
//!
//! Exactly one fulfillment is permitted per id: the entry is removed the
//! moment a response claims it, so a late or duplicate response finds
//! nothing and is discarded. Entries are also removed on waiter timeout and
//! by a periodic sweep, so the table cannot leak.

use crate::channel::ChannelKey;
use armada_protocol::{DataBuf, ProtocolError};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};
use uuid::Uuid;

/// Default deadline for fire-and-wait queries.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// How often the sweeper reaps expired pending entries.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

const FLAG_QUERY: u8 = 0b0000_0001;
const FLAG_RESPONSE: u8 = 0b0000_0010;

/// What a frame header says about correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderKind {
    /// Plain fire-and-forget frame.
    Plain,
    /// Query expecting a response under the carried id.
    Query(Uuid),
    /// Response resolving the carried id.
    Response(Uuid),
}

/// Builds the header buffer for a query frame.
pub fn query_header(id: Uuid) -> DataBuf {
    correlation_header(FLAG_QUERY, id)
}

/// Builds the header buffer for a response frame.
pub fn response_header(id: Uuid) -> DataBuf {
    correlation_header(FLAG_RESPONSE, id)
}

fn correlation_header(flags: u8, id: Uuid) -> DataBuf {
    let mut header = DataBuf::with_capacity(17);
    // Writes to a fresh buffer cannot fail.
    let _ = header.write_u8(flags);
    let _ = header.write_unique_id(&id);
    header
}

/// Reads the correlation information out of a frame header.
///
/// An empty header is a plain frame; anything else starts with a flag byte
/// followed by the correlation id.
pub fn parse_header(header: &mut DataBuf) -> Result<HeaderKind, ProtocolError> {
    if header.readable_bytes() == 0 {
        return Ok(HeaderKind::Plain);
    }
    let flags = header.read_u8()?;
    if flags & FLAG_RESPONSE != 0 {
        Ok(HeaderKind::Response(header.read_unique_id()?))
    } else if flags & FLAG_QUERY != 0 {
        Ok(HeaderKind::Query(header.read_unique_id()?))
    } else {
        Ok(HeaderKind::Plain)
    }
}

struct PendingQuery {
    tx: oneshot::Sender<DataBuf>,
    deadline: Instant,
    channel: ChannelKey,
}

/// Point-in-time counters for the pending-query table.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryStatsSnapshot {
    pub pending: usize,
    pub completed: u64,
    pub timed_out: u64,
    pub failed: u64,
    pub stale_discarded: u64,
}

/// Correlation-id → completion-slot table shared by every channel.
pub struct QueryManager {
    pending: DashMap<Uuid, PendingQuery>,
    completed: AtomicU64,
    timed_out: AtomicU64,
    failed: AtomicU64,
    stale_discarded: AtomicU64,
    sweeper_running: AtomicBool,
}

impl QueryManager {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
            completed: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            stale_discarded: AtomicU64::new(0),
            sweeper_running: AtomicBool::new(false),
        }
    }

    /// Registers a pending query and returns its completion slot.
    pub fn register(&self, id: Uuid, channel: ChannelKey, ttl: Duration) -> oneshot::Receiver<DataBuf> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            id,
            PendingQuery {
                tx,
                deadline: Instant::now() + ttl,
                channel,
            },
        );
        rx
    }

    /// Fulfills a pending query. Returns `false` when no entry exists, which
    /// is how late and duplicate responses are detected and discarded.
    pub fn complete(&self, id: &Uuid, body: DataBuf) -> bool {
        match self.pending.remove(id) {
            Some((_, entry)) => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                // The waiter may have given up; that is not an error.
                let _ = entry.tx.send(body);
                true
            }
            None => {
                self.stale_discarded.fetch_add(1, Ordering::Relaxed);
                trace!(query_id = %id, "discarding response for unknown or already-completed query");
                false
            }
        }
    }

    /// Removes a pending entry after its waiter timed out.
    pub fn discard(&self, id: &Uuid) -> bool {
        let removed = self.pending.remove(id).is_some();
        if removed {
            self.timed_out.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Fails every pending query on a closing channel immediately, instead of
    /// leaving them to time out. Dropping the sender wakes the waiter with a
    /// receive error.
    pub fn fail_channel(&self, channel: ChannelKey) -> usize {
        let stale: Vec<Uuid> = self
            .pending
            .iter()
            .filter(|entry| entry.value().channel == channel)
            .map(|entry| *entry.key())
            .collect();
        let mut failed = 0;
        for id in stale {
            if self.pending.remove(&id).is_some() {
                failed += 1;
            }
        }
        if failed > 0 {
            self.failed.fetch_add(failed as u64, Ordering::Relaxed);
            debug!(channel = %channel, count = failed, "failed pending queries on channel close");
        }
        failed
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> QueryStatsSnapshot {
        QueryStatsSnapshot {
            pending: self.pending.len(),
            completed: self.completed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            stale_discarded: self.stale_discarded.load(Ordering::Relaxed),
        }
    }

    /// Reaps entries past their deadline. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<Uuid> = self
            .pending
            .iter()
            .filter(|entry| entry.value().deadline <= now)
            .map(|entry| *entry.key())
            .collect();
        let mut reaped = 0;
        for id in expired {
            if self.pending.remove(&id).is_some() {
                reaped += 1;
            }
        }
        if reaped > 0 {
            self.timed_out.fetch_add(reaped as u64, Ordering::Relaxed);
            debug!(count = reaped, "swept expired pending queries");
        }
        reaped
    }

    /// Starts the background sweep task. Idempotent.
    pub fn start_sweeper(self: &Arc<Self>, every: Duration) {
        if self.sweeper_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            while manager.sweeper_running.load(Ordering::SeqCst) {
                ticker.tick().await;
                manager.sweep_expired();
            }
        });
    }

    /// Stops the background sweep task after its current iteration.
    pub fn stop_sweeper(&self) {
        self.sweeper_running.store(false, Ordering::SeqCst);
    }
}

impl Default for QueryManager {
    fn default() -> Self {
        Self::new()
    }
}
