//! Service load snapshots and their ordering

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Mutex;
use std::sync::PoisonError;

/// Immutable load snapshot published by one member
///
/// Equality and ordering are by the derived factors, not field by field:
/// two snapshots that load a member equally compare equal.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ServiceLoad {
    pub connection_count: u32,
    pub connection_pending: u32,
    /// Zero means unlimited
    pub connection_limit: u32,
    pub worker_count: u32,
    pub worker_active_count: u32,
    pub backlog_in: u32,
    pub backlog_out: u32,
}

impl ServiceLoad {
    /// Read a snapshot from a backlog signal
    pub fn sample(signal: &dyn BacklogSignal) -> Self {
        let (connection_count, connection_pending) = signal.connections();
        let (worker_count, worker_active_count) = signal.workers();
        let (backlog_in, backlog_out) = signal.backlog();
        Self {
            connection_count,
            connection_pending,
            connection_limit: signal.connection_limit(),
            worker_count,
            worker_active_count,
            backlog_in,
            backlog_out,
        }
    }

    /// Connection utilisation in per-mille of the limit, or the raw count
    /// when unlimited
    pub fn connection_factor(&self) -> u64 {
        let connections = self.connection_count as u64 + self.connection_pending as u64;
        if self.connection_limit == 0 {
            connections
        } else {
            connections * 1000 / self.connection_limit as u64
        }
    }

    /// Busy workers in per-mille of the pool
    pub fn worker_factor(&self) -> u64 {
        if self.worker_count == 0 {
            0
        } else {
            self.worker_active_count as u64 * 1000 / self.worker_count as u64
        }
    }

    pub fn backlog_factor(&self) -> u64 {
        self.backlog_in as u64 + self.backlog_out as u64
    }

    fn factors(&self) -> (u64, u64, u64) {
        (
            self.connection_factor(),
            self.worker_factor(),
            self.backlog_factor(),
        )
    }
}

impl PartialEq for ServiceLoad {
    fn eq(&self, other: &Self) -> bool {
        self.factors() == other.factors()
    }
}

impl Eq for ServiceLoad {}

impl PartialOrd for ServiceLoad {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ServiceLoad {
    fn cmp(&self, other: &Self) -> Ordering {
        self.factors().cmp(&other.factors())
    }
}

/// Source of raw load figures, usually the transport layer
pub trait BacklogSignal: Send + Sync {
    /// (established, pending) connections
    fn connections(&self) -> (u32, u32);
    fn connection_limit(&self) -> u32 {
        0
    }
    /// (pool size, busy)
    fn workers(&self) -> (u32, u32);
    /// (inbound, outbound) queued messages
    fn backlog(&self) -> (u32, u32);
}

/// Total order over loads; lighter loads sort first
pub trait LoadComparator: Send + Sync {
    fn compare(&self, a: &ServiceLoad, b: &ServiceLoad) -> Ordering;
}

/// Connection factor, then worker factor, then backlog
#[derive(Debug, Clone, Copy, Default)]
pub struct NaturalLoadOrder;

impl LoadComparator for NaturalLoadOrder {
    fn compare(&self, a: &ServiceLoad, b: &ServiceLoad) -> Ordering {
        a.cmp(b)
    }
}

/// Raw connection count only
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionCountOrder;

impl LoadComparator for ConnectionCountOrder {
    fn compare(&self, a: &ServiceLoad, b: &ServiceLoad) -> Ordering {
        let count = |l: &ServiceLoad| l.connection_count as u64 + l.connection_pending as u64;
        count(a).cmp(&count(b))
    }
}

/// Publishes local load only when it changed under the comparator
pub struct LoadPublisher<C: LoadComparator> {
    comparator: C,
    last: Mutex<Option<ServiceLoad>>,
}

impl<C: LoadComparator> LoadPublisher<C> {
    pub fn new(comparator: C) -> Self {
        Self {
            comparator,
            last: Mutex::new(None),
        }
    }

    /// Returns the load to publish, or `None` if it is unchanged
    pub fn offer(&self, load: ServiceLoad) -> Option<ServiceLoad> {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        let changed = match last.as_ref() {
            Some(prev) => self.comparator.compare(prev, &load) != Ordering::Equal,
            None => true,
        };
        if changed {
            *last = Some(load);
            Some(load)
        } else {
            None
        }
    }
}
