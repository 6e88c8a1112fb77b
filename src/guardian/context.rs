//! Guarded execution units and their heartbeat state

use crate::common::clock::Clock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

pub(crate) type Registry = RwLock<HashMap<u64, Arc<GuardContext>>>;

/// Something the guardian watches
///
/// Implementations receive their context through `set_context` and must only
/// keep the `Weak` reference; the guardian owns the context.
pub trait Guardable: Send + Sync {
    fn name(&self) -> String;

    /// Attempt to unstick the unit; called once per missed soft deadline
    fn recover(&self);

    /// Give up on the unit; called at most once
    fn terminate(&self);

    /// Called with the context on registration and `None` on release
    fn set_context(&self, _context: Option<Weak<GuardContext>>) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GuardState {
    Healthy = 0,
    Recovery = 1,
    Terminating = 2,
    /// Deregistered by its owner
    Released = 3,
}

impl GuardState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => GuardState::Healthy,
            1 => GuardState::Recovery,
            2 => GuardState::Terminating,
            _ => GuardState::Released,
        }
    }
}

impl fmt::Display for GuardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GuardState::Healthy => "healthy",
            GuardState::Recovery => "recovery",
            GuardState::Terminating => "terminating",
            GuardState::Released => "released",
        };
        f.write_str(s)
    }
}

/// Soft timeout for a hard timeout and recover fraction
pub fn soft_timeout(timeout_ms: u64, recover_fraction: f32) -> u64 {
    ((timeout_ms as f64 * recover_fraction as f64) as u64).max(1)
}

/// The most recent heartbeat and the deadlines it set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Beat {
    pub at: u64,
    pub soft_ms: u64,
    pub hard_ms: u64,
}

pub struct GuardContext {
    id: u64,
    guardable: Arc<dyn Guardable>,
    clock: Arc<dyn Clock>,
    registry: Weak<Registry>,
    timeout_ms: u64,
    recover_fraction: f32,
    beat: Mutex<Beat>,
    state: AtomicU8,
    /// Heartbeat time whose soft deadline triggered the current recovery
    incident_beat: AtomicU64,
}

impl GuardContext {
    pub(crate) fn new(
        id: u64,
        guardable: Arc<dyn Guardable>,
        clock: Arc<dyn Clock>,
        registry: Weak<Registry>,
        timeout_ms: u64,
        recover_fraction: f32,
    ) -> Self {
        let now = clock.now_millis();
        Self {
            id,
            guardable,
            clock,
            registry,
            timeout_ms,
            recover_fraction,
            beat: Mutex::new(Beat {
                at: now,
                soft_ms: soft_timeout(timeout_ms, recover_fraction),
                hard_ms: timeout_ms,
            }),
            state: AtomicU8::new(GuardState::Healthy as u8),
            incident_beat: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn guardable(&self) -> &Arc<dyn Guardable> {
        &self.guardable
    }

    pub fn name(&self) -> String {
        self.guardable.name()
    }

    /// Default hard timeout
    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    /// Default soft timeout
    pub fn soft_timeout_ms(&self) -> u64 {
        soft_timeout(self.timeout_ms, self.recover_fraction)
    }

    pub fn state(&self) -> GuardState {
        GuardState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn last_beat(&self) -> Beat {
        *self.beat.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Signal progress with the default timeouts
    pub fn heartbeat(&self) {
        self.heartbeat_at(self.clock.now_millis(), None);
    }

    /// Signal progress and use `timeout_ms` as the timeout until the next beat
    pub fn heartbeat_with(&self, timeout_ms: u64) {
        self.heartbeat_at(self.clock.now_millis(), Some(timeout_ms));
    }

    /// Record a heartbeat taken at `at`
    ///
    /// A heartbeat older than the one already recorded is ignored. Returns
    /// whether it was recorded.
    pub fn heartbeat_at(&self, at: u64, timeout_ms: Option<u64>) -> bool {
        let (soft_ms, hard_ms) = match timeout_ms {
            Some(ms) if ms > 0 => (soft_timeout(ms, self.recover_fraction), ms),
            _ => (self.soft_timeout_ms(), self.timeout_ms),
        };
        let mut beat = self.beat.lock().unwrap_or_else(PoisonError::into_inner);
        if at < beat.at {
            return false;
        }
        *beat = Beat {
            at,
            soft_ms,
            hard_ms,
        };
        true
    }

    /// Stop guarding this unit
    ///
    /// Has no effect once termination has started: an in-flight termination
    /// always completes.
    pub fn release(&self) {
        loop {
            let current = self.state.load(Ordering::Acquire);
            if current == GuardState::Terminating as u8 || current == GuardState::Released as u8 {
                return;
            }
            if self
                .state
                .compare_exchange(
                    current,
                    GuardState::Released as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                break;
            }
        }
        self.deregister();
        tracing::debug!(guardable = %self.name(), "Guardable released");
    }

    pub(crate) fn deregister(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.id);
        }
        self.guardable.set_context(None);
    }

    pub(crate) fn transition(&self, from: GuardState, to: GuardState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn incident_beat(&self) -> u64 {
        self.incident_beat.load(Ordering::Acquire)
    }

    pub(crate) fn set_incident_beat(&self, at: u64) {
        self.incident_beat.store(at, Ordering::Release);
    }
}

impl fmt::Debug for GuardContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuardContext")
            .field("id", &self.id)
            .field("guardable", &self.guardable.name())
            .field("state", &self.state())
            .field("beat", &self.last_beat())
            .finish()
    }
}
