//! Guardian scan loop
//!
//! The scan walks every registered context and moves it through
//! Healthy → Recovery → Terminating based on how long ago it last
//! heartbeated. Transitions use compare-and-swap on the context state, so a
//! context is recovered once per missed soft deadline and terminated at most
//! once, regardless of concurrent heartbeats or releases.
//!
//! Failure policy callbacks never run on the scan task: each incident gets
//! its own named thread.

use crate::common::clock::{Clock, SystemClock};
use crate::common::config::GuardianConfig;
use crate::common::{Error, Result};
use crate::guardian::context::{GuardContext, GuardState, Guardable, Registry};
use crate::guardian::failure::{FailableService, ServiceFailurePolicy};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy)]
enum Incident {
    Recovery,
    Terminate,
}

pub struct Guardian {
    config: GuardianConfig,
    clock: Arc<dyn Clock>,
    policy: Arc<dyn ServiceFailurePolicy>,
    registry: Arc<Registry>,
    next_id: AtomicU64,
    incidents: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
    // Bumped by every start so a scan loop left over from before a stop exits
    epoch: AtomicU64,
    wake: Notify,
}

impl Guardian {
    pub fn new(config: GuardianConfig, policy: Arc<dyn ServiceFailurePolicy>) -> Self {
        Self::with_clock(config, policy, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(
        config: GuardianConfig,
        policy: Arc<dyn ServiceFailurePolicy>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            clock,
            policy,
            registry: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            incidents: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            wake: Notify::new(),
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Guard with the configured timeout and recover fraction
    pub fn guard(&self, guardable: Arc<dyn Guardable>) -> Result<Option<Arc<GuardContext>>> {
        self.guard_with(guardable, self.config.timeout_ms, self.config.recover_fraction)
    }

    /// Register a guardable
    ///
    /// Returns `Ok(None)` when the guardian is disabled or full.
    pub fn guard_with(
        &self,
        guardable: Arc<dyn Guardable>,
        timeout_ms: u64,
        recover_fraction: f32,
    ) -> Result<Option<Arc<GuardContext>>> {
        if timeout_ms == 0 {
            return Err(Error::InvalidConfig("guard timeout must be > 0".into()));
        }
        if !(recover_fraction > 0.0 && recover_fraction <= 1.0) {
            return Err(Error::InvalidConfig(format!(
                "recover fraction must be in (0, 1], got {}",
                recover_fraction
            )));
        }
        if !self.config.enabled {
            return Ok(None);
        }

        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        if registry.len() >= self.config.max_guardables {
            tracing::warn!(
                guardable = %guardable.name(),
                limit = self.config.max_guardables,
                "Guardian full; not guarding"
            );
            return Ok(None);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let context = Arc::new(GuardContext::new(
            id,
            Arc::clone(&guardable),
            Arc::clone(&self.clock),
            Arc::downgrade(&self.registry),
            timeout_ms,
            recover_fraction,
        ));
        registry.insert(id, Arc::clone(&context));
        drop(registry);

        guardable.set_context(Some(Arc::downgrade(&context)));
        tracing::debug!(guardable = %guardable.name(), timeout_ms, "Guarding");
        self.wake.notify_one();
        Ok(Some(context))
    }

    pub fn guarded_count(&self) -> usize {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Run one scan; returns the delay in milliseconds until the next one
    pub fn check(&self) -> u64 {
        let now = self.clock.now_millis();
        let contexts: Vec<Arc<GuardContext>> = self
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let mut next = self.config.scan_interval_ms;
        for context in contexts {
            let beat = context.last_beat();
            let since = now.saturating_sub(beat.at);

            match context.state() {
                GuardState::Healthy => {
                    if since > beat.soft_ms {
                        if context.transition(GuardState::Healthy, GuardState::Recovery) {
                            context.set_incident_beat(beat.at);
                            tracing::warn!(
                                guardable = %context.name(),
                                since_ms = since,
                                soft_ms = beat.soft_ms,
                                "Soft timeout"
                            );
                            self.dispatch(Incident::Recovery, context);
                        }
                        next = next.min(beat.hard_ms.saturating_sub(since) + 1);
                    } else {
                        next = next.min(beat.soft_ms - since + 1);
                    }
                }
                GuardState::Recovery => {
                    if beat.at > context.incident_beat() {
                        if context.transition(GuardState::Recovery, GuardState::Healthy) {
                            tracing::info!(guardable = %context.name(), "Guardable recovered");
                        }
                        next = next.min(beat.soft_ms.saturating_sub(since) + 1);
                    } else if since > beat.hard_ms {
                        if context.transition(GuardState::Recovery, GuardState::Terminating) {
                            tracing::error!(
                                guardable = %context.name(),
                                since_ms = since,
                                hard_ms = beat.hard_ms,
                                "Hard timeout"
                            );
                            context.deregister();
                            self.dispatch(Incident::Terminate, context);
                        }
                    } else {
                        next = next.min(beat.hard_ms - since + 1);
                    }
                }
                GuardState::Terminating | GuardState::Released => {}
            }
        }
        next.max(1)
    }

    fn spawn_incident<F>(&self, name: String, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match std::thread::Builder::new().name(name.clone()).spawn(f) {
            Ok(handle) => {
                let mut incidents = self.incidents.lock().unwrap_or_else(PoisonError::into_inner);
                incidents.retain(|h| !h.is_finished());
                incidents.push(handle);
            }
            Err(e) => {
                tracing::error!(thread = %name, error = %e, "Failed to spawn incident thread");
            }
        }
    }

    fn dispatch(&self, incident: Incident, context: Arc<GuardContext>) {
        let policy = Arc::clone(&self.policy);
        let name = match incident {
            Incident::Recovery => format!("guardian-recover-{}", context.id()),
            Incident::Terminate => format!("guardian-terminate-{}", context.id()),
        };
        self.spawn_incident(name, move || match incident {
            Incident::Recovery => policy.on_guardable_recovery(&context),
            Incident::Terminate => policy.on_guardable_terminate(&context),
        });
    }

    /// Report an unrecoverable service failure to the failure policy
    pub fn service_failed(&self, service: Arc<dyn FailableService>) {
        let policy = Arc::clone(&self.policy);
        let name = format!("guardian-failed-{}", service.service_name());
        self.spawn_incident(name, move || policy.on_service_failed(service.as_ref()));
    }

    /// Wait for every incident callback started so far
    pub fn join_incidents(&self) -> usize {
        let handles = std::mem::take(
            &mut *self.incidents.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let count = handles.len();
        for handle in handles {
            if handle.join().is_err() {
                tracing::warn!("Incident callback panicked");
            }
        }
        count
    }

    /// Release every registered context
    pub fn release_all(&self) {
        let contexts: Vec<Arc<GuardContext>> = self
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for context in contexts {
            context.release();
        }
    }

    /// Spawn the periodic scan on the tokio runtime
    ///
    /// Restarting a stopped guardian is allowed.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        self.stopped.store(false, Ordering::Release);
        let guardian = Arc::clone(self);
        tokio::spawn(async move {
            tracing::info!(
                scan_interval_ms = guardian.config.scan_interval_ms,
                epoch,
                "Guardian started"
            );
            while !guardian.stopped.load(Ordering::Acquire)
                && guardian.epoch.load(Ordering::Acquire) == epoch
            {
                let wait = guardian.check();
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(wait)) => {}
                    _ = guardian.wake.notified() => {}
                }
            }
            tracing::info!("Guardian stopped");
        })
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.wake.notify_waiters();
        self.wake.notify_one();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}
