//! What happens when a guarded unit or a whole service fails

use crate::common::config::FailurePolicyMode;
use crate::guardian::context::GuardContext;

/// A service the failure policy can stop
pub trait FailableService: Send + Sync {
    fn service_name(&self) -> String;
    fn stop(&self);
}

/// Reactions to guardian incidents
///
/// Callbacks run on a dedicated thread per incident and may block.
pub trait ServiceFailurePolicy: Send + Sync {
    /// Soft timeout missed
    fn on_guardable_recovery(&self, context: &GuardContext);

    /// Hard timeout missed
    fn on_guardable_terminate(&self, context: &GuardContext);

    /// A service could not be kept alive
    fn on_service_failed(&self, service: &dyn FailableService);
}

#[derive(Debug, Clone, Copy)]
pub struct DefaultServiceFailurePolicy {
    mode: FailurePolicyMode,
}

impl DefaultServiceFailurePolicy {
    pub fn new(mode: FailurePolicyMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> FailurePolicyMode {
        self.mode
    }
}

impl Default for DefaultServiceFailurePolicy {
    fn default() -> Self {
        Self::new(FailurePolicyMode::StopService)
    }
}

impl ServiceFailurePolicy for DefaultServiceFailurePolicy {
    fn on_guardable_recovery(&self, context: &GuardContext) {
        tracing::warn!(
            guardable = %context.name(),
            timeout_ms = context.timeout_ms(),
            "Guardable missed its soft timeout; attempting recovery"
        );
        context.guardable().recover();
    }

    fn on_guardable_terminate(&self, context: &GuardContext) {
        tracing::error!(
            guardable = %context.name(),
            timeout_ms = context.timeout_ms(),
            "Guardable missed its hard timeout; terminating"
        );
        context.guardable().terminate();
    }

    fn on_service_failed(&self, service: &dyn FailableService) {
        match self.mode {
            FailurePolicyMode::StopService => {
                tracing::error!(service = %service.service_name(), "Service failed; stopping");
                service.stop();
            }
            FailurePolicyMode::Logging => {
                tracing::error!(service = %service.service_name(), "Service failed");
            }
        }
    }
}
