//! The pod-visible lifecycle object.
//!
//! Pack code reads this to cooperate with graceful shutdown: current phase,
//! whether shutdown has been requested, why, and how much of the grace
//! period remains. Handlers registered with `on_shutdown` run when the stop
//! begins.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};

/// Phase of an isolate's life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Bundle materialized, isolate starting.
    Initializing,
    /// User code running.
    Running,
    /// Stop requested; handlers running, grace period ticking.
    Stopping,
    /// Isolate gone.
    Terminated,
}

type ShutdownHandler = Box<dyn Fn() + Send + Sync>;

/// Lifecycle state shared with pack code.
pub struct PodLifecycle {
    phase: RwLock<Phase>,
    shutdown_reason: RwLock<Option<String>>,
    shutdown_requested_at: RwLock<Option<DateTime<Utc>>>,
    grace_deadline: RwLock<Option<DateTime<Utc>>>,
    handlers: Mutex<Vec<ShutdownHandler>>,
}

impl Default for PodLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl PodLifecycle {
    /// A fresh lifecycle in `Initializing`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            phase: RwLock::new(Phase::Initializing),
            shutdown_reason: RwLock::new(None),
            shutdown_requested_at: RwLock::new(None),
            grace_deadline: RwLock::new(None),
            handlers: Mutex::new(Vec::new()),
        }
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        *self.phase.read()
    }

    /// Whether a stop has been requested.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        matches!(self.phase(), Phase::Stopping | Phase::Terminated)
    }

    /// Why the pod is stopping, once it is.
    #[must_use]
    pub fn shutdown_reason(&self) -> Option<String> {
        self.shutdown_reason.read().clone()
    }

    /// When the stop was requested.
    #[must_use]
    pub fn shutdown_requested_at(&self) -> Option<DateTime<Utc>> {
        *self.shutdown_requested_at.read()
    }

    /// Milliseconds left before force-termination, while stopping.
    #[must_use]
    pub fn graceful_shutdown_remaining_ms(&self) -> Option<u64> {
        let deadline = (*self.grace_deadline.read())?;
        let remaining = deadline - Utc::now();
        Some(u64::try_from(remaining.num_milliseconds().max(0)).unwrap_or(0))
    }

    /// Register a handler invoked when shutdown begins. Registering after
    /// shutdown has begun invokes the handler immediately.
    pub fn on_shutdown(&self, handler: impl Fn() + Send + Sync + 'static) {
        if self.is_shutting_down() {
            handler();
        } else {
            self.handlers.lock().push(Box::new(handler));
        }
    }

    /// Mark the isolate running.
    pub fn mark_running(&self) {
        *self.phase.write() = Phase::Running;
    }

    /// Begin shutdown: set the phase, stamp the reason and deadline, and
    /// invoke registered handlers.
    pub fn begin_shutdown(&self, reason: &str, grace_period_ms: u64) {
        {
            let mut phase = self.phase.write();
            if matches!(*phase, Phase::Stopping | Phase::Terminated) {
                return;
            }
            *phase = Phase::Stopping;
        }
        *self.shutdown_reason.write() = Some(reason.to_string());
        let now = Utc::now();
        *self.shutdown_requested_at.write() = Some(now);
        *self.grace_deadline.write() = Some(
            now + chrono::Duration::milliseconds(
                i64::try_from(grace_period_ms).unwrap_or(i64::MAX),
            ),
        );

        let handlers = std::mem::take(&mut *self.handlers.lock());
        for handler in &handlers {
            handler();
        }
    }

    /// Mark the isolate gone.
    pub fn mark_terminated(&self) {
        *self.phase.write() = Phase::Terminated;
    }
}
