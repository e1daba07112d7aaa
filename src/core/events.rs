//! In-process publish/subscribe and the planner wakeup controller.
//!
//! The bus dispatches synchronously in the publisher's thread, so listeners
//! must be cheap (counter updates, flag setting). The subscriber list is
//! snapshotted outside the lock before dispatch, which lets a listener publish
//! follow-up events without deadlocking. No global singletons: the bus is
//! owned by the engine and handed to the components that need it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::debug;

/// Events flowing between workers, the wakeup controller, and the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    TaskCompleted { task_id: String },
    TaskFailed { task_id: String },
    PlannerWakeup { reason: String },
}

type Listener = Arc<dyn Fn(&EngineEvent) + Send + Sync>;

/// Process-wide, in-memory publish/subscribe.
#[derive(Default)]
pub struct EventBus {
    listeners: Mutex<Vec<Listener>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: impl Fn(&EngineEvent) + Send + Sync + 'static) {
        self.listeners
            .lock()
            .expect("event bus lock poisoned")
            .push(Arc::new(listener));
    }

    /// Invoke every listener synchronously with the event.
    pub fn publish(&self, event: &EngineEvent) {
        let snapshot: Vec<Listener> = self
            .listeners
            .lock()
            .expect("event bus lock poisoned")
            .clone();
        debug!(?event, listeners = snapshot.len(), "publishing event");
        for listener in snapshot {
            listener(event);
        }
    }
}

/// Reason carried on a `PlannerWakeup` event when the threshold trips.
pub const WAKEUP_THRESHOLD_REACHED: &str = "threshold_reached";

struct WakeupInner {
    threshold: u32,
    completed_since_plan: Mutex<u32>,
    pending: AtomicBool,
    enabled: AtomicBool,
    bus: Weak<EventBus>,
}

/// Counts completed tasks and raises a one-shot wakeup signal at a threshold.
///
/// The orchestrator consumes the signal exactly once per cycle, at the end of
/// the worker stage, via [`WakeupController::take_pending`].
#[derive(Clone)]
pub struct WakeupController {
    inner: Arc<WakeupInner>,
}

impl WakeupController {
    /// Create a controller and subscribe it to `task:completed` on the bus.
    pub fn attach(bus: &Arc<EventBus>, threshold: u32) -> Self {
        let controller = Self {
            inner: Arc::new(WakeupInner {
                threshold: threshold.max(1),
                completed_since_plan: Mutex::new(0),
                pending: AtomicBool::new(false),
                enabled: AtomicBool::new(true),
                bus: Arc::downgrade(bus),
            }),
        };
        let inner = Arc::clone(&controller.inner);
        bus.subscribe(move |event| {
            if let EngineEvent::TaskCompleted { .. } = event {
                WakeupController::on_task_completed(&inner);
            }
        });
        controller
    }

    fn on_task_completed(inner: &Arc<WakeupInner>) {
        if !inner.enabled.load(Ordering::SeqCst) {
            return;
        }
        let mut count = inner
            .completed_since_plan
            .lock()
            .expect("wakeup lock poisoned");
        *count += 1;
        if *count < inner.threshold {
            return;
        }
        *count = 0;
        drop(count);
        inner.pending.store(true, Ordering::SeqCst);
        if let Some(bus) = inner.bus.upgrade() {
            bus.publish(&EngineEvent::PlannerWakeup {
                reason: WAKEUP_THRESHOLD_REACHED.to_string(),
            });
        }
    }

    /// Raise the wakeup signal manually.
    pub fn trigger(&self, reason: &str) {
        self.inner.pending.store(true, Ordering::SeqCst);
        if let Some(bus) = self.inner.bus.upgrade() {
            bus.publish(&EngineEvent::PlannerWakeup {
                reason: reason.to_string(),
            });
        }
    }

    /// Consume the one-shot signal. Returns true at most once per raise.
    pub fn take_pending(&self) -> bool {
        self.inner.pending.swap(false, Ordering::SeqCst)
    }

    /// Reset the completed-task counter (after a planner run).
    pub fn reset(&self) {
        *self
            .inner
            .completed_since_plan
            .lock()
            .expect("wakeup lock poisoned") = 0;
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }
}
