//! Synchronous, priority-ordered event dispatch.
//!
//! [`Dispatcher`] runs every subscriber of an event kind on the calling thread, in registry
//! order, against one mutable event state. The subscriber set is snapshotted when a dispatch
//! starts, so registrations made by a running subscriber take effect on the next dispatch.
//!
//! A subscriber that returns an error or panics is logged, recorded as a
//! [`DiagnosticCategory::Subscriber`] warning, and skipped; the remaining subscribers still
//! run. Denial is just a flag on the state and never stops the loop.

use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use crate::{
    config::DispatchConfig,
    diagnostics::{Diagnostic, DiagnosticCategory, DiagnosticSeverity, Diagnostics},
    events::{kind::EventKind, registry::EventRegistry, state::EventState},
    Error,
};

/// Summary of one dispatch.
#[derive(Debug, Default)]
pub struct DispatchOutcome {
    /// Number of subscribers that were invoked, faulted ones included
    pub invoked: usize,
    /// Faults raised by subscribers, in invocation order
    pub faults: Vec<Error>,
}

impl DispatchOutcome {
    /// Returns true if every invoked subscriber completed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.faults.is_empty()
    }
}

/// Synchronous dispatch engine.
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
/// use dotpatch::config::DispatchConfig;
/// use dotpatch::diagnostics::Diagnostics;
/// use dotpatch::events::{
///     Deniable, Dispatcher, EventKind, EventRegistry, Priority, ReservedSlotCheck, Subscriber,
/// };
///
/// let registry = Arc::new(EventRegistry::new());
/// registry.register(
///     EventKind::RESERVED_SLOT,
///     Subscriber::typed("revoke", Priority::NORMAL, |ev: &mut ReservedSlotCheck| {
///         ev.deny();
///         Ok(())
///     }),
/// );
///
/// let dispatcher = Dispatcher::new(registry, Arc::new(Diagnostics::new()), DispatchConfig::default());
/// let ev = dispatcher.dispatch(&EventKind::RESERVED_SLOT, ReservedSlotCheck::new(true, "a@steam"));
/// assert!(!ev.is_allowed());
/// ```
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<EventRegistry>,
    diagnostics: Arc<Diagnostics>,
    config: DispatchConfig,
}

impl Dispatcher {
    /// Creates a dispatcher over `registry`, reporting faults to `diagnostics`.
    #[must_use]
    pub fn new(
        registry: Arc<EventRegistry>,
        diagnostics: Arc<Diagnostics>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            registry,
            diagnostics,
            config,
        }
    }

    /// The registry this dispatcher reads from.
    #[must_use]
    pub fn registry(&self) -> &Arc<EventRegistry> {
        &self.registry
    }

    /// Dispatches an owned payload and returns it finalized.
    pub fn dispatch<E: EventState>(&self, kind: &EventKind, mut state: E) -> E {
        self.dispatch_dyn(kind, &mut state);
        state
    }

    /// Dispatches a type-erased payload in place.
    pub fn dispatch_dyn(&self, kind: &EventKind, state: &mut dyn EventState) -> DispatchOutcome {
        let subscribers = self.registry.subscribers_for(kind);
        let mut outcome = DispatchOutcome::default();

        tracing::trace!(kind = %kind, subscribers = subscribers.len(), "dispatching");

        for subscriber in &subscribers {
            outcome.invoked += 1;

            let result = if self.config.catch_panics {
                match panic::catch_unwind(AssertUnwindSafe(|| subscriber.invoke(&mut *state))) {
                    Ok(result) => result.map_err(|e| e.to_string()),
                    Err(payload) => Err(panic_message(payload.as_ref())),
                }
            } else {
                subscriber.invoke(&mut *state).map_err(|e| e.to_string())
            };

            if let Err(message) = result {
                tracing::warn!(
                    kind = %kind,
                    subscriber = subscriber.name(),
                    error = %message,
                    "subscriber faulted"
                );

                if self.config.record_faults {
                    self.diagnostics.push(
                        Diagnostic::new(
                            DiagnosticSeverity::Warning,
                            DiagnosticCategory::Subscriber,
                            format!("'{}' faulted: {message}", subscriber.name()),
                        )
                        .with_event(kind.as_str()),
                    );
                }

                outcome.faults.push(Error::SubscriberFault {
                    kind: kind.to_string(),
                    subscriber: subscriber.name().to_string(),
                    message,
                });
            }
        }

        outcome
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_string()
    }
}
