//! Event kind to ordered subscriber set.
//!
//! Each event kind owns a `crossbeam_skiplist::SkipMap` keyed by `(priority, sequence)`.
//! The sequence number is drawn from one process-wide counter at registration time, so
//! iterating a kind's map yields subscribers in ascending priority with ties broken by
//! registration order. Readers never block writers: a dispatch walks a snapshot taken
//! from the skip list while extensions register and unregister concurrently.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use crossbeam_skiplist::SkipMap;
use dashmap::DashMap;

use crate::{
    events::{kind::EventKind, state::EventState},
    Error, Result,
};

/// Position of a subscriber in dispatch order.
///
/// Lower values run first. Subscribers with equal priority run in the order they were
/// registered.
///
/// # Predefined Priorities
///
/// | Constant | Value | Use Case |
/// |----------|-------|----------|
/// | [`FIRST`](Self::FIRST) | -1000 | Must observe the untouched state |
/// | [`EARLY`](Self::EARLY) | -500 | Adjusts the state for others |
/// | [`NORMAL`](Self::NORMAL) | 0 | Default |
/// | [`LATE`](Self::LATE) | 500 | Reacts to other subscribers |
/// | [`LAST`](Self::LAST) | 1000 | Must see the final decision |
///
/// ```rust
/// use dotpatch::events::Priority;
///
/// assert!(Priority::FIRST < Priority::NORMAL);
/// assert!(Priority(5) < Priority(10));
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub i32);

impl Priority {
    /// Runs before everything else (value: -1000).
    pub const FIRST: Self = Self(-1000);
    /// Runs early (value: -500).
    pub const EARLY: Self = Self(-500);
    /// Default priority (value: 0).
    pub const NORMAL: Self = Self(0);
    /// Runs late (value: 500).
    pub const LATE: Self = Self(500);
    /// Runs after everything else (value: 1000).
    pub const LAST: Self = Self(1000);
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Type alias for subscriber callbacks.
pub type SubscriberFn = dyn Fn(&mut dyn EventState) -> Result<()> + Send + Sync;

/// A named callback observing one event kind.
#[derive(Clone)]
pub struct Subscriber {
    name: Arc<str>,
    priority: Priority,
    callback: Arc<SubscriberFn>,
}

impl Subscriber {
    /// Creates a subscriber that receives the type-erased event state.
    pub fn new<F>(name: impl Into<Arc<str>>, priority: Priority, callback: F) -> Self
    where
        F: Fn(&mut dyn EventState) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            priority,
            callback: Arc::new(callback),
        }
    }

    /// Creates a subscriber for one concrete payload type.
    ///
    /// Dispatching any other payload to it is reported as
    /// [`Error::EventTypeMismatch`], which the dispatcher records as a fault.
    pub fn typed<E, F>(name: impl Into<Arc<str>>, priority: Priority, callback: F) -> Self
    where
        E: EventState,
        F: Fn(&mut E) -> Result<()> + Send + Sync + 'static,
    {
        Self::new(name, priority, move |state: &mut dyn EventState| {
            let found = state.type_name();
            match state.downcast_mut::<E>() {
                Some(event) => callback(event),
                None => Err(Error::EventTypeMismatch {
                    expected: std::any::type_name::<E>(),
                    found,
                }),
            }
        })
    }

    /// Subscriber name, used in logs and diagnostics.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Dispatch priority.
    #[must_use]
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Runs the callback.
    ///
    /// # Errors
    /// Whatever the callback returns.
    pub fn invoke(&self, state: &mut dyn EventState) -> Result<()> {
        (self.callback)(state)
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// Identifies one registration; returned by [`EventRegistry::register`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    kind: EventKind,
    key: (Priority, u64),
}

impl SubscriptionHandle {
    /// The event kind of the registration.
    #[must_use]
    pub fn kind(&self) -> &EventKind {
        &self.kind
    }

    /// The registration priority.
    #[must_use]
    pub fn priority(&self) -> Priority {
        self.key.0
    }
}

type SubscriberMap = SkipMap<(Priority, u64), Arc<Subscriber>>;

/// Process-scoped map from event kind to its ordered subscribers.
#[derive(Default)]
pub struct EventRegistry {
    kinds: DashMap<EventKind, Arc<SubscriberMap>>,
    sequence: AtomicU64,
}

impl EventRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a subscriber to `kind`.
    pub fn register(&self, kind: EventKind, subscriber: Subscriber) -> SubscriptionHandle {
        let key = (
            subscriber.priority,
            self.sequence.fetch_add(1, Ordering::Relaxed),
        );
        tracing::debug!(
            kind = %kind,
            subscriber = subscriber.name(),
            priority = %subscriber.priority,
            "registering subscriber"
        );

        let map = self
            .kinds
            .entry(kind.clone())
            .or_insert_with(|| Arc::new(SkipMap::new()))
            .clone();
        map.insert(key, Arc::new(subscriber));

        SubscriptionHandle { kind, key }
    }

    /// Shorthand for registering a closure over the type-erased state.
    pub fn register_fn<F>(
        &self,
        kind: EventKind,
        name: impl Into<Arc<str>>,
        priority: Priority,
        callback: F,
    ) -> SubscriptionHandle
    where
        F: Fn(&mut dyn EventState) -> Result<()> + Send + Sync + 'static,
    {
        self.register(kind, Subscriber::new(name, priority, callback))
    }

    /// Removes a registration. Returns `false` if it was already removed.
    pub fn unregister(&self, handle: &SubscriptionHandle) -> bool {
        let Some(map) = self.kinds.get(&handle.kind).map(|m| Arc::clone(m.value())) else {
            return false;
        };
        let removed = map.remove(&handle.key).is_some();
        if removed {
            tracing::debug!(kind = %handle.kind, "unregistered subscriber");
        }
        removed
    }

    /// Snapshot of the subscribers of `kind`, in dispatch order.
    ///
    /// Registrations made after the snapshot is taken do not affect it.
    #[must_use]
    pub fn subscribers_for(&self, kind: &EventKind) -> Vec<Arc<Subscriber>> {
        let Some(map) = self.kinds.get(kind).map(|m| Arc::clone(m.value())) else {
            return Vec::new();
        };
        map.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    /// Number of subscribers of `kind`.
    #[must_use]
    pub fn len(&self, kind: &EventKind) -> usize {
        self.kinds.get(kind).map_or(0, |m| m.len())
    }

    /// Number of subscribers across all kinds.
    #[must_use]
    pub fn total(&self) -> usize {
        self.kinds.iter().map(|m| m.len()).sum()
    }

    /// Returns true if no kind has subscribers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Removes every subscriber of every kind.
    pub fn clear(&self) {
        self.kinds.clear();
    }
}

impl fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRegistry")
            .field("kinds", &self.kinds.len())
            .field("subscribers", &self.total())
            .finish()
    }
}
