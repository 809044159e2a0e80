//! Typed, ordered, cancellable event pipeline.
//!
//! Extensions program against this module: they register subscribers for an
//! [`EventKind`] at a [`Priority`], and a patched call site dispatches a capability-tagged
//! [`EventState`] through the [`Dispatcher`]. Subscribers run synchronously in ascending
//! priority, faults are isolated, and whatever decision and parameters the state holds
//! after the last subscriber is what the call site observes.
//!
//! # Key Components
//!
//! - [`EventRegistry`] - Lock-free ordered subscriber sets per kind
//! - [`Dispatcher`] - Runs subscribers and isolates their faults
//! - [`EventState`] with [`Deniable`], [`ActorBound`], [`MutableParameters`] - Payload
//!   capabilities
//! - [`ReservedSlotCheck`], [`DamagingDoor`], [`JailbirdChangedWearState`],
//!   [`SpawningRagdoll`] - Built-in payloads

mod args;
mod dispatch;
mod kind;
mod registry;
mod state;

pub use args::{
    DamagingDoor, DoorDamageType, JailbirdChangedWearState, JailbirdWearState,
    ReservedSlotCheck, SpawningRagdoll,
};
pub use dispatch::{DispatchOutcome, Dispatcher};
pub use kind::EventKind;
pub use registry::{EventRegistry, Priority, Subscriber, SubscriberFn, SubscriptionHandle};
pub use state::{
    Actor, ActorBound, Capabilities, Deniable, EventState, MutableParameters, ParamValue,
};
