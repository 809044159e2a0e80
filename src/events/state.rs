//! Capability-tagged event state.
//!
//! An event state is the mutable object threaded through one dispatch. Instead of a class
//! hierarchy, each payload type opts into orthogonal capabilities:
//!
//! - [`Deniable`] - a decision flag subscribers may clear; the final value is what the
//!   patched call site observes
//! - [`ActorBound`] - a shared, read-only reference to the acting entity
//! - [`MutableParameters`] - named values subscribers may overwrite, last write wins
//!
//! The dispatcher and the interception natives only ever see `dyn EventState` and query
//! capabilities through the `as_*` accessors. Subscribers that know the concrete payload
//! downcast with [`EventState::downcast_mut`](trait.EventState.html#method.downcast_mut).

use std::{any::Any, fmt, sync::Arc};

use bitflags::bitflags;

use crate::Result;

bitflags! {
    /// Capabilities implemented by an event state.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capabilities: u8 {
        /// Has a decision flag
        const DENIABLE = 0x01;
        /// Carries an acting entity
        const ACTOR_BOUND = 0x02;
        /// Has named, writable parameters
        const MUTABLE_PARAMETERS = 0x04;
    }
}

/// The acting entity of an event (a player, in the host's terms).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Actor {
    /// Session-local id
    pub id: u32,
    /// Display name
    pub nickname: String,
    /// Stable account id
    pub user_id: String,
}

impl Actor {
    /// Creates a shared actor reference.
    pub fn shared(id: u32, nickname: impl Into<String>, user_id: impl Into<String>) -> Arc<Self> {
        Arc::new(Actor {
            id,
            nickname: nickname.into(),
            user_id: user_id.into(),
        })
    }
}

/// Decision capability.
///
/// The flag starts at a payload-specific default (usually `true`). Denial does not stop
/// dispatch: later subscribers still run and may even allow again.
pub trait Deniable {
    /// Current decision.
    fn is_allowed(&self) -> bool;

    /// Overwrites the decision.
    fn set_allowed(&mut self, allowed: bool);

    /// Shorthand for `set_allowed(false)`.
    fn deny(&mut self) {
        self.set_allowed(false);
    }
}

/// Actor capability. The reference is fixed at construction.
pub trait ActorBound {
    /// The acting entity, if the host supplied one.
    fn actor(&self) -> Option<&Arc<Actor>>;
}

/// Value of a mutable event parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    /// Boolean value
    Bool(bool),
    /// Integer value
    Int(i64),
    /// Floating point value
    Float(f64),
    /// String value
    Str(Arc<str>),
}

impl ParamValue {
    /// Name of the value's type, for error messages.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            ParamValue::Bool(_) => "bool",
            ParamValue::Int(_) => "int",
            ParamValue::Float(_) => "float",
            ParamValue::Str(_) => "string",
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(v) => write!(f, "{v}"),
            ParamValue::Int(v) => write!(f, "{v}"),
            ParamValue::Float(v) => write!(f, "{v}"),
            ParamValue::Str(v) => write!(f, "{v:?}"),
        }
    }
}

/// Mutable-parameter capability.
pub trait MutableParameters {
    /// Names of all writable parameters.
    fn parameter_names(&self) -> &'static [&'static str];

    /// Reads a parameter.
    fn parameter(&self, name: &str) -> Option<ParamValue>;

    /// Writes a parameter.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidParameter`] for unknown names or mismatched types.
    fn set_parameter(&mut self, name: &str, value: ParamValue) -> Result<()>;
}

/// An event payload threaded through one dispatch.
///
/// Implementors override the `as_*` accessors of the capabilities they have; the defaults
/// report the capability as absent.
pub trait EventState: Any + Send {
    /// Type name of the concrete payload.
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Decision capability.
    fn as_deniable(&self) -> Option<&dyn Deniable> {
        None
    }

    /// Mutable decision capability.
    fn as_deniable_mut(&mut self) -> Option<&mut dyn Deniable> {
        None
    }

    /// Actor capability.
    fn as_actor_bound(&self) -> Option<&dyn ActorBound> {
        None
    }

    /// Parameter capability.
    fn as_parameters(&self) -> Option<&dyn MutableParameters> {
        None
    }

    /// Mutable parameter capability.
    fn as_parameters_mut(&mut self) -> Option<&mut dyn MutableParameters> {
        None
    }

    /// Upcast for downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Mutable upcast for downcasting.
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Capabilities this payload implements.
    fn capabilities(&self) -> Capabilities {
        let mut caps = Capabilities::empty();
        if self.as_deniable().is_some() {
            caps |= Capabilities::DENIABLE;
        }
        if self.as_actor_bound().is_some() {
            caps |= Capabilities::ACTOR_BOUND;
        }
        if self.as_parameters().is_some() {
            caps |= Capabilities::MUTABLE_PARAMETERS;
        }
        caps
    }
}

impl dyn EventState {
    /// Downcasts to the concrete payload type.
    pub fn downcast_ref<T: EventState>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    /// Downcasts to the concrete payload type.
    pub fn downcast_mut<T: EventState>(&mut self) -> Option<&mut T> {
        self.as_any_mut().downcast_mut::<T>()
    }

    /// The decision, if the payload is deniable.
    pub fn is_allowed(&self) -> Option<bool> {
        self.as_deniable().map(Deniable::is_allowed)
    }

    /// The actor, if the payload is actor-bound.
    pub fn actor(&self) -> Option<&Arc<Actor>> {
        self.as_actor_bound().and_then(ActorBound::actor)
    }

    /// A parameter value, if the payload has it.
    pub fn parameter(&self, name: &str) -> Option<ParamValue> {
        self.as_parameters().and_then(|p| p.parameter(name))
    }
}

impl fmt::Debug for dyn EventState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{:?}]", self.type_name(), self.capabilities())
    }
}
