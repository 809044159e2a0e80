//! Runtime values of the interpreter.

use std::{
    fmt,
    sync::{Arc, Mutex},
};

use crate::{
    events::{EventState, ParamValue},
    metadata::token::Token,
    Error, Result,
};

/// An event object living on the interpreter heap.
///
/// Event states are shared between the evaluation stack (after `dup`) and the natives that
/// dispatch them, so they sit behind a reference count and a mutex.
pub type EventRef = Arc<Mutex<Box<dyn EventState>>>;

/// Runtime value on the evaluation stack, in arguments and in locals.
///
/// | CIL type | Variant |
/// |----------|---------|
/// | `bool`, `int8` .. `int32` | [`EmValue::I32`] |
/// | `int64` | [`EmValue::I64`] |
/// | `float32`, `float64` | [`EmValue::F64`] |
/// | `string` | [`EmValue::Str`] |
/// | event objects | [`EmValue::Event`] |
/// | other objects | [`EmValue::Object`] |
/// | `null` | [`EmValue::Null`] |
#[derive(Clone)]
pub enum EmValue {
    /// Null reference, also the initial value of locals.
    Null,
    /// 32-bit integer; booleans are `0` and `1`.
    I32(i32),
    /// 64-bit integer.
    I64(i64),
    /// Floating point number.
    F64(f64),
    /// String reference.
    Str(Arc<str>),
    /// Event object created through the event bridge.
    Event(EventRef),
    /// Opaque object of the given class; exceptions are objects.
    Object(Token),
}

impl EmValue {
    /// Wraps an event state into a heap value.
    pub fn event(state: impl EventState) -> Self {
        EmValue::Event(Arc::new(Mutex::new(Box::new(state))))
    }

    /// CIL boolean.
    #[must_use]
    pub fn bool(value: bool) -> Self {
        EmValue::I32(i32::from(value))
    }

    /// Name of the variant, for error messages.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            EmValue::Null => "null",
            EmValue::I32(_) => "int32",
            EmValue::I64(_) => "int64",
            EmValue::F64(_) => "float64",
            EmValue::Str(_) => "string",
            EmValue::Event(_) => "event",
            EmValue::Object(_) => "object",
        }
    }

    /// Integer value, if this is an `int32`.
    #[must_use]
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            EmValue::I32(v) => Some(*v),
            _ => None,
        }
    }

    /// Integer value widened to 64 bits.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            EmValue::I32(v) => Some(i64::from(*v)),
            EmValue::I64(v) => Some(*v),
            _ => None,
        }
    }

    /// Floating point value; integers convert.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            EmValue::I32(v) => Some(f64::from(*v)),
            EmValue::I64(v) => Some(*v as f64),
            EmValue::F64(v) => Some(*v),
            _ => None,
        }
    }

    /// String contents, if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            EmValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// The event object, if this is one.
    #[must_use]
    pub fn as_event(&self) -> Option<&EventRef> {
        match self {
            EmValue::Event(e) => Some(e),
            _ => None,
        }
    }

    /// Returns true for `null`.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, EmValue::Null)
    }

    /// Truth value as seen by `brtrue`/`brfalse`: non-zero numbers and non-null references.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            EmValue::Null => false,
            EmValue::I32(v) => *v != 0,
            EmValue::I64(v) => *v != 0,
            EmValue::F64(v) => *v != 0.0,
            EmValue::Str(_) | EmValue::Event(_) | EmValue::Object(_) => true,
        }
    }

    /// Reference identity or numeric equality, as `ceq` and `beq` compare.
    #[must_use]
    pub fn cil_eq(&self, other: &EmValue) -> bool {
        match (self, other) {
            (EmValue::Null, EmValue::Null) => true,
            (EmValue::I32(a), EmValue::I32(b)) => a == b,
            (EmValue::Str(a), EmValue::Str(b)) => Arc::ptr_eq(a, b) || a == b,
            (EmValue::Event(a), EmValue::Event(b)) => Arc::ptr_eq(a, b),
            (EmValue::Object(a), EmValue::Object(b)) => a == b,
            (a, b) => match (a.as_i64(), b.as_i64()) {
                (Some(x), Some(y)) => x == y,
                _ => match (a.as_f64(), b.as_f64()) {
                    (Some(x), Some(y)) => x == y,
                    _ => false,
                },
            },
        }
    }

    /// Interpreter value of an event parameter.
    #[must_use]
    pub fn from_param(value: ParamValue) -> Self {
        match value {
            ParamValue::Bool(b) => EmValue::bool(b),
            ParamValue::Int(i) => EmValue::I64(i),
            ParamValue::Float(f) => EmValue::F64(f),
            ParamValue::Str(s) => EmValue::Str(s),
        }
    }

    /// Event parameter carried by this value.
    ///
    /// # Errors
    /// Returns [`Error::Execution`] for references other than strings.
    pub fn to_param(&self) -> Result<ParamValue> {
        match self {
            EmValue::I32(v) => Ok(ParamValue::Int(i64::from(*v))),
            EmValue::I64(v) => Ok(ParamValue::Int(*v)),
            EmValue::F64(v) => Ok(ParamValue::Float(*v)),
            EmValue::Str(s) => Ok(ParamValue::Str(Arc::clone(s))),
            other => Err(Error::Execution(format!(
                "{} cannot be used as an event parameter",
                other.type_name()
            ))),
        }
    }
}

impl fmt::Debug for EmValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmValue::Null => write!(f, "null"),
            EmValue::I32(v) => write!(f, "{v}"),
            EmValue::I64(v) => write!(f, "{v}L"),
            EmValue::F64(v) => write!(f, "{v:?}"),
            EmValue::Str(s) => write!(f, "{s:?}"),
            EmValue::Event(_) => write!(f, "<event>"),
            EmValue::Object(class) => write!(f, "<object {class}>"),
        }
    }
}

impl PartialEq for EmValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (EmValue::F64(a), EmValue::F64(b)) => a == b,
            (EmValue::I64(a), EmValue::I64(b)) => a == b,
            (EmValue::I32(a), EmValue::I32(b)) => a == b,
            (EmValue::I32(_) | EmValue::I64(_) | EmValue::F64(_), _) => false,
            _ => self.cil_eq(other),
        }
    }
}

impl From<i32> for EmValue {
    fn from(v: i32) -> Self {
        EmValue::I32(v)
    }
}

impl From<i64> for EmValue {
    fn from(v: i64) -> Self {
        EmValue::I64(v)
    }
}

impl From<f64> for EmValue {
    fn from(v: f64) -> Self {
        EmValue::F64(v)
    }
}

impl From<bool> for EmValue {
    fn from(v: bool) -> Self {
        EmValue::bool(v)
    }
}

impl From<&str> for EmValue {
    fn from(v: &str) -> Self {
        EmValue::Str(Arc::from(v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ReservedSlotCheck;

    #[test]
    fn truthiness() {
        assert!(!EmValue::Null.is_truthy());
        assert!(!EmValue::I32(0).is_truthy());
        assert!(EmValue::I64(-1).is_truthy());
        assert!(EmValue::from("x").is_truthy());
    }

    #[test]
    fn equality() {
        assert!(EmValue::I32(3).cil_eq(&EmValue::I64(3)));
        assert_ne!(EmValue::I32(3), EmValue::I64(3));
        let e = EmValue::event(ReservedSlotCheck::new(true, "u"));
        assert!(e.cil_eq(&e.clone()));
        assert!(!e.cil_eq(&EmValue::event(ReservedSlotCheck::new(true, "u"))));
    }

    #[test]
    fn parameters() {
        assert_eq!(
            EmValue::from_param(ParamValue::Float(2.5)),
            EmValue::F64(2.5)
        );
        assert!(matches!(
            EmValue::I32(4).to_param().unwrap(),
            ParamValue::Int(4)
        ));
        assert!(EmValue::Null.to_param().is_err());
    }
}
