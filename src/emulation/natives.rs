//! Registry of natively implemented methods.
//!
//! Every `call`, `callvirt` and `newobj` the interpreter executes is first looked up here by
//! the method token. Natives stand in for host code that has no instruction stream of its
//! own: the interception point, event constructors, exception constructors and whatever
//! the embedding test or tool wants to stub.

use std::{fmt, sync::Arc};

use dashmap::DashMap;

use crate::{
    assembly::MethodRef, emulation::value::EmValue, metadata::token::Token, Result,
};

/// Native method body.
///
/// Receives the called method and its arguments (`this` first for instance methods) and
/// returns the result. The result of a void method is ignored; [`EmValue::Null`] is the
/// conventional value.
pub type NativeFn = dyn Fn(&MethodRef, &[EmValue]) -> Result<EmValue> + Send + Sync;

/// Natives keyed by method token.
#[derive(Default)]
pub struct NativeMethods {
    natives: DashMap<Token, Arc<NativeFn>>,
}

impl NativeMethods {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `native` for `method`, replacing any previous registration.
    pub fn register<F>(&self, method: Token, native: F)
    where
        F: Fn(&MethodRef, &[EmValue]) -> Result<EmValue> + Send + Sync + 'static,
    {
        self.natives.insert(method, Arc::new(native));
    }

    /// Registers a constructor that produces an opaque object of `class`.
    ///
    /// Exceptions thrown by interpreted code are created this way; catch regions match
    /// them by class.
    pub fn register_class(&self, ctor: Token, class: Token) {
        self.register(ctor, move |_, _| Ok(EmValue::Object(class)));
    }

    /// Removes the native of `method`.
    pub fn unregister(&self, method: Token) -> bool {
        self.natives.remove(&method).is_some()
    }

    /// The native registered for `method`.
    #[must_use]
    pub fn get(&self, method: Token) -> Option<Arc<NativeFn>> {
        self.natives.get(&method).map(|n| Arc::clone(n.value()))
    }

    /// Returns true if `method` has a native.
    #[must_use]
    pub fn contains(&self, method: Token) -> bool {
        self.natives.contains_key(&method)
    }

    /// Number of registered natives.
    #[must_use]
    pub fn len(&self) -> usize {
        self.natives.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.natives.is_empty()
    }
}

impl fmt::Debug for NativeMethods {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tokens: Vec<_> = self.natives.iter().map(|n| *n.key()).collect();
        tokens.sort_unstable();
        f.debug_struct("NativeMethods")
            .field("natives", &tokens)
            .finish()
    }
}
