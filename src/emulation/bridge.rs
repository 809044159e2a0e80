//! Natives connecting interpreted code to the dispatch engine.
//!
//! A patched method reaches the dispatch engine through the three natives of an
//! [`InterceptionPoint`] and through event constructors called with `newobj`:
//!
//! ```text
//! newobj   ReservedSlotCheck::.ctor   -> EmValue::Event
//! call     Dispatch(event, kind)      -> Dispatcher::dispatch_dyn
//! call     IsAllowed(event)           -> int32 0 / 1
//! call     GetParameter(event, name)  -> parameter value
//! ```

use std::sync::Arc;

use crate::{
    assembly::MethodRef,
    emulation::{
        natives::NativeMethods,
        value::{EmValue, EventRef},
    },
    events::{Dispatcher, EventKind, EventState},
    patch::{lock, InterceptionPoint},
    Error, Result,
};

/// Argument `index` of a native call.
///
/// # Errors
/// Returns [`Error::Execution`] if the argument is missing.
pub fn arg(args: &[EmValue], index: usize) -> Result<&EmValue> {
    args.get(index)
        .ok_or_else(|| Error::Execution(format!("missing argument {index}")))
}

fn event_arg(args: &[EmValue], index: usize) -> Result<&EventRef> {
    let value = arg(args, index)?;
    value.as_event().ok_or_else(|| {
        Error::Execution(format!(
            "argument {index} is {}, expected an event",
            value.type_name()
        ))
    })
}

fn str_arg(args: &[EmValue], index: usize) -> Result<&str> {
    let value = arg(args, index)?;
    value.as_str().ok_or_else(|| {
        Error::Execution(format!(
            "argument {index} is {}, expected a string",
            value.type_name()
        ))
    })
}

/// Registers the interception-point natives and event constructors.
#[derive(Debug, Clone)]
pub struct EventBridge {
    dispatcher: Dispatcher,
    point: InterceptionPoint,
}

impl EventBridge {
    /// Creates a bridge dispatching through `dispatcher`.
    #[must_use]
    pub fn new(dispatcher: Dispatcher, point: InterceptionPoint) -> Self {
        Self { dispatcher, point }
    }

    /// The natives this bridge implements.
    #[must_use]
    pub fn point(&self) -> &InterceptionPoint {
        &self.point
    }

    /// Registers `Dispatch`, `IsAllowed` and `GetParameter` in `natives`.
    pub fn install(&self, natives: &NativeMethods) {
        let dispatcher = self.dispatcher.clone();
        natives.register(self.point.dispatch.token, move |_, args| {
            let event = event_arg(args, 0)?;
            let kind = EventKind::new(str_arg(args, 1)?);
            let mut state = lock(event)?;
            let outcome = dispatcher.dispatch_dyn(&kind, &mut **state);
            tracing::debug!(
                kind = %kind,
                invoked = outcome.invoked,
                faults = outcome.faults.len(),
                "dispatched from interpreted code"
            );
            Ok(EmValue::Null)
        });

        natives.register(self.point.is_allowed.token, |_, args| {
            let state = lock(event_arg(args, 0)?)?;
            let state: &dyn EventState = &**state;
            // payloads without a decision never block the call site
            Ok(EmValue::bool(state.is_allowed().unwrap_or(true)))
        });

        natives.register(self.point.get_parameter.token, |_, args| {
            let name = str_arg(args, 1)?;
            let state = lock(event_arg(args, 0)?)?;
            let state: &dyn EventState = &**state;
            state
                .parameter(name)
                .map(EmValue::from_param)
                .ok_or_else(|| {
                    Error::Execution(format!("{} has no parameter '{name}'", state.type_name()))
                })
        });

        tracing::debug!(
            dispatch = %self.point.dispatch.token,
            is_allowed = %self.point.is_allowed.token,
            get_parameter = %self.point.get_parameter.token,
            "interception point installed"
        );
    }

    /// Registers `factory` as the constructor `ctor`; `newobj ctor` then creates an event.
    pub fn register_event<E, F>(&self, natives: &NativeMethods, ctor: &MethodRef, factory: F)
    where
        E: EventState,
        F: Fn(&[EmValue]) -> Result<E> + Send + Sync + 'static,
    {
        let factory = Arc::new(factory);
        natives.register(ctor.token, move |_, args| Ok(EmValue::event(factory(args)?)));
    }

    /// Removes the interception-point natives from `natives`.
    pub fn uninstall(&self, natives: &NativeMethods) {
        natives.unregister(self.point.dispatch.token);
        natives.unregister(self.point.is_allowed.token);
        natives.unregister(self.point.get_parameter.token);
    }
}
