//! Execution of instruction streams.
//!
//! Patched bodies are only data until something runs them. This module provides a small
//! interpreter so that the full path from a patched call site to the subscribers and back
//! can be exercised without a runtime:
//!
//! - [`EmValue`] - Runtime values, including shared event objects
//! - [`NativeMethods`] - Natively implemented methods keyed by token
//! - [`Interpreter`] - Executes streams with arguments, locals, calls, exception regions and
//!   [`crate::config::EmulationLimits`]
//! - [`EventBridge`] - The interception-point natives and event constructors
//!
//! # Examples
//!
//! ```rust
//! use std::sync::Arc;
//! use dotpatch::assembly::{InstructionEmitter, MethodRef, StreamBuilder};
//! use dotpatch::config::EmulationLimits;
//! use dotpatch::emulation::{EmValue, Interpreter, NativeMethods};
//! use dotpatch::metadata::token::Token;
//!
//! let natives = Arc::new(NativeMethods::new());
//! let answer = MethodRef::new(Token::method_def(1), "Oracle", "Answer").returning();
//! natives.register(answer.token, |_, _| Ok(EmValue::I32(42)));
//!
//! let mut b = StreamBuilder::new();
//! b.call(&answer)?.ret()?;
//! let body = b.build(0, true)?;
//!
//! let mut interpreter = Interpreter::new(natives, EmulationLimits::default());
//! assert_eq!(interpreter.run(&body, vec![])?, Some(EmValue::I32(42)));
//! # Ok::<(), dotpatch::Error>(())
//! ```

mod bridge;
mod interpreter;
mod natives;
mod value;

pub use bridge::{arg, EventBridge};
pub use interpreter::{Completion, Interpreter};
pub use natives::{NativeFn, NativeMethods};
pub use value::{EmValue, EventRef};
