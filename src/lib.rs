// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![allow(dead_code)]
#![allow(clippy::too_many_arguments)]
#![deny(unsafe_code)]

//! # dotpatch
//!
//! Runtime call-site patching and event dispatch for managed (CIL) method bodies.
//!
//! `dotpatch` lets extension code observe and influence a host application it does not
//! own. A patch locates a structural position inside a live method body, splices in a
//! small block of instructions that raises an event, and swaps the edited body in
//! atomically. When the patched method runs, the event is dispatched synchronously to
//! every subscriber in priority order; whatever decision and parameters the event holds
//! afterwards are what the call site acts on.
//!
//! ## Features
//!
//! - **Anchor location** - Find call sites by instruction windows, not byte offsets
//! - **Stack-checked splicing** - Every edit is simulated; unbalanced blocks are rejected
//! - **Atomic install and rollback** - Compare-and-swap against the live method table
//! - **Ordered, fault-isolated dispatch** - Priorities with stable ties, panics contained
//! - **Capability-based events** - Deniable, actor-bound and mutable-parameter payloads
//! - **Executable bodies** - A bounded interpreter runs patched code end to end
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use dotpatch::prelude::*;
//!
//! // static bool HasReservedSlot(string userId) => true;
//! let methods = Arc::new(LiveMethodTable::new());
//! let target = Token::method_def(1);
//! let mut b = StreamBuilder::new();
//! b.ldc_i4(1)?.ret()?;
//! methods.load(target, b.build(1, true)?);
//!
//! let host = ExtensionHost::attach(methods, HostConfig::default());
//!
//! // newobj ReservedSlotCheck(result, userId)
//! let ctor = MethodRef::new(Token::member_ref(1), "ReservedSlotCheck", ".ctor").with_params(2);
//! host.bridge().register_event(host.natives(), &ctor, |args| {
//!     let user = args[1].as_str().unwrap_or_default().to_string();
//!     Ok(ReservedSlotCheck::new(args[0].is_truthy(), user))
//! });
//!
//! // a subscriber revoking the slot
//! host.registry().register_fn(EventKind::RESERVED_SLOT, "revoke", Priority::NORMAL, |ev| {
//!     if let Some(check) = ev.downcast_mut::<ReservedSlotCheck>() {
//!         check.deny();
//!     }
//!     Ok(())
//! });
//!
//! let block = deniable_result(host.bridge().point(), &ctor, &EventKind::RESERVED_SLOT, &[0])?;
//! host.apply_patch(
//!     Patch::new("ReservedSlotPatch")
//!         .target(target)
//!         .anchor(AnchorPattern::before_last_return())
//!         .insert(block)
//!         .event(EventKind::RESERVED_SLOT),
//! )?;
//!
//! let result = host.execute(target, vec![EmValue::from("a@steam")])?;
//! assert_eq!(result, Some(EmValue::I32(0)));
//!
//! host.detach()?;
//! # Ok::<(), dotpatch::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`assembly`] - Instruction model, stack analysis, builders and encoding
//! - [`patch`] - Anchor locator, stream editor, templates, patch table and installer
//! - [`events`] - Event kinds, payload capabilities, registry and dispatcher
//! - [`emulation`] - Interpreter and the event bridge for patched code
//! - [`host`] - Process-scoped extension host
//! - [`config`] and [`diagnostics`] - Settings and collected findings
//!
//! ## Error Handling
//!
//! Every fallible operation returns [`Result`]. Patch errors stay with their patch record;
//! subscriber faults are caught during dispatch and recorded as diagnostics. Nothing in
//! the engine terminates the host.

#[macro_use]
pub(crate) mod error;

/// Shared functionality which is used in unit tests
#[cfg(test)]
pub(crate) mod test;

/// Convenient re-exports of the most commonly used types and traits.
///
/// # Example
///
/// ```rust
/// use dotpatch::prelude::*;
///
/// let registry = EventRegistry::new();
/// registry.register_fn(EventKind::RESERVED_SLOT, "noop", Priority::LAST, |_| Ok(()));
/// assert_eq!(registry.len(&EventKind::RESERVED_SLOT), 1);
/// ```
pub mod prelude;

/// Instruction model, stack analysis and encoding of method bodies
pub mod assembly;

/// Settings for the editor, installer, dispatcher and interpreter
pub mod config;

/// Thread-safe collection of findings during patching and dispatch
pub mod diagnostics;

/// Interpreter for instruction streams and the bridge into the dispatch engine
pub mod emulation;

/// Typed, ordered, cancellable event pipeline
pub mod events;

/// Process-scoped extension host
pub mod host;

/// Metadata tokens
pub mod metadata;

/// Call-site patching of live method bodies
pub mod patch;

/// `dotpatch` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is always [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// `dotpatch` Error type
///
/// # Examples
///
/// ```rust
/// use dotpatch::{Error, assembly::Instruction};
///
/// match Instruction::simple("ldelem.ref") {
///     Err(Error::UnknownInstruction(m)) => assert_eq!(m, "ldelem.ref"),
///     other => panic!("unexpected {other:?}"),
/// }
/// ```
pub use error::Error;
