//! Call-site patching of live method bodies.
//!
//! A patch inserts a small block of instructions into an existing method at a structurally
//! located position, typically to raise an event and honour its decision. The pipeline is:
//!
//! 1. [`locate`] finds an [`Anchor`] from an [`AnchorPattern`] (an instruction window plus
//!    occurrence and position)
//! 2. [`splice`] inserts a [`PatchBlock`] there, renumbering branches and exception regions
//!    and rejecting any edit that breaks stack balance
//! 3. [`HookInstaller`] swaps the edited body into a [`MethodTable`] atomically, tracks it in
//!    the [`PatchTable`] and can roll it back
//!
//! The [`deniable_result`], [`guard_prefix`] and [`result_postfix`] templates cover the
//! common interception shapes.
//!
//! # Examples
//!
//! ```rust
//! use dotpatch::assembly::{InstructionEmitter, StreamBuilder};
//! use dotpatch::config::EditorConfig;
//! use dotpatch::patch::{locate, splice, AnchorPattern, BlockBuilder};
//!
//! // static int Twice(int x) => x + x;
//! let mut b = StreamBuilder::new();
//! b.ldarg(0)?.ldarg(0)?.op("add")?.ret()?;
//! let method = b.build(1, true)?;
//!
//! // ... + 1
//! let mut block = BlockBuilder::new();
//! block.ldc_i4(1)?.op("add")?;
//! let block = block.build()?;
//!
//! let anchor = locate(&method, &AnchorPattern::before_last_return())?;
//! let edited = splice(&method, &anchor, &block, &EditorConfig::default())?;
//! assert_eq!(edited.len(), 6);
//! assert_eq!(edited.instructions[4].mnemonic, "add");
//! # Ok::<(), dotpatch::Error>(())
//! ```

mod anchor;
mod block;
mod editor;
mod installer;
mod record;
mod template;

pub(crate) use record::lock;

pub use anchor::{
    locate, Anchor, AnchorPattern, AnchorPosition, InstructionMatcher, Occurrence, OpPattern,
    WindowPattern,
};
pub use block::{BlockBuilder, BlockTarget, PatchBlock, PatchOp};
pub use editor::splice;
pub use installer::{HookInstaller, LiveMethodTable, MethodTable};
pub use record::{InstallState, Patch, PatchId, PatchRecord, PatchTable};
pub use template::{deniable_result, guard_prefix, result_postfix, DenyAction, InterceptionPoint};
