//! Instruction model, stack analysis and encoding for CIL method bodies.
//!
//! This module provides everything the patch engine needs to reason about a method body
//! without loading it into a runtime:
//!
//! - **Instruction model**: [`Instruction`], [`Operand`] and the static [`OpcodeInfo`] table
//! - **Method bodies**: [`InstructionStream`] with [`ExceptionRegion`]s
//! - **Stack analysis**: [`analyze`] computes per-instruction entry depths ([`StackMap`])
//! - **Assembly**: [`StreamBuilder`] and the [`InstructionEmitter`] helpers
//! - **Encoding**: [`encode`] produces deterministic method body bytes and a [`Fingerprint`]
//!
//! # Examples
//!
//! ```rust
//! use dotpatch::assembly::{StreamBuilder, InstructionEmitter, encode};
//!
//! let mut b = StreamBuilder::new();
//! let end = b.label();
//! b.ldarg(0)?;
//! b.branch("brtrue.s", end)?;
//! b.ldc_i4(0)?.ret()?;
//! b.mark(end)?;
//! b.ldc_i4(1)?.ret()?;
//! let stream = b.build(1, true)?;
//!
//! let map = stream.analyze()?;
//! assert_eq!(map.depth_at(4), Some(0));
//! let body = encode(&stream)?;
//! assert_eq!(body.code_size(), 7);
//! # Ok::<(), dotpatch::Error>(())
//! ```

mod builder;
mod encoder;
mod instruction;
mod instructions;
mod method;
pub mod opcodes;
mod stack;
mod stream;

pub use builder::{InstructionEmitter, Label, StreamBuilder};
pub use encoder::{encode, fingerprint, EncodedBody, Fingerprint};
pub use instruction::{
    FlowType, Immediate, Instruction, InstructionCategory, Operand, OperandType, StackBehavior,
};
pub use instructions::{OpcodeInfo, StackCount, OPCODES};
pub use method::MethodRef;
pub use stack::{analyze, StackMap};
pub use stream::{ExceptionHandlerFlags, ExceptionRegion, InstructionStream, RegionKind};
