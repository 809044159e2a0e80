//! CIL instruction representation, operand types, and stack/flow metadata.
//!
//! This module defines the type system for instructions inside an
//! [`crate::assembly::InstructionStream`]. Unlike a byte-level listing, instructions here are
//! addressed by their *index* within the stream: branch operands hold target indices, which
//! keeps splicing a block into the middle of a method a pure index-remapping exercise.
//!
//! # Key Components
//!
//! - [`crate::assembly::Instruction`] - One instruction with opcode metadata and operand
//! - [`crate::assembly::Operand`] - Type-safe operand representation
//! - [`crate::assembly::Immediate`] - Immediate constants
//! - [`crate::assembly::FlowType`] - Control flow behavior classification
//! - [`crate::assembly::InstructionCategory`] - Functional instruction grouping
//! - [`crate::assembly::StackBehavior`] - Resolved stack effect
//!
//! # Usage Examples
//!
//! ```rust
//! use dotpatch::assembly::{Instruction, Operand, Immediate, FlowType};
//!
//! let push = Instruction::new("ldc.i4.s", Operand::Immediate(Immediate::Int8(7)))?;
//! assert_eq!(push.stack_behavior().pushes, 1);
//!
//! let jump = Instruction::new("br", Operand::Target(4))?;
//! assert_eq!(jump.flow_type, FlowType::UnconditionalBranch);
//! assert_eq!(jump.targets(), vec![4]);
//! # Ok::<(), dotpatch::Error>(())
//! ```

use std::{
    fmt::{self, UpperHex},
    sync::Arc,
};

use crate::{
    assembly::{
        instructions::{OpcodeInfo, StackCount},
        opcodes, MethodRef,
    },
    metadata::token::Token,
    Error, Result,
};

/// Types of inline operands for CIL instructions.
///
/// # Examples
///
/// ```rust
/// use dotpatch::assembly::OperandType;
///
/// assert_eq!(OperandType::None.size(), Some(0));
/// assert_eq!(OperandType::ShortBranch.size(), Some(1));
/// assert_eq!(OperandType::Method.size(), Some(4));
/// assert_eq!(OperandType::Switch.size(), None);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandType {
    /// No operand present
    None,
    /// Signed 8-bit integer
    Int8,
    /// Signed 32-bit integer
    Int32,
    /// Signed 64-bit integer
    Int64,
    /// 64-bit floating point
    Float64,
    /// 8-bit relative branch target
    ShortBranch,
    /// 32-bit relative branch target
    Branch,
    /// Switch table
    Switch,
    /// Local variable index (short form)
    Local,
    /// Argument index (short form)
    Argument,
    /// Method token
    Method,
    /// Type token
    Type,
    /// User string token
    String,
}

impl OperandType {
    /// Returns the encoded size in bytes of this operand type.
    ///
    /// Returns `None` for [`OperandType::Switch`], whose size depends on the number of
    /// targets.
    #[must_use]
    pub const fn size(&self) -> Option<usize> {
        match self {
            OperandType::None => Some(0),
            OperandType::Int8
            | OperandType::ShortBranch
            | OperandType::Local
            | OperandType::Argument => Some(1),
            OperandType::Int32
            | OperandType::Branch
            | OperandType::Method
            | OperandType::Type
            | OperandType::String => Some(4),
            OperandType::Int64 | OperandType::Float64 => Some(8),
            OperandType::Switch => None,
        }
    }
}

/// Immediate value embedded in an instruction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Immediate {
    /// Signed 8-bit immediate value
    Int8(i8),
    /// Signed 32-bit immediate value
    Int32(i32),
    /// Signed 64-bit immediate value
    Int64(i64),
    /// 64-bit floating point immediate value
    Float64(f64),
}

impl Immediate {
    /// Returns the value widened to `i64`, or `None` for floating point immediates.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Immediate::Int8(v) => Some(i64::from(*v)),
            Immediate::Int32(v) => Some(i64::from(*v)),
            Immediate::Int64(v) => Some(*v),
            Immediate::Float64(_) => None,
        }
    }
}

impl UpperHex for Immediate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Immediate::Int8(value) => write!(f, "{value:02X}"),
            Immediate::Int32(value) => write!(f, "{value:08X}"),
            Immediate::Int64(value) => write!(f, "{value:016X}"),
            Immediate::Float64(value) => write!(f, "{:016X}", value.to_bits()),
        }
    }
}

impl From<Immediate> for u64 {
    fn from(val: Immediate) -> Self {
        match val {
            // Signed values keep their bit pattern
            #[allow(clippy::cast_sign_loss)]
            Immediate::Int8(value) => value as u64,
            #[allow(clippy::cast_sign_loss)]
            Immediate::Int32(value) => value as u64,
            #[allow(clippy::cast_sign_loss)]
            Immediate::Int64(value) => value as u64,
            Immediate::Float64(value) => value.to_bits(),
        }
    }
}

/// Instruction operand.
///
/// Branch targets are instruction indices inside the owning stream, not byte offsets.
/// Byte offsets only exist once a stream is encoded.
///
/// # Examples
///
/// ```rust
/// use dotpatch::assembly::{Operand, Immediate};
///
/// assert_eq!(Operand::None.as_string(), None);
/// assert_eq!(Operand::Target(3).as_string(), Some("IL_#3".to_string()));
/// assert_eq!(Operand::Argument(1).as_string(), Some("A_1".to_string()));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// No operand present
    None,
    /// Immediate value (constant embedded in instruction)
    Immediate(Immediate),
    /// Branch target as an instruction index
    Target(usize),
    /// Switch table as instruction indices
    Switch(Vec<usize>),
    /// Local variable index
    Local(u16),
    /// Method argument index
    Argument(u16),
    /// Called or constructed method
    Method(MethodRef),
    /// Type token
    Type(Token),
    /// String literal
    String(Arc<str>),
}

impl Operand {
    /// Returns a formatted string representation of the operand.
    #[must_use]
    pub fn as_string(&self) -> Option<String> {
        match self {
            Operand::None => None,
            Operand::Immediate(imm) => Some(format!("{imm:?}")),
            Operand::Target(t) => Some(format!("IL_#{t}")),
            Operand::Switch(targets) => Some(format!("switch({})", targets.len())),
            Operand::Local(l) => Some(format!("V_{l}")),
            Operand::Argument(a) => Some(format!("A_{a}")),
            Operand::Method(m) => Some(m.full_name()),
            Operand::Type(t) => Some(format!("{t}")),
            Operand::String(s) => Some(format!("{s:?}")),
        }
    }
}

/// How an instruction affects control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowType {
    /// Normal execution continues to next instruction
    Sequential,
    /// Conditional branch to another location
    ConditionalBranch,
    /// Always branches to another location
    UnconditionalBranch,
    /// Call to another method
    Call,
    /// Returns from current method
    Return,
    /// Multi-way branch
    Switch,
    /// Exception throwing (`throw`, `rethrow`)
    Throw,
    /// End of finally or fault handler
    EndFinally,
    /// End of filter block
    EndFilter,
    /// Leave protected region
    Leave,
}

/// Resolved stack effect of an instruction.
///
/// `ret` and `leave` report a zero effect; their stack requirements depend on the method
/// signature and the region they leave, and are handled by the stack analyzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackBehavior {
    /// Number of items popped from stack
    pub pops: u8,
    /// Number of items pushed to stack
    pub pushes: u8,
    /// Net effect on stack depth (pushes - pops)
    pub net_effect: i8,
}

/// Categorization of instructions by their primary function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionCategory {
    /// Arithmetic operations (add, sub, mul, div, rem, neg)
    Arithmetic,
    /// Bitwise and logical operations (and, or, xor, not)
    BitwiseLogical,
    /// Comparison operations (ceq, cgt, clt)
    Comparison,
    /// Control flow operations (br, switch, ret, call)
    ControlFlow,
    /// Type conversion operations (conv.i4, conv.r8, box)
    Conversion,
    /// Load and store operations (ldloc, ldarg, ldstr)
    LoadStore,
    /// Object model operations (newobj, castclass)
    ObjectModel,
    /// Miscellaneous operations (nop, dup, pop)
    Misc,
}

/// One instruction of an [`crate::assembly::InstructionStream`].
///
/// Instructions are always created through [`Instruction::new`] (or the emitters in
/// [`crate::assembly::StreamBuilder`]), which validates the operand against the opcode
/// table. The opcode metadata is kept alongside so stack and flow queries never need a
/// second lookup.
///
/// # Thread Safety
///
/// [`Instruction`] is [`std::marker::Send`] and [`std::marker::Sync`]; operands are either
/// plain data or reference counted immutable strings.
#[derive(Clone, PartialEq)]
pub struct Instruction {
    /// Primary opcode byte
    pub opcode: u8,
    /// Prefix byte (0 if no prefix)
    pub prefix: u8,
    /// Human-readable instruction mnemonic (e.g., "add", "ldarg.s", "ret")
    pub mnemonic: &'static str,
    /// Functional categorization of this instruction
    pub category: InstructionCategory,
    /// How this instruction affects control flow
    pub flow_type: FlowType,
    /// The operand data for this instruction
    pub operand: Operand,
    info: &'static OpcodeInfo,
}

impl Instruction {
    /// Creates an instruction from a mnemonic and operand.
    ///
    /// # Errors
    /// Returns [`Error::UnknownInstruction`] for mnemonics outside the opcode table and
    /// [`Error::InvalidOperand`] if the operand does not fit the opcode.
    pub fn new(mnemonic: &str, operand: Operand) -> Result<Self> {
        let info = OpcodeInfo::by_mnemonic(mnemonic)
            .ok_or_else(|| Error::UnknownInstruction(mnemonic.to_string()))?;
        info.check_operand(&operand)?;

        Ok(Instruction {
            opcode: info.opcode,
            prefix: info.prefix,
            mnemonic: info.mnemonic,
            category: info.category,
            flow_type: info.flow,
            operand,
            info,
        })
    }

    /// Creates an operand-less instruction.
    ///
    /// # Errors
    /// See [`Instruction::new`].
    pub fn simple(mnemonic: &str) -> Result<Self> {
        Self::new(mnemonic, Operand::None)
    }

    /// Opcode table entry of this instruction.
    #[must_use]
    pub fn info(&self) -> &'static OpcodeInfo {
        self.info
    }

    /// Resolves the stack effect, taking call signatures into account.
    #[must_use]
    pub fn stack_behavior(&self) -> StackBehavior {
        let method = match &self.operand {
            Operand::Method(m) => Some(m),
            _ => None,
        };

        let resolve = |count: StackCount| -> u8 {
            match count {
                StackCount::Fixed(n) => n,
                StackCount::CallArguments => method.map_or(0, MethodRef::pops),
                StackCount::CtorArguments => method.map_or(0, |m| m.param_count),
                StackCount::CallResult => method.map_or(0, MethodRef::pushes),
                StackCount::Clear => 0,
            }
        };

        let pops = resolve(self.info.pops);
        let pushes = resolve(self.info.pushes);
        #[allow(clippy::cast_possible_wrap)]
        StackBehavior {
            pops,
            pushes,
            net_effect: pushes as i8 - pops as i8,
        }
    }

    /// Check if this instruction is a branch instruction.
    #[must_use]
    pub fn is_branch(&self) -> bool {
        matches!(
            self.flow_type,
            FlowType::ConditionalBranch | FlowType::UnconditionalBranch | FlowType::Switch
        )
    }

    /// Check if this instruction ends a basic block.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.flow_type,
            FlowType::ConditionalBranch
                | FlowType::UnconditionalBranch
                | FlowType::Switch
                | FlowType::Return
                | FlowType::Throw
                | FlowType::EndFinally
                | FlowType::EndFilter
                | FlowType::Leave
        )
    }

    /// `true` if execution can continue with the next instruction.
    #[must_use]
    pub fn falls_through(&self) -> bool {
        matches!(
            self.flow_type,
            FlowType::Sequential
                | FlowType::Call
                | FlowType::ConditionalBranch
                | FlowType::Switch
        )
    }

    /// `true` for `call`, `callvirt` and `newobj`.
    #[must_use]
    pub fn is_call(&self) -> bool {
        self.flow_type == FlowType::Call
    }

    /// Branch or switch target indices of this instruction.
    #[must_use]
    pub fn targets(&self) -> Vec<usize> {
        match &self.operand {
            Operand::Target(t) => vec![*t],
            Operand::Switch(targets) => targets.clone(),
            _ => Vec::new(),
        }
    }

    /// Rewrites every branch or switch target through `f`.
    pub fn retarget(&mut self, f: impl Fn(usize) -> usize) {
        match &mut self.operand {
            Operand::Target(t) => *t = f(*t),
            Operand::Switch(targets) => {
                for t in targets.iter_mut() {
                    *t = f(*t);
                }
            }
            _ => {}
        }
    }

    /// Argument index accessed by `ldarg.*` / `starg.s`.
    #[must_use]
    pub fn argument_index(&self) -> Option<u16> {
        if self.prefix != 0 {
            return None;
        }
        match self.opcode {
            opcodes::LDARG_0..=opcodes::LDARG_3 => Some(u16::from(self.opcode - opcodes::LDARG_0)),
            _ => match self.operand {
                Operand::Argument(index) => Some(index),
                _ => None,
            },
        }
    }

    /// Local index accessed by `ldloc.*` / `stloc.*`.
    #[must_use]
    pub fn local_index(&self) -> Option<u16> {
        if self.prefix != 0 {
            return None;
        }
        match self.opcode {
            opcodes::LDLOC_0..=opcodes::LDLOC_3 => Some(u16::from(self.opcode - opcodes::LDLOC_0)),
            opcodes::STLOC_0..=opcodes::STLOC_3 => Some(u16::from(self.opcode - opcodes::STLOC_0)),
            _ => match self.operand {
                Operand::Local(index) => Some(index),
                _ => None,
            },
        }
    }

    /// Integer constant pushed by `ldc.i4*` / `ldc.i8`.
    #[must_use]
    pub fn constant(&self) -> Option<i64> {
        if self.prefix != 0 {
            return None;
        }
        match self.opcode {
            opcodes::LDC_I4_M1..=opcodes::LDC_I4_8 => {
                Some(i64::from(self.opcode) - i64::from(opcodes::LDC_I4_0))
            }
            opcodes::LDC_I4_S | opcodes::LDC_I4 | opcodes::LDC_I8 => match self.operand {
                Operand::Immediate(imm) => imm.as_i64(),
                _ => None,
            },
            _ => None,
        }
    }

    /// Method operand of call-family instructions.
    #[must_use]
    pub fn method(&self) -> Option<&MethodRef> {
        match &self.operand {
            Operand::Method(m) => Some(m),
            _ => None,
        }
    }

    /// Encoded size of this instruction in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        let operand = match (&self.operand, self.info.operand.size()) {
            (Operand::Switch(targets), None) => 4 + 4 * targets.len(),
            (_, Some(size)) => size,
            (_, None) => 0,
        };
        self.info.opcode_len() + operand
    }
}

impl fmt::Debug for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.prefix != 0 {
            write!(f, "{:02X}:", self.prefix)?;
        }

        write!(f, "{:02X} - {:<12}", self.opcode, self.mnemonic)?;

        match &self.operand {
            Operand::None => {}
            Operand::Immediate(imm) => {
                write!(f, " 0x{imm:X}")?;
            }
            Operand::Target(target) => {
                write!(f, " -> #{target}")?;
            }
            Operand::Switch(items) => {
                write!(f, " switch[{}]:(", items.len())?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "#{item}")?;
                    if i >= 5 && items.len() > 6 {
                        write!(f, ", ...{} more", items.len() - 6)?;
                        break;
                    }
                }
                write!(f, ")")?;
            }
            Operand::Local(local) => {
                write!(f, " local:{local}")?;
            }
            Operand::Argument(arg) => {
                write!(f, " arg:{arg}")?;
            }
            Operand::Method(method) => {
                write!(f, " {method:?}")?;
            }
            Operand::Type(token) => {
                write!(f, " type:{token}")?;
            }
            Operand::String(s) => {
                write!(f, " {s:?}")?;
            }
        }

        write!(f, " | {:?}", self.category)?;

        if self.flow_type != FlowType::Sequential {
            write!(f, " | {:?}", self.flow_type)?;
        }

        let stack = self.stack_behavior();
        if stack.net_effect != 0 {
            write!(f, " | stack:{:+}", stack.net_effect)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn method(params: u8) -> MethodRef {
        MethodRef::new(Token::method_def(1), "T", "M").with_params(params)
    }

    #[test]
    fn test_unknown_mnemonic() {
        assert!(matches!(
            Instruction::simple("ldelem.ref"),
            Err(Error::UnknownInstruction(_))
        ));
    }

    #[test]
    fn test_operand_mismatch() {
        assert!(matches!(
            Instruction::new("br", Operand::None),
            Err(Error::InvalidOperand { mnemonic: "br", .. })
        ));
    }

    #[test]
    fn test_call_stack_behavior() {
        let call = Instruction::new("call", Operand::Method(method(2).returning())).unwrap();
        assert_eq!(
            call.stack_behavior(),
            StackBehavior {
                pops: 2,
                pushes: 1,
                net_effect: -1
            }
        );

        let callvirt =
            Instruction::new("callvirt", Operand::Method(method(1).instance())).unwrap();
        assert_eq!(callvirt.stack_behavior().pops, 2);
        assert_eq!(callvirt.stack_behavior().pushes, 0);

        let newobj = Instruction::new("newobj", Operand::Method(method(3).instance())).unwrap();
        assert_eq!(newobj.stack_behavior().pops, 3);
        assert_eq!(newobj.stack_behavior().pushes, 1);
    }

    #[test]
    fn test_fixed_stack_behavior() {
        let dup = Instruction::simple("dup").unwrap();
        assert_eq!(dup.stack_behavior().net_effect, 1);
        let beq = Instruction::new("beq.s", Operand::Target(0)).unwrap();
        assert_eq!(beq.stack_behavior().pops, 2);
    }

    #[test]
    fn test_flow_queries() {
        let ret = Instruction::simple("ret").unwrap();
        assert!(ret.is_terminal());
        assert!(!ret.falls_through());
        assert!(!ret.is_branch());

        let brtrue = Instruction::new("brtrue.s", Operand::Target(2)).unwrap();
        assert!(brtrue.is_branch());
        assert!(brtrue.falls_through());

        let leave = Instruction::new("leave", Operand::Target(9)).unwrap();
        assert!(!leave.falls_through());
        assert_eq!(leave.targets(), vec![9]);
    }

    #[test]
    fn test_retarget() {
        let mut switch = Instruction::new("switch", Operand::Switch(vec![1, 5, 9])).unwrap();
        switch.retarget(|t| if t > 4 { t + 10 } else { t });
        assert_eq!(switch.targets(), vec![1, 15, 19]);
    }

    #[test]
    fn test_indices_and_constants() {
        assert_eq!(
            Instruction::simple("ldarg.2").unwrap().argument_index(),
            Some(2)
        );
        assert_eq!(
            Instruction::new("starg.s", Operand::Argument(5))
                .unwrap()
                .argument_index(),
            Some(5)
        );
        assert_eq!(Instruction::simple("stloc.3").unwrap().local_index(), Some(3));
        assert_eq!(Instruction::simple("ldc.i4.m1").unwrap().constant(), Some(-1));
        assert_eq!(Instruction::simple("ldc.i4.8").unwrap().constant(), Some(8));
        assert_eq!(
            Instruction::new("ldc.i4", Operand::Immediate(Immediate::Int32(1000)))
                .unwrap()
                .constant(),
            Some(1000)
        );
        assert_eq!(Instruction::simple("add").unwrap().constant(), None);
    }

    #[test]
    fn test_sizes() {
        assert_eq!(Instruction::simple("ret").unwrap().size(), 1);
        assert_eq!(Instruction::simple("ceq").unwrap().size(), 2);
        assert_eq!(
            Instruction::new("call", Operand::Method(method(0)))
                .unwrap()
                .size(),
            5
        );
        assert_eq!(
            Instruction::new("switch", Operand::Switch(vec![0, 1, 2]))
                .unwrap()
                .size(),
            1 + 4 + 12
        );
    }

    #[test]
    fn test_immediate_conversions() {
        assert_eq!(u64::from(Immediate::Int8(-1)), u64::MAX);
        assert_eq!(u64::from(Immediate::Int32(42)), 42);
        assert_eq!(Immediate::Float64(1.5).as_i64(), None);
        assert_eq!(format!("{:X}", Immediate::Int8(10)), "0A");
    }

    #[test]
    fn test_debug_format() {
        let br = Instruction::new("br.s", Operand::Target(3)).unwrap();
        let text = format!("{br:?}");
        assert!(text.starts_with("2B - br.s"));
        assert!(text.contains("-> #3"));
        assert!(text.contains("UnconditionalBranch"));
    }
}
