//! Static opcode table with operand, flow and stack-effect metadata.
//!
//! Every instruction the engine can model has exactly one [`OpcodeInfo`] entry in
//! [`OPCODES`]. The table is the single source for mnemonic lookup (used when building
//! instructions), encoding (opcode bytes and operand widths) and stack analysis (pops and
//! pushes per instruction).
//!
//! Call-family opcodes do not have a fixed stack effect; their entries use
//! [`StackCount::CallArguments`], [`StackCount::CtorArguments`] and
//! [`StackCount::CallResult`], which are resolved against the [`crate::assembly::MethodRef`]
//! operand of the concrete instruction.

use std::{collections::HashMap, sync::OnceLock};

use crate::{
    assembly::{
        instruction::{FlowType, Immediate, InstructionCategory, Operand, OperandType},
        opcodes::*,
    },
    Error, Result,
};

/// How many stack slots an opcode pops or pushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackCount {
    /// A fixed number of slots
    Fixed(u8),
    /// Parameters of the called method plus `this` for instance methods
    CallArguments,
    /// Parameters of the constructor, without `this`
    CtorArguments,
    /// One slot if the called method returns a value, otherwise none
    CallResult,
    /// The whole evaluation stack is discarded (`leave`)
    Clear,
}

/// Metadata describing one opcode.
#[derive(Debug, PartialEq, Eq)]
pub struct OpcodeInfo {
    /// Prefix byte (`0xFE` for two-byte opcodes, `0` otherwise)
    pub prefix: u8,
    /// Opcode byte
    pub opcode: u8,
    /// Mnemonic as written in IL listings
    pub mnemonic: &'static str,
    /// Type of the inline operand
    pub operand: OperandType,
    /// Control flow behavior
    pub flow: FlowType,
    /// Functional category
    pub category: InstructionCategory,
    /// Values consumed from the evaluation stack
    pub pops: StackCount,
    /// Values produced onto the evaluation stack
    pub pushes: StackCount,
}

#[allow(clippy::too_many_arguments)]
const fn op(
    prefix: u8,
    opcode: u8,
    mnemonic: &'static str,
    operand: OperandType,
    flow: FlowType,
    category: InstructionCategory,
    pops: StackCount,
    pushes: StackCount,
) -> OpcodeInfo {
    OpcodeInfo {
        prefix,
        opcode,
        mnemonic,
        operand,
        flow,
        category,
        pops,
        pushes,
    }
}

use FlowType as F;
use InstructionCategory as C;
use OperandType as O;
use StackCount::{CallArguments, CallResult, Clear, CtorArguments, Fixed};

/// All opcodes known to the engine.
pub static OPCODES: &[OpcodeInfo] = &[
    op(0, NOP, "nop", O::None, F::Sequential, C::Misc, Fixed(0), Fixed(0)),
    op(0, LDARG_0, "ldarg.0", O::None, F::Sequential, C::LoadStore, Fixed(0), Fixed(1)),
    op(0, LDARG_1, "ldarg.1", O::None, F::Sequential, C::LoadStore, Fixed(0), Fixed(1)),
    op(0, LDARG_2, "ldarg.2", O::None, F::Sequential, C::LoadStore, Fixed(0), Fixed(1)),
    op(0, LDARG_3, "ldarg.3", O::None, F::Sequential, C::LoadStore, Fixed(0), Fixed(1)),
    op(0, LDLOC_0, "ldloc.0", O::None, F::Sequential, C::LoadStore, Fixed(0), Fixed(1)),
    op(0, LDLOC_1, "ldloc.1", O::None, F::Sequential, C::LoadStore, Fixed(0), Fixed(1)),
    op(0, LDLOC_2, "ldloc.2", O::None, F::Sequential, C::LoadStore, Fixed(0), Fixed(1)),
    op(0, LDLOC_3, "ldloc.3", O::None, F::Sequential, C::LoadStore, Fixed(0), Fixed(1)),
    op(0, STLOC_0, "stloc.0", O::None, F::Sequential, C::LoadStore, Fixed(1), Fixed(0)),
    op(0, STLOC_1, "stloc.1", O::None, F::Sequential, C::LoadStore, Fixed(1), Fixed(0)),
    op(0, STLOC_2, "stloc.2", O::None, F::Sequential, C::LoadStore, Fixed(1), Fixed(0)),
    op(0, STLOC_3, "stloc.3", O::None, F::Sequential, C::LoadStore, Fixed(1), Fixed(0)),
    op(0, LDARG_S, "ldarg.s", O::Argument, F::Sequential, C::LoadStore, Fixed(0), Fixed(1)),
    op(0, STARG_S, "starg.s", O::Argument, F::Sequential, C::LoadStore, Fixed(1), Fixed(0)),
    op(0, LDLOC_S, "ldloc.s", O::Local, F::Sequential, C::LoadStore, Fixed(0), Fixed(1)),
    op(0, STLOC_S, "stloc.s", O::Local, F::Sequential, C::LoadStore, Fixed(1), Fixed(0)),
    op(0, LDNULL, "ldnull", O::None, F::Sequential, C::LoadStore, Fixed(0), Fixed(1)),
    op(0, LDC_I4_M1, "ldc.i4.m1", O::None, F::Sequential, C::LoadStore, Fixed(0), Fixed(1)),
    op(0, LDC_I4_0, "ldc.i4.0", O::None, F::Sequential, C::LoadStore, Fixed(0), Fixed(1)),
    op(0, LDC_I4_1, "ldc.i4.1", O::None, F::Sequential, C::LoadStore, Fixed(0), Fixed(1)),
    op(0, LDC_I4_2, "ldc.i4.2", O::None, F::Sequential, C::LoadStore, Fixed(0), Fixed(1)),
    op(0, LDC_I4_3, "ldc.i4.3", O::None, F::Sequential, C::LoadStore, Fixed(0), Fixed(1)),
    op(0, LDC_I4_4, "ldc.i4.4", O::None, F::Sequential, C::LoadStore, Fixed(0), Fixed(1)),
    op(0, LDC_I4_5, "ldc.i4.5", O::None, F::Sequential, C::LoadStore, Fixed(0), Fixed(1)),
    op(0, LDC_I4_6, "ldc.i4.6", O::None, F::Sequential, C::LoadStore, Fixed(0), Fixed(1)),
    op(0, LDC_I4_7, "ldc.i4.7", O::None, F::Sequential, C::LoadStore, Fixed(0), Fixed(1)),
    op(0, LDC_I4_8, "ldc.i4.8", O::None, F::Sequential, C::LoadStore, Fixed(0), Fixed(1)),
    op(0, LDC_I4_S, "ldc.i4.s", O::Int8, F::Sequential, C::LoadStore, Fixed(0), Fixed(1)),
    op(0, LDC_I4, "ldc.i4", O::Int32, F::Sequential, C::LoadStore, Fixed(0), Fixed(1)),
    op(0, LDC_I8, "ldc.i8", O::Int64, F::Sequential, C::LoadStore, Fixed(0), Fixed(1)),
    op(0, LDC_R8, "ldc.r8", O::Float64, F::Sequential, C::LoadStore, Fixed(0), Fixed(1)),
    op(0, DUP, "dup", O::None, F::Sequential, C::Misc, Fixed(1), Fixed(2)),
    op(0, POP, "pop", O::None, F::Sequential, C::Misc, Fixed(1), Fixed(0)),
    op(0, CALL, "call", O::Method, F::Call, C::ControlFlow, CallArguments, CallResult),
    op(0, RET, "ret", O::None, F::Return, C::ControlFlow, Fixed(0), Fixed(0)),
    op(0, BR_S, "br.s", O::ShortBranch, F::UnconditionalBranch, C::ControlFlow, Fixed(0), Fixed(0)),
    op(0, BRFALSE_S, "brfalse.s", O::ShortBranch, F::ConditionalBranch, C::ControlFlow, Fixed(1), Fixed(0)),
    op(0, BRTRUE_S, "brtrue.s", O::ShortBranch, F::ConditionalBranch, C::ControlFlow, Fixed(1), Fixed(0)),
    op(0, BEQ_S, "beq.s", O::ShortBranch, F::ConditionalBranch, C::ControlFlow, Fixed(2), Fixed(0)),
    op(0, BGE_S, "bge.s", O::ShortBranch, F::ConditionalBranch, C::ControlFlow, Fixed(2), Fixed(0)),
    op(0, BGT_S, "bgt.s", O::ShortBranch, F::ConditionalBranch, C::ControlFlow, Fixed(2), Fixed(0)),
    op(0, BLE_S, "ble.s", O::ShortBranch, F::ConditionalBranch, C::ControlFlow, Fixed(2), Fixed(0)),
    op(0, BLT_S, "blt.s", O::ShortBranch, F::ConditionalBranch, C::ControlFlow, Fixed(2), Fixed(0)),
    op(0, BNE_UN_S, "bne.un.s", O::ShortBranch, F::ConditionalBranch, C::ControlFlow, Fixed(2), Fixed(0)),
    op(0, BR, "br", O::Branch, F::UnconditionalBranch, C::ControlFlow, Fixed(0), Fixed(0)),
    op(0, BRFALSE, "brfalse", O::Branch, F::ConditionalBranch, C::ControlFlow, Fixed(1), Fixed(0)),
    op(0, BRTRUE, "brtrue", O::Branch, F::ConditionalBranch, C::ControlFlow, Fixed(1), Fixed(0)),
    op(0, BEQ, "beq", O::Branch, F::ConditionalBranch, C::ControlFlow, Fixed(2), Fixed(0)),
    op(0, BGE, "bge", O::Branch, F::ConditionalBranch, C::ControlFlow, Fixed(2), Fixed(0)),
    op(0, BGT, "bgt", O::Branch, F::ConditionalBranch, C::ControlFlow, Fixed(2), Fixed(0)),
    op(0, BLE, "ble", O::Branch, F::ConditionalBranch, C::ControlFlow, Fixed(2), Fixed(0)),
    op(0, BLT, "blt", O::Branch, F::ConditionalBranch, C::ControlFlow, Fixed(2), Fixed(0)),
    op(0, BNE_UN, "bne.un", O::Branch, F::ConditionalBranch, C::ControlFlow, Fixed(2), Fixed(0)),
    op(0, SWITCH, "switch", O::Switch, F::Switch, C::ControlFlow, Fixed(1), Fixed(0)),
    op(0, ADD, "add", O::None, F::Sequential, C::Arithmetic, Fixed(2), Fixed(1)),
    op(0, SUB, "sub", O::None, F::Sequential, C::Arithmetic, Fixed(2), Fixed(1)),
    op(0, MUL, "mul", O::None, F::Sequential, C::Arithmetic, Fixed(2), Fixed(1)),
    op(0, DIV, "div", O::None, F::Sequential, C::Arithmetic, Fixed(2), Fixed(1)),
    op(0, REM, "rem", O::None, F::Sequential, C::Arithmetic, Fixed(2), Fixed(1)),
    op(0, AND, "and", O::None, F::Sequential, C::BitwiseLogical, Fixed(2), Fixed(1)),
    op(0, OR, "or", O::None, F::Sequential, C::BitwiseLogical, Fixed(2), Fixed(1)),
    op(0, XOR, "xor", O::None, F::Sequential, C::BitwiseLogical, Fixed(2), Fixed(1)),
    op(0, NEG, "neg", O::None, F::Sequential, C::Arithmetic, Fixed(1), Fixed(1)),
    op(0, NOT, "not", O::None, F::Sequential, C::BitwiseLogical, Fixed(1), Fixed(1)),
    op(0, CONV_I4, "conv.i4", O::None, F::Sequential, C::Conversion, Fixed(1), Fixed(1)),
    op(0, CONV_I8, "conv.i8", O::None, F::Sequential, C::Conversion, Fixed(1), Fixed(1)),
    op(0, CONV_R8, "conv.r8", O::None, F::Sequential, C::Conversion, Fixed(1), Fixed(1)),
    op(0, CALLVIRT, "callvirt", O::Method, F::Call, C::ControlFlow, CallArguments, CallResult),
    op(0, LDSTR, "ldstr", O::String, F::Sequential, C::LoadStore, Fixed(0), Fixed(1)),
    op(0, NEWOBJ, "newobj", O::Method, F::Call, C::ObjectModel, CtorArguments, Fixed(1)),
    op(0, CASTCLASS, "castclass", O::Type, F::Sequential, C::ObjectModel, Fixed(1), Fixed(1)),
    op(0, ISINST, "isinst", O::Type, F::Sequential, C::ObjectModel, Fixed(1), Fixed(1)),
    op(0, THROW, "throw", O::None, F::Throw, C::ControlFlow, Fixed(1), Fixed(0)),
    op(0, BOX, "box", O::Type, F::Sequential, C::Conversion, Fixed(1), Fixed(1)),
    op(0, ENDFINALLY, "endfinally", O::None, F::EndFinally, C::ControlFlow, Fixed(0), Fixed(0)),
    op(0, LEAVE, "leave", O::Branch, F::Leave, C::ControlFlow, Clear, Fixed(0)),
    op(0, LEAVE_S, "leave.s", O::ShortBranch, F::Leave, C::ControlFlow, Clear, Fixed(0)),
    op(FE_PREFIX, FE_CEQ, "ceq", O::None, F::Sequential, C::Comparison, Fixed(2), Fixed(1)),
    op(FE_PREFIX, FE_CGT, "cgt", O::None, F::Sequential, C::Comparison, Fixed(2), Fixed(1)),
    op(FE_PREFIX, FE_CLT, "clt", O::None, F::Sequential, C::Comparison, Fixed(2), Fixed(1)),
    op(FE_PREFIX, FE_ENDFILTER, "endfilter", O::None, F::EndFilter, C::ControlFlow, Fixed(1), Fixed(0)),
    op(FE_PREFIX, FE_RETHROW, "rethrow", O::None, F::Throw, C::ControlFlow, Fixed(0), Fixed(0)),
];

static MNEMONIC_LOOKUP: OnceLock<HashMap<&'static str, &'static OpcodeInfo>> = OnceLock::new();
static CODE_LOOKUP: OnceLock<HashMap<(u8, u8), &'static OpcodeInfo>> = OnceLock::new();

impl OpcodeInfo {
    /// Looks up an opcode by its mnemonic.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use dotpatch::assembly::OpcodeInfo;
    ///
    /// let info = OpcodeInfo::by_mnemonic("ret").unwrap();
    /// assert_eq!(info.opcode, 0x2A);
    /// assert!(OpcodeInfo::by_mnemonic("ldelem.ref").is_none());
    /// ```
    #[must_use]
    pub fn by_mnemonic(mnemonic: &str) -> Option<&'static OpcodeInfo> {
        MNEMONIC_LOOKUP
            .get_or_init(|| OPCODES.iter().map(|info| (info.mnemonic, info)).collect())
            .get(mnemonic)
            .copied()
    }

    /// Looks up an opcode by its prefix and opcode byte.
    #[must_use]
    pub fn by_code(prefix: u8, opcode: u8) -> Option<&'static OpcodeInfo> {
        CODE_LOOKUP
            .get_or_init(|| {
                OPCODES
                    .iter()
                    .map(|info| ((info.prefix, info.opcode), info))
                    .collect()
            })
            .get(&(prefix, opcode))
            .copied()
    }

    /// Number of bytes the opcode itself occupies (1 or 2).
    #[must_use]
    pub const fn opcode_len(&self) -> usize {
        if self.prefix == 0 {
            1
        } else {
            2
        }
    }

    /// Checks that `operand` is acceptable for this opcode.
    ///
    /// # Errors
    /// Returns [`Error::InvalidOperand`] if the operand kind does not match the operand type,
    /// or if a local/argument index does not fit the short encoding.
    pub fn check_operand(&self, operand: &Operand) -> Result<()> {
        let valid = match (self.operand, operand) {
            (OperandType::None, Operand::None)
            | (OperandType::Int8, Operand::Immediate(Immediate::Int8(_)))
            | (OperandType::Int32, Operand::Immediate(Immediate::Int32(_)))
            | (OperandType::Int64, Operand::Immediate(Immediate::Int64(_)))
            | (OperandType::Float64, Operand::Immediate(Immediate::Float64(_)))
            | (OperandType::ShortBranch | OperandType::Branch, Operand::Target(_))
            | (OperandType::Switch, Operand::Switch(_))
            | (OperandType::Method, Operand::Method(_))
            | (OperandType::Type, Operand::Type(_))
            | (OperandType::String, Operand::String(_)) => true,
            (OperandType::Local, Operand::Local(index))
            | (OperandType::Argument, Operand::Argument(index)) => {
                if *index > u16::from(u8::MAX) {
                    return Err(Error::InvalidOperand {
                        mnemonic: self.mnemonic,
                        reason: format!("index {index} does not fit the short form"),
                    });
                }
                true
            }
            _ => false,
        };

        if valid {
            Ok(())
        } else {
            Err(Error::InvalidOperand {
                mnemonic: self.mnemonic,
                reason: format!("expected {:?}, got {:?}", self.operand, operand),
            })
        }
    }
}
