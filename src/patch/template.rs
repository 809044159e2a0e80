//! Prebuilt insertion blocks for the common interception shapes.
//!
//! Every template calls into the *interception point*: three host-visible natives that
//! bridge an executing method into the dispatch engine.
//!
//! | Native | Signature | Effect |
//! |--------|-----------|--------|
//! | `Dispatch` | `(event, kind)` | runs the subscribers of `kind` on `event` |
//! | `IsAllowed` | `(event) -> bool` | reads the decision |
//! | `GetParameter` | `(event, name) -> value` | reads a mutable parameter |
//!
//! Event objects themselves are created with `newobj` on a constructor token that the
//! host resolves to an event factory.

use crate::{
    assembly::{InstructionEmitter, MethodRef},
    events::EventKind,
    metadata::token::Token,
    patch::block::{BlockBuilder, PatchBlock},
    Result,
};

/// The natives a patched method calls to reach the dispatch engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterceptionPoint {
    /// `static void Dispatch(object event, string kind)`
    pub dispatch: MethodRef,
    /// `static bool IsAllowed(object event)`
    pub is_allowed: MethodRef,
    /// `static object GetParameter(object event, string name)`
    pub get_parameter: MethodRef,
}

impl InterceptionPoint {
    /// Declaring type of the standard natives.
    pub const TYPE_NAME: &'static str = "Dotpatch.Interception";

    /// The interception point at its well-known member references.
    #[must_use]
    pub fn standard() -> Self {
        Self {
            dispatch: MethodRef::new(Token::member_ref(0x0F01), Self::TYPE_NAME, "Dispatch")
                .with_params(2),
            is_allowed: MethodRef::new(Token::member_ref(0x0F02), Self::TYPE_NAME, "IsAllowed")
                .with_params(1)
                .returning(),
            get_parameter: MethodRef::new(
                Token::member_ref(0x0F03),
                Self::TYPE_NAME,
                "GetParameter",
            )
            .with_params(2)
            .returning(),
        }
    }

    /// Emits `dup; ldstr kind; call Dispatch`, leaving the event on the stack.
    fn emit_dispatch(&self, b: &mut BlockBuilder, kind: &EventKind) -> Result<()> {
        b.dup()?.ldstr(kind.as_str())?.call(&self.dispatch)?;
        Ok(())
    }
}

impl Default for InterceptionPoint {
    fn default() -> Self {
        Self::standard()
    }
}

/// What a guard does when the event was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyAction {
    /// `ret` from a void method
    Return,
    /// Return an integer (or boolean) constant
    ReturnConstant(i32),
}

/// Replaces a computed result with the decision of a deniable event.
///
/// Anchor before the `ret` that returns the result. The block consumes the result, builds
/// the event with `ctor(result, args...)`, dispatches it and leaves the final decision as
/// the new result. Net stack effect zero.
///
/// ```text
/// ldarg <args>...
/// newobj ctor
/// dup
/// ldstr kind
/// call Dispatch
/// call IsAllowed
/// ```
///
/// # Errors
/// Returns [`crate::Error::InvalidOperand`] for argument indices above 255.
pub fn deniable_result(
    point: &InterceptionPoint,
    ctor: &MethodRef,
    kind: &EventKind,
    args: &[u16],
) -> Result<PatchBlock> {
    let mut b = BlockBuilder::new();
    for &arg in args {
        b.ldarg(arg)?;
    }
    b.newobj(ctor)?;
    point.emit_dispatch(&mut b, kind)?;
    b.call(&point.is_allowed)?;
    b.build()
}

/// Builds, dispatches and honours an event before the method body runs.
///
/// Anchor at the method start. The event is built with `ctor(args...)`. After dispatch
/// each `(name, arg)` pair in `write_back` copies the parameter `name` into argument
/// `arg`, so subscribers can rewrite the method's inputs. If the event was denied the
/// method returns early according to `on_deny`; otherwise the original body runs.
///
/// # Errors
/// Returns [`crate::Error::InvalidOperand`] for argument indices above 255.
pub fn guard_prefix(
    point: &InterceptionPoint,
    ctor: &MethodRef,
    kind: &EventKind,
    args: &[u16],
    write_back: &[(&str, u16)],
    on_deny: DenyAction,
) -> Result<PatchBlock> {
    let mut b = BlockBuilder::new();
    let proceed = b.label();

    for &arg in args {
        b.ldarg(arg)?;
    }
    b.newobj(ctor)?;
    point.emit_dispatch(&mut b, kind)?;

    for &(name, arg) in write_back {
        b.dup()?
            .ldstr(name)?
            .call(&point.get_parameter)?
            .starg(arg)?;
    }

    b.call(&point.is_allowed)?;
    b.branch("brtrue", proceed)?;
    match on_deny {
        DenyAction::Return => {}
        DenyAction::ReturnConstant(value) => {
            b.ldc_i4(value)?;
        }
    }
    b.ret()?;
    b.mark(proceed)?;
    b.build()
}

/// Combines a computed result with the result of a further call.
///
/// Anchor before the `ret` that returns the result. Loads `args`, calls `method` and
/// applies the binary `combine` opcode (`or`, `and`, `add`, ...). With `combine = "or"`,
/// `args = [0]` and an instance getter this is `result || this.Getter`.
///
/// # Errors
/// Returns [`crate::Error::UnknownInstruction`] if `combine` is not a known opcode.
pub fn result_postfix(method: &MethodRef, args: &[u16], combine: &str) -> Result<PatchBlock> {
    let mut b = BlockBuilder::new();
    for &arg in args {
        b.ldarg(arg)?;
    }
    b.call(method)?.op(combine)?;
    b.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::{InstructionStream, StreamBuilder},
        config::EditorConfig,
        patch::{
            anchor::{locate, AnchorPattern},
            editor::splice,
        },
    };

    fn reserved_slot_host() -> InstructionStream {
        // static bool HasReservedSlot(string userId, bool bypass)
        let lookup = MethodRef::new(Token::method_def(3), "ReservedSlot", "Lookup")
            .with_params(1)
            .returning();
        let mut b = StreamBuilder::new();
        b.ldarg(0).unwrap().call(&lookup).unwrap().ret().unwrap();
        b.build(2, true).unwrap()
    }

    fn ctor(params: u8) -> MethodRef {
        MethodRef::new(Token::member_ref(0x0E01), "ReservedSlotCheck", ".ctor").with_params(params)
    }

    #[test]
    fn deniable_result_is_balanced() {
        let stream = reserved_slot_host();
        let block = deniable_result(
            &InterceptionPoint::standard(),
            &ctor(2),
            &EventKind::RESERVED_SLOT,
            &[0],
        )
        .unwrap();
        let mnemonics: Vec<_> = block.instructions().map(|i| i.mnemonic).collect();
        assert_eq!(
            mnemonics,
            ["ldarg.0", "newobj", "dup", "ldstr", "call", "call"]
        );

        let anchor = locate(&stream, &AnchorPattern::before_last_return()).unwrap();
        let edited = splice(&stream, &anchor, &block, &EditorConfig::default()).unwrap();
        assert_eq!(edited.len(), 9);
        assert_eq!(edited.max_stack, 3);
    }

    #[test]
    fn guard_prefix_writes_back_and_returns_early() {
        // static bool ServerDamage(float hp, int type)
        let host = MethodRef::new(Token::method_def(9), "BreakableDoor", "Apply")
            .with_params(2)
            .returning();
        let mut b = StreamBuilder::new();
        b.ldarg(0).unwrap().ldarg(1).unwrap().call(&host).unwrap().ret().unwrap();
        let stream = b.build(2, true).unwrap();

        let block = guard_prefix(
            &InterceptionPoint::standard(),
            &ctor(2),
            &EventKind::DAMAGING_DOOR,
            &[0, 1],
            &[("damage", 0)],
            DenyAction::ReturnConstant(0),
        )
        .unwrap();

        let anchor = locate(&stream, &AnchorPattern::Start).unwrap();
        let edited = splice(&stream, &anchor, &block, &EditorConfig::default()).unwrap();
        assert_eq!(edited.len(), stream.len() + block.len());
        // brtrue jumps over the early return into the original body
        let brtrue = edited
            .iter()
            .position(|i| i.mnemonic == "brtrue")
            .unwrap();
        assert_eq!(edited.instructions[brtrue].targets(), vec![block.len()]);
    }

    #[test]
    fn result_postfix_or() {
        let stream = reserved_slot_host();
        let kinematic = MethodRef::new(Token::method_def(5), "Rigidbody", "get_isKinematic")
            .with_params(1)
            .returning();
        let block = result_postfix(&kinematic, &[0], "or").unwrap();
        let anchor = locate(&stream, &AnchorPattern::before_last_return()).unwrap();
        let edited = splice(&stream, &anchor, &block, &EditorConfig::default()).unwrap();
        assert_eq!(edited.instructions[4].mnemonic, "or");
        assert!(result_postfix(&kinematic, &[0], "lor").is_err());
    }
}
