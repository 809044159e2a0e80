//! Shared factories for unit tests.
//!
//! Sample method bodies in the shapes the patch templates target, plus the blocks and
//! event constructors tests keep rebuilding.

use std::sync::Arc;

use crate::{
    assembly::{InstructionEmitter, InstructionStream, MethodRef, RegionKind, StreamBuilder},
    emulation::{arg, EmValue, EventBridge, NativeMethods},
    events::{DamagingDoor, DoorDamageType, ReservedSlotCheck},
    metadata::token::Token,
    patch::{BlockBuilder, PatchBlock},
};

/// `static int Identity(int x) => x;`
pub fn identity_method() -> InstructionStream {
    let mut b = StreamBuilder::new();
    b.ldarg(0).unwrap().ret().unwrap();
    b.build(1, true).unwrap()
}

/// `+ 1` on top of the stack, zero net effect.
pub fn increment_block() -> PatchBlock {
    let mut b = BlockBuilder::new();
    b.ldc_i4(1).unwrap().op("add").unwrap();
    b.build().unwrap()
}

/// `static bool HasReservedSlot(string userId) => Lookup(userId);`
pub fn reserved_slot_method(lookup: &MethodRef) -> InstructionStream {
    let mut b = StreamBuilder::new();
    b.ldarg(0).unwrap().call(lookup).unwrap().ret().unwrap();
    b.build(1, true).unwrap()
}

/// `static int Guarded(int x) { try { x = x + 1; } finally { } return x; }` with a
/// branch into the middle of the protected block.
pub fn try_finally_method() -> InstructionStream {
    let mut b = StreamBuilder::new();
    let try_start = b.here();
    b.ldarg(0).unwrap().ldc_i4(1).unwrap().op("add").unwrap().starg(0).unwrap();
    let done = b.label();
    b.branch("leave.s", done).unwrap();
    let handler = b.here();
    b.op("endfinally").unwrap();
    let handler_end = b.here();
    b.mark(done).unwrap();
    b.ldarg(0).unwrap().ret().unwrap();
    b.protect(RegionKind::Finally, (try_start, handler), (handler, handler_end));
    b.build(1, true).unwrap()
}

// Constructor tokens of the sample payloads
pub const RESERVED_SLOT_CTOR: Token = Token::member_ref(0x0E01);
pub const DAMAGING_DOOR_CTOR: Token = Token::member_ref(0x0E02);

/// `ReservedSlotCheck(bool hasReservedSlot, string userId)`
pub fn reserved_slot_ctor() -> MethodRef {
    MethodRef::new(RESERVED_SLOT_CTOR, "ReservedSlotCheck", ".ctor").with_params(2)
}

/// `DamagingDoor(float damage)`
pub fn damaging_door_ctor() -> MethodRef {
    MethodRef::new(DAMAGING_DOOR_CTOR, "DamagingDoor", ".ctor").with_params(1)
}

// Helper function to register the sample payload constructors
pub fn register_sample_events(bridge: &EventBridge, natives: &Arc<NativeMethods>) {
    bridge.register_event(natives, &reserved_slot_ctor(), |args| {
        let user = arg(args, 1)?.as_str().unwrap_or_default().to_string();
        Ok(ReservedSlotCheck::new(arg(args, 0)?.is_truthy(), user))
    });
    bridge.register_event(natives, &damaging_door_ctor(), |args| {
        #[allow(clippy::cast_possible_truncation)]
        let damage = arg(args, 0)?.as_f64().unwrap_or_default() as f32;
        Ok(DamagingDoor::new(1, damage, DoorDamageType::Weapon, None))
    });
}

// Helper function to wrap a string argument
pub fn str_value(s: &str) -> EmValue {
    EmValue::from(s)
}
