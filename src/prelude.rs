//! # dotpatch Prelude
//!
//! This module provides a convenient prelude for the most commonly used types and traits
//! from the dotpatch library. Import this module to get quick access to everything needed
//! to declare patches, subscribe to events and run patched code.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all dotpatch operations
pub use crate::Error;

/// The result type used throughout dotpatch
pub use crate::Result;

/// Metadata token type addressing methods, types and constructors
pub use crate::metadata::token::Token;

// ================================================================================================
// Main Entry Points
// ================================================================================================

/// Process-scoped owner of registries, patches and natives
pub use crate::host::{attach_global, current, detach_global, Extension, ExtensionHandle, ExtensionHost};

/// Settings of every component
pub use crate::config::{
    DispatchConfig, EditorConfig, EmulationLimits, HostConfig, InstallerConfig,
};

/// Collected findings
pub use crate::diagnostics::{Diagnostic, DiagnosticCategory, DiagnosticSeverity, Diagnostics};

// ================================================================================================
// Instruction Model
// ================================================================================================

/// Instructions, streams and regions
pub use crate::assembly::{
    ExceptionRegion, FlowType, Instruction, InstructionStream, MethodRef, Operand, RegionKind,
};

/// Assembling streams and blocks
pub use crate::assembly::{InstructionEmitter, Label, StreamBuilder};

/// Stack analysis and encoding
pub use crate::assembly::{analyze, encode, fingerprint, Fingerprint, StackMap};

// ================================================================================================
// Patch Engine
// ================================================================================================

/// Anchor location
pub use crate::patch::{
    locate, Anchor, AnchorPattern, AnchorPosition, Occurrence, OpPattern, WindowPattern,
};

/// Blocks and splicing
pub use crate::patch::{splice, BlockBuilder, BlockTarget, PatchBlock};

/// Templates for the interception shapes
pub use crate::patch::{deniable_result, guard_prefix, result_postfix, DenyAction, InterceptionPoint};

/// Patch lifecycle
pub use crate::patch::{
    HookInstaller, InstallState, LiveMethodTable, MethodTable, Patch, PatchId, PatchTable,
};

// ================================================================================================
// Events
// ================================================================================================

/// Kinds, registry and dispatch
pub use crate::events::{
    DispatchOutcome, Dispatcher, EventKind, EventRegistry, Priority, Subscriber,
    SubscriptionHandle,
};

/// Payload capabilities
pub use crate::events::{
    Actor, ActorBound, Capabilities, Deniable, EventState, MutableParameters, ParamValue,
};

/// Built-in payloads
pub use crate::events::{
    DamagingDoor, DoorDamageType, JailbirdChangedWearState, JailbirdWearState,
    ReservedSlotCheck, SpawningRagdoll,
};

// ================================================================================================
// Emulation
// ================================================================================================

/// Running patched code
pub use crate::emulation::{Completion, EmValue, EventBridge, Interpreter, NativeMethods};
