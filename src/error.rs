use thiserror::Error;

use crate::metadata::token::Token;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// # Error Categories
///
/// ## Patch Engine Errors
/// - [`Error::AnchorNotFound`] - The expected instruction pattern is absent from the target
/// - [`Error::StackImbalance`] - An edit would leave the evaluation stack unbalanced
/// - [`Error::RegionCorruption`] - An edit would break an exception-handling region
/// - [`Error::InstallConflict`] - The live method body no longer matches what was expected
///
/// Patch engine errors are local to one patch record. They are reported to whoever requested
/// the install and never leave the host method modified.
///
/// ## Dispatch Errors
/// - [`Error::SubscriberFault`] - A subscriber callback failed during dispatch
/// - [`Error::EventTypeMismatch`] - A typed subscriber received a different event payload
/// - [`Error::InvalidParameter`] - A mutable event parameter was written with the wrong type
///
/// Dispatch errors never escape [`crate::events::Dispatcher::dispatch`]; they are logged and
/// recorded as diagnostics.
///
/// ## Instruction Model Errors
/// - [`Error::UnknownInstruction`] - A mnemonic that is not part of the opcode table
/// - [`Error::InvalidOperand`] - An operand that does not fit the opcode
/// - [`Error::Malformed`] - A structurally invalid instruction stream
///
/// # Examples
///
/// ```rust,no_run
/// use dotpatch::{Error, patch::{locate, AnchorPattern}};
/// # fn stream() -> dotpatch::assembly::InstructionStream { unimplemented!() }
///
/// match locate(&stream(), &AnchorPattern::before_last_return()) {
///     Ok(anchor) => println!("anchor at {}", anchor.index),
///     Err(Error::AnchorNotFound { pattern }) => eprintln!("host shape changed: {pattern}"),
///     Err(e) => eprintln!("other error: {e}"),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The structural pattern describing the patch point was not found.
    ///
    /// This means the host method changed shape since the patch was written. The intended
    /// hook would never fire, so this is always reported.
    #[error("Anchor not found - no window matches {pattern}")]
    AnchorNotFound {
        /// Description of the pattern that failed to match
        pattern: String,
    },

    /// The modeled evaluation stack is unbalanced at an instruction boundary.
    ///
    /// Raised when a path reaches an instruction with a different depth than another path,
    /// when an instruction pops more values than are available, or when an inserted block
    /// does not net to zero at its exit.
    #[error("Stack imbalance at instruction {index}: expected depth {expected}, found {found}")]
    StackImbalance {
        /// Index of the instruction where the imbalance was detected
        index: usize,
        /// Depth required at that point
        expected: u16,
        /// Depth actually modeled at that point
        found: u16,
    },

    /// An exception-handling region is out of bounds, empty, overlapping or badly nested.
    #[error("Exception region corrupted - {0}")]
    RegionCorruption(String),

    /// The live method body does not match the body the installer expected.
    ///
    /// Typically another patch, installed from elsewhere, replaced the body in between.
    #[error("Install conflict on {method} - {reason}")]
    InstallConflict {
        /// Target method
        method: Token,
        /// What did not match
        reason: String,
    },

    /// A subscriber failed while observing an event.
    #[error("Subscriber '{subscriber}' faulted on '{kind}' - {message}")]
    SubscriberFault {
        /// Event kind being dispatched
        kind: String,
        /// Name of the failing subscriber
        subscriber: String,
        /// Failure message (error text or panic payload)
        message: String,
    },

    /// A typed subscriber was invoked with a payload of another type.
    #[error("Event payload mismatch - expected {expected}, found {found}")]
    EventTypeMismatch {
        /// Payload type the subscriber was written for
        expected: &'static str,
        /// Payload type that was dispatched
        found: &'static str,
    },

    /// A mutable event parameter does not exist or was given a value of the wrong type.
    #[error("Invalid event parameter '{name}' - {reason}")]
    InvalidParameter {
        /// Parameter name
        name: String,
        /// Why the access was rejected
        reason: String,
    },

    /// The mnemonic is not part of the supported opcode table.
    #[error("Unknown instruction - {0}")]
    UnknownInstruction(String),

    /// The operand does not match the operand type of the instruction.
    #[error("Invalid operand for {mnemonic} - {reason}")]
    InvalidOperand {
        /// Instruction mnemonic
        mnemonic: &'static str,
        /// Why the operand was rejected
        reason: String,
    },

    /// A branch references a label that was never marked.
    #[error("Undefined label - {0}")]
    UndefinedLabel(String),

    /// The method is not present in the host's method table.
    #[error("Method {0} not found in method table")]
    MethodNotFound(Token),

    /// The patch id does not name a declared patch.
    #[error("Patch #{0} not found")]
    PatchNotFound(u64),

    /// The patch declaration is missing a required component.
    #[error("Invalid patch '{name}' - {reason}")]
    InvalidPatch {
        /// Patch name
        name: String,
        /// What is missing or wrong
        reason: String,
    },

    /// The requested transition is not allowed from the record's current state.
    #[error("Patch #{id} is {state} - {operation} not possible")]
    InvalidState {
        /// Patch id
        id: u64,
        /// Current install state
        state: String,
        /// Rejected operation
        operation: &'static str,
    },

    /// The structure is damaged and can not be processed.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of what was malformed
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// Executing a method body failed.
    #[error("Execution failed - {0}")]
    Execution(String),

    /// An extension host is already attached to this process.
    #[error("An extension host is already attached")]
    AlreadyAttached,

    /// The extension host has been detached and can no longer be used.
    #[error("The extension host is detached")]
    Detached,

    /// Failed to lock target.
    ///
    /// A mutex guarding shared state was poisoned by a panicking thread.
    #[error("Failed to lock target")]
    LockError,
}
