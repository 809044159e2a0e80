//! Structural location of patch points.
//!
//! An anchor pattern describes *where* in a method a block is inserted without naming a
//! byte offset: a short window of instruction shapes, which occurrence of that window to
//! pick, and whether to insert before or after one of its elements. Matching never looks at
//! raw offsets, so a pattern keeps working across host builds as long as the shape of the
//! surrounding code survives.
//!
//! # Available Matchers
//!
//! | Matcher | Description |
//! |---------|-------------|
//! | [`OpPattern::Any`] | Any instruction |
//! | [`OpPattern::Mnemonic`] | Exact mnemonic |
//! | [`OpPattern::AnyOf`] | One of several mnemonics |
//! | [`OpPattern::Flow`] | Control flow type |
//! | [`OpPattern::LoadArgument`] | `ldarg*`, optionally of one index |
//! | [`OpPattern::LoadConstant`] | `ldc.i4*` / `ldc.i8`, optionally of one value |
//! | [`OpPattern::Call`] | Call-family instruction by target name |
//! | [`OpPattern::Return`] | `ret` |
//! | [`OpPattern::Custom`] | Any [`InstructionMatcher`] |
//!
//! # Examples
//!
//! ```rust
//! use dotpatch::assembly::{StreamBuilder, InstructionEmitter};
//! use dotpatch::patch::{locate, AnchorPattern, OpPattern, Occurrence, WindowPattern};
//!
//! let mut b = StreamBuilder::new();
//! b.ldarg(0)?.op("pop")?.ldc_i4(1)?.ret()?;
//! let stream = b.build(1, true)?;
//!
//! let anchor = locate(&stream, &AnchorPattern::before_last_return())?;
//! assert_eq!(anchor.index, 3);
//!
//! let pattern = AnchorPattern::Window(
//!     WindowPattern::new(vec![OpPattern::LoadArgument(Some(0)), OpPattern::mnemonic("pop")])
//!         .occurrence(Occurrence::First)
//!         .after(1),
//! );
//! assert_eq!(locate(&stream, &pattern)?.index, 2);
//! # Ok::<(), dotpatch::Error>(())
//! ```

use std::{fmt, sync::Arc};

use crate::{
    assembly::{FlowType, Instruction, InstructionStream},
    Error, Result,
};

/// Trait for implementing instruction matchers.
///
/// Each matcher checks a single instruction. Windows combine matchers positionally: the
/// n-th matcher of a window must match the n-th instruction of a candidate run.
///
/// # Thread Safety
///
/// Matchers must be `Send + Sync` so patch declarations can be shared across threads.
pub trait InstructionMatcher: Send + Sync {
    /// Checks if this matcher matches `instruction`.
    fn matches(&self, instruction: &Instruction) -> bool;

    /// Returns a description of this matcher for diagnostics.
    fn description(&self) -> String;
}

/// Shape of one instruction inside an anchor window.
#[derive(Clone)]
pub enum OpPattern {
    /// Any instruction
    Any,
    /// Exact mnemonic
    Mnemonic(String),
    /// One of several mnemonics
    AnyOf(Vec<String>),
    /// Control flow type
    Flow(FlowType),
    /// Argument load, optionally of one argument index
    LoadArgument(Option<u16>),
    /// Integer constant load, optionally of one value
    LoadConstant(Option<i64>),
    /// `call`, `callvirt` or `newobj` whose target method has this name, optionally
    /// declared on this type
    Call {
        /// Declaring type name
        type_name: Option<String>,
        /// Method name
        method: String,
    },
    /// `ret`
    Return,
    /// User-supplied matcher
    Custom(Arc<dyn InstructionMatcher>),
}

impl OpPattern {
    /// Matches an exact mnemonic.
    pub fn mnemonic(mnemonic: impl Into<String>) -> Self {
        OpPattern::Mnemonic(mnemonic.into())
    }

    /// Matches any call to a method named `method`.
    pub fn call(method: impl Into<String>) -> Self {
        OpPattern::Call {
            type_name: None,
            method: method.into(),
        }
    }

    /// Matches a call to `type_name::method`.
    pub fn call_on(type_name: impl Into<String>, method: impl Into<String>) -> Self {
        OpPattern::Call {
            type_name: Some(type_name.into()),
            method: method.into(),
        }
    }
}

impl InstructionMatcher for OpPattern {
    fn matches(&self, instruction: &Instruction) -> bool {
        match self {
            OpPattern::Any => true,
            OpPattern::Mnemonic(m) => instruction.mnemonic == m,
            OpPattern::AnyOf(ms) => ms.iter().any(|m| instruction.mnemonic == m),
            OpPattern::Flow(flow) => instruction.flow_type == *flow,
            OpPattern::LoadArgument(index) => {
                instruction.mnemonic.starts_with("ldarg")
                    && match index {
                        Some(index) => instruction.argument_index() == Some(*index),
                        None => instruction.argument_index().is_some(),
                    }
            }
            OpPattern::LoadConstant(value) => match (instruction.constant(), value) {
                (Some(c), Some(v)) => c == *v,
                (Some(_), None) => true,
                (None, _) => false,
            },
            OpPattern::Call { type_name, method } => {
                instruction.is_call()
                    && instruction.method().is_some_and(|m| {
                        &*m.name == method
                            && type_name
                                .as_deref()
                                .map_or(true, |t| &*m.declaring_type == t)
                    })
            }
            OpPattern::Return => instruction.flow_type == FlowType::Return,
            OpPattern::Custom(matcher) => matcher.matches(instruction),
        }
    }

    fn description(&self) -> String {
        match self {
            OpPattern::Any => "*".to_string(),
            OpPattern::Mnemonic(m) => m.clone(),
            OpPattern::AnyOf(ms) => ms.join("|"),
            OpPattern::Flow(flow) => format!("<{flow:?}>"),
            OpPattern::LoadArgument(Some(i)) => format!("ldarg {i}"),
            OpPattern::LoadArgument(None) => "ldarg *".to_string(),
            OpPattern::LoadConstant(Some(v)) => format!("ldc {v}"),
            OpPattern::LoadConstant(None) => "ldc *".to_string(),
            OpPattern::Call {
                type_name: Some(t),
                method,
            } => format!("call {t}::{method}"),
            OpPattern::Call {
                type_name: None,
                method,
            } => format!("call {method}"),
            OpPattern::Return => "ret".to_string(),
            OpPattern::Custom(matcher) => matcher.description(),
        }
    }
}

impl fmt::Debug for OpPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description())
    }
}

/// Which of several matching windows to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occurrence {
    /// The first match in instruction order
    First,
    /// The last match in instruction order
    Last,
    /// The n-th match, zero-based
    Nth(usize),
}

/// Where the block goes relative to the matched window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnchorPosition {
    /// Immediately before window element `k`
    Before(usize),
    /// Immediately after window element `k`
    After(usize),
}

/// A window of instruction shapes plus occurrence and position selectors.
#[derive(Debug, Clone)]
pub struct WindowPattern {
    /// Positional matchers
    pub window: Vec<OpPattern>,
    /// Which match to use
    pub occurrence: Occurrence,
    /// Where to insert relative to the match
    pub position: AnchorPosition,
}

impl WindowPattern {
    /// Creates a pattern selecting the first match, inserting before its first element.
    #[must_use]
    pub fn new(window: Vec<OpPattern>) -> Self {
        Self {
            window,
            occurrence: Occurrence::First,
            position: AnchorPosition::Before(0),
        }
    }

    /// Selects which match to use.
    #[must_use]
    pub fn occurrence(mut self, occurrence: Occurrence) -> Self {
        self.occurrence = occurrence;
        self
    }

    /// Inserts before window element `k`.
    #[must_use]
    pub fn before(mut self, k: usize) -> Self {
        self.position = AnchorPosition::Before(k);
        self
    }

    /// Inserts after window element `k`.
    #[must_use]
    pub fn after(mut self, k: usize) -> Self {
        self.position = AnchorPosition::After(k);
        self
    }

    fn matches_at(&self, stream: &InstructionStream, start: usize) -> bool {
        self.window
            .iter()
            .zip(&stream.instructions[start..])
            .all(|(pattern, instruction)| pattern.matches(instruction))
    }
}

/// Structural description of a patch point.
#[derive(Debug, Clone)]
pub enum AnchorPattern {
    /// Before the first instruction of the method
    Start,
    /// After the last instruction of the method
    End,
    /// Relative to a matched instruction window
    Window(WindowPattern),
}

impl AnchorPattern {
    /// Before the last `ret` of the method, where the return value sits on the stack.
    #[must_use]
    pub fn before_last_return() -> Self {
        AnchorPattern::Window(
            WindowPattern::new(vec![OpPattern::Return])
                .occurrence(Occurrence::Last)
                .before(0),
        )
    }

    /// Before the first instruction of the method.
    #[must_use]
    pub fn method_start() -> Self {
        AnchorPattern::Start
    }
}

impl fmt::Display for AnchorPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnchorPattern::Start => f.write_str("<method start>"),
            AnchorPattern::End => f.write_str("<method end>"),
            AnchorPattern::Window(w) => {
                let ops: Vec<_> = w.window.iter().map(OpPattern::description).collect();
                write!(f, "[{}] {:?} {:?}", ops.join("; "), w.occurrence, w.position)
            }
        }
    }
}

/// A located patch point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Anchor {
    /// Insertion index: the block goes immediately before the instruction currently here.
    /// Equal to the stream length for an insertion at the end.
    pub index: usize,
    /// First instruction of the matched window
    pub window_start: usize,
    /// Number of instructions in the matched window (0 for start/end anchors)
    pub window_len: usize,
}

/// Finds the insertion point described by `pattern`.
///
/// # Errors
/// Returns [`Error::AnchorNotFound`] if no window matches, the selected occurrence does not
/// exist, the window is longer than the method, or the position lies outside the window.
pub fn locate(stream: &InstructionStream, pattern: &AnchorPattern) -> Result<Anchor> {
    let not_found = |why: &str| Error::AnchorNotFound {
        pattern: format!("{pattern} ({why})"),
    };

    let window = match pattern {
        AnchorPattern::Start => {
            return Ok(Anchor {
                index: 0,
                window_start: 0,
                window_len: 0,
            })
        }
        AnchorPattern::End => {
            return Ok(Anchor {
                index: stream.len(),
                window_start: stream.len(),
                window_len: 0,
            })
        }
        AnchorPattern::Window(window) => window,
    };

    let width = window.window.len();
    if width == 0 {
        return Err(not_found("empty window"));
    }
    if width > stream.len() {
        return Err(not_found("window longer than method"));
    }

    let k = match window.position {
        AnchorPosition::Before(k) | AnchorPosition::After(k) => k,
    };
    if k >= width {
        return Err(not_found("position outside window"));
    }

    let mut matches = (0..=stream.len() - width).filter(|&start| window.matches_at(stream, start));
    let start = match window.occurrence {
        Occurrence::First => matches.next(),
        Occurrence::Last => matches.last(),
        Occurrence::Nth(n) => matches.nth(n),
    }
    .ok_or_else(|| not_found("no match"))?;

    let index = match window.position {
        AnchorPosition::Before(k) => start + k,
        AnchorPosition::After(k) => start + k + 1,
    };

    Ok(Anchor {
        index,
        window_start: start,
        window_len: width,
    })
}
