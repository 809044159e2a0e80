//! Method bodies as editable instruction streams with exception-handling regions.
//!
//! An [`InstructionStream`] is the unit every patch operates on: the ordered instruction list
//! of one method, the exception regions protecting parts of it, and the signature facts the
//! stack analyzer needs (argument count and whether a value is returned).
//!
//! Region boundaries are instruction indices with exclusive ends, so a region covering
//! instructions `2..5` has `try_start = 2` and `try_end = 5`.

use std::fmt;

use bitflags::bitflags;

use crate::{
    assembly::{analyze, Instruction, StackMap},
    metadata::token::Token,
    Error, Result,
};

bitflags! {
    /// Exception handler flags as stored in a fat EH clause.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ExceptionHandlerFlags: u32 {
        /// Typed catch clause
        const EXCEPTION = 0x0000;
        /// Filter clause
        const FILTER = 0x0001;
        /// Finally clause
        const FINALLY = 0x0002;
        /// Fault clause
        const FAULT = 0x0004;
    }
}

/// Handler flavour of an [`ExceptionRegion`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// Catches exceptions assignable to the given type
    Catch(Token),
    /// Runs the filter block starting at `filter_start` to decide whether to handle
    Filter {
        /// First instruction of the filter block, which ends at `handler_start`
        filter_start: usize,
    },
    /// Always runs when the protected block is left
    Finally,
    /// Runs only when the protected block is left by an exception
    Fault,
}

impl RegionKind {
    /// Stack depth on entry to the handler. Catch and filter handlers receive the exception
    /// object.
    #[must_use]
    pub const fn handler_entry_depth(&self) -> u16 {
        match self {
            RegionKind::Catch(_) | RegionKind::Filter { .. } => 1,
            RegionKind::Finally | RegionKind::Fault => 0,
        }
    }
}

/// A protected block and its handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionRegion {
    /// Handler flavour
    pub kind: RegionKind,
    /// First protected instruction
    pub try_start: usize,
    /// One past the last protected instruction
    pub try_end: usize,
    /// First handler instruction
    pub handler_start: usize,
    /// One past the last handler instruction
    pub handler_end: usize,
}

impl ExceptionRegion {
    /// Creates a region from protected and handler ranges.
    #[must_use]
    pub const fn new(
        kind: RegionKind,
        try_range: (usize, usize),
        handler_range: (usize, usize),
    ) -> Self {
        ExceptionRegion {
            kind,
            try_start: try_range.0,
            try_end: try_range.1,
            handler_start: handler_range.0,
            handler_end: handler_range.1,
        }
    }

    /// Clause flags for encoding.
    #[must_use]
    pub const fn flags(&self) -> ExceptionHandlerFlags {
        match self.kind {
            RegionKind::Catch(_) => ExceptionHandlerFlags::EXCEPTION,
            RegionKind::Filter { .. } => ExceptionHandlerFlags::FILTER,
            RegionKind::Finally => ExceptionHandlerFlags::FINALLY,
            RegionKind::Fault => ExceptionHandlerFlags::FAULT,
        }
    }

    /// First instruction of the handler including a preceding filter block.
    #[must_use]
    pub const fn handler_block_start(&self) -> usize {
        match self.kind {
            RegionKind::Filter { filter_start } => filter_start,
            _ => self.handler_start,
        }
    }

    /// `true` if instruction `index` is protected by this region.
    #[must_use]
    pub const fn protects(&self, index: usize) -> bool {
        index >= self.try_start && index < self.try_end
    }

    /// `true` if instruction `index` is part of the handler (or filter) block.
    #[must_use]
    pub const fn in_handler(&self, index: usize) -> bool {
        index >= self.handler_block_start() && index < self.handler_end
    }

    fn check_bounds(&self, len: usize) -> Result<()> {
        if self.try_start >= self.try_end {
            return Err(Error::RegionCorruption(format!(
                "empty protected block {}..{}",
                self.try_start, self.try_end
            )));
        }
        if self.handler_start >= self.handler_end {
            return Err(Error::RegionCorruption(format!(
                "empty handler block {}..{}",
                self.handler_start, self.handler_end
            )));
        }
        if let RegionKind::Filter { filter_start } = self.kind {
            if filter_start >= self.handler_start {
                return Err(Error::RegionCorruption(format!(
                    "filter block {filter_start} does not precede handler {}",
                    self.handler_start
                )));
            }
        }
        if self.try_end > len || self.handler_end > len {
            return Err(Error::RegionCorruption(format!(
                "region {}..{} / {}..{} exceeds method of {len} instructions",
                self.try_start, self.try_end, self.handler_start, self.handler_end
            )));
        }

        let handler = (self.handler_block_start(), self.handler_end);
        if intersects((self.try_start, self.try_end), handler) {
            return Err(Error::RegionCorruption(format!(
                "protected block {}..{} overlaps its handler {}..{}",
                self.try_start, self.try_end, handler.0, handler.1
            )));
        }
        Ok(())
    }
}

fn intersects(a: (usize, usize), b: (usize, usize)) -> bool {
    a.0 < b.1 && b.0 < a.1
}

fn contains(outer: (usize, usize), inner: (usize, usize)) -> bool {
    outer.0 <= inner.0 && inner.1 <= outer.1
}

/// Two blocks are well formed relative to each other if they are disjoint or nested.
fn properly_nested(a: (usize, usize), b: (usize, usize)) -> bool {
    !intersects(a, b) || contains(a, b) || contains(b, a)
}

/// The editable body of one method.
///
/// # Examples
///
/// ```rust
/// use dotpatch::assembly::{InstructionStream, StreamBuilder, InstructionEmitter};
///
/// let mut builder = StreamBuilder::new();
/// builder.ldarg(0)?.ret()?;
/// let stream = builder.build(1, true)?;
///
/// assert_eq!(stream.len(), 2);
/// assert_eq!(stream.max_stack, 1);
/// # Ok::<(), dotpatch::Error>(())
/// ```
#[derive(Clone, PartialEq)]
pub struct InstructionStream {
    /// Instructions in execution order
    pub instructions: Vec<Instruction>,
    /// Exception regions, innermost first
    pub regions: Vec<ExceptionRegion>,
    /// Number of arguments including `this`
    pub arg_count: u16,
    /// Number of declared locals
    pub local_count: u16,
    /// `true` if `ret` carries a value
    pub returns_value: bool,
    /// Maximum evaluation stack depth, as computed by the last analysis
    pub max_stack: u16,
}

impl InstructionStream {
    /// Creates a stream without exception regions or locals.
    ///
    /// `max_stack` is left at zero until [`InstructionStream::analyze`] or
    /// [`InstructionStream::seal`] runs.
    #[must_use]
    pub fn new(instructions: Vec<Instruction>, arg_count: u16, returns_value: bool) -> Self {
        InstructionStream {
            instructions,
            regions: Vec::new(),
            arg_count,
            local_count: 0,
            returns_value,
            max_stack: 0,
        }
    }

    /// Adds exception regions.
    #[must_use]
    pub fn with_regions(mut self, regions: Vec<ExceptionRegion>) -> Self {
        self.regions = regions;
        self
    }

    /// Sets the number of locals.
    #[must_use]
    pub fn with_locals(mut self, count: u16) -> Self {
        self.local_count = count;
        self
    }

    /// Number of instructions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    /// `true` if the stream holds no instructions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Instruction at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Instruction> {
        self.instructions.get(index)
    }

    /// Iterator over the instructions.
    pub fn iter(&self) -> std::slice::Iter<'_, Instruction> {
        self.instructions.iter()
    }

    /// Checks branch targets, argument/local indices and exception regions.
    ///
    /// # Errors
    /// Returns [`Error::Malformed`] for targets or indices out of range and
    /// [`Error::RegionCorruption`] for broken regions.
    pub fn validate(&self) -> Result<()> {
        let len = self.len();
        for (index, instruction) in self.instructions.iter().enumerate() {
            for target in instruction.targets() {
                if target >= len {
                    return Err(malformed_error!(
                        "Instruction {} ({}) targets {} beyond the end of {} instructions",
                        index,
                        instruction.mnemonic,
                        target,
                        len
                    ));
                }
            }
            if let Some(arg) = instruction.argument_index() {
                if arg >= self.arg_count {
                    return Err(malformed_error!(
                        "Instruction {} accesses argument {} of {}",
                        index,
                        arg,
                        self.arg_count
                    ));
                }
            }
            if let Some(local) = instruction.local_index() {
                if local >= self.local_count {
                    return Err(malformed_error!(
                        "Instruction {} accesses local {} of {}",
                        index,
                        local,
                        self.local_count
                    ));
                }
            }
        }
        self.validate_regions()
    }

    /// Checks that every exception region is in bounds, non-empty, does not overlap its own
    /// handler and is disjoint from or nested in every other region.
    ///
    /// Several clauses may share the same protected block.
    ///
    /// # Errors
    /// Returns [`Error::RegionCorruption`] describing the first violation.
    pub fn validate_regions(&self) -> Result<()> {
        let len = self.len();
        for region in &self.regions {
            region.check_bounds(len)?;
        }

        for (i, a) in self.regions.iter().enumerate() {
            for b in &self.regions[i + 1..] {
                let a_try = (a.try_start, a.try_end);
                let b_try = (b.try_start, b.try_end);
                let a_handler = (a.handler_block_start(), a.handler_end);
                let b_handler = (b.handler_block_start(), b.handler_end);

                let ok = properly_nested(a_try, b_try)
                    && properly_nested(a_try, b_handler)
                    && properly_nested(a_handler, b_try)
                    && properly_nested(a_handler, b_handler)
                    && (a_handler != b_handler);
                if !ok {
                    return Err(Error::RegionCorruption(format!(
                        "regions {:?} and {:?} overlap without nesting",
                        a, b
                    )));
                }
            }
        }
        Ok(())
    }

    /// Runs stack analysis over the stream.
    ///
    /// # Errors
    /// See [`crate::assembly::analyze`].
    pub fn analyze(&self) -> Result<StackMap> {
        analyze(self)
    }

    /// Validates the stream and stores the computed maximum stack depth.
    ///
    /// # Errors
    /// Propagates validation and stack analysis failures.
    pub fn seal(&mut self) -> Result<StackMap> {
        self.validate()?;
        let map = analyze(self)?;
        self.max_stack = map.max_stack;
        Ok(map)
    }
}

impl fmt::Debug for InstructionStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "// args: {}, locals: {}, returns: {}, maxstack: {}",
            self.arg_count, self.local_count, self.returns_value, self.max_stack
        )?;
        for (index, instruction) in self.instructions.iter().enumerate() {
            writeln!(f, "IL_#{index:<4} {instruction:?}")?;
        }
        for region in &self.regions {
            writeln!(
                f,
                ".try {}..{} {:?} handler {}..{}",
                region.try_start,
                region.try_end,
                region.kind,
                region.handler_start,
                region.handler_end
            )?;
        }
        Ok(())
    }
}
