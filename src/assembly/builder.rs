//! Label-based construction of instruction streams.
//!
//! [`StreamBuilder`] assembles an [`InstructionStream`] from emitted instructions, resolving
//! branch labels to instruction indices when the stream is built. The common emit helpers
//! live on the [`InstructionEmitter`] trait so that patch blocks can be written with the same
//! vocabulary as whole methods.
//!
//! # Label Resolution
//!
//! ```rust
//! use dotpatch::assembly::{StreamBuilder, InstructionEmitter};
//!
//! let mut b = StreamBuilder::new();
//! let end = b.label();
//! b.ldarg(0)?;
//! b.branch("brfalse.s", end)?;
//! b.ldarg(0)?.op("pop")?;
//! b.mark(end)?;
//! b.ret()?;
//!
//! let stream = b.build(1, false)?;
//! assert_eq!(stream.instructions[1].targets(), vec![4]);
//! # Ok::<(), dotpatch::Error>(())
//! ```

use std::sync::Arc;

use crate::{
    assembly::{
        ExceptionRegion, Immediate, Instruction, InstructionStream, MethodRef, Operand,
        RegionKind,
    },
    Error, Result,
};

/// Handle of a position inside a [`StreamBuilder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(usize);

impl Label {
    pub(crate) const fn from_index(index: usize) -> Self {
        Label(index)
    }

    pub(crate) const fn index(self) -> usize {
        self.0
    }
}

/// Emit helpers shared by [`StreamBuilder`] and [`crate::patch::BlockBuilder`].
///
/// Only [`InstructionEmitter::emit`] must be provided; the helpers pick the shortest
/// encoding available for an operand.
pub trait InstructionEmitter {
    /// Appends one instruction.
    ///
    /// # Errors
    /// Implementations may reject instructions that do not fit their context.
    fn emit(&mut self, instruction: Instruction) -> Result<&mut Self>;

    /// Appends an operand-less instruction by mnemonic.
    ///
    /// # Errors
    /// Returns [`Error::UnknownInstruction`] or [`Error::InvalidOperand`].
    fn op(&mut self, mnemonic: &str) -> Result<&mut Self> {
        self.emit(Instruction::simple(mnemonic)?)
    }

    /// Appends an instruction with an explicit operand.
    ///
    /// # Errors
    /// Returns [`Error::UnknownInstruction`] or [`Error::InvalidOperand`].
    fn with(&mut self, mnemonic: &str, operand: Operand) -> Result<&mut Self> {
        self.emit(Instruction::new(mnemonic, operand)?)
    }

    /// Loads argument `index`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidOperand`] for indices above 255.
    fn ldarg(&mut self, index: u16) -> Result<&mut Self> {
        match index {
            0 => self.op("ldarg.0"),
            1 => self.op("ldarg.1"),
            2 => self.op("ldarg.2"),
            3 => self.op("ldarg.3"),
            _ => self.with("ldarg.s", Operand::Argument(index)),
        }
    }

    /// Stores the top of stack into argument `index`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidOperand`] for indices above 255.
    fn starg(&mut self, index: u16) -> Result<&mut Self> {
        self.with("starg.s", Operand::Argument(index))
    }

    /// Loads local `index`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidOperand`] for indices above 255.
    fn ldloc(&mut self, index: u16) -> Result<&mut Self> {
        match index {
            0 => self.op("ldloc.0"),
            1 => self.op("ldloc.1"),
            2 => self.op("ldloc.2"),
            3 => self.op("ldloc.3"),
            _ => self.with("ldloc.s", Operand::Local(index)),
        }
    }

    /// Stores the top of stack into local `index`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidOperand`] for indices above 255.
    fn stloc(&mut self, index: u16) -> Result<&mut Self> {
        match index {
            0 => self.op("stloc.0"),
            1 => self.op("stloc.1"),
            2 => self.op("stloc.2"),
            3 => self.op("stloc.3"),
            _ => self.with("stloc.s", Operand::Local(index)),
        }
    }

    /// Pushes a 32-bit constant using the shortest form.
    ///
    /// # Errors
    /// Never fails for well-formed opcode tables.
    fn ldc_i4(&mut self, value: i32) -> Result<&mut Self> {
        match value {
            -1 => self.op("ldc.i4.m1"),
            0 => self.op("ldc.i4.0"),
            1 => self.op("ldc.i4.1"),
            2 => self.op("ldc.i4.2"),
            3 => self.op("ldc.i4.3"),
            4 => self.op("ldc.i4.4"),
            5 => self.op("ldc.i4.5"),
            6 => self.op("ldc.i4.6"),
            7 => self.op("ldc.i4.7"),
            8 => self.op("ldc.i4.8"),
            v => match i8::try_from(v) {
                Ok(small) => self.with("ldc.i4.s", Operand::Immediate(Immediate::Int8(small))),
                Err(_) => self.with("ldc.i4", Operand::Immediate(Immediate::Int32(v))),
            },
        }
    }

    /// Pushes a string literal.
    ///
    /// # Errors
    /// Never fails for well-formed opcode tables.
    fn ldstr(&mut self, value: &str) -> Result<&mut Self> {
        self.with("ldstr", Operand::String(Arc::from(value)))
    }

    /// Calls `method`.
    ///
    /// # Errors
    /// Never fails for well-formed opcode tables.
    fn call(&mut self, method: &MethodRef) -> Result<&mut Self> {
        self.with("call", Operand::Method(method.clone()))
    }

    /// Calls `method` virtually.
    ///
    /// # Errors
    /// Never fails for well-formed opcode tables.
    fn callvirt(&mut self, method: &MethodRef) -> Result<&mut Self> {
        self.with("callvirt", Operand::Method(method.clone()))
    }

    /// Constructs an object with constructor `ctor`.
    ///
    /// # Errors
    /// Never fails for well-formed opcode tables.
    fn newobj(&mut self, ctor: &MethodRef) -> Result<&mut Self> {
        self.with("newobj", Operand::Method(ctor.clone()))
    }

    /// Duplicates the top of stack.
    ///
    /// # Errors
    /// Never fails for well-formed opcode tables.
    fn dup(&mut self) -> Result<&mut Self> {
        self.op("dup")
    }

    /// Discards the top of stack.
    ///
    /// # Errors
    /// Never fails for well-formed opcode tables.
    fn pop(&mut self) -> Result<&mut Self> {
        self.op("pop")
    }

    /// Returns from the method.
    ///
    /// # Errors
    /// Never fails for well-formed opcode tables.
    fn ret(&mut self) -> Result<&mut Self> {
        self.op("ret")
    }
}

#[derive(Debug, Clone)]
struct LabelFixup {
    label: Label,
    instruction: usize,
}

#[derive(Debug, Clone)]
struct SwitchFixup {
    labels: Vec<Label>,
    instruction: usize,
}

#[derive(Debug, Clone)]
enum PendingKind {
    Resolved(RegionKind),
    Filter(Label),
}

#[derive(Debug, Clone)]
struct PendingRegion {
    kind: PendingKind,
    try_range: (Label, Label),
    handler_range: (Label, Label),
}

/// Assembles an [`InstructionStream`] with label-based branches and regions.
///
/// # Thread Safety
///
/// [`StreamBuilder`] is a plain single-owner value; build streams on one thread and share
/// the resulting [`InstructionStream`].
#[derive(Debug, Default)]
pub struct StreamBuilder {
    instructions: Vec<Instruction>,
    labels: Vec<Option<usize>>,
    fixups: Vec<LabelFixup>,
    switch_fixups: Vec<SwitchFixup>,
    regions: Vec<PendingRegion>,
    local_count: u16,
}

impl StreamBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares `count` locals.
    pub fn locals(&mut self, count: u16) -> &mut Self {
        self.local_count = count;
        self
    }

    /// Index the next emitted instruction will get.
    #[must_use]
    pub fn position(&self) -> usize {
        self.instructions.len()
    }

    /// Creates an unmarked label.
    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Creates a label marked at the current position.
    pub fn here(&mut self) -> Label {
        self.labels.push(Some(self.instructions.len()));
        Label(self.labels.len() - 1)
    }

    /// Marks `label` at the current position.
    ///
    /// # Errors
    /// Returns [`Error::Malformed`] if the label was already marked or does not belong to
    /// this builder.
    pub fn mark(&mut self, label: Label) -> Result<&mut Self> {
        let position = self.instructions.len();
        let slot = self
            .labels
            .get_mut(label.0)
            .ok_or_else(|| Error::UndefinedLabel(format!("L{}", label.0)))?;
        if let Some(existing) = *slot {
            return Err(malformed_error!(
                "Label {} already marked at {}",
                label.0,
                existing
            ));
        }
        *slot = Some(position);
        Ok(self)
    }

    /// Emits a branch (or `leave`) to `label`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidOperand`] if `mnemonic` does not take a branch target.
    pub fn branch(&mut self, mnemonic: &str, label: Label) -> Result<&mut Self> {
        let instruction = Instruction::new(mnemonic, Operand::Target(0))?;
        self.fixups.push(LabelFixup {
            label,
            instruction: self.instructions.len(),
        });
        self.instructions.push(instruction);
        Ok(self)
    }

    /// Emits a `switch` over `labels`.
    ///
    /// # Errors
    /// Never fails for well-formed opcode tables.
    pub fn switch(&mut self, labels: &[Label]) -> Result<&mut Self> {
        let instruction = Instruction::new("switch", Operand::Switch(vec![0; labels.len()]))?;
        self.switch_fixups.push(SwitchFixup {
            labels: labels.to_vec(),
            instruction: self.instructions.len(),
        });
        self.instructions.push(instruction);
        Ok(self)
    }

    /// Declares a catch, finally or fault region over label ranges (end labels exclusive).
    ///
    /// A [`RegionKind::Filter`] passed here keeps its literal `filter_start`; use
    /// [`StreamBuilder::protect_filter`] to place the filter by label.
    pub fn protect(
        &mut self,
        kind: RegionKind,
        try_range: (Label, Label),
        handler_range: (Label, Label),
    ) -> &mut Self {
        self.regions.push(PendingRegion {
            kind: PendingKind::Resolved(kind),
            try_range,
            handler_range,
        });
        self
    }

    /// Declares a filter region whose filter block starts at `filter`.
    pub fn protect_filter(
        &mut self,
        filter: Label,
        try_range: (Label, Label),
        handler_range: (Label, Label),
    ) -> &mut Self {
        self.regions.push(PendingRegion {
            kind: PendingKind::Filter(filter),
            try_range,
            handler_range,
        });
        self
    }

    fn resolve(&self, label: Label) -> Result<usize> {
        self.labels
            .get(label.0)
            .copied()
            .flatten()
            .ok_or_else(|| Error::UndefinedLabel(format!("L{}", label.0)))
    }

    /// Resolves labels, validates and analyzes the stream.
    ///
    /// # Errors
    /// - [`Error::UndefinedLabel`] for branches to unmarked labels
    /// - [`Error::Malformed`], [`Error::RegionCorruption`] or [`Error::StackImbalance`] if
    ///   the assembled stream is invalid
    pub fn build(mut self, arg_count: u16, returns_value: bool) -> Result<InstructionStream> {
        let fixups = std::mem::take(&mut self.fixups);
        for fixup in &fixups {
            let target = self.resolve(fixup.label)?;
            self.instructions[fixup.instruction].operand = Operand::Target(target);
        }

        let switch_fixups = std::mem::take(&mut self.switch_fixups);
        for fixup in &switch_fixups {
            let targets = fixup
                .labels
                .iter()
                .map(|label| self.resolve(*label))
                .collect::<Result<Vec<_>>>()?;
            self.instructions[fixup.instruction].operand = Operand::Switch(targets);
        }

        let mut regions = Vec::with_capacity(self.regions.len());
        for pending in &self.regions {
            let kind = match pending.kind {
                PendingKind::Resolved(kind) => kind,
                PendingKind::Filter(label) => RegionKind::Filter {
                    filter_start: self.resolve(label)?,
                },
            };
            regions.push(ExceptionRegion::new(
                kind,
                (
                    self.resolve(pending.try_range.0)?,
                    self.resolve(pending.try_range.1)?,
                ),
                (
                    self.resolve(pending.handler_range.0)?,
                    self.resolve(pending.handler_range.1)?,
                ),
            ));
        }

        let mut stream = InstructionStream::new(self.instructions, arg_count, returns_value)
            .with_regions(regions)
            .with_locals(self.local_count);
        stream.seal()?;
        Ok(stream)
    }
}

impl InstructionEmitter for StreamBuilder {
    fn emit(&mut self, instruction: Instruction) -> Result<&mut Self> {
        self.instructions.push(instruction);
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::token::Token;

    #[test]
    fn shortest_constant_forms() {
        let mut b = StreamBuilder::new();
        b.ldc_i4(-1).unwrap();
        b.ldc_i4(8).unwrap();
        b.ldc_i4(100).unwrap();
        b.ldc_i4(1000).unwrap();
        let mnemonics: Vec<_> = b.instructions.iter().map(|i| i.mnemonic).collect();
        assert_eq!(mnemonics, ["ldc.i4.m1", "ldc.i4.8", "ldc.i4.s", "ldc.i4"]);
    }

    #[test]
    fn argument_and_local_forms() {
        let mut b = StreamBuilder::new();
        b.ldarg(3).unwrap().ldarg(4).unwrap().ldloc(0).unwrap().stloc(7).unwrap();
        let mnemonics: Vec<_> = b.instructions.iter().map(|i| i.mnemonic).collect();
        assert_eq!(mnemonics, ["ldarg.3", "ldarg.s", "ldloc.0", "stloc.s"]);
        assert!(matches!(
            b.ldarg(256),
            Err(Error::InvalidOperand { .. })
        ));
    }

    #[test]
    fn undefined_label() {
        let mut b = StreamBuilder::new();
        let nowhere = b.label();
        b.branch("br", nowhere).unwrap();
        assert!(matches!(b.build(0, false), Err(Error::UndefinedLabel(_))));
    }

    #[test]
    fn double_mark() {
        let mut b = StreamBuilder::new();
        let l = b.here();
        assert!(b.mark(l).is_err());
    }

    #[test]
    fn switch_resolution() {
        let mut b = StreamBuilder::new();
        let a = b.label();
        let c = b.label();
        b.ldarg(0).unwrap();
        b.switch(&[a, c, a]).unwrap();
        b.mark(a).unwrap();
        b.ret().unwrap();
        b.mark(c).unwrap();
        b.ret().unwrap();
        let stream = b.build(1, false).unwrap();
        assert_eq!(stream.instructions[1].targets(), vec![2, 3, 2]);
    }

    #[test]
    fn regions_resolve() {
        let mut b = StreamBuilder::new();
        let try_start = b.here();
        let exit = b.label();
        b.op("nop").unwrap();
        b.branch("leave.s", exit).unwrap();
        let handler = b.here();
        b.pop().unwrap();
        b.branch("leave.s", exit).unwrap();
        let handler_end = b.here();
        b.mark(exit).unwrap();
        b.ret().unwrap();
        b.protect(
            RegionKind::Catch(Token::type_def(5)),
            (try_start, handler),
            (handler, handler_end),
        );

        let stream = b.build(0, false).unwrap();
        assert_eq!(
            stream.regions,
            vec![ExceptionRegion::new(
                RegionKind::Catch(Token::type_def(5)),
                (0, 2),
                (2, 4)
            )]
        );
        assert_eq!(stream.max_stack, 1);
    }
}
