//! Blocks of instructions to be spliced into a method.
//!
//! Branches inside a block are expressed as [`BlockTarget`]s: either an index inside the
//! block (where `block.len()` means "continue with the instruction at the anchor"), or an
//! index into the original method. The editor turns both into absolute indices of the
//! edited stream.

use crate::{
    assembly::{Instruction, InstructionEmitter, Label, Operand},
    Error, Result,
};

/// Branch destination of an instruction inside a [`PatchBlock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockTarget {
    /// Instruction of the block; the block length is the exit into the original code
    Local(usize),
    /// Instruction of the original method, by its index before the edit
    Original(usize),
}

/// One instruction of a [`PatchBlock`] with its unresolved branch destinations.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchOp {
    /// The instruction; branch operands are placeholders until spliced
    pub instruction: Instruction,
    /// Destinations, parallel to [`Instruction::targets`]
    pub targets: Vec<BlockTarget>,
}

/// An ordered, immutable sequence of instructions to insert at an anchor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatchBlock {
    ops: Vec<PatchOp>,
}

impl PatchBlock {
    /// Wraps a list of instructions. Raw branch operands are read as block-local indices;
    /// use [`BlockBuilder`] for labels and branches into the original method.
    ///
    /// # Errors
    /// Never fails for already constructed instructions.
    pub fn straight(instructions: Vec<Instruction>) -> Result<Self> {
        let mut builder = BlockBuilder::new();
        for instruction in instructions {
            builder.emit(instruction)?;
        }
        builder.build()
    }

    /// Number of instructions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// `true` if the block holds no instructions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// The operations in order.
    #[must_use]
    pub fn ops(&self) -> &[PatchOp] {
        &self.ops
    }

    /// Iterator over the instructions.
    pub fn instructions(&self) -> impl Iterator<Item = &Instruction> {
        self.ops.iter().map(|op| &op.instruction)
    }

    pub(crate) fn push_op(&mut self, op: PatchOp) {
        self.ops.push(op);
    }
}

#[derive(Debug, Clone)]
enum PendingTarget {
    Label(Label),
    Resolved(BlockTarget),
}

/// Assembles a [`PatchBlock`] with labels and branches back into the original method.
///
/// ```rust
/// use dotpatch::assembly::InstructionEmitter;
/// use dotpatch::patch::{BlockBuilder, BlockTarget};
///
/// let mut b = BlockBuilder::new();
/// let skip = b.label();
/// b.ldarg(0)?;
/// b.branch("brtrue.s", skip)?;
/// b.ret()?;
/// b.mark(skip)?;
/// let block = b.build()?;
///
/// assert_eq!(block.len(), 3);
/// assert_eq!(block.ops()[1].targets, vec![BlockTarget::Local(3)]);
/// # Ok::<(), dotpatch::Error>(())
/// ```
#[derive(Debug, Default)]
pub struct BlockBuilder {
    instructions: Vec<(Instruction, Vec<PendingTarget>)>,
    labels: Vec<Option<usize>>,
}

impl BlockBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Index the next emitted instruction will get inside the block.
    #[must_use]
    pub fn position(&self) -> usize {
        self.instructions.len()
    }

    /// Creates an unmarked label.
    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label::from_index(self.labels.len() - 1)
    }

    /// Marks `label` at the current position. A label marked after the last instruction is
    /// the block exit.
    ///
    /// # Errors
    /// Returns [`Error::UndefinedLabel`] for foreign labels and [`Error::Malformed`] for
    /// labels that are already marked.
    pub fn mark(&mut self, label: Label) -> Result<&mut Self> {
        let position = self.instructions.len();
        let slot = self
            .labels
            .get_mut(label.index())
            .ok_or_else(|| Error::UndefinedLabel(format!("L{}", label.index())))?;
        if slot.is_some() {
            return Err(malformed_error!("Label {} already marked", label.index()));
        }
        *slot = Some(position);
        Ok(self)
    }

    /// Emits a branch to a label of this block.
    ///
    /// # Errors
    /// Returns [`Error::InvalidOperand`] if `mnemonic` does not take a branch target.
    pub fn branch(&mut self, mnemonic: &str, label: Label) -> Result<&mut Self> {
        let instruction = Instruction::new(mnemonic, Operand::Target(0))?;
        self.instructions
            .push((instruction, vec![PendingTarget::Label(label)]));
        Ok(self)
    }

    /// Emits a branch to instruction `index` of the original method.
    ///
    /// # Errors
    /// Returns [`Error::InvalidOperand`] if `mnemonic` does not take a branch target.
    pub fn branch_to_original(&mut self, mnemonic: &str, index: usize) -> Result<&mut Self> {
        let instruction = Instruction::new(mnemonic, Operand::Target(0))?;
        self.instructions.push((
            instruction,
            vec![PendingTarget::Resolved(BlockTarget::Original(index))],
        ));
        Ok(self)
    }

    /// Resolves labels.
    ///
    /// # Errors
    /// Returns [`Error::UndefinedLabel`] if a branch uses an unmarked label.
    pub fn build(self) -> Result<PatchBlock> {
        let mut block = PatchBlock::default();
        for (instruction, pending) in self.instructions {
            let targets = pending
                .into_iter()
                .map(|target| match target {
                    PendingTarget::Resolved(t) => Ok(t),
                    PendingTarget::Label(label) => self
                        .labels
                        .get(label.index())
                        .copied()
                        .flatten()
                        .map(BlockTarget::Local)
                        .ok_or_else(|| Error::UndefinedLabel(format!("L{}", label.index()))),
                })
                .collect::<Result<Vec<_>>>()?;
            block.push_op(PatchOp {
                instruction,
                targets,
            });
        }
        Ok(block)
    }
}

impl InstructionEmitter for BlockBuilder {
    /// Appends `instruction`. Raw branch operands are read as block-local indices.
    fn emit(&mut self, instruction: Instruction) -> Result<&mut Self> {
        let targets = instruction
            .targets()
            .into_iter()
            .map(|t| PendingTarget::Resolved(BlockTarget::Local(t)))
            .collect();
        self.instructions.push((instruction, targets));
        Ok(self)
    }
}
