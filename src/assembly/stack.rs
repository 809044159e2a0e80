//! Evaluation stack depth analysis.
//!
//! The analyzer walks every reachable path through an [`InstructionStream`] and assigns each
//! instruction the stack depth on entry. CIL requires that depth to be the same on every
//! path, which is exactly the property an inserted block must not break.
//!
//! Path rules:
//! - The method entry starts with an empty stack.
//! - Catch and filter handlers (and the filter block itself) start with the exception object.
//! - Finally and fault handlers start empty.
//! - `leave` empties the stack and jumps to its target.
//! - `ret` requires exactly one value for value-returning methods and none otherwise.
//! - `throw`, `rethrow`, `endfinally` and `endfilter` end the path.

use crate::{
    assembly::{FlowType, InstructionStream},
    Error, Result,
};

/// Per-instruction entry depths computed by [`analyze`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackMap {
    depths: Vec<Option<u16>>,
    /// Deepest the stack gets on any path
    pub max_stack: u16,
}

impl StackMap {
    /// Entry depth of instruction `index`, or `None` if it is unreachable.
    #[must_use]
    pub fn depth_at(&self, index: usize) -> Option<u16> {
        self.depths.get(index).copied().flatten()
    }

    /// `true` if some path reaches instruction `index`.
    #[must_use]
    pub fn is_reachable(&self, index: usize) -> bool {
        self.depth_at(index).is_some()
    }

    /// All entry depths in instruction order.
    #[must_use]
    pub fn depths(&self) -> &[Option<u16>] {
        &self.depths
    }
}

struct Walker {
    depths: Vec<Option<u16>>,
    worklist: Vec<usize>,
}

impl Walker {
    fn merge(&mut self, index: usize, depth: u16) -> Result<()> {
        match self.depths.get(index).copied() {
            None => Err(malformed_error!(
                "Control flow reaches {} past the end of {} instructions",
                index,
                self.depths.len()
            )),
            Some(None) => {
                self.depths[index] = Some(depth);
                self.worklist.push(index);
                Ok(())
            }
            Some(Some(existing)) if existing == depth => Ok(()),
            Some(Some(existing)) => Err(Error::StackImbalance {
                index,
                expected: existing,
                found: depth,
            }),
        }
    }
}

/// Computes the entry stack depth of every reachable instruction.
///
/// # Errors
/// - [`Error::StackImbalance`] if two paths disagree on the depth at an instruction, an
///   instruction pops more than is available, or a `ret` sees the wrong depth
/// - [`Error::Malformed`] if the body is empty or control flow runs off its end
///
/// # Examples
///
/// ```rust
/// use dotpatch::assembly::{StreamBuilder, InstructionEmitter, analyze};
///
/// let mut b = StreamBuilder::new();
/// b.ldarg(0)?.ldc_i4(1)?.op("add")?.ret()?;
/// let stream = b.build(1, true)?;
///
/// let map = analyze(&stream)?;
/// assert_eq!(map.depth_at(2), Some(2));
/// assert_eq!(map.max_stack, 2);
/// # Ok::<(), dotpatch::Error>(())
/// ```
pub fn analyze(stream: &InstructionStream) -> Result<StackMap> {
    let len = stream.len();
    if len == 0 {
        return Err(malformed_error!("Method body is empty"));
    }

    let mut walker = Walker {
        depths: vec![None; len],
        worklist: Vec::with_capacity(len),
    };

    walker.merge(0, 0)?;
    for region in &stream.regions {
        let depth = region.kind.handler_entry_depth();
        walker.merge(region.handler_start, depth)?;
        if region.handler_block_start() != region.handler_start {
            walker.merge(region.handler_block_start(), depth)?;
        }
    }

    let mut max_stack = 0u16;
    while let Some(index) = walker.worklist.pop() {
        let Some(depth) = walker.depths[index] else {
            continue;
        };
        let instruction = &stream.instructions[index];
        let behavior = instruction.stack_behavior();

        let pops = u16::from(behavior.pops);
        if depth < pops {
            return Err(Error::StackImbalance {
                index,
                expected: pops,
                found: depth,
            });
        }
        let after = depth - pops + u16::from(behavior.pushes);
        max_stack = max_stack.max(depth).max(after);

        match instruction.flow_type {
            FlowType::Return => {
                let expected = u16::from(stream.returns_value);
                if depth != expected {
                    return Err(Error::StackImbalance {
                        index,
                        expected,
                        found: depth,
                    });
                }
            }
            FlowType::Throw | FlowType::EndFinally | FlowType::EndFilter => {}
            FlowType::Leave => {
                for target in instruction.targets() {
                    walker.merge(target, 0)?;
                }
            }
            _ => {
                for target in instruction.targets() {
                    walker.merge(target, after)?;
                }
                if instruction.falls_through() {
                    if index + 1 >= len {
                        return Err(malformed_error!(
                            "Instruction {} ({}) falls through the end of the method",
                            index,
                            instruction.mnemonic
                        ));
                    }
                    walker.merge(index + 1, after)?;
                }
            }
        }
    }

    Ok(StackMap {
        depths: walker.depths,
        max_stack,
    })
}
