//! Splicing blocks into instruction streams.
//!
//! [`splice`] inserts a [`PatchBlock`] at an [`Anchor`] and produces a new, sealed stream.
//! The original stream is never modified. The edit is accepted only if:
//!
//! - the block leaves the stack at the depth it found it on every exit into the original
//!   code (or, with [`EditorConfig::synthesize_balance`], with a surplus that trailing
//!   `pop`s can remove)
//! - every original instruction keeps the entry depth it had before the edit
//! - the exception regions are still well formed after renumbering
//!
//! # Renumbering
//!
//! With `a` the anchor index and `n` the block length:
//!
//! | Original reference | After the edit |
//! |--------------------|----------------|
//! | branch target `t < a` | `t` |
//! | branch target `t == a` | `a` if branches are captured, else `a + n` |
//! | branch target `t > a` | `t + n` |
//! | region boundary `b <= a` | `b` |
//! | region boundary `b > a` | `b + n` |
//!
//! Region ends are exclusive, so a region that straddles the anchor grows to enclose the
//! block, a region starting at the anchor starts with the block, and a region ending at the
//! anchor does not contain it.

use crate::{
    assembly::{FlowType, Instruction, InstructionStream, Operand, RegionKind, StackMap},
    config::EditorConfig,
    patch::{
        anchor::Anchor,
        block::{BlockTarget, PatchBlock, PatchOp},
    },
    Error, Result,
};

/// Where control leaves the block, with the stack depth it leaves with.
struct BlockFlow {
    depths: Vec<Option<u16>>,
    exit: Option<u16>,
}

struct Simulation<'a> {
    block: &'a PatchBlock,
    original: &'a StackMap,
    anchor: usize,
    returns_value: bool,
    flow: BlockFlow,
    worklist: Vec<usize>,
}

impl Simulation<'_> {
    fn merge_local(&mut self, index: usize, depth: u16) -> Result<()> {
        if index == self.block.len() {
            return self.merge_exit(depth);
        }
        match self.flow.depths[index] {
            None => {
                self.flow.depths[index] = Some(depth);
                self.worklist.push(index);
                Ok(())
            }
            Some(existing) if existing == depth => Ok(()),
            Some(existing) => Err(Error::StackImbalance {
                index: self.anchor + index,
                expected: existing,
                found: depth,
            }),
        }
    }

    fn merge_exit(&mut self, depth: u16) -> Result<()> {
        match self.flow.exit {
            None => {
                self.flow.exit = Some(depth);
                Ok(())
            }
            Some(existing) if existing == depth => Ok(()),
            Some(existing) => Err(Error::StackImbalance {
                index: self.anchor + self.block.len(),
                expected: existing,
                found: depth,
            }),
        }
    }

    fn merge_original(&mut self, from: usize, target: usize, depth: u16) -> Result<()> {
        match self.original.depth_at(target) {
            Some(expected) if expected != depth => Err(Error::StackImbalance {
                index: self.anchor + from,
                expected,
                found: depth,
            }),
            _ => Ok(()),
        }
    }

    fn run(mut self, entry: u16) -> Result<BlockFlow> {
        if self.block.is_empty() {
            self.flow.exit = Some(entry);
            return Ok(self.flow);
        }
        self.merge_local(0, entry)?;

        while let Some(index) = self.worklist.pop() {
            let Some(depth) = self.flow.depths[index] else {
                continue;
            };
            let block = self.block;
            let op = &block.ops()[index];
            let behavior = op.instruction.stack_behavior();
            let pops = u16::from(behavior.pops);
            if depth < pops {
                return Err(Error::StackImbalance {
                    index: self.anchor + index,
                    expected: pops,
                    found: depth,
                });
            }
            let after = depth - pops + u16::from(behavior.pushes);

            match op.instruction.flow_type {
                FlowType::Return => {
                    let expected = u16::from(self.returns_value);
                    if depth != expected {
                        return Err(Error::StackImbalance {
                            index: self.anchor + index,
                            expected,
                            found: depth,
                        });
                    }
                }
                FlowType::Throw | FlowType::EndFinally | FlowType::EndFilter => {}
                flow => {
                    let leaving = flow == FlowType::Leave;
                    let branch_depth = if leaving { 0 } else { after };
                    for &target in &op.targets {
                        match target {
                            BlockTarget::Local(t) => self.merge_local(t, branch_depth)?,
                            BlockTarget::Original(t) => {
                                self.merge_original(index, t, branch_depth)?;
                            }
                        }
                    }
                    if op.instruction.falls_through() {
                        self.merge_local(index + 1, after)?;
                    }
                }
            }
        }

        Ok(self.flow)
    }
}

fn check_targets(block: &PatchBlock, original_len: usize) -> Result<()> {
    for (index, op) in block.ops().iter().enumerate() {
        if op.targets.len() != op.instruction.targets().len() {
            return Err(malformed_error!(
                "Block instruction {} ({}) has {} destinations for {} targets",
                index,
                op.instruction.mnemonic,
                op.targets.len(),
                op.instruction.targets().len()
            ));
        }
        for target in &op.targets {
            let in_range = match *target {
                BlockTarget::Local(t) => t <= block.len(),
                BlockTarget::Original(t) => t < original_len,
            };
            if !in_range {
                return Err(malformed_error!(
                    "Block instruction {} ({}) targets {:?} out of range",
                    index,
                    op.instruction.mnemonic,
                    target
                ));
            }
        }
    }
    Ok(())
}

/// Inserts `block` at `anchor` and returns the sealed, edited stream.
///
/// # Errors
/// - [`Error::StackImbalance`] if the block does not net to zero at its exits, branches
///   into the original code at the wrong depth, or changes the depth of any original
///   instruction
/// - [`Error::RegionCorruption`] if the renumbered regions are not well formed
/// - [`Error::Malformed`] if the anchor or a block target is out of range, or the edited
///   stream is otherwise invalid
///
/// # Examples
///
/// ```rust
/// use dotpatch::assembly::{StreamBuilder, InstructionEmitter};
/// use dotpatch::config::EditorConfig;
/// use dotpatch::patch::{locate, splice, AnchorPattern, BlockBuilder};
///
/// let mut b = StreamBuilder::new();
/// b.ldarg(0)?.ret()?;
/// let stream = b.build(1, true)?;
///
/// let mut block = BlockBuilder::new();
/// block.ldc_i4(1)?.op("add")?;
/// let block = block.build()?;
///
/// let anchor = locate(&stream, &AnchorPattern::before_last_return())?;
/// let edited = splice(&stream, &anchor, &block, &EditorConfig::default())?;
/// assert_eq!(edited.len(), 4);
/// assert_eq!(edited.max_stack, 2);
/// # Ok::<(), dotpatch::Error>(())
/// ```
pub fn splice(
    stream: &InstructionStream,
    anchor: &Anchor,
    block: &PatchBlock,
    config: &EditorConfig,
) -> Result<InstructionStream> {
    let a = anchor.index;
    if a > stream.len() {
        return Err(malformed_error!(
            "Anchor {} beyond the end of {} instructions",
            a,
            stream.len()
        ));
    }
    check_targets(block, stream.len())?;

    let original = stream.analyze()?;
    let entry = if a < stream.len() {
        original.depth_at(a).unwrap_or(0)
    } else {
        0
    };

    let flow = Simulation {
        block,
        original: &original,
        anchor: a,
        returns_value: stream.returns_value,
        flow: BlockFlow {
            depths: vec![None; block.len()],
            exit: None,
        },
        worklist: Vec::new(),
    }
    .run(entry)?;

    let mut ops: Vec<PatchOp> = block.ops().to_vec();
    if let Some(exit) = flow.exit {
        if exit != entry {
            if config.synthesize_balance && exit > entry {
                for _ in entry..exit {
                    ops.push(PatchOp {
                        instruction: Instruction::simple("pop")?,
                        targets: Vec::new(),
                    });
                }
                tracing::debug!(
                    anchor = a,
                    surplus = exit - entry,
                    "synthesized pops to balance block"
                );
            } else {
                return Err(Error::StackImbalance {
                    index: a + block.len(),
                    expected: entry,
                    found: exit,
                });
            }
        }
    }

    // a block at a region start lands inside the region, so a branch that skipped it would
    // enter the region past its first instruction
    let starts_region = stream.regions.iter().any(|r| {
        r.try_start == a
            || r.handler_start == a
            || matches!(r.kind, RegionKind::Filter { filter_start } if filter_start == a)
    });
    if starts_region && !config.capture_anchor_branches {
        tracing::debug!(anchor = a, "anchor starts a protected region, capturing its branches");
    }
    let capture = config.capture_anchor_branches || starts_region;

    let n = ops.len();
    let shift = |t: usize| -> usize { if t < a { t } else { t + n } };
    let remap_target = |t: usize| -> usize {
        if t == a && capture {
            a
        } else {
            shift(t)
        }
    };
    let remap_boundary = |b: usize| -> usize { if b <= a { b } else { b + n } };

    let mut instructions = Vec::with_capacity(stream.len() + n);
    for instruction in &stream.instructions[..a] {
        let mut instruction = instruction.clone();
        instruction.retarget(&remap_target);
        instructions.push(instruction);
    }
    for op in ops {
        let mut instruction = op.instruction;
        let resolved: Vec<usize> = op
            .targets
            .iter()
            .map(|target| match *target {
                BlockTarget::Local(t) => a + t,
                BlockTarget::Original(t) => shift(t),
            })
            .collect();
        match &mut instruction.operand {
            Operand::Target(t) => {
                if let Some(&resolved) = resolved.first() {
                    *t = resolved;
                }
            }
            Operand::Switch(targets) => *targets = resolved,
            _ => {}
        }
        instructions.push(instruction);
    }
    for instruction in &stream.instructions[a..] {
        let mut instruction = instruction.clone();
        instruction.retarget(&remap_target);
        instructions.push(instruction);
    }

    let regions = stream
        .regions
        .iter()
        .map(|region| {
            let mut region = *region;
            region.try_start = remap_boundary(region.try_start);
            region.try_end = remap_boundary(region.try_end);
            region.handler_start = remap_boundary(region.handler_start);
            region.handler_end = remap_boundary(region.handler_end);
            if let RegionKind::Filter { filter_start } = region.kind {
                region.kind = RegionKind::Filter {
                    filter_start: remap_boundary(filter_start),
                };
            }
            region
        })
        .collect();

    let mut edited = InstructionStream::new(instructions, stream.arg_count, stream.returns_value)
        .with_regions(regions)
        .with_locals(stream.local_count);
    edited.validate_regions()?;
    let map = edited.seal()?;

    for (index, depth) in original.depths().iter().enumerate() {
        let Some(depth) = *depth else {
            continue;
        };
        // instructions a diverting block makes unreachable keep no depth
        let moved = shift(index);
        if let Some(now) = map.depth_at(moved) {
            if now != depth {
                return Err(Error::StackImbalance {
                    index: moved,
                    expected: depth,
                    found: now,
                });
            }
        }
    }

    tracing::debug!(
        anchor = a,
        inserted = n,
        length = edited.len(),
        max_stack = edited.max_stack,
        "spliced block"
    );

    Ok(edited)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::{ExceptionRegion, InstructionEmitter, StreamBuilder},
        metadata::token::Token,
        patch::{
            anchor::{locate, AnchorPattern},
            block::BlockBuilder,
        },
    };

    fn block(f: impl FnOnce(&mut BlockBuilder) -> Result<()>) -> PatchBlock {
        let mut b = BlockBuilder::new();
        f(&mut b).unwrap();
        b.build().unwrap()
    }

    fn branching() -> InstructionStream {
        // 0 ldarg.0; 1 brfalse.s 4; 2 ldc.i4.1; 3 ret; 4 ldc.i4.0; 5 ret
        let mut b = StreamBuilder::new();
        let zero = b.label();
        b.ldarg(0).unwrap();
        b.branch("brfalse.s", zero).unwrap();
        b.ldc_i4(1).unwrap().ret().unwrap();
        b.mark(zero).unwrap();
        b.ldc_i4(0).unwrap().ret().unwrap();
        b.build(1, true).unwrap()
    }

    #[test]
    fn branch_to_anchor_is_captured() {
        let stream = branching();
        let noop = block(|b| {
            b.op("nop")?;
            Ok(())
        });
        let anchor = Anchor {
            index: 4,
            window_start: 4,
            window_len: 1,
        };

        let edited = splice(&stream, &anchor, &noop, &EditorConfig::default()).unwrap();
        assert_eq!(edited.instructions[1].targets(), vec![4]);
        assert_eq!(edited.instructions[4].mnemonic, "nop");

        let config = EditorConfig::new().with_capture_anchor_branches(false);
        let edited = splice(&stream, &anchor, &noop, &config).unwrap();
        assert_eq!(edited.instructions[1].targets(), vec![5]);
    }

    #[test]
    fn targets_past_anchor_shift() {
        let stream = branching();
        let anchor = Anchor {
            index: 1,
            window_start: 1,
            window_len: 1,
        };
        let two = block(|b| {
            b.op("nop")?.op("nop")?;
            Ok(())
        });
        let edited = splice(&stream, &anchor, &two, &EditorConfig::default()).unwrap();
        assert_eq!(edited.instructions[3].mnemonic, "brfalse.s");
        assert_eq!(edited.instructions[3].targets(), vec![6]);
    }

    #[test]
    fn unbalanced_block_rejected_or_repaired() {
        let stream = branching();
        let anchor = locate(&stream, &AnchorPattern::before_last_return()).unwrap();
        let surplus = block(|b| {
            b.ldarg(0)?;
            Ok(())
        });

        assert!(matches!(
            splice(&stream, &anchor, &surplus, &EditorConfig::default()),
            Err(Error::StackImbalance { expected: 1, found: 2, .. })
        ));

        let lenient = EditorConfig::new().with_synthesize_balance(true);
        let edited = splice(&stream, &anchor, &surplus, &lenient).unwrap();
        assert_eq!(edited.len(), stream.len() + 2);
        assert_eq!(edited.instructions[6].mnemonic, "pop");
    }

    #[test]
    fn deficit_is_never_repaired() {
        let stream = branching();
        let anchor = locate(&stream, &AnchorPattern::before_last_return()).unwrap();
        let deficit = block(|b| {
            b.pop()?;
            Ok(())
        });
        let lenient = EditorConfig::new().with_synthesize_balance(true);
        assert!(matches!(
            splice(&stream, &anchor, &deficit, &lenient),
            Err(Error::StackImbalance { .. })
        ));
    }

    #[test]
    fn underflow_inside_block() {
        let stream = branching();
        let anchor = Anchor {
            index: 0,
            window_start: 0,
            window_len: 0,
        };
        let underflow = block(|b| {
            b.pop()?.ldc_i4(0)?;
            Ok(())
        });
        assert!(matches!(
            splice(&stream, &anchor, &underflow, &EditorConfig::default()),
            Err(Error::StackImbalance { index: 0, .. })
        ));
    }

    #[test]
    fn early_return_and_exit_label() {
        // void M(bool a) { if (!Hook(a)) return; Body(); }
        let hook = crate::assembly::MethodRef::new(Token::member_ref(1), "Hooks", "Allow")
            .with_params(1)
            .returning();
        let body = crate::assembly::MethodRef::new(Token::method_def(2), "Host", "Body");
        let mut b = StreamBuilder::new();
        b.call(&body).unwrap().ret().unwrap();
        let stream = b.build(1, false).unwrap();

        let guard = block(|b| {
            let proceed = b.label();
            b.ldarg(0)?.call(&hook)?;
            b.branch("brtrue.s", proceed)?;
            b.ret()?;
            b.mark(proceed)?;
            Ok(())
        });

        let edited = splice(
            &stream,
            &Anchor {
                index: 0,
                window_start: 0,
                window_len: 0,
            },
            &guard,
            &EditorConfig::default(),
        )
        .unwrap();
        assert_eq!(edited.len(), 6);
        assert_eq!(edited.instructions[2].targets(), vec![4]);
    }

    #[test]
    fn regions_are_renumbered() {
        // try { 0 nop; 1 leave.s 4 } finally { 2 nop; 3 endfinally } 4 ret
        let mut b = StreamBuilder::new();
        let try_start = b.here();
        let exit = b.label();
        let (handler_start, handler_end) = (b.label(), b.label());
        b.op("nop").unwrap();
        b.branch("leave.s", exit).unwrap();
        b.mark(handler_start).unwrap();
        b.op("nop").unwrap().op("endfinally").unwrap();
        b.mark(handler_end).unwrap();
        b.mark(exit).unwrap();
        b.ret().unwrap();
        b.protect(
            RegionKind::Finally,
            (try_start, handler_start),
            (handler_start, handler_end),
        );
        let stream = b.build(0, false).unwrap();

        let nop = block(|b| {
            b.op("nop")?;
            Ok(())
        });

        // inside the try: the try grows, the handler shifts
        let inside = Anchor {
            index: 1,
            window_start: 1,
            window_len: 1,
        };
        let edited = splice(&stream, &inside, &nop, &EditorConfig::default()).unwrap();
        assert_eq!(
            edited.regions[0],
            ExceptionRegion::new(RegionKind::Finally, (0, 3), (3, 5))
        );
        assert_eq!(edited.instructions[2].targets(), vec![5]);

        // at the handler start: the block becomes part of the handler
        let at_handler = Anchor {
            index: 2,
            window_start: 2,
            window_len: 1,
        };
        let edited = splice(&stream, &at_handler, &nop, &EditorConfig::default()).unwrap();
        assert_eq!(
            edited.regions[0],
            ExceptionRegion::new(RegionKind::Finally, (0, 2), (2, 5))
        );
    }

    #[test]
    fn branch_to_region_start_is_always_captured() {
        // 0 br.s 1; try { 1 nop; 2 leave.s 4 } finally { 3 endfinally } 4 ret
        let mut b = StreamBuilder::new();
        let (try_start, exit) = (b.label(), b.label());
        let (handler_start, handler_end) = (b.label(), b.label());
        b.branch("br.s", try_start).unwrap();
        b.mark(try_start).unwrap();
        b.op("nop").unwrap();
        b.branch("leave.s", exit).unwrap();
        b.mark(handler_start).unwrap();
        b.op("endfinally").unwrap();
        b.mark(handler_end).unwrap();
        b.mark(exit).unwrap();
        b.ret().unwrap();
        b.protect(
            RegionKind::Finally,
            (try_start, handler_start),
            (handler_start, handler_end),
        );
        let stream = b.build(0, false).unwrap();

        let nop = block(|b| {
            b.op("nop")?;
            Ok(())
        });
        let anchor = Anchor {
            index: 1,
            window_start: 1,
            window_len: 1,
        };

        let config = EditorConfig::new().with_capture_anchor_branches(false);
        let edited = splice(&stream, &anchor, &nop, &config).unwrap();
        assert_eq!(edited.instructions[0].targets(), vec![1]);
        assert_eq!(
            edited.regions[0],
            ExceptionRegion::new(RegionKind::Finally, (1, 4), (4, 5))
        );
        assert_eq!(edited.instructions[3].targets(), vec![5]);
        assert_eq!(edited, splice(&stream, &anchor, &nop, &EditorConfig::default()).unwrap());
    }

    #[test]
    fn anchor_out_of_range() {
        let stream = branching();
        let anchor = Anchor {
            index: 99,
            window_start: 99,
            window_len: 0,
        };
        assert!(splice(&stream, &anchor, &PatchBlock::default(), &EditorConfig::default()).is_err());
    }

    #[test]
    fn empty_block_is_identity() {
        let stream = branching();
        let anchor = locate(&stream, &AnchorPattern::before_last_return()).unwrap();
        let edited =
            splice(&stream, &anchor, &PatchBlock::default(), &EditorConfig::default()).unwrap();
        assert_eq!(edited, stream);
    }
}
